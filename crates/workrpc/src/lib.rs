//! # WorkRPC
//!
//! A small request/response protocol over Neopack for driving an object that
//! lives on the far side of a message channel.
//!
//! ## Architecture
//!
//! Requests carry a caller-chosen `id`, a method name and a list of plain
//! `Value`s. Responses echo the `id` and carry either a `Value` or a
//! `RemoteError`. Correlation is by `id` alone; the protocol makes no
//! promise about response order.

mod codec;
mod error;
mod frame;


pub use codec::decode_value;
pub use codec::decode_values;
pub use codec::encode_value;
pub use codec::encode_values;
pub use codec::Value;

pub use error::Error;
pub use error::ErrorKind;
pub use error::RemoteError;
pub use error::Result;

pub use frame::decode_id;
pub use frame::DispatchRequest;
pub use frame::DispatchResponse;
pub use frame::Frame;

/// Reserved method name that tears down the server-side target and the
/// transport. Never a valid name in a method table.
pub const DESTROY_METHOD: &str = "__destroyWorker__";
