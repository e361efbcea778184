//! # Codec
//!
//! Plain data that may cross the dispatch boundary, and its translation to
//! and from the `neopack` wire format.
//!
//! ## Invariants
//! - **Recursion Safety**: All recursive operations are bounded by `MAX_RECURSION_DEPTH`.
//! - **Self-Describing**: Decoding is driven by the wire tag; no schema is needed.

use crate::error::Error;
use crate::error::Result;

use neopack::Decoder;
use neopack::Encoder;
use neopack::Tag;

/// The maximum nesting depth for Values before bailing.
const MAX_RECURSION_DEPTH: usize = 64;

/// A serializable argument or result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Unit,
    Bool(bool),
    U32(u32),
    U64(u64),
    S64(i64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
}

impl Value {
    /// Short type name, used in argument mismatch messages.
    pub fn desc(&self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::Bool(_) => "bool",
            Self::U32(_) => "u32",
            Self::U64(_) => "u64",
            Self::S64(_) => "s64",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self { Self::Unit }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self { Self::Bool(v) }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self { Self::U32(v) }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self { Self::U64(v) }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self { Self::S64(v) }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self { Self::String(v.to_string()) }
}

impl From<String> for Value {
    fn from(v: String) -> Self { Self::String(v) }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self { Self::Bytes(v) }
}

/// Encodes a `Value` into the encoder stream.
///
/// # Errors
/// Returns `Error::RecursionLimitExceeded` if the value is too deeply nested.
pub fn encode_value(enc: &mut Encoder, val: &Value) -> Result<()> {
    encode_value_impl(enc, val, 0)
}

fn encode_value_impl(enc: &mut Encoder, val: &Value, depth: usize) -> Result<()> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(Error::RecursionLimitExceeded);
    }

    match val {
        Value::Unit => enc.unit()?,
        Value::Bool(b) => enc.bool(*b)?,
        Value::U32(v) => enc.u32(*v)?,
        Value::U64(v) => enc.u64(*v)?,
        Value::S64(v) => enc.s64(*v)?,
        Value::String(s) => enc.str(s)?,
        Value::Bytes(b) => enc.bytes(b)?,
        Value::List(items) => {
            enc.list_begin()?;
            for item in items {
                encode_value_impl(enc, item, depth + 1)?;
            }
            enc.list_end()?;
        }
    }
    Ok(())
}

/// Encodes a sequence of values as a single List container.
pub fn encode_values(enc: &mut Encoder, vals: &[Value]) -> Result<()> {
    enc.list_begin()?;
    for val in vals {
        encode_value(enc, val)?;
    }
    enc.list_end()?;
    Ok(())
}

/// Decodes a single `Value`, dispatching on the next wire tag.
pub fn decode_value(dec: &mut Decoder) -> Result<Value> {
    decode_value_impl(dec, 0)
}

fn decode_value_impl(dec: &mut Decoder, depth: usize) -> Result<Value> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(Error::RecursionLimitExceeded);
    }

    match dec.peek_tag()? {
        Tag::Unit => {
            dec.unit()?;
            Ok(Value::Unit)
        }
        Tag::BoolTrue | Tag::BoolFalse => Ok(Value::Bool(dec.bool()?)),
        Tag::U32 => Ok(Value::U32(dec.u32()?)),
        Tag::U64 => Ok(Value::U64(dec.u64()?)),
        Tag::S64 => Ok(Value::S64(dec.s64()?)),
        Tag::String => Ok(Value::String(dec.str()?.to_string())),
        Tag::Bytes => Ok(Value::Bytes(dec.bytes()?.to_vec())),
        Tag::List => {
            let mut iter = dec.list()?;
            let mut items = Vec::new();
            while let Some(mut item) = iter.next() {
                items.push(decode_value_impl(&mut item, depth + 1)?);
            }
            Ok(Value::List(items))
        }
        other => Err(Error::UnsupportedTag(other as u8)),
    }
}

/// Decodes a List container into its values.
pub fn decode_values(dec: &mut Decoder) -> Result<Vec<Value>> {
    let mut iter = dec.list()?;
    let mut vals = Vec::new();
    while let Some(mut item) = iter.next() {
        vals.push(decode_value(&mut item)?);
    }
    Ok(vals)
}
