//! # Protocol Frames
//!
//! Defines the envelope of a dispatch exchange (Request vs Response).
//!
//! ## Wire Shape
//! - Request: `Variant("Request", Map { id, fn, args })`
//! - Response: `Variant("Response", Ok(Map { id, result }))`
//!   or `Variant("Response", Err(Map { id, error: Map { kind, message } }))`
//!
//! ## Invariants
//! - **Panic Safety**: All decoding paths return `Result`, never panicking on unknown data.
//! - **Forward Compatibility**: Unknown map keys are safely skipped.
//! - **Correlation**: `id` round-trips unchanged.

use neopack::Decoder;
use neopack::Encoder;

use crate::codec::decode_value;
use crate::codec::decode_values;
use crate::codec::encode_value;
use crate::codec::encode_values;
use crate::codec::Value;
use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::RemoteError;
use crate::error::Result;

/// A method invocation, sent client to server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    pub id: u64,
    pub method: String,
    pub args: Vec<Value>,
}

impl DispatchRequest {
    pub fn new(id: u64, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self { id, method: method.into(), args }
    }

    /// Encode this request into the encoder.
    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.variant_begin("Request")?;
        enc.map_begin()?;

        write_map_u64(enc, "id", self.id)?;
        write_map_str(enc, "fn", &self.method)?;

        enc.variant_begin("args")?;
        encode_values(enc, &self.args)?;
        enc.variant_end()?;

        enc.map_end()?;
        enc.variant_end()?;
        Ok(())
    }

    /// Encode this request into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        self.encode(&mut enc)?;
        Ok(enc.into_bytes()?)
    }

    fn decode_body(mut dec: Decoder<'_>) -> Result<Self> {
        let mut map = dec.map()?;
        let mut id = None;
        let mut method = None;
        let mut args = None;

        while let Some((key, mut val)) = map.next()? {
            match key {
                "id" => id = Some(val.u64()?),
                "fn" => method = Some(val.str()?.to_string()),
                "args" => args = Some(decode_values(&mut val)?),
                _ => val.skip()?,
            }
        }

        Ok(DispatchRequest {
            id: id.ok_or(Error::ProtocolViolation("Missing id".into()))?,
            method: method.ok_or(Error::ProtocolViolation("Missing fn".into()))?,
            args: args.ok_or(Error::ProtocolViolation("Missing args".into()))?,
        })
    }
}

/// The correlated outcome of a request, sent server to client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchResponse {
    pub id: u64,
    pub outcome: std::result::Result<Value, RemoteError>,
}

impl DispatchResponse {
    pub fn ok(id: u64, value: Value) -> Self {
        Self { id, outcome: Ok(value) }
    }

    pub fn err(id: u64, error: RemoteError) -> Self {
        Self { id, outcome: Err(error) }
    }

    /// Encode this response into the encoder.
    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.variant_begin("Response")?;
        match &self.outcome {
            Ok(value) => {
                enc.result_ok_begin()?;
                enc.map_begin()?;
                write_map_u64(enc, "id", self.id)?;
                enc.variant_begin("result")?;
                encode_value(enc, value)?;
                enc.variant_end()?;
                enc.map_end()?;
                enc.result_ok_end()?;
            }
            Err(error) => {
                enc.result_err_begin()?;
                enc.map_begin()?;
                write_map_u64(enc, "id", self.id)?;
                enc.variant_begin("error")?;
                enc.map_begin()?;
                enc.variant_begin("kind")?;
                encode_unit_variant(enc, error.kind.as_tag())?;
                enc.variant_end()?;
                write_map_str(enc, "message", &error.message)?;
                enc.map_end()?;
                enc.variant_end()?;
                enc.map_end()?;
                enc.result_err_end()?;
            }
        }
        enc.variant_end()?;
        Ok(())
    }

    /// Encode this response into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        self.encode(&mut enc)?;
        Ok(enc.into_bytes()?)
    }

    fn decode_body(mut dec: Decoder<'_>) -> Result<Self> {
        match dec.result()? {
            Ok(ok_body) => Self::decode_success(ok_body),
            Err(err_body) => Self::decode_failure(err_body),
        }
    }

    fn decode_success(mut ok_body: Decoder<'_>) -> Result<Self> {
        let mut map = ok_body.map()?;
        let mut id = None;
        let mut result = None;

        while let Some((key, mut val)) = map.next()? {
            match key {
                "id" => id = Some(val.u64()?),
                "result" => result = Some(decode_value(&mut val)?),
                _ => val.skip()?,
            }
        }

        Ok(DispatchResponse {
            id: id.ok_or(Error::ProtocolViolation("Missing id".into()))?,
            outcome: Ok(result.ok_or(Error::ProtocolViolation("Missing result".into()))?),
        })
    }

    fn decode_failure(mut err_body: Decoder<'_>) -> Result<Self> {
        let mut map = err_body.map()?;
        let mut id = None;
        let mut error = None;

        while let Some((key, mut val)) = map.next()? {
            match key {
                "id" => id = Some(val.u64()?),
                "error" => error = Some(decode_remote_error(&mut val)?),
                _ => val.skip()?,
            }
        }

        Ok(DispatchResponse {
            id: id.ok_or(Error::ProtocolViolation("Missing id".into()))?,
            outcome: Err(error.ok_or(Error::ProtocolViolation("Missing error".into()))?),
        })
    }
}

/// Top-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Request(DispatchRequest),
    Response(DispatchResponse),
}

impl Frame {
    /// Decode a frame from raw bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let (msg_type, body) = dec.variant()?;
        match msg_type {
            "Request" => Ok(Frame::Request(DispatchRequest::decode_body(body)?)),
            "Response" => Ok(Frame::Response(DispatchResponse::decode_body(body)?)),
            _ => Err(Error::UnknownVariant(format!("Top-level frame: {}", msg_type))),
        }
    }
}

/// Decodes just the id from a raw frame.
///
/// Lets a server answer a request whose arguments fail to decode.
pub fn decode_id(bytes: &[u8]) -> Result<u64> {
    let mut dec = Decoder::new(bytes);
    let (msg_type, mut body) = dec.variant()?;
    let mut map = match msg_type {
        "Request" => body.map()?,
        "Response" => match body.result()? {
            Ok(mut ok_body) => ok_body.map()?,
            Err(mut err_body) => err_body.map()?,
        },
        _ => return Err(Error::UnknownVariant(format!("Top-level frame: {}", msg_type))),
    };

    while let Some((key, mut val)) = map.next()? {
        if key == "id" {
            return Ok(val.u64()?);
        } else {
            val.skip()?;
        }
    }

    Err(Error::ProtocolViolation("Missing id".into()))
}

// Helper functions

fn decode_remote_error(dec: &mut Decoder<'_>) -> Result<RemoteError> {
    let mut map = dec.map()?;
    let mut kind = None;
    let mut message = None;

    while let Some((key, mut val)) = map.next()? {
        match key {
            "kind" => kind = Some(ErrorKind::from_tag(decode_unit_variant(&mut val)?)?),
            "message" => message = Some(val.str()?.to_string()),
            _ => val.skip()?,
        }
    }

    Ok(RemoteError {
        kind: kind.unwrap_or(ErrorKind::Internal),
        message: message.ok_or(Error::ProtocolViolation("Missing message".into()))?,
    })
}

fn write_map_u64(enc: &mut Encoder, key: &str, val: u64) -> Result<()> {
    enc.variant_begin(key)?;
    enc.u64(val)?;
    enc.variant_end()?;
    Ok(())
}

fn write_map_str(enc: &mut Encoder, key: &str, val: &str) -> Result<()> {
    enc.variant_begin(key)?;
    enc.str(val)?;
    enc.variant_end()?;
    Ok(())
}

/// Encode a unit variant (variant with no payload).
fn encode_unit_variant(enc: &mut Encoder, tag: &str) -> Result<()> {
    enc.variant_begin(tag)?;
    enc.unit()?;
    enc.variant_end()?;
    Ok(())
}

/// Decode a unit variant and return its tag.
fn decode_unit_variant<'a>(dec: &mut Decoder<'a>) -> Result<&'a str> {
    let (tag, mut body) = dec.variant()?;
    body.unit()?;
    Ok(tag)
}
