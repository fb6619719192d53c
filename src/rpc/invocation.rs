//! RPC payload layout.
//!
//! Request: tagged INT service id, tagged INT method id, tagged argument.
//! Response: the tagged result on success, otherwise a tagged STRING
//! carrying the error message. The result code lives in the frame header.

use bytes::{Bytes, BytesMut};

use crate::codec::{Value, WireCodec, WireType};
use crate::error::{Result, SessionError};

/// Multiplier folding `(service_id, method_id)` into one dispatch key.
pub const METHOD_KEY_FACTOR: u32 = 10_000;

pub const OK: i32 = 0;
pub const METHOD_NOT_FOUND: i32 = 1;
pub const HANDLER_ERROR: i32 = 2;
pub const BAD_REQUEST: i32 = 3;
pub const SERVER_BUSY: i32 = 4;

#[inline]
pub fn method_key(service_id: u16, method_id: u16) -> u32 {
    u32::from(service_id) * METHOD_KEY_FACTOR + u32::from(method_id)
}

/// Decoded RPC request body.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub service_id: u16,
    pub method_id: u16,
    pub args: Value,
}

impl Invocation {
    pub fn new(service_id: u16, method_id: u16, args: impl Into<Value>) -> Self {
        Self {
            service_id,
            method_id,
            args: args.into(),
        }
    }

    pub fn method_key(&self) -> u32 {
        method_key(self.service_id, self.method_id)
    }

    pub fn encode(&self, codec: &WireCodec) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        let mut writer = codec.writer(&mut buf);
        writer.write_value(&Value::Int(i32::from(self.service_id)))?;
        writer.write_value(&Value::Int(i32::from(self.method_id)))?;
        writer.write_value(&self.args)?;
        Ok(buf.freeze())
    }

    pub fn decode(codec: &WireCodec, payload: &[u8]) -> Result<Self> {
        let mut reader = codec.reader(payload);
        let service_id = read_id(reader.read_expected(WireType::Int)?, "service id")?;
        let method_id = read_id(reader.read_expected(WireType::Int)?, "method id")?;
        let args = reader.read_value()?;
        reader.finish()?;
        Ok(Self {
            service_id,
            method_id,
            args,
        })
    }
}

fn read_id(value: Value, what: &str) -> Result<u16> {
    value
        .as_i64()
        .and_then(|v| u16::try_from(v).ok())
        .ok_or_else(|| SessionError::MalformedFrame(format!("{what} out of range: {value:?}")))
}

/// Failure reported by a handler, carried back with its result code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcFault {
    pub code: i32,
    pub message: String,
}

impl RpcFault {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn handler_error(message: impl Into<String>) -> Self {
        Self::new(HANDLER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(BAD_REQUEST, message)
    }
}

impl std::fmt::Display for RpcFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "code {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcFault {}

impl From<SessionError> for RpcFault {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Rpc { code, message } => Self { code, message },
            SessionError::Wire(e) => Self::bad_request(e.to_string()),
            SessionError::MsgPackDecode(e) => Self::bad_request(e.to_string()),
            other => Self::handler_error(other.to_string()),
        }
    }
}

/// Outcome of a handler, before encoding.
pub type HandlerResult = std::result::Result<Value, RpcFault>;

/// Encode a handler outcome as `(result_code, payload)`.
pub fn encode_outcome(codec: &WireCodec, outcome: &HandlerResult) -> (i32, Option<Bytes>) {
    match outcome {
        Ok(Value::Null) => (OK, None),
        Ok(value) => match codec.encode(value) {
            Ok(bytes) => (OK, Some(bytes)),
            Err(e) => encode_fault(codec, &RpcFault::handler_error(format!("unencodable result: {e}"))),
        },
        Err(fault) => encode_fault(codec, fault),
    }
}

fn encode_fault(codec: &WireCodec, fault: &RpcFault) -> (i32, Option<Bytes>) {
    let code = if fault.code == OK { HANDLER_ERROR } else { fault.code };
    (code, codec.encode(&Value::String(fault.message.clone())).ok())
}

/// Turn a received response back into the caller's result.
pub fn decode_outcome(codec: &WireCodec, result_code: i32, payload: Option<&[u8]>) -> Result<Value> {
    if result_code == OK {
        return match payload {
            Some(bytes) => Ok(codec.decode(bytes)?),
            None => Ok(Value::Null),
        };
    }
    let message = payload
        .and_then(|bytes| codec.decode_expected(bytes, WireType::String).ok())
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    Err(SessionError::Rpc {
        code: result_code,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_key_layout() {
        assert_eq!(method_key(3, 17), 30_017);
        assert_eq!(method_key(0, 9_999), 9_999);
        assert_ne!(method_key(1, 0), method_key(0, 1));
    }

    #[test]
    fn test_invocation_roundtrip() {
        let codec = WireCodec::default();
        let call = Invocation::new(12, 7, Value::list(vec![Value::Int(1), "two".into()]));
        let bytes = call.encode(&codec).unwrap();
        assert_eq!(Invocation::decode(&codec, &bytes).unwrap(), call);
    }

    #[test]
    fn test_invocation_rejects_bad_ids() {
        let codec = WireCodec::default();
        let mut buf = BytesMut::new();
        let mut writer = codec.writer(&mut buf);
        writer.write_value(&Value::Int(-1)).unwrap();
        writer.write_value(&Value::Int(1)).unwrap();
        writer.write_value(&Value::Null).unwrap();
        assert!(Invocation::decode(&codec, &buf).is_err());

        let mut buf = BytesMut::new();
        codec.writer(&mut buf).write_value(&Value::String("x".into())).unwrap();
        assert!(matches!(
            Invocation::decode(&codec, &buf),
            Err(SessionError::Wire(_))
        ));
    }

    #[test]
    fn test_outcome_encoding() {
        let codec = WireCodec::default();

        let (code, payload) = encode_outcome(&codec, &Ok(Value::Long(99)));
        assert_eq!(code, OK);
        let value = decode_outcome(&codec, code, payload.as_deref()).unwrap();
        assert_eq!(value, Value::Long(99));

        let (code, payload) = encode_outcome(&codec, &Ok(Value::Null));
        assert_eq!((code, payload.is_none()), (OK, true));

        let (code, payload) = encode_outcome(&codec, &Err(RpcFault::new(42, "no gold")));
        let err = decode_outcome(&codec, code, payload.as_deref()).unwrap_err();
        assert!(matches!(err, SessionError::Rpc { code: 42, ref message } if message == "no gold"));
    }

    #[test]
    fn test_fault_with_ok_code_becomes_handler_error() {
        let codec = WireCodec::default();
        let (code, _) = encode_outcome(&codec, &Err(RpcFault::new(OK, "oops")));
        assert_eq!(code, HANDLER_ERROR);
    }
}
