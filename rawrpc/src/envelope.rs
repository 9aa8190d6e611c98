//! Call and reply envelopes.
//!
//! The envelope is what travels inside one frame body. Its encoding is
//! pluggable through [`Codec`]; the default is protobuf.

use prost::Message;

use crate::error::Error;
use crate::status::{Code, Status};
use crate::value::{Value, ValueList};

#[derive(Clone, PartialEq, prost::Message)]
pub struct Request {
    #[prost(uint64, tag = "1")]
    pub call_id: u64,
    #[prost(fixed64, tag = "2")]
    pub service_hash: u64,
    /// 1-based.
    #[prost(uint32, tag = "3")]
    pub ordinal: u32,
    #[prost(message, repeated, tag = "4")]
    pub args: Vec<Value>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Reply {
    #[prost(uint64, tag = "1")]
    pub call_id: u64,
    #[prost(oneof = "Outcome", tags = "2, 3")]
    pub outcome: Option<Outcome>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Outcome {
    /// Always exactly one value.
    #[prost(message, tag = "2")]
    Results(ValueList),
    #[prost(message, tag = "3")]
    Fault(Fault),
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Fault {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

impl Reply {
    pub fn ok(call_id: u64, value: Value) -> Self {
        Self {
            call_id,
            outcome: Some(Outcome::Results(ValueList {
                values: vec![value],
            })),
        }
    }

    pub fn fault(call_id: u64, status: Status) -> Self {
        Self {
            call_id,
            outcome: Some(Outcome::Fault(Fault {
                code: status.code as i32,
                message: status.message,
            })),
        }
    }

    /// The single result value, or the remote status.
    pub fn into_result(self) -> Result<Value, Error> {
        match self.outcome {
            Some(Outcome::Results(mut list)) => {
                if list.values.len() != 1 {
                    return Err(Error::MalformedEnvelope("expected one result value"));
                }
                Ok(list.values.swap_remove(0))
            }
            Some(Outcome::Fault(fault)) => Err(Error::Remote(Status::new(
                Code::from_i32(fault.code),
                fault.message,
            ))),
            None => Err(Error::MalformedEnvelope("reply without outcome")),
        }
    }
}

/// Serializer of envelopes. Encoders append to `output`.
pub trait Codec: Send + Sync + 'static {
    fn encode_request(&self, req: &Request, output: &mut Vec<u8>) -> Result<(), Error>;
    fn decode_request(&self, buf: &[u8]) -> Result<Request, Error>;
    fn encode_reply(&self, reply: &Reply, output: &mut Vec<u8>) -> Result<(), Error>;
    fn decode_reply(&self, buf: &[u8]) -> Result<Reply, Error>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProstCodec;

impl Codec for ProstCodec {
    fn encode_request(&self, req: &Request, output: &mut Vec<u8>) -> Result<(), Error> {
        req.encode(output)?;
        Ok(())
    }

    fn decode_request(&self, buf: &[u8]) -> Result<Request, Error> {
        Ok(Request::decode(buf)?)
    }

    fn encode_reply(&self, reply: &Reply, output: &mut Vec<u8>) -> Result<(), Error> {
        reply.encode(output)?;
        Ok(())
    }

    fn decode_reply(&self, buf: &[u8]) -> Result<Reply, Error> {
        Ok(Reply::decode(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::IntoValue;

    #[test]
    fn request_survives_codec() {
        let codec = ProstCodec;
        let req = Request {
            call_id: 9,
            service_hash: u64::MAX,
            ordinal: 1,
            args: vec![3i64.into_value(), 4i64.into_value()],
        };
        let mut buf = Vec::new();
        codec.encode_request(&req, &mut buf).unwrap();
        assert_eq!(codec.decode_request(&buf).unwrap(), req);
    }

    #[test]
    fn fault_becomes_remote_error() {
        let reply = Reply::fault(1, Status::new(Code::UnknownMethod, "ordinal 99"));
        let mut buf = Vec::new();
        ProstCodec.encode_reply(&reply, &mut buf).unwrap();

        let back = ProstCodec.decode_reply(&buf).unwrap();
        match back.into_result() {
            Err(Error::Remote(status)) => {
                assert_eq!(status.code, Code::UnknownMethod);
                assert_eq!(status.message, "ordinal 99");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unit_result_is_kept() {
        let reply = Reply::ok(2, Value::unit());
        let mut buf = Vec::new();
        ProstCodec.encode_reply(&reply, &mut buf).unwrap();
        let value = ProstCodec.decode_reply(&buf).unwrap().into_result().unwrap();
        assert_eq!(value, Value::unit());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            ProstCodec.decode_request(&[0xff, 0xff, 0xff]),
            Err(Error::InvalidEnvelope(_))
        ));
    }
}
