use crate::status::Status;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    IoFail(#[from] std::io::Error),

    #[error("frame too large: {0} bytes declared, {1} allowed")]
    FrameTooLarge(usize, usize),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(#[from] prost::DecodeError),

    #[error("invalid envelope: {0}")]
    MalformedEnvelope(&'static str),

    #[error("encode: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("method not in contract: {0}")]
    UnknownMethod(&'static str),

    #[error("unexpected result type: {0}")]
    Coerce(Status),

    #[error("call id mismatch: sent {sent}, received {received}")]
    CallMismatch { sent: u64, received: u64 },

    #[error("remote: {0}")]
    Remote(Status),

    #[error("invalid listener state: {0}")]
    InvalidState(&'static str),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("listener is shutting down")]
    ChannelClosed,

    #[error("write timed out")]
    WriteTimeout,
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Self::Remote(status)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
