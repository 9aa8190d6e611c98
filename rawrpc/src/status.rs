//! Structured failure of one RPC call.
//!
//! A `Status` travels back to the caller inside the reply envelope. It
//! never tears down the connection it was produced on.

use std::fmt;

#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Code {
    Ok = 0,
    Unknown = 2,
    InvalidArgument = 3,
    NotFound = 5,
    Internal = 13,
    Unavailable = 14,
    UnknownService = 100,
    UnknownMethod = 101,
}

impl Code {
    pub fn from_i32(n: i32) -> Self {
        match n {
            0 => Code::Ok,
            3 => Code::InvalidArgument,
            5 => Code::NotFound,
            13 => Code::Internal,
            14 => Code::Unavailable,
            100 => Code::UnknownService,
            101 => Code::UnknownMethod,
            _ => Code::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for Status {}
