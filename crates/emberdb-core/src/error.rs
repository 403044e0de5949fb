//! Error types for the shared data layer.
//!
//! Decoding accepts arbitrary bytes from disk and from the network, so every
//! malformed input maps to an [`Error`] instead of a panic.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("varint exceeds 64 bits")]
    VarintOverflow,

    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    #[error("unknown field kind: {0}")]
    UnknownFieldKind(u8),

    #[error("invalid interval: {0}")]
    InvalidInterval(String),
}
