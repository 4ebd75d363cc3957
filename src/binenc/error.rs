//! Error type shared by the serializer and deserializer.

use core::fmt::Display;

use serde::{de, ser};

/// Errors produced while encoding or decoding the deterministic wire format.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Byte strings, strings and sequences carry a `u16` length prefix, so
    /// anything with 65536 or more elements cannot be represented.
    #[error("length {0} exceeds the u16 length prefix")]
    TooLong(usize),
    /// The value contains a type the format has no representation for
    /// (floats, maps, sequences of unknown length, ...).
    #[error("type is not representable in the wire encoding: {0}")]
    TypeNotRepresentable(&'static str),
    /// The input ended before the value was complete.
    #[error("unexpected end of input")]
    UnexpectedEnd,
    /// Decoding finished but input bytes remain.
    #[error("trailing bytes after value")]
    TrailingBytes,
    /// Booleans must be exactly 0 or 1.
    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),
    /// An enum tag that does not correspond to any variant.
    #[error("invalid variant tag {0}")]
    InvalidVariant(u8),
    /// A big-integer magnitude longer than 32 bytes.
    #[error("integer magnitude of {0} bytes exceeds 256 bits")]
    NumberTooLarge(usize),
    #[error("invalid utf-8 in string")]
    InvalidUtf8,
    #[error("{0}")]
    Message(String),
}

impl ser::Error for Error {
    fn custom<T: Display>(msg: T) -> Self {
        Error::Message(msg.to_string())
    }
}

impl de::Error for Error {
    fn custom<T: Display>(msg: T) -> Self {
        Error::Message(msg.to_string())
    }
}

pub type Result<T> = core::result::Result<T, Error>;
