mod binenc {
    mod de;
    mod error;
    mod hashing;
    mod ser;

    pub mod types;

    pub use de::{from_slice, Deserializer};
    pub use error::{Error, Result};
    pub use hashing::to_hash;
    pub use ser::{to_vec, to_writer, Serializer, Writer};

    #[cfg(test)]
    mod tests;
}

/// Creation and verification of channel-state signatures.
pub mod wallet;

pub mod adjudicator;
pub mod channel;
pub mod client;
pub mod funder;
pub mod wire;

pub use binenc::types::{Bytes32, Hash, U256};
pub use binenc::{from_slice, to_hash, to_vec, Error as EncodingError};
pub use client::Client;
