//! Channel-state signing.
//!
//! The engine treats signatures as opaque byte strings with a verify
//! capability: the message is always the deterministic encoding of
//! `(params, state)`, hashed through [crate::to_hash], and a signature is
//! valid iff it recovers to the participant address it is checked against.
//! The concrete scheme is recoverable ECDSA over secp256k1; peers that
//! agree on another scheme only need to swap this module.

mod ecdsa;

use core::fmt::Debug;

use rand::{distributions::Standard, prelude::Distribution};
use serde::{
    de::{SeqAccess, Visitor},
    ser::SerializeTuple,
    Deserialize, Serialize,
};

pub use ecdsa::{recover_signer, Error, Signer};

macro_rules! raw_bytes {
    ( $T:ident, $N:literal ) => {
        impl Serialize for $T {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                let mut tup = serializer.serialize_tuple($N)?;
                for b in &self.0 {
                    tup.serialize_element(b)?;
                }
                tup.end()
            }
        }

        impl<'de> Deserialize<'de> for $T {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                struct RawVisitor;

                impl<'de> Visitor<'de> for RawVisitor {
                    type Value = $T;

                    fn expecting(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                        write!(f, "{} raw bytes", $N)
                    }

                    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<$T, A::Error> {
                        let mut out = [0u8; $N];
                        for (i, slot) in out.iter_mut().enumerate() {
                            *slot = seq
                                .next_element()?
                                .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
                        }
                        Ok($T(out))
                    }
                }

                deserializer.deserialize_tuple($N, RawVisitor)
            }
        }

        impl Debug for $T {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str("0x")?;
                for b in self.0 {
                    f.write_fmt(format_args!("{:02x}", b))?;
                }
                Ok(())
            }
        }
    };
}

/// On-chain identity of a channel participant, derived from the verifying
/// key.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub [u8; 20]);
raw_bytes!(Address, 20);

impl Distribution<Address> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Address {
        Address(rng.gen())
    }
}

/// 65-byte recoverable signature: `r || s || v`.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Signature(pub [u8; 65]);
raw_bytes!(Signature, 65);

impl Default for Signature {
    fn default() -> Self {
        Signature([0; 65])
    }
}

/// Checks that `sig` over `msg_hash` recovers to `addr`.
pub fn verify(msg_hash: crate::Hash, addr: Address, sig: &Signature) -> bool {
    matches!(recover_signer(msg_hash, sig), Ok(signer) if signer == addr)
}
