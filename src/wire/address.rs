use core::cmp::Ordering;
use core::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::binenc::{self, Error};

/// Verification key carried by a wire identity: RSA modulus (big-endian
/// magnitude) and public exponent. The engine treats it as opaque identity
/// data; signing of channel states goes through [crate::wallet].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublicKey {
    pub modulus: Vec<u8>,
    pub exponent: i32,
}

/// Wire identity of a participant.
///
/// Equality is structural. Ordering is lexicographic on the name first and
/// on the canonical binary form second.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub name: String,
    pub public_key: Option<PublicKey>,
}

impl Address {
    pub fn new(name: impl Into<String>) -> Self {
        Address {
            name: name.into(),
            public_key: None,
        }
    }

    /// Canonical binary form: `u16`-length-prefixed name, then — only if a
    /// key is present — the `u16`-length-prefixed modulus and the `i32`
    /// exponent. The key carries no presence tag; decoding detects it by
    /// the remaining buffer length.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut buf = binenc::to_vec(&self.name)?;
        if let Some(key) = &self.public_key {
            buf.extend_from_slice(&binenc::to_vec(&key.modulus)?);
            buf.extend_from_slice(&key.exponent.to_le_bytes());
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let name_len = read_u16(bytes)? as usize;
        let rest = &bytes[2..];
        if rest.len() < name_len {
            return Err(Error::UnexpectedEnd);
        }
        let name = core::str::from_utf8(&rest[..name_len])
            .map_err(|_| Error::InvalidUtf8)?
            .to_owned();
        let rest = &rest[name_len..];

        let public_key = if rest.is_empty() {
            None
        } else {
            let modulus_len = read_u16(rest)? as usize;
            let rest = &rest[2..];
            if rest.len() != modulus_len + 4 {
                return Err(if rest.len() < modulus_len + 4 {
                    Error::UnexpectedEnd
                } else {
                    Error::TrailingBytes
                });
            }
            Some(PublicKey {
                modulus: rest[..modulus_len].to_vec(),
                exponent: i32::from_le_bytes(rest[modulus_len..].try_into().unwrap()),
            })
        };

        Ok(Address { name, public_key })
    }
}

fn read_u16(bytes: &[u8]) -> Result<u16, Error> {
    if bytes.len() < 2 {
        return Err(Error::UnexpectedEnd);
    }
    Ok(u16::from_le_bytes(bytes[..2].try_into().unwrap()))
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name).then_with(|| {
            let a = self.encode().expect("address encoding cannot fail");
            let b = other.encode().expect("address encoding cannot fail");
            a.cmp(&b)
        })
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed(name: &str, modulus: &[u8], exponent: i32) -> Address {
        Address {
            name: name.into(),
            public_key: Some(PublicKey {
                modulus: modulus.to_vec(),
                exponent,
            }),
        }
    }

    #[test]
    fn bare_name_round_trips() {
        let addr = Address::new("alice");
        let bytes = addr.encode().unwrap();
        assert_eq!(bytes.len(), 2 + 5);
        assert_eq!(Address::decode(&bytes).unwrap(), addr);
    }

    #[test]
    fn keyed_address_round_trips() {
        let addr = keyed("bob", &[0x01, 0x02, 0x03], 65537);
        let bytes = addr.encode().unwrap();
        assert_eq!(Address::decode(&bytes).unwrap(), addr);
    }

    #[test]
    fn truncated_key_rejected() {
        let bytes = keyed("bob", &[0x01, 0x02, 0x03], 65537).encode().unwrap();
        assert!(Address::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn ordering_is_name_first() {
        let a = keyed("alice", &[0xFF], 3);
        let b = Address::new("bob");
        assert!(a < b);

        let plain = Address::new("alice");
        let keyed = keyed("alice", &[0x01], 3);
        // Same name: the canonical binary form decides.
        assert_eq!(plain.cmp(&keyed), plain.encode().unwrap().cmp(&keyed.encode().unwrap()));
        assert_ne!(plain, keyed);
    }

    #[test]
    fn equality_is_structural() {
        let a = keyed("alice", &[0x01], 3);
        let b = keyed("alice", &[0x01], 3);
        let c = keyed("alice", &[0x01], 5);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
