//! Recoverable ECDSA over secp256k1 via the pure-Rust `k256` crate.

use k256::{
    ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey},
    elliptic_curve::{rand_core, sec1::ToEncodedPoint},
};
use sha3::{Digest, Keccak256};

use super::{Address, Signature};
use crate::Hash;

pub use k256::ecdsa::Error;

#[derive(Debug, Clone)]
pub struct Signer {
    key: SigningKey,
    addr: Address,
}

impl From<&VerifyingKey> for Address {
    fn from(key: &VerifyingKey) -> Self {
        // The first byte of the uncompressed SEC1 encoding is the point tag
        // and is not part of the public key itself.
        let pk_bytes = key.to_encoded_point(false);
        let hash: [u8; 32] = Keccak256::digest(&pk_bytes.as_bytes()[1..]).into();

        let mut addr = Address([0; 20]);
        addr.0.copy_from_slice(&hash[32 - 20..]);
        addr
    }
}

impl Signer {
    pub fn new<R: rand_core::CryptoRngCore>(rng: &mut R) -> Self {
        let key = SigningKey::random(rng);
        let addr = Address::from(key.verifying_key());
        Self { key, addr }
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    /// Signs the given digest, producing a 65-byte `r || s || v` signature.
    pub fn sign(&self, msg_hash: Hash) -> Signature {
        let (sig, recid): (EcdsaSignature, RecoveryId) = self
            .key
            .sign_prehash_recoverable(&msg_hash.0)
            .expect("signing a 32-byte prehash cannot fail");

        let mut bytes = [0u8; 65];
        bytes[..64].copy_from_slice(&sig.to_bytes());
        bytes[64] = recid.to_byte();
        Signature(bytes)
    }
}

/// Recovers the signer address from a signature over `msg_hash`.
pub fn recover_signer(msg_hash: Hash, sig: &Signature) -> Result<Address, Error> {
    let ecdsa_sig = EcdsaSignature::from_slice(&sig.0[..64])?;
    let recid = RecoveryId::from_byte(sig.0[64]).ok_or_else(Error::new)?;

    let key = VerifyingKey::recover_from_prehash(&msg_hash.0, &ecdsa_sig, recid)?;
    Ok(Address::from(&key))
}
