//! Process-wide envelope encoder registry.
//!
//! Transports that frame their own bytes can ignore this; transports that
//! want a canonical byte form register an [Encoder] once at startup and use
//! [encoder] everywhere. Registering twice is a programming error.

use std::sync::OnceLock;

use super::Envelope;
use crate::binenc::{self, Error};

pub trait Encoder: Send + Sync + 'static {
    fn encode_envelope(&self, env: &Envelope) -> Result<Vec<u8>, Error>;
    fn decode_envelope(&self, bytes: &[u8]) -> Result<Envelope, Error>;
}

/// The deterministic binary encoding; what every transport should use
/// unless it has its own framing.
pub struct BinEncoder;

impl Encoder for BinEncoder {
    fn encode_envelope(&self, env: &Envelope) -> Result<Vec<u8>, Error> {
        binenc::to_vec(env)
    }

    fn decode_envelope(&self, bytes: &[u8]) -> Result<Envelope, Error> {
        binenc::from_slice(bytes)
    }
}

static ENCODER: OnceLock<Box<dyn Encoder>> = OnceLock::new();

/// Registers the process-wide encoder. Panics if called twice.
pub fn set_encoder(encoder: Box<dyn Encoder>) {
    if ENCODER.set(encoder).is_err() {
        panic!("wire encoder already registered");
    }
}

/// The registered encoder, if any.
pub fn encoder() -> Option<&'static dyn Encoder> {
    ENCODER.get().map(Box::as_ref)
}
