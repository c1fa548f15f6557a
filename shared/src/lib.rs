//! AirPad relay shared primitives
//!
//! Transport-independent pieces used by both the WebSocket hub and the
//! upstream peer client: frame normalization into a routing decision, the
//! optional AES-256-GCM/RSA envelope codec, and protocol constants.

#![warn(unsafe_code)]

pub mod envelope;
pub mod error;
pub mod frame;
pub mod protocol;

pub use envelope::{
    decode, decode_server_payload, encode_envelope, seal_envelope, DecodeSource, Decoded,
    Envelope, EnvelopeKeys, Framing,
};
pub use error::{RelayError, Result};
pub use frame::{Frame, Route};
pub use protocol::{ClientMode, PROTOCOL_VERSION};
