//! # ragol-proto
//!
//! The Phantasy Star Online wire protocol, as spoken by every client
//! generation from the Dreamcast prototypes through Blue Burst.
//!
//! ## Layers
//!
//! - [`version`] — the dense [`Version`] enum that keys every per-version
//!   decision: header dialect, cipher family, size limits.
//! - [`crypt`] — the four cipher families and the handshake key types.
//! - [`frame`] — incremental framing over the three header dialects.
//! - [`command`] — command numbers, sub-command numbers, and payload codecs.
//! - [`transport`] (default `tokio` feature) — an async framed connection
//!   pairing a socket with the cipher pair and codec.
//!
//! ## Quick start
//!
//! ```rust
//! use ragol_proto::{FrameDecoder, FrameEncoder, Version};
//! use bytes::BytesMut;
//!
//! let mut enc = FrameEncoder::new(Version::GcV3);
//! let mut wire = BytesMut::new();
//! enc.encode(0x60, 0, &[0x40, 0x01, 0x00, 0x00], &mut wire).unwrap();
//!
//! let mut dec = FrameDecoder::new(Version::GcV3);
//! let frame = dec.decode(&mut wire).unwrap().unwrap();
//! assert_eq!(frame.command, 0x60);
//! ```

#![deny(clippy::all)]

pub mod command;
pub mod crypt;
pub mod frame;
pub mod version;

pub use self::command::{ParseError, PayloadReader};
pub use self::crypt::{Cipher, CipherFamily, CryptError};
pub use self::frame::{Frame, FrameDecoder, FrameEncoder, FrameError, HeaderDialect};
pub use self::version::Version;

#[cfg(feature = "tokio")]
pub mod transport;
#[cfg(feature = "tokio")]
pub use self::transport::{RecvHalf, SendHalf, Transport, TransportError};

/// FNV-1a/32 with the standard offset basis. Used for derived account ids
/// and proxy session ids.
pub fn fnv1a32(data: &[u8]) -> u32 {
    fnv1a32_with(data, 0x811C_9DC5)
}

/// FNV-1a/32 folding `data` over an explicit basis, for chained hashing.
pub fn fnv1a32_with(data: &[u8], basis: u32) -> u32 {
    let mut hash = basis;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
