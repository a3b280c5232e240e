//! Badge protocol for CoolLED BLE nametags
//!
//! Builds the badge-facing layer on top of [`nametag_transport`]:
//!
//! - [`frame`]: escape-encoded message framing and ACKed bulk transfer
//! - [`display`]: glyph/animation bitmap types and upload bodies
//! - [`stash`]: the CRC-guarded 18-byte persistent register and its
//!   process-wide backup cache
//! - [`badge`]: the [`Badge`] handle tying it together for one connection

pub mod badge;
pub mod display;
pub mod error;
pub mod frame;
pub mod stash;

pub use badge::{id_if_badge, Badge, BADGE_SERVICE_UUID, DATA_ATTRIBUTE, SUBSCRIBE_ATTRIBUTE};
pub use display::{Frame, Glyph};
pub use error::ProtocolError;
pub use stash::{decode_stash, encode_stash, stash_crc, StashState, MAX_STASH};
