//! High-level badge operations over a connected device
//!
//! A [`Badge`] borrows the adapter and one device for the lifetime of a
//! connection and exposes the typed operations the game needs: display
//! settings, glyph/animation uploads, and the persistent stash.

use std::cell::Cell;
use std::rc::Rc;

use nametag_transport::{Adapter, Device, TransportError};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::display::{self, Frame, Glyph};
use crate::error::{hex, ProtocolError};
use crate::frame::{self, AckDisposition};
use crate::stash::{self, StashState};

/// GATT attribute carrying all badge protocol traffic.
pub const DATA_ATTRIBUTE: u16 = 3;
/// CCCD attribute; writing [`SUBSCRIBE_VALUE`] enables notifications.
pub const SUBSCRIBE_ATTRIBUTE: u16 = 4;
/// CCCD payload that subscribes to data-attribute notifications.
pub const SUBSCRIBE_VALUE: [u8; 2] = [0x00, 0x01];

/// 16-bit service UUID advertised by badges.
pub const BADGE_SERVICE_UUID: u16 = 0xFFF0;

/// Protocol timing.
pub mod timing {
    use std::time::Duration;

    /// How long to wait for a bulk chunk acknowledgement.
    pub const ACK_TIMEOUT: Duration = Duration::from_secs(3);
    /// Device buffer settling time before each bulk upload.
    pub const BULK_SETTLE: Duration = Duration::from_millis(500);
}

/// The badge id for a scanned device, if it is a badge at all.
///
/// Badges advertise service `0xFFF0` with manufacturer data whose bytes
/// 6..8 are `FF FF`; the id is the first two bytes, little-endian,
/// rendered as uppercase hex.
pub fn id_if_badge(dev: &Device) -> Option<String> {
    if !dev.advertises_service(BADGE_SERVICE_UUID) {
        return None;
    }
    let mdata = dev.manufacturer_data();
    if mdata.len() >= 8 && mdata[6..8] == [0xFF, 0xFF] {
        Some(format!("{:02X}{:02X}", mdata[1], mdata[0]))
    } else {
        None
    }
}

/// Operations on one connected badge.
pub struct Badge {
    adapter: Rc<Adapter>,
    dev: Rc<Device>,
    id: String,
    subscribed: Cell<bool>,
}

impl Badge {
    /// Wrap a connected device. Returns `None` when the device's
    /// advertisement does not identify it as a badge.
    pub fn new(adapter: Rc<Adapter>, dev: Rc<Device>) -> Option<Badge> {
        let id = id_if_badge(&dev)?;
        Some(Badge {
            adapter,
            dev,
            id,
            subscribed: Cell::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn device(&self) -> &Rc<Device> {
        &self.dev
    }

    pub fn adapter(&self) -> &Rc<Adapter> {
        &self.adapter
    }

    /// Set the display mode.
    pub async fn set_mode(&self, mode: u8) -> Result<(), ProtocolError> {
        self.send_packet(&frame::encode_message(frame::tag::MODE, &[mode]), false)
            .await
    }

    /// Set the scroll/animation speed.
    pub async fn set_speed(&self, speed: u8) -> Result<(), ProtocolError> {
        self.send_packet(&frame::encode_message(frame::tag::SPEED, &[speed]), false)
            .await
    }

    /// Set the panel brightness.
    pub async fn set_brightness(&self, brightness: u8) -> Result<(), ProtocolError> {
        self.send_packet(
            &frame::encode_message(frame::tag::BRIGHTNESS, &[brightness]),
            false,
        )
        .await
    }

    /// Upload a glyph strip for scrolling display.
    pub async fn show_glyphs(&self, glyphs: &[Glyph]) -> Result<(), ProtocolError> {
        let body = display::glyph_body(glyphs)?;
        self.send_bulk(frame::tag::GLYPHS, &body).await
    }

    /// Upload an animation: full-panel frames at `msec` per frame.
    pub async fn show_frames(&self, frames: &[Frame], msec: u16) -> Result<(), ProtocolError> {
        let body = display::animation_body(frames, msec)?;
        self.send_bulk(frame::tag::FRAMES, &body).await
    }

    /// Write the persistent stash and verify it by reading it back.
    pub async fn write_stash(&self, data: &[u8]) -> Result<(), ProtocolError> {
        let packet = stash::encode_stash(data)?;
        self.send_packet(&packet, true).await?;
        self.adapter.flush(&self.dev).await?;
        let readback = self.adapter.read(&self.dev, DATA_ATTRIBUTE).await?;
        if !readback.starts_with(&packet) {
            return Err(ProtocolError::StashReadback {
                wrote: hex(&packet),
                read: hex(&readback),
            });
        }
        stash::record_backup(&self.id, data);
        debug!("[{}] Stash written ({} bytes)", self.id, data.len());
        Ok(())
    }

    /// Read the persistent stash.
    ///
    /// When the on-device register does not hold a valid stash, the
    /// process-wide backup for this badge is returned instead (with
    /// `from_backup` set); `None` means this badge has no known stash
    /// at all.
    pub async fn read_stash(&self) -> Result<Option<StashState>, ProtocolError> {
        let raw = self.adapter.read(&self.dev, DATA_ATTRIBUTE).await?;
        match stash::decode_stash(&raw) {
            Some(data) => {
                stash::record_backup(&self.id, &data);
                Ok(Some(StashState {
                    data,
                    from_backup: false,
                    displaced: false,
                    captured: Instant::now(),
                }))
            }
            None => {
                let backup = stash::backup_for(&self.id);
                if backup.is_some() {
                    debug!("[{}] Invalid stash register; using backup", self.id);
                }
                Ok(backup)
            }
        }
    }

    /// Wait for every write so far to be credited by the adapter.
    pub async fn flush(&self) -> Result<(), ProtocolError> {
        self.adapter.flush(&self.dev).await.map_err(Into::into)
    }

    /// Write a raw packet to the data attribute in GATT-sized pieces.
    ///
    /// Any non-stash packet displaces the on-device stash register.
    async fn send_packet(&self, packet: &[u8], is_stash: bool) -> Result<(), ProtocolError> {
        if !is_stash {
            stash::mark_displaced(&self.id);
        }
        for part in packet.chunks(frame::GATT_MTU) {
            self.adapter.write(&self.dev, DATA_ATTRIBUTE, part).await?;
        }
        Ok(())
    }

    async fn send_bulk(&self, tag: u8, body: &[u8]) -> Result<(), ProtocolError> {
        if !self.subscribed.get() {
            self.adapter
                .write(&self.dev, SUBSCRIBE_ATTRIBUTE, &SUBSCRIBE_VALUE)
                .await?;
            self.subscribed.set(true);
        }
        tokio::time::sleep(timing::BULK_SETTLE).await;

        for chunk in frame::bulk_chunks(tag, body) {
            loop {
                let ack = self.adapter.prepare_notify(&self.dev, DATA_ATTRIBUTE);
                self.send_packet(&chunk.message, false).await?;
                let reply = tokio::time::timeout(timing::ACK_TIMEOUT, ack)
                    .await
                    .map_err(|_| ProtocolError::AckTimeout { chunk: chunk.index })?
                    .map_err(|_| {
                        ProtocolError::Transport(TransportError::Connection(format!(
                            "{}: notify lost",
                            self.dev.addr()
                        )))
                    })?;
                match frame::ack_disposition(&reply, tag, chunk.index) {
                    AckDisposition::Accept => break,
                    AckDisposition::Retry => {
                        warn!(
                            "[{}] Corrupted ACK for chunk {}; resending",
                            self.id, chunk.index
                        );
                        continue;
                    }
                    AckDisposition::Reject => {
                        return Err(ProtocolError::BadAck {
                            chunk: chunk.index,
                            expected: hex(&chunk.expected_ack),
                            got: hex(&reply),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
