//! The badge's persistent stash register
//!
//! A badge stores up to 18 bytes of opaque payload across power cycles.
//! On the wire the stash is a bare packet (no message framing):
//!
//! ```text
//! 0x80|len · crc_u8 · payload
//! ```
//!
//! The CRC is 8-bit, polynomial 0x1CF (Koopman 0xE7), initial value 0,
//! unreflected.
//!
//! Badge firmware clobbers the stash register whenever other packets
//! arrive on the data attribute, so this module also keeps a process-wide
//! backup cache: the last known stash per badge id, with a `displaced`
//! flag set once the on-device register may have been overwritten. All
//! access happens on the one cooperative thread.

use std::cell::RefCell;
use std::collections::HashMap;

use crc::{Algorithm, Crc};
use tokio::time::Instant;

use crate::error::ProtocolError;

/// Maximum stash payload size.
pub const MAX_STASH: usize = 18;

// CRC-8 poly 0x1CF: normal form 0xCF, init 0, no reflection, xorout 0.
const STASH_CRC_ALG: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0xcf,
    init: 0x00,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0x7e,
    residue: 0x00,
};

const STASH_CRC: Crc<u8> = Crc::<u8>::new(&STASH_CRC_ALG);

/// CRC byte guarding a stash payload.
pub fn stash_crc(data: &[u8]) -> u8 {
    STASH_CRC.checksum(data)
}

/// Encode a stash payload as the raw on-wire packet.
pub fn encode_stash(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if data.len() > MAX_STASH {
        return Err(ProtocolError::StashTooLong(data.len()));
    }
    let mut out = Vec::with_capacity(data.len() + 2);
    out.push(0x80 | data.len() as u8);
    out.push(stash_crc(data));
    out.extend_from_slice(data);
    Ok(out)
}

/// Recover the stash payload from a read of the data attribute, if the
/// register currently holds a valid stash.
pub fn decode_stash(raw: &[u8]) -> Option<Vec<u8>> {
    if raw.len() < 2 {
        return None;
    }
    let size = (raw[0] ^ 0x80) as usize;
    let payload = raw.get(2..2 + size)?;
    if raw[1] == stash_crc(payload) {
        Some(payload.to_vec())
    } else {
        None
    }
}

/// A stash value as seen by the game: the payload plus where it came from.
#[derive(Debug, Clone)]
pub struct StashState {
    pub data: Vec<u8>,
    /// The on-device register was invalid; this value is from the backup
    /// cache.
    pub from_backup: bool,
    /// Other packets have hit the data attribute since this value was
    /// captured, so the on-device register may be stale.
    pub displaced: bool,
    pub captured: Instant,
}

struct BackupEntry {
    data: Vec<u8>,
    displaced: bool,
    captured: Instant,
}

thread_local! {
    static STASH_BACKUP: RefCell<HashMap<String, BackupEntry>> = RefCell::new(HashMap::new());
}

/// Record the stash just read from or written to a badge.
pub(crate) fn record_backup(id: &str, data: &[u8]) {
    STASH_BACKUP.with(|cache| {
        cache.borrow_mut().insert(
            id.to_string(),
            BackupEntry {
                data: data.to_vec(),
                displaced: false,
                captured: Instant::now(),
            },
        );
    });
}

/// Note that a non-stash packet went to the data attribute.
pub(crate) fn mark_displaced(id: &str) {
    STASH_BACKUP.with(|cache| {
        if let Some(entry) = cache.borrow_mut().get_mut(id) {
            entry.displaced = true;
        }
    });
}

/// The cached stash for a badge whose register no longer validates.
pub(crate) fn backup_for(id: &str) -> Option<StashState> {
    STASH_BACKUP.with(|cache| {
        cache.borrow().get(id).map(|entry| StashState {
            data: entry.data.clone(),
            from_backup: true,
            displaced: entry.displaced,
            captured: entry.captured,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_vectors() {
        assert_eq!(stash_crc(b"123456789"), 0x7e);
        assert_eq!(stash_crc(b""), 0x00);
        assert_eq!(stash_crc(b"HELLO"), 0x73);
        assert_eq!(stash_crc(b"\x03GAM\x00\x00MAN"), 0x52);
    }

    #[test]
    fn encode_vector() {
        let packet = encode_stash(b"\x03GAM\x00\x00MAN").unwrap();
        assert_eq!(packet[0], 0x89);
        assert_eq!(packet[1], 0x52);
        assert_eq!(&packet[2..], b"\x03GAM\x00\x00MAN");
    }

    #[test]
    fn round_trip_all_lengths() {
        for len in 0..=MAX_STASH {
            let data: Vec<u8> = (0..len as u8).collect();
            let packet = encode_stash(&data).unwrap();
            assert_eq!(packet[0], 0x80 | len as u8);
            assert_eq!(packet[1], stash_crc(&data));
            assert_eq!(decode_stash(&packet).unwrap(), data);
        }
    }

    #[test]
    fn nineteen_bytes_is_rejected() {
        assert!(encode_stash(&[0u8; MAX_STASH]).is_ok());
        assert!(matches!(
            encode_stash(&[0u8; MAX_STASH + 1]),
            Err(ProtocolError::StashTooLong(19))
        ));
    }

    #[test]
    fn decode_rejects_damage() {
        let mut packet = encode_stash(b"HELLO").unwrap();
        packet[4] ^= 0x01; // flip one payload bit
        assert!(decode_stash(&packet).is_none());

        let mut packet = encode_stash(b"HELLO").unwrap();
        packet[1] ^= 0x80; // flip the CRC byte
        assert!(decode_stash(&packet).is_none());

        assert!(decode_stash(&[]).is_none());
        assert!(decode_stash(&[0x85]).is_none());
        // Length byte claims more than was read back.
        assert!(decode_stash(&[0x85, 0x00, b'a']).is_none());
    }

    #[test]
    fn backup_cache_tracks_displacement() {
        record_backup("C0FE", b"\x03GAM\x00\x00MAN");
        let state = backup_for("C0FE").unwrap();
        assert!(state.from_backup);
        assert!(!state.displaced);
        assert_eq!(state.data, b"\x03GAM\x00\x00MAN");

        mark_displaced("C0FE");
        assert!(backup_for("C0FE").unwrap().displaced);

        // A fresh capture clears the displaced flag.
        record_backup("C0FE", b"\x03WIN\x00\x00");
        let state = backup_for("C0FE").unwrap();
        assert!(!state.displaced);
        assert_eq!(state.data, b"\x03WIN\x00\x00");

        assert!(backup_for("BEEF").is_none());
        // Displacing an unknown badge is a no-op.
        mark_displaced("BEEF");
        assert!(backup_for("BEEF").is_none());
    }
}
