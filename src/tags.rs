//! Badge assignments and persistent game state
//!
//! `TagConfig` is the static per-badge assignment (who carries it, which
//! puzzle flavor) loaded from a TOML table keyed by badge id. `TagState`
//! is the game payload stored in the badge's stash register.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// Fixed stash header: length-prefixed phase padded to 4 bytes, then a
/// little-endian i16 station number.
pub const STATE_HEADER: usize = 6;
/// The stash holds at most 18 bytes, leaving 12 for the variable string.
pub const MAX_STATE_STRING: usize = 12;

/// Static per-badge assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TagConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub team: u16,
    #[serde(default)]
    pub flavor: String,
    #[serde(default)]
    pub note: String,
}

impl TagConfig {
    /// Placeholder config for a badge missing from the assignment table.
    pub fn anonymous(id: &str) -> TagConfig {
        TagConfig {
            id: id.to_string(),
            ..TagConfig::default()
        }
    }
}

impl fmt::Display for TagConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}", self.id)?;
        if !self.flavor.is_empty() {
            write!(f, "/{}", self.flavor)?;
        }
        if self.team != 0 {
            write!(f, "/T{}", self.team)?;
        }
        write!(f, "]")?;
        if !self.note.is_empty() {
            write!(f, " ({})", self.note)?;
        }
        Ok(())
    }
}

/// Load the assignment table: a TOML document of `[ID]` tables.
pub fn load_configs(path: &Path) -> anyhow::Result<HashMap<String, TagConfig>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading badge assignments from {}", path.display()))?;
    parse_configs(&text).with_context(|| format!("parsing {}", path.display()))
}

fn parse_configs(text: &str) -> anyhow::Result<HashMap<String, TagConfig>> {
    let table: HashMap<String, TagConfig> = toml::from_str(text)?;
    Ok(table
        .into_iter()
        .map(|(id, mut config)| {
            config.id = id.clone();
            (id, config)
        })
        .collect())
}

/// The game state carried in a badge's stash.
///
/// Wire layout: `phase_len_u8 · phase[3] · number_i16_le · string`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagState {
    /// Phase tag, up to 3 bytes (`GAM`, `WIN`, `RST`, ...).
    pub phase: Vec<u8>,
    /// Station number (16-bit signed).
    pub number: i16,
    /// Variable payload, up to 12 bytes (the current word).
    pub string: Vec<u8>,
}

impl TagState {
    pub fn new(phase: &[u8]) -> TagState {
        TagState::with(phase, 0, b"")
    }

    pub fn with(phase: &[u8], number: i16, string: &[u8]) -> TagState {
        debug_assert!(phase.len() <= 3);
        debug_assert!(string.len() <= MAX_STATE_STRING);
        TagState {
            phase: phase.to_vec(),
            number,
            string: string.to_vec(),
        }
    }

    /// Serialise for the stash register.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(STATE_HEADER + self.string.len());
        let phase_len = self.phase.len().min(3);
        out.push(phase_len as u8);
        out.extend_from_slice(&self.phase[..phase_len]);
        out.resize(4, 0);
        out.extend_from_slice(&self.number.to_le_bytes());
        out.extend_from_slice(&self.string);
        out
    }

    /// Parse a stash payload; `None` when the header is incomplete.
    pub fn from_bytes(data: &[u8]) -> Option<TagState> {
        if data.len() < STATE_HEADER {
            return None;
        }
        let phase_len = (data[0] as usize).min(3);
        Some(TagState {
            phase: data[1..1 + phase_len].to_vec(),
            number: i16::from_le_bytes([data[4], data[5]]),
            string: data[STATE_HEADER..].to_vec(),
        })
    }
}

impl fmt::Display for TagState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ghost={} \"{}\"",
            String::from_utf8_lossy(&self.phase),
            self.number,
            String::from_utf8_lossy(&self.string)
        )
    }
}
