//! The word-transformation game
//!
//! A pure state machine: given a station, a badge's assignment and its
//! stash contents, decide the next stash state and the scenes to show.
//! No I/O happens here; the scheduler runs this inside a badge task and
//! the renderer turns scenes into frames elsewhere.
//!
//! The transition tables are data, not code: `GameTables` loads a TOML
//! document (several variants of the word list exist; the canonical one
//! ships with the crate).

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use anyhow::Context;
use nametag_device::StashState;
use serde::Deserialize;
use tracing::info;

use crate::tags::{TagConfig, TagState};

/// One unit of display output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayScene {
    pub image_name: Option<String>,
    pub text: String,
    pub bold: bool,
    pub blink: bool,
}

impl DisplayScene {
    pub fn image(name: impl Into<String>) -> DisplayScene {
        DisplayScene {
            image_name: Some(name.into()),
            ..DisplayScene::default()
        }
    }

    pub fn with_text(mut self, text: impl fmt::Display) -> DisplayScene {
        self.text = text.to_string();
        self
    }

    pub fn bold(mut self) -> DisplayScene {
        self.bold = true;
        self
    }

    pub fn blink(mut self) -> DisplayScene {
        self.blink = true;
        self
    }
}

/// The hand-off contract from game logic to rendering: the state to
/// stash on the badge and the scenes to display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayProgram {
    pub new_state: TagState,
    pub scenes: Vec<DisplayScene>,
}

#[derive(Debug, Deserialize)]
struct RawTables {
    flavor: RawFlavors,
    station: BTreeMap<String, RawStation>,
    #[serde(default)]
    checkpoint: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawFlavors {
    start: HashMap<String, String>,
    end: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStation {
    /// Words this station beheads (drops the first letter of).
    #[serde(default)]
    behead: Vec<String>,
    /// Reversible word pairs (letter edits, opposites).
    #[serde(default)]
    swaps: Vec<(String, String)>,
}

/// Compiled transition tables.
#[derive(Debug, Clone)]
pub struct GameTables {
    start: HashMap<String, String>,
    end: HashMap<String, String>,
    moves: HashMap<u16, HashMap<String, String>>,
    checkpoint: HashMap<String, String>,
}

/// Fallback start/end for badges with an unknown flavor; never reachable
/// in play, so such badges simply cycle at the staff station.
const BAD_FLAVOR_WORD: &str = "BADTAG";

impl GameTables {
    /// Parse and compile a transition-table document.
    pub fn from_toml(text: &str) -> anyhow::Result<GameTables> {
        let raw: RawTables = toml::from_str(text).context("parsing game tables")?;
        let mut moves = HashMap::new();
        for (station, rules) in raw.station {
            let id: u16 = station
                .parse()
                .with_context(|| format!("station id {station:?}"))?;
            let table: &mut HashMap<String, String> = moves.entry(id).or_default();
            for word in rules.behead {
                table.insert(word.clone(), word[1..].to_string());
            }
            for (a, b) in rules.swaps {
                table.insert(a.clone(), b.clone());
                table.insert(b, a);
            }
        }
        Ok(GameTables {
            start: raw.flavor.start,
            end: raw.flavor.end,
            moves,
            checkpoint: raw.checkpoint,
        })
    }

    /// The canonical word list shipped with the crate.
    pub fn builtin() -> GameTables {
        GameTables::from_toml(include_str!("game_words.toml"))
            .expect("built-in game tables are well-formed")
    }

    pub fn start_word(&self, flavor: &str) -> &str {
        self.start.get(flavor).map_or(BAD_FLAVOR_WORD, String::as_str)
    }

    pub fn end_word(&self, flavor: &str) -> &str {
        self.end.get(flavor).map_or(BAD_FLAVOR_WORD, String::as_str)
    }

    /// The word this station transforms `word` into, if any.
    pub fn next_word(&self, station: u16, word: &str) -> Option<&str> {
        self.moves.get(&station)?.get(word).map(String::as_str)
    }

    /// The checkpoint a dead-end word rolls back to.
    pub fn checkpoint(&self, word: &str) -> Option<&str> {
        self.checkpoint.get(word).map(String::as_str)
    }

    /// Station ids with any moves defined.
    pub fn stations(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.moves.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Decide what a badge visiting a station should do next.
///
/// Returns `None` when nothing should change (revisits, finished or
/// out-of-game badges away from the staff station).
pub fn program_for_tag(
    station_id: u16,
    config: &TagConfig,
    stash: Option<&StashState>,
    tables: &GameTables,
) -> Option<DisplayProgram> {
    let start_word = tables.start_word(&config.flavor);
    let end_word = tables.end_word(&config.flavor);

    let from_backup = stash.is_some_and(|s| s.from_backup);
    let state = stash.and_then(|s| TagState::from_bytes(&s.data));

    if station_id == 0 {
        // Staff station: hand out or reset badges. A badge already in
        // play keeps its state, unless we only know it from the backup
        // cache (then rewrite it to be safe).
        if let Some(state) = &state {
            if (state.phase == b"GAM" || state.phase == b"WIN") && !from_backup {
                info!(
                    "{config} Phase \"{}\" -> No change at staff",
                    String::from_utf8_lossy(&state.phase)
                );
                return None;
            }
        }
        return Some(DisplayProgram {
            new_state: TagState::with(b"GAM", 0, start_word.as_bytes()),
            scenes: vec![
                DisplayScene::image(format!("need-tag{}", config.flavor))
                    .with_text(end_word)
                    .bold(),
                DisplayScene::image("use-guides"),
                DisplayScene::image("give")
                    .with_text(format_args!("\"{start_word}\""))
                    .bold()
                    .blink(),
            ],
        });
    }

    let Some(state) = state else {
        return Some(DisplayProgram {
            new_state: TagState::new(b"RST"),
            scenes: vec![DisplayScene::image("tag-reset")],
        });
    };

    if state.phase != b"GAM" {
        info!(
            "{config} Phase \"{}\" -> No change (non-GAM)",
            String::from_utf8_lossy(&state.phase)
        );
        return None;
    }

    let last_word = String::from_utf8_lossy(&state.string).to_string();
    let last_station = state.number;
    let prefix = format!("{config} G{last_station} \"{last_word}\" :: G{station_id}");

    if last_station == station_id as i16 {
        if from_backup {
            // The badge lost its stash and we restored it; repeat the
            // current word display.
            info!("{prefix} -> \"{last_word}\" (backup refresh)");
            return Some(DisplayProgram {
                new_state: state.clone(),
                scenes: vec![DisplayScene::image(format!("give-ghost{station_id}"))
                    .with_text(format_args!("\"{last_word}\""))
                    .bold()
                    .blink()],
            });
        }
        info!("{prefix} -> No change (same station)");
        return None;
    }

    if let Some(next_word) = tables.next_word(station_id, &last_word) {
        if next_word == end_word {
            info!("{prefix} => \"{next_word}\" success!!!");
            return Some(DisplayProgram {
                new_state: TagState::new(b"WIN"),
                scenes: vec![
                    DisplayScene::image(format!("accept-ghost{station_id}"))
                        .with_text(format_args!("\"{last_word}\"")),
                    DisplayScene::image("success")
                        .with_text(format_args!("\"{next_word}\""))
                        .bold()
                        .blink(),
                ],
            });
        }

        info!("{prefix} => \"{next_word}\" advance");
        return Some(DisplayProgram {
            new_state: TagState::with(b"GAM", station_id as i16, next_word.as_bytes()),
            scenes: vec![
                DisplayScene::image(format!("accept-ghost{station_id}"))
                    .with_text(format_args!("\"{last_word}\"")),
                DisplayScene::image(format!("give-ghost{station_id}"))
                    .with_text(format_args!("\"{next_word}\""))
                    .bold()
                    .blink(),
            ],
        });
    }

    // No move from here: roll back to the word's checkpoint (or the
    // flavor's start word).
    let restart = tables.checkpoint(&last_word).unwrap_or(start_word);

    if last_word == restart {
        info!("{prefix} X> \"{restart}\" retry");
        return Some(DisplayProgram {
            new_state: TagState::with(b"GAM", station_id as i16, restart.as_bytes()),
            scenes: vec![
                DisplayScene::image(format!("reject-ghost{station_id}"))
                    .with_text(format_args!("\"{last_word}\"")),
                DisplayScene::image("maybe-try-another"),
            ],
        });
    }

    // If this station has a move from the checkpoint word, skip straight
    // through it so the player is not stuck re-reading the same prompt
    // here after rolling back.
    if let Some(skip) = tables.next_word(station_id, restart) {
        info!("{prefix} X> \"{restart}\" >> \"{skip}\" reskip");
        return Some(DisplayProgram {
            new_state: TagState::with(b"GAM", station_id as i16, skip.as_bytes()),
            scenes: vec![
                DisplayScene::image(format!("reject-ghost{station_id}"))
                    .with_text(format_args!("\"{last_word}\"")),
                DisplayScene::image("was-back-at").with_text(format_args!("\"{restart}\"")),
                DisplayScene::image(format!("accept-ghost{station_id}"))
                    .with_text(format_args!("\"{restart}\"")),
                DisplayScene::image(format!("give-ghost{station_id}"))
                    .with_text(format_args!("\"{skip}\""))
                    .bold()
                    .blink(),
            ],
        });
    }

    info!("{prefix} X> \"{restart}\" restart");
    Some(DisplayProgram {
        new_state: TagState::with(b"GAM", station_id as i16, restart.as_bytes()),
        scenes: vec![
            DisplayScene::image(format!("reject-ghost{station_id}"))
                .with_text(format_args!("\"{last_word}\"")),
            DisplayScene::image("now-back-at")
                .with_text(format_args!("\"{restart}\""))
                .bold()
                .blink(),
            DisplayScene::image("now-visit-another"),
        ],
    })
}
