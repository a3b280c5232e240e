//! Lobby word-game host driver
//!
//! Drives a fleet of BLE LED nametag badges through a serial-attached
//! Bluefruit adapter. The [`supervisor`] keeps an adapter session alive,
//! the [`scanner`] connects to one badge at a time, and each visit runs
//! the [`game`] over the badge's persistent stash via a [`station`]
//! task.
//!
//! The transport and badge protocol live in the `nametag-transport` and
//! `nametag-device` crates; this crate is the game-side application.

pub mod game;
pub mod scanner;
pub mod station;
pub mod supervisor;
pub mod tags;

pub use game::{program_for_tag, DisplayProgram, DisplayScene, GameTables};
pub use scanner::{scan_and_spawn, ScannerOptions};
pub use station::{SceneRenderer, Station};
pub use supervisor::supervise;
pub use tags::{load_configs, TagConfig, TagState};
