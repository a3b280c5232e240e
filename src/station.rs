//! Game station glue: one badge visit, end to end
//!
//! A station task reads the badge's stash, asks the game what should
//! happen, uploads the rendered scenes (when a renderer is attached) and
//! writes the new state back. Rendering itself — fonts, art, animation
//! composition — is an external collaborator behind [`SceneRenderer`].

use std::collections::HashMap;
use std::rc::Rc;

use nametag_device::{Badge, Frame};
use tracing::{debug, info, warn};

use crate::game::{program_for_tag, DisplayProgram, GameTables};
use crate::tags::TagConfig;

/// Renders a display program into 48×12 animation frames.
pub trait SceneRenderer {
    fn render(&self, program: &DisplayProgram) -> anyhow::Result<Vec<Frame>>;

    /// Hold time per frame when uploading.
    fn frame_msec(&self) -> u16 {
        250
    }
}

/// One game station: id, badge assignments, transition tables, and an
/// optional display pipeline.
pub struct Station {
    station_id: u16,
    configs: HashMap<String, TagConfig>,
    tables: GameTables,
    renderer: Option<Rc<dyn SceneRenderer>>,
}

impl Station {
    pub fn new(
        station_id: u16,
        configs: HashMap<String, TagConfig>,
        tables: GameTables,
    ) -> Station {
        Station {
            station_id,
            configs,
            tables,
            renderer: None,
        }
    }

    /// Attach a display pipeline. Without one the station still runs the
    /// game and rewrites stashes; scenes are only logged.
    pub fn with_renderer(mut self, renderer: Rc<dyn SceneRenderer>) -> Station {
        self.renderer = Some(renderer);
        self
    }

    /// Task body for one connected badge.
    pub async fn visit(&self, badge: &Badge) -> anyhow::Result<()> {
        let config = match self.configs.get(badge.id()) {
            Some(config) => config.clone(),
            None => {
                warn!("[{}] Badge not in the assignment table", badge.id());
                TagConfig::anonymous(badge.id())
            }
        };

        info!("{config} Connected, reading state stash...");
        let stash = badge.read_stash().await?;
        let Some(program) = program_for_tag(self.station_id, &config, stash.as_ref(), &self.tables)
        else {
            return Ok(());
        };

        // Frames first: display packets clobber the stash register, so
        // the state write must be the last thing on the wire.
        if let Some(renderer) = &self.renderer {
            let frames = renderer.render(&program)?;
            badge.show_frames(&frames, renderer.frame_msec()).await?;
        } else {
            for scene in &program.scenes {
                debug!(
                    "{config} Scene [{}] \"{}\"{}{}",
                    scene.image_name.as_deref().unwrap_or("-"),
                    scene.text,
                    if scene.bold { " +bold" } else { "" },
                    if scene.blink { " +blink" } else { "" },
                );
            }
        }
        badge.write_stash(&program.new_state.to_bytes()).await?;
        info!("{config} Stashed: {}", program.new_state);
        Ok(())
    }
}
