use actix::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config;
use crate::error::HivewatchError;
use crate::messages::WriteArtifacts;
use crate::utils::image_utils::render_overlay;

/// Writes intermediate images to disk. Runs on a `SyncArbiter`; nothing
/// downstream waits for it.
pub struct ArtifactActor {
    output_dir: PathBuf,
    overlay: bool,
}

impl ArtifactActor {
    pub fn new(output_dir: impl Into<PathBuf>, overlay: bool) -> Self {
        Self {
            output_dir: output_dir.into(),
            overlay,
        }
    }

    pub fn from_config(config: &config::Artifacts) -> Self {
        Self::new(config.output_dir.clone(), config.overlay)
    }

    fn target(&self, hive_id: &str, prefix: &str, filename: &str) -> PathBuf {
        let stem = Path::new(filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(filename);
        self.output_dir
            .join(hive_id)
            .join(format!("{}_{}.png", prefix, stem))
    }
}

impl Actor for ArtifactActor {
    type Context = SyncContext<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        info!(target: "artifact", "ArtifactActor started");
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(target: "artifact", "ArtifactActor stopped");
    }
}

impl Handler<WriteArtifacts> for ArtifactActor {
    type Result = Result<Vec<PathBuf>, HivewatchError>;

    fn handle(&mut self, msg: WriteArtifacts, _ctx: &mut Self::Context) -> Self::Result {
        let written = self.write(&msg);
        if let Err(err) = &written {
            warn!(
                target: "artifact",
                hive_id = %msg.hive_id,
                filename = %msg.filename,
                "Could not write artifacts: {}",
                err
            );
        }
        written
    }
}

impl ArtifactActor {
    fn write(&self, msg: &WriteArtifacts) -> Result<Vec<PathBuf>, HivewatchError> {
        std::fs::create_dir_all(self.output_dir.join(&msg.hive_id))?;

        let mut written = Vec::with_capacity(4);

        let path = self.target(&msg.hive_id, "masked", &msg.filename);
        msg.masked.save(&path)?;
        written.push(path);

        let path = self.target(&msg.hive_id, "background", &msg.filename);
        msg.background.image.save(&path)?;
        written.push(path);

        let path = self.target(&msg.hive_id, "foreground", &msg.filename);
        msg.foreground.save(&path)?;
        written.push(path);

        if self.overlay {
            let path = self.target(&msg.hive_id, "overlay", &msg.filename);
            render_overlay(&msg.masked, &msg.foreground, &msg.mask).save(&path)?;
            written.push(path);
        }

        debug!(
            target: "artifact",
            hive_id = %msg.hive_id,
            filename = %msg.filename,
            files = written.len(),
            "Wrote artifacts"
        );
        Ok(written)
    }
}
