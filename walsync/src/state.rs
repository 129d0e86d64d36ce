//! The consumer's single durable datum: `current_restore_point.txt`.
//!
//! One line, the name of the most recently *successfully consumed* restore
//! point. It only ever moves forward in restore-point time; rolling back is
//! an operator action (deleting the file), not an API.

use anyhow::{bail, Context};
use camino::Utf8PathBuf;
use tracing::info;

use walsync_api::RestorePointName;

use crate::atomic_file::write_atomic;

pub struct ConsumerState {
    path: Utf8PathBuf,
}

impl ConsumerState {
    pub fn new(path: Utf8PathBuf) -> ConsumerState {
        ConsumerState { path }
    }

    pub fn read(&self) -> anyhow::Result<Option<RestorePointName>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("could not read {:?}", self.path)),
        };
        let name = text
            .trim()
            .parse()
            .with_context(|| format!("{:?} contains an invalid restore point name", self.path))?;
        Ok(Some(name))
    }

    /// Advance to `target`. Refuses to move backwards; equal is a no-op so a
    /// crashed run can be retried safely.
    pub async fn advance(&self, target: &RestorePointName) -> anyhow::Result<()> {
        if let Some(current) = self.read()? {
            if *target < current {
                bail!(
                    "refusing to move current restore point backwards from {current} to {target}"
                );
            }
            if *target == current {
                return Ok(());
            }
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("could not create {parent:?}"))?;
        }
        write_atomic(&self.path, format!("{target}\n").as_bytes()).await?;
        info!("current restore point advanced to {target}");
        Ok(())
    }
}
