//! Manifest storage: atomic writes on the publisher side, listing and
//! fetching on both sides.
//!
//! Two variants exist behind one type: the default local-filesystem store,
//! and a command-templated store for deployments where the consumer reads
//! manifests over ssh or an object-store CLI. Only the local variant can
//! write; there is exactly one publisher per Primary and it always runs next
//! to the manifest directory it owns.

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use tracing::info;

use walsync_api::{LatestPointer, Manifest, RestorePointName};

use crate::atomic_file::write_atomic;
use crate::config::SyncConfig;
use crate::shell::{render_template, require_success, run_rendered};

pub enum ManifestStore {
    Local(LocalStore),
    Commands(CommandStore),
}

pub struct LocalStore {
    manifest_dir: Utf8PathBuf,
    latest_path: Utf8PathBuf,
}

pub struct CommandStore {
    manifest_dir: Utf8PathBuf,
    latest_path: Utf8PathBuf,
    fetch_command: String,
    list_command: String,
}

impl ManifestStore {
    /// Commands win over the local filesystem when both fetch and list
    /// templates are configured.
    pub fn from_config(config: &SyncConfig) -> anyhow::Result<ManifestStore> {
        let manifest_dir = config.storage.manifest_dir.clone();
        let latest_path = config.latest_path();
        match (
            &config.storage.manifest_fetch_command,
            &config.storage.manifest_list_command,
        ) {
            (Some(fetch), Some(list)) => Ok(ManifestStore::Commands(CommandStore {
                manifest_dir,
                latest_path,
                fetch_command: fetch.clone(),
                list_command: list.clone(),
            })),
            (None, None) => Ok(ManifestStore::Local(LocalStore {
                manifest_dir,
                latest_path,
            })),
            _ => bail!(
                "storage.manifest_fetch_command and storage.manifest_list_command \
                 must be configured together"
            ),
        }
    }

    /// Durably write a manifest, returning its path. Replaces any previous
    /// version atomically (the NOT READY → READY transition goes through
    /// here).
    pub async fn put(&self, manifest: &Manifest) -> anyhow::Result<Utf8PathBuf> {
        match self {
            ManifestStore::Local(store) => store.put(manifest).await,
            ManifestStore::Commands(_) => {
                bail!("manifest store is command-backed and therefore read-only")
            }
        }
    }

    /// All manifest names, newest first.
    pub async fn list(&self) -> anyhow::Result<Vec<RestorePointName>> {
        let mut names = match self {
            ManifestStore::Local(store) => store.list().await?,
            ManifestStore::Commands(store) => store.list().await?,
        };
        names.sort_unstable_by(|a, b| b.cmp(a));
        Ok(names)
    }

    pub async fn get(&self, name: &RestorePointName) -> anyhow::Result<Manifest> {
        let text = match self {
            ManifestStore::Local(store) => store.read(&name.manifest_file_name()).await?,
            ManifestStore::Commands(store) => store.read(&name.manifest_file_name()).await?,
        };
        serde_json::from_str(&text).with_context(|| format!("could not parse manifest {name}"))
    }

    pub async fn exists(&self, name: &RestorePointName) -> anyhow::Result<bool> {
        match self {
            ManifestStore::Local(store) => {
                let path = store.manifest_dir.join(name.manifest_file_name());
                Ok(tokio::fs::try_exists(&path).await?)
            }
            ManifestStore::Commands(store) => Ok(store.list().await?.contains(name)),
        }
    }

    /// The LATEST pointer, or `None` when it has not been written yet.
    /// Readers tolerate a pointer lagging behind the manifest listing.
    pub async fn read_latest(&self) -> anyhow::Result<Option<LatestPointer>> {
        let text = match self {
            ManifestStore::Local(store) => {
                match tokio::fs::read_to_string(&store.latest_path).await {
                    Ok(text) => text,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                    Err(e) => {
                        return Err(e)
                            .with_context(|| format!("could not read {:?}", store.latest_path))
                    }
                }
            }
            ManifestStore::Commands(store) => {
                let Some(file_name) = store.latest_path.file_name() else {
                    bail!("latest_path {:?} has no file name", store.latest_path);
                };
                match store.try_read(file_name).await? {
                    Some(text) => text,
                    None => return Ok(None),
                }
            }
        };
        let pointer =
            serde_json::from_str(&text).context("could not parse the LATEST pointer")?;
        Ok(Some(pointer))
    }

    /// Point LATEST at a READY manifest. Called only after the manifest
    /// itself is durable.
    pub async fn write_latest(&self, name: &RestorePointName, path: &Utf8Path) -> anyhow::Result<()> {
        let ManifestStore::Local(store) = self else {
            bail!("manifest store is command-backed and therefore read-only");
        };
        let pointer = LatestPointer {
            restore_point: name.clone(),
            path: path.to_owned(),
            updated_at_utc: Utc::now(),
        };
        if let Some(parent) = store.latest_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("could not create {parent:?}"))?;
        }
        let body = serde_json::to_vec_pretty(&pointer)?;
        write_atomic(&store.latest_path, &body).await?;
        info!("LATEST now points at {name}");
        Ok(())
    }
}

impl LocalStore {
    async fn put(&self, manifest: &Manifest) -> anyhow::Result<Utf8PathBuf> {
        tokio::fs::create_dir_all(&self.manifest_dir)
            .await
            .with_context(|| format!("could not create {:?}", self.manifest_dir))?;
        let path = self
            .manifest_dir
            .join(manifest.restore_point.manifest_file_name());
        let body = serde_json::to_vec_pretty(manifest)?;
        write_atomic(&path, &body).await?;
        Ok(path)
    }

    async fn list(&self) -> anyhow::Result<Vec<RestorePointName>> {
        let mut entries = match tokio::fs::read_dir(&self.manifest_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("could not list {:?}", self.manifest_dir))
            }
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(file_name) = entry.file_name().to_str() {
                if let Some(name) = RestorePointName::from_manifest_file_name(file_name) {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }

    async fn read(&self, file_name: &str) -> anyhow::Result<String> {
        let path = self.manifest_dir.join(file_name);
        tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("could not read manifest {path:?}"))
    }
}

impl CommandStore {
    fn substitutions<'a>(
        &'a self,
        file_name: &'a str,
        path: &'a str,
    ) -> Vec<(&'static str, &'a str)> {
        vec![
            ("manifest_dir", self.manifest_dir.as_str()),
            ("manifest_file", file_name),
            ("manifest_path", path),
        ]
    }

    async fn list(&self) -> anyhow::Result<Vec<RestorePointName>> {
        let rendered = render_template(
            &self.list_command,
            &[("manifest_dir", self.manifest_dir.as_str())],
        );
        let output = run_rendered(&rendered).await?;
        let stdout = require_success("manifest list command", &output)?;
        Ok(stdout
            .lines()
            .filter_map(|line| {
                // Accept bare names and full paths alike.
                let file_name = line.trim().rsplit('/').next()?;
                RestorePointName::from_manifest_file_name(file_name)
            })
            .collect())
    }

    async fn read(&self, file_name: &str) -> anyhow::Result<String> {
        match self.try_read(file_name).await? {
            Some(text) => Ok(text),
            None => bail!("manifest fetch command produced nothing for {file_name}"),
        }
    }

    /// Fetch a file's contents; a failing fetch for a file that may
    /// legitimately not exist yet maps to `None`.
    async fn try_read(&self, file_name: &str) -> anyhow::Result<Option<String>> {
        let path = self.manifest_dir.join(file_name);
        let rendered = render_template(
            &self.fetch_command,
            &self.substitutions(file_name, path.as_str()),
        );
        let output = run_rendered(&rendered).await?;
        if !output.status.success() {
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;
    use walsync_api::ManifestInstance;

    fn manifest(name: &str, ready: bool) -> Manifest {
        Manifest {
            restore_point: name.parse().unwrap(),
            created_at_utc: Utc::now(),
            timeline_id: 1,
            ready,
            instances: vec![ManifestInstance {
                segment_id: -1,
                host: "cdw".into(),
                port: 5432,
                data_dir: "/data/gpseg-1".into(),
                restore_lsn: "9/E40000C8".parse().unwrap(),
                wal_filename: "000000010000000900000039".into(),
                archive_source_host: "cdw".into(),
                archive_source_path: "/archive/seg-1/000000010000000900000039".into(),
                present: ready,
            }],
        }
    }

    fn local_store(dir: &Utf8Path) -> ManifestStore {
        let mut config = SyncConfig::default();
        config.storage.manifest_dir = dir.to_owned();
        ManifestStore::from_config(&config).unwrap()
    }

    #[tokio::test]
    async fn put_get_list_round_trip() {
        let dir = tempdir().unwrap();
        let store = local_store(dir.path());

        let older = manifest("sync_point_20260201_180000", true);
        let newer = manifest("sync_point_20260201_181406", false);
        store.put(&older).await.unwrap();
        store.put(&newer).await.unwrap();

        // Newest first.
        let names = store.list().await.unwrap();
        assert_eq!(
            names,
            vec![
                "sync_point_20260201_181406".parse().unwrap(),
                "sync_point_20260201_180000".parse().unwrap(),
            ]
        );

        let fetched = store.get(&older.restore_point).await.unwrap();
        assert_eq!(fetched, older);
        assert!(store.exists(&newer.restore_point).await.unwrap());
        assert!(!store
            .exists(&"sync_point_20990101_000000".parse().unwrap())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn ready_transition_rewrites_in_place() {
        let dir = tempdir().unwrap();
        let store = local_store(dir.path());

        let mut m = manifest("sync_point_20260201_181406", false);
        store.put(&m).await.unwrap();
        m.ready = true;
        m.instances[0].present = true;
        let path = store.put(&m).await.unwrap();

        let fetched = store.get(&m.restore_point).await.unwrap();
        assert!(fetched.ready);
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert!(path.as_str().ends_with("sync_point_20260201_181406.json"));
    }

    #[tokio::test]
    async fn latest_pointer_round_trip() {
        let dir = tempdir().unwrap();
        let store = local_store(dir.path());
        assert!(store.read_latest().await.unwrap().is_none());

        let m = manifest("sync_point_20260201_181406", true);
        let path = store.put(&m).await.unwrap();
        store.write_latest(&m.restore_point, &path).await.unwrap();

        let pointer = store.read_latest().await.unwrap().unwrap();
        assert_eq!(pointer.restore_point, m.restore_point);
        assert_eq!(pointer.path, path);
    }

    #[tokio::test]
    async fn command_store_lists_and_fetches() {
        let dir = tempdir().unwrap();
        // Seed with a local store, then read through commands.
        let seed = local_store(dir.path());
        let m = manifest("sync_point_20260201_181406", true);
        let path = seed.put(&m).await.unwrap();
        seed.write_latest(&m.restore_point, &path).await.unwrap();

        let mut config = SyncConfig::default();
        config.storage.manifest_dir = dir.path().to_owned();
        config.storage.manifest_list_command = Some("ls -1 {manifest_dir}".into());
        config.storage.manifest_fetch_command = Some("cat {manifest_path}".into());
        let store = ManifestStore::from_config(&config).unwrap();

        assert_eq!(store.list().await.unwrap(), vec![m.restore_point.clone()]);
        assert_eq!(store.get(&m.restore_point).await.unwrap(), m);
        let pointer = store.read_latest().await.unwrap().unwrap();
        assert_eq!(pointer.restore_point, m.restore_point);

        // Writes are refused.
        assert!(store.put(&m).await.is_err());
    }

    #[test]
    fn half_configured_commands_are_rejected() {
        let mut config = SyncConfig::default();
        config.storage.manifest_fetch_command = Some("cat {manifest_path}".into());
        assert!(ManifestStore::from_config(&config).is_err());
    }
}
