//! Configuration handling.
//!
//! A single JSON document configures both sides of a deployment; each daemon
//! reads the sections it needs and ignores the rest. Unknown keys are
//! rejected so that a typo fails loudly at startup instead of silently
//! running with a default.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use postgres_wal::validate_wal_segment_size;
use walsync_api::InstanceDescriptor;

use crate::Side;

pub mod defaults {
    pub const DEFAULT_CONFIG_PATH: &str = "/etc/walsync/walsync.json";

    pub const DEFAULT_PRIMARY_HOST: &str = "localhost";
    pub const DEFAULT_PRIMARY_PORT: u16 = 5432;
    pub const DEFAULT_DB: &str = "postgres";
    pub const DEFAULT_DB_USER: &str = "gpadmin";

    pub const DEFAULT_STATE_DIR: &str = "/var/lib/walsync";
    pub const DEFAULT_MANIFEST_DIR: &str = "/var/lib/walsync/manifests";
    pub const DEFAULT_ARCHIVE_DIR: &str = "/var/lib/walsync/wal_archive";
    pub const DEFAULT_GP_HOME: &str = "/usr/local/greenplum-db";

    pub const DEFAULT_PUBLISHER_SLEEP_SECS: u64 = 60;
    pub const DEFAULT_CONSUMER_SLEEP_SECS: u64 = 60;
    pub const DEFAULT_REACH_POLL_SECS: u64 = 5;
    pub const DEFAULT_WAIT_REACH_SECS: u64 = 900;
    pub const DEFAULT_WAL_SEGMENT_SIZE_MB: u64 = 64;
    pub const DEFAULT_EVIDENCE_TAIL_BYTES: u64 = 1024 * 1024;
    pub const DEFAULT_SQL_CONNECT_TIMEOUT_SECS: u64 = 10;
}

use defaults::*;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(default)]
    pub primary: PrimarySection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub archive: ArchiveSection,
    #[serde(default)]
    pub dr: DrSection,
    #[serde(default)]
    pub behavior: BehaviorSection,
}

/// Connection to the Primary coordinator, plus the publisher's own state
/// location.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PrimarySection {
    pub host: String,
    pub port: u16,
    pub db: String,
    pub user: String,
    pub state_dir: Utf8PathBuf,
}

impl Default for PrimarySection {
    fn default() -> Self {
        PrimarySection {
            host: DEFAULT_PRIMARY_HOST.into(),
            port: DEFAULT_PRIMARY_PORT,
            db: DEFAULT_DB.into(),
            user: DEFAULT_DB_USER.into(),
            state_dir: DEFAULT_STATE_DIR.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageSection {
    pub manifest_dir: Utf8PathBuf,
    /// Defaults to `<manifest_dir>/LATEST.json`.
    pub latest_path: Option<Utf8PathBuf>,
    /// Template printing one manifest to stdout. Placeholders:
    /// `{manifest_path}`, `{manifest_dir}`, `{manifest_file}`.
    pub manifest_fetch_command: Option<String>,
    /// Template listing manifest files to stdout, one per line. Placeholder:
    /// `{manifest_dir}`.
    pub manifest_list_command: Option<String>,
}

impl Default for StorageSection {
    fn default() -> Self {
        StorageSection {
            manifest_dir: DEFAULT_MANIFEST_DIR.into(),
            latest_path: None,
            manifest_fetch_command: None,
            manifest_list_command: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ArchiveSection {
    pub archive_dir: Utf8PathBuf,
}

impl Default for ArchiveSection {
    fn default() -> Self {
        ArchiveSection {
            archive_dir: DEFAULT_ARCHIVE_DIR.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DrSection {
    pub state_dir: Utf8PathBuf,
    /// Defaults to `<state_dir>/receipts`.
    pub receipts_dir: Option<Utf8PathBuf>,
    pub gp_home: Utf8PathBuf,
    pub db: String,
    pub user: String,
    pub instances: Vec<InstanceDescriptor>,
}

impl Default for DrSection {
    fn default() -> Self {
        DrSection {
            state_dir: DEFAULT_STATE_DIR.into(),
            receipts_dir: None,
            gp_home: DEFAULT_GP_HOME.into(),
            db: DEFAULT_DB.into(),
            user: DEFAULT_DB_USER.into(),
            instances: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BehaviorSection {
    pub publisher_sleep_secs: u64,
    pub consumer_sleep_secs: u64,
    pub consumer_reach_poll_secs: u64,
    pub consumer_wait_reach_secs: u64,
    /// Must be a power of two between 1 and 1024.
    pub wal_segment_size_mb: u64,
    /// Global archive-verifier template. Placeholders: `{archive_dir}`,
    /// `{wal_filename}`, `{wal_path}`, `{host}`.
    pub wal_check_command: Option<String>,
    /// Per-segment overrides of `wal_check_command`.
    pub wal_check_commands: BTreeMap<i32, String>,
    pub evidence_tail_bytes: u64,
    /// Accept an all-down outcome without log evidence even when an instance
    /// stopped below its target LSN. Off by default; see the receipts for
    /// what was actually observed either way.
    pub allow_lsn_only_advance: bool,
    pub sql_connect_timeout_secs: u64,
}

impl Default for BehaviorSection {
    fn default() -> Self {
        BehaviorSection {
            publisher_sleep_secs: DEFAULT_PUBLISHER_SLEEP_SECS,
            consumer_sleep_secs: DEFAULT_CONSUMER_SLEEP_SECS,
            consumer_reach_poll_secs: DEFAULT_REACH_POLL_SECS,
            consumer_wait_reach_secs: DEFAULT_WAIT_REACH_SECS,
            wal_segment_size_mb: DEFAULT_WAL_SEGMENT_SIZE_MB,
            wal_check_command: None,
            wal_check_commands: BTreeMap::new(),
            evidence_tail_bytes: DEFAULT_EVIDENCE_TAIL_BYTES,
            allow_lsn_only_advance: false,
            sql_connect_timeout_secs: DEFAULT_SQL_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl SyncConfig {
    pub fn load(path: &Utf8Path) -> anyhow::Result<SyncConfig> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not read config file {path:?}"))?;
        let config: SyncConfig = serde_json::from_str(&text)
            .with_context(|| format!("could not parse config file {path:?}"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        validate_wal_segment_size(self.wal_segment_size_bytes())?;
        let mut seen = std::collections::BTreeSet::new();
        for instance in &self.dr.instances {
            if !seen.insert(instance.segment_id) {
                anyhow::bail!(
                    "dr.instances lists segment {} more than once",
                    instance.segment_id
                );
            }
        }
        Ok(())
    }

    pub fn wal_segment_size_bytes(&self) -> u64 {
        self.behavior.wal_segment_size_mb * 1024 * 1024
    }

    pub fn latest_path(&self) -> Utf8PathBuf {
        self.storage
            .latest_path
            .clone()
            .unwrap_or_else(|| self.storage.manifest_dir.join("LATEST.json"))
    }

    pub fn receipts_dir(&self) -> Utf8PathBuf {
        self.dr
            .receipts_dir
            .clone()
            .unwrap_or_else(|| self.dr.state_dir.join("receipts"))
    }

    pub fn state_dir(&self, side: Side) -> &Utf8Path {
        match side {
            Side::Primary => &self.primary.state_dir,
            Side::Dr => &self.dr.state_dir,
        }
    }

    pub fn pid_path(&self, side: Side) -> Utf8PathBuf {
        self.state_dir(side).join(format!("{}.pid", side.as_str()))
    }

    pub fn log_path(&self, side: Side) -> Utf8PathBuf {
        self.state_dir(side).join(format!("{}.log", side.as_str()))
    }

    pub fn current_restore_point_path(&self) -> Utf8PathBuf {
        self.dr.state_dir.join("current_restore_point.txt")
    }

    pub fn reach_poll_interval(&self) -> Duration {
        Duration::from_secs(self.behavior.consumer_reach_poll_secs)
    }

    pub fn wait_reach_cap(&self) -> Duration {
        Duration::from_secs(self.behavior.consumer_wait_reach_secs)
    }

    pub fn sql_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.behavior.sql_connect_timeout_secs)
    }

    /// A config usable by tests, rooted under a scratch directory.
    #[cfg(test)]
    pub(crate) fn test_config(root: &Utf8Path) -> SyncConfig {
        let mut config = SyncConfig::default();
        config.primary.state_dir = root.join("state");
        config.storage.manifest_dir = root.join("manifests");
        config.archive.archive_dir = root.join("wal_archive");
        config.dr.state_dir = root.join("state");
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_document_gets_defaults() {
        let config: SyncConfig = serde_json::from_str("{}").unwrap();
        config.validate().unwrap();
        assert_eq!(config.primary.host, "localhost");
        assert_eq!(config.behavior.wal_segment_size_mb, 64);
        assert_eq!(config.latest_path(), Utf8PathBuf::from("/var/lib/walsync/manifests/LATEST.json"));
        assert_eq!(config.receipts_dir(), Utf8PathBuf::from("/var/lib/walsync/receipts"));
        assert_eq!(config.pid_path(Side::Primary), Utf8PathBuf::from("/var/lib/walsync/primary.pid"));
    }

    #[test]
    fn recognizes_all_documented_keys() {
        let text = r#"{
            "primary": { "host": "cdw", "port": 5432, "db": "postgres", "user": "gpadmin",
                         "state_dir": "/var/lib/walsync" },
            "storage": { "manifest_dir": "/nfs/manifests",
                         "latest_path": "/nfs/manifests/LATEST.json",
                         "manifest_fetch_command": "ssh cdw cat {manifest_path}",
                         "manifest_list_command": "ssh cdw ls {manifest_dir}" },
            "archive": { "archive_dir": "/nfs/wal_archive" },
            "dr": { "state_dir": "/var/lib/walsync", "receipts_dir": "/var/lib/walsync/receipts",
                    "gp_home": "/usr/local/greenplum-db", "db": "postgres", "user": "gpadmin",
                    "instances": [
                        { "segment_id": -1, "host": "dr-cdw", "port": 5432,
                          "data_dir": "/data/coordinator/gpseg-1", "is_local": true }
                    ] },
            "behavior": { "publisher_sleep_secs": 30, "consumer_sleep_secs": 30,
                          "consumer_reach_poll_secs": 2, "consumer_wait_reach_secs": 600,
                          "wal_segment_size_mb": 64,
                          "wal_check_command": "test -f {wal_path} && echo present",
                          "wal_check_commands": { "0": "ssh sdw1 test -f {wal_path} && echo ok" },
                          "evidence_tail_bytes": 262144,
                          "allow_lsn_only_advance": false,
                          "sql_connect_timeout_secs": 5 }
        }"#;
        let config: SyncConfig = serde_json::from_str(text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.behavior.wal_check_commands.get(&0).unwrap(), "ssh sdw1 test -f {wal_path} && echo ok");
        assert_eq!(config.dr.instances[0].segment_id, -1);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = serde_json::from_str::<SyncConfig>(r#"{ "behaviour": {} }"#).unwrap_err();
        assert!(err.to_string().contains("behaviour"));
    }

    #[test]
    fn bad_segment_size_is_rejected() {
        let config: SyncConfig =
            serde_json::from_str(r#"{ "behavior": { "wal_segment_size_mb": 48 } }"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_dr_segment_is_rejected() {
        let text = r#"{ "dr": { "instances": [
            { "segment_id": 0, "host": "a", "port": 1, "data_dir": "/a" },
            { "segment_id": 0, "host": "b", "port": 2, "data_dir": "/b" }
        ] } }"#;
        let config: SyncConfig = serde_json::from_str(text).unwrap();
        assert!(config.validate().is_err());
    }
}
