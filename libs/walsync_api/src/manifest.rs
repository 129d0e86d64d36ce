use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use postgres_wal::Lsn;
use serde::{Deserialize, Serialize};

use crate::name::RestorePointName;

/// Per-restore-point document the publisher produces and the consumer reads.
///
/// A manifest is written NOT READY first and rewritten with `ready = true`
/// once a single probing pass has seen every instance's WAL segment in the
/// archive. After that transition it is never mutated again.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub restore_point: RestorePointName,
    pub created_at_utc: DateTime<Utc>,
    pub timeline_id: u32,
    pub ready: bool,
    pub instances: Vec<ManifestInstance>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManifestInstance {
    pub segment_id: i32,
    pub host: String,
    pub port: u16,
    pub data_dir: Utf8PathBuf,
    /// Where this instance must stop replaying.
    pub restore_lsn: Lsn,
    /// Archive file containing `restore_lsn`, derived from
    /// `(timeline_id, restore_lsn, wal_segment_size)`.
    pub wal_filename: String,
    pub archive_source_host: String,
    pub archive_source_path: Utf8PathBuf,
    /// Whether the archive verifier has seen `wal_filename`.
    pub present: bool,
}

impl Manifest {
    /// `ready` may only be set when this holds for a single probing pass.
    pub fn all_present(&self) -> bool {
        self.instances.iter().all(|i| i.present)
    }

    pub fn instance(&self, segment_id: i32) -> Option<&ManifestInstance> {
        self.instances.iter().find(|i| i.segment_id == segment_id)
    }
}

/// Pointer to the most recently READY manifest, replaced atomically after the
/// manifest itself is durable. Readers must tolerate it lagging behind the
/// manifest listing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatestPointer {
    pub restore_point: RestorePointName,
    pub path: Utf8PathBuf,
    pub updated_at_utc: DateTime<Utc>,
}
