use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::COORDINATOR_SEGMENT_ID;

/// One database instance of a cluster, on either side of the deployment.
///
/// On the Primary side these come from the coordinator's segment
/// configuration; on the DR side they come from the `dr.instances` config
/// section. The two sides are matched by `segment_id` only; hosts, ports and
/// data directories are expected to differ.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub segment_id: i32,
    pub host: String,
    pub port: u16,
    pub data_dir: Utf8PathBuf,
    /// Whether the instance's filesystem and processes are reachable without
    /// a remote shell.
    #[serde(default)]
    pub is_local: bool,
}

impl InstanceDescriptor {
    pub fn is_coordinator(&self) -> bool {
        self.segment_id == COORDINATOR_SEGMENT_ID
    }

    /// Short label for log lines, e.g. `seg-1@cdw:5432`.
    pub fn describe(&self) -> String {
        format!("seg{}@{}:{}", self.segment_id, self.host, self.port)
    }
}
