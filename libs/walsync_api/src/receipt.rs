use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use postgres_wal::Lsn;
use serde::{Deserialize, Serialize};

use crate::name::RestorePointName;

/// Audit record of one consumer attempt against one target restore point.
///
/// Receipts are append-only: a repeat attempt against the same target gets a
/// numbered sibling file, never an overwrite. Together with the manifest they
/// allow a run to be reconstructed without access to the cluster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    /// Where DR stood before the attempt, if anywhere.
    pub current_restore_point: Option<RestorePointName>,
    pub target_restore_point: RestorePointName,
    pub checked_at_utc: DateTime<Utc>,
    /// Recovery mode used; only `shutdown` exists today.
    pub mode: RecoveryMode,
    pub status: ReceiptStatus,
    pub waited_secs: u64,
    /// Target LSN per segment id, from the manifest.
    pub target_lsns: BTreeMap<i32, Lsn>,
    /// Final observation per segment id.
    pub per_instance: BTreeMap<i32, InstanceOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    /// Every instance stopped at the target with positive evidence.
    Success,
    /// Every instance reached the target, but at least one shut down without
    /// leaving a stop signature in its log.
    ReachedThenShutdownBestEffort,
    /// No READY manifest satisfied every recovery floor.
    FloorAboveTarget,
    /// An instance ran out of WAL below the target.
    WalMissing,
    /// Log evidence names a different restore point.
    StoppedWrongPoint,
    /// The reach wait cap expired.
    Timeout,
    /// The run was interrupted before a verdict.
    Aborted,
}

impl ReceiptStatus {
    /// Whether `current_restore_point.txt` may move for a receipt with this
    /// status. `ReachedThenShutdownBestEffort` additionally requires the
    /// per-instance LSN check the orchestrator performs before writing the
    /// receipt.
    pub fn is_success_class(self) -> bool {
        matches!(
            self,
            ReceiptStatus::Success | ReceiptStatus::ReachedThenShutdownBestEffort
        )
    }
}

/// What the orchestrator last saw of one instance, recorded in the receipt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceOutcome {
    /// Last replay position observed while the instance was up.
    pub replay_lsn: Option<Lsn>,
    pub down: bool,
    pub log_evidence: EvidenceVerdict,
}

/// Verdict of the server-log scan for one instance.
///
/// The restore-point name in the log is authoritative; the LSN is a sanity
/// check. An instance that stopped below the target LSN can still pass if the
/// log names the target restore point (the point's records may simply sit
/// lower in that instance's WAL stream).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceVerdict {
    OkByName,
    OkByLsn,
    WrongPoint,
    NoEvidence,
}

impl EvidenceVerdict {
    pub fn is_ok(self) -> bool {
        matches!(self, EvidenceVerdict::OkByName | EvidenceVerdict::OkByLsn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipt_json_shape() {
        let mut target_lsns = BTreeMap::new();
        target_lsns.insert(-1, "9/E40000C8".parse().unwrap());
        target_lsns.insert(0, "9/EC0000C8".parse().unwrap());
        let mut per_instance = BTreeMap::new();
        per_instance.insert(
            -1,
            InstanceOutcome {
                replay_lsn: Some("9/E40000C8".parse().unwrap()),
                down: true,
                log_evidence: EvidenceVerdict::OkByName,
            },
        );
        let receipt = Receipt {
            current_restore_point: None,
            target_restore_point: "sync_point_20260201_181406".parse().unwrap(),
            checked_at_utc: "2026-02-01T18:20:00Z".parse().unwrap(),
            mode: RecoveryMode::Shutdown,
            status: ReceiptStatus::Success,
            waited_secs: 42,
            target_lsns,
            per_instance,
            error: None,
        };

        let json = serde_json::to_value(&receipt).unwrap();
        assert_eq!(json["mode"], "shutdown");
        assert_eq!(json["status"], "success");
        // Integer map keys become JSON object keys.
        assert_eq!(json["target_lsns"]["-1"], "9/E40000C8");
        assert_eq!(json["per_instance"]["-1"]["log_evidence"], "ok_by_name");
        // The error field is omitted, not null.
        assert!(json.get("error").is_none());

        let back: Receipt = serde_json::from_value(json).unwrap();
        assert_eq!(back, receipt);
    }

    #[test]
    fn status_classes() {
        assert!(ReceiptStatus::Success.is_success_class());
        assert!(ReceiptStatus::ReachedThenShutdownBestEffort.is_success_class());
        for failing in [
            ReceiptStatus::FloorAboveTarget,
            ReceiptStatus::WalMissing,
            ReceiptStatus::StoppedWrongPoint,
            ReceiptStatus::Timeout,
            ReceiptStatus::Aborted,
        ] {
            assert!(!failing.is_success_class());
        }
    }
}
