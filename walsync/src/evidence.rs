//! Server-log evidence that an instance stopped where it was told to.
//!
//! Two signals with two meanings: a restore-point name in the log is
//! authoritative, an LSN is a sanity check. The scan is bounded to the tail
//! of the most recent server log so a chatty instance cannot make
//! validation unboundedly slow.

use camino::{Utf8Path, Utf8PathBuf};
use once_cell::sync::Lazy;
use postgres_wal::Lsn;
use regex::Regex;
use tracing::{debug, warn};

use walsync_api::{EvidenceVerdict, RestorePointName};

use crate::shell::InstanceShell;

/// `recovery stopping at restore point "sync_point_...", time ...`
static STOP_AT_RESTORE_POINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"recovery stopping at restore point "([^"]+)""#).expect("static regex")
});

/// `recovery stopping after WAL location (LSN) "9/EC0000C8"`
static STOP_AFTER_LSN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"recovery stopping (?:before|after) WAL location \(LSN\) "([0-9A-Fa-f]+/[0-9A-Fa-f]+)""#)
        .expect("static regex")
});

/// Subdirectories of a data directory where server logs live, in probe
/// order.
const LOG_DIRS: &[&str] = &["log", "pg_log"];

/// Scan the instance's most recent server log for a stop signature and
/// judge it against the target.
pub async fn validate_instance(
    shell: &InstanceShell,
    data_dir: &Utf8Path,
    target_name: &RestorePointName,
    target_lsn: Lsn,
    window_bytes: u64,
) -> EvidenceVerdict {
    let Some(log_path) = newest_server_log(shell, data_dir).await else {
        warn!("no server log found under {data_dir:?}");
        return EvidenceVerdict::NoEvidence;
    };
    let tail = match shell.read_tail(&log_path, window_bytes).await {
        Ok(tail) => tail,
        Err(e) => {
            warn!("could not read {log_path:?}: {e:#}");
            return EvidenceVerdict::NoEvidence;
        }
    };
    let verdict = judge(&tail, target_name, target_lsn);
    debug!("evidence from {log_path:?}: {verdict:?}");
    verdict
}

async fn newest_server_log(shell: &InstanceShell, data_dir: &Utf8Path) -> Option<Utf8PathBuf> {
    for log_dir in LOG_DIRS {
        match shell.newest_file(&data_dir.join(log_dir)).await {
            Ok(Some(path)) => return Some(path),
            Ok(None) => continue,
            Err(e) => {
                warn!("could not list {log_dir:?} under {data_dir:?}: {e:#}");
            }
        }
    }
    None
}

/// Pure verdict over a log excerpt. The *last* stop signature wins; earlier
/// ones are from previous runs against the same instance.
pub fn judge(log_tail: &str, target_name: &RestorePointName, target_lsn: Lsn) -> EvidenceVerdict {
    let stopped_at_name = STOP_AT_RESTORE_POINT
        .captures_iter(log_tail)
        .last()
        .map(|captures| captures[1].to_owned());
    if let Some(name) = stopped_at_name {
        return if name == target_name.as_str() {
            EvidenceVerdict::OkByName
        } else {
            EvidenceVerdict::WrongPoint
        };
    }

    let stopped_at_lsn = STOP_AFTER_LSN
        .captures_iter(log_tail)
        .last()
        .and_then(|captures| captures[1].parse::<Lsn>().ok());
    match stopped_at_lsn {
        Some(lsn) if lsn == target_lsn => EvidenceVerdict::OkByLsn,
        // A stop signature with a different LSN and no name is not positive
        // evidence of anything; name mismatches alone mean "wrong point".
        Some(_) | None => EvidenceVerdict::NoEvidence,
    }
}
