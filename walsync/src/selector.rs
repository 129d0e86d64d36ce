//! Target selection: which READY manifest the consumer should drive DR to.
//!
//! "Safest forward" means: never past LATEST, as new as possible, and never
//! below any instance's recovery floor. An operator-supplied explicit target
//! turns every soft disqualification into a hard error.

use std::collections::BTreeMap;

use postgres_wal::Lsn;
use walsync_api::{InstanceDescriptor, Manifest, RestorePointName};

use crate::floor::Floor;

#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    /// Config and manifest disagree about the cluster shape. Fatal: matching
    /// by `segment_id` is the only link between the two sides.
    #[error("segment {segment_id} is configured for DR but absent from manifest {manifest}")]
    TopologyMismatch {
        segment_id: i32,
        manifest: RestorePointName,
    },
    /// An instance's floor could not be established; nothing can be selected
    /// until it is.
    #[error("recovery floor for segment {segment_id} is unknown")]
    FloorUnknown { segment_id: i32 },
    /// Every READY manifest fails some floor (or none exist).
    #[error("no READY manifest satisfies every recovery floor")]
    NoCandidate,
    #[error("requested target {0} has no manifest")]
    TargetNotFound(RestorePointName),
    #[error("requested target {0} is not READY")]
    TargetNotReady(RestorePointName),
    #[error(
        "requested target {target}: floor {floor} of segment {segment_id} is above target LSN {target_lsn}"
    )]
    TargetBelowFloor {
        target: RestorePointName,
        segment_id: i32,
        floor: Lsn,
        target_lsn: Lsn,
    },
}

impl SelectError {
    /// Errors that mean "nothing to do right now" rather than "misconfigured".
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SelectError::NoCandidate | SelectError::FloorUnknown { .. }
        )
    }
}

/// Pick the target manifest.
///
/// `manifests` is the full listing, newest first; non-READY entries are
/// skipped here so callers don't need to pre-filter. `latest` caps the scan:
/// manifests newer than the LATEST pointer are not considered even if READY
/// (the pointer update is the publisher's commit point).
pub fn select_target<'a>(
    manifests: &'a [Manifest],
    latest: Option<&RestorePointName>,
    floors: &BTreeMap<i32, Floor>,
    dr_instances: &[InstanceDescriptor],
    explicit: Option<&RestorePointName>,
) -> Result<&'a Manifest, SelectError> {
    if let Some(wanted) = explicit {
        let manifest = manifests
            .iter()
            .find(|m| &m.restore_point == wanted)
            .ok_or_else(|| SelectError::TargetNotFound(wanted.clone()))?;
        if !manifest.ready {
            return Err(SelectError::TargetNotReady(wanted.clone()));
        }
        // For an explicit target a floor violation is a hard error, not a
        // reason to look elsewhere.
        check_floors(manifest, floors, dr_instances).map_err(|soft| match soft {
            Rejection::Error(e) => e,
            Rejection::BelowFloor { segment_id, floor, target_lsn } => {
                SelectError::TargetBelowFloor {
                    target: wanted.clone(),
                    segment_id,
                    floor,
                    target_lsn,
                }
            }
        })?;
        return Ok(manifest);
    }

    for manifest in manifests {
        if !manifest.ready {
            continue;
        }
        if let Some(latest) = latest {
            if &manifest.restore_point > latest {
                continue;
            }
        }
        match check_floors(manifest, floors, dr_instances) {
            Ok(()) => return Ok(manifest),
            Err(Rejection::Error(e)) => return Err(e),
            Err(Rejection::BelowFloor { .. }) => continue,
        }
    }
    Err(SelectError::NoCandidate)
}

enum Rejection {
    Error(SelectError),
    BelowFloor {
        segment_id: i32,
        floor: Lsn,
        target_lsn: Lsn,
    },
}

fn check_floors(
    manifest: &Manifest,
    floors: &BTreeMap<i32, Floor>,
    dr_instances: &[InstanceDescriptor],
) -> Result<(), Rejection> {
    for instance in dr_instances {
        let Some(target) = manifest.instance(instance.segment_id) else {
            return Err(Rejection::Error(SelectError::TopologyMismatch {
                segment_id: instance.segment_id,
                manifest: manifest.restore_point.clone(),
            }));
        };
        match floors.get(&instance.segment_id) {
            Some(Floor::Known(floor)) => {
                if target.restore_lsn < *floor {
                    return Err(Rejection::BelowFloor {
                        segment_id: instance.segment_id,
                        floor: *floor,
                        target_lsn: target.restore_lsn,
                    });
                }
            }
            Some(Floor::Unknown) | None => {
                return Err(Rejection::Error(SelectError::FloorUnknown {
                    segment_id: instance.segment_id,
                }));
            }
        }
    }
    Ok(())
}
