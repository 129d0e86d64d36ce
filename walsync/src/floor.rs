//! Recovery floors: the minimum LSN at which each DR instance may safely
//! stop.
//!
//! A live instance answers over SQL from `pg_control_recovery()`; a stopped
//! one is inspected offline with `pg_controldata`. An instance whose floor
//! cannot be established disqualifies every target until it is started once
//! or its data directory becomes inspectable.

use std::collections::BTreeMap;

use postgres_wal::{ControlFileData, Lsn};
use tracing::{debug, warn};

use walsync_api::InstanceDescriptor;

use crate::config::SyncConfig;
use crate::db::{self, ConnectSpec};
use crate::fanout;
use crate::shell::{require_success, InstanceShell};

const MIN_RECOVERY_SQL: &str =
    "SELECT min_recovery_end_location::text FROM pg_control_recovery()";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Floor {
    Known(Lsn),
    Unknown,
}

impl Floor {
    /// Whether a target at `lsn` satisfies this floor. An unknown floor
    /// satisfies nothing.
    pub fn admits(self, lsn: Lsn) -> bool {
        match self {
            Floor::Known(floor) => lsn >= floor,
            Floor::Unknown => false,
        }
    }
}

/// Compute floors for every DR instance, in parallel.
pub async fn compute_all(config: &SyncConfig) -> BTreeMap<i32, Floor> {
    let tasks: Vec<_> = config
        .dr
        .instances
        .iter()
        .map(|instance| async move {
            let floor = compute_one(config, instance).await;
            (instance.segment_id, floor)
        })
        .collect();
    fanout::run_all(tasks).await.into_iter().collect()
}

async fn compute_one(config: &SyncConfig, instance: &InstanceDescriptor) -> Floor {
    // Prefer the live view: it reflects replay that has happened since the
    // control file was last flushed.
    let spec = ConnectSpec {
        host: instance.host.clone(),
        port: instance.port,
        db: config.dr.db.clone(),
        user: config.dr.user.clone(),
        connect_timeout: config.sql_connect_timeout(),
    };
    match db::connect(&spec).await {
        Ok(client) => match db::query_lsn(&client, MIN_RECOVERY_SQL).await {
            Ok(lsn) => {
                let floor = lsn.filter(|lsn| lsn.is_valid()).unwrap_or(Lsn::INVALID);
                debug!("floor for {} from SQL: {floor}", instance.describe());
                return Floor::Known(floor);
            }
            Err(e) => {
                warn!(
                    "could not query floor on live instance {}: {e:#}",
                    instance.describe()
                );
                return Floor::Unknown;
            }
        },
        Err(e) => {
            debug!(
                "{} not accepting SQL ({e:#}), inspecting control data",
                instance.describe()
            );
        }
    }

    match controldata_floor(config, instance).await {
        Ok(floor) => {
            debug!("floor for {} from control data: {floor:?}", instance.describe());
            floor
        }
        Err(e) => {
            warn!(
                "could not inspect control data of {}: {e:#}",
                instance.describe()
            );
            Floor::Unknown
        }
    }
}

async fn controldata_floor(
    config: &SyncConfig,
    instance: &InstanceDescriptor,
) -> anyhow::Result<Floor> {
    let shell = InstanceShell::for_instance(instance);
    let pg_controldata = config.dr.gp_home.join("bin/pg_controldata");
    let output = shell
        .output(&[pg_controldata.as_str(), instance.data_dir.as_str()])
        .await?;
    let stdout = require_success(
        &format!("pg_controldata for {}", instance.describe()),
        &output,
    )?;
    let data = ControlFileData::parse(&stdout);
    // 0/0 in the control file means the instance never needs to replay past
    // anything: every target is admissible.
    Ok(Floor::Known(
        data.min_recovery_end_location()?.unwrap_or(Lsn::INVALID),
    ))
}

/// Render a floor map for log lines.
pub fn describe(floors: &BTreeMap<i32, Floor>) -> String {
    floors
        .iter()
        .map(|(segment_id, floor)| match floor {
            Floor::Known(lsn) => format!("seg{segment_id}={lsn}"),
            Floor::Unknown => format!("seg{segment_id}=?"),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
