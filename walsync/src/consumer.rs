//! The DR-side daemon: select a target, orchestrate the recovery run,
//! record the receipt, and advance durable state only on a clean verdict.

use anyhow::Context;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use walsync_api::{Manifest, Receipt, RecoveryMode, RestorePointName};

use crate::config::SyncConfig;
use crate::fanout;
use crate::floor;
use crate::manifest_store::ManifestStore;
use crate::orchestrator::Orchestrator;
use crate::receipts::ReceiptStore;
use crate::selector::{select_target, SelectError};
use crate::state::ConsumerState;

/// What one consumer run amounted to, for exit-code mapping and daemon
/// logging.
#[derive(Debug)]
pub enum RunOutcome {
    /// DR advanced to this restore point.
    Advanced(RestorePointName),
    /// Already at the selected target; nothing ran, no receipt written.
    AlreadyCurrent(RestorePointName),
    /// Nothing selectable right now (no READY manifest ≥ floors, floor
    /// unknown, or selection newer than the current state not available).
    NoTarget(String),
    /// A run executed but did not earn advancement; the receipt has the
    /// details.
    ValidationFailed(RestorePointName),
    /// An explicit `--target` was rejected outright.
    TargetRejected(String),
}

/// Run one target-selection-plus-recovery pass.
pub async fn run_once(
    config: &SyncConfig,
    explicit_target: Option<&RestorePointName>,
    cancel: &CancellationToken,
) -> anyhow::Result<RunOutcome> {
    anyhow::ensure!(
        !config.dr.instances.is_empty(),
        "dr.instances is empty; nothing to synchronize"
    );

    let store = ManifestStore::from_config(config)?;
    let state = ConsumerState::new(config.current_restore_point_path());
    let current = state.read()?;

    // An explicit target we already sit at needs no floors, no manifests, no
    // receipt.
    if let (Some(current), Some(wanted)) = (&current, explicit_target) {
        if current == wanted {
            info!("already at {current}");
            return Ok(RunOutcome::AlreadyCurrent(current.clone()));
        }
    }

    let manifests = load_manifests(&store).await?;
    let latest = store.read_latest().await?.map(|pointer| pointer.restore_point);

    let floors = floor::compute_all(config).await;
    info!("recovery floors: {}", floor::describe(&floors));

    let selected = match select_target(
        &manifests,
        latest.as_ref(),
        &floors,
        &config.dr.instances,
        explicit_target,
    ) {
        Ok(manifest) => manifest,
        // Config/manifest disagreement is fatal regardless of how the
        // target was chosen.
        Err(e @ SelectError::TopologyMismatch { .. }) => return Err(e.into()),
        Err(e) if explicit_target.is_some() => {
            return Ok(RunOutcome::TargetRejected(format!("{e}")));
        }
        Err(e) if e.is_transient() => return Ok(RunOutcome::NoTarget(format!("{e}"))),
        Err(e) => return Err(e.into()),
    };

    // Idempotence: re-running against the target we already consumed is a
    // no-op and writes no receipt.
    if current.as_ref() == Some(&selected.restore_point) {
        info!("already at {}", selected.restore_point);
        return Ok(RunOutcome::AlreadyCurrent(selected.restore_point.clone()));
    }
    // State only moves forward in restore-point time.
    if let Some(current) = &current {
        if selected.restore_point < *current {
            let reason = format!(
                "selected target {} is older than current state {current}",
                selected.restore_point
            );
            if explicit_target.is_some() {
                return Ok(RunOutcome::TargetRejected(reason));
            }
            return Ok(RunOutcome::NoTarget(reason));
        }
    }

    info!(
        "driving DR from {} to {}",
        current
            .as_ref()
            .map(|name| name.to_string())
            .unwrap_or_else(|| "scratch".into()),
        selected.restore_point
    );
    let report = Orchestrator::new(config, selected, cancel)
        .run(&config.dr.instances)
        .await;

    let receipt = Receipt {
        current_restore_point: current,
        target_restore_point: selected.restore_point.clone(),
        checked_at_utc: Utc::now(),
        mode: RecoveryMode::Shutdown,
        status: report.status,
        waited_secs: report.waited_secs,
        target_lsns: selected
            .instances
            .iter()
            .map(|instance| (instance.segment_id, instance.restore_lsn))
            .collect(),
        per_instance: report.per_instance,
        error: report.error,
    };
    ReceiptStore::new(config.receipts_dir())
        .write(&receipt)
        .await
        .context("could not write receipt")?;

    if report.advance {
        state.advance(&selected.restore_point).await?;
        Ok(RunOutcome::Advanced(selected.restore_point.clone()))
    } else {
        warn!(
            "run against {} ended with {:?}; state unchanged",
            selected.restore_point, report.status
        );
        Ok(RunOutcome::ValidationFailed(selected.restore_point.clone()))
    }
}

/// Fetch every listed manifest, newest first. Unreadable individual
/// manifests are skipped with a warning so one corrupt file cannot wedge
/// selection forever.
async fn load_manifests(store: &ManifestStore) -> anyhow::Result<Vec<Manifest>> {
    let names = store.list().await?;
    let fetches: Vec<_> = names
        .iter()
        .map(|name| async move {
            match store.get(name).await {
                Ok(manifest) => Some(manifest),
                Err(e) => {
                    warn!("skipping manifest {name}: {e:#}");
                    None
                }
            }
        })
        .collect();
    Ok(fanout::run_all(fetches).await.into_iter().flatten().collect())
}

/// Daemon loop: runs separated by `consumer_sleep_secs` until cancelled, or
/// a single pass with `once`.
pub async fn run(
    config: &SyncConfig,
    once: bool,
    explicit_target: Option<&RestorePointName>,
    cancel: &CancellationToken,
) -> anyhow::Result<RunOutcome> {
    loop {
        let outcome = run_once(config, explicit_target, cancel).await;
        match &outcome {
            Ok(RunOutcome::Advanced(name)) => info!("DR is now at {name}"),
            Ok(RunOutcome::AlreadyCurrent(name)) => info!("nothing to do, DR is at {name}"),
            Ok(RunOutcome::NoTarget(reason)) => info!("no target available: {reason}"),
            Ok(RunOutcome::ValidationFailed(name)) => {
                warn!("validation failed for {name}; see the receipt")
            }
            Ok(RunOutcome::TargetRejected(reason)) => warn!("target rejected: {reason}"),
            Err(e) => warn!("consumer run failed: {e:#}"),
        }
        if once {
            return outcome;
        }
        if cancel.is_cancelled() {
            info!("consumer shutting down");
            return outcome;
        }
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(
                config.behavior.consumer_sleep_secs,
            )) => {}
            _ = cancel.cancelled() => {
                info!("consumer shutting down");
                return outcome;
            }
        }
    }
}
