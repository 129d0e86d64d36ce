//! The consumer's recovery run: five barriered phases across all DR
//! instances.
//!
//! 1. Configure: stop anything running, write the recovery target.
//! 2. Start: launch every instance into standby recovery.
//! 3. Poll-reach: watch replay positions until each instance has reached
//!    its target or gone down.
//! 4. Await-down: wait for `recovery_target_action = 'shutdown'` to take
//!    effect everywhere.
//! 5. Validate: judge each instance's server-log evidence.
//!
//! Phases run in parallel across instances (capped, one worker per
//! segment), and no instance enters phase K+1 while another is still in
//! phase K. The first infrastructure error cancels outstanding workers and
//! aborts the run; only a clean pass through phase 5 can advance durable
//! state.

use std::collections::BTreeMap;
use std::time::Instant;

use postgres_wal::Lsn;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use walsync_api::{
    EvidenceVerdict, InstanceDescriptor, InstanceOutcome, Manifest, ReceiptStatus,
};

use crate::config::SyncConfig;
use crate::evidence;
use crate::fanout;
use crate::standby::{Observation, StandbyInstance};

/// Everything the receipt writer needs to know about a finished (or
/// aborted) run.
#[derive(Debug)]
pub struct RunReport {
    pub status: ReceiptStatus,
    /// Whether `current_restore_point.txt` may advance. Implied by `status`
    /// for `Success`; for the best-effort status it encodes the per-instance
    /// LSN check.
    pub advance: bool,
    pub waited_secs: u64,
    pub per_instance: BTreeMap<i32, InstanceOutcome>,
    pub error: Option<String>,
}

/// Per-instance bookkeeping across phases.
struct Worker {
    standby: StandbyInstance,
    target_lsn: Lsn,
    last_replay: Option<Lsn>,
    down: bool,
    verdict: EvidenceVerdict,
}

pub struct Orchestrator<'a> {
    config: &'a SyncConfig,
    manifest: &'a Manifest,
    cancel: &'a CancellationToken,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a SyncConfig,
        manifest: &'a Manifest,
        cancel: &'a CancellationToken,
    ) -> Orchestrator<'a> {
        Orchestrator {
            config,
            manifest,
            cancel,
        }
    }

    /// Drive every configured DR instance to the manifest's restore point.
    ///
    /// Infallible by design: any failure becomes a `RunReport` with a
    /// non-success status, so the caller always has something to put in the
    /// receipt.
    pub async fn run(&self, dr_instances: &[InstanceDescriptor]) -> RunReport {
        let started = Instant::now();
        let mut workers = match self.build_workers(dr_instances) {
            Ok(workers) => workers,
            Err(e) => return self.aborted(started, &BTreeMap::new(), e),
        };

        // P1: configure. Nothing may be running once this barrier clears.
        if let Err(e) = self.configure_all(&workers).await {
            return self.aborted(started, &outcomes(&workers), e);
        }
        // P2: start everything into standby recovery.
        if let Err(e) = self.start_all(&workers).await {
            return self.aborted(started, &outcomes(&workers), e);
        }
        // P3: poll until every instance reached its target or went down.
        match self.poll_reach(&mut workers, started).await {
            Ok(()) => {}
            Err(PollFailure::Timeout) => {
                warn!(
                    "reach wait cap of {}s expired",
                    self.config.behavior.consumer_wait_reach_secs
                );
                return self.finish(started, &workers, ReceiptStatus::Timeout, false, None);
            }
            Err(PollFailure::Cancelled) => {
                return self.aborted(started, &outcomes(&workers), cancel_error());
            }
            Err(PollFailure::Worker(e)) => return self.aborted(started, &outcomes(&workers), e),
        }
        // P4: wait for recovery_target_action=shutdown to land everywhere.
        match self.await_down(&mut workers, started).await {
            Ok(()) => {}
            Err(PollFailure::Timeout) => {
                return self.finish(started, &workers, ReceiptStatus::Timeout, false, None);
            }
            Err(PollFailure::Cancelled) => {
                return self.aborted(started, &outcomes(&workers), cancel_error());
            }
            Err(PollFailure::Worker(e)) => return self.aborted(started, &outcomes(&workers), e),
        }
        // P5: validate from log evidence.
        self.validate_all(&mut workers).await;

        let (status, advance) = aggregate(
            &workers
                .iter()
                .map(|w| (w.verdict, w.last_replay, w.target_lsn))
                .collect::<Vec<_>>(),
            self.config.behavior.allow_lsn_only_advance,
        );
        self.finish(started, &workers, status, advance, None)
    }

    fn build_workers(&self, dr_instances: &[InstanceDescriptor]) -> anyhow::Result<Vec<Worker>> {
        dr_instances
            .iter()
            .map(|descriptor| {
                let Some(target) = self.manifest.instance(descriptor.segment_id) else {
                    anyhow::bail!(
                        "segment {} is configured for DR but absent from manifest {}",
                        descriptor.segment_id,
                        self.manifest.restore_point
                    );
                };
                Ok(Worker {
                    standby: StandbyInstance::new(self.config, descriptor),
                    target_lsn: target.restore_lsn,
                    last_replay: None,
                    down: false,
                    verdict: EvidenceVerdict::NoEvidence,
                })
            })
            .collect()
    }

    async fn configure_all(&self, workers: &[Worker]) -> anyhow::Result<()> {
        info!(
            "configuring {} instances for {}",
            workers.len(),
            self.manifest.restore_point
        );
        let tasks: Vec<_> = workers
            .iter()
            .map(|worker| async move {
                worker.standby.stop().await?;
                worker.standby.apply_recovery_target(worker.target_lsn).await
            })
            .collect();
        fanout::try_run_all(tasks).await?;
        Ok(())
    }

    async fn start_all(&self, workers: &[Worker]) -> anyhow::Result<()> {
        let tasks: Vec<_> = workers
            .iter()
            .map(|worker| async move { worker.standby.start().await })
            .collect();
        fanout::try_run_all(tasks).await?;
        Ok(())
    }

    /// One barriered poll pass over all instances, recorded into the
    /// workers.
    async fn observe_all(&self, workers: &mut [Worker]) -> anyhow::Result<()> {
        let observations = fanout::try_run_all(
            workers
                .iter()
                .map(|worker| async move { worker.standby.observe().await })
                .collect(),
        )
        .await?;
        for (worker, observation) in workers.iter_mut().zip(observations) {
            match observation {
                Observation::Replaying(lsn) => {
                    worker.last_replay = Some(lsn);
                    worker.down = false;
                }
                Observation::UpNoAnswer => worker.down = false,
                Observation::Down => worker.down = true,
            }
        }
        Ok(())
    }

    async fn poll_reach(&self, workers: &mut [Worker], started: Instant) -> Result<(), PollFailure> {
        loop {
            self.observe_all(workers).await.map_err(PollFailure::Worker)?;
            for worker in workers.iter() {
                info!(
                    "{}: replay={} down={} target={}",
                    worker.standby.describe(),
                    worker
                        .last_replay
                        .map(|lsn| lsn.to_string())
                        .unwrap_or_else(|| "?".into()),
                    worker.down,
                    worker.target_lsn,
                );
            }
            let all_settled = workers.iter().all(|worker| {
                worker.down || worker.last_replay.is_some_and(|lsn| lsn >= worker.target_lsn)
            });
            if all_settled {
                return Ok(());
            }
            self.poll_sleep(started).await?;
        }
    }

    async fn await_down(&self, workers: &mut [Worker], started: Instant) -> Result<(), PollFailure> {
        loop {
            self.observe_all(workers).await.map_err(PollFailure::Worker)?;
            if workers.iter().all(|worker| worker.down) {
                return Ok(());
            }
            self.poll_sleep(started).await?;
        }
    }

    async fn poll_sleep(&self, started: Instant) -> Result<(), PollFailure> {
        if started.elapsed() >= self.config.wait_reach_cap() {
            return Err(PollFailure::Timeout);
        }
        tokio::select! {
            _ = tokio::time::sleep(self.config.reach_poll_interval()) => Ok(()),
            _ = self.cancel.cancelled() => Err(PollFailure::Cancelled),
        }
    }

    async fn validate_all(&self, workers: &mut [Worker]) {
        let target_name = &self.manifest.restore_point;
        let window = self.config.behavior.evidence_tail_bytes;
        let verdicts = fanout::run_all(
            workers
                .iter()
                .map(|worker| async move {
                    evidence::validate_instance(
                        worker.standby.shell(),
                        worker.standby.data_dir(),
                        target_name,
                        worker.target_lsn,
                        window,
                    )
                    .await
                })
                .collect(),
        )
        .await;
        for (worker, verdict) in workers.iter_mut().zip(verdicts) {
            info!("{}: evidence {verdict:?}", worker.standby.describe());
            worker.verdict = verdict;
        }
    }

    fn finish(
        &self,
        started: Instant,
        workers: &[Worker],
        status: ReceiptStatus,
        advance: bool,
        error: Option<String>,
    ) -> RunReport {
        RunReport {
            status,
            advance,
            waited_secs: started.elapsed().as_secs(),
            per_instance: outcomes(workers),
            error,
        }
    }

    fn aborted(
        &self,
        started: Instant,
        per_instance: &BTreeMap<i32, InstanceOutcome>,
        error: anyhow::Error,
    ) -> RunReport {
        warn!("run aborted: {error:#}");
        RunReport {
            status: ReceiptStatus::Aborted,
            advance: false,
            waited_secs: started.elapsed().as_secs(),
            per_instance: per_instance.clone(),
            error: Some(format!("{error:#}")),
        }
    }
}

enum PollFailure {
    Timeout,
    Cancelled,
    Worker(anyhow::Error),
}

fn cancel_error() -> anyhow::Error {
    anyhow::anyhow!("shutdown requested before the run completed")
}

fn outcomes(workers: &[Worker]) -> BTreeMap<i32, InstanceOutcome> {
    workers
        .iter()
        .map(|worker| {
            (
                worker.standby.segment_id(),
                InstanceOutcome {
                    replay_lsn: worker.last_replay,
                    down: worker.down,
                    log_evidence: worker.verdict,
                },
            )
        })
        .collect()
}

/// The final verdict: receipt status plus whether state may advance.
///
/// Name evidence is authoritative and a wrong name anywhere fails the run
/// outright. Instances that went down without any signature are accepted as
/// best-effort only when their last observed replay position reached the
/// target, unless `allow_lsn_only_advance` opts into the laxer policy.
fn aggregate(
    instances: &[(EvidenceVerdict, Option<Lsn>, Lsn)],
    allow_lsn_only_advance: bool,
) -> (ReceiptStatus, bool) {
    if instances
        .iter()
        .any(|(verdict, _, _)| *verdict == EvidenceVerdict::WrongPoint)
    {
        return (ReceiptStatus::StoppedWrongPoint, false);
    }
    if instances.iter().all(|(verdict, _, _)| verdict.is_ok()) {
        return (ReceiptStatus::Success, true);
    }
    // Some instance has no evidence. Fall back to the LSN observations.
    let all_reached = instances.iter().all(|(verdict, replay, target)| {
        verdict.is_ok() || replay.is_some_and(|lsn| lsn >= *target)
    });
    if all_reached || allow_lsn_only_advance {
        (ReceiptStatus::ReachedThenShutdownBestEffort, true)
    } else {
        // Down below target with nothing in the log: recovery ran out of
        // WAL before the restore point.
        (ReceiptStatus::WalMissing, false)
    }
}
