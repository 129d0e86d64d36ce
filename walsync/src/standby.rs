//! Control of one DR instance: process stop/start/liveness through
//! `pg_ctl`, recovery-target configuration, and replay-position polling.
//!
//! The orchestrator schedules at most one worker per segment, so a
//! `StandbyInstance` can assume it is the only writer of its data
//! directory's config and the only sender of process-control commands.

use anyhow::{bail, Context};
use camino::Utf8PathBuf;
use postgres_wal::Lsn;
use tracing::{debug, info};

use walsync_api::InstanceDescriptor;

use crate::config::SyncConfig;
use crate::db::{self, ConnectSpec};
use crate::recovery_conf::apply_recovery_target;
use crate::shell::{require_success, InstanceShell};

/// `pg_ctl status` exit code when no server is running in the data dir.
const PG_STATUS_NOT_RUNNING: i32 = 3;
/// `pg_ctl status` exit code when the data dir is missing or unreadable.
const PG_STATUS_NO_DATADIR: i32 = 4;

const STOP_TIMEOUT_SECS: u32 = 120;

const REPLAY_LSN_SQL: &str = "SELECT pg_last_wal_replay_lsn()::text";

/// What one poll of an instance saw.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    Replaying(Lsn),
    /// Up, but not answering the replay query yet (still starting, or
    /// between recovery and shutdown).
    UpNoAnswer,
    Down,
}

pub struct StandbyInstance {
    descriptor: InstanceDescriptor,
    shell: InstanceShell,
    pg_ctl: Utf8PathBuf,
    connect: ConnectSpec,
}

impl StandbyInstance {
    pub fn new(config: &SyncConfig, descriptor: &InstanceDescriptor) -> StandbyInstance {
        StandbyInstance {
            shell: InstanceShell::for_instance(descriptor),
            pg_ctl: config.dr.gp_home.join("bin/pg_ctl"),
            connect: ConnectSpec {
                host: descriptor.host.clone(),
                port: descriptor.port,
                db: config.dr.db.clone(),
                user: config.dr.user.clone(),
                connect_timeout: config.sql_connect_timeout(),
            },
            descriptor: descriptor.clone(),
        }
    }

    pub fn segment_id(&self) -> i32 {
        self.descriptor.segment_id
    }

    pub fn describe(&self) -> String {
        self.descriptor.describe()
    }

    pub async fn is_running(&self) -> anyhow::Result<bool> {
        let output = self
            .shell
            .output(&[
                self.pg_ctl.as_str(),
                "status",
                "-D",
                self.descriptor.data_dir.as_str(),
            ])
            .await?;
        if output.status.success() {
            return Ok(true);
        }
        match output.status.code() {
            Some(PG_STATUS_NOT_RUNNING) => Ok(false),
            Some(PG_STATUS_NO_DATADIR) => bail!(
                "data directory {} of {} is not accessible",
                self.descriptor.data_dir,
                self.describe()
            ),
            _ => bail!(
                "pg_ctl status for {} failed with {}: {}",
                self.describe(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        }
    }

    /// Fast, waited shutdown. A no-op if the instance is already down.
    pub async fn stop(&self) -> anyhow::Result<()> {
        if !self.is_running().await? {
            return Ok(());
        }
        info!("stopping {}", self.describe());
        let timeout = STOP_TIMEOUT_SECS.to_string();
        let output = self
            .shell
            .output(&[
                self.pg_ctl.as_str(),
                "stop",
                "-D",
                self.descriptor.data_dir.as_str(),
                "-m",
                "fast",
                "-w",
                "-t",
                timeout.as_str(),
            ])
            .await?;
        require_success(&format!("stopping {}", self.describe()), &output)?;
        Ok(())
    }

    /// Launch into standby recovery. Deliberately unwaited: with
    /// `recovery_target_action = 'shutdown'` the server may finish recovery
    /// and exit before `pg_ctl -w` would consider it started, so readiness
    /// is the poll loop's business, not the launcher's.
    pub async fn start(&self) -> anyhow::Result<()> {
        info!("starting {} in standby recovery", self.describe());
        let startup_log = self.descriptor.data_dir.join("walsync_startup.log");
        let output = self
            .shell
            .output(&[
                self.pg_ctl.as_str(),
                "start",
                "-D",
                self.descriptor.data_dir.as_str(),
                "-W",
                "-l",
                startup_log.as_str(),
            ])
            .await?;
        require_success(&format!("starting {}", self.describe()), &output)?;
        Ok(())
    }

    /// Write the standby marker and rewrite the recovery-target keys of
    /// `postgresql.conf`. The instance must be stopped; start-up is the
    /// orchestrator's next phase.
    pub async fn apply_recovery_target(&self, target: Lsn) -> anyhow::Result<()> {
        let standby_signal = self.descriptor.data_dir.join("standby.signal");
        self.shell
            .create_marker(&standby_signal)
            .await
            .with_context(|| format!("could not write standby marker for {}", self.describe()))?;

        let conf_path = self.descriptor.data_dir.join("postgresql.conf");
        let conf_text = self
            .shell
            .read_file(&conf_path)
            .await
            .with_context(|| format!("could not read config of {}", self.describe()))?;
        let rewritten = apply_recovery_target(&conf_text, target);
        self.shell
            .write_file_atomic(&conf_path, &rewritten)
            .await
            .with_context(|| format!("could not rewrite config of {}", self.describe()))?;
        info!(
            "{} configured to stop at {target} and shut down",
            self.describe()
        );
        Ok(())
    }

    /// One poll: replay position if the instance answers SQL, liveness
    /// otherwise.
    pub async fn observe(&self) -> anyhow::Result<Observation> {
        match db::connect(&self.connect).await {
            Ok(client) => match db::query_lsn(&client, REPLAY_LSN_SQL).await {
                Ok(Some(lsn)) => Ok(Observation::Replaying(lsn)),
                Ok(None) => Ok(Observation::UpNoAnswer),
                Err(e) => {
                    debug!("{} replay query failed: {e:#}", self.describe());
                    Ok(Observation::UpNoAnswer)
                }
            },
            Err(_) => {
                if self.is_running().await? {
                    Ok(Observation::UpNoAnswer)
                } else {
                    Ok(Observation::Down)
                }
            }
        }
    }

    pub fn data_dir(&self) -> &camino::Utf8Path {
        &self.descriptor.data_dir
    }

    pub fn shell(&self) -> &InstanceShell {
        &self.shell
    }
}
