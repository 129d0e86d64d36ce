//! The `status` subcommand: a read-only view assembled purely from on-disk
//! artifacts (manifests, LATEST, receipts, state and pid files). No SQL, so
//! it is safe to run while either daemon is mid-cycle.

use anyhow::Context;
use chrono::{DateTime, Utc};
use comfy_table::{presets::NOTHING, Cell, Table};
use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;

use walsync_api::{Manifest, ReceiptStatus, RestorePointName};

use crate::config::SyncConfig;
use crate::manifest_store::ManifestStore;
use crate::pid_file::{self, PidStatus};
use crate::receipts::ReceiptStore;
use crate::state::ConsumerState;
use crate::Side;

const HISTORY_LIMIT: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum StatusFormat {
    Table,
    Json,
    Prometheus,
}

#[derive(Serialize)]
pub struct StatusReport {
    pub side: String,
    pub daemon_running: bool,
    pub daemon_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_ready: Option<RestorePointName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_updated_at_utc: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_manifest: Option<ManifestSummary>,
    pub manifest_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_restore_point: Option<RestorePointName>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub receipts: Vec<ReceiptSummary>,
}

#[derive(Serialize)]
pub struct ManifestSummary {
    pub restore_point: RestorePointName,
    pub created_at_utc: DateTime<Utc>,
    pub ready: bool,
    pub instances: usize,
    pub instances_present: usize,
}

#[derive(Serialize)]
pub struct ReceiptSummary {
    pub target_restore_point: RestorePointName,
    pub checked_at_utc: DateTime<Utc>,
    pub status: ReceiptStatus,
    pub waited_secs: u64,
}

impl From<&Manifest> for ManifestSummary {
    fn from(manifest: &Manifest) -> ManifestSummary {
        ManifestSummary {
            restore_point: manifest.restore_point.clone(),
            created_at_utc: manifest.created_at_utc,
            ready: manifest.ready,
            instances: manifest.instances.len(),
            instances_present: manifest.instances.iter().filter(|i| i.present).count(),
        }
    }
}

/// Assemble the report for one side.
pub async fn gather(
    config: &SyncConfig,
    side: Side,
    include_history: bool,
) -> anyhow::Result<StatusReport> {
    let store = ManifestStore::from_config(config)?;
    let latest = store.read_latest().await?;
    let names = store.list().await?;
    let newest_manifest = match names.first() {
        Some(name) => Some(ManifestSummary::from(&store.get(name).await?)),
        None => None,
    };

    let (running, pid) = match pid_file::status(&config.pid_path(side))? {
        PidStatus::Running(pid) => (true, Some(pid)),
        PidStatus::NotRunning => (false, None),
    };

    let mut report = StatusReport {
        side: side.as_str().to_owned(),
        daemon_running: running,
        daemon_pid: pid,
        latest_ready: latest.as_ref().map(|p| p.restore_point.clone()),
        latest_updated_at_utc: latest.as_ref().map(|p| p.updated_at_utc),
        newest_manifest,
        manifest_count: names.len(),
        current_restore_point: None,
        receipts: Vec::new(),
    };

    if side == Side::Dr {
        report.current_restore_point =
            ConsumerState::new(config.current_restore_point_path()).read()?;
        if include_history {
            report.receipts = ReceiptStore::new(config.receipts_dir())
                .list_recent(HISTORY_LIMIT)
                .await?
                .into_iter()
                .map(|(_, receipt)| ReceiptSummary {
                    target_restore_point: receipt.target_restore_point,
                    checked_at_utc: receipt.checked_at_utc,
                    status: receipt.status,
                    waited_secs: receipt.waited_secs,
                })
                .collect();
        }
    }
    Ok(report)
}

pub fn render(report: &StatusReport, format: StatusFormat) -> anyhow::Result<String> {
    match format {
        StatusFormat::Table => Ok(render_table(report)),
        StatusFormat::Json => {
            serde_json::to_string_pretty(report).context("could not serialize status")
        }
        StatusFormat::Prometheus => render_prometheus(report),
    }
}

fn render_table(report: &StatusReport) -> String {
    let mut table = Table::new();
    table.load_preset(NOTHING);
    let mut row = |key: &str, value: String| {
        table.add_row(vec![Cell::new(key), Cell::new(value)]);
    };

    row("mode", report.side.clone());
    row(
        "daemon",
        match report.daemon_pid {
            Some(pid) => format!("running (pid {pid})"),
            None => "not running".into(),
        },
    );
    row(
        "latest ready",
        report
            .latest_ready
            .as_ref()
            .map(|name| name.to_string())
            .unwrap_or_else(|| "-".into()),
    );
    if let Some(manifest) = &report.newest_manifest {
        row(
            "newest manifest",
            format!(
                "{} ({}, {}/{} present)",
                manifest.restore_point,
                if manifest.ready { "READY" } else { "NOT READY" },
                manifest.instances_present,
                manifest.instances,
            ),
        );
    }
    row("manifests", report.manifest_count.to_string());
    if report.side == "dr" {
        row(
            "current restore point",
            report
                .current_restore_point
                .as_ref()
                .map(|name| name.to_string())
                .unwrap_or_else(|| "-".into()),
        );
    }

    let mut out = table.to_string();
    if !report.receipts.is_empty() {
        let mut history = Table::new();
        history.load_preset(NOTHING);
        history.set_header(vec!["target", "checked at (utc)", "status", "waited"]);
        for receipt in &report.receipts {
            history.add_row(vec![
                receipt.target_restore_point.to_string(),
                receipt.checked_at_utc.format("%Y-%m-%d %H:%M:%S").to_string(),
                format!("{:?}", receipt.status),
                format!("{}s", receipt.waited_secs),
            ]);
        }
        out.push_str("\n\nrecent receipts:\n");
        out.push_str(&history.to_string());
    }
    out
}

fn render_prometheus(report: &StatusReport) -> anyhow::Result<String> {
    let registry = Registry::new();

    let daemon_up = IntGauge::new("walsync_daemon_up", "Whether the daemon is running")?;
    daemon_up.set(report.daemon_running as i64);
    registry.register(Box::new(daemon_up))?;

    let manifests = IntGauge::new("walsync_manifests_total", "Number of manifests on disk")?;
    manifests.set(report.manifest_count as i64);
    registry.register(Box::new(manifests))?;

    if let (Some(name), Some(updated)) = (&report.latest_ready, &report.latest_updated_at_utc) {
        let latest = IntGaugeVec::new(
            Opts::new(
                "walsync_latest_ready_timestamp_seconds",
                "Creation time of the restore point LATEST points at",
            ),
            &["restore_point"],
        )?;
        latest
            .with_label_values(&[name.as_str()])
            .set(name.timestamp().timestamp());
        registry.register(Box::new(latest))?;

        let updated_gauge = IntGauge::new(
            "walsync_latest_updated_timestamp_seconds",
            "When LATEST was last replaced",
        )?;
        updated_gauge.set(updated.timestamp());
        registry.register(Box::new(updated_gauge))?;
    }

    if let Some(current) = &report.current_restore_point {
        let gauge = IntGaugeVec::new(
            Opts::new(
                "walsync_current_restore_point_timestamp_seconds",
                "Creation time of the restore point DR last consumed",
            ),
            &["restore_point"],
        )?;
        gauge
            .with_label_values(&[current.as_str()])
            .set(current.timestamp().timestamp());
        registry.register(Box::new(gauge))?;
    }

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("could not encode metrics")?;
    String::from_utf8(buffer).context("metrics output was not UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> StatusReport {
        StatusReport {
            side: "dr".into(),
            daemon_running: true,
            daemon_pid: Some(4242),
            latest_ready: Some("sync_point_20260201_181406".parse().unwrap()),
            latest_updated_at_utc: Some("2026-02-01T18:15:00Z".parse().unwrap()),
            newest_manifest: None,
            manifest_count: 7,
            current_restore_point: Some("sync_point_20260201_180000".parse().unwrap()),
            receipts: vec![ReceiptSummary {
                target_restore_point: "sync_point_20260201_180000".parse().unwrap(),
                checked_at_utc: "2026-02-01T18:05:00Z".parse().unwrap(),
                status: ReceiptStatus::Success,
                waited_secs: 33,
            }],
        }
    }

    #[test]
    fn table_mentions_the_essentials() {
        let rendered = render(&report(), StatusFormat::Table).unwrap();
        assert!(rendered.contains("running (pid 4242)"));
        assert!(rendered.contains("sync_point_20260201_181406"));
        assert!(rendered.contains("current restore point"));
        assert!(rendered.contains("recent receipts"));
    }

    #[test]
    fn json_round_trips_field_names() {
        let rendered = render(&report(), StatusFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["side"], "dr");
        assert_eq!(value["manifest_count"], 7);
        assert_eq!(value["receipts"][0]["status"], "success");
    }

    #[test]
    fn prometheus_exposition_has_gauges() {
        let rendered = render(&report(), StatusFormat::Prometheus).unwrap();
        assert!(rendered.contains("walsync_daemon_up 1"));
        assert!(rendered.contains("walsync_manifests_total 7"));
        assert!(rendered
            .contains("walsync_latest_ready_timestamp_seconds{restore_point=\"sync_point_20260201_181406\"}"));
    }
}
