//! Archive proving: establish, per manifest instance, whether the WAL
//! segment named by the manifest is durable in the archive.
//!
//! The verifier is pluggable. Precedence per segment: a per-segment command
//! template, then the global template, then a plain local-filesystem check.
//! Probing is capped parallel and per-instance tolerant: an absent file is a
//! normal result and a failing verifier process counts as absent for that
//! instance only.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

use walsync_api::{Manifest, ManifestInstance};

use crate::config::SyncConfig;
use crate::fanout;
use crate::shell::{render_template, run_rendered};

#[derive(Clone, Debug)]
pub enum WalVerifier {
    LocalFs { archive_dir: Utf8PathBuf },
    Command { template: String },
}

impl WalVerifier {
    /// Pick the verifier for one segment according to the configured
    /// precedence.
    pub fn for_segment(config: &SyncConfig, segment_id: i32) -> WalVerifier {
        if let Some(template) = config.behavior.wal_check_commands.get(&segment_id) {
            return WalVerifier::Command {
                template: template.clone(),
            };
        }
        if let Some(template) = &config.behavior.wal_check_command {
            return WalVerifier::Command {
                template: template.clone(),
            };
        }
        WalVerifier::LocalFs {
            archive_dir: config.archive.archive_dir.clone(),
        }
    }

    /// Probe one instance's WAL file. `Err` means the verifier itself could
    /// not run; the caller maps that to absent.
    pub async fn probe(
        &self,
        instance: &ManifestInstance,
        archive_dir: &Utf8Path,
    ) -> anyhow::Result<bool> {
        match self {
            WalVerifier::LocalFs { .. } => {
                Ok(tokio::fs::try_exists(&instance.archive_source_path).await?)
            }
            WalVerifier::Command { template } => {
                let rendered = render_template(
                    template,
                    &[
                        ("archive_dir", archive_dir.as_str()),
                        ("wal_filename", &instance.wal_filename),
                        ("wal_path", instance.archive_source_path.as_str()),
                        ("host", &instance.archive_source_host),
                    ],
                );
                let output = run_rendered(&rendered).await?;
                let present =
                    output.status.success() && !output.stdout.iter().all(u8::is_ascii_whitespace);
                if !output.status.success() {
                    warn!(
                        "verifier for segment {} exited with {}: {}",
                        instance.segment_id,
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                }
                Ok(present)
            }
        }
    }
}

/// Probe every instance of `manifest` in one pass and return the instance
/// list with `present` updated. The manifest may transition to READY only if
/// all instances were present in this same pass.
pub async fn prove(config: &SyncConfig, manifest: &Manifest) -> Vec<ManifestInstance> {
    let probes: Vec<_> = manifest
        .instances
        .iter()
        .map(|instance| {
            let verifier = WalVerifier::for_segment(config, instance.segment_id);
            let archive_dir = &config.archive.archive_dir;
            async move {
                let mut updated = instance.clone();
                updated.present = match verifier.probe(instance, archive_dir).await {
                    Ok(present) => present,
                    Err(e) => {
                        // Verifier breakage must not abort the other probes;
                        // it only keeps this manifest NOT READY.
                        warn!(
                            "could not verify WAL for segment {}: {e:#}",
                            instance.segment_id
                        );
                        false
                    }
                };
                debug!(
                    "segment {} wal {} present={}",
                    updated.segment_id, updated.wal_filename, updated.present
                );
                updated
            }
        })
        .collect();
    fanout::run_all(probes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    fn manifest_with(instances: Vec<ManifestInstance>) -> Manifest {
        Manifest {
            restore_point: "sync_point_20260201_181406".parse().unwrap(),
            created_at_utc: "2026-02-01T18:14:06Z".parse().unwrap(),
            timeline_id: 1,
            ready: false,
            instances,
        }
    }

    fn instance(segment_id: i32, archive_path: Utf8PathBuf) -> ManifestInstance {
        ManifestInstance {
            segment_id,
            host: "sdw1".into(),
            port: 6000,
            data_dir: "/data/gpseg0".into(),
            restore_lsn: "9/EC0000C8".parse().unwrap(),
            wal_filename: "00000001000000090000003B".into(),
            archive_source_host: "sdw1".into(),
            archive_source_path: archive_path,
            present: false,
        }
    }

    #[test]
    fn verifier_precedence() {
        let mut config = SyncConfig::default();
        assert!(matches!(
            WalVerifier::for_segment(&config, 0),
            WalVerifier::LocalFs { .. }
        ));

        config.behavior.wal_check_command = Some("global {wal_path}".into());
        assert!(matches!(
            WalVerifier::for_segment(&config, 0),
            WalVerifier::Command { template } if template == "global {wal_path}"
        ));

        config
            .behavior
            .wal_check_commands
            .insert(0, "per-segment {wal_path}".into());
        assert!(matches!(
            WalVerifier::for_segment(&config, 0),
            WalVerifier::Command { template } if template == "per-segment {wal_path}"
        ));
        // Other segments still use the global template.
        assert!(matches!(
            WalVerifier::for_segment(&config, 1),
            WalVerifier::Command { template } if template == "global {wal_path}"
        ));
    }

    #[tokio::test]
    async fn local_fs_probe_checks_archive_path() {
        let dir = tempdir().unwrap();
        let config = SyncConfig::test_config(dir.path());
        let present_path = dir.path().join("00000001000000090000003B");
        std::fs::write(&present_path, b"wal").unwrap();

        let manifest = manifest_with(vec![
            instance(-1, present_path),
            instance(0, dir.path().join("missing")),
        ]);
        let updated = prove(&config, &manifest).await;
        assert!(updated[0].present);
        assert!(!updated[1].present);
    }

    #[tokio::test]
    async fn command_probe_requires_success_and_output() {
        let present = WalVerifier::Command {
            template: "echo {wal_filename}".into(),
        };
        let silent = WalVerifier::Command {
            template: "true".into(),
        };
        let failing = WalVerifier::Command {
            template: "echo oops >&2; false".into(),
        };
        let inst = instance(0, "/archive/seg0/00000001000000090000003B".into());
        let archive_dir = Utf8Path::new("/archive");
        assert!(present.probe(&inst, archive_dir).await.unwrap());
        assert!(!silent.probe(&inst, archive_dir).await.unwrap());
        assert!(!failing.probe(&inst, archive_dir).await.unwrap());
    }

    #[tokio::test]
    async fn one_bad_verifier_does_not_poison_the_pass() {
        let dir = tempdir().unwrap();
        let mut config = SyncConfig::test_config(dir.path());
        let good_path = dir.path().join("good");
        std::fs::write(&good_path, b"wal").unwrap();
        // Segment 0 gets a verifier that cannot even be parsed by sh.
        config
            .behavior
            .wal_check_commands
            .insert(0, "exit 127".into());

        let manifest = manifest_with(vec![instance(-1, good_path), instance(0, "/x".into())]);
        let updated = prove(&config, &manifest).await;
        assert!(updated[0].present);
        assert!(!updated[1].present);
    }
}
