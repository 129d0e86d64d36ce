//! The Primary-side daemon: one cycle names a restore point, derives each
//! instance's WAL file, proves the archive has them, and publishes the
//! manifest. LATEST moves only after a READY manifest is durable.
//!
//! Ordering within a cycle is strict: restore-point creation, WAL-name
//! computation, archive probe, manifest write, LATEST update. A failure
//! anywhere aborts the cycle with no observable side effect beyond a NOT
//! READY manifest, which the next cycles keep re-probing.

use anyhow::Context;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use postgres_wal::wal_file_name;
use walsync_api::{InstanceDescriptor, Manifest, ManifestInstance, RestorePointName};

use crate::archive;
use crate::config::SyncConfig;
use crate::db::{self, ConnectSpec};
use crate::manifest_store::ManifestStore;
use crate::restore_point::{self, CreateError};
use crate::topology;

/// How often a name collision is retried with a regenerated name before the
/// cycle gives up. Collisions come from second-granularity clock ties.
const NAME_RETRIES: u32 = 3;

pub struct CycleOutcome {
    pub restore_point: RestorePointName,
    pub ready: bool,
}

fn coordinator_spec(config: &SyncConfig) -> ConnectSpec {
    ConnectSpec {
        host: config.primary.host.clone(),
        port: config.primary.port,
        db: config.primary.db.clone(),
        user: config.primary.user.clone(),
        connect_timeout: config.sql_connect_timeout(),
    }
}

/// Run one publisher cycle.
pub async fn run_cycle(config: &SyncConfig, switch_wal: bool) -> anyhow::Result<CycleOutcome> {
    let store = ManifestStore::from_config(config)?;
    let client = db::connect_with_retries(&coordinator_spec(config)).await?;

    // Give earlier, still NOT READY manifests another chance first: their
    // WAL may have reached the archive since the last cycle.
    reprobe_pending(config, &store).await?;

    let instances = topology::resolve(&client).await?;
    info!("topology: {} instances", instances.len());

    let created = create_with_fresh_name(&store, &client, switch_wal).await?;

    let mut manifest = build_manifest(config, &created, &instances)?;

    // Archive probe, then the manifest write, then (only when READY) the
    // LATEST pointer.
    manifest.instances = archive::prove(config, &manifest).await;
    manifest.ready = manifest.all_present();
    let path = store.put(&manifest).await?;
    if manifest.ready {
        store.write_latest(&manifest.restore_point, &path).await?;
        info!("manifest {} is READY", manifest.restore_point);
    } else {
        let absent: Vec<i32> = manifest
            .instances
            .iter()
            .filter(|i| !i.present)
            .map(|i| i.segment_id)
            .collect();
        warn!(
            "manifest {} is NOT READY, WAL still missing for segments {absent:?}",
            manifest.restore_point
        );
    }
    Ok(CycleOutcome {
        restore_point: manifest.restore_point,
        ready: manifest.ready,
    })
}

async fn create_with_fresh_name(
    store: &ManifestStore,
    client: &tokio_postgres::Client,
    switch_wal: bool,
) -> anyhow::Result<restore_point::RestorePoint> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let name = RestorePointName::generate(Utc::now());
        if store.exists(&name).await? {
            if attempt >= NAME_RETRIES {
                anyhow::bail!("could not find a free restore point name after {attempt} attempts");
            }
            // Wait out the second that produced the clash.
            tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
            continue;
        }
        match restore_point::create(client, &name, switch_wal).await {
            Ok(created) => return Ok(created),
            Err(CreateError::DuplicateRestorePoint(name)) if attempt < NAME_RETRIES => {
                warn!("restore point name {name} collided, regenerating");
                tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
            }
            Err(CreateError::DuplicateRestorePoint(name)) => {
                anyhow::bail!("restore point name {name} kept colliding after {attempt} attempts")
            }
            Err(CreateError::Other(e)) => return Err(e),
        }
    }
}

fn build_manifest(
    config: &SyncConfig,
    created: &restore_point::RestorePoint,
    instances: &[InstanceDescriptor],
) -> anyhow::Result<Manifest> {
    let seg_size = config.wal_segment_size_bytes();
    let manifest_instances = instances
        .iter()
        .map(|instance| {
            let restore_lsn = *created
                .lsn_by_segment
                .get(&instance.segment_id)
                .with_context(|| {
                    format!(
                        "restore point {} has no LSN for segment {}",
                        created.name, instance.segment_id
                    )
                })?;
            let wal_filename = wal_file_name(created.timeline_id, restore_lsn, seg_size);
            // Segments archive independently; identical file names from
            // different WAL streams must not collide in the archive.
            let archive_source_path = config
                .archive
                .archive_dir
                .join(format!("seg{}", instance.segment_id))
                .join(&wal_filename);
            Ok(ManifestInstance {
                segment_id: instance.segment_id,
                host: instance.host.clone(),
                port: instance.port,
                data_dir: instance.data_dir.clone(),
                restore_lsn,
                wal_filename,
                archive_source_host: instance.host.clone(),
                archive_source_path,
                present: false,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(Manifest {
        restore_point: created.name.clone(),
        created_at_utc: Utc::now(),
        timeline_id: created.timeline_id,
        ready: false,
        instances: manifest_instances,
    })
}

/// Re-probe NOT READY manifests and promote any that completed. READY
/// manifests are immutable and skipped, and LATEST only ever moves forward:
/// a late-arriving WAL file must not point LATEST at an older restore point
/// than the one it already names.
async fn reprobe_pending(config: &SyncConfig, store: &ManifestStore) -> anyhow::Result<()> {
    let mut latest = store
        .read_latest()
        .await?
        .map(|pointer| pointer.restore_point);
    for name in store.list().await? {
        let mut manifest = store.get(&name).await?;
        if manifest.ready {
            continue;
        }
        manifest.instances = archive::prove(config, &manifest).await;
        if !manifest.all_present() {
            continue;
        }
        manifest.ready = true;
        let path = store.put(&manifest).await?;
        info!("manifest {name} became READY on re-probe");
        if latest.as_ref().map_or(true, |l| manifest.restore_point > *l) {
            store.write_latest(&manifest.restore_point, &path).await?;
            latest = Some(manifest.restore_point);
        }
    }
    Ok(())
}

/// Daemon loop: cycles separated by `publisher_sleep_secs`, until cancelled
/// or (with `once`) after the first cycle.
pub async fn run(
    config: &SyncConfig,
    once: bool,
    switch_wal: bool,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    loop {
        match run_cycle(config, switch_wal).await {
            Ok(outcome) => info!(
                "cycle complete: {} ({})",
                outcome.restore_point,
                if outcome.ready { "READY" } else { "NOT READY" }
            ),
            Err(e) if once => return Err(e),
            // Connection loss and kin: log, sleep, try again next cycle.
            Err(e) => warn!("publisher cycle failed: {e:#}"),
        }
        if once {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(
                config.behavior.publisher_sleep_secs,
            )) => {}
            _ = cancel.cancelled() => {
                info!("publisher shutting down");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;
    use postgres_wal::Lsn;
    use std::collections::BTreeMap;

    fn two_instance_topology() -> Vec<InstanceDescriptor> {
        vec![
            InstanceDescriptor {
                segment_id: -1,
                host: "cdw".into(),
                port: 5432,
                data_dir: "/data/coordinator/gpseg-1".into(),
                is_local: false,
            },
            InstanceDescriptor {
                segment_id: 0,
                host: "sdw1".into(),
                port: 6000,
                data_dir: "/data/primary/gpseg0".into(),
                is_local: false,
            },
        ]
    }

    fn created_point() -> restore_point::RestorePoint {
        let mut lsn_by_segment = BTreeMap::new();
        lsn_by_segment.insert(-1, "9/E40000C8".parse::<Lsn>().unwrap());
        lsn_by_segment.insert(0, "9/EC0000C8".parse::<Lsn>().unwrap());
        restore_point::RestorePoint {
            name: "sync_point_20260201_181406".parse().unwrap(),
            timeline_id: 3,
            lsn_by_segment,
        }
    }

    #[test]
    fn manifest_derives_wal_names_and_archive_paths() {
        let dir = tempdir().unwrap();
        let config = crate::config::SyncConfig::test_config(dir.path());
        let manifest =
            build_manifest(&config, &created_point(), &two_instance_topology()).unwrap();

        assert_eq!(manifest.timeline_id, 3);
        assert!(!manifest.ready);
        let coordinator = manifest.instance(-1).unwrap();
        assert_eq!(coordinator.wal_filename, "000000030000000900000039");
        assert!(coordinator
            .archive_source_path
            .as_str()
            .ends_with("wal_archive/seg-1/000000030000000900000039"));
        let seg0 = manifest.instance(0).unwrap();
        assert_eq!(seg0.wal_filename, "00000003000000090000003B");
        assert!(!seg0.present);
    }

    #[test]
    fn missing_segment_lsn_is_an_error() {
        let dir = tempdir().unwrap();
        let config = crate::config::SyncConfig::test_config(dir.path());
        let mut created = created_point();
        created.lsn_by_segment.remove(&0);
        assert!(build_manifest(&config, &created, &two_instance_topology()).is_err());
    }

    #[tokio::test]
    async fn readiness_requires_every_wal_file_in_the_same_pass() {
        let dir = tempdir().unwrap();
        let config = crate::config::SyncConfig::test_config(dir.path());
        let mut manifest =
            build_manifest(&config, &created_point(), &two_instance_topology()).unwrap();

        // Only the coordinator's segment is archived.
        let coordinator_path = manifest.instance(-1).unwrap().archive_source_path.clone();
        std::fs::create_dir_all(coordinator_path.parent().unwrap()).unwrap();
        std::fs::write(&coordinator_path, b"wal").unwrap();

        manifest.instances = archive::prove(&config, &manifest).await;
        assert!(!manifest.all_present());

        // Segment 0's WAL arrives; the next pass may flip the manifest.
        let seg0_path = manifest.instance(0).unwrap().archive_source_path.clone();
        std::fs::create_dir_all(seg0_path.parent().unwrap()).unwrap();
        std::fs::write(&seg0_path, b"wal").unwrap();

        manifest.instances = archive::prove(&config, &manifest).await;
        assert!(manifest.all_present());
    }
}
