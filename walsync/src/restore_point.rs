//! Restore-point creation on the Primary coordinator.
//!
//! One session issues the cluster-wide restore-point call and, unless
//! disabled, a WAL switch so the segment containing the new point gets
//! handed to the archiver immediately instead of whenever it fills up.

use std::collections::BTreeMap;

use anyhow::Context;
use postgres_wal::Lsn;
use tokio_postgres::Client;
use tracing::info;

use walsync_api::RestorePointName;

#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    /// The name is already taken; the caller regenerates and retries.
    #[error("restore point {0} already exists")]
    DuplicateRestorePoint(RestorePointName),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug)]
pub struct RestorePoint {
    pub name: RestorePointName,
    pub timeline_id: u32,
    /// Recorded restore LSN per segment id, coordinator included.
    pub lsn_by_segment: BTreeMap<i32, Lsn>,
}

/// Record `name` across the whole cluster.
pub async fn create(
    client: &Client,
    name: &RestorePointName,
    switch_wal: bool,
) -> Result<RestorePoint, CreateError> {
    let rows = client
        .query(
            "SELECT gp_segment_id::int4, restore_lsn::text FROM gp_create_restore_point($1)",
            &[&name.as_str()],
        )
        .await
        .map_err(|e| {
            if e.to_string().contains("already exists") {
                CreateError::DuplicateRestorePoint(name.clone())
            } else {
                CreateError::Other(
                    anyhow::Error::new(e).context(format!("could not create restore point {name}")),
                )
            }
        })?;

    let mut lsn_by_segment = BTreeMap::new();
    for row in rows {
        let segment_id: i32 = row.try_get(0).map_err(anyhow::Error::new)?;
        let lsn_text: String = row.try_get(1).map_err(anyhow::Error::new)?;
        let lsn: Lsn = lsn_text
            .parse()
            .with_context(|| format!("segment {segment_id} returned unparseable LSN {lsn_text:?}"))?;
        lsn_by_segment.insert(segment_id, lsn);
    }
    if lsn_by_segment.is_empty() {
        return Err(anyhow::anyhow!("gp_create_restore_point returned no rows").into());
    }

    if switch_wal {
        client
            .query("SELECT gp_segment_id FROM gp_switch_wal()", &[])
            .await
            .context("could not switch WAL after restore point creation")?;
    }

    let timeline_id: i32 = client
        .query_one("SELECT timeline_id::int4 FROM pg_control_checkpoint()", &[])
        .await
        .context("could not read timeline id")?
        .try_get(0)
        .map_err(anyhow::Error::new)?;
    let timeline_id =
        u32::try_from(timeline_id).with_context(|| format!("negative timeline id {timeline_id}"))?;

    info!(
        "created restore point {name} on timeline {timeline_id} across {} instances",
        lsn_by_segment.len()
    );
    Ok(RestorePoint {
        name: name.clone(),
        timeline_id,
        lsn_by_segment,
    })
}
