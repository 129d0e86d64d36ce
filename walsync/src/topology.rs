//! Topology resolution against the Primary coordinator.
//!
//! Re-read on every publisher cycle; no caching, so segment moves and
//! rebalances are picked up at the next cycle boundary.

use anyhow::{bail, Context};
use tokio_postgres::Client;

use walsync_api::InstanceDescriptor;

/// Primary (`role = 'p'`) and up (`status = 'u'`) instances only: a restore
/// point is recorded on the acting primaries, and their WAL streams are the
/// ones the archive receives.
const TOPOLOGY_SQL: &str = "\
    SELECT content::int4, hostname, port::int4, datadir \
    FROM gp_segment_configuration \
    WHERE role = 'p' AND status = 'u' \
    ORDER BY content";

/// Enumerate the coordinator (content `-1`) and every live content segment.
pub async fn resolve(client: &Client) -> anyhow::Result<Vec<InstanceDescriptor>> {
    let rows = client
        .query(TOPOLOGY_SQL, &[])
        .await
        .context("could not enumerate segment configuration")?;

    let mut instances = Vec::with_capacity(rows.len());
    let mut seen = std::collections::BTreeSet::new();
    for row in rows {
        let segment_id: i32 = row.try_get(0)?;
        let host: String = row.try_get(1)?;
        let port: i32 = row.try_get(2)?;
        let data_dir: String = row.try_get(3)?;

        if !seen.insert(segment_id) {
            bail!("inconsistent topology: segment {segment_id} listed twice by the coordinator");
        }
        instances.push(InstanceDescriptor {
            segment_id,
            host,
            port: u16::try_from(port)
                .with_context(|| format!("segment {segment_id} has invalid port {port}"))?,
            data_dir: data_dir.into(),
            // Publisher-side instances are only ever addressed over SQL and
            // through archive verifier templates, never a local shell.
            is_local: false,
        });
    }

    if instances.is_empty() {
        bail!("coordinator returned no live instances");
    }
    if !instances.iter().any(|i| i.is_coordinator()) {
        bail!("inconsistent topology: coordinator entry missing from segment configuration");
    }
    Ok(instances)
}
