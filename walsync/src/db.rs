//! SQL session plumbing shared by both daemons.
//!
//! All LSN-valued queries cast to text server-side and parse with our own
//! [`Lsn`] type, so the wire representation is the same one that appears in
//! manifests and logs.

use std::time::Duration;

use anyhow::Context;
use postgres_wal::Lsn;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

const CONNECT_RETRIES: u32 = 3;
const CONNECT_RETRY_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct ConnectSpec {
    pub host: String,
    pub port: u16,
    pub db: String,
    pub user: String,
    pub connect_timeout: Duration,
}

impl ConnectSpec {
    fn describe(&self) -> String {
        format!("{}@{}:{}/{}", self.user, self.host, self.port, self.db)
    }
}

/// Open a session, driving the connection on a background task.
pub async fn connect(spec: &ConnectSpec) -> anyhow::Result<Client> {
    let mut config = tokio_postgres::Config::new();
    config
        .host(&spec.host)
        .port(spec.port)
        .dbname(&spec.db)
        .user(&spec.user)
        .connect_timeout(spec.connect_timeout);

    let (client, connection) = config
        .connect(NoTls)
        .await
        .with_context(|| format!("could not connect to {}", spec.describe()))?;
    let describe = spec.describe();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("connection to {describe} closed: {e}");
        }
    });
    Ok(client)
}

/// [`connect`] with bounded retries and fixed backoff, for callers that
/// should absorb transient connection failures (the publisher at cycle
/// start, the consumer talking to the coordinator).
pub async fn connect_with_retries(spec: &ConnectSpec) -> anyhow::Result<Client> {
    let mut attempt = 1;
    loop {
        match connect(spec).await {
            Ok(client) => return Ok(client),
            Err(e) if attempt < CONNECT_RETRIES => {
                warn!(
                    "connection attempt {attempt}/{CONNECT_RETRIES} to {} failed: {e:#}",
                    spec.describe()
                );
                tokio::time::sleep(CONNECT_RETRY_BACKOFF).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Run a query whose single row, single column is an LSN rendered as text.
/// A NULL result maps to `None`.
pub async fn query_lsn(client: &Client, sql: &str) -> anyhow::Result<Option<Lsn>> {
    let row = client
        .query_one(sql, &[])
        .await
        .with_context(|| format!("query failed: {sql}"))?;
    let raw: Option<String> = row.try_get(0).with_context(|| format!("bad result for: {sql}"))?;
    raw.map(|text| {
        text.parse::<Lsn>()
            .with_context(|| format!("{sql} returned unparseable LSN {text:?}"))
    })
    .transpose()
}
