//! Receipt persistence.
//!
//! One receipt per consumer attempt, named after the target restore point.
//! Receipts are never overwritten: a repeat attempt against the same target
//! gets a numbered sibling. An auditor can therefore replay the full history
//! of attempts from the directory listing alone.

use anyhow::Context;
use camino::Utf8PathBuf;
use tracing::info;

use walsync_api::{Receipt, RestorePointName};

use crate::atomic_file::write_atomic;

const RECEIPT_SUFFIX: &str = ".receipt.json";

pub struct ReceiptStore {
    dir: Utf8PathBuf,
}

impl ReceiptStore {
    pub fn new(dir: Utf8PathBuf) -> ReceiptStore {
        ReceiptStore { dir }
    }

    /// Durably write `receipt`, returning the path it landed at.
    pub async fn write(&self, receipt: &Receipt) -> anyhow::Result<Utf8PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("could not create {:?}", self.dir))?;
        let path = self.next_free_path(&receipt.target_restore_point).await?;
        let body = serde_json::to_vec_pretty(receipt)?;
        write_atomic(&path, &body).await?;
        info!("receipt written to {path} with status {:?}", receipt.status);
        Ok(path)
    }

    async fn next_free_path(&self, target: &RestorePointName) -> anyhow::Result<Utf8PathBuf> {
        let first = self.dir.join(format!("{target}{RECEIPT_SUFFIX}"));
        if !tokio::fs::try_exists(&first).await? {
            return Ok(first);
        }
        for attempt in 1.. {
            let path = self.dir.join(format!("{target}.{attempt}{RECEIPT_SUFFIX}"));
            if !tokio::fs::try_exists(&path).await? {
                return Ok(path);
            }
        }
        unreachable!("attempt counter is unbounded");
    }

    /// Recent receipts, newest attempt first, for `status --include-history`.
    pub async fn list_recent(&self, limit: usize) -> anyhow::Result<Vec<(Utf8PathBuf, Receipt)>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("could not list {:?}", self.dir)),
        };
        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if !name.ends_with(RECEIPT_SUFFIX) {
                continue;
            }
            let path = self.dir.join(&name);
            let text = tokio::fs::read_to_string(&path).await?;
            let receipt: Receipt = serde_json::from_str(&text)
                .with_context(|| format!("could not parse receipt {path:?}"))?;
            found.push((path, receipt));
        }
        found.sort_by(|(_, a), (_, b)| b.checked_at_utc.cmp(&a.checked_at_utc));
        found.truncate(limit);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use walsync_api::{ReceiptStatus, RecoveryMode};

    fn receipt(target: &str, checked_at: &str) -> Receipt {
        Receipt {
            current_restore_point: None,
            target_restore_point: target.parse().unwrap(),
            checked_at_utc: checked_at.parse().unwrap(),
            mode: RecoveryMode::Shutdown,
            status: ReceiptStatus::Success,
            waited_secs: 10,
            target_lsns: BTreeMap::new(),
            per_instance: BTreeMap::new(),
            error: None,
        }
    }

    #[tokio::test]
    async fn repeat_attempts_get_numbered_files() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = ReceiptStore::new(dir.path().to_owned());
        let r = receipt("sync_point_20260201_181406", "2026-02-01T18:20:00Z");

        let first = store.write(&r).await.unwrap();
        let second = store.write(&r).await.unwrap();
        let third = store.write(&r).await.unwrap();

        assert!(first.as_str().ends_with("sync_point_20260201_181406.receipt.json"));
        assert!(second.as_str().ends_with("sync_point_20260201_181406.1.receipt.json"));
        assert!(third.as_str().ends_with("sync_point_20260201_181406.2.receipt.json"));
        // The first file is untouched by later attempts.
        let original: Receipt =
            serde_json::from_str(&std::fs::read_to_string(&first).unwrap()).unwrap();
        assert_eq!(original, r);
    }

    #[tokio::test]
    async fn history_is_newest_first_and_bounded() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = ReceiptStore::new(dir.path().to_owned());
        store
            .write(&receipt("sync_point_20260201_180000", "2026-02-01T18:05:00Z"))
            .await
            .unwrap();
        store
            .write(&receipt("sync_point_20260201_181406", "2026-02-01T18:20:00Z"))
            .await
            .unwrap();
        store
            .write(&receipt("sync_point_20260131_120000", "2026-01-31T12:05:00Z"))
            .await
            .unwrap();

        let recent = store.list_recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(
            recent[0].1.target_restore_point,
            "sync_point_20260201_181406".parse().unwrap()
        );
        assert_eq!(
            recent[1].1.target_restore_point,
            "sync_point_20260201_180000".parse().unwrap()
        );

        // Empty directory: empty history.
        let empty = ReceiptStore::new(dir.path().join("missing"));
        assert!(empty.list_recent(10).await.unwrap().is_empty());
    }
}
