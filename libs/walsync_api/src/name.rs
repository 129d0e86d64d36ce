use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

const PREFIX: &str = "sync_point_";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// The name of a cluster-wide restore point: `sync_point_YYYYMMDD_HHMMSS`,
/// UTC wall clock at creation time.
///
/// Names are globally unique within a deployment (the clock has second
/// granularity and the creator retries on collision) and their lexicographic
/// order is their chronological order, which the target selector and the
/// monotonic-advance check both rely on.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RestorePointName(String);

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid restore point name {0:?}")]
pub struct InvalidName(String);

impl RestorePointName {
    pub fn generate(now: DateTime<Utc>) -> RestorePointName {
        RestorePointName(format!("{PREFIX}{}", now.format(TIMESTAMP_FORMAT)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The creation timestamp embedded in the name.
    pub fn timestamp(&self) -> DateTime<Utc> {
        // Validated in the constructor, so this cannot fail.
        NaiveDateTime::parse_from_str(&self.0[PREFIX.len()..], TIMESTAMP_FORMAT)
            .map(|naive| naive.and_utc())
            .unwrap_or_default()
    }

    /// The manifest file name for this restore point.
    pub fn manifest_file_name(&self) -> String {
        format!("{}.json", self.0)
    }

    /// Inverse of [`manifest_file_name`]: recognize a manifest file.
    ///
    /// [`manifest_file_name`]: RestorePointName::manifest_file_name
    pub fn from_manifest_file_name(file_name: &str) -> Option<RestorePointName> {
        file_name.strip_suffix(".json")?.parse().ok()
    }
}

impl FromStr for RestorePointName {
    type Err = InvalidName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix(PREFIX).ok_or_else(|| InvalidName(s.into()))?;
        NaiveDateTime::parse_from_str(rest, TIMESTAMP_FORMAT)
            .map_err(|_| InvalidName(s.into()))?;
        Ok(RestorePointName(s.to_owned()))
    }
}

impl TryFrom<String> for RestorePointName {
    type Error = InvalidName;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RestorePointName> for String {
    fn from(name: RestorePointName) -> String {
        name.0
    }
}

impl fmt::Display for RestorePointName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn generate_and_parse() {
        let at = Utc.with_ymd_and_hms(2026, 2, 1, 18, 14, 6).unwrap();
        let name = RestorePointName::generate(at);
        assert_eq!(name.as_str(), "sync_point_20260201_181406");
        assert_eq!(name.timestamp(), at);

        let parsed: RestorePointName = "sync_point_20260201_181406".parse().unwrap();
        assert_eq!(parsed, name);
    }

    #[test]
    fn rejects_malformed_names() {
        for bad in [
            "sync_point_",
            "sync_point_2026_0201",
            "sync_point_20260201-181406",
            "checkpoint_20260201_181406",
            "sync_point_20261301_181406",
        ] {
            assert!(bad.parse::<RestorePointName>().is_err(), "{bad:?}");
        }
    }

    #[test]
    fn name_order_is_chronological() {
        let older: RestorePointName = "sync_point_20260201_180000".parse().unwrap();
        let newer: RestorePointName = "sync_point_20260201_181406".parse().unwrap();
        assert!(older < newer);
        assert!(older.timestamp() < newer.timestamp());
    }

    #[test]
    fn manifest_file_name_round_trip() {
        let name: RestorePointName = "sync_point_20260201_181406".parse().unwrap();
        assert_eq!(name.manifest_file_name(), "sync_point_20260201_181406.json");
        assert_eq!(
            RestorePointName::from_manifest_file_name("sync_point_20260201_181406.json"),
            Some(name)
        );
        assert_eq!(RestorePointName::from_manifest_file_name("LATEST.json"), None);
        assert_eq!(
            RestorePointName::from_manifest_file_name("sync_point_20260201_181406.tmp"),
            None
        );
    }
}
