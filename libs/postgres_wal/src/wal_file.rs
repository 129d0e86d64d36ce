//! Archival WAL segment file naming.
//!
//! Postgres names an archived segment with a 24-hex-character triplet of
//! `(timeline, logical xlog id, segment within xlog id)`, where the split
//! between the last two components depends on the WAL segment size the
//! cluster was initialized with.

use crate::lsn::Lsn;

const MIN_WAL_SEGMENT_SIZE: u64 = 1024 * 1024;
const MAX_WAL_SEGMENT_SIZE: u64 = 1024 * 1024 * 1024;

/// One logical xlog id covers 2^32 bytes of WAL.
const XLOG_ID_BYTES: u64 = 1 << 32;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid WAL segment size {0}: must be a power of two between 1 MiB and 1 GiB")]
pub struct InvalidSegmentSize(pub u64);

pub fn validate_wal_segment_size(seg_size: u64) -> Result<(), InvalidSegmentSize> {
    if seg_size.is_power_of_two() && (MIN_WAL_SEGMENT_SIZE..=MAX_WAL_SEGMENT_SIZE).contains(&seg_size)
    {
        Ok(())
    } else {
        Err(InvalidSegmentSize(seg_size))
    }
}

/// The archive file name of the segment containing `lsn`.
///
/// An LSN exactly on a segment boundary names the segment that starts at
/// that position.
pub fn wal_file_name(timeline_id: u32, lsn: Lsn, seg_size: u64) -> String {
    let segno = lsn.segment_number(seg_size);
    let segments_per_xlog_id = XLOG_ID_BYTES / seg_size;
    format!(
        "{:08X}{:08X}{:08X}",
        timeline_id,
        segno / segments_per_xlog_id,
        segno % segments_per_xlog_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_size_bounds() {
        for ok in [1 << 20, 16 << 20, 64 << 20, 1 << 30] {
            assert!(validate_wal_segment_size(ok).is_ok());
        }
        for bad in [0, 512 * 1024, (16 << 20) + 1, 48 << 20, 2 << 30] {
            assert_eq!(validate_wal_segment_size(bad), Err(InvalidSegmentSize(bad)));
        }
    }

    #[test]
    fn names_match_postgres_for_default_segment_size() {
        let seg = 16 << 20;
        assert_eq!(wal_file_name(1, Lsn(0), seg), "000000010000000000000000");
        assert_eq!(
            wal_file_name(1, "0/2000000".parse().unwrap(), seg),
            "000000010000000000000002"
        );
        // Last segment of one xlog id, then the first of the next.
        assert_eq!(
            wal_file_name(1, "0/FF000000".parse().unwrap(), seg),
            "0000000100000000000000FF"
        );
        assert_eq!(
            wal_file_name(1, "1/0".parse().unwrap(), seg),
            "000000010000000100000000"
        );
    }

    #[test]
    fn names_match_postgres_for_greenplum_segment_size() {
        // 64 MiB segments: 64 segments per xlog id.
        let seg = 64 << 20;
        assert_eq!(
            wal_file_name(1, "9/E40000C8".parse().unwrap(), seg),
            "000000010000000900000039"
        );
        assert_eq!(
            wal_file_name(3, "9/EC0000C8".parse().unwrap(), seg),
            "00000003000000090000003B"
        );
    }

    #[test]
    fn boundary_lsn_names_starting_segment() {
        let seg = 16 << 20;
        let boundary: Lsn = "0/3000000".parse().unwrap();
        assert_eq!(boundary.segment_offset(seg), 0);
        assert_eq!(
            wal_file_name(1, boundary, seg),
            "000000010000000000000003"
        );
    }

    #[test]
    fn full_range_is_representable() {
        let seg = 1 << 20;
        assert_eq!(
            wal_file_name(0xDEADBEEF, Lsn(u64::MAX), seg),
            format!("DEADBEEF{:08X}{:08X}", 0xFFFF_FFFFu64, 0xFFFu64)
        );
    }
}
