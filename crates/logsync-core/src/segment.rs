//! Segment file naming
//!
//! A segment is named `<offset>.<timestamp>`: the start offset zero-padded to
//! 20 digits, so sorting names sorts offsets, and the UTC creation time as
//! `YYYYMMDDhhmmss`.

use crate::{Error, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};

/// Width of the offset field
pub const OFFSET_DIGITS: usize = 20;

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
const TIMESTAMP_DIGITS: usize = 14;

/// Build the file name of a segment starting at `offset`
pub fn encode_name(offset: u64, created: DateTime<Utc>) -> String {
    format!(
        "{:020}.{}",
        offset,
        created.format(TIMESTAMP_FORMAT)
    )
}

/// Start offset encoded in a segment name
pub fn decode_offset(name: &str) -> Result<u64> {
    let (offset, _) = split(name)?;
    offset
        .parse()
        .map_err(|e| Error::invalid_segment_name(format!("{}: {}", name, e)))
}

/// Creation time encoded in a segment name
pub fn decode_timestamp(name: &str) -> Result<DateTime<Utc>> {
    let (_, timestamp) = split(name)?;
    NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| Error::invalid_segment_name(format!("{}: {}", name, e)))
}

/// A segment file of a topic directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    offset: u64,
    path: PathBuf,
}

impl SegmentFile {
    /// Segment at `path`, decoding its start offset from the file name
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let offset = decode_offset(file_name(&path))?;
        Ok(Self { offset, path })
    }

    /// Start offset of the segment
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Full path of the segment
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name of the segment
    pub fn name(&self) -> &str {
        file_name(&self.path)
    }

    /// Creation time encoded in the name
    pub fn created(&self) -> Result<DateTime<Utc>> {
        decode_timestamp(self.name())
    }

    /// Current size on disk
    pub fn size(&self) -> Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }
}

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
}

fn split(name: &str) -> Result<(&str, &str)> {
    let (offset, timestamp) = name
        .split_once('.')
        .ok_or_else(|| Error::invalid_segment_name(format!("{}: missing separator", name)))?;

    if offset.len() != OFFSET_DIGITS || !offset.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::invalid_segment_name(format!(
            "{}: offset must be {} digits",
            name, OFFSET_DIGITS
        )));
    }
    if timestamp.len() != TIMESTAMP_DIGITS || !timestamp.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::invalid_segment_name(format!(
            "{}: timestamp must be {} digits",
            name, TIMESTAMP_DIGITS
        )));
    }
    Ok((offset, timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_name_layout() {
        let created = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        let name = encode_name(1024, created);
        assert_eq!(name, "00000000000000001024.20240309070501");
        assert_eq!(decode_offset(&name).unwrap(), 1024);
        assert_eq!(decode_timestamp(&name).unwrap(), created);
    }

    #[test]
    fn test_lexicographic_order_matches_offsets() {
        let created = Utc::now();
        let mut names: Vec<String> = [99_999u64, 7, 1 << 40, 0, 1024]
            .iter()
            .map(|offset| encode_name(*offset, created))
            .collect();
        names.sort();
        let offsets: Vec<u64> = names.iter().map(|n| decode_offset(n).unwrap()).collect();
        assert_eq!(offsets, vec![0, 7, 1024, 99_999, 1 << 40]);
    }

    #[test]
    fn test_max_offset_fits() {
        let name = encode_name(u64::MAX, Utc::now());
        assert_eq!(decode_offset(&name).unwrap(), u64::MAX);
    }

    #[test]
    fn test_segment_file_from_path() {
        let created = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap();
        let path = PathBuf::from("/data/orders").join(encode_name(2048, created));
        let segment = SegmentFile::from_path(&path).unwrap();
        assert_eq!(segment.offset(), 2048);
        assert_eq!(segment.name(), "00000000000000002048.20231231235959");
        assert_eq!(segment.created().unwrap(), created);
        assert!(SegmentFile::from_path("/data/orders/README").is_err());
    }

    #[test]
    fn test_malformed_names_rejected() {
        for name in [
            "",
            "notasegment",
            "1024.20240309070501",
            "0000000000000000102x.20240309070501",
            "00000000000000001024.2024",
            "00000000000000001024.20241309070501",
            "00000000000000001024.20240309070501.tmp",
        ] {
            let offset = decode_offset(name);
            let timestamp = decode_timestamp(name);
            assert!(
                offset.is_err() || timestamp.is_err(),
                "accepted {:?}",
                name
            );
        }
        assert!(matches!(
            decode_offset("garbage"),
            Err(Error::InvalidSegmentName(_))
        ));
    }
}
