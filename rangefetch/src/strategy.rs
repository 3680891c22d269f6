//! Policy decisions: how many blocks, what filename, whether a persisted
//! record is eligible for resuming, and how to read the server's verdict
//! on a ranged request.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::breakpoint::block::CHUNKED_CONTENT_LENGTH;
use crate::breakpoint::info::BreakpointInfo;
use crate::download::task::DownloadTask;
use crate::error::{DownloadError, ResumeFailedCause};

const ONE_BLOCK_UPPER_LIMIT: u64 = 1024 * 1024; // 1 MiB
const TWO_BLOCK_UPPER_LIMIT: u64 = 5 * 1024 * 1024;
const THREE_BLOCK_UPPER_LIMIT: u64 = 50 * 1024 * 1024;
const FOUR_BLOCK_UPPER_LIMIT: u64 = 100 * 1024 * 1024;

/// How many blocks to split a resource of `total_length` bytes into.
///
/// The thresholds are load-bearing for resume compatibility: records
/// persisted under one policy must reproduce the same split when the
/// connect is re-run, so these literals must not drift.
pub fn determine_block_count(total_length: u64) -> u32 {
    if total_length < ONE_BLOCK_UPPER_LIMIT {
        1
    } else if total_length < TWO_BLOCK_UPPER_LIMIT {
        2
    } else if total_length < THREE_BLOCK_UPPER_LIMIT {
        3
    } else if total_length < FOUR_BLOCK_UPPER_LIMIT {
        4
    } else {
        5
    }
}

/// Whether the resource may be split at all. Splitting requires byte-range
/// support and a known total length.
pub fn is_use_multi_block(accept_range: bool, total_length: u64) -> bool {
    accept_range && total_length != CHUNKED_CONTENT_LENGTH
}

/// Populates `info` with a fresh block partition of `[0, total_length)`.
/// Every block gets `total_length / count` bytes; the last block absorbs
/// the remainder.
pub fn split_into_blocks(info: &BreakpointInfo, total_length: u64, block_count: u32) {
    info.reset_block_infos();
    let count = u64::from(block_count.max(1));
    let each = total_length / count;
    let mut start = 0u64;
    for index in 0..count {
        let length = if index + 1 == count {
            total_length - start
        } else {
            each
        };
        info.add_block(crate::breakpoint::block::BlockInfo::new(start, length));
        start += length;
    }
}

/// Why a persisted record is, or is not, eligible for resuming before any
/// request is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeCheck {
    Available,
    NotAvailable(ResumeFailedCause),
}

impl ResumeCheck {
    pub fn is_available(&self) -> bool {
        matches!(self, ResumeCheck::Available)
    }

    pub fn cause(&self) -> Option<ResumeFailedCause> {
        match self {
            ResumeCheck::Available => None,
            ResumeCheck::NotAvailable(cause) => Some(*cause),
        }
    }
}

/// Local (offline) resume-eligibility check, run before the first connect.
///
/// `output_seekable` reports whether the output backend can position
/// writes; `pre_allocated` whether the target file was pre-allocated to
/// its final length when the record was created.
pub fn check_local_resume(
    task: &DownloadTask,
    info: &BreakpointInfo,
    output_seekable: bool,
    pre_allocated: bool,
) -> ResumeCheck {
    if info.block_count() == 0 || info.is_chunked() {
        // A chunked record has no trustworthy offset to resume from.
        return ResumeCheck::NotAvailable(ResumeFailedCause::InfoDirty);
    }

    let task_path = task.file_path();
    let info_path = info.target_path();
    match (&task_path, &info_path) {
        (Some(task_path), Some(info_path)) if task_path == info_path => {}
        // A record without a resolved path cannot vouch for any file.
        _ => return ResumeCheck::NotAvailable(ResumeFailedCause::InfoDirty),
    }

    match info_path {
        Some(path) if path.is_file() => {}
        _ => return ResumeCheck::NotAvailable(ResumeFailedCause::FileNotExist),
    }

    if !output_seekable && !(info.is_single_block() && !pre_allocated) {
        return ResumeCheck::NotAvailable(ResumeFailedCause::OutputStreamNotSupport);
    }

    ResumeCheck::Available
}

/// Resets any block whose persisted cursor is inconsistent with its
/// declared range. Dirty blocks restart from their range start rather
/// than being silently trusted.
pub fn reset_block_if_dirty(info: &BreakpointInfo) {
    let blocks = info.blocks_snapshot();
    let total_length = info.total_length();
    let multi_block = blocks.len() > 1;
    for (index, block) in blocks.iter().enumerate() {
        let current = block.current_offset();
        let dirty = if block.is_chunked() {
            false
        } else if index == 0 && multi_block {
            current > block.content_length() || current > total_length
        } else {
            current > block.content_length()
        };
        if dirty {
            debug!(block_index = index, %block, "resetting dirty block");
            block.reset();
        }
    }
}

/// Interprets the server's verdict on a conditional/ranged request.
/// `Some(cause)` means the persisted record must be abandoned and the
/// download restarted from zero.
pub fn precondition_failed_cause(
    response_code: u16,
    total_offset: u64,
    stored_etag: Option<&str>,
    response_etag: Option<&str>,
) -> Option<ResumeFailedCause> {
    if response_code == 412 {
        return Some(ResumeFailedCause::ResponsePreconditionFailed);
    }
    if let (Some(stored), Some(served)) = (stored_etag, response_etag) {
        if stored != served {
            return Some(ResumeFailedCause::ResponseEtagChanged);
        }
    }
    if response_code == 201 && total_offset != 0 {
        return Some(ResumeFailedCause::ResponseCreatedRangeNotFrom0);
    }
    if response_code == 205 && total_offset != 0 {
        return Some(ResumeFailedCause::ResponseResetRangeNotFrom0);
    }
    None
}

/// Whether the server refused to serve the requested range: any code other
/// than 200/206, or a 200 answering a request that already had progress
/// (the server ignored the Range header).
pub fn is_server_canceled(response_code: u16, has_progress: bool) -> bool {
    match response_code {
        206 => false,
        200 => has_progress,
        _ => true,
    }
}

fn quoted_disposition_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"attachment;\s*filename\s*=\s*"([^"]*)""#).unwrap_or_else(|_| unreachable!())
    })
}

fn unquoted_disposition_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"attachment;\s*filename\s*=\s*(.*)").unwrap_or_else(|_| unreachable!())
    })
}

/// Extracts the filename from a `Content-Disposition` header value, if the
/// value carries one. Names that would escape the parent directory are
/// rejected.
pub fn parse_content_disposition(header_value: &str) -> Result<Option<String>, DownloadError> {
    let captured = quoted_disposition_pattern()
        .captures(header_value)
        .or_else(|| unquoted_disposition_pattern().captures(header_value))
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().trim().to_string());

    match captured {
        None => Ok(None),
        Some(name) if name.is_empty() => Ok(None),
        Some(name) => {
            if name.contains("../") || name.contains('/') || name.contains('\0') {
                return Err(DownloadError::Protocol(format!(
                    "refusing served filename {name:?}"
                )));
            }
            Ok(Some(name))
        }
    }
}

/// Decides the target filename once the response is in. Precedence:
/// filename served by the response, then the last path segment of the URL,
/// then a digest of the URL when no segment is usable.
pub fn determine_filename(
    response_filename: Option<&str>,
    url: &str,
) -> Result<String, DownloadError> {
    if let Some(name) = response_filename {
        if !name.is_empty() {
            return Ok(name.to_string());
        }
    }
    if let Some(segment) = url_last_segment(url) {
        return Ok(segment);
    }
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = hasher.finalize();
    Ok(hex_prefix(&digest, 16))
}

fn url_last_segment(url: &str) -> Option<String> {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let without_query = without_fragment.split('?').next().unwrap_or(without_fragment);
    let after_scheme = match without_query.find("://") {
        Some(index) => &without_query[index + 3..],
        None => without_query,
    };
    let segment = after_scheme.rsplit('/').next().unwrap_or("");
    // "https://host/" and "https://host" both yield no usable segment.
    if segment.is_empty() || !after_scheme.contains('/') {
        return None;
    }
    Some(segment.to_string())
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    bytes
        .iter()
        .take(len)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Effective content length of a response: `Content-Length` when present,
/// otherwise the range width of `Content-Range`, otherwise the chunked
/// sentinel.
pub fn determine_content_length(
    content_length: Option<&str>,
    content_range: Option<&str>,
) -> u64 {
    if let Some(value) = content_length {
        if let Ok(length) = value.trim().parse::<u64>() {
            return length;
        }
    }
    if let Some(value) = content_range {
        if let Some(width) = parse_content_range_width(value) {
            return width;
        }
    }
    CHUNKED_CONTENT_LENGTH
}

/// Total resource size declared by `Content-Range: bytes a-b/total`, when
/// the total is not `*`.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (_, total) = rest.split_once('/')?;
    total.trim().parse::<u64>().ok()
}

fn parse_content_range_width(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, _) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    let start = start.trim().parse::<u64>().ok()?;
    let end = end.trim().parse::<u64>().ok()?;
    end.checked_sub(start).map(|width| width + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::block::BlockInfo;
    use std::path::Path;

    #[test]
    fn test_block_count_thresholds() {
        assert_eq!(determine_block_count(0), 1);
        assert_eq!(determine_block_count(1024 * 1024 - 1), 1);
        assert_eq!(determine_block_count(1024 * 1024), 2);
        assert_eq!(determine_block_count(5 * 1024 * 1024 - 1), 2);
        assert_eq!(determine_block_count(5 * 1024 * 1024), 3);
        assert_eq!(determine_block_count(50 * 1024 * 1024 - 1), 3);
        assert_eq!(determine_block_count(50 * 1024 * 1024), 4);
        assert_eq!(determine_block_count(100 * 1024 * 1024 - 1), 4);
        assert_eq!(determine_block_count(100 * 1024 * 1024), 5);
        assert_eq!(determine_block_count(u64::MAX / 2), 5);
    }

    #[test]
    fn test_split_last_block_absorbs_remainder() {
        let info = BreakpointInfo::new(1, "u", Path::new("/tmp"), Some("f"));
        split_into_blocks(&info, 6666, 5);
        let blocks = info.blocks_snapshot();
        let lengths: Vec<u64> = blocks.iter().map(|b| b.content_length()).collect();
        assert_eq!(lengths, vec![1333, 1333, 1333, 1333, 1334]);
        assert_eq!(blocks[4].range_right(), 6665);
        // No gaps or overlaps.
        let mut expected_start = 0;
        for block in &blocks {
            assert_eq!(block.start_offset(), expected_start);
            expected_start += block.content_length();
        }
        assert_eq!(expected_start, 6666);
    }

    #[test]
    fn test_multi_block_requires_range_support_and_known_length() {
        assert!(is_use_multi_block(true, 6666));
        assert!(!is_use_multi_block(false, 6666));
        assert!(!is_use_multi_block(true, CHUNKED_CONTENT_LENGTH));
    }

    #[test]
    fn test_local_resume_causes() {
        let dir = tempfile::tempdir().unwrap();
        let task = DownloadTask::builder("u", dir.path()).filename("f.bin").build();

        // No blocks yet.
        let info = BreakpointInfo::new(1, "u", dir.path(), Some("f.bin"));
        assert_eq!(
            check_local_resume(&task, &info, true, false).cause(),
            Some(ResumeFailedCause::InfoDirty)
        );

        // Blocks but no file on disk.
        info.add_block(BlockInfo::new(0, 100));
        assert_eq!(
            check_local_resume(&task, &info, true, false).cause(),
            Some(ResumeFailedCause::FileNotExist)
        );

        // File exists, seekable output: available.
        std::fs::write(dir.path().join("f.bin"), b"x").unwrap();
        assert!(check_local_resume(&task, &info, true, false).is_available());

        // Non-seekable output with multi-block record: not resumable.
        info.add_block(BlockInfo::new(100, 100));
        assert_eq!(
            check_local_resume(&task, &info, false, false).cause(),
            Some(ResumeFailedCause::OutputStreamNotSupport)
        );

        // Path mismatch is dirty, not file-not-exist.
        let other = BreakpointInfo::new(1, "u", dir.path(), Some("other.bin"));
        other.add_block(BlockInfo::new(0, 100));
        assert_eq!(
            check_local_resume(&task, &other, true, false).cause(),
            Some(ResumeFailedCause::InfoDirty)
        );
    }

    #[test]
    fn test_dirty_block_reset() {
        let info = BreakpointInfo::new(1, "u", Path::new("/tmp"), Some("f"));
        info.add_block(BlockInfo::with_offset(0, 100, 150)); // over-length
        info.add_block(BlockInfo::with_offset(100, 100, 40)); // fine
        reset_block_if_dirty(&info);
        assert_eq!(info.block(0).unwrap().current_offset(), 0);
        assert_eq!(info.block(1).unwrap().current_offset(), 40);
    }

    #[test]
    fn test_precondition_causes() {
        assert_eq!(
            precondition_failed_cause(412, 0, None, None),
            Some(ResumeFailedCause::ResponsePreconditionFailed)
        );
        assert_eq!(
            precondition_failed_cause(206, 10, Some("\"a\""), Some("\"b\"")),
            Some(ResumeFailedCause::ResponseEtagChanged)
        );
        assert_eq!(
            precondition_failed_cause(201, 10, None, None),
            Some(ResumeFailedCause::ResponseCreatedRangeNotFrom0)
        );
        assert_eq!(
            precondition_failed_cause(205, 10, None, None),
            Some(ResumeFailedCause::ResponseResetRangeNotFrom0)
        );
        // 201/205 from scratch are acceptable, as is a matching etag.
        assert_eq!(precondition_failed_cause(201, 0, None, None), None);
        assert_eq!(precondition_failed_cause(205, 0, None, None), None);
        assert_eq!(
            precondition_failed_cause(206, 10, Some("\"a\""), Some("\"a\"")),
            None
        );
    }

    #[test]
    fn test_server_canceled() {
        assert!(!is_server_canceled(206, true));
        assert!(!is_server_canceled(200, false));
        assert!(is_server_canceled(200, true));
        assert!(is_server_canceled(416, false));
        assert!(is_server_canceled(500, false));
    }

    #[test]
    fn test_content_disposition_parsing() {
        assert_eq!(
            parse_content_disposition(r#"attachment; filename="hello world.bin""#).unwrap(),
            Some("hello world.bin".to_string())
        );
        assert_eq!(
            parse_content_disposition("attachment; filename=plain.bin").unwrap(),
            Some("plain.bin".to_string())
        );
        assert_eq!(parse_content_disposition("inline").unwrap(), None);
        assert!(parse_content_disposition(r#"attachment; filename="../../etc/passwd""#).is_err());
    }

    #[test]
    fn test_filename_precedence() {
        assert_eq!(
            determine_filename(Some("served.bin"), "https://e.com/url.bin").unwrap(),
            "served.bin"
        );
        assert_eq!(
            determine_filename(None, "https://e.com/path/url.bin?sig=abc").unwrap(),
            "url.bin"
        );
        // No usable segment: deterministic digest fallback.
        let a = determine_filename(None, "https://e.com/").unwrap();
        let b = determine_filename(None, "https://e.com/").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    proptest::proptest! {
        #[test]
        fn prop_split_partitions_exactly(
            total_length in 1u64..=(500u64 * 1024 * 1024),
        ) {
            let info = BreakpointInfo::new(1, "u", Path::new("/tmp"), Some("f"));
            let count = determine_block_count(total_length);
            split_into_blocks(&info, total_length, count);
            let blocks = info.blocks_snapshot();
            proptest::prop_assert_eq!(blocks.len(), count as usize);

            let mut next_start = 0u64;
            for block in &blocks {
                proptest::prop_assert_eq!(block.start_offset(), next_start);
                next_start += block.content_length();
            }
            proptest::prop_assert_eq!(next_start, total_length);
            proptest::prop_assert_eq!(
                blocks.last().map(|b| b.range_right()),
                Some(total_length - 1)
            );
        }
    }

    #[test]
    fn test_content_length_determination() {
        assert_eq!(determine_content_length(Some("6666"), None), 6666);
        assert_eq!(
            determine_content_length(None, Some("bytes 100-199/6666")),
            100
        );
        assert_eq!(determine_content_length(None, None), CHUNKED_CONTENT_LENGTH);
        assert_eq!(parse_content_range_total("bytes 100-199/6666"), Some(6666));
        assert_eq!(parse_content_range_total("bytes 100-199/*"), None);
    }
}
