//! Object key layout shared by the gateway and the workers.
//!
//! The layout is load-bearing: chunk consumers derive nothing from it, but
//! playback clients and the recording record reference these paths verbatim,
//! so every producer must emit them byte-identically.

use chrono::{DateTime, Datelike, Utc};
use regex::Regex;
use std::sync::LazyLock;

pub const MANIFEST_NAME: &str = "stream.m3u8";
pub const SEGMENT_TEMPLATE: &str = "segment_%05d.ts";

static SAFE_SEGMENT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w\-]+\.(ts|m3u8)$").expect("segment name pattern"));

/// Date-scoped prefix for all objects of streams started on `day`:
/// `recordings/{YYYY}/{MM}/{DD}`.
pub fn date_prefix(day: DateTime<Utc>) -> String {
    format!(
        "recordings/{:04}/{:02}/{:02}",
        day.year(),
        day.month(),
        day.day()
    )
}

/// Raw chunk object key: `{prefix}/{stream_id}/chunks/chunk_{seq:08}.webm`.
pub fn chunk_key(prefix: &str, stream_id: &str, seq: u64) -> String {
    format!("{prefix}/{stream_id}/chunks/chunk_{seq:08}.webm")
}

/// Muxer output key: `{prefix}/{stream_id}/hls/{name}`.
pub fn hls_key(prefix: &str, stream_id: &str, name: &str) -> String {
    format!("{prefix}/{stream_id}/hls/{name}")
}

/// The rolling playlist key, also recorded on the recording record as its
/// `storage_key` before the first segment exists.
pub fn manifest_key(prefix: &str, stream_id: &str) -> String {
    hls_key(prefix, stream_id, MANIFEST_NAME)
}

/// Guard applied to any segment or playlist name echoed back out of the
/// system. Rejects separators and traversal outright.
pub fn is_safe_media_name(name: &str) -> bool {
    SAFE_SEGMENT_NAME.is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn date_prefix_is_zero_padded() {
        let day = Utc.with_ymd_and_hms(2025, 3, 7, 12, 0, 0).unwrap();
        assert_eq!(date_prefix(day), "recordings/2025/03/07");
    }

    #[test]
    fn chunk_key_pads_sequence_to_eight_digits() {
        assert_eq!(
            chunk_key("recordings/2025/03/07", "rec1", 0),
            "recordings/2025/03/07/rec1/chunks/chunk_00000000.webm"
        );
        assert_eq!(
            chunk_key("recordings/2025/03/07", "rec1", 12345),
            "recordings/2025/03/07/rec1/chunks/chunk_00012345.webm"
        );
    }

    #[test]
    fn manifest_key_lands_under_hls() {
        assert_eq!(
            manifest_key("recordings/2025/03/07", "rec1"),
            "recordings/2025/03/07/rec1/hls/stream.m3u8"
        );
    }

    #[test]
    fn media_name_guard_rejects_traversal() {
        assert!(is_safe_media_name("segment_00001.ts"));
        assert!(is_safe_media_name("stream.m3u8"));
        assert!(is_safe_media_name("seg-part_2.ts"));
        assert!(!is_safe_media_name("../../etc/passwd"));
        assert!(!is_safe_media_name("dir/segment_00001.ts"));
        assert!(!is_safe_media_name("segment_00001.mp4"));
        assert!(!is_safe_media_name(".ts"));
        assert!(!is_safe_media_name("segment 1.ts"));
    }
}
