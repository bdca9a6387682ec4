use chrono::{DateTime, TimeZone};
use std::fmt::Display;
use std::path::{Path, PathBuf};

pub const SEGMENT_PREFIX: &str = "recording_";
pub const SEGMENT_EXTENSION: &str = "avi";

fn fmt_ts<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: Display,
{
    at.format("%Y-%m-%d_%H-%M-%S").to_string()
}

/// File name for a segment started at `at`.
/// e.g. "recording_2026-02-18_09-30-00.avi"
pub fn segment_file_name<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: Display,
{
    format!("{SEGMENT_PREFIX}{}.{SEGMENT_EXTENSION}", fmt_ts(at))
}

/// Destination for a new segment under `dir`.
///
/// Two segments can start within the same second (a tail ends and motion
/// returns on the next tick); the later one gets a `-N` suffix instead of
/// overwriting the finished clip.
/// e.g. "recordings/recording_2026-02-18_09-30-00-1.avi"
pub fn segment_path<Tz: TimeZone>(dir: &Path, at: &DateTime<Tz>) -> PathBuf
where
    Tz::Offset: Display,
{
    let first = dir.join(segment_file_name(at));
    if !first.exists() {
        return first;
    }
    let ts = fmt_ts(at);
    (1u32..)
        .map(|n| dir.join(format!("{SEGMENT_PREFIX}{ts}-{n}.{SEGMENT_EXTENSION}")))
        .find(|p| !p.exists())
        .unwrap_or(first)
}
