//! Filesystem helpers shared by listings and the path commands.
//!
//! Converts local metadata into the textual forms FTP clients expect:
//! `ls -l` style permission strings and dates for `LIST`, the
//! `YYYYMMDDHHMMSS` stamp for `MDTM`/`MLSD` facts.

use std::fs::Metadata;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Datelike, Utc};

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

/// Checks if a path exists without traversing symlinks.
///
/// Safer than `path.exists()`, which can loop on recursive symlinks.
pub fn exists_no_traverse(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

/// `ls -l` style permission column for a node.
#[cfg(unix)]
pub fn mode_string(meta: &Metadata) -> String {
    let mode = meta.mode();
    let kind = if meta.is_dir() { 'd' } else { '-' };
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

#[cfg(not(unix))]
pub fn mode_string(meta: &Metadata) -> String {
    if meta.is_dir() { "drwxr-xr-x".to_string() } else { "-rw-r--r--".to_string() }
}

/// Link count column; 1 where the platform has no notion of it.
#[cfg(unix)]
pub fn link_count(meta: &Metadata) -> u64 {
    meta.nlink()
}

#[cfg(not(unix))]
pub fn link_count(_meta: &Metadata) -> u64 {
    1
}

/// `ls -l` date column: `Mon DD HH:MM` within roughly six months,
/// `Mon DD  YYYY` otherwise.
pub fn list_date(mtime: SystemTime) -> String {
    let when: DateTime<Utc> = mtime.into();
    let now = Utc::now();
    let half_year = chrono::Duration::days(182);
    if now.signed_duration_since(when).abs() < half_year {
        when.format("%b %e %H:%M").to_string()
    } else {
        format!("{} {:>2}  {}", when.format("%b"), when.day(), when.year())
    }
}

/// `YYYYMMDDHHMMSS` in UTC, the RFC 3659 time-val.
pub fn modify_stamp(mtime: SystemTime) -> String {
    let when: DateTime<Utc> = mtime.into();
    when.format("%Y%m%d%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn modify_stamp_is_utc_compact() {
        // 2024-03-01 12:30:45 UTC
        let t = UNIX_EPOCH + Duration::from_secs(1_709_296_245);
        assert_eq!(modify_stamp(t), "20240301123045");
    }

    #[test]
    fn old_dates_show_the_year() {
        let t = UNIX_EPOCH + Duration::from_secs(1_000_000_000);
        let date = list_date(t);
        assert!(date.contains("2001"), "{date}");
    }

    #[test]
    fn recent_dates_show_the_time() {
        let t = SystemTime::now();
        let date = list_date(t);
        assert!(date.contains(':'), "{date}");
    }

    #[cfg(unix)]
    #[test]
    fn mode_string_shape() {
        let tmp = tempfile::tempdir().unwrap();
        let meta = std::fs::metadata(tmp.path()).unwrap();
        let mode = mode_string(&meta);
        assert_eq!(mode.len(), 10);
        assert!(mode.starts_with('d'));
    }
}
