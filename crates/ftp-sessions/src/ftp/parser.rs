//! LIST / MLSD body parser.
//!
//! Three line formats are recognised, tried in this order:
//! 1. **MLSD facts** (RFC 3659): `type=file;size=1234;modify=20260101120000; file.txt`
//! 2. **Unix** (`ls -l`): `-rwxr-xr-x 1 owner group 1234 Jan  1 12:00 file.txt`
//! 3. **Windows/IIS**: `01-01-26  12:00AM       1234 file.txt`
//!
//! Lines matching none of them (and the `total N` header) are skipped.

use crate::ftp::types::{DirectoryEntry, EntryKind};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

lazy_static! {
    static ref UNIX_RE: Regex = Regex::new(
        r"(?x)
        ^([dlcbps-][rwxsStT-]{9})[+@.]?\s+  # permissions
        (\d+)\s+                            # link count
        (\S+)\s+                            # owner
        (\S+)\s+                            # group
        (\d+)\s+                            # size
        (\w{3}\s+\d{1,2}\s+[\d:]+)\s+       # date
        (.+)$                               # name (possibly `-> target`)
        "
    )
    .unwrap();
    static ref WINDOWS_RE: Regex = Regex::new(
        r"(?x)
        ^(\d{2}-\d{2}-\d{2,4})\s+           # date
        (\d{1,2}:\d{2}(?:AM|PM)?)\s+        # time
        (<DIR>|\d+)\s+                      # size or <DIR>
        (.+)$                               # name
        "
    )
    .unwrap();
}

/// Parse a full LIST or MLSD body; entries are tagged with `path_prefix`.
pub fn parse_listing(raw: &str, path_prefix: &str) -> Vec<DirectoryEntry> {
    raw.lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty() && !l.starts_with("total "))
        .filter_map(|line| {
            let parsed = parse_line(line, path_prefix);
            if parsed.is_none() {
                log::debug!("Skipping unrecognised listing line: {}", line);
            }
            parsed
        })
        .filter(|e| e.name != "." && e.name != "..")
        .collect()
}

fn parse_line(line: &str, prefix: &str) -> Option<DirectoryEntry> {
    if line.contains('=') && line.contains(';') {
        if let Some(e) = parse_mlsd(line, prefix) {
            return Some(e);
        }
    }
    parse_unix(line, prefix).or_else(|| parse_windows(line, prefix))
}

// ─── MLSD ────────────────────────────────────────────────────────────

fn parse_mlsd(line: &str, prefix: &str) -> Option<DirectoryEntry> {
    // Facts end at the first "; ", the rest is the name (which may contain spaces).
    let (facts_str, name) = line.split_once("; ").or_else(|| line.split_once(' '))?;
    if name.is_empty() {
        return None;
    }

    let facts: HashMap<String, String> = facts_str
        .split(';')
        .filter_map(|seg| seg.trim().split_once('='))
        .map(|(k, v)| (k.to_lowercase(), v.to_string()))
        .collect();

    let kind = match facts.get("type").map(|s| s.to_lowercase()).as_deref() {
        Some("dir") | Some("cdir") | Some("pdir") => EntryKind::Directory,
        Some("file") => EntryKind::File,
        Some(t) if t.contains("symlink") || t.contains("slink") => EntryKind::Symlink,
        _ => EntryKind::Unknown,
    };

    Some(DirectoryEntry {
        name: name.to_string(),
        kind,
        size: facts.get("size").and_then(|v| v.parse().ok()).unwrap_or(0),
        modified: facts.get("modify").and_then(|v| parse_mlsd_time(v)),
        path_prefix: prefix.to_string(),
        permissions: facts.get("unix.mode").cloned(),
        link_target: None,
    })
}

/// `YYYYMMDDHHmmSS[.fraction]`
fn parse_mlsd_time(s: &str) -> Option<DateTime<Utc>> {
    let base = s.get(..14).unwrap_or(s);
    NaiveDateTime::parse_from_str(base, "%Y%m%d%H%M%S")
        .ok()
        .map(|dt| Utc.from_utc_datetime(&dt))
}

// ─── Unix ────────────────────────────────────────────────────────────

fn parse_unix(line: &str, prefix: &str) -> Option<DirectoryEntry> {
    let caps = UNIX_RE.captures(line)?;

    let perms = caps.get(1)?.as_str();
    let size = caps.get(5)?.as_str().parse::<u64>().unwrap_or(0);
    let name_raw = caps.get(7)?.as_str();

    let kind = match perms.as_bytes().first() {
        Some(b'd') => EntryKind::Directory,
        Some(b'l') => EntryKind::Symlink,
        Some(b'-') => EntryKind::File,
        _ => EntryKind::Unknown,
    };

    let (name, link_target) = match (kind, name_raw.split_once(" -> ")) {
        (EntryKind::Symlink, Some((name, target))) => (name.to_string(), Some(target.to_string())),
        _ => (name_raw.to_string(), None),
    };

    Some(DirectoryEntry {
        name,
        kind,
        size,
        modified: parse_unix_date(caps.get(6)?.as_str()),
        path_prefix: prefix.to_string(),
        permissions: Some(perms.to_string()),
        link_target,
    })
}

/// "Jan  1 12:00" (current year) or "Jan  1  2025" (midnight).
fn parse_unix_date(s: &str) -> Option<DateTime<Utc>> {
    let normalised = s.split_whitespace().collect::<Vec<_>>().join(" ");

    if normalised.contains(':') {
        let with_year = format!("{} {}", Utc::now().year(), normalised);
        let dt = NaiveDateTime::parse_from_str(&with_year, "%Y %b %d %H:%M").ok()?;
        return Some(Utc.from_utc_datetime(&dt));
    }

    let date = NaiveDate::parse_from_str(&normalised, "%b %d %Y").ok()?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

// ─── Windows / IIS ───────────────────────────────────────────────────

fn parse_windows(line: &str, prefix: &str) -> Option<DirectoryEntry> {
    let caps = WINDOWS_RE.captures(line)?;

    let size_or_dir = caps.get(3)?.as_str();
    let (kind, size) = if size_or_dir == "<DIR>" {
        (EntryKind::Directory, 0)
    } else {
        (EntryKind::File, size_or_dir.parse::<u64>().unwrap_or(0))
    };

    Some(DirectoryEntry {
        name: caps.get(4)?.as_str().to_string(),
        kind,
        size,
        modified: parse_windows_date(caps.get(1)?.as_str(), caps.get(2)?.as_str()),
        path_prefix: prefix.to_string(),
        permissions: None,
        link_target: None,
    })
}

fn parse_windows_date(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let combined = format!("{} {}", date, time);
    ["%m-%d-%y %I:%M%p", "%m-%d-%y %H:%M", "%m-%d-%Y %I:%M%p", "%m-%d-%Y %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&combined, fmt).ok())
        .map(|dt| Utc.from_utc_datetime(&dt))
}
