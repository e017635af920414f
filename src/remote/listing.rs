//! Parser for the long listing format printed by `sftp`'s `ls -l`.
//!
//! ```text
//! -rw-r--r--    1 user     group        1234 Jan 15 10:30 /home/user/file.txt
//! drwxr-xr-x    5 user     group        4096 Jan 15  2023 /home/user/dir
//! ```
//!
//! The format is whatever the remote server's `sftp-server` emits, so the
//! parser is deliberately forgiving: lines it does not understand are
//! skipped rather than reported.

use chrono::{Datelike, Local, NaiveDate, TimeZone};

use super::path::basename;
use super::types::RemoteEntry;

const FIELD_COUNT: usize = 9;

/// Split a line into the eight leading columns and the remaining name,
/// which may itself contain spaces.
fn split_fields(line: &str) -> Option<([&str; FIELD_COUNT - 1], &str)> {
    let mut fields = [""; FIELD_COUNT - 1];
    let mut rest = line.trim_start();

    for field in fields.iter_mut() {
        let end = rest.find(char::is_whitespace)?;
        *field = &rest[..end];
        rest = rest[end..].trim_start();
    }

    let name = rest.trim_end_matches(&['\r', '\n'][..]);
    if name.is_empty() {
        None
    } else {
        Some((fields, name))
    }
}

/// The name column exactly as printed (often a full path).
pub fn raw_name(line: &str) -> Option<&str> {
    split_fields(line).map(|(_, name)| name)
}

pub fn parse_ls_line(line: &str) -> Option<RemoteEntry> {
    parse_ls_line_in_year(line, Local::now().year())
}

/// Like [`parse_ls_line`], with the year assumed for `Mon DD HH:MM` dates
/// supplied by the caller.
pub fn parse_ls_line_in_year(line: &str, current_year: i32) -> Option<RemoteEntry> {
    let (fields, name) = split_fields(line)?;
    let permissions = fields[0];
    if permissions.len() < 10 {
        return None;
    }

    let type_char = permissions.chars().next()?;
    let is_dir = type_char == 'd';
    let is_file = type_char == '-';
    let is_symlink = type_char == 'l';

    let name = if is_symlink {
        name.split_once(" -> ").map_or(name, |(link, _)| link)
    } else {
        name
    };
    let name = basename(name).to_string();
    if name.is_empty() {
        return None;
    }

    let mode = permissions
        .chars()
        .skip(1)
        .take(9)
        .enumerate()
        .fold(0u32, |mode, (i, ch)| match ch {
            'r' | 'w' | 'x' | 's' | 't' => mode | (1 << (8 - i)),
            _ => mode,
        });

    let size = fields[4].parse::<u64>().unwrap_or(0);
    let mtime = parse_mtime(fields[5], fields[6], fields[7], current_year)
        .unwrap_or_else(|| Local::now().timestamp());

    Some(RemoteEntry {
        name,
        size,
        mtime,
        mode,
        is_dir,
        is_file,
        is_symlink,
    })
}

/// `Jan 15 10:30` (current year) or `Jan 15 2023` (midnight), local time.
fn parse_mtime(month: &str, day: &str, time_or_year: &str, current_year: i32) -> Option<i64> {
    let (year, hour, minute) = match time_or_year.split_once(':') {
        Some((h, m)) => (current_year, h.parse().ok()?, m.parse().ok()?),
        None => (time_or_year.parse().ok()?, 0, 0),
    };

    let date = NaiveDate::parse_from_str(&format!("{} {} {}", month, day, year), "%b %d %Y").ok()?;
    let naive = date.and_hms_opt(hour, minute, 0)?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
}

/// Parse every entry line of a listing. Blank lines, the `sftp>` command echo,
/// `total` lines and the `.`/`..` entries are dropped.
pub fn parse_listing(stdout: &str) -> Vec<RemoteEntry> {
    entry_lines(stdout)
        .filter_map(parse_ls_line)
        .filter(|entry| entry.name != "." && entry.name != "..")
        .collect()
}

/// Lines of `sftp` output that can carry entries.
pub fn entry_lines(stdout: &str) -> impl Iterator<Item = &str> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("sftp>") && !line.starts_with("total"))
}
