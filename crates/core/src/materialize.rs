//! Applying DirectoryManifest and LinkManifest streams to the local destination.
//!
//! Both streams may come from another host, so every path is confined to a directory the
//! caller names before anything is created or linked.

use std::ffi::OsString;
use std::fs::Metadata;
use std::io::{BufRead, ErrorKind};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{debug, warn};

use crate::journal::from_unix_secs;
use crate::layout::{dated_relative, source_relative};
use crate::{Error, Result};

/// One `"0x<uid> 0x<gid> 0x<mode> <path>"` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRecord {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub path: PathBuf,
}

impl DirRecord {
    pub fn from_metadata(path: PathBuf, metadata: &Metadata) -> Self {
        Self {
            uid: metadata.uid(),
            gid: metadata.gid(),
            mode: metadata.mode(),
            path,
        }
    }

    pub fn to_line(&self) -> Vec<u8> {
        let mut out =
            format!("0x{:08x} 0x{:08x} 0x{:08x} ", self.uid, self.gid, self.mode).into_bytes();
        out.extend_from_slice(self.path.as_os_str().as_bytes());
        out.push(b'\n');
        out
    }

    pub fn parse_line(line: &[u8]) -> std::result::Result<Self, String> {
        let mut parts = line.splitn(4, |b| *b == b' ');
        let uid = parse_hex_u32(parts.next(), "uid")?;
        let gid = parse_hex_u32(parts.next(), "gid")?;
        let mode = parse_hex_u32(parts.next(), "mode")?;
        let path = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| "missing path".to_string())?;
        Ok(Self {
            uid,
            gid,
            mode,
            path: PathBuf::from(OsString::from_vec(path.to_vec())),
        })
    }
}

fn strip_hex_prefix(text: &str) -> &str {
    text.strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text)
}

fn parse_hex_u32(field: Option<&[u8]>, name: &str) -> std::result::Result<u32, String> {
    let field = field.ok_or_else(|| format!("missing {name}"))?;
    let text = std::str::from_utf8(field).map_err(|_| format!("{name} is not ascii"))?;
    u32::from_str_radix(strip_hex_prefix(text), 16).map_err(|e| format!("invalid {name} {text:?}: {e}"))
}

/// Parses the first LinkManifest line: the previous backup time as hex seconds.
pub fn parse_hex_timestamp(text: &str) -> std::result::Result<i64, String> {
    let text = text.trim();
    u64::from_str_radix(strip_hex_prefix(text), 16)
        .map(|v| v as i64)
        .map_err(|e| format!("invalid timestamp {text:?}: {e}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirChange {
    Created,
    Corrected,
}

/// Creates the directory or corrects an existing one to the record's owner and mode.
///
/// Ownership is applied before the mode so that a chown never clears set-id bits the
/// record asks for. A failed chown is logged and the mode is still applied.
pub fn apply_dir_record(record: &DirRecord) -> std::io::Result<DirChange> {
    let change = match std::fs::symlink_metadata(&record.path) {
        Ok(m) if m.is_dir() => DirChange::Corrected,
        Ok(_) => {
            return Err(std::io::Error::new(
                ErrorKind::AlreadyExists,
                format!("{}: not a directory", record.path.display()),
            ));
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            std::fs::create_dir(&record.path)?;
            DirChange::Created
        }
        Err(e) => return Err(e),
    };

    if let Err(e) = std::os::unix::fs::chown(&record.path, Some(record.uid), Some(record.gid)) {
        warn!(
            event = "dir.chown_failed",
            path = %record.path.display(),
            uid = record.uid,
            gid = record.gid,
            error = %e,
            "dir.chown_failed"
        );
    }
    std::fs::set_permissions(
        &record.path,
        std::fs::Permissions::from_mode(record.mode & 0o7777),
    )?;
    Ok(change)
}

/// True when `path`, resolved against `base`, stays below `confine` lexically.
fn is_confined(path: &Path, base: &Path, confine: &Path) -> bool {
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return false;
    }
    let resolved = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    resolved.starts_with(confine)
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct DirMaterializeSummary {
    pub created: u64,
    pub corrected: u64,
    pub failed: u64,
}

/// Reads DirectoryManifest lines until end of input, applying each relative to `base`.
///
/// Per-line failures are logged and counted; only a read failure is an error.
pub fn materialize_dirs<R: BufRead>(
    mut input: R,
    base: &Path,
    confine: Option<&Path>,
) -> Result<DirMaterializeSummary> {
    let mut summary = DirMaterializeSummary::default();
    let mut line = Vec::new();
    loop {
        line.clear();
        if input.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.is_empty() {
            continue;
        }

        let mut record = match DirRecord::parse_line(&line) {
            Ok(r) => r,
            Err(message) => {
                warn!(event = "dir.bad_record", message, "dir.bad_record");
                summary.failed += 1;
                continue;
            }
        };
        if let Some(confine) = confine
            && !is_confined(&record.path, base, confine)
        {
            warn!(
                event = "dir.outside_destination",
                path = %record.path.display(),
                "dir.outside_destination"
            );
            summary.failed += 1;
            continue;
        }
        if record.path.is_relative() {
            record.path = base.join(&record.path);
        }

        match apply_dir_record(&record) {
            Ok(DirChange::Created) => summary.created += 1,
            Ok(DirChange::Corrected) => summary.corrected += 1,
            Err(e) => {
                warn!(
                    event = "dir.materialize_failed",
                    path = %record.path.display(),
                    mode = format!("0x{:08x}", record.mode),
                    error = %e,
                    "dir.materialize_failed"
                );
                summary.failed += 1;
            }
        }
    }
    debug!(
        event = "dir.materialized",
        created = summary.created,
        corrected = summary.corrected,
        failed = summary.failed,
        "dir.materialized"
    );
    Ok(summary)
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct LinkMaterializeSummary {
    pub previous_dir: Option<PathBuf>,
    pub linked: u64,
    pub failed: u64,
}

/// Reads a LinkManifest stream and hard-links every listed file from the previous
/// backup's mirror of `source` into the mirror below `dated_dir`.
///
/// An empty stream means there was no previous backup. Link failures, including those
/// caused by a missing previous directory, are logged and counted.
pub fn materialize_links<R: BufRead>(
    mut input: R,
    backup_root: &Path,
    dated_dir: &Path,
    source: &Path,
) -> Result<LinkMaterializeSummary> {
    let mut summary = LinkMaterializeSummary::default();
    let mut header = Vec::new();
    if input.read_until(b'\n', &mut header)? == 0 {
        debug!(event = "link.no_previous", "link.no_previous");
        return Ok(summary);
    }
    let header = std::str::from_utf8(&header).map_err(|_| Error::Manifest {
        message: "link manifest header is not ascii".to_string(),
    })?;
    let secs = parse_hex_timestamp(header).map_err(|message| Error::Manifest { message })?;
    let recorded_at = from_unix_secs(secs);

    let previous_dated = backup_root.join(dated_relative(DateTime::<Local>::from(recorded_at)));
    if previous_dated == dated_dir {
        return Err(Error::SameDayBackup {
            dir: dated_dir.to_path_buf(),
        });
    }
    let previous_mirror = previous_dated.join(source_relative(source));
    let new_mirror = dated_dir.join(source_relative(source));
    if let Err(e) = std::fs::metadata(&previous_mirror) {
        warn!(
            event = "link.previous_missing",
            path = %previous_mirror.display(),
            error = %e,
            "link.previous_missing"
        );
    }
    summary.previous_dir = Some(previous_mirror.clone());

    let mut record = Vec::new();
    loop {
        record.clear();
        if input.read_until(b'\0', &mut record)? == 0 {
            break;
        }
        if record.last() == Some(&0) {
            record.pop();
        }
        if record.is_empty() {
            continue;
        }
        let rel = PathBuf::from(OsString::from_vec(record.clone()));
        if rel.is_absolute() || rel.components().any(|c| matches!(c, Component::ParentDir)) {
            warn!(event = "link.bad_path", path = %rel.display(), "link.bad_path");
            summary.failed += 1;
            continue;
        }

        let from = previous_mirror.join(&rel);
        let to = new_mirror.join(&rel);
        match std::fs::hard_link(&from, &to) {
            Ok(()) => summary.linked += 1,
            Err(e) => {
                warn!(
                    event = "link.failed",
                    from = %from.display(),
                    to = %to.display(),
                    error = %e,
                    "link.failed"
                );
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn current_owner(path: &Path) -> (u32, u32) {
        let m = std::fs::metadata(path).unwrap();
        (m.uid(), m.gid())
    }

    #[test]
    fn dir_record_line_uses_fixed_width_hex() {
        let r = DirRecord {
            uid: 0,
            gid: 100,
            mode: 0o40755,
            path: PathBuf::from("/b/2024/01/01/src"),
        };
        assert_eq!(
            r.to_line(),
            b"0x00000000 0x00000064 0x000041ed /b/2024/01/01/src\n"
        );
        assert_eq!(DirRecord::parse_line(&r.to_line()[..r.to_line().len() - 1]).unwrap(), r);
    }

    #[test]
    fn applying_a_record_twice_converges() {
        let temp = tempfile::tempdir().unwrap();
        let (uid, gid) = current_owner(temp.path());
        let record = DirRecord {
            uid,
            gid,
            mode: 0o40750,
            path: temp.path().join("d"),
        };

        assert_eq!(apply_dir_record(&record).unwrap(), DirChange::Created);
        assert_eq!(apply_dir_record(&record).unwrap(), DirChange::Corrected);
        let m = std::fs::metadata(&record.path).unwrap();
        assert_eq!(m.mode() & 0o7777, 0o750);
        assert_eq!((m.uid(), m.gid()), (uid, gid));
    }

    #[test]
    fn applying_a_record_to_a_file_fails() {
        let temp = tempfile::tempdir().unwrap();
        let (uid, gid) = current_owner(temp.path());
        let path = temp.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        let record = DirRecord {
            uid,
            gid,
            mode: 0o40755,
            path,
        };
        assert!(apply_dir_record(&record).is_err());
    }

    #[test]
    fn records_outside_the_destination_are_refused() {
        let temp = tempfile::tempdir().unwrap();
        let (uid, gid) = current_owner(temp.path());
        let dest = temp.path().join("dest");
        std::fs::create_dir(&dest).unwrap();
        let outside = temp.path().join("outside");

        let mut input = DirRecord {
            uid,
            gid,
            mode: 0o40755,
            path: outside.clone(),
        }
        .to_line();
        input.extend(
            DirRecord {
                uid,
                gid,
                mode: 0o40755,
                path: PathBuf::from("../escape"),
            }
            .to_line(),
        );
        input.extend(
            DirRecord {
                uid,
                gid,
                mode: 0o40755,
                path: PathBuf::from("inside"),
            }
            .to_line(),
        );

        let summary = materialize_dirs(Cursor::new(input), &dest, Some(&dest)).unwrap();
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.created, 1);
        assert!(!outside.exists());
        assert!(dest.join("inside").is_dir());
    }

    #[test]
    fn malformed_dir_lines_are_skipped() {
        let temp = tempfile::tempdir().unwrap();
        let summary =
            materialize_dirs(Cursor::new(b"garbage\n\n".to_vec()), temp.path(), None).unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.created, 0);
    }

    #[test]
    fn empty_link_stream_means_no_previous_backup() {
        let summary = materialize_links(
            Cursor::new(Vec::new()),
            Path::new("/nonexistent"),
            Path::new("/nonexistent/2024/01/02"),
            Path::new("/src"),
        )
        .unwrap();
        assert!(summary.previous_dir.is_none());
        assert_eq!(summary.linked, 0);
    }

    #[test]
    fn hex_timestamp_accepts_optional_prefix() {
        assert_eq!(parse_hex_timestamp("0x0000ff\n").unwrap(), 255);
        assert_eq!(parse_hex_timestamp("ff").unwrap(), 255);
        assert!(parse_hex_timestamp("0xzz").is_err());
    }
}
