use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{File, Metadata};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, error, warn};

use crate::{Error, Result};

pub const DEFAULT_JOURNAL_FILE: &str = ".backupfs-journal";
const PENDING_SUFFIX: &str = ".new";

/// Change and modify times of one file, in whole seconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileStamp {
    pub ctime: i64,
    pub mtime: i64,
}

impl FileStamp {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            ctime: metadata.ctime(),
            mtime: metadata.mtime(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub path: PathBuf,
    pub stamp: FileStamp,
}

impl JournalEntry {
    /// Encodes the entry as `"<ctime-hex> <mtime-hex> <path>\n"`.
    pub fn to_record(&self) -> Vec<u8> {
        let mut out = format!("{:x} {:x} ", self.stamp.ctime, self.stamp.mtime).into_bytes();
        out.extend_from_slice(self.path.as_os_str().as_bytes());
        out.push(b'\n');
        out
    }

    /// Parses one record with its trailing newline already removed.
    pub fn parse_record(line: &[u8]) -> std::result::Result<Self, String> {
        let mut parts = line.splitn(3, |b| *b == b' ');
        let ctime = parse_hex_field(parts.next(), "ctime")?;
        let mtime = parse_hex_field(parts.next(), "mtime")?;
        let path = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| "missing path".to_string())?;
        Ok(Self {
            path: PathBuf::from(OsString::from_vec(path.to_vec())),
            stamp: FileStamp { ctime, mtime },
        })
    }
}

fn parse_hex_field(field: Option<&[u8]>, name: &str) -> std::result::Result<i64, String> {
    let field = field.ok_or_else(|| format!("missing {name}"))?;
    let text = std::str::from_utf8(field).map_err(|_| format!("{name} is not ascii"))?;
    u64::from_str_radix(text, 16)
        .map(|v| v as i64)
        .map_err(|e| format!("invalid {name} {text:?}: {e}"))
}

/// The previous run's journal, indexed by source-relative path.
#[derive(Debug, Default, Clone)]
pub struct Journal {
    entries: HashMap<PathBuf, FileStamp>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a journal file. Any read or parse failure is fatal.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::path_io("open", path, e))?;
        let mut reader = BufReader::new(file);
        let mut journal = Self::new();
        let mut line = Vec::new();
        let mut line_no = 0usize;

        loop {
            line.clear();
            let n = reader
                .read_until(b'\n', &mut line)
                .map_err(|e| Error::path_io("read", path, e))?;
            if n == 0 {
                break;
            }
            line_no += 1;
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }

            let entry = JournalEntry::parse_record(&line).map_err(|message| Error::Journal {
                path: path.to_path_buf(),
                line: line_no,
                message,
            })?;
            if journal.entries.contains_key(&entry.path) {
                return Err(Error::Journal {
                    path: path.to_path_buf(),
                    line: line_no,
                    message: format!("duplicate path {}", entry.path.display()),
                });
            }
            journal.entries.insert(entry.path, entry.stamp);
        }

        debug!(
            event = "journal.loaded",
            path = %path.display(),
            entries = journal.entries.len(),
            "journal.loaded"
        );
        Ok(journal)
    }

    pub fn insert(&mut self, entry: JournalEntry) -> Option<FileStamp> {
        self.entries.insert(entry.path, entry.stamp)
    }

    pub fn lookup(&self, path: &Path) -> Option<FileStamp> {
        self.entries.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Output stream for the journal being rebuilt during a walk.
pub struct JournalWriter {
    out: BufWriter<File>,
    path: PathBuf,
    written: u64,
}

impl JournalWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| Error::path_io("create", path, e))?;
        Ok(Self {
            out: BufWriter::new(file),
            path: path.to_path_buf(),
            written: 0,
        })
    }

    pub fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        self.out
            .write_all(&entry.to_record())
            .map_err(|e| Error::path_io("write", &self.path, e))?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    fn finish(self) -> Result<()> {
        let path = self.path;
        let file = self
            .out
            .into_inner()
            .map_err(|e| Error::path_io("flush", &path, e.into_error()))?;
        file.sync_all()
            .map_err(|e| Error::path_io("fsync", &path, e))
    }
}

/// A journal found at session start.
#[derive(Debug)]
pub struct PreviousJournal {
    pub journal: Journal,
    /// Session time the journal recorded for itself, if it carries that record.
    pub recorded_at: Option<SystemTime>,
}

/// Seconds since the epoch, negative before it.
pub fn unix_secs(at: SystemTime) -> i64 {
    match at.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

pub fn from_unix_secs(secs: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

/// Sibling path the new journal is written to until it is committed.
pub fn pending_path(canonical: &Path) -> PathBuf {
    let mut name = canonical.as_os_str().to_os_string();
    name.push(PENDING_SUFFIX);
    PathBuf::from(name)
}

/// Replaces the journal at the canonical path only once the new one is complete.
///
/// The previous journal stays at the canonical path for the whole run while the new one
/// is built at `pending_path`. `commit` renames it into place; dropping the transaction
/// without committing, or never getting to drop it, leaves the previous journal as the
/// only one at the canonical path.
#[derive(Debug)]
pub struct JournalTransaction {
    canonical: PathBuf,
    pending: PathBuf,
    has_previous: bool,
    committed: bool,
}

impl JournalTransaction {
    pub fn begin(canonical: &Path) -> Result<(Self, Option<PreviousJournal>)> {
        let pending = pending_path(canonical);
        remove_stale_pending(&pending)?;
        let mut txn = Self {
            canonical: canonical.to_path_buf(),
            pending,
            has_previous: false,
            committed: false,
        };

        let metadata = match std::fs::metadata(canonical) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(event = "journal.absent", path = %canonical.display(), "journal.absent");
                return Ok((txn, None));
            }
            Err(e) => return Err(Error::path_io("stat", canonical, e)),
        };
        if !metadata.is_file() {
            return Err(Error::Journal {
                path: canonical.to_path_buf(),
                line: 0,
                message: "not a regular file".to_string(),
            });
        }

        let journal = Journal::load(canonical)?;
        let recorded_at = txn
            .self_path()
            .and_then(|name| journal.lookup(&name))
            .map(|stamp| from_unix_secs(stamp.mtime));
        if recorded_at.is_none() {
            warn!(
                event = "journal.unrecorded",
                path = %canonical.display(),
                "journal.unrecorded"
            );
        }
        txn.has_previous = true;
        Ok((
            txn,
            Some(PreviousJournal {
                journal,
                recorded_at,
            }),
        ))
    }

    pub fn has_previous(&self) -> bool {
        self.has_previous
    }

    pub fn create_writer(&self) -> Result<JournalWriter> {
        JournalWriter::create(&self.pending)
    }

    /// Appends the journal's own record stamped with `recorded_at`, syncs the new journal
    /// and renames it over the previous one.
    pub fn commit(mut self, mut writer: JournalWriter, recorded_at: SystemTime) -> Result<()> {
        if writer.path != self.pending {
            return Err(Error::Journal {
                path: writer.path.clone(),
                line: 0,
                message: "writer does not belong to this transaction".to_string(),
            });
        }
        if let Some(name) = self.self_path() {
            let secs = unix_secs(recorded_at);
            writer.append(&JournalEntry {
                path: name,
                stamp: FileStamp {
                    ctime: secs,
                    mtime: secs,
                },
            })?;
        }
        writer.finish()?;
        std::fs::rename(&self.pending, &self.canonical)
            .map_err(|e| Error::path_io("rename", &self.pending, e))?;
        self.committed = true;
        debug!(event = "journal.committed", path = %self.canonical.display(), "journal.committed");
        Ok(())
    }

    /// The journal's own path relative to the source root it lives in.
    fn self_path(&self) -> Option<PathBuf> {
        self.canonical.file_name().map(PathBuf::from)
    }
}

impl Drop for JournalTransaction {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match std::fs::remove_file(&self.pending) {
            Ok(()) => debug!(event = "journal.discarded", path = %self.pending.display(), "journal.discarded"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => error!(
                event = "journal.discard_failed",
                path = %self.pending.display(),
                error = %e,
                "journal.discard_failed"
            ),
        }
    }
}

/// A pending journal left behind belongs to a run that never committed.
fn remove_stale_pending(pending: &Path) -> Result<()> {
    match std::fs::remove_file(pending) {
        Ok(()) => {
            warn!(event = "journal.stale_pending", path = %pending.display(), "journal.stale_pending");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::path_io("unlink", pending, e)),
    }
}
