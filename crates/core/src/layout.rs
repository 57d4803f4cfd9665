use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Datelike, Local};
use tracing::debug;

use crate::materialize::{DirRecord, apply_dir_record};
use crate::{Error, Result};

pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Requires an absolute path and rebuilds it from its components, which drops trailing
/// separators and `.` segments.
pub fn normalize_absolute(path: &Path, what: &str) -> Result<PathBuf> {
    if !path.is_absolute() {
        return Err(Error::InvalidConfig {
            message: format!("{what} must be a full path: {}", path.display()),
        });
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(Error::InvalidConfig {
            message: format!("{what} must not contain '..': {}", path.display()),
        });
    }
    Ok(path.components().collect())
}

/// `YYYY/MM/DD` for the local calendar date of `at`.
pub fn dated_relative(at: DateTime<Local>) -> PathBuf {
    PathBuf::from(format!("{:04}", at.year()))
        .join(format!("{:02}", at.month()))
        .join(format!("{:02}", at.day()))
}

/// The source path re-rooted below a dated directory (`/home/u` -> `home/u`).
pub fn source_relative(source: &Path) -> &Path {
    source.strip_prefix("/").unwrap_or(source)
}

/// Backup root plus today's dated directory, fixed for a whole run.
#[derive(Debug, Clone)]
pub struct DestinationLayout {
    root: PathBuf,
    dated: PathBuf,
    dir_mode: u32,
}

impl DestinationLayout {
    pub fn new(root: &Path, now: DateTime<Local>, dir_mode: u32) -> Result<Self> {
        let root = normalize_absolute(root, "destination")?;
        let dated = root.join(dated_relative(now));
        Ok(Self {
            root,
            dated,
            dir_mode,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dated_dir(&self) -> &Path {
        &self.dated
    }

    /// Where the tree of `source` is mirrored for this run.
    pub fn mirror_dir(&self, source: &Path) -> PathBuf {
        self.dated.join(source_relative(source))
    }

    /// The dated directory a previous run stamped at `recorded_at` wrote into.
    pub fn dated_dir_for(&self, recorded_at: SystemTime) -> PathBuf {
        self.root
            .join(dated_relative(DateTime::<Local>::from(recorded_at)))
    }

    /// Creates `YYYY`, `YYYY/MM` and `YYYY/MM/DD` below the root as needed and forces each
    /// to the configured mode. The root itself must already be a directory.
    pub fn prepare(&self) -> Result<()> {
        let metadata =
            std::fs::metadata(&self.root).map_err(|e| Error::path_io("stat", &self.root, e))?;
        if !metadata.is_dir() {
            return Err(Error::InvalidConfig {
                message: format!("{} is not a directory", self.root.display()),
            });
        }

        let mut dir = self.root.clone();
        let rel = self
            .dated
            .strip_prefix(&self.root)
            .map_err(|_| Error::InvalidConfig {
                message: "dated directory outside backup root".to_string(),
            })?;
        for component in rel.components() {
            dir.push(component);
            match std::fs::create_dir(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(Error::path_io("mkdir", &dir, e)),
            }
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(self.dir_mode))
                .map_err(|e| Error::path_io("chmod", &dir, e))?;
        }
        debug!(event = "layout.prepared", dated_dir = %self.dated.display(), "layout.prepared");
        Ok(())
    }
}

/// One record per ancestor component of `source` (`/a`, `/a/b`, ...), carrying that
/// component's owner and mode and a path re-rooted below `prefix`.
pub fn source_ancestor_records(source: &Path, prefix: &Path) -> Result<Vec<DirRecord>> {
    let mut records = Vec::new();
    let mut current = PathBuf::from("/");
    for component in source_relative(source).components() {
        current.push(component);
        let metadata =
            std::fs::metadata(&current).map_err(|e| Error::path_io("stat", &current, e))?;
        if !metadata.is_dir() {
            return Err(Error::InvalidConfig {
                message: format!("{} is not a directory", current.display()),
            });
        }
        records.push(DirRecord::from_metadata(
            prefix.join(source_relative(&current)),
            &metadata,
        ));
    }
    Ok(records)
}

/// Materializes the source's ancestors below the dated directory. Mode and creation
/// failures are fatal; ownership failures are only logged.
pub fn mirror_source_ancestors(layout: &DestinationLayout, source: &Path) -> Result<()> {
    for record in source_ancestor_records(source, layout.dated_dir())? {
        apply_dir_record(&record)
            .map_err(|e| Error::path_io("mkdir", record.path.clone(), e))?;
    }
    Ok(())
}
