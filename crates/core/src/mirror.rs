use std::ffi::OsString;
use std::fs::{FileType, Metadata};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::{Error, Result};

/// Result of mirroring one directory.
#[derive(Debug)]
pub enum DirOutcome {
    Mirrored,
    /// Reported by the walker; only this subtree is skipped.
    Failed(std::io::Error),
}

/// Receives every mirrored entry of a walk, with paths relative to the walk root.
pub trait MirrorVisitor {
    /// Mirrors one directory. `Err` aborts the walk.
    fn directory(&mut self, rel: &Path, metadata: &Metadata) -> Result<DirOutcome>;

    /// Handles a regular file or a symlink. A failure aborts the walk.
    fn file(&mut self, rel: &Path, metadata: &Metadata) -> Result<()>;
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct WalkSummary {
    pub directories: u64,
    pub files: u64,
    pub skipped: u64,
    pub errors: u64,
}

/// Depth-first walk of a source tree.
///
/// Entries are visited in file-name order within each directory and symlinks are never
/// followed. Every callback receives the entry's full relative path, so no traversal state
/// is shared between siblings.
#[derive(Debug, Clone)]
pub struct TreeMirror {
    root: PathBuf,
    excluded: Vec<OsString>,
}

impl TreeMirror {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            excluded: Vec::new(),
        }
    }

    /// Leaves out a top-level entry, such as the journal living in the source root.
    pub fn exclude_root_entry(mut self, name: impl Into<OsString>) -> Self {
        self.excluded.push(name.into());
        self
    }

    pub fn walk<V: MirrorVisitor + ?Sized>(&self, visitor: &mut V) -> Result<WalkSummary> {
        let mut summary = WalkSummary::default();
        let mut it = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .min_depth(1)
            .into_iter();

        while let Some(next) = it.next() {
            let entry = match next {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(event = "walk.error", error = %e, "walk.error");
                    summary.errors += 1;
                    continue;
                }
            };
            let file_type = entry.file_type();
            let is_dir = file_type.is_dir();

            if entry.depth() == 1 && self.excluded.iter().any(|n| n == entry.file_name()) {
                if is_dir {
                    it.skip_current_dir();
                }
                continue;
            }

            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|_| Error::InvalidConfig {
                    message: format!("{} escaped the walk root", entry.path().display()),
                })?;
            if rel.as_os_str().as_bytes().contains(&b'\n') {
                warn!(event = "walk.skip", path = %entry.path().display(), reason = "newline in name", "walk.skip");
                summary.skipped += 1;
                if is_dir {
                    it.skip_current_dir();
                }
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!(event = "walk.stat_failed", path = %entry.path().display(), error = %e, "walk.stat_failed");
                    summary.errors += 1;
                    if is_dir {
                        it.skip_current_dir();
                    }
                    continue;
                }
            };

            if is_dir {
                match visitor.directory(rel, &metadata)? {
                    DirOutcome::Mirrored => summary.directories += 1,
                    DirOutcome::Failed(e) => {
                        warn!(
                            event = "walk.dir_failed",
                            path = %rel.display(),
                            error = %e,
                            "walk.dir_failed"
                        );
                        summary.errors += 1;
                        it.skip_current_dir();
                    }
                }
            } else if file_type.is_file() || file_type.is_symlink() {
                visitor.file(rel, &metadata)?;
                summary.files += 1;
            } else {
                info!(
                    event = "walk.skip",
                    path = %entry.path().display(),
                    reason = describe_special(file_type),
                    "walk.skip"
                );
                summary.skipped += 1;
            }
        }
        Ok(summary)
    }
}

fn describe_special(file_type: FileType) -> &'static str {
    if file_type.is_socket() {
        "socket ignored"
    } else if file_type.is_block_device() {
        "block device ignored"
    } else if file_type.is_char_device() {
        "character device ignored"
    } else if file_type.is_fifo() {
        "fifo ignored"
    } else {
        "unknown type ignored"
    }
}
