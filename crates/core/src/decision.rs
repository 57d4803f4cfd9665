use std::fs::Metadata;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::journal::{FileStamp, Journal, JournalEntry, JournalWriter};
use crate::manifest::{ArchiveManifest, LinkManifest};
use crate::Result;

/// Carries an unchanged file over from the previous backup.
pub trait Linker {
    /// `Ok(false)` means the file could not be carried over and must be archived.
    fn link(&mut self, rel: &Path) -> Result<bool>;
}

/// Hard-links files from the previous mirror into the new one on this host.
#[derive(Debug, Clone)]
pub struct HardLinker {
    previous_mirror: PathBuf,
    new_mirror: PathBuf,
}

impl HardLinker {
    pub fn new(previous_mirror: PathBuf, new_mirror: PathBuf) -> Self {
        Self {
            previous_mirror,
            new_mirror,
        }
    }
}

impl Linker for HardLinker {
    fn link(&mut self, rel: &Path) -> Result<bool> {
        let from = self.previous_mirror.join(rel);
        let to = self.new_mirror.join(rel);
        match std::fs::hard_link(&from, &to) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(
                    event = "file.link_failed",
                    from = %from.display(),
                    to = %to.display(),
                    error = %e,
                    "file.link_failed"
                );
                Ok(false)
            }
        }
    }
}

/// Records files for the backup host to link; always succeeds locally.
pub struct RecordingLinker {
    manifest: LinkManifest,
}

impl RecordingLinker {
    pub fn new(manifest: LinkManifest) -> Self {
        Self { manifest }
    }

    pub fn into_manifest(self) -> LinkManifest {
        self.manifest
    }
}

impl Linker for RecordingLinker {
    fn link(&mut self, rel: &Path) -> Result<bool> {
        self.manifest.push(rel)?;
        Ok(true)
    }
}

/// Copy-versus-link policy, chosen once per session.
pub enum Strategy<L> {
    /// No usable previous backup: every file is archived.
    FirstTime,
    /// Files whose ctime and mtime match the previous journal are linked.
    Recurrent { previous: Journal, linker: L },
}

impl<L> Strategy<L> {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::FirstTime => "first-time",
            Strategy::Recurrent { .. } => "recurrent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOutcome {
    New,
    Changed,
    Unchanged,
}

impl FileOutcome {
    fn event(self) -> &'static str {
        match self {
            FileOutcome::New => "file.new",
            FileOutcome::Changed => "file.changed",
            FileOutcome::Unchanged => "file.unchanged",
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct DecisionStats {
    pub new: u64,
    pub changed: u64,
    pub unchanged: u64,
}

impl DecisionStats {
    fn record(&mut self, outcome: FileOutcome) {
        match outcome {
            FileOutcome::New => self.new += 1,
            FileOutcome::Changed => self.changed += 1,
            FileOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

/// What a finished engine hands back to its session.
pub struct DecisionOutput<L> {
    pub manifest: Vec<PathBuf>,
    /// Still open; the session finishes it with the run's timestamp.
    pub journal: JournalWriter,
    pub linker: Option<L>,
    pub stats: DecisionStats,
}

/// Decides per file between archiving and linking, and rewrites the journal.
pub struct DecisionEngine<L> {
    strategy: Strategy<L>,
    manifest: ArchiveManifest,
    journal: JournalWriter,
    stats: DecisionStats,
}

impl<L: Linker> DecisionEngine<L> {
    pub fn new(strategy: Strategy<L>, manifest: ArchiveManifest, journal: JournalWriter) -> Self {
        Self {
            strategy,
            manifest,
            journal,
            stats: DecisionStats::default(),
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Handles one regular file or symlink. Every visited file gets a fresh journal line.
    pub fn visit(&mut self, rel: &Path, metadata: &Metadata) -> Result<FileOutcome> {
        let stamp = FileStamp::from_metadata(metadata);
        let outcome = match &mut self.strategy {
            Strategy::FirstTime => FileOutcome::New,
            Strategy::Recurrent { previous, linker } => match previous.lookup(rel) {
                None => FileOutcome::New,
                Some(seen) if seen != stamp => FileOutcome::Changed,
                Some(_) => {
                    if linker.link(rel)? {
                        FileOutcome::Unchanged
                    } else {
                        FileOutcome::Changed
                    }
                }
            },
        };

        if outcome != FileOutcome::Unchanged {
            self.manifest.push(rel)?;
        }
        self.journal.append(&JournalEntry {
            path: rel.to_path_buf(),
            stamp,
        })?;
        self.stats.record(outcome);
        info!(event = outcome.event(), path = %rel.display(), "file");
        Ok(outcome)
    }

    pub fn finish(self) -> Result<DecisionOutput<L>> {
        let manifest = self.manifest.finish()?;
        let linker = match self.strategy {
            Strategy::FirstTime => None,
            Strategy::Recurrent { linker, .. } => Some(linker),
        };
        Ok(DecisionOutput {
            manifest,
            journal: self.journal,
            linker,
            stats: self.stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedLinker {
        answer: bool,
        calls: Vec<PathBuf>,
    }

    impl Linker for FixedLinker {
        fn link(&mut self, rel: &Path) -> Result<bool> {
            self.calls.push(rel.to_path_buf());
            Ok(self.answer)
        }
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        source: PathBuf,
        manifest: PathBuf,
        journal: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("src");
        std::fs::create_dir(&source).unwrap();
        std::fs::write(source.join("a.txt"), b"a").unwrap();
        std::fs::write(source.join("b.txt"), b"b").unwrap();
        Fixture {
            manifest: temp.path().join("manifest"),
            journal: temp.path().join("journal"),
            source,
            _temp: temp,
        }
    }

    fn engine(f: &Fixture, strategy: Strategy<FixedLinker>) -> DecisionEngine<FixedLinker> {
        DecisionEngine::new(
            strategy,
            ArchiveManifest::create(&f.manifest).unwrap(),
            JournalWriter::create(&f.journal).unwrap(),
        )
    }

    fn visit(e: &mut DecisionEngine<FixedLinker>, f: &Fixture, name: &str) -> FileOutcome {
        let metadata = std::fs::symlink_metadata(f.source.join(name)).unwrap();
        e.visit(Path::new(name), &metadata).unwrap()
    }

    fn stamp_of(f: &Fixture, name: &str) -> FileStamp {
        FileStamp::from_metadata(&std::fs::symlink_metadata(f.source.join(name)).unwrap())
    }

    #[test]
    fn first_time_archives_everything() {
        let f = fixture();
        let mut e = engine(&f, Strategy::FirstTime);
        assert_eq!(visit(&mut e, &f, "a.txt"), FileOutcome::New);
        assert_eq!(visit(&mut e, &f, "b.txt"), FileOutcome::New);

        let out = e.finish().unwrap();
        assert_eq!(out.manifest, vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")]);
        assert_eq!(out.journal.written(), 2);
        assert!(out.linker.is_none());
    }

    #[test]
    fn matching_stamp_links_and_skips_manifest() {
        let f = fixture();
        let mut previous = Journal::new();
        previous.insert(JournalEntry {
            path: PathBuf::from("a.txt"),
            stamp: stamp_of(&f, "a.txt"),
        });
        let linker = FixedLinker {
            answer: true,
            calls: Vec::new(),
        };
        let mut e = engine(&f, Strategy::Recurrent { previous, linker });

        assert_eq!(visit(&mut e, &f, "a.txt"), FileOutcome::Unchanged);
        assert_eq!(visit(&mut e, &f, "b.txt"), FileOutcome::New);
        let out = e.finish().unwrap();
        assert_eq!(out.manifest, vec![PathBuf::from("b.txt")]);
        assert_eq!(out.journal.written(), 2);
        assert_eq!(out.linker.unwrap().calls, vec![PathBuf::from("a.txt")]);
        assert_eq!(out.stats.unchanged, 1);
        assert_eq!(out.stats.new, 1);
    }

    #[test]
    fn stamp_mismatch_is_changed_without_linking() {
        let f = fixture();
        let mut stamp = stamp_of(&f, "a.txt");
        stamp.mtime -= 10;
        let mut previous = Journal::new();
        previous.insert(JournalEntry {
            path: PathBuf::from("a.txt"),
            stamp,
        });
        let linker = FixedLinker {
            answer: true,
            calls: Vec::new(),
        };
        let mut e = engine(&f, Strategy::Recurrent { previous, linker });

        assert_eq!(visit(&mut e, &f, "a.txt"), FileOutcome::Changed);
        let out = e.finish().unwrap();
        assert_eq!(out.manifest, vec![PathBuf::from("a.txt")]);
        assert!(out.linker.unwrap().calls.is_empty());

        drop(out.journal);
        let rewritten = Journal::load(&f.journal).unwrap();
        assert_eq!(rewritten.lookup(Path::new("a.txt")), Some(stamp_of(&f, "a.txt")));
    }

    #[test]
    fn failed_link_falls_back_to_archive() {
        let f = fixture();
        let mut previous = Journal::new();
        previous.insert(JournalEntry {
            path: PathBuf::from("a.txt"),
            stamp: stamp_of(&f, "a.txt"),
        });
        let linker = FixedLinker {
            answer: false,
            calls: Vec::new(),
        };
        let mut e = engine(&f, Strategy::Recurrent { previous, linker });

        assert_eq!(visit(&mut e, &f, "a.txt"), FileOutcome::Changed);
        assert_eq!(e.finish().unwrap().manifest, vec![PathBuf::from("a.txt")]);
    }

    #[test]
    fn hard_linker_reports_missing_previous_file() {
        let temp = tempfile::tempdir().unwrap();
        let prev = temp.path().join("prev");
        let next = temp.path().join("next");
        std::fs::create_dir_all(&prev).unwrap();
        std::fs::create_dir_all(&next).unwrap();
        std::fs::write(prev.join("kept"), b"x").unwrap();

        let mut linker = HardLinker::new(prev.clone(), next.clone());
        assert!(linker.link(Path::new("kept")).unwrap());
        assert!(!linker.link(Path::new("gone")).unwrap());

        use std::os::unix::fs::MetadataExt;
        let a = std::fs::metadata(prev.join("kept")).unwrap();
        let b = std::fs::metadata(next.join("kept")).unwrap();
        assert_eq!(a.ino(), b.ino());
    }
}
