//! One backup run from start to finish.
//!
//! A local run mirrors the source into today's dated directory and copies new or changed
//! files with a tar pipeline. A remote run drives the six-phase protocol from the backup
//! host; `run_capture` is its counterpart on the source host.

use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Settings;
use crate::decision::{
    DecisionEngine, DecisionStats, HardLinker, Linker, RecordingLinker, Strategy,
};
use crate::journal::{JournalTransaction, PreviousJournal, pending_path, unix_secs};
use crate::layout::{
    DestinationLayout, mirror_source_ancestors, normalize_absolute, source_ancestor_records,
    source_relative,
};
use crate::manifest::{ArchiveManifest, DirectoryManifest, LinkManifest};
use crate::materialize::{DirRecord, apply_dir_record};
use crate::mirror::{DirOutcome, MirrorVisitor, TreeMirror, WalkSummary};
use crate::pipeline::{CommandSpec, PipelineRunner, ProcessPipeline};
use crate::remote::{
    RemoteArtifacts, RemoteHost, RemoteOrchestrator, RemoteOutcome, RemotePlan, SessionId,
    SshTarget, validate_host_name,
};
use crate::{Error, Result};

/// Inputs of one backup run.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub source: PathBuf,
    pub backup_root: PathBuf,
    /// Fixes the dated directory and the journal stamp for the whole run.
    pub now: DateTime<Local>,
    pub settings: Settings,
}

impl SessionConfig {
    pub fn session_id(&self) -> SessionId {
        SessionId::from_unix_secs(self.now.timestamp())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub new: u64,
    pub changed: u64,
    pub unchanged: u64,
    pub directories: u64,
    pub skipped: u64,
    pub errors: u64,
}

impl SessionStats {
    fn from_parts(decisions: &DecisionStats, walk: &WalkSummary) -> Self {
        Self {
            new: decisions.new,
            changed: decisions.changed,
            unchanged: decisions.unchanged,
            directories: walk.directories,
            skipped: walk.skipped,
            errors: walk.errors,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub kind: &'static str,
    pub session_id: SessionId,
    pub source: PathBuf,
    pub backup_root: PathBuf,
    pub dated_dir: PathBuf,
    pub mirror_dir: PathBuf,
    pub strategy: &'static str,
    pub previous_dir: Option<PathBuf>,
    pub stats: SessionStats,
    pub manifest: Vec<PathBuf>,
    pub remote: Option<RemoteOutcome>,
}

/// Creates or corrects mirrored directories on this host.
struct LocalDirSink {
    mirror: PathBuf,
}

/// Records mirrored directories for the backup host.
struct RecordingDirSink {
    prefix: PathBuf,
    manifest: DirectoryManifest,
}

trait DirSink {
    fn directory(&mut self, rel: &Path, metadata: &Metadata) -> Result<DirOutcome>;
}

impl DirSink for LocalDirSink {
    fn directory(&mut self, rel: &Path, metadata: &Metadata) -> Result<DirOutcome> {
        let record = DirRecord::from_metadata(self.mirror.join(rel), metadata);
        Ok(match apply_dir_record(&record) {
            Ok(_) => DirOutcome::Mirrored,
            Err(e) => DirOutcome::Failed(e),
        })
    }
}

impl DirSink for RecordingDirSink {
    fn directory(&mut self, rel: &Path, metadata: &Metadata) -> Result<DirOutcome> {
        self.manifest
            .push(&DirRecord::from_metadata(self.prefix.join(rel), metadata))?;
        Ok(DirOutcome::Mirrored)
    }
}

struct SessionVisitor<'a, D, L> {
    dirs: &'a mut D,
    engine: &'a mut DecisionEngine<L>,
}

impl<D: DirSink, L: Linker> MirrorVisitor for SessionVisitor<'_, D, L> {
    fn directory(&mut self, rel: &Path, metadata: &Metadata) -> Result<DirOutcome> {
        self.dirs.directory(rel, metadata)
    }

    fn file(&mut self, rel: &Path, metadata: &Metadata) -> Result<()> {
        self.engine.visit(rel, metadata).map(|_| ())
    }
}

fn require_dir(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path).map_err(|e| Error::path_io("stat", path, e))?;
    if !metadata.is_dir() {
        return Err(Error::InvalidConfig {
            message: format!("{} is not a directory", path.display()),
        });
    }
    Ok(())
}

/// The walk never visits the journal or the one being built; the journal records itself
/// when it is committed.
fn source_walker(source: &Path, journal_file: &str) -> TreeMirror {
    let pending = pending_path(Path::new(journal_file));
    TreeMirror::new(source)
        .exclude_root_entry(journal_file)
        .exclude_root_entry(pending.into_os_string())
}

/// Picks the local strategy from the previous journal, if any.
///
/// The previous dated directory is derived from the session time the journal recorded for
/// itself. Today's directory is fatal; a missing record or a directory that no longer
/// exists degrades to a first-time run.
fn local_strategy(
    layout: &DestinationLayout,
    source: &Path,
    previous: Option<PreviousJournal>,
) -> Result<(Strategy<HardLinker>, Option<PathBuf>)> {
    let Some(previous) = previous else {
        return Ok((Strategy::FirstTime, None));
    };
    let Some(recorded_at) = previous.recorded_at else {
        warn!(event = "session.previous_unrecorded", "session.previous_unrecorded");
        return Ok((Strategy::FirstTime, None));
    };
    let previous_dated = layout.dated_dir_for(recorded_at);
    if previous_dated == layout.dated_dir() {
        return Err(Error::SameDayBackup {
            dir: previous_dated,
        });
    }
    let previous_mirror = previous_dated.join(source_relative(source));
    if !previous_mirror.is_dir() {
        warn!(
            event = "session.previous_missing",
            path = %previous_mirror.display(),
            "session.previous_missing"
        );
        return Ok((Strategy::FirstTime, None));
    }
    let linker = HardLinker::new(previous_mirror.clone(), layout.mirror_dir(source));
    Ok((
        Strategy::Recurrent {
            previous: previous.journal,
            linker,
        },
        Some(previous_mirror),
    ))
}

/// Backs up `config.source` into `config.backup_root` on this host.
///
/// On any error the previous journal is back at its path and the partial new one is gone.
pub fn run_local<R: PipelineRunner + ?Sized>(
    config: &SessionConfig,
    runner: &mut R,
) -> Result<SessionReport> {
    let settings = &config.settings;
    let source = normalize_absolute(&config.source, "source")?;
    require_dir(&source)?;
    let layout = DestinationLayout::new(&config.backup_root, config.now, settings.layout.dir_mode)?;
    let session_id = config.session_id();
    info!(
        event = "session.start",
        kind = "local",
        session_id = %session_id,
        source = %source.display(),
        dated_dir = %layout.dated_dir().display(),
        "session.start"
    );

    layout.prepare()?;
    let journal_file = &settings.layout.journal_file;
    let (txn, previous) = JournalTransaction::begin(&source.join(journal_file))?;
    let (strategy, previous_dir) = local_strategy(&layout, &source, previous)?;
    mirror_source_ancestors(&layout, &source)?;
    let mirror_dir = layout.mirror_dir(&source);

    let (manifest_file, manifest_path) = tempfile::Builder::new()
        .prefix("backupfs-tar-")
        .tempfile()
        .map_err(|e| Error::path_io("create", std::env::temp_dir(), e))?
        .into_parts();
    let manifest = ArchiveManifest::from_file(manifest_file, &manifest_path);
    let mut engine = DecisionEngine::new(strategy, manifest, txn.create_writer()?);
    let strategy_name = engine.strategy_name();
    info!(event = "session.strategy", strategy = strategy_name, "session.strategy");

    let mut dirs = LocalDirSink {
        mirror: mirror_dir.clone(),
    };
    let walk = source_walker(&source, journal_file).walk(&mut SessionVisitor {
        dirs: &mut dirs,
        engine: &mut engine,
    })?;
    let output = engine.finish()?;

    if !output.manifest.is_empty() {
        let tar = &settings.programs.tar;
        let pipeline = ProcessPipeline::chain(
            CommandSpec::new(tar)
                .args(["-c", "-T"])
                .arg(manifest_path.as_os_str())
                .args(["-f", "-"])
                .current_dir(&source),
            CommandSpec::new(tar)
                .args(["xpf", "-"])
                .current_dir(&mirror_dir),
        );
        let status = runner.run(&pipeline)?;
        if !status.succeeded() {
            return Err(Error::Command {
                command: pipeline.to_string(),
                message: status.to_string(),
            });
        }
    }

    txn.commit(output.journal, SystemTime::from(config.now))?;

    let stats = SessionStats::from_parts(&output.stats, &walk);
    info!(
        event = "session.finish",
        kind = "local",
        session_id = %session_id,
        new = stats.new,
        changed = stats.changed,
        unchanged = stats.unchanged,
        "session.finish"
    );
    Ok(SessionReport {
        kind: "local",
        session_id,
        source,
        backup_root: layout.root().to_path_buf(),
        dated_dir: layout.dated_dir().to_path_buf(),
        mirror_dir,
        strategy: strategy_name,
        previous_dir,
        stats,
        manifest: output.manifest,
        remote: None,
    })
}

/// Backs up `config.source` on `remote` into `config.backup_root` through the six
/// protocol phases.
pub fn run_remote<R: PipelineRunner + ?Sized>(
    config: &SessionConfig,
    remote: &RemoteHost,
    runner: &mut R,
) -> Result<SessionReport> {
    let settings = &config.settings;
    let source = normalize_absolute(&config.source, "source")?;
    let layout = DestinationLayout::new(&config.backup_root, config.now, settings.layout.dir_mode)?;
    let session_id = config.session_id();

    let identity = settings.identity_path(layout.root());
    match std::fs::metadata(&identity) {
        Ok(m) if m.is_file() => {}
        Ok(_) => {
            return Err(Error::InvalidConfig {
                message: format!("{} is not a file", identity.display()),
            });
        }
        Err(e) => return Err(Error::path_io("stat", identity, e)),
    }

    info!(
        event = "session.start",
        kind = "remote",
        session_id = %session_id,
        host = %remote.host,
        source = %source.display(),
        dated_dir = %layout.dated_dir().display(),
        "session.start"
    );
    layout.prepare()?;

    let plan = RemotePlan {
        ssh: SshTarget {
            program: settings.remote.ssh_program.clone(),
            identity,
            user: remote
                .user
                .clone()
                .unwrap_or_else(|| settings.remote.user.clone()),
            host: remote.host.clone(),
        },
        source: source.clone(),
        backup_root: layout.root().to_path_buf(),
        dated_dir: layout.dated_dir().to_path_buf(),
        mirror_dir: layout.mirror_dir(&source),
        artifacts: RemoteArtifacts::new(&remote.host, &session_id),
        session_id: session_id.clone(),
        programs: settings.programs.clone(),
    };
    let outcome = RemoteOrchestrator::new(&plan, runner).run()?;

    if let Some(phase) = outcome.failed_phase() {
        let report = outcome.report(phase);
        return Err(Error::Command {
            command: report.map(|r| r.pipeline.clone()).unwrap_or_default(),
            message: format!(
                "phase {} ({}) failed: {}",
                phase.number(),
                phase.name(),
                report
                    .and_then(|r| r.error.clone().or_else(|| r.status.map(|s| s.to_string())))
                    .unwrap_or_default()
            ),
        });
    }

    info!(
        event = "session.finish",
        kind = "remote",
        session_id = %session_id,
        cleanup_succeeded = outcome.cleanup_succeeded(),
        "session.finish"
    );
    Ok(SessionReport {
        kind: "remote",
        session_id,
        source,
        backup_root: plan.backup_root,
        dated_dir: plan.dated_dir,
        mirror_dir: plan.mirror_dir,
        strategy: "remote",
        previous_dir: None,
        stats: SessionStats::default(),
        manifest: Vec::new(),
        remote: Some(outcome),
    })
}

/// Inputs of the capture pass run on the source host.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub source: PathBuf,
    /// The backup host's dated directory; directory records are re-rooted below it.
    pub dated_dir: PathBuf,
    pub host: String,
    pub session_id: SessionId,
    /// Where the artifacts are written.
    pub work_dir: PathBuf,
    pub now: DateTime<Local>,
    pub journal_file: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureReport {
    pub artifacts: RemoteArtifacts,
    pub strategy: &'static str,
    /// Stamp of the previous journal, as written into the link manifest.
    pub previous_recorded_at: Option<i64>,
    pub directories: u64,
    pub links: u64,
    pub stats: SessionStats,
}

/// Removes artifact files unless the capture completes.
struct ArtifactFiles {
    paths: Vec<PathBuf>,
    keep: bool,
}

impl Drop for ArtifactFiles {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        for path in &self.paths {
            if let Err(e) = std::fs::remove_file(path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(
                    event = "capture.cleanup_failed",
                    path = %path.display(),
                    error = %e,
                    "capture.cleanup_failed"
                );
            }
        }
    }
}

/// Walks the source on this host and writes the three artifacts for the backup host:
/// directory records, files to link from the previous backup, and files to archive.
pub fn run_capture(config: &CaptureConfig) -> Result<CaptureReport> {
    let source = normalize_absolute(&config.source, "source")?;
    let dated_dir = normalize_absolute(&config.dated_dir, "backup directory")?;
    require_dir(&source)?;

    validate_host_name(&config.host)?;
    let artifacts = RemoteArtifacts::new(&config.host, &config.session_id);
    let dirs_path = config.work_dir.join(&artifacts.dirs);
    let links_path = config.work_dir.join(&artifacts.links);
    let tar_path = config.work_dir.join(&artifacts.tar);
    info!(
        event = "capture.start",
        session_id = %config.session_id,
        source = %source.display(),
        "capture.start"
    );

    let (txn, previous) = JournalTransaction::begin(&source.join(&config.journal_file))?;
    let mut files = ArtifactFiles {
        paths: vec![dirs_path.clone(), links_path.clone(), tar_path.clone()],
        keep: false,
    };

    let mut dirs = RecordingDirSink {
        prefix: dated_dir.join(source_relative(&source)),
        manifest: DirectoryManifest::create(&dirs_path)?,
    };
    for record in source_ancestor_records(&source, &dated_dir)? {
        dirs.manifest.push(&record)?;
    }

    let mut links = LinkManifest::create(&links_path)?;
    let previous = previous.and_then(|p| Some((p.journal, p.recorded_at?)));
    let (strategy, previous_recorded_at) = match previous {
        None => {
            // No usable previous backup: the link manifest stays empty.
            links.finish()?;
            (Strategy::FirstTime, None)
        }
        Some((journal, recorded_at)) => {
            let secs = unix_secs(recorded_at);
            links.write_previous_time(secs)?;
            (
                Strategy::Recurrent {
                    previous: journal,
                    linker: RecordingLinker::new(links),
                },
                Some(secs),
            )
        }
    };

    let manifest = ArchiveManifest::create(&tar_path)?;
    let mut engine = DecisionEngine::new(strategy, manifest, txn.create_writer()?);
    let strategy_name = engine.strategy_name();
    let walk = source_walker(&source, &config.journal_file).walk(&mut SessionVisitor {
        dirs: &mut dirs,
        engine: &mut engine,
    })?;
    let output = engine.finish()?;

    let directories = dirs.manifest.records();
    dirs.manifest.finish()?;
    let link_count = match output.linker {
        Some(linker) => {
            let links = linker.into_manifest();
            let count = links.links();
            links.finish()?;
            count
        }
        None => 0,
    };
    txn.commit(output.journal, SystemTime::from(config.now))?;
    files.keep = true;

    let stats = SessionStats::from_parts(&output.stats, &walk);
    info!(
        event = "capture.finish",
        session_id = %config.session_id,
        new = stats.new,
        changed = stats.changed,
        unchanged = stats.unchanged,
        links = link_count,
        "capture.finish"
    );
    Ok(CaptureReport {
        artifacts,
        strategy: strategy_name,
        previous_recorded_at,
        directories,
        links: link_count,
        stats,
    })
}
