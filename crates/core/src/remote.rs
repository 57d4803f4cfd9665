use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::Programs;
use crate::layout::normalize_absolute;
use crate::pipeline::{CommandSpec, PipelineRunner, PipelineStatus, ProcessPipeline};
use crate::{Error, Result};

pub const DEFAULT_REMOTE_USER: &str = "backupfs";

/// `[user@]host` part of a source argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHost {
    pub user: Option<String>,
    pub host: String,
}

/// A parsed `[[user@]host:]<absolute-path>` source argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub remote: Option<RemoteHost>,
    pub path: PathBuf,
}

impl SourceSpec {
    pub fn parse(arg: &str) -> Result<Self> {
        let (remote, path) = if arg.starts_with('/') {
            (None, arg)
        } else {
            let (login, path) = arg.split_once(':').ok_or_else(|| Error::InvalidConfig {
                message: format!("source must be a full path or host:path: {arg}"),
            })?;
            let (user, host) = match login.split_once('@') {
                Some((user, host)) => (Some(user), host),
                None => (None, login),
            };
            if user.is_some_and(|u| !is_token(u)) {
                return Err(Error::InvalidConfig {
                    message: format!("invalid remote user in {arg}"),
                });
            }
            if !is_token(host) {
                return Err(Error::InvalidConfig {
                    message: format!("invalid remote host in {arg}"),
                });
            }
            (
                Some(RemoteHost {
                    user: user.map(str::to_string),
                    host: host.to_string(),
                }),
                path,
            )
        };
        Ok(Self {
            remote,
            path: normalize_absolute(Path::new(path), "source")?,
        })
    }
}

/// Rejects host names that cannot appear in an artifact file name.
pub fn validate_host_name(host: &str) -> Result<()> {
    if !is_token(host) {
        return Err(Error::InvalidConfig {
            message: format!("invalid host name: {host:?}"),
        });
    }
    Ok(())
}

/// Host and user names end up in ssh arguments and artifact file names.
fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

/// Names the remote artifacts of one session: the start time as fixed-width hex seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn from_unix_secs(secs: i64) -> Self {
        Self(format!("{:08x}", secs))
    }

    pub fn parse(text: &str) -> Result<Self> {
        if text.is_empty() || !text.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidConfig {
                message: format!("invalid session id: {text:?}"),
            });
        }
        Ok(Self(text.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// File names of the three per-session artifacts on the source host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteArtifacts {
    pub dirs: String,
    pub links: String,
    pub tar: String,
}

impl RemoteArtifacts {
    pub fn new(host: &str, session_id: &SessionId) -> Self {
        Self {
            dirs: format!("dirs-{host}-{session_id}"),
            links: format!("links-{host}-{session_id}"),
            tar: format!("tar-{host}-{session_id}"),
        }
    }

    pub fn names(&self) -> [&str; 3] {
        [&self.dirs, &self.links, &self.tar]
    }
}

/// `ssh -i <identity> <user>@<host> <remote command...>`
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub program: String,
    pub identity: PathBuf,
    pub user: String,
    pub host: String,
}

impl SshTarget {
    pub fn command<I, S>(&self, remote: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        CommandSpec::new(&self.program)
            .arg("-i")
            .arg(self.identity.as_os_str())
            .arg(format!("{}@{}", self.user, self.host))
            .args(remote)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    VerifySource,
    RemoteCapture,
    ReplicateDirectories,
    ReplicateLinks,
    StreamArchive,
    Cleanup,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::VerifySource,
        Phase::RemoteCapture,
        Phase::ReplicateDirectories,
        Phase::ReplicateLinks,
        Phase::StreamArchive,
        Phase::Cleanup,
    ];

    pub fn number(self) -> u8 {
        match self {
            Phase::VerifySource => 1,
            Phase::RemoteCapture => 2,
            Phase::ReplicateDirectories => 3,
            Phase::ReplicateLinks => 4,
            Phase::StreamArchive => 5,
            Phase::Cleanup => 6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::VerifySource => "verify_source",
            Phase::RemoteCapture => "remote_capture",
            Phase::ReplicateDirectories => "replicate_directories",
            Phase::ReplicateLinks => "replicate_links",
            Phase::StreamArchive => "stream_archive",
            Phase::Cleanup => "cleanup",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub phase: Phase,
    pub pipeline: String,
    pub status: Option<PipelineStatus>,
    /// Set when the pipeline could not be started.
    pub error: Option<String>,
}

impl PhaseReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.status.is_some_and(|s| s.succeeded())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RemoteOutcome {
    pub reports: Vec<PhaseReport>,
}

impl RemoteOutcome {
    pub fn report(&self, phase: Phase) -> Option<&PhaseReport> {
        self.reports.iter().find(|r| r.phase == phase)
    }

    /// Phases 1 through 5 all ran and succeeded.
    pub fn succeeded(&self) -> bool {
        Phase::ALL[..5]
            .iter()
            .all(|p| self.report(*p).is_some_and(PhaseReport::succeeded))
    }

    pub fn cleanup_succeeded(&self) -> bool {
        self.report(Phase::Cleanup)
            .is_some_and(PhaseReport::succeeded)
    }

    pub fn failed_phase(&self) -> Option<Phase> {
        self.reports
            .iter()
            .find(|r| r.phase != Phase::Cleanup && !r.succeeded())
            .map(|r| r.phase)
    }
}

/// Everything the six phases need, fixed before the first one runs.
#[derive(Debug, Clone)]
pub struct RemotePlan {
    pub ssh: SshTarget,
    pub source: PathBuf,
    pub backup_root: PathBuf,
    pub dated_dir: PathBuf,
    pub mirror_dir: PathBuf,
    pub session_id: SessionId,
    pub artifacts: RemoteArtifacts,
    pub programs: Programs,
}

impl RemotePlan {
    /// The remote shell splits its command line on whitespace, so paths sent there must
    /// not contain any.
    pub fn validate(&self) -> Result<()> {
        for (what, path) in [("source", &self.source), ("backup directory", &self.dated_dir)] {
            if path.to_string_lossy().contains(char::is_whitespace) {
                return Err(Error::InvalidConfig {
                    message: format!("{what} must not contain whitespace: {}", path.display()),
                });
            }
        }
        Ok(())
    }

    pub fn pipeline(&self, phase: Phase) -> ProcessPipeline {
        let source = self.source.as_os_str();
        let dated = self.dated_dir.as_os_str();
        let host = self.ssh.host.as_str();
        let sid = self.session_id.as_str();
        let mkdir = || {
            CommandSpec::new(&self.programs.mkdir_helper)
                .arg(dated)
                .current_dir(&self.dated_dir)
        };

        match phase {
            Phase::VerifySource => ProcessPipeline::chain(
                self.ssh
                    .command([OsString::from("backupfs-chksrc"), source.to_os_string()]),
                mkdir(),
            ),
            Phase::RemoteCapture => ProcessPipeline::single(self.ssh.command([
                OsString::from("backupfs-remote"),
                source.to_os_string(),
                dated.to_os_string(),
                OsString::from(host),
                OsString::from(sid),
            ])),
            Phase::ReplicateDirectories => ProcessPipeline::chain(
                self.ssh.command(["cat", self.artifacts.dirs.as_str()]),
                mkdir(),
            ),
            Phase::ReplicateLinks => ProcessPipeline::chain(
                self.ssh.command(["cat", self.artifacts.links.as_str()]),
                CommandSpec::new(&self.programs.mklink_helper)
                    .arg(self.backup_root.as_os_str())
                    .arg(dated)
                    .arg(source),
            ),
            Phase::StreamArchive => ProcessPipeline::chain(
                self.ssh.command([
                    OsString::from("backupfs-exctar"),
                    source.to_os_string(),
                    OsString::from(host),
                    OsString::from(sid),
                ]),
                CommandSpec::new(&self.programs.tar)
                    .args(["xpf", "-"])
                    .current_dir(&self.mirror_dir),
            ),
            Phase::Cleanup => {
                let mut remote = vec!["rm", "-f"];
                remote.extend(self.artifacts.names());
                ProcessPipeline::single(self.ssh.command(remote))
            }
        }
    }
}

/// Sequences the six phases of a remote session over a `PipelineRunner`.
///
/// Phase 1 failing ends the session; later failures skip ahead to cleanup, except the
/// archive stream, whose failure is recorded without skipping anything. Cleanup runs
/// exactly once on every path.
pub struct RemoteOrchestrator<'a, R: PipelineRunner + ?Sized> {
    plan: &'a RemotePlan,
    runner: &'a mut R,
}

impl<'a, R: PipelineRunner + ?Sized> RemoteOrchestrator<'a, R> {
    pub fn new(plan: &'a RemotePlan, runner: &'a mut R) -> Self {
        Self { plan, runner }
    }

    /// `Err` only for guard failures between phases; cleanup has run either way.
    pub fn run(&mut self) -> Result<RemoteOutcome> {
        self.plan.validate()?;
        let mut outcome = RemoteOutcome::default();
        let result = self.run_phases(&mut outcome);
        if !self.run_phase(Phase::Cleanup, &mut outcome) {
            warn!(
                event = "remote.cleanup_failed",
                host = %self.plan.ssh.host,
                session_id = %self.plan.session_id,
                "remote.cleanup_failed"
            );
        }
        result.map(|()| outcome)
    }

    fn run_phases(&mut self, outcome: &mut RemoteOutcome) -> Result<()> {
        if !self.run_phase(Phase::VerifySource, outcome) {
            return Ok(());
        }
        ensure_empty_dir(&self.plan.mirror_dir)?;
        for phase in [
            Phase::RemoteCapture,
            Phase::ReplicateDirectories,
            Phase::ReplicateLinks,
        ] {
            if !self.run_phase(phase, outcome) {
                return Ok(());
            }
        }
        self.run_phase(Phase::StreamArchive, outcome);
        Ok(())
    }

    fn run_phase(&mut self, phase: Phase, outcome: &mut RemoteOutcome) -> bool {
        let pipeline = self.plan.pipeline(phase);
        info!(
            event = "phase.start",
            phase = phase.name(),
            number = phase.number(),
            pipeline = %pipeline,
            "phase.start"
        );

        let report = match self.runner.run(&pipeline) {
            Ok(status) => PhaseReport {
                phase,
                pipeline: pipeline.to_string(),
                status: Some(status),
                error: None,
            },
            Err(e) => PhaseReport {
                phase,
                pipeline: pipeline.to_string(),
                status: None,
                error: Some(e.to_string()),
            },
        };
        let succeeded = report.succeeded();
        if succeeded {
            info!(
                event = "phase.finish",
                phase = phase.name(),
                number = phase.number(),
                "phase.finish"
            );
        } else {
            error!(
                event = "phase.failed",
                phase = phase.name(),
                number = phase.number(),
                status = report.status.map(|s| s.to_string()).unwrap_or_default(),
                error = report.error.as_deref().unwrap_or(""),
                "phase.failed"
            );
        }
        outcome.reports.push(report);
        succeeded
    }
}

/// A missing directory counts as empty.
fn ensure_empty_dir(dir: &Path) -> Result<()> {
    let mut entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::path_io("opendir", dir, e)),
    };
    if entries.next().is_some() {
        return Err(Error::DirectoryNotEmpty {
            dir: dir.to_path_buf(),
        });
    }
    Ok(())
}
