use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

use tracing::span::EnteredSpan;
use tracing::{debug, info_span};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::remote::SessionId;

pub const LOG_ENV: &str = "BACKUPFS_LOG";
pub const LOG_DIR_ENV: &str = "BACKUPFS_LOG_DIR";

static SESSION_FILE: OnceLock<SessionFile> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Which orchestrator a session log belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Local,
    Remote,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

/// The NDJSON file of the session in progress; events are dropped while it is closed.
#[derive(Debug, Default)]
struct SessionFile {
    out: Mutex<Option<BufWriter<File>>>,
}

impl SessionFile {
    fn lock(&self) -> MutexGuard<'_, Option<BufWriter<File>>> {
        self.out.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open(&self, path: &Path) -> std::io::Result<()> {
        let mut out = self.lock();
        if out.is_some() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "a session log is already open",
            ));
        }
        let file = OpenOptions::new().create_new(true).write(true).open(path)?;
        *out = Some(BufWriter::new(file));
        Ok(())
    }

    fn close(&self) -> std::io::Result<()> {
        let Some(mut writer) = self.lock().take() else {
            return Ok(());
        };
        writer.flush()?;
        writer.get_ref().sync_all()
    }
}

struct SessionFileWriter<'a>(MutexGuard<'a, Option<BufWriter<File>>>);

impl Write for SessionFileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.0.as_mut() {
            Some(writer) => writer.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.0.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SessionFile {
    type Writer = SessionFileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        SessionFileWriter(self.lock())
    }
}

impl<'a> MakeWriter<'a> for &SessionFile {
    type Writer = SessionFileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        (**self).make_writer()
    }
}

fn build_env_filter_from(backupfs_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    let default = || EnvFilter::new("info");

    if let Some(v) = backupfs_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    if let Some(v) = rust_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    default()
}

/// Installs the global subscriber: readable lines on stderr, plus NDJSON into the open
/// session log. Stdout is left alone since helpers stream archives through it.
pub fn init_logging() {
    TRACING_INIT.get_or_init(|| {
        let session_file = SESSION_FILE.get_or_init(SessionFile::default);
        let env_filter = build_env_filter_from(
            std::env::var(LOG_ENV).ok().as_deref(),
            std::env::var("RUST_LOG").ok().as_deref(),
        );

        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_timer(UtcTime::rfc_3339());
        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_timer(UtcTime::rfc_3339())
            .with_writer(session_file);

        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(json_layer)
            .try_init();
    });
}

/// Keeps the session log open and the `session` span entered on this thread.
pub struct SessionLog {
    span: Option<EnteredSpan>,
    path: PathBuf,
}

impl SessionLog {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLog {
    fn drop(&mut self) {
        debug!(event = "session_log.close", path = %self.path.display(), "session_log.close");
        drop(self.span.take());
        if let Some(file) = SESSION_FILE.get() {
            let _ = file.close();
        }
    }
}

/// Opens `<backup_root>/logs/<session_id>-<kind>.ndjson` (or the same name below
/// `BACKUPFS_LOG_DIR`). Every event until the guard drops carries the session id and kind.
pub fn open_session_log(
    kind: SessionKind,
    session_id: &SessionId,
    backup_root: &Path,
) -> std::io::Result<SessionLog> {
    init_logging();

    let dir = log_dir(backup_root);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{}-{}.ndjson", session_id, kind.as_str()));
    SESSION_FILE.get_or_init(SessionFile::default).open(&path)?;

    let span = info_span!("session", session_id = %session_id, kind = kind.as_str()).entered();
    debug!(event = "session_log.open", path = %path.display(), "session_log.open");
    Ok(SessionLog {
        span: Some(span),
        path,
    })
}

fn log_dir(backup_root: &Path) -> PathBuf {
    match std::env::var_os(LOG_DIR_ENV).filter(|v| !v.is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => backup_root.join("logs"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_filter_precedence_is_backupfs_then_rust_log_then_default() {
        let f1 = build_env_filter_from(Some("debug"), Some("warn"));
        let f2 = build_env_filter_from(None, Some("warn"));
        let f3 = build_env_filter_from(None, None);

        assert_eq!(f1.to_string(), "debug");
        assert_eq!(f2.to_string(), "warn");
        assert_eq!(f3.to_string(), "info");
    }

    #[test]
    fn closed_session_file_discards_events() {
        let file = SessionFile::default();
        let mut writer = file.make_writer();
        assert_eq!(writer.write(b"{}\n").unwrap(), 3);
        writer.flush().unwrap();
    }

    #[test]
    fn session_log_lines_carry_the_session_span() {
        let temp = tempfile::tempdir().unwrap();
        let id = SessionId::from_unix_secs(1_704_067_200);
        let log = open_session_log(SessionKind::Remote, &id, temp.path()).unwrap();

        assert_eq!(log.path(), temp.path().join("logs/65920080-remote.ndjson"));
        assert!(open_session_log(SessionKind::Local, &id, temp.path()).is_err());

        tracing::info!(event = "remote.phase", phase = "capture", "remote.phase");
        tracing::info!(event = "remote.phase", phase = "replay", "remote.phase");

        let path = log.path().to_path_buf();
        drop(log);

        let text = std::fs::read_to_string(&path).unwrap();
        let mut in_span = 0;
        for line in text.lines() {
            let v: serde_json::Value = serde_json::from_str(line).expect("valid json line");
            assert!(v.get("timestamp").is_some());
            assert!(v["fields"].get("event").is_some(), "fields missing event");
            if v["span"]["session_id"] == "65920080" {
                assert_eq!(v["span"]["kind"], "remote");
                in_span += 1;
            }
        }
        assert!(in_span >= 2, "{text}");
    }
}
