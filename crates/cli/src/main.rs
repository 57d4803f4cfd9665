use std::io::Write;
use std::path::{Path, PathBuf};

use backupfs_core::config::{load_settings, resolve_config_dir, to_toml};
use backupfs_core::layout::normalize_absolute;
use backupfs_core::privilege::{require_root, set_umask};
use backupfs_core::logging::{SessionKind, SessionLog, init_logging, open_session_log};
use backupfs_core::{
    APP_NAME, SessionConfig, SessionReport, SourceSpec, SystemRunner, run_local, run_remote,
};
use clap::Parser;
use serde::Serialize;
use tracing::warn;

#[derive(Parser)]
#[command(name = "backupfs")]
#[command(about = "Incremental backups into dated, hard-linked directory trees", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Print the effective settings as TOML and exit.
    #[arg(long)]
    print_config: bool,

    /// Tree to back up: `/path` on this host or `[user@]host:/path`.
    #[arg(required_unless_present = "print_config")]
    source: Option<String>,

    /// Backup root that receives the `YYYY/MM/DD` directories.
    #[arg(required_unless_present = "print_config")]
    dest: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging();
    let json = cli.json;
    let code = match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e, json);
            1
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = resolve_config_dir(cli.config_dir.as_deref());
    let settings = load_settings(&config_dir).map_err(map_core_err)?;

    if cli.print_config {
        let text = to_toml(&settings).map_err(map_core_err)?;
        print!("{text}");
        return Ok(());
    }

    let (Some(source), Some(dest)) = (cli.source, cli.dest) else {
        return Err(CliError::new("usage", "source and destination are required"));
    };
    require_root(APP_NAME).map_err(map_core_err)?;
    set_umask(0o022);

    let target = SourceSpec::parse(&source).map_err(map_core_err)?;
    let backup_root = normalize_absolute(&dest, "destination").map_err(map_core_err)?;
    let config = SessionConfig {
        source: target.path.clone(),
        backup_root: backup_root.clone(),
        now: chrono::Local::now(),
        settings,
    };

    let kind = match target.remote {
        Some(_) => SessionKind::Remote,
        None => SessionKind::Local,
    };
    let _session_log = start_session_log(kind, &config, &backup_root);

    let mut runner = SystemRunner;
    let report = match &target.remote {
        None => run_local(&config, &mut runner),
        Some(remote) => run_remote(&config, remote, &mut runner),
    }
    .map_err(map_core_err)?;

    emit_report(&report, cli.json);
    Ok(())
}

fn start_session_log(
    kind: SessionKind,
    config: &SessionConfig,
    backup_root: &Path,
) -> Option<SessionLog> {
    match open_session_log(kind, &config.session_id(), backup_root) {
        Ok(log) => Some(log),
        Err(e) => {
            warn!(
                event = "session_log.unavailable",
                dir = %backup_root.display(),
                error = %e,
                "session_log.unavailable"
            );
            None
        }
    }
}

fn emit_report(report: &SessionReport, json: bool) {
    if json {
        match serde_json::to_string(report) {
            Ok(line) => println!("{line}"),
            Err(e) => emit_error(&CliError::new("json.encode", e.to_string()), true),
        }
        return;
    }

    match report.kind {
        "remote" => println!(
            "{}: remote backup of {} complete",
            report.mirror_dir.display(),
            report.source.display()
        ),
        _ => println!(
            "{}: {} new, {} changed, {} unchanged ({})",
            report.mirror_dir.display(),
            report.stats.new,
            report.stats.changed,
            report.stats.unchanged,
            report.strategy
        ),
    }
}

fn map_core_err(e: backupfs_core::Error) -> CliError {
    use backupfs_core::Error;
    match e {
        Error::InvalidConfig { message } => CliError::new("config.invalid", message),
        e @ Error::SameDayBackup { .. } => CliError::new("backup.same_day", e.to_string()),
        e @ Error::DirectoryNotEmpty { .. } => {
            CliError::new("backup.dest_not_empty", e.to_string())
        }
        e @ Error::Journal { .. } => CliError::new("journal.invalid", e.to_string()),
        e @ Error::Command { .. } => CliError::new("command.failed", e.to_string()),
        e @ (Error::Io(_) | Error::PathIo { .. } | Error::Walkdir(_)) => {
            CliError::new("io", e.to_string())
        }
        other => CliError::new("unknown", other.to_string()),
    }
}

fn emit_error(e: &CliError, json: bool) {
    if json {
        let line = serde_json::to_string(e).unwrap_or_else(|_| {
            "{\"code\":\"unknown\",\"message\":\"json encode failed\"}".to_string()
        });
        let _ = writeln!(std::io::stderr(), "{line}");
    } else {
        let _ = writeln!(std::io::stderr(), "{APP_NAME}: {}", e.message);
    }
}
