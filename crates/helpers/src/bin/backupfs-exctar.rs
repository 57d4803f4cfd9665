//! Streams a tar archive of the files listed in a session's tar manifest to stdout.

use std::os::unix::process::CommandExt;
use std::process::Command;

use backupfs_core::layout::normalize_absolute;
use backupfs_core::remote::{RemoteArtifacts, validate_host_name};
use backupfs_core::logging::init_logging;
use backupfs_core::{Error, Result, SessionId};
use backupfs_helpers::{finish, path_arg, positional_args, settings, usage, utf8_arg};

const PROGRAM: &str = "backupfs-exctar";

fn main() {
    init_logging();
    finish(PROGRAM, run());
}

fn run() -> Result<()> {
    let args = positional_args();
    let [source, host, session_id] = args.as_slice() else {
        return Err(usage(PROGRAM, "<source> <host> <session-id>"));
    };
    let source = normalize_absolute(&path_arg(source), "source")?;
    let host = utf8_arg(host, "host")?;
    validate_host_name(&host)?;
    let session_id = SessionId::parse(&utf8_arg(session_id, "session id")?)?;
    let list = std::env::current_dir()?.join(RemoteArtifacts::new(&host, &session_id).tar);
    let tar = settings()?.programs.tar;

    let mut command = Command::new(&tar);
    command
        .arg("-c")
        .arg("-C")
        .arg(&source)
        .arg("-T")
        .arg(&list)
        .args(["-f", "-"]);
    // Only returns on failure.
    let err = command.exec();
    Err(Error::Command {
        command: tar,
        message: err.to_string(),
    })
}
