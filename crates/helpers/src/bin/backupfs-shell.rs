//! Login shell for the backup account on a source host: runs allow-listed commands only.

use std::io::Write;
use std::os::unix::process::CommandExt;
use std::process::Command;

use backupfs_core::gatekeeper;
use backupfs_core::logging::init_logging;
use backupfs_helpers::positional_args;
use tracing::{info, warn};

const PROGRAM: &str = "backupfs-shell";

fn main() {
    init_logging();
    std::process::exit(run());
}

fn run() -> i32 {
    let args = positional_args();
    let command_line = match args.as_slice() {
        [flag, line] if flag == "-c" => match line.to_str() {
            Some(line) => line.to_string(),
            None => return reject("command line is not valid UTF-8", 1),
        },
        _ => return reject("interactive login not allowed", 1),
    };

    let argv = match gatekeeper::check(&command_line) {
        Ok(argv) => argv,
        Err(rejection) => {
            warn!(
                event = "shell.rejected",
                command = %command_line,
                code = rejection.exit_code(),
                "shell.rejected"
            );
            return reject(&rejection.to_string(), rejection.exit_code());
        }
    };
    info!(event = "shell.exec", command = %command_line, "shell.exec");

    let err = Command::new(&argv[0]).args(&argv[1..]).exec();
    reject(&format!("{}: {err}", argv[0]), 1)
}

fn reject(message: &str, code: i32) -> i32 {
    let _ = writeln!(std::io::stderr(), "{PROGRAM}: {message}");
    code
}
