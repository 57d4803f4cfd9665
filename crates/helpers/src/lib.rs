//! Entry-point plumbing shared by the programs that run on either end of a remote backup.

use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;

use backupfs_core::config::{Settings, load_settings, resolve_config_dir};
use backupfs_core::{Error, Result};
use tracing::debug;

/// Positional arguments after the program name.
pub fn positional_args() -> Vec<OsString> {
    std::env::args_os().skip(1).collect()
}

pub fn usage(program: &str, synopsis: &str) -> Error {
    Error::InvalidConfig {
        message: format!("usage: {program} {synopsis}"),
    }
}

pub fn utf8_arg(arg: &OsString, what: &str) -> Result<String> {
    arg.to_str().map(str::to_string).ok_or_else(|| Error::InvalidConfig {
        message: format!("{what} is not valid UTF-8"),
    })
}

pub fn path_arg(arg: &OsString) -> PathBuf {
    PathBuf::from(arg)
}

/// Settings from the default config directory, or `BACKUPFS_CONFIG_DIR`.
pub fn settings() -> Result<Settings> {
    load_settings(&resolve_config_dir(None))
}

/// Exits 0 on success; otherwise prints one diagnostic line and exits 1.
pub fn finish(program: &str, result: Result<()>) -> ! {
    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            debug!(event = "helper.failed", program, error = %e, "helper.failed");
            let _ = writeln!(std::io::stderr(), "{program}: {e}");
            std::process::exit(1);
        }
    }
}
