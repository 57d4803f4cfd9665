use crate::{Error, Result};

/// Lets tests and unprivileged setups run the privileged programs.
pub const ALLOW_NON_ROOT_ENV: &str = "BACKUPFS_ALLOW_NON_ROOT";

/// Owner and mode can only be replicated faithfully as root.
pub fn require_root(program: &str) -> Result<()> {
    if std::env::var_os(ALLOW_NON_ROOT_ENV).is_some_and(|v| !v.is_empty()) {
        return Ok(());
    }
    // SAFETY: geteuid has no preconditions.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Err(Error::InvalidConfig {
            message: format!("{program}: must be root (set {ALLOW_NON_ROOT_ENV} to override)"),
        });
    }
    Ok(())
}

/// Sets the file creation mask, returning the previous one.
pub fn set_umask(mask: u32) -> u32 {
    // SAFETY: umask has no preconditions and cannot fail.
    unsafe { libc::umask(mask as libc::mode_t) as u32 }
}
