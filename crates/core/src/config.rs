use std::path::{Path, PathBuf};

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::journal::DEFAULT_JOURNAL_FILE;
use crate::layout::DEFAULT_DIR_MODE;
use crate::remote::DEFAULT_REMOTE_USER;
use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;
pub const CONFIG_DIR_ENV: &str = "BACKUPFS_CONFIG_DIR";
pub const DEFAULT_CONFIG_DIR: &str = "/etc/backupfs";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default)]
    pub layout: LayoutSettings,
    #[serde(default)]
    pub remote: RemoteSettings,
    #[serde(default)]
    pub programs: Programs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutSettings {
    /// Mode forced on each of `YYYY`, `YYYY/MM` and `YYYY/MM/DD`.
    pub dir_mode: u32,
    /// Journal file name, kept in the source root.
    pub journal_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    pub user: String,
    pub ssh_program: String,
    /// Relative paths are resolved against the backup root.
    pub identity_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Programs {
    pub tar: String,
    pub mkdir_helper: String,
    pub mklink_helper: String,
}

impl Default for LayoutSettings {
    fn default() -> Self {
        Self {
            dir_mode: DEFAULT_DIR_MODE,
            journal_file: DEFAULT_JOURNAL_FILE.to_string(),
        }
    }
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            user: DEFAULT_REMOTE_USER.to_string(),
            ssh_program: "ssh".to_string(),
            identity_file: ".id_rsa".to_string(),
        }
    }
}

impl Default for Programs {
    fn default() -> Self {
        Self {
            tar: "tar".to_string(),
            mkdir_helper: "backupfs-mkdir".to_string(),
            mklink_helper: "backupfs-mklink".to_string(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            layout: LayoutSettings::default(),
            remote: RemoteSettings::default(),
            programs: Programs::default(),
        }
    }
}

impl Settings {
    pub fn identity_path(&self, backup_root: &Path) -> PathBuf {
        backup_root.join(&self.remote.identity_file)
    }
}

/// `--config-dir`, then `BACKUPFS_CONFIG_DIR`, then `/etc/backupfs`.
pub fn resolve_config_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    match std::env::var_os(CONFIG_DIR_ENV) {
        Some(v) if !v.is_empty() => PathBuf::from(v),
        _ => PathBuf::from(DEFAULT_CONFIG_DIR),
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

/// Reads `config.toml` from `config_dir`; a missing file yields the defaults.
pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    let settings = parse_settings(&text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn parse_settings(text: &str) -> std::result::Result<Settings, toml::de::Error> {
    let raw: toml::Value = toml::from_str(text)?;
    let version = raw
        .get("version")
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok());

    match version {
        Some(SETTINGS_SCHEMA_VERSION) => toml::from_str::<Settings>(text),
        Some(other) => Err(toml::de::Error::custom(format!(
            "unsupported settings schema version: {other} (expected {SETTINGS_SCHEMA_VERSION})"
        ))),
        None => Err(toml::de::Error::custom(format!(
            "missing settings schema version (expected {SETTINGS_SCHEMA_VERSION})"
        ))),
    }
}

pub fn to_toml(settings: &Settings) -> Result<String> {
    validate_settings(settings)?;
    toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.version != SETTINGS_SCHEMA_VERSION {
        return Err(Error::InvalidConfig {
            message: format!(
                "settings.version must be {SETTINGS_SCHEMA_VERSION} (got {})",
                settings.version
            ),
        });
    }

    if settings.layout.dir_mode > 0o7777 {
        return Err(Error::InvalidConfig {
            message: format!(
                "layout.dir_mode must be <= 0o7777 (got {:#o})",
                settings.layout.dir_mode
            ),
        });
    }

    let journal = settings.layout.journal_file.trim();
    if journal.is_empty() || journal.contains('/') || journal == "." || journal == ".." {
        return Err(Error::InvalidConfig {
            message: "layout.journal_file must be a plain file name".to_string(),
        });
    }

    if settings.remote.user.trim().is_empty() || settings.remote.user.contains(char::is_whitespace)
    {
        return Err(Error::InvalidConfig {
            message: "remote.user must be a non-empty name without spaces".to_string(),
        });
    }
    if settings.remote.identity_file.trim().is_empty() {
        return Err(Error::InvalidConfig {
            message: "remote.identity_file must not be empty".to_string(),
        });
    }

    for (name, value) in [
        ("remote.ssh_program", &settings.remote.ssh_program),
        ("programs.tar", &settings.programs.tar),
        ("programs.mkdir_helper", &settings.programs.mkdir_helper),
        ("programs.mklink_helper", &settings.programs.mklink_helper),
    ] {
        if value.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: format!("{name} must not be empty"),
            });
        }
    }

    Ok(())
}
