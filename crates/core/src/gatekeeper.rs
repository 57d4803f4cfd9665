//! Allow-list for commands arriving over the restricted remote login.

/// Command names a backup host may run on a source host.
pub const ALLOWED_COMMANDS: [&str; 5] = [
    "backupfs-chksrc",
    "backupfs-remote",
    "backupfs-exctar",
    "cat",
    "rm",
];

/// Prefixes of the artifact files `cat` and `rm` may touch.
pub const ARTIFACT_PREFIXES: [&str; 3] = ["dirs-", "links-", "tar-"];

const MAX_ARGS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("no command given")]
    NoCommand,
    #[error("{count}: command line too long")]
    TooLong { count: usize },
    #[error("{command}: command not allowed")]
    NotAllowed { command: String },
    #[error("cat: no file given")]
    CatWithoutFile,
    #[error("cat {file}: file not allowed")]
    CatFileNotAllowed { file: String },
    #[error("rm: no arguments given")]
    RmWithoutArguments,
    #[error("rm: no file given")]
    RmWithoutFile,
    #[error("rm {file}: file not allowed")]
    RmFileNotAllowed { file: String },
}

impl Rejection {
    /// Distinct per class so audit logs can tell rejections apart.
    pub fn exit_code(&self) -> i32 {
        match self {
            Rejection::NoCommand | Rejection::TooLong { .. } | Rejection::NotAllowed { .. } => 1,
            Rejection::CatWithoutFile => 2,
            Rejection::CatFileNotAllowed { .. } => 3,
            Rejection::RmWithoutArguments => 4,
            Rejection::RmWithoutFile => 5,
            Rejection::RmFileNotAllowed { .. } => 7,
        }
    }
}

/// A bare artifact name in the login directory.
pub fn is_artifact_name(name: &str) -> bool {
    !name.contains('/') && ARTIFACT_PREFIXES.iter().any(|p| name.starts_with(p) && name.len() > p.len())
}

/// Splits `command_line` on whitespace and returns the argv to execute, or why it is
/// refused.
pub fn check(command_line: &str) -> Result<Vec<String>, Rejection> {
    let argv: Vec<String> = command_line.split_whitespace().map(str::to_string).collect();
    if argv.len() > MAX_ARGS {
        return Err(Rejection::TooLong { count: argv.len() });
    }
    let Some(command) = argv.first() else {
        return Err(Rejection::NoCommand);
    };
    if !ALLOWED_COMMANDS.contains(&command.as_str()) {
        return Err(Rejection::NotAllowed {
            command: command.clone(),
        });
    }

    match command.as_str() {
        "cat" => {
            if argv.len() < 2 {
                return Err(Rejection::CatWithoutFile);
            }
            if let Some(file) = argv[1..].iter().find(|f| !is_artifact_name(f)) {
                return Err(Rejection::CatFileNotAllowed { file: file.clone() });
            }
        }
        "rm" => {
            if argv.len() < 2 {
                return Err(Rejection::RmWithoutArguments);
            }
            let (options, files): (Vec<&String>, Vec<&String>) =
                argv[1..].iter().partition(|a| a.starts_with('-'));
            if let Some(option) = options.iter().find(|o| o.as_str() != "-f") {
                return Err(Rejection::RmFileNotAllowed {
                    file: (*option).clone(),
                });
            }
            if files.is_empty() {
                return Err(Rejection::RmWithoutFile);
            }
            if let Some(file) = files.iter().find(|f| !is_artifact_name(f)) {
                return Err(Rejection::RmFileNotAllowed {
                    file: (*file).clone(),
                });
            }
        }
        _ => {}
    }
    Ok(argv)
}
