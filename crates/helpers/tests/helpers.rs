use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use tempfile::TempDir;

fn shell(command_line: &str) -> Output {
    Command::new(env!("CARGO_BIN_EXE_backupfs-shell"))
        .args(["-c", command_line])
        .output()
        .unwrap()
}

fn with_stdin(mut command: Command, input: &[u8]) -> Output {
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child.stdin.take().unwrap().write_all(input).unwrap();
    child.wait_with_output().unwrap()
}

#[test]
fn shell_rejects_with_class_specific_codes() {
    assert_eq!(shell("ls /").status.code(), Some(1));
    assert_eq!(shell("cat").status.code(), Some(2));
    assert_eq!(shell("cat /etc/passwd").status.code(), Some(3));
    assert_eq!(shell("rm").status.code(), Some(4));
    assert_eq!(shell("rm -f").status.code(), Some(5));
    assert_eq!(shell("rm -rf tar-web1-00000001").status.code(), Some(7));
}

#[test]
fn shell_refuses_interactive_login() {
    let out = Command::new(env!("CARGO_BIN_EXE_backupfs-shell"))
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(1));
    assert!(!out.stderr.is_empty());
}

#[test]
fn chksrc_prints_one_record_per_ancestor() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("src");
    std::fs::create_dir(&source).unwrap();

    let out = Command::new(env!("CARGO_BIN_EXE_backupfs-chksrc"))
        .arg(&source)
        .output()
        .unwrap();
    assert!(out.status.success());
    let text = String::from_utf8(out.stdout).unwrap();
    let last = text.lines().last().unwrap();
    let rel = source.strip_prefix("/").unwrap().to_str().unwrap();
    assert!(last.ends_with(&format!(" {rel}")), "{last}");
    assert_eq!(text.lines().count(), source.components().count() - 1);
}

#[test]
fn chksrc_fails_for_missing_source() {
    let temp = TempDir::new().unwrap();
    let out = Command::new(env!("CARGO_BIN_EXE_backupfs-chksrc"))
        .arg(temp.path().join("missing"))
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn mkdir_creates_directories_relative_to_cwd() {
    let temp = TempDir::new().unwrap();
    let dated = temp.path().join("2024/01/02");
    std::fs::create_dir_all(&dated).unwrap();
    let meta = std::fs::metadata(temp.path()).unwrap();
    let line = format!(
        "0x{:08x} 0x{:08x} 0x{:08x} srv\n",
        std::os::unix::fs::MetadataExt::uid(&meta),
        std::os::unix::fs::MetadataExt::gid(&meta),
        0o040_750
    );

    let mut command = Command::new(env!("CARGO_BIN_EXE_backupfs-mkdir"));
    command
        .arg(&dated)
        .current_dir(&dated)
        .env("BACKUPFS_ALLOW_NON_ROOT", "1");
    let out = with_stdin(command, line.as_bytes());
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let mode = std::fs::metadata(dated.join("srv")).unwrap().permissions().mode();
    assert_eq!(mode & 0o7777, 0o750);
}

#[test]
fn mklink_without_previous_backup_is_a_no_op() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let dated = root.join("2024/01/02");
    std::fs::create_dir_all(&dated).unwrap();

    let mut command = Command::new(env!("CARGO_BIN_EXE_backupfs-mklink"));
    command
        .arg(root)
        .arg(&dated)
        .arg(Path::new("/srv/data"))
        .env("BACKUPFS_ALLOW_NON_ROOT", "1");
    let out = with_stdin(command, b"");
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
}

#[test]
fn mklink_rejects_a_malformed_header() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let dated = root.join("2024/01/02");
    std::fs::create_dir_all(&dated).unwrap();

    let mut command = Command::new(env!("CARGO_BIN_EXE_backupfs-mklink"));
    command
        .arg(root)
        .arg(&dated)
        .arg("/srv/data")
        .env("BACKUPFS_ALLOW_NON_ROOT", "1");
    let out = with_stdin(command, b"not-a-time\n");
    assert_eq!(out.status.code(), Some(1));
}
