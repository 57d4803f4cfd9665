use std::fs::File;
use std::io::BufReader;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use backupfs_core::journal::DEFAULT_JOURNAL_FILE;
use backupfs_core::layout::DestinationLayout;
use backupfs_core::materialize::{DirRecord, materialize_dirs, materialize_links};
use backupfs_core::pipeline::CommandSpec;
use backupfs_core::{CaptureConfig, CaptureReport, ProcessPipeline, SessionId, run_capture};
use chrono::{DateTime, Local, TimeZone};
use tempfile::TempDir;

struct Hosts {
    _temp: TempDir,
    source: PathBuf,
    work: PathBuf,
    root: PathBuf,
}

impl Hosts {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("src");
        let work = temp.path().join("home");
        let root = temp.path().join("backups");
        for dir in [&source, &work, &root] {
            std::fs::create_dir_all(dir).unwrap();
        }
        std::fs::create_dir_all(source.join("nested")).unwrap();
        std::fs::write(source.join("a.txt"), b"alpha").unwrap();
        std::fs::write(source.join("nested/b.txt"), b"bravo").unwrap();
        Self {
            _temp: temp,
            source,
            work,
            root,
        }
    }

    fn dated(&self, now: DateTime<Local>) -> DestinationLayout {
        DestinationLayout::new(&self.root, now, 0o755).unwrap()
    }

    fn capture(&self, now: DateTime<Local>) -> CaptureReport {
        let layout = self.dated(now);
        run_capture(&CaptureConfig {
            source: self.source.clone(),
            dated_dir: layout.dated_dir().to_path_buf(),
            host: "web1".to_string(),
            session_id: SessionId::from_unix_secs(now.timestamp()),
            work_dir: self.work.clone(),
            now,
            journal_file: DEFAULT_JOURNAL_FILE.to_string(),
        })
        .unwrap()
    }

    /// Phases 3 to 5 as the backup host runs them, minus the ssh hop.
    fn replay(&self, now: DateTime<Local>, report: &CaptureReport) -> PathBuf {
        let layout = self.dated(now);
        layout.prepare().unwrap();
        let dated = layout.dated_dir();

        let dirs = BufReader::new(File::open(self.work.join(&report.artifacts.dirs)).unwrap());
        let summary = materialize_dirs(dirs, dated, Some(dated)).unwrap();
        assert_eq!(summary.failed, 0);

        let links = BufReader::new(File::open(self.work.join(&report.artifacts.links)).unwrap());
        materialize_links(links, &self.root, dated, &self.source).unwrap();

        let mirror = layout.mirror_dir(&self.source);
        let status = ProcessPipeline::chain(
            CommandSpec::new("tar")
                .args(["-c", "-C"])
                .arg(self.source.as_os_str())
                .arg("-T")
                .arg(self.work.join(&report.artifacts.tar).as_os_str())
                .args(["-f", "-"]),
            CommandSpec::new("tar").args(["xpf", "-"]).current_dir(&mirror),
        )
        .run()
        .unwrap();
        assert!(status.succeeded(), "{status}");
        mirror
    }
}

fn noon(y: i32, m: u32, d: u32) -> DateTime<Local> {
    Local.with_ymd_and_hms(y, m, d, 12, 0, 0).single().unwrap()
}

fn lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn first_capture_lists_everything_and_links_nothing() {
    let hosts = Hosts::new();
    let now = noon(2024, 1, 1);
    let report = hosts.capture(now);

    assert_eq!(report.strategy, "first-time");
    assert_eq!(report.links, 0);
    assert_eq!(report.previous_recorded_at, None);
    assert_eq!(report.artifacts.dirs, format!("dirs-web1-{:08x}", now.timestamp()));
    assert_eq!(
        std::fs::metadata(hosts.work.join(&report.artifacts.links)).unwrap().len(),
        0
    );
    assert_eq!(
        lines(&hosts.work.join(&report.artifacts.tar)),
        vec!["a.txt".to_string(), "nested/b.txt".to_string()]
    );

    let mirror = hosts.replay(now, &report);
    assert_eq!(std::fs::read(mirror.join("a.txt")).unwrap(), b"alpha");
    assert_eq!(std::fs::read(mirror.join("nested/b.txt")).unwrap(), b"bravo");
    assert!(!mirror.join(DEFAULT_JOURNAL_FILE).exists());
}

#[test]
fn second_capture_links_unchanged_files() {
    let hosts = Hosts::new();
    let day1 = noon(2024, 1, 1);
    let first = hosts.capture(day1);
    let mirror1 = hosts.replay(day1, &first);

    let b = hosts.source.join("nested/b.txt");
    std::fs::write(&b, b"bravo v2").unwrap();
    File::options()
        .write(true)
        .open(&b)
        .unwrap()
        .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000))
        .unwrap();

    let day2 = noon(2024, 1, 2);
    let second = hosts.capture(day2);
    assert_eq!(second.strategy, "recurrent");
    assert_eq!(second.previous_recorded_at, Some(day1.timestamp()));
    assert_eq!(second.links, 1);
    assert_eq!(
        lines(&hosts.work.join(&second.artifacts.tar)),
        vec!["nested/b.txt".to_string()]
    );

    let mirror2 = hosts.replay(day2, &second);
    assert_eq!(
        std::fs::metadata(mirror1.join("a.txt")).unwrap().ino(),
        std::fs::metadata(mirror2.join("a.txt")).unwrap().ino()
    );
    assert_eq!(std::fs::read(mirror2.join("nested/b.txt")).unwrap(), b"bravo v2");
    assert_eq!(std::fs::read(mirror1.join("nested/b.txt")).unwrap(), b"bravo");
}

#[test]
fn directory_replay_corrects_existing_modes() {
    let temp = TempDir::new().unwrap();
    let base = temp.path().join("dated");
    let target = base.join("srv");
    std::fs::create_dir_all(&target).unwrap();
    std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o700)).unwrap();
    let owner = std::fs::metadata(&target).unwrap();

    let record = DirRecord {
        uid: owner.uid(),
        gid: owner.gid(),
        mode: 0o040_755,
        path: PathBuf::from("srv"),
    };
    let summary = materialize_dirs(&record.to_line()[..], &base, Some(&base)).unwrap();
    assert_eq!(summary.corrected, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(
        std::fs::metadata(&target).unwrap().permissions().mode() & 0o7777,
        0o755
    );
}

#[test]
fn directory_replay_refuses_paths_outside_the_dated_dir() {
    let temp = TempDir::new().unwrap();
    let base = temp.path().join("dated");
    std::fs::create_dir_all(&base).unwrap();

    let record = DirRecord {
        uid: 0,
        gid: 0,
        mode: 0o040_755,
        path: temp.path().join("elsewhere"),
    };
    let summary = materialize_dirs(&record.to_line()[..], &base, Some(&base)).unwrap();
    assert_eq!(summary.failed, 1);
    assert!(!temp.path().join("elsewhere").exists());
}
