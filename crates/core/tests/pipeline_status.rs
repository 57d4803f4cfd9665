use std::sync::{Mutex, MutexGuard};

use backupfs_core::ProcessPipeline;
use backupfs_core::pipeline::CommandSpec;

// Pipeline runs change process-wide signal dispositions.
static SIGNALS: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    let guard = SIGNALS.lock().unwrap_or_else(|e| e.into_inner());
    // A harness started in the background inherits an ignored SIGINT.
    // SAFETY: installs the default disposition; no handler code runs.
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_DFL);
    }
    guard
}

fn sigint_handler() -> libc::sighandler_t {
    // SAFETY: a null new action only queries the current disposition.
    unsafe {
        let mut current: libc::sigaction = std::mem::zeroed();
        assert_eq!(
            libc::sigaction(libc::SIGINT, std::ptr::null(), &mut current),
            0
        );
        current.sa_sigaction
    }
}

#[test]
fn failing_producer_is_reported_per_slot() {
    let _serial = serial();
    let status = ProcessPipeline::chain(
        CommandSpec::new("sh").args(["-c", "exit 3"]),
        CommandSpec::new("true"),
    )
    .run()
    .unwrap();

    assert!(!status.succeeded());
    assert_eq!(status.producer().unwrap().exit_code, Some(3));
    assert!(status.consumer().unwrap().succeeded());
    assert_eq!(status.to_string(), "exit 3 | exit 0");
}

#[test]
fn failing_consumer_is_reported_per_slot() {
    let _serial = serial();
    let status = ProcessPipeline::chain(
        CommandSpec::new("echo").arg("hello"),
        CommandSpec::new("sh").args(["-c", "cat >/dev/null; exit 4"]),
    )
    .run()
    .unwrap();

    assert!(status.producer().unwrap().succeeded());
    assert_eq!(status.consumer().unwrap().exit_code, Some(4));
    assert!(!status.succeeded());
}

#[test]
fn missing_program_is_an_error_not_a_status() {
    let _serial = serial();
    let err = ProcessPipeline::single(CommandSpec::new("/nonexistent/backupfs-test-program"))
        .run()
        .unwrap_err();
    assert!(err.to_string().contains("spawn failed"), "{err}");
}

#[test]
fn child_killed_by_interrupt_reports_the_signal() {
    let _serial = serial();
    let status = ProcessPipeline::single(CommandSpec::new("sh").args(["-c", "kill -INT $$"]))
        .run()
        .unwrap();

    let slot = status.producer().unwrap();
    assert!(slot.exited);
    assert!(!slot.normal_exit);
    assert_eq!(slot.signal, Some(libc::SIGINT));
    assert_eq!(slot.exit_code, None);
    assert!(!status.succeeded());
}

#[test]
fn interrupt_sent_to_the_parent_is_ignored_during_a_run() {
    let _serial = serial();
    let status = ProcessPipeline::chain(
        CommandSpec::new("sh").args(["-c", "kill -INT $PPID; echo done"]),
        CommandSpec::new("cat"),
    )
    .run()
    .unwrap();

    // Still here: the interrupt reached this process while it was ignored.
    assert!(status.succeeded(), "{status}");
}

#[test]
fn interrupt_disposition_is_restored_after_a_run() {
    let _serial = serial();
    let before = sigint_handler();

    ProcessPipeline::single(CommandSpec::new("true")).run().unwrap();
    assert_eq!(sigint_handler(), before);

    ProcessPipeline::single(CommandSpec::new("sh").args(["-c", "kill -INT $$"]))
        .run()
        .unwrap();
    assert_eq!(sigint_handler(), before);
    assert_eq!(before, libc::SIG_DFL);
}
