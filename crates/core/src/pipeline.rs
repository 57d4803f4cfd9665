use std::ffi::OsString;
use std::fmt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, error};

use crate::{Error, Result};

/// Signal dispositions are process-wide, so pipelines never overlap.
static PIPELINE_LOCK: Mutex<()> = Mutex::new(());

/// One external program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Termination of one pipeline slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SlotStatus {
    /// The process was reaped.
    pub exited: bool,
    /// It called exit rather than being killed by a signal.
    pub normal_exit: bool,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl SlotStatus {
    fn from_exit(status: ExitStatus) -> Self {
        Self {
            exited: true,
            normal_exit: status.code().is_some(),
            exit_code: status.code(),
            signal: status.signal(),
        }
    }

    /// A slot reaped after exiting normally with `code`.
    pub fn exited_with(code: i32) -> Self {
        Self {
            exited: true,
            normal_exit: true,
            exit_code: Some(code),
            signal: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exited && self.normal_exit && self.exit_code == Some(0)
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.exited, self.exit_code, self.signal) {
            (false, _, _) => write!(f, "not reaped"),
            (true, Some(code), _) => write!(f, "exit {code}"),
            (true, None, Some(sig)) => write!(f, "signal {sig}"),
            (true, None, None) => write!(f, "abnormal exit"),
        }
    }
}

/// Per-slot results of a pipeline run. Slot 0 is the producer, slot 1 the consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStatus {
    slots: [SlotStatus; 2],
    used: usize,
}

impl PipelineStatus {
    /// Status of a one- or two-command pipeline, producer first. Extra slots are ignored.
    pub fn from_slots(slots: &[SlotStatus]) -> Self {
        let mut status = Self::default();
        for (dst, src) in status.slots.iter_mut().zip(slots) {
            *dst = *src;
            status.used += 1;
        }
        status
    }

    pub fn producer(&self) -> Option<&SlotStatus> {
        self.slots[..self.used].first()
    }

    pub fn consumer(&self) -> Option<&SlotStatus> {
        self.slots[..self.used].get(1)
    }

    pub fn slots(&self) -> &[SlotStatus] {
        &self.slots[..self.used]
    }

    /// Every used slot exited normally with status 0.
    pub fn succeeded(&self) -> bool {
        self.used > 0 && self.slots().iter().all(SlotStatus::succeeded)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.slots().iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join(" | "))
    }
}

/// One command, or two with the first's stdout feeding the second's stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessPipeline {
    producer: CommandSpec,
    consumer: Option<CommandSpec>,
}

impl ProcessPipeline {
    pub fn single(command: CommandSpec) -> Self {
        Self {
            producer: command,
            consumer: None,
        }
    }

    pub fn chain(producer: CommandSpec, consumer: CommandSpec) -> Self {
        Self {
            producer,
            consumer: Some(consumer),
        }
    }

    pub fn producer(&self) -> &CommandSpec {
        &self.producer
    }

    pub fn consumer(&self) -> Option<&CommandSpec> {
        self.consumer.as_ref()
    }

    /// Spawns the commands with interrupt and quit ignored in this process, waits for
    /// every child, and restores signal handling before returning.
    ///
    /// `Err` means a command could not be started; how the commands ended is reported
    /// through the returned status.
    pub fn run(&self) -> Result<PipelineStatus> {
        let _lock = PIPELINE_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let guard = SignalGuard::install()?;
        debug!(event = "pipeline.start", pipeline = %self, "pipeline.start");

        let mut status = PipelineStatus::default();
        let mut producer_cmd = self.producer.to_command();
        guard.restore_in_child(&mut producer_cmd);

        match &self.consumer {
            None => {
                let mut child = producer_cmd
                    .spawn()
                    .map_err(|e| spawn_error(&self.producer, e))?;
                status.used = 1;
                status.slots[0] = wait_slot(&mut child, &self.producer);
            }
            Some(consumer) => {
                producer_cmd.stdout(Stdio::piped());
                let mut producer = producer_cmd
                    .spawn()
                    .map_err(|e| spawn_error(&self.producer, e))?;
                let Some(stdout) = producer.stdout.take() else {
                    reap_abandoned(&mut producer);
                    return Err(Error::Command {
                        command: self.producer.to_string(),
                        message: "stdout was not captured".to_string(),
                    });
                };

                let mut consumer_cmd = consumer.to_command();
                consumer_cmd.stdin(Stdio::from(stdout));
                guard.restore_in_child(&mut consumer_cmd);
                let spawned = consumer_cmd.spawn();
                // Closes this process's copy of the pipe's read end.
                drop(consumer_cmd);
                let mut consumer_child = match spawned {
                    Ok(child) => child,
                    Err(e) => {
                        reap_abandoned(&mut producer);
                        return Err(spawn_error(consumer, e));
                    }
                };

                status.used = 2;
                status.slots[0] = wait_slot(&mut producer, &self.producer);
                status.slots[1] = wait_slot(&mut consumer_child, consumer);
            }
        }

        drop(guard);
        debug!(
            event = "pipeline.finish",
            pipeline = %self,
            status = %status,
            succeeded = status.succeeded(),
            "pipeline.finish"
        );
        Ok(status)
    }
}

impl fmt::Display for ProcessPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.consumer {
            Some(consumer) => write!(f, "{} | {}", self.producer, consumer),
            None => write!(f, "{}", self.producer),
        }
    }
}

/// Runs pipelines on behalf of the session and remote orchestration code.
pub trait PipelineRunner {
    fn run(&mut self, pipeline: &ProcessPipeline) -> Result<PipelineStatus>;
}

/// Runs real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl PipelineRunner for SystemRunner {
    fn run(&mut self, pipeline: &ProcessPipeline) -> Result<PipelineStatus> {
        pipeline.run()
    }
}

fn spawn_error(spec: &CommandSpec, e: std::io::Error) -> Error {
    Error::Command {
        command: spec.to_string(),
        message: format!("spawn failed: {e}"),
    }
}

/// `Child::wait` retries interrupted waits; any other failure leaves the slot unreaped.
fn wait_slot(child: &mut Child, spec: &CommandSpec) -> SlotStatus {
    match child.wait() {
        Ok(status) => SlotStatus::from_exit(status),
        Err(e) => {
            error!(
                event = "pipeline.wait_failed",
                command = %spec,
                pid = child.id(),
                error = %e,
                "pipeline.wait_failed"
            );
            SlotStatus::default()
        }
    }
}

fn reap_abandoned(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Ignores SIGINT and SIGQUIT and blocks SIGCHLD for its lifetime, restoring the saved
/// dispositions and mask on drop.
struct SignalGuard {
    saved_int: libc::sigaction,
    saved_quit: libc::sigaction,
    saved_mask: libc::sigset_t,
}

impl SignalGuard {
    fn install() -> Result<Self> {
        // SAFETY: zeroed sigaction/sigset_t are valid inputs to sigemptyset/sigaction, and
        // every pointer passed below refers to a live local.
        unsafe {
            let mut ignore: libc::sigaction = std::mem::zeroed();
            ignore.sa_sigaction = libc::SIG_IGN;
            libc::sigemptyset(&mut ignore.sa_mask);

            let mut saved_int: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(libc::SIGINT, &ignore, &mut saved_int) != 0 {
                return Err(signal_error("sigaction(SIGINT)", std::io::Error::last_os_error()));
            }
            let mut saved_quit: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(libc::SIGQUIT, &ignore, &mut saved_quit) != 0 {
                let e = std::io::Error::last_os_error();
                libc::sigaction(libc::SIGINT, &saved_int, std::ptr::null_mut());
                return Err(signal_error("sigaction(SIGQUIT)", e));
            }

            let mut block: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut block);
            libc::sigaddset(&mut block, libc::SIGCHLD);
            let mut saved_mask: libc::sigset_t = std::mem::zeroed();
            let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &block, &mut saved_mask);
            if rc != 0 {
                libc::sigaction(libc::SIGINT, &saved_int, std::ptr::null_mut());
                libc::sigaction(libc::SIGQUIT, &saved_quit, std::ptr::null_mut());
                return Err(signal_error(
                    "pthread_sigmask",
                    std::io::Error::from_raw_os_error(rc),
                ));
            }

            Ok(Self {
                saved_int,
                saved_quit,
                saved_mask,
            })
        }
    }

    /// Makes the child put back the saved handlers and mask before exec, so interrupts
    /// reach the external program.
    fn restore_in_child(&self, cmd: &mut Command) {
        let saved_int = self.saved_int;
        let saved_quit = self.saved_quit;
        let saved_mask = self.saved_mask;
        // SAFETY: the closure only calls async-signal-safe functions on copied values.
        unsafe {
            cmd.pre_exec(move || {
                if libc::sigaction(libc::SIGINT, &saved_int, std::ptr::null_mut()) != 0
                    || libc::sigaction(libc::SIGQUIT, &saved_quit, std::ptr::null_mut()) != 0
                {
                    return Err(std::io::Error::last_os_error());
                }
                let rc =
                    libc::pthread_sigmask(libc::SIG_SETMASK, &saved_mask, std::ptr::null_mut());
                if rc != 0 {
                    return Err(std::io::Error::from_raw_os_error(rc));
                }
                Ok(())
            });
        }
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        // SAFETY: restores values captured by `install`.
        unsafe {
            if libc::sigaction(libc::SIGINT, &self.saved_int, std::ptr::null_mut()) != 0
                || libc::sigaction(libc::SIGQUIT, &self.saved_quit, std::ptr::null_mut()) != 0
            {
                error!(
                    event = "pipeline.signal_restore_failed",
                    error = %std::io::Error::last_os_error(),
                    "pipeline.signal_restore_failed"
                );
            }
            let rc = libc::pthread_sigmask(libc::SIG_SETMASK, &self.saved_mask, std::ptr::null_mut());
            if rc != 0 {
                error!(
                    event = "pipeline.signal_restore_failed",
                    error = %std::io::Error::from_raw_os_error(rc),
                    "pipeline.signal_restore_failed"
                );
            }
        }
    }
}

fn signal_error(op: &str, e: std::io::Error) -> Error {
    Error::Signal {
        message: format!("{op}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn single_command_reports_its_exit_code() {
        let status = ProcessPipeline::single(sh("exit 4")).run().unwrap();
        assert_eq!(status.slots().len(), 1);
        assert_eq!(status.producer().unwrap().exit_code, Some(4));
        assert!(status.consumer().is_none());
        assert!(!status.succeeded());
    }

    #[test]
    fn chained_commands_pass_data_through() {
        let temp = tempfile::tempdir().unwrap();
        let out = temp.path().join("out");
        let consumer = sh(&format!("cat > '{}'", out.display()));
        let status = ProcessPipeline::chain(sh("printf hello"), consumer)
            .run()
            .unwrap();
        assert!(status.succeeded());
        assert_eq!(std::fs::read(&out).unwrap(), b"hello");
    }

    #[test]
    fn signalled_child_is_not_a_normal_exit() {
        let status = ProcessPipeline::single(sh("kill -TERM $$")).run().unwrap();
        let slot = status.producer().unwrap();
        assert!(slot.exited);
        assert!(!slot.normal_exit);
        assert_eq!(slot.signal, Some(libc::SIGTERM));
        assert!(!slot.succeeded());
    }

    #[test]
    fn consumer_exiting_early_does_not_hang_the_producer() {
        let status = ProcessPipeline::chain(sh("yes"), sh("head -c 10 >/dev/null"))
            .run()
            .unwrap();
        assert!(status.producer().unwrap().exited);
        assert!(status.consumer().unwrap().succeeded());
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = ProcessPipeline::single(CommandSpec::new("/nonexistent/backupfs-test"))
            .run()
            .unwrap_err();
        assert!(matches!(err, Error::Command { .. }));
    }

    #[test]
    fn display_joins_both_commands() {
        let p = ProcessPipeline::chain(
            CommandSpec::new("tar").args(["-c", "-f", "-"]),
            CommandSpec::new("tar").arg("xpf").arg("-"),
        );
        assert_eq!(p.to_string(), "tar -c -f - | tar xpf -");
    }
}
