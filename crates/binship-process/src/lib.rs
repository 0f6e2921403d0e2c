//! Process execution for binship.
//!
//! Every external command the pipeline runs (hooks, compilers, archivers,
//! signers, publishers) goes through [`run`]. It captures stdout, stderr and
//! their interleaved combination, and enforces both a per-command timeout and
//! the run-wide [`CancelToken`]. A command that is stopped is killed together
//! with its process group, so no orphan outlives the run.
//!
//! # Example
//!
//! ```ignore
//! use binship_process::{CancelToken, CommandSpec, run};
//!
//! let out = run(&CommandSpec::new("cargo").arg("--version"), &CancelToken::new()).expect("run");
//! assert!(out.success());
//! assert!(out.stdout.contains("cargo"));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const READER_GRACE: Duration = Duration::from_secs(2);
const GROUP_KILL_SHELL: &str = "sh";

/// Why a running command was stopped before it exited on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    DeadlineExceeded,
}

/// Shared cancellation flag plus an optional run-wide deadline.
///
/// Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token whose deadline is `budget` from now.
    pub fn with_timeout(budget: Duration) -> Self {
        Self {
            flag: Arc::default(),
            deadline: Some(Instant::now() + budget),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time left before the deadline; `None` without one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// An explicit cancel wins over an elapsed deadline.
    pub fn stop_reason(&self) -> Option<StopReason> {
        if self.is_cancelled() {
            Some(StopReason::Cancelled)
        } else if self.deadline_passed() {
            Some(StopReason::DeadlineExceeded)
        } else {
            None
        }
    }
}

/// A command to run: program, arguments, working directory, environment
/// overlay and an optional timeout of its own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Run `line` through the platform shell (`sh -c` / `cmd /C`).
    pub fn shell(line: impl Into<String>) -> Self {
        let line = line.into();
        if cfg!(windows) {
            Self::new("cmd").arg("/C").arg(line)
        } else {
            Self::new("sh").arg("-c").arg(line)
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<'a>(mut self, vars: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        for (k, v) in vars {
            self.env.insert(k.clone(), v.clone());
        }
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).envs(&self.env);
        if let Some(dir) = &self.dir {
            command.current_dir(dir);
        }
        command
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) {
                write!(f, " {arg:?}")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Result of a command execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandOutput {
    /// `None` when the process was killed or ended by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// stdout and stderr interleaved line by line in arrival order.
    pub combined: String,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }

    pub fn stopped(&self) -> bool {
        self.timed_out || self.cancelled
    }

    /// Human readable exit status (`exit status 2`, `timed out`, ...).
    pub fn status_text(&self) -> String {
        if self.timed_out {
            "timed out".to_string()
        } else if self.cancelled {
            "cancelled".to_string()
        } else {
            match self.exit_code {
                Some(code) => format!("exit status {code}"),
                None => "terminated by signal".to_string(),
            }
        }
    }
}

/// Run a command to completion, or until its timeout or `cancel` stops it.
///
/// Only a spawn or poll failure is an `Err`; a non-zero exit or a stopped
/// command is reported through [`CommandOutput`].
pub fn run(spec: &CommandSpec, cancel: &CancelToken) -> Result<CommandOutput> {
    let start = Instant::now();
    let mut command = spec.to_command();
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn `{spec}`"))?;

    let combined = Arc::new(Mutex::new(String::new()));
    let stdout_reader = child
        .stdout
        .take()
        .map(|s| spawn_reader(s, Arc::clone(&combined)));
    let stderr_reader = child
        .stderr
        .take()
        .map(|s| spawn_reader(s, Arc::clone(&combined)));

    let own_deadline = spec.timeout.map(|t| start + t);
    let mut stop = None;
    let mut kill_failures = Vec::new();
    let status = loop {
        if let Some(status) = child.try_wait().context("failed to poll command")? {
            break Some(status);
        }

        let reason = if own_deadline.is_some_and(|d| Instant::now() >= d) {
            Some(StopReason::DeadlineExceeded)
        } else {
            cancel.stop_reason()
        };

        if let Some(reason) = reason {
            kill_failures = kill_tree(&mut child, Path::new(GROUP_KILL_SHELL));
            let _ = child.wait();
            stop = Some(reason);
            break None;
        }

        thread::sleep(POLL_INTERVAL);
    };

    // Descendants that escaped the kill may still hold the pipes open.
    let give_up = stop.map(|_| Instant::now() + READER_GRACE);
    let stdout = stdout_reader
        .map(|h| finish_reader(h, give_up))
        .unwrap_or_default();
    let mut stderr = stderr_reader
        .map(|h| finish_reader(h, give_up))
        .unwrap_or_default();
    let mut combined = combined.lock().map(|c| c.clone()).unwrap_or_default();

    if let Some(reason) = stop {
        let note = match reason {
            StopReason::DeadlineExceeded => format!(
                "command timed out after {}",
                humantime::format_duration(Duration::from_millis(start.elapsed().as_millis() as u64))
            ),
            StopReason::Cancelled => "command cancelled".to_string(),
        };
        let note = std::iter::once(note).chain(kill_failures).collect::<Vec<_>>().join("\n");
        for buf in [&mut stderr, &mut combined] {
            if !buf.is_empty() && !buf.ends_with('\n') {
                buf.push('\n');
            }
            buf.push_str(&note);
        }
    }

    Ok(CommandOutput {
        exit_code: status.and_then(|s| s.code()),
        stdout,
        stderr,
        combined,
        timed_out: stop == Some(StopReason::DeadlineExceeded),
        cancelled: stop == Some(StopReason::Cancelled),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

/// Check if a command exists in PATH
pub fn command_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Get the full path to a command
pub fn which(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

/// Resolve `path` against `root` unless it is already absolute.
pub fn resolve_dir(root: &Path, path: Option<&Path>) -> PathBuf {
    match path {
        Some(p) if p.is_absolute() => p.to_path_buf(),
        Some(p) => root.join(p),
        None => root.to_path_buf(),
    }
}

fn spawn_reader<R>(stream: R, combined: Arc<Mutex<String>>) -> JoinHandle<String>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut own = String::new();
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let chunk = String::from_utf8_lossy(&buf);
                    own.push_str(&chunk);
                    if let Ok(mut c) = combined.lock() {
                        c.push_str(&chunk);
                    }
                }
            }
        }
        own
    })
}

fn finish_reader(handle: JoinHandle<String>, give_up: Option<Instant>) -> String {
    if let Some(limit) = give_up {
        while !handle.is_finished() && Instant::now() < limit {
            thread::sleep(POLL_INTERVAL);
        }
        if !handle.is_finished() {
            return String::new();
        }
    }
    handle.join().unwrap_or_default()
}

/// Kill the child and, on unix, every process in its group through
/// `shell -c "kill -9 -<pgid>"`. Returns a note for each step that failed.
#[cfg_attr(not(unix), allow(unused_variables))]
fn kill_tree(child: &mut Child, shell: &Path) -> Vec<String> {
    let mut failures = Vec::new();
    #[cfg(unix)]
    {
        let group_kill = format!("kill -9 -{}", child.id());
        match Command::new(shell)
            .arg("-c")
            .arg(&group_kill)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => {}
            Ok(status) => failures.push(format!(
                "failed to kill process group: `{group_kill}` ended with {status}"
            )),
            Err(e) => failures.push(format!(
                "failed to kill process group: cannot run {}: {e}",
                shell.display()
            )),
        }
    }
    if let Err(e) = child.kill() {
        failures.push(format!("failed to kill process {}: {e}", child.id()));
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_clones_share_the_flag() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert_eq!(token.stop_reason(), None);
        clone.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.stop_reason(), Some(StopReason::Cancelled));
    }

    #[test]
    fn cancel_token_deadline() {
        let token = CancelToken::with_timeout(Duration::ZERO);
        assert!(token.deadline_passed());
        assert_eq!(token.stop_reason(), Some(StopReason::DeadlineExceeded));
        assert_eq!(token.remaining(), Some(Duration::ZERO));

        let token = CancelToken::with_timeout(Duration::from_secs(3600));
        assert!(!token.deadline_passed());
        assert!(token.remaining().unwrap() > Duration::from_secs(3500));
        assert_eq!(CancelToken::new().remaining(), None);
    }

    #[test]
    fn display_quotes_arguments_with_spaces() {
        let spec = CommandSpec::new("tar").args(["-czf", "my archive.tar.gz"]);
        assert_eq!(spec.to_string(), "tar -czf \"my archive.tar.gz\"");
    }

    #[test]
    fn status_text_variants() {
        let mut out = CommandOutput {
            exit_code: Some(2),
            ..CommandOutput::default()
        };
        assert_eq!(out.status_text(), "exit status 2");
        assert!(!out.success());
        out.timed_out = true;
        assert_eq!(out.status_text(), "timed out");
        assert!(out.stopped());
    }

    #[test]
    fn resolve_dir_joins_relative_paths() {
        let root = Path::new("/work/project");
        assert_eq!(resolve_dir(root, None), PathBuf::from("/work/project"));
        assert_eq!(
            resolve_dir(root, Some(Path::new("web"))),
            PathBuf::from("/work/project/web")
        );
        assert_eq!(
            resolve_dir(root, Some(Path::new("/abs"))),
            PathBuf::from("/abs")
        );
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let err = run(
            &CommandSpec::new("this-command-does-not-exist-xyz123"),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("failed to spawn"));
    }

    #[test]
    fn command_exists_nonexistent() {
        assert!(!command_exists("this-command-does-not-exist-xyz123"));
        assert!(which("this-command-does-not-exist-xyz123").is_none());
    }

    #[test]
    fn command_output_serialization() {
        let out = CommandOutput {
            exit_code: Some(0),
            stdout: "ok".to_string(),
            ..CommandOutput::default()
        };
        let json = serde_json::to_string(&out).expect("serialize");
        assert!(json.contains("\"exit_code\":0"));
        assert!(json.contains("\"timed_out\":false"));
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use tempfile::tempdir;

        #[test]
        fn captures_streams_and_exit_code() {
            let out = run(
                &CommandSpec::shell("echo out; echo err >&2; exit 3"),
                &CancelToken::new(),
            )
            .expect("run");
            assert_eq!(out.exit_code, Some(3));
            assert_eq!(out.stdout, "out\n");
            assert_eq!(out.stderr, "err\n");
            assert!(out.combined.contains("out\n"));
            assert!(out.combined.contains("err\n"));
            assert!(!out.success());
        }

        #[test]
        fn applies_dir_and_env_overlay() {
            let td = tempdir().expect("tempdir");
            let spec = CommandSpec::shell("pwd; echo \"$BINSHIP_TEST_VALUE\"")
                .current_dir(td.path())
                .env("BINSHIP_TEST_VALUE", "hello");
            let out = run(&spec, &CancelToken::new()).expect("run");
            assert!(out.success());
            let canonical = td.path().canonicalize().unwrap();
            let mut lines = out.stdout.lines();
            assert_eq!(
                Path::new(lines.next().unwrap()).canonicalize().unwrap(),
                canonical
            );
            assert_eq!(lines.next(), Some("hello"));
        }

        #[test]
        fn large_output_does_not_block() {
            let out = run(
                &CommandSpec::shell("i=0; while [ $i -lt 20000 ]; do echo line-$i; i=$((i+1)); done"),
                &CancelToken::new(),
            )
            .expect("run");
            assert!(out.success());
            assert_eq!(out.stdout.lines().count(), 20000);
        }

        #[test]
        fn own_timeout_kills_the_command() {
            let started = Instant::now();
            let spec = CommandSpec::shell("sleep 30").timeout(Some(Duration::from_millis(200)));
            let out = run(&spec, &CancelToken::new()).expect("run");
            assert!(out.timed_out);
            assert!(!out.cancelled);
            assert_eq!(out.exit_code, None);
            assert!(out.stderr.contains("command timed out after"));
            assert!(!out.stderr.contains("failed to kill"), "{}", out.stderr);
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[test]
        fn kill_tree_reports_a_group_kill_it_could_not_run() {
            use std::os::unix::process::CommandExt;

            let td = tempdir().expect("tempdir");
            let mut child = Command::new("sleep")
                .arg("30")
                .process_group(0)
                .spawn()
                .expect("spawn");

            let failures = kill_tree(&mut child, &td.path().join("no-such-shell"));
            assert_eq!(failures.len(), 1, "{failures:?}");
            assert!(failures[0].starts_with("failed to kill process group: cannot run"));

            // The direct child is still killed.
            let status = child.wait().expect("wait");
            assert_eq!(status.code(), None);
        }

        #[test]
        fn kill_tree_reports_a_failing_group_kill() {
            use std::os::unix::process::CommandExt;

            let td = tempdir().expect("tempdir");
            let shell = td.path().join("sh");
            std::fs::write(&shell, "#!/bin/sh\nexit 1\n").expect("write");
            let mut perms = std::fs::metadata(&shell).expect("meta").permissions();
            std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
            std::fs::set_permissions(&shell, perms).expect("chmod");

            let mut child = Command::new("sleep")
                .arg("30")
                .process_group(0)
                .spawn()
                .expect("spawn");
            let failures = kill_tree(&mut child, &shell);
            assert_eq!(failures.len(), 1, "{failures:?}");
            assert!(failures[0].contains("kill -9 -"), "{}", failures[0]);
            child.wait().expect("wait");
        }

        #[test]
        fn cancel_from_another_thread_stops_the_command() {
            let token = CancelToken::new();
            let canceller = token.clone();
            let handle = thread::spawn(move || {
                thread::sleep(Duration::from_millis(150));
                canceller.cancel();
            });
            let out = run(&CommandSpec::shell("sleep 30"), &token).expect("run");
            handle.join().unwrap();
            assert!(out.cancelled);
            assert_eq!(out.status_text(), "cancelled");
        }

        #[cfg(target_os = "linux")]
        #[test]
        fn run_deadline_kills_grandchildren() {
            let td = tempdir().expect("tempdir");
            let pid_file = td.path().join("pid");
            let line = format!("sleep 30 & echo $! > '{}'; wait", pid_file.display());
            let token = CancelToken::with_timeout(Duration::from_millis(300));

            let out = run(&CommandSpec::shell(line), &token).expect("run");
            assert!(out.timed_out);

            let pid = std::fs::read_to_string(&pid_file).expect("pid file");
            let pid = pid.trim().to_string();
            let mut alive = true;
            for _ in 0..40 {
                // Gone, or a zombie waiting to be reaped by init.
                match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
                    Err(_) => alive = false,
                    Ok(stat) => alive = !stat.contains(") Z"),
                }
                if !alive {
                    break;
                }
                thread::sleep(Duration::from_millis(50));
            }
            assert!(!alive, "grandchild {pid} survived the deadline");
        }
    }
}
