//! Crash supervisor for integration tests.
//!
//! A crash test re-runs its own test binary twice: once in the CRASH phase,
//! where the child installs capture and dies, and once in the RELAUNCH phase,
//! which plays the next application launch and inspects the report. The
//! supervisor (the original test process) only spawns children and checks how
//! they ended, so its own panic hook and signal handlers are never touched.

#![allow(dead_code)]

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use flux_crash_handler::config::ENV_CRASH_DIR;

const ENV_PHASE: &str = "FLUX_TEST_PHASE";
const ENV_SIGNAL: &str = "FLUX_TEST_SIGNAL";
const ENV_EXIT_CODE: &str = "FLUX_TEST_EXIT_CODE";

/// Execution phase of the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Spawns children; never crashes.
    Supervisor,
    /// Installs capture and fails.
    Crash,
    /// Reads what the crashed run left behind.
    Relaunch,
}

pub fn phase() -> Phase {
    match std::env::var(ENV_PHASE).as_deref() {
        Ok("CRASH") => Phase::Crash,
        Ok("RELAUNCH") => Phase::Relaunch,
        _ => Phase::Supervisor,
    }
}

/// How the CRASH child ended, as seen by the RELAUNCH child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashExit {
    /// Signal that killed the child, if any.
    pub signal: Option<i32>,
    /// Exit code, if it exited normally.
    pub code: Option<i32>,
}

impl CrashExit {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            signal,
            code: status.code(),
        }
    }

    fn from_env() -> Self {
        let read = |name: &str| std::env::var(name).ok().and_then(|s| s.parse().ok());
        Self {
            signal: read(ENV_SIGNAL),
            code: read(ENV_EXIT_CODE),
        }
    }
}

/// Install a `tracing` subscriber once, honouring `RUST_LOG`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Builder for a crash/relaunch test.
pub struct CrashTest<C, R>
where
    C: FnOnce(),
    R: FnOnce(&CrashExit, &Path),
{
    crash_fn: Option<C>,
    relaunch_fn: Option<R>,
}

/// Start building a crash test.
pub fn crash_test() -> CrashTest<fn(), fn(&CrashExit, &Path)> {
    CrashTest {
        crash_fn: None,
        relaunch_fn: None,
    }
}

impl<C, R> CrashTest<C, R>
where
    C: FnOnce(),
    R: FnOnce(&CrashExit, &Path),
{
    /// The failing run. Expected not to return.
    pub fn crash<C2>(self, f: C2) -> CrashTest<C2, R>
    where
        C2: FnOnce(),
    {
        CrashTest {
            crash_fn: Some(f),
            relaunch_fn: self.relaunch_fn,
        }
    }

    /// The next launch, given how the crashed run ended and its data dir.
    pub fn relaunch<R2>(self, f: R2) -> CrashTest<C, R2>
    where
        R2: FnOnce(&CrashExit, &Path),
    {
        CrashTest {
            crash_fn: self.crash_fn,
            relaunch_fn: Some(f),
        }
    }

    /// Run whichever part belongs to the current phase.
    pub fn execute(self) {
        init_logging();
        match phase() {
            Phase::Supervisor => supervise(),
            Phase::Crash => {
                if let Some(crash_fn) = self.crash_fn {
                    crash_fn();
                }
                // Reaching here means nothing crashed; let the supervisor see it.
                std::process::exit(0);
            }
            Phase::Relaunch => {
                if let Some(relaunch_fn) = self.relaunch_fn {
                    relaunch_fn(&CrashExit::from_env(), &data_dir());
                }
            }
        }
    }
}

fn data_dir() -> PathBuf {
    std::env::var_os(ENV_CRASH_DIR)
        .map(PathBuf::from)
        .expect("relaunch child runs with FLUX_CRASH_DIR set")
}

fn supervise() {
    let exe = std::env::current_exe().expect("cannot find current test executable");
    let test_name = std::thread::current()
        .name()
        .map(str::to_string)
        .expect("crash tests run on a named test thread");
    let dir = tempfile::tempdir().expect("cannot create crash data dir");

    let crash = spawn_child(&exe, &test_name, "CRASH", dir.path(), None);
    let exit = CrashExit::from_status(crash.status);
    assert!(
        !crash.status.success(),
        "crash phase of '{test_name}' exited cleanly; stderr:\n{}",
        crash.stderr
    );

    let relaunch = spawn_child(&exe, &test_name, "RELAUNCH", dir.path(), Some(exit));
    assert!(
        relaunch.status.success(),
        "relaunch phase of '{test_name}' failed ({:?}) after crash {exit:?}; stderr:\n{}",
        relaunch.status,
        relaunch.stderr
    );
}

struct ChildResult {
    status: ExitStatus,
    stderr: String,
}

fn spawn_child(
    exe: &Path,
    test_name: &str,
    phase: &str,
    dir: &Path,
    crash: Option<CrashExit>,
) -> ChildResult {
    let mut cmd = Command::new(exe);
    cmd.env(ENV_PHASE, phase);
    cmd.env(ENV_CRASH_DIR, dir);
    cmd.env_remove(ENV_SIGNAL);
    cmd.env_remove(ENV_EXIT_CODE);
    if let Some(crash) = crash {
        if let Some(signal) = crash.signal {
            cmd.env(ENV_SIGNAL, signal.to_string());
        }
        if let Some(code) = crash.code {
            cmd.env(ENV_EXIT_CODE, code.to_string());
        }
    }

    cmd.arg(test_name);
    cmd.arg("--exact");
    cmd.arg("--test-threads=1");
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .unwrap_or_else(|e| panic!("cannot spawn {phase} child: {e}"));

    let mut stderr = String::new();
    if let Some(mut pipe) = child.stderr.take() {
        let _ = pipe.read_to_string(&mut stderr);
    }
    let status = child
        .wait()
        .unwrap_or_else(|e| panic!("cannot wait for {phase} child: {e}"));

    ChildResult { status, stderr }
}
