// Process Handle Module
// One OS process per worker: launch into its own session, signal its group, observe its exit

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, instrument};

/// Everything needed to launch one worker process
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Worker identifier (used for logging and the environment)
    pub id: String,

    /// Program to execute
    pub program: PathBuf,

    /// Arguments with placeholders already substituted
    pub args: Vec<OsString>,

    /// Working directory of the new process
    pub working_directory: PathBuf,

    /// Port assigned to the worker
    pub port: u16,
}

/// Failure to launch a worker
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to launch worker '{id}' ({program}): {source}")]
    Launch {
        id: String,
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("refusing to spawn worker '{0}': shutdown in progress")]
    ShutdownInProgress(String),

    #[error("worker '{0}' has failed and is no longer spawned")]
    Retired(String),

    #[error("unknown worker '{0}'")]
    UnknownWorker(String),

    #[error("worker '{0}' exited before its pid could be captured")]
    MissingPid(String),
}

/// Signals the supervisor sends to a worker's process group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSignal {
    /// SIGTERM - may be intercepted by the worker
    Terminate,

    /// SIGKILL - cannot be intercepted
    Kill,
}

impl GroupSignal {
    fn raw(self) -> libc::c_int {
        match self {
            GroupSignal::Terminate => libc::SIGTERM,
            GroupSignal::Kill => libc::SIGKILL,
        }
    }
}

impl fmt::Display for GroupSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupSignal::Terminate => write!(f, "SIGTERM"),
            GroupSignal::Kill => write!(f, "SIGKILL"),
        }
    }
}

/// How a worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,

    /// Terminating signal, if the process was killed by one
    pub signal: Option<i32>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for WorkerExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

/// Handle to one running (or exited) worker process.
///
/// The process is the leader of a fresh session, so its pid doubles as its
/// process group id and signals reach every descendant that stayed in the group.
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    spawned_at: Instant,
    exit: Option<WorkerExit>,
}

impl ProcessHandle {
    /// Launch a worker in a new session
    #[instrument(skip(spec), fields(worker = %spec.id, port = spec.port))]
    pub fn spawn(spec: &LaunchSpec) -> Result<Self, SpawnError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_directory)
            .env("PEAR_WORKER_ID", &spec.id)
            .env("PEAR_WORKER_PORT", spec.port.to_string())
            .env("PEAR_WORKER_DIR", &spec.working_directory)
            .stdin(Stdio::null())
            .kill_on_drop(false);

        // SAFETY: setsid() is async-signal-safe and touches no parent state.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|source| SpawnError::Launch {
            id: spec.id.clone(),
            program: spec.program.display().to_string(),
            source,
        })?;

        let pid = child
            .id()
            .ok_or_else(|| SpawnError::MissingPid(spec.id.clone()))?;

        info!(pid = pid, "Worker process launched");

        Ok(Self {
            child,
            pid,
            spawned_at: Instant::now(),
            exit: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Process group id (equal to the pid because of setsid)
    pub fn pgid(&self) -> i32 {
        self.pid as i32
    }

    pub fn uptime(&self) -> Duration {
        self.spawned_at.elapsed()
    }

    /// Exit recorded by an earlier successful poll
    pub fn exit(&self) -> Option<WorkerExit> {
        self.exit
    }

    /// Non-blocking exit check. Reaps the process when it has exited.
    pub fn try_exit(&mut self) -> io::Result<Option<WorkerExit>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }

        match self.child.try_wait()? {
            Some(status) => {
                let exit = WorkerExit::from(status);
                debug!(pid = self.pid, exit = %exit, "Worker process reaped");
                self.exit = Some(exit);
                Ok(Some(exit))
            }
            None => Ok(None),
        }
    }

    /// Deliver a signal to the whole process group
    pub fn signal_group(&self, signal: GroupSignal) -> io::Result<()> {
        // SAFETY: plain syscall, no memory is shared with the callee.
        let rc = unsafe { libc::killpg(self.pgid(), signal.raw()) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            // The group is already gone; nothing left to signal.
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(err);
        }
        debug!(pgid = self.pgid(), signal = %signal, "Signal delivered to process group");
        Ok(())
    }

    /// Whether any process still belongs to the worker's group
    pub fn group_alive(&self) -> bool {
        exists(-self.pgid())
    }

    /// Whether the pid still has a process table entry (running or zombie)
    pub fn pid_present(&self) -> bool {
        exists(self.pid as libc::pid_t)
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("exit", &self.exit)
            .finish()
    }
}

/// `kill(target, 0)`: true unless the target does not exist.
/// EPERM still means something is there.
fn exists(target: libc::pid_t) -> bool {
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(target, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeper(secs: &str) -> LaunchSpec {
        LaunchSpec {
            id: "sleeper".to_string(),
            program: PathBuf::from("sleep"),
            args: vec![OsString::from(secs)],
            working_directory: std::env::temp_dir(),
            port: 0,
        }
    }

    async fn wait_exit(handle: &mut ProcessHandle) -> WorkerExit {
        for _ in 0..100 {
            if let Some(exit) = handle.try_exit().unwrap() {
                return exit;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("process did not exit");
    }

    #[tokio::test]
    async fn test_spawn_places_worker_in_own_group() {
        let handle = ProcessHandle::spawn(&sleeper("5")).unwrap();

        let pgid = unsafe { libc::getpgid(handle.pid() as libc::pid_t) };
        assert_eq!(pgid, handle.pgid());
        assert_ne!(pgid, unsafe { libc::getpgrp() });

        handle.signal_group(GroupSignal::Kill).unwrap();
    }

    #[tokio::test]
    async fn test_terminate_signal_reaches_group() {
        let mut handle = ProcessHandle::spawn(&sleeper("30")).unwrap();
        assert!(handle.try_exit().unwrap().is_none());

        handle.signal_group(GroupSignal::Terminate).unwrap();
        let exit = wait_exit(&mut handle).await;

        assert_eq!(exit.signal, Some(libc::SIGTERM));
        assert!(!exit.success());
        assert!(!handle.pid_present());
        assert!(!handle.group_alive());
    }

    #[tokio::test]
    async fn test_clean_exit_code_is_recorded() {
        let mut handle = ProcessHandle::spawn(&sleeper("0")).unwrap();
        let exit = wait_exit(&mut handle).await;

        assert!(exit.success());
        assert_eq!(handle.exit(), Some(exit));
        // Signalling an already reaped group is not an error
        assert!(handle.signal_group(GroupSignal::Kill).is_ok());
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let mut spec = sleeper("1");
        spec.program = PathBuf::from("/nonexistent/pear-worker");

        let err = ProcessHandle::spawn(&spec).unwrap_err();
        assert!(matches!(err, SpawnError::Launch { .. }));
    }
}
