//! Child process lifecycle: spawn an external program with a verbatim argument
//! vector, then reap it exactly once to collect its exit status.

use crate::send::{self, SendError, Target};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::{Duration, Instant};

/// Shell used by [`execute`].
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Poll interval for [`ProcessHandle::wait_timeout`].
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How a reaped child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal exit with the process's own return value (0-255).
    Exited(i32),
    /// Terminated by a signal.
    Signaled(Signal),
}

impl ExitStatus {
    /// Integer form used across the crate: the exit code for a normal exit,
    /// the negated signal number for a signal-terminated child.
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Exited(code) => *code,
            ExitStatus::Signaled(signal) => -(*signal as i32),
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }

    fn from_std(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitStatus::Exited(code);
        }
        match status.signal().map(Signal::try_from) {
            Some(Ok(signal)) => ExitStatus::Signaled(signal),
            // Neither an exit code nor a known signal: report the raw wait status.
            _ => ExitStatus::Exited(status.into_raw()),
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit code {code}"),
            ExitStatus::Signaled(signal) => write!(f, "killed by {}", signal.as_str()),
        }
    }
}

/// Errors that prevent a child from being created.
///
/// A child that starts and later fails is not a spawn error; that is only
/// visible through its [`ExitStatus`].
#[derive(Debug)]
pub enum SpawnError {
    /// The executable could not be found.
    NotFound { program: PathBuf },
    /// The executable exists but may not be executed.
    PermissionDenied { program: PathBuf },
    /// The OS refused to create a new process (fork failed).
    Fork { source: std::io::Error },
    /// The child was created but replacing its image failed.
    Exec {
        program: PathBuf,
        source: std::io::Error,
    },
}

impl SpawnError {
    fn from_io(program: &Path, source: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match source.kind() {
            ErrorKind::NotFound => SpawnError::NotFound {
                program: program.to_path_buf(),
            },
            ErrorKind::PermissionDenied => SpawnError::PermissionDenied {
                program: program.to_path_buf(),
            },
            ErrorKind::WouldBlock | ErrorKind::OutOfMemory => SpawnError::Fork { source },
            _ => SpawnError::Exec {
                program: program.to_path_buf(),
                source,
            },
        }
    }
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::NotFound { program } => {
                write!(f, "executable not found: {}", program.display())
            }
            SpawnError::PermissionDenied { program } => {
                write!(f, "permission denied executing {}", program.display())
            }
            SpawnError::Fork { source } => write!(f, "failed to create child process: {source}"),
            SpawnError::Exec { program, source } => {
                write!(f, "failed to execute {}: {source}", program.display())
            }
        }
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpawnError::Fork { source } => Some(source),
            SpawnError::Exec { source, .. } => Some(source),
            SpawnError::NotFound { .. } | SpawnError::PermissionDenied { .. } => None,
        }
    }
}

/// Errors from reaping a child.
#[derive(Debug)]
pub enum ReapError {
    /// The handle was already reaped; its PID may now name another process.
    AlreadyReaped { pid: Pid },
    /// The wait call itself failed.
    Wait { pid: Pid, source: std::io::Error },
}

impl std::fmt::Display for ReapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReapError::AlreadyReaped { pid } => write!(f, "process {pid} was already reaped"),
            ReapError::Wait { pid, source } => write!(f, "failed to wait for process {pid}: {source}"),
        }
    }
}

impl std::error::Error for ReapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReapError::AlreadyReaped { .. } => None,
            ReapError::Wait { source, .. } => Some(source),
        }
    }
}

/// Failure of the one-shot [`execute`] helper.
#[derive(Debug)]
pub enum ProcessError {
    Spawn(SpawnError),
    Reap(ReapError),
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Spawn(e) => e.fmt(f),
            ProcessError::Reap(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessError::Spawn(e) => Some(e),
            ProcessError::Reap(e) => Some(e),
        }
    }
}

impl From<SpawnError> for ProcessError {
    fn from(e: SpawnError) -> Self {
        ProcessError::Spawn(e)
    }
}

impl From<ReapError> for ProcessError {
    fn from(e: ReapError) -> Self {
        ProcessError::Reap(e)
    }
}

enum State {
    Running(Child),
    Exited(ExitStatus),
}

/// One spawned child. The PID is fixed for the handle's lifetime; once the
/// child is reaped the handle only remembers the status it exited with.
pub struct ProcessHandle {
    pid: Pid,
    program: PathBuf,
    state: State,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("program", &self.program)
            .field("status", &self.status())
            .finish()
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Status the child exited with, or `None` while it has not been reaped.
    pub fn status(&self) -> Option<ExitStatus> {
        match self.state {
            State::Running(_) => None,
            State::Exited(status) => Some(status),
        }
    }

    pub fn is_reaped(&self) -> bool {
        matches!(self.state, State::Exited(_))
    }

    /// Block until the child terminates and reap it.
    ///
    /// Fails with [`ReapError::AlreadyReaped`] on every call after the first
    /// successful one.
    pub fn wait(&mut self) -> Result<ExitStatus, ReapError> {
        let child = self.running()?;
        let status = child.wait().map_err(|source| ReapError::Wait {
            pid: self.pid,
            source,
        })?;
        Ok(self.reaped(ExitStatus::from_std(status)))
    }

    /// Reap the child if it has already terminated, without blocking.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>, ReapError> {
        let child = self.running()?;
        let status = child.try_wait().map_err(|source| ReapError::Wait {
            pid: self.pid,
            source,
        })?;
        Ok(status.map(|s| self.reaped(ExitStatus::from_std(s))))
    }

    /// Bounded variant of [`wait`](Self::wait). Returns `Ok(None)` if the
    /// child is still running after `timeout`; the handle stays usable.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<ExitStatus>, ReapError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(WAIT_POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Send `signal` to this child.
    pub fn signal(&self, signal: Signal) -> Result<(), SendError> {
        send::send(signal, Target::Process(self))
    }

    fn running(&mut self) -> Result<&mut Child, ReapError> {
        match &mut self.state {
            State::Running(child) => Ok(child),
            State::Exited(_) => Err(ReapError::AlreadyReaped { pid: self.pid }),
        }
    }

    fn reaped(&mut self, status: ExitStatus) -> ExitStatus {
        tracing::info!(pid = %self.pid, %status, "child process reaped");
        self.state = State::Exited(status);
        status
    }
}

/// Builder for spawning a child. Arguments are passed verbatim as argv
/// entries; nothing is shell-interpreted.
#[derive(Debug, Clone)]
pub struct Spawner {
    program: PathBuf,
    args: Vec<String>,
    new_process_group: bool,
}

impl Spawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            new_process_group: false,
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

    /// Start the child in its own process group so the whole group can be
    /// signalled later.
    pub fn new_process_group(mut self, enabled: bool) -> Self {
        self.new_process_group = enabled;
        self
    }

    /// Create the child. Returns once the new program image is executing.
    pub fn spawn(&self) -> Result<ProcessHandle, SpawnError> {
        tracing::info!(
            program = %self.program.display(),
            args = ?self.args,
            "spawning child process"
        );

        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if self.new_process_group {
            command.process_group(0);
        }

        let child = command
            .spawn()
            .map_err(|e| SpawnError::from_io(&self.program, e))?;
        let pid = Pid::from_raw(child.id() as i32);
        tracing::debug!(%pid, "child process started");

        Ok(ProcessHandle {
            pid,
            program: self.program.clone(),
            state: State::Running(child),
        })
    }
}

/// Spawn `program` with `args` as its argument vector.
pub fn spawn<I, S>(program: impl Into<PathBuf>, args: I) -> Result<ProcessHandle, SpawnError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Spawner::new(program).args(args).spawn()
}

/// Run `command_line` through `/bin/sh -c` and wait for it.
///
/// The line is shell-interpreted; callers are responsible for what they pass.
pub fn execute(command_line: &str) -> Result<ExitStatus, ProcessError> {
    execute_with(Path::new(DEFAULT_SHELL), command_line)
}

/// Like [`execute`] with an explicit shell.
pub fn execute_with(shell: &Path, command_line: &str) -> Result<ExitStatus, ProcessError> {
    let mut child = spawn(shell, ["-c", command_line])?;
    Ok(child.wait()?)
}

/// PID of the calling process.
pub fn current_pid() -> Pid {
    nix::unistd::getpid()
}
