//! Signal delivery to a target process.
//!
//! A [`Target`] is either something that already holds a PID or a PID file
//! path. Paths are resolved at send time, so the file read and the `kill`
//! race against the target's lifetime; a fresh read can still end in
//! [`SendError::NoSuchProcess`].

use crate::dispatch;
use crate::pidfile::{AdapterError, IdFile, Mode};
use crate::process::{self, ProcessHandle};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};

/// Where a signal goes.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    /// A child spawned by this process.
    Process(&'a ProcessHandle),
    /// A PID known directly.
    Pid(Pid),
    /// A PID file, read when the signal is sent.
    PidFile(&'a Path),
}

/// Errors from [`send`].
#[derive(Debug)]
pub enum SendError {
    /// The target process does not exist (or the handle was already reaped).
    NoSuchProcess { pid: Pid },
    /// The caller may not signal the target.
    PermissionDenied { pid: Pid },
    /// The PID file did not contain a positive decimal PID.
    MalformedIdentifier { path: PathBuf, content: String },
    /// Reading the PID file failed.
    Adapter(AdapterError),
    /// Any other failure of the `kill` call.
    Os { pid: Pid, errno: Errno },
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::NoSuchProcess { pid } => write!(f, "no such process: {pid}"),
            SendError::PermissionDenied { pid } => {
                write!(f, "permission denied signalling process {pid}")
            }
            SendError::MalformedIdentifier { path, content } => write!(
                f,
                "malformed process identifier {content:?} in {}",
                path.display()
            ),
            SendError::Adapter(e) => e.fmt(f),
            SendError::Os { pid, errno } => write!(f, "failed to signal process {pid}: {errno}"),
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SendError::Adapter(e) => Some(e),
            SendError::Os { errno, .. } => Some(errno),
            _ => None,
        }
    }
}

impl From<AdapterError> for SendError {
    fn from(e: AdapterError) -> Self {
        SendError::Adapter(e)
    }
}

/// Resolve `target` to a PID and send it `signal`. Does not wait for the
/// target to react.
///
/// When the target is this process and a [`Dispatcher`](crate::Dispatcher)
/// owns `signal`, it is raised on the calling thread instead, so the
/// forwarding disposition has run by the time this returns. A plain `kill`
/// would let the kernel pick another thread and handle it later, and
/// successive sends could then be reordered or coalesced.
pub fn send(signal: Signal, target: Target<'_>) -> Result<(), SendError> {
    let pid = resolve(target)?;
    tracing::debug!(signal = signal.as_str(), %pid, ?target, "sending signal");
    if pid == process::current_pid() && dispatch::delivers_on_current_thread(signal) {
        return signal::raise(signal).map_err(|errno| SendError::Os { pid, errno });
    }
    signal::kill(pid, signal).map_err(|errno| match errno {
        Errno::ESRCH => SendError::NoSuchProcess { pid },
        Errno::EPERM => SendError::PermissionDenied { pid },
        errno => SendError::Os { pid, errno },
    })
}

/// Resolve a target to the PID a signal would be sent to.
pub fn resolve(target: Target<'_>) -> Result<Pid, SendError> {
    match target {
        Target::Process(handle) if handle.is_reaped() => {
            Err(SendError::NoSuchProcess { pid: handle.pid() })
        }
        Target::Process(handle) => Ok(handle.pid()),
        Target::Pid(pid) => Ok(pid),
        Target::PidFile(path) => read_pid(path),
    }
}

/// Read a PID file. The whole file must be one positive decimal integer,
/// optionally padded with whitespace.
pub fn read_pid(path: &Path) -> Result<Pid, SendError> {
    let mut file = IdFile::open(path, Mode::ReadOnly)?;
    let content = file.get_contents()?;
    file.close()?;
    parse_pid(&content).ok_or_else(|| SendError::MalformedIdentifier {
        path: path.to_path_buf(),
        content,
    })
}

fn parse_pid(text: &str) -> Option<Pid> {
    // 0 and negatives would address process groups rather than one process.
    match text.trim().parse::<i32>() {
        Ok(raw) if raw > 0 => Some(Pid::from_raw(raw)),
        _ => None,
    }
}
