//! Process and signal control for long-running daemons.
//!
//! - [`process`] spawns children with a verbatim argument vector and reaps them once.
//! - [`send`] delivers a signal to a child handle, a PID, or the PID named by a PID file.
//! - [`dispatch`] turns signal deliveries into ordered handler calls on an
//!   ordinary thread, where any code is safe to run.

pub mod config;
pub mod dispatch;
pub mod pidfile;
pub mod process;
pub mod queue;
pub mod send;
pub mod signal_name;

pub use dispatch::{Dispatcher, Handler, HandlerResult, OnDrop};
pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;
pub use process::{execute, spawn, ExitStatus, ProcessHandle, Spawner};
pub use send::{send, Target};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard, PoisonError};

    static SIGNAL_LOCK: Mutex<()> = Mutex::new(());

    /// Dispositions are process-wide; tests that install them or signal
    /// this process hold this lock.
    pub fn signal_lock() -> MutexGuard<'static, ()> {
        SIGNAL_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
