//! Conveniences for handlers that record what they catch: an in-memory FIFO
//! other threads can wait on, and an append-only JSONL journal.

use crate::dispatch::{Handler, HandlerResult};
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use serde::{Serialize, Serializer};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// One signal as seen by a handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaughtSignal {
    #[serde(serialize_with = "serialize_signal")]
    pub signal: Signal,
    pub at: DateTime<Utc>,
}

impl CaughtSignal {
    pub fn now(signal: Signal) -> Self {
        Self {
            signal,
            at: Utc::now(),
        }
    }
}

fn serialize_signal<S: Serializer>(signal: &Signal, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(signal.as_str())
}

/// Thread-safe FIFO of caught signals. Clones share the same queue.
#[derive(Debug, Clone, Default)]
pub struct SignalQueue {
    inner: Arc<(Mutex<VecDeque<CaughtSignal>>, Condvar)>,
}

impl SignalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<CaughtSignal>> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, signal: Signal) {
        self.entries().push_back(CaughtSignal::now(signal));
        self.inner.1.notify_all();
    }

    /// A handler that appends every signal it receives to this queue.
    pub fn handler(&self) -> impl Handler {
        let queue = self.clone();
        move |signal: Signal| -> HandlerResult {
            queue.push(signal);
            Ok(())
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn pop(&self) -> Option<CaughtSignal> {
        self.entries().pop_front()
    }

    pub fn drain(&self) -> Vec<CaughtSignal> {
        self.entries().drain(..).collect()
    }

    /// Signal identities currently queued, oldest first.
    pub fn signals(&self) -> Vec<Signal> {
        self.entries().iter().map(|c| c.signal).collect()
    }

    /// Block until at least `count` signals are queued or `timeout` passes.
    /// Returns whether the count was reached.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let (lock, ready) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = ready
            .wait_timeout_while(guard, timeout, |entries| entries.len() < count)
            .unwrap_or_else(PoisonError::into_inner);
        guard.len() >= count
    }
}

/// Errors from journal operations.
#[derive(Debug)]
pub enum JournalError {
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for JournalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JournalError::Open { path, source } => {
                write!(f, "failed to open signal journal {}: {source}", path.display())
            }
            JournalError::Serialize { source } => {
                write!(f, "failed to serialize journal entry: {source}")
            }
            JournalError::Write { path, source } => {
                write!(f, "failed to append to signal journal {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for JournalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JournalError::Open { source, .. } => Some(source),
            JournalError::Serialize { source } => Some(source),
            JournalError::Write { source, .. } => Some(source),
        }
    }
}

/// Append-only JSONL record of caught signals, one object per line.
#[derive(Debug)]
pub struct SignalJournal {
    path: PathBuf,
    file: File,
}

impl SignalJournal {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| JournalError::Open {
                path: path.clone(),
                source,
            })?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, caught: &CaughtSignal) -> Result<(), JournalError> {
        let mut line =
            serde_json::to_string(caught).map_err(|source| JournalError::Serialize { source })?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .map_err(|source| JournalError::Write {
                path: self.path.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn test_queue_preserves_order() {
        let queue = SignalQueue::new();
        let mut handler = queue.handler();
        handler.handle(Signal::SIGUSR2).unwrap();
        handler.handle(Signal::SIGUSR1).unwrap();
        handler.handle(Signal::SIGUSR1).unwrap();

        assert_eq!(queue.len(), 3);
        assert_eq!(
            queue.signals(),
            vec![Signal::SIGUSR2, Signal::SIGUSR1, Signal::SIGUSR1]
        );
        assert_eq!(queue.pop().unwrap().signal, Signal::SIGUSR2);
        assert_eq!(queue.drain().len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_wait_for_wakes_on_push_from_other_thread() {
        let queue = SignalQueue::new();
        let producer = queue.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(Signal::SIGHUP);
            producer.push(Signal::SIGTERM);
        });

        assert!(queue.wait_for(2, Duration::from_secs(5)));
        t.join().unwrap();
        assert_eq!(queue.signals(), vec![Signal::SIGHUP, Signal::SIGTERM]);
    }

    #[test]
    fn test_wait_for_times_out() {
        let queue = SignalQueue::new();
        queue.push(Signal::SIGHUP);
        assert!(!queue.wait_for(2, Duration::from_millis(20)));
        assert!(queue.wait_for(1, Duration::from_millis(1)));
    }

    #[test]
    fn test_caught_signal_serializes_by_name() {
        let caught = CaughtSignal::now(Signal::SIGUSR1);
        let json: serde_json::Value = serde_json::to_value(&caught).unwrap();
        assert_eq!(json["signal"], "SIGUSR1");
        assert!(json["at"].is_string());
    }

    #[test]
    fn test_journal_appends_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("signals.jsonl");

        let mut journal = SignalJournal::open(&path).unwrap();
        journal.record(&CaughtSignal::now(Signal::SIGHUP)).unwrap();
        drop(journal);

        // Reopening appends rather than truncating.
        let mut journal = SignalJournal::open(&path).unwrap();
        assert_eq!(journal.path(), path);
        journal.record(&CaughtSignal::now(Signal::SIGTERM)).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let names: Vec<String> = contents
            .lines()
            .map(|l| {
                let v: serde_json::Value = serde_json::from_str(l).unwrap();
                v["signal"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(names, vec!["SIGHUP", "SIGTERM"]);
    }

    #[test]
    fn test_journal_open_failure() {
        let err = SignalJournal::open("/nonexistent-dir/x/signals.jsonl").unwrap_err();
        assert!(matches!(err, JournalError::Open { .. }));
        assert!(err.to_string().contains("failed to open signal journal"));
    }
}
