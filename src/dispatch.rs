//! Signal dispatch thread.
//!
//! Signal handlers may only do async-signal-safe work. A [`Dispatcher`]
//! installs a disposition for each of its signals that does nothing but write
//! the signal number as one byte into a socket pair, and owns a background
//! thread that blocks reading the other end. Each byte read becomes one
//! synchronous call to the [`Handler`] on that thread, in the order the bytes
//! were written.
//!
//! Dispositions are process-wide, so at most one live `Dispatcher` may own a
//! given signal. Overlapping sets are rejected at construction.
//!
//! Standard signals of the same kind that arrive while one is still pending
//! in the kernel are coalesced by the OS before any handler runs; that loss
//! is not visible here.

use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use std::any::Any;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Upper bound (exclusive) on signal numbers that can be routed.
const SLOTS: usize = 65;

/// Written to the channel to stop the thread. Never a valid signal number.
const STOP: u8 = 0;

pub const DEFAULT_THREAD_NAME: &str = "procctl-signals";

/// Write end of the owning dispatcher's channel, per signal number; -1 if unowned.
static ROUTES: [AtomicI32; SLOTS] = [const { AtomicI32::new(-1) }; SLOTS];

/// Signals the disposition could not forward because the channel was full.
static DROPPED: [AtomicUsize; SLOTS] = [const { AtomicUsize::new(0) }; SLOTS];

/// Dispositions currently between loading a route and finishing their write.
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

/// Serializes claiming and releasing of routes.
static REGISTRY: Mutex<()> = Mutex::new(());

pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Reaction to a caught signal. Called only from the dispatch thread, one
/// call at a time, in arrival order.
pub trait Handler: Send + 'static {
    fn handle(&mut self, signal: Signal) -> HandlerResult;
}

impl<F> Handler for F
where
    F: FnMut(Signal) -> HandlerResult + Send + 'static,
{
    fn handle(&mut self, signal: Signal) -> HandlerResult {
        self(signal)
    }
}

/// Why a handler call did not complete normally.
#[derive(Debug)]
pub enum HandlerFailure {
    Error(Box<dyn std::error::Error + Send + Sync>),
    Panic(String),
}

impl std::fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerFailure::Error(e) => write!(f, "handler failed: {e}"),
            HandlerFailure::Panic(msg) => write!(f, "handler panicked: {msg}"),
        }
    }
}

/// Receives handler failures. The dispatch loop keeps running after reporting.
pub trait ErrorSink: Send + 'static {
    fn report(&mut self, signal: Signal, failure: HandlerFailure);
}

impl<F> ErrorSink for F
where
    F: FnMut(Signal, HandlerFailure) + Send + 'static,
{
    fn report(&mut self, signal: Signal, failure: HandlerFailure) {
        self(signal, failure)
    }
}

/// Default sink: log and move on.
#[derive(Debug, Default)]
pub struct LogSink;

impl ErrorSink for LogSink {
    fn report(&mut self, signal: Signal, failure: HandlerFailure) {
        tracing::error!(signal = signal.as_str(), error = %failure, "signal handler failed");
    }
}

/// What happens to the signals' dispositions when the dispatcher is dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDrop {
    /// Put back whatever disposition was installed before.
    #[default]
    Restore,
    /// Leave the signals ignored so late deliveries are harmless.
    Ignore,
}

#[derive(Debug)]
pub enum DispatchError {
    /// No signals were given.
    Empty,
    /// SIGKILL and SIGSTOP cannot be caught.
    Uncatchable { signal: Signal },
    /// Another live dispatcher owns this signal.
    AlreadyOwned { signal: Signal },
    /// Creating the wake-up channel failed.
    Channel { source: std::io::Error },
    /// Changing the thread's signal mask failed.
    Mask { errno: Errno },
    /// Installing the forwarding disposition failed.
    Install { signal: Signal, errno: Errno },
    /// Spawning the dispatch thread failed.
    Thread { source: std::io::Error },
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Empty => write!(f, "no signals to dispatch"),
            DispatchError::Uncatchable { signal } => {
                write!(f, "{} cannot be caught", signal.as_str())
            }
            DispatchError::AlreadyOwned { signal } => {
                write!(f, "{} is already owned by another dispatcher", signal.as_str())
            }
            DispatchError::Channel { source } => {
                write!(f, "failed to create signal channel: {source}")
            }
            DispatchError::Mask { errno } => write!(f, "failed to change signal mask: {errno}"),
            DispatchError::Install { signal, errno } => {
                write!(f, "failed to install handler for {}: {errno}", signal.as_str())
            }
            DispatchError::Thread { source } => {
                write!(f, "failed to spawn dispatch thread: {source}")
            }
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DispatchError::Channel { source } | DispatchError::Thread { source } => Some(source),
            DispatchError::Mask { errno } | DispatchError::Install { errno, .. } => Some(errno),
            _ => None,
        }
    }
}

extern "C" fn forward(signo: libc::c_int) {
    let slot = signo as usize;
    if slot >= SLOTS {
        return;
    }
    // Counted before the route is read so `release` can wait out any write
    // that still holds the old fd.
    IN_FLIGHT.fetch_add(1, Ordering::SeqCst);
    let fd = ROUTES[slot].load(Ordering::SeqCst);
    if fd >= 0 {
        let saved = Errno::last_raw();
        let byte = signo as u8;
        // SAFETY: write(2) is async-signal-safe and `byte` outlives the call.
        let written = unsafe { libc::write(fd, (&byte as *const u8).cast(), 1) };
        if written != 1 {
            DROPPED[slot].fetch_add(1, Ordering::Relaxed);
        }
        Errno::set_raw(saved);
    }
    IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
}

fn slot(signal: Signal) -> usize {
    signal as usize
}

/// Configures a [`Dispatcher`] before it starts.
pub struct DispatcherBuilder {
    signals: Vec<Signal>,
    on_drop: OnDrop,
    thread_name: String,
    sink: Box<dyn ErrorSink>,
}

impl DispatcherBuilder {
    pub fn on_drop(mut self, on_drop: OnDrop) -> Self {
        self.on_drop = on_drop;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn error_sink(mut self, sink: impl ErrorSink) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// Claim the signals, install the forwarding dispositions and start the
    /// dispatch thread.
    pub fn spawn<H: Handler>(self, handler: H) -> Result<Dispatcher, DispatchError> {
        let DispatcherBuilder {
            mut signals,
            on_drop,
            thread_name,
            sink,
        } = self;

        signals.sort_by_key(|s| *s as i32);
        signals.dedup();
        if signals.is_empty() {
            return Err(DispatchError::Empty);
        }
        if let Some(&signal) = signals
            .iter()
            .find(|s| matches!(s, Signal::SIGKILL | Signal::SIGSTOP))
        {
            return Err(DispatchError::Uncatchable { signal });
        }

        let (wake, channel) = UnixStream::pair().map_err(|source| DispatchError::Channel { source })?;
        wake.set_nonblocking(true)
            .map_err(|source| DispatchError::Channel { source })?;

        claim(&signals, wake.as_raw_fd())?;
        // From here on, dropping `dispatcher` undoes whatever was set up.
        let mut dispatcher = Dispatcher {
            signals: signals.clone(),
            previous: Vec::with_capacity(signals.len()),
            on_drop,
            wake,
            thread: None,
        };

        let mut set = SigSet::empty();
        for &signal in &signals {
            set.add(signal);
        }
        // The new thread inherits this mask, so it never runs the forwarding
        // disposition itself. The caller's mask is restored right after.
        let caller_mask = set
            .thread_swap_mask(SigmaskHow::SIG_BLOCK)
            .map_err(|errno| DispatchError::Mask { errno })?;

        let result = dispatcher.install().and_then(|()| {
            let worker = Worker {
                channel,
                signals: signals.clone(),
                handler,
                sink,
            };
            std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker.run())
                .map_err(|source| DispatchError::Thread { source })
        });

        if let Err(errno) = caller_mask.thread_set_mask() {
            tracing::warn!(%errno, "failed to restore caller signal mask");
        }

        dispatcher.thread = Some(result?);
        tracing::info!(
            signals = ?dispatcher.signal_names(),
            thread = %thread_name,
            "signal dispatcher started"
        );
        Ok(dispatcher)
    }
}

/// Route every signal in `signals` to `fd`, or none of them if any is taken.
fn claim(signals: &[Signal], fd: RawFd) -> Result<(), DispatchError> {
    let _registry = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(&signal) = signals.iter().find(|s| Dispatcher::is_owned(**s)) {
        return Err(DispatchError::AlreadyOwned { signal });
    }
    // Routes are live before any disposition points at them.
    for &signal in signals {
        DROPPED[slot(signal)].store(0, Ordering::Relaxed);
        ROUTES[slot(signal)].store(fd, Ordering::SeqCst);
    }
    Ok(())
}

/// Whether raising `signal` on the calling thread runs the forwarding
/// disposition right away: a dispatcher owns it and this thread does not
/// block it.
pub(crate) fn delivers_on_current_thread(signal: Signal) -> bool {
    Dispatcher::is_owned(signal)
        && SigSet::thread_get_mask().is_ok_and(|mask| !mask.contains(signal))
}

/// Owns a set of signals and the thread that delivers them to a [`Handler`].
/// Dropping it stops and joins the thread.
pub struct Dispatcher {
    signals: Vec<Signal>,
    previous: Vec<(Signal, SigAction)>,
    on_drop: OnDrop,
    wake: UnixStream,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("signals", &self.signal_names())
            .field("on_drop", &self.on_drop)
            .field("running", &self.thread.is_some())
            .finish()
    }
}

impl Dispatcher {
    /// Start dispatching `signals` to `handler` with default settings.
    pub fn new<I, H>(signals: I, handler: H) -> Result<Self, DispatchError>
    where
        I: IntoIterator<Item = Signal>,
        H: Handler,
    {
        Self::builder(signals).spawn(handler)
    }

    pub fn builder<I>(signals: I) -> DispatcherBuilder
    where
        I: IntoIterator<Item = Signal>,
    {
        DispatcherBuilder {
            signals: signals.into_iter().collect(),
            on_drop: OnDrop::default(),
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            sink: Box::new(LogSink),
        }
    }

    /// Signals owned by this dispatcher, in ascending numeric order.
    pub fn signals(&self) -> &[Signal] {
        &self.signals
    }

    /// Whether `signal` is currently owned by any live dispatcher.
    pub fn is_owned(signal: Signal) -> bool {
        ROUTES[slot(signal)].load(Ordering::SeqCst) >= 0
    }

    fn signal_names(&self) -> Vec<&'static str> {
        self.signals.iter().map(|s| s.as_str()).collect()
    }

    fn install(&mut self) -> Result<(), DispatchError> {
        let action = SigAction::new(
            SigHandler::Handler(forward),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for &signal in &self.signals {
            // SAFETY: `forward` only touches atomics and calls write(2).
            let previous = unsafe { signal::sigaction(signal, &action) }
                .map_err(|errno| DispatchError::Install { signal, errno })?;
            self.previous.push((signal, previous));
        }
        Ok(())
    }

    /// Put dispositions back per `on_drop` and give up the routes.
    ///
    /// `wake` must stay open until this returns: a disposition already
    /// running on another thread may still write to it.
    fn release(&mut self) {
        let _registry = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        for (signal, previous) in self.previous.drain(..) {
            let action = match self.on_drop {
                OnDrop::Restore => &previous,
                OnDrop::Ignore => &ignore,
            };
            // SAFETY: restoring a disposition that was valid before, or SIG_IGN.
            if let Err(errno) = unsafe { signal::sigaction(signal, action) } {
                tracing::warn!(signal = signal.as_str(), %errno, "failed to reset signal disposition");
            }
        }
        let fd = self.wake.as_raw_fd();
        for &signal in &self.signals {
            let _ = ROUTES[slot(signal)].compare_exchange(fd, -1, Ordering::SeqCst, Ordering::SeqCst);
        }
        // Any disposition that read our fd has finished with it once this drains.
        while IN_FLIGHT.load(Ordering::SeqCst) != 0 {
            std::thread::yield_now();
        }
    }

    fn request_stop(&self) {
        let mut wake = &self.wake;
        loop {
            match wake.write(&[STOP]) {
                Ok(_) => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                // Channel full of pending signals; the thread is draining it.
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1))
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to wake signal dispatch thread");
                    return;
                }
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let Some(thread) = self.thread.take() else {
            // Construction failed part way through; undo it completely.
            self.on_drop = OnDrop::Restore;
            self.release();
            return;
        };
        self.request_stop();
        if thread.join().is_err() {
            tracing::error!("signal dispatch thread panicked");
        }
        self.release();
        tracing::info!(signals = ?self.signal_names(), "signal dispatcher stopped");
    }
}

struct Worker<H> {
    channel: UnixStream,
    signals: Vec<Signal>,
    handler: H,
    sink: Box<dyn ErrorSink>,
}

impl<H: Handler> Worker<H> {
    fn run(mut self) {
        let mut buf = [0u8; 64];
        loop {
            let n = match self.channel.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!(error = %e, "signal channel read failed");
                    return;
                }
            };
            self.report_dropped();
            for &byte in &buf[..n] {
                if byte == STOP {
                    return;
                }
                match Signal::try_from(byte as i32) {
                    Ok(signal) => self.dispatch(signal),
                    Err(_) => tracing::warn!(signo = byte, "unknown signal number on channel"),
                }
            }
        }
    }

    fn dispatch(&mut self, signal: Signal) {
        tracing::debug!(signal = signal.as_str(), "dispatching signal");
        let handler = &mut self.handler;
        let failure = match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(signal))) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => HandlerFailure::Error(e),
            Err(payload) => HandlerFailure::Panic(panic_message(payload)),
        };
        let sink = &mut self.sink;
        if panic::catch_unwind(AssertUnwindSafe(|| sink.report(signal, failure))).is_err() {
            tracing::error!(signal = signal.as_str(), "signal error sink panicked");
        }
    }

    fn report_dropped(&self) {
        for &signal in &self.signals {
            let dropped = DROPPED[slot(signal)].swap(0, Ordering::Relaxed);
            if dropped > 0 {
                tracing::warn!(
                    signal = signal.as_str(),
                    dropped,
                    "signal channel full, deliveries lost"
                );
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
