//! Signal handling for graceful shutdown
//!
//! Termination signals only touch atomics and a non-blocking wake socket,
//! all of which are async-signal-safe. The "received signal" log record is
//! written later by the service loop, never from the handler itself.

use std::fmt;
use std::io;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use signal_hook::SigId;

use super::service::Pause;
use crate::common::{Error, Result};

/// Signals that request a graceful shutdown
pub const SHUTDOWN_SIGNALS: [c_int; 2] = [SIGINT, SIGTERM];

/// What asked the service to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
    /// Programmatic request, no signal involved
    Requested,
    Other(i32),
}

impl ShutdownSignal {
    fn from_raw(signal: c_int) -> Self {
        match signal {
            SIGINT => ShutdownSignal::Interrupt,
            SIGTERM => ShutdownSignal::Terminate,
            other => ShutdownSignal::Other(other),
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Interrupt => f.write_str("SIGINT"),
            ShutdownSignal::Terminate => f.write_str("SIGTERM"),
            ShutdownSignal::Requested => f.write_str("shutdown request"),
            ShutdownSignal::Other(n) => write!(f, "signal {n}"),
        }
    }
}

/// Process-wide shutdown request
///
/// Starts unset and is never reset. Signal handlers record the signal
/// number before setting the flag, so a reader that sees the flag also sees
/// which signal set it. Only the first signal is recorded.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    requested: Arc<AtomicBool>,
    signal: Arc<AtomicUsize>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Request shutdown without a signal
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// The cause of the shutdown, once requested
    pub fn signal(&self) -> Option<ShutdownSignal> {
        if !self.is_set() {
            return None;
        }
        match self.signal.load(Ordering::SeqCst) {
            0 => Some(ShutdownSignal::Requested),
            n => Some(ShutdownSignal::from_raw(n as c_int)),
        }
    }
}

/// Registered signal actions feeding a [`ShutdownFlag`]
///
/// Dropping the bridge unregisters its actions.
pub struct SignalBridge {
    flag: ShutdownFlag,
    signals: Vec<c_int>,
    ids: Vec<SigId>,
    #[cfg(unix)]
    wake: WakePipe,
}

impl SignalBridge {
    /// Register SIGINT and SIGTERM
    pub fn install(flag: &ShutdownFlag) -> Result<Self> {
        Self::with_signals(flag, &SHUTDOWN_SIGNALS)
    }

    /// Register an explicit set of signals
    pub fn with_signals(flag: &ShutdownFlag, signals: &[c_int]) -> Result<Self> {
        let mut bridge = Self {
            flag: flag.clone(),
            signals: signals.to_vec(),
            ids: Vec::new(),
            #[cfg(unix)]
            wake: WakePipe::new().map_err(Error::SignalRegistration)?,
        };
        bridge.register().map_err(Error::SignalRegistration)?;
        Ok(bridge)
    }

    /// Drop every registered action and register them again
    ///
    /// Used once the process has detached, so the handlers belong to the
    /// final daemon process.
    pub fn reinstall(&mut self) -> io::Result<()> {
        self.unregister();
        self.register()
    }

    /// The flag this bridge sets
    pub fn flag(&self) -> &ShutdownFlag {
        &self.flag
    }

    /// Sleep for `interval`, returning early when a registered signal arrives
    pub fn wait(&mut self, interval: Duration) {
        if self.flag.is_set() || interval.is_zero() {
            return;
        }

        #[cfg(unix)]
        self.wake.wait(interval);

        #[cfg(not(unix))]
        std::thread::sleep(interval);
    }

    fn register(&mut self) -> io::Result<()> {
        for &signal in &self.signals {
            // Actions run in registration order: number, then flag, then wake
            self.ids.push(record_first_signal(signal, Arc::clone(&self.flag.signal))?);
            self.ids
                .push(flag::register(signal, Arc::clone(&self.flag.requested))?);
            #[cfg(unix)]
            self.ids.push(signal_hook::low_level::pipe::register(
                signal,
                self.wake.sender()?,
            )?);
        }
        tracing::debug!(signals = ?self.signals, "signal handlers registered");
        Ok(())
    }

    fn unregister(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

/// Store `signal` in `slot` unless an earlier signal is already recorded
fn record_first_signal(signal: c_int, slot: Arc<AtomicUsize>) -> io::Result<SigId> {
    let action = move || {
        let _ = slot.compare_exchange(0, signal as usize, Ordering::SeqCst, Ordering::SeqCst);
    };
    // SAFETY: the action only performs an atomic compare-exchange, which is
    // async-signal-safe
    unsafe { signal_hook::low_level::register(signal, action) }
}

impl Pause for SignalBridge {
    fn pause(&mut self, interval: Duration) {
        self.wait(interval);
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        self.unregister();
    }
}

/// Socket pair written by the signal handler and read by [`SignalBridge::wait`]
#[cfg(unix)]
struct WakePipe {
    receiver: std::os::unix::net::UnixStream,
    sender: std::os::unix::net::UnixStream,
}

#[cfg(unix)]
impl WakePipe {
    fn new() -> io::Result<Self> {
        let (receiver, sender) = std::os::unix::net::UnixStream::pair()?;
        sender.set_nonblocking(true)?;
        Ok(Self { receiver, sender })
    }

    fn sender(&self) -> io::Result<std::os::unix::net::UnixStream> {
        self.sender.try_clone()
    }

    fn wait(&mut self, interval: Duration) {
        use std::io::Read;

        if self.receiver.set_read_timeout(Some(interval)).is_err() {
            std::thread::sleep(interval);
            return;
        }
        // Data, timeout and EINTR all end the wait; the caller re-checks the flag
        let mut buf = [0u8; 16];
        let _ = self.receiver.read(&mut buf);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use signal_hook::consts::{SIGUSR1, SIGUSR2, SIGWINCH};
    use signal_hook::low_level::raise;
    use std::time::Instant;

    #[test]
    fn test_flag_starts_unset() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_set());
        assert_eq!(flag.signal(), None);
    }

    #[test]
    fn test_programmatic_request() {
        let flag = ShutdownFlag::new();
        let observer = flag.clone();
        flag.request();
        assert!(observer.is_set());
        assert_eq!(observer.signal(), Some(ShutdownSignal::Requested));
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(ShutdownSignal::from_raw(SIGINT).to_string(), "SIGINT");
        assert_eq!(ShutdownSignal::from_raw(SIGTERM).to_string(), "SIGTERM");
        assert_eq!(ShutdownSignal::Other(10).to_string(), "signal 10");
    }

    #[test]
    fn test_repeated_signal_is_idempotent() {
        let flag = ShutdownFlag::new();
        let _bridge = SignalBridge::with_signals(&flag, &[SIGUSR1, SIGWINCH]).unwrap();

        raise(SIGUSR1).unwrap();
        assert!(flag.is_set());
        let first = flag.signal();
        assert_eq!(first, Some(ShutdownSignal::Other(SIGUSR1)));

        raise(SIGUSR1).unwrap();
        assert_eq!(flag.signal(), first);

        // A different signal after the first one does not change the cause
        raise(SIGWINCH).unwrap();
        assert!(flag.is_set());
        assert_eq!(flag.signal(), first);
    }

    #[test]
    fn test_signal_wakes_wait_early() {
        let flag = ShutdownFlag::new();
        let mut bridge = SignalBridge::with_signals(&flag, &[SIGUSR2]).unwrap();
        bridge.reinstall().unwrap();

        let sender = std::thread::spawn(|| {
            std::thread::sleep(Duration::from_millis(100));
            raise(SIGUSR2).unwrap();
        });

        let started = Instant::now();
        bridge.wait(Duration::from_secs(30));
        sender.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(flag.is_set());
    }

    #[test]
    fn test_wait_returns_immediately_once_flagged() {
        let flag = ShutdownFlag::new();
        let mut bridge = SignalBridge::with_signals(&flag, &[]).unwrap();
        flag.request();

        let started = Instant::now();
        bridge.wait(Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
