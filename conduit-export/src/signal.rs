//! Signal handling.
//!
//! `ShutdownFlag` handles SIGINT (Ctrl+C) for graceful shutdown of the replay loop.
//! `ProcessEvents` carries the three asynchronous events the piped exporter reacts
//! to: an operator restart request (SIGUSR2), a child exit (SIGCHLD) and a broken
//! pipe (SIGPIPE). Handlers only set flags; the exporter's worker consumes them.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGCHLD, SIGPIPE, SIGUSR2};
use signal_hook::SigId;
use thiserror::Error;

/// Errors from signal handler registration.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("failed to register {signal} handler: {source}")]
    Register {
        signal: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Trait for checking shutdown status.
pub trait ShutdownCheck: Send + Sync {
    /// Returns true if shutdown has been requested.
    fn should_stop(&self) -> bool;
}

/// Flag that tracks whether shutdown has been requested.
///
/// When created with `new()`, registers a SIGINT handler that sets the flag.
#[derive(Debug, Clone)]
pub struct ShutdownFlag {
    flag: Arc<AtomicBool>,
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownFlag {
    /// Create a new shutdown flag and register the SIGINT handler.
    ///
    /// If the handler cannot be registered (e.g., already registered), the returned
    /// flag still works when triggered manually.
    pub fn new() -> Self {
        let flag = Arc::new(AtomicBool::new(false));
        let flag_clone = flag.clone();

        let _ = ctrlc::set_handler(move || {
            flag_clone.store(true, Ordering::SeqCst);
        });

        Self { flag }
    }

    /// Create a shutdown flag without registering a handler.
    pub fn manual() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl ShutdownCheck for ShutdownFlag {
    fn should_stop(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Shutdown checker that never signals shutdown.
#[derive(Debug, Default, Clone)]
pub struct NeverShutdown;

impl ShutdownCheck for NeverShutdown {
    fn should_stop(&self) -> bool {
        false
    }
}

/// Pending asynchronous process-control events.
///
/// Clones share the same flags. Each `take_*` consumes its event, so two
/// notifications that arrive before the worker looks collapse into one.
#[derive(Debug, Clone, Default)]
pub struct ProcessEvents {
    restart: Arc<AtomicBool>,
    child_exited: Arc<AtomicBool>,
    broken_pipe: Arc<AtomicBool>,
}

impl ProcessEvents {
    /// Events raised only through the programmatic setters.
    pub fn manual() -> Self {
        Self::default()
    }

    /// Install handlers for SIGUSR2, SIGCHLD and SIGPIPE that raise these events.
    ///
    /// The handlers stay installed until the returned registration is dropped.
    pub fn register(&self) -> Result<SignalRegistration, SignalError> {
        let mut registration = SignalRegistration { ids: Vec::new() };
        let handlers = [
            ("SIGUSR2", SIGUSR2, &self.restart),
            ("SIGCHLD", SIGCHLD, &self.child_exited),
            ("SIGPIPE", SIGPIPE, &self.broken_pipe),
        ];
        for (signal, number, flag) in handlers {
            // On failure `registration` drops here and removes the handlers already set.
            let id = signal_hook::flag::register(number, Arc::clone(flag))
                .map_err(|source| SignalError::Register { signal, source })?;
            registration.ids.push(id);
        }
        Ok(registration)
    }

    pub fn request_restart(&self) {
        self.restart.store(true, Ordering::SeqCst);
    }

    pub fn notify_child_exit(&self) {
        self.child_exited.store(true, Ordering::SeqCst);
    }

    pub fn notify_broken_pipe(&self) {
        self.broken_pipe.store(true, Ordering::SeqCst);
    }

    pub fn take_restart(&self) -> bool {
        self.restart.swap(false, Ordering::SeqCst)
    }

    pub fn take_child_exit(&self) -> bool {
        self.child_exited.swap(false, Ordering::SeqCst)
    }

    pub fn take_broken_pipe(&self) -> bool {
        self.broken_pipe.swap(false, Ordering::SeqCst)
    }
}

/// Installed signal handlers; unregistered on drop.
#[derive(Debug)]
pub struct SignalRegistration {
    ids: Vec<SigId>,
}

impl SignalRegistration {
    pub fn handler_count(&self) -> usize {
        self.ids.len()
    }
}

impl Drop for SignalRegistration {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===========================================
    // ShutdownFlag Tests
    // ===========================================

    #[test]
    fn test_shutdown_flag_initially_false() {
        let flag = ShutdownFlag::manual();
        assert!(!flag.should_stop());
    }

    #[test]
    fn test_shutdown_flag_trigger_and_reset() {
        let flag = ShutdownFlag::manual();
        flag.trigger();
        assert!(flag.should_stop());
        flag.reset();
        assert!(!flag.should_stop());
    }

    #[test]
    fn test_shutdown_flag_clone_shares_state() {
        let flag1 = ShutdownFlag::manual();
        let flag2 = flag1.clone();
        flag1.trigger();
        assert!(flag2.should_stop());
    }

    #[test]
    fn test_never_shutdown() {
        let checker: Box<dyn ShutdownCheck> = Box::new(NeverShutdown);
        assert!(!checker.should_stop());
    }

    #[test]
    fn test_shutdown_flag_new_does_not_panic() {
        let flag = ShutdownFlag::new();
        assert!(!flag.should_stop());
    }

    // ===========================================
    // ProcessEvents Tests
    // ===========================================

    #[test]
    fn test_events_start_clear() {
        let events = ProcessEvents::manual();
        assert!(!events.take_restart());
        assert!(!events.take_child_exit());
        assert!(!events.take_broken_pipe());
    }

    #[test]
    fn test_take_consumes_event() {
        let events = ProcessEvents::manual();
        events.request_restart();
        events.request_restart();
        assert!(events.take_restart());
        assert!(!events.take_restart());
    }

    #[test]
    fn test_events_are_independent() {
        let events = ProcessEvents::manual();
        events.notify_child_exit();
        assert!(!events.take_restart());
        assert!(!events.take_broken_pipe());
        assert!(events.take_child_exit());

        events.notify_broken_pipe();
        assert!(events.take_broken_pipe());
    }

    #[test]
    fn test_events_clone_shares_flags() {
        let events = ProcessEvents::manual();
        let handle = events.clone();
        handle.notify_child_exit();
        assert!(events.take_child_exit());
        assert!(!handle.take_child_exit());
    }

    #[test]
    fn test_register_raises_restart_on_sigusr2() {
        let events = ProcessEvents::manual();
        let registration = events.register().expect("register");
        assert_eq!(registration.handler_count(), 3);

        signal_hook::low_level::raise(SIGUSR2).expect("raise");
        assert!(events.take_restart());
    }

    #[test]
    fn test_register_raises_child_exit_on_sigchld() {
        let events = ProcessEvents::manual();
        let _registration = events.register().expect("register");

        signal_hook::low_level::raise(SIGCHLD).expect("raise");
        assert!(events.take_child_exit());
    }

    #[test]
    fn test_register_raises_broken_pipe_on_sigpipe() {
        let events = ProcessEvents::manual();
        let _registration = events.register().expect("register");

        // With the handler installed SIGPIPE no longer terminates the process.
        signal_hook::low_level::raise(SIGPIPE).expect("raise");
        assert!(events.take_broken_pipe());
    }

    #[test]
    fn test_dropped_registration_stops_raising_events() {
        let events = ProcessEvents::manual();
        let registration = events.register().expect("register");
        drop(registration);

        let other = ProcessEvents::manual();
        let _registration = other.register().expect("register");
        signal_hook::low_level::raise(SIGPIPE).expect("raise");
        assert!(other.take_broken_pipe());
        assert!(!events.take_broken_pipe());
    }
}
