//! # Sync Client
//!
//! A thin request/response facade over the live debugging backend.
//!
//! The client forwards every request to a [`LiveBackend`] and keeps the [`SyncSession`] up to
//! date: failures are recorded with their [`FailureKind`], and the first successful fetch after
//! a failure releases the deferred retries. It never retries a request on its own, except for
//! the connection handshake in [`SyncClient::connect`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::addr::Addr;
use crate::backtrace::CallFrame;
use crate::errors::{LiveError, Result};
use crate::registers::RegisterSnapshot;
use crate::session::{DeferredTask, SyncNotifier, SyncSession};

/// Execution control requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecOp {
    /// Start the program, restarting it if it already runs
    Run,
    StepInto,
    StepOver,
    StepOut,
    Continue,
    Kill,
}

/// The protocol surface of a live debugging backend
///
/// Every call is synchronous from the caller's point of view. Errors that mean the target can
/// not answer right now must be reported as [`LiveError::Busy`] or [`LiveError::NoTarget`].
pub trait LiveBackend {
    /// Establish the connection, `Ok(false)` if the backend is not there yet
    fn connect(&mut self) -> Result<bool> {
        self.sync()
    }
    /// `Ok(true)` if the backend is reachable and the target can answer requests
    fn sync(&mut self) -> Result<bool>;
    fn get_registers(&mut self) -> Result<RegisterSnapshot>;
    fn get_memory(&mut self, addr: Addr, len: usize) -> Result<Vec<u8>>;
    fn get_backtrace(&mut self) -> Result<Vec<CallFrame>>;
    fn set_breakpoint(&mut self, addr: Addr) -> Result<()>;
    fn execute(&mut self, op: ExecOp) -> Result<()>;
    /// Route the target's standard streams to the given terminal
    fn set_tty(&mut self, tty: &Path) -> Result<()>;
    /// Arguments for the next [`ExecOp::Run`]
    fn set_arguments(&mut self, args: &[String]) -> Result<()>;
}

/// How often and how patiently [`SyncClient::connect`] tries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval: Duration::from_secs(1),
        }
    }
}

pub struct SyncClient<B: LiveBackend> {
    backend: B,
    session: SyncSession,
    policy: ConnectPolicy,
}

impl<B: LiveBackend> SyncClient<B> {
    pub fn new(backend: B, policy: ConnectPolicy) -> Self {
        Self {
            backend,
            session: SyncSession::new(),
            policy,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn session(&self) -> &SyncSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SyncSession {
        &mut self.session
    }

    /// Connects to the backend, trying up to [`ConnectPolicy::attempts`] times
    ///
    /// Blocks for the interval between attempts. Returns `false` if no attempt succeeded.
    pub fn connect(&mut self) -> bool {
        for attempt in 1..=self.policy.attempts {
            match self.backend.connect() {
                Ok(true) => {
                    info!("connected to the live backend");
                    self.session.record_success();
                    return true;
                }
                Ok(false) => debug!("connection attempt {attempt} was not answered"),
                Err(e) => warn!("connection attempt {attempt} failed: {e}"),
            }
            if attempt < self.policy.attempts {
                std::thread::sleep(self.policy.interval);
            }
        }
        self.session
            .record_failure(crate::errors::FailureKind::ConnectionFailed);
        false
    }

    /// Asks the backend whether the target answers, a `true` counts as success
    pub fn sync(&mut self) -> bool {
        match self.backend.sync() {
            Ok(true) => {
                self.session.record_success();
                true
            }
            Ok(false) => false,
            Err(e) => {
                self.record(&e);
                false
            }
        }
    }

    /// Fetches the registers, an empty snapshot means the process has exited
    pub fn fetch_registers(&mut self) -> Result<RegisterSnapshot> {
        let res = match self.backend.get_registers() {
            Ok(s) if s.is_empty() => Err(LiveError::NoTarget),
            res => res,
        };
        self.track(res)
    }

    pub fn fetch_memory(&mut self, base: Addr, len: usize) -> Result<Vec<u8>> {
        let res = self.backend.get_memory(base, len);
        self.track(res)
    }

    pub fn fetch_backtrace(&mut self) -> Result<Vec<CallFrame>> {
        let res = self.backend.get_backtrace();
        self.track(res)
    }

    pub fn set_breakpoint(&mut self, addr: Addr) -> Result<()> {
        self.backend.set_breakpoint(addr)
    }

    pub fn execution_control(&mut self, op: ExecOp) -> Result<()> {
        debug!("execution control: {op:?}");
        self.backend.execute(op)
    }

    pub fn redirect_io(&mut self, tty: &Path) -> Result<()> {
        self.backend.set_tty(tty)
    }

    pub fn set_arguments(&mut self, args: &[String]) -> Result<()> {
        self.backend.set_arguments(args)
    }

    pub fn register_one_shot_retry(&mut self, task: DeferredTask) {
        self.session.register(task);
    }

    /// Applies sync signals that other threads queued through a [`SyncNotifier`]
    pub fn pump_signals(&mut self) {
        self.session.pump();
    }

    pub fn take_ready(&mut self) -> Vec<DeferredTask> {
        self.session.take_ready()
    }

    pub fn notifier(&self) -> SyncNotifier {
        self.session.notifier()
    }

    fn track<T>(&mut self, res: Result<T>) -> Result<T> {
        match &res {
            Ok(_) => self.session.record_success(),
            Err(e) => self.record(e),
        }
        res
    }

    fn record(&mut self, e: &LiveError) {
        if let Some(kind) = e.failure_kind() {
            debug!("backend failure: {e} ({kind:?})");
            self.session.record_failure(kind);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::errors::FailureKind;
    use crate::testing::FakeBackend;

    fn client(backend: FakeBackend) -> SyncClient<FakeBackend> {
        SyncClient::new(
            backend,
            ConnectPolicy {
                attempts: 5,
                interval: Duration::ZERO,
            },
        )
    }

    #[test]
    fn test_connect_retries_until_bound() {
        let mut backend = FakeBackend::default();
        backend.connect_answers = vec![Ok(false), Ok(false), Ok(true)].into();
        let mut c = client(backend);
        assert!(c.connect());
        assert_eq!(c.backend().connect_calls, 3);
    }

    #[test]
    fn test_connect_gives_up() {
        let mut backend = FakeBackend::default();
        backend.connect_answers = (0..10).map(|_| Ok(false)).collect();
        let mut c = client(backend);
        assert!(!c.connect());
        assert_eq!(c.backend().connect_calls, 5);
        assert_eq!(
            c.session().last_error(),
            Some(FailureKind::ConnectionFailed)
        );
    }

    #[test]
    fn test_failure_then_success_releases_retry_once() {
        let mut backend = FakeBackend::stopped_at(0x40_1000, 0x7ffe_8f20, 0x7ffe_8f40);
        backend.register_answers = vec![Err(LiveError::Busy)].into();
        let mut c = client(backend);

        assert!(matches!(c.fetch_registers(), Err(LiveError::Busy)));
        assert_eq!(c.session().last_error(), Some(FailureKind::Busy));
        c.register_one_shot_retry(DeferredTask::Refresh {
            after: FailureKind::Busy,
        });

        assert!(c.fetch_registers().is_ok());
        assert_eq!(c.take_ready().len(), 1);
        assert!(c.fetch_registers().is_ok());
        assert!(c.take_ready().is_empty());
    }

    #[test]
    fn test_empty_registers_are_no_target() {
        let mut backend = FakeBackend::default();
        backend.register_answers = vec![Err(LiveError::Busy)].into();
        let mut c = client(backend);

        assert!(c.fetch_registers().is_err());
        c.register_one_shot_retry(DeferredTask::Refresh {
            after: FailureKind::Busy,
        });
        // an exited process answers with no registers, that keeps the retry pending
        assert!(matches!(c.fetch_registers(), Err(LiveError::NoTarget)));
        assert_eq!(c.session().last_error(), Some(FailureKind::NoTarget));
        assert!(c.take_ready().is_empty());
        assert_eq!(c.session().pending_len(), 1);
    }

    #[test]
    fn test_read_failure_is_not_a_sync_failure() {
        let mut backend = FakeBackend::stopped_at(0x40_1000, 0x7ffe_8f20, 0x7ffe_8f40);
        backend.memory_error = Some(LiveError::ReadFailure {
            addr: Addr::new(0),
            wanted: 4,
            got: 0,
        });
        let mut c = client(backend);
        assert!(c.fetch_registers().is_ok());
        assert!(c.fetch_memory(Addr::new(0), 4).is_err());
        assert!(c.session().is_reachable());
    }
}
