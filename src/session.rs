//! # Sync Session
//!
//! Bookkeeping of the connection to the live backend: whether it answered last time, how it
//! failed, and the refreshes deferred until it answers again.
//!
//! Deferred tasks are one-shot. After the next successful synchronization every pending task is
//! released exactly once and then forgotten. Tasks carry the session generation they were
//! registered in; tasks of an earlier process are dropped instead of released.
//!
//! A backend that learns about a finished synchronization on another thread reports it through
//! a [`SyncNotifier`]. The signal is only queued there; the thread owning the session picks it up
//! with [`SyncSession::pump`], so the session is never touched from two threads.

use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, Sender};

use serde::Serialize;
use tracing::{debug, trace};

use crate::errors::FailureKind;

/// A refresh that should happen after the backend answers again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferredTask {
    /// Run one refresh cycle, scheduled because of the given failure
    Refresh { after: FailureKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Deferred {
    generation: u64,
    task: DeferredTask,
}

/// Signals a backend can send from any thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSignal {
    /// The backend finished a synchronization with the target
    Synced,
}

/// Cloneable sending half for [`SyncSignal`]s
#[derive(Debug, Clone)]
pub struct SyncNotifier {
    tx: Sender<SyncSignal>,
}

impl SyncNotifier {
    /// Queue a signal for the owning thread, `false` if the session is gone
    pub fn notify(&self, signal: SyncSignal) -> bool {
        self.tx.send(signal).is_ok()
    }
}

#[derive(Debug)]
pub struct SyncSession {
    generation: u64,
    reachable: bool,
    last_error: Option<FailureKind>,
    pending: VecDeque<Deferred>,
    ready: VecDeque<DeferredTask>,
    signals: Receiver<SyncSignal>,
    notifier: SyncNotifier,
}

impl Default for SyncSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncSession {
    pub fn new() -> Self {
        let (tx, rx) = channel();
        Self {
            generation: 0,
            reachable: false,
            last_error: None,
            pending: VecDeque::new(),
            ready: VecDeque::new(),
            signals: rx,
            notifier: SyncNotifier { tx },
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    pub fn last_error(&self) -> Option<FailureKind> {
        self.last_error
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn notifier(&self) -> SyncNotifier {
        self.notifier.clone()
    }

    /// A new process starts, everything deferred for the old one is void
    pub fn begin_generation(&mut self) -> u64 {
        self.generation += 1;
        let dropped = self.pending.len() + self.ready.len();
        if dropped > 0 {
            debug!("dropping {dropped} deferred tasks of the previous process");
        }
        self.pending.clear();
        self.ready.clear();
        self.last_error = None;
        self.generation
    }

    pub fn register(&mut self, task: DeferredTask) {
        trace!("deferring {task:?} in generation {}", self.generation);
        self.pending.push_back(Deferred {
            generation: self.generation,
            task,
        });
    }

    pub fn record_failure(&mut self, kind: FailureKind) {
        self.reachable = false;
        self.last_error = Some(kind);
    }

    /// The backend answered, release every pending task exactly once
    pub fn record_success(&mut self) {
        self.reachable = true;
        self.last_error = None;
        let generation = self.generation;
        for deferred in self.pending.drain(..) {
            if deferred.generation == generation {
                self.ready.push_back(deferred.task);
            } else {
                debug!("dropping stale deferred task {:?}", deferred.task);
            }
        }
    }

    /// Applies the signals queued by other threads
    pub fn pump(&mut self) {
        while let Ok(signal) = self.signals.try_recv() {
            match signal {
                SyncSignal::Synced => self.record_success(),
            }
        }
    }

    /// Takes the released tasks, each is handed out only once
    pub fn take_ready(&mut self) -> Vec<DeferredTask> {
        self.ready.drain(..).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const RETRY: DeferredTask = DeferredTask::Refresh {
        after: FailureKind::Busy,
    };

    #[test]
    fn test_release_exactly_once() {
        let mut s = SyncSession::new();
        s.record_failure(FailureKind::Busy);
        s.register(RETRY);
        assert!(s.take_ready().is_empty());
        assert_eq!(s.last_error(), Some(FailureKind::Busy));

        s.record_success();
        assert!(s.is_reachable());
        assert_eq!(s.take_ready(), vec![RETRY]);
        assert!(s.take_ready().is_empty());

        s.record_success();
        assert!(s.take_ready().is_empty());
        assert!(!s.has_pending());
    }

    #[test]
    fn test_new_generation_drops_tasks() {
        let mut s = SyncSession::new();
        s.register(RETRY);
        assert_eq!(s.begin_generation(), 1);
        s.record_success();
        assert!(s.take_ready().is_empty());
    }

    #[test]
    fn test_signal_from_other_thread() {
        let mut s = SyncSession::new();
        s.record_failure(FailureKind::NoTarget);
        s.register(RETRY);
        let notifier = s.notifier();
        std::thread::spawn(move || {
            assert!(notifier.notify(SyncSignal::Synced));
        })
        .join()
        .unwrap();

        // nothing happens until the owner pumps
        assert!(s.take_ready().is_empty());
        s.pump();
        assert_eq!(s.take_ready(), vec![RETRY]);
    }
}
