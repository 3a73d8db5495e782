//! Debounced, single-flight snapshot persistence.
//!
//! ```text
//! notify_mutation ──► debounce ──► Due(Auto) ──┐
//! trigger_manual  ─────────────► Due(Manual) ──┤
//!                                              ▼
//!                          start(latest snapshot) ──► backend.save
//!                                                        │
//!                     ┌──────────── ok ──────────────────┤
//!                     ▼                                  ▼ err
//!                  Saved                  Retrying ──► Due (fixed delay)
//!                                          └─ attempts exhausted ─► Failed
//! ```
//!
//! At most one save is in flight. A save requested while one is running
//! is parked and reported as `Due` once it completes, so the owner hands
//! over the snapshot as it is at that moment. Like the connection
//! manager, the scheduler spawns nothing: the in-flight save is a future
//! polled from [`AutoSaveScheduler::next_event`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use crate::config::CollabConfig;
use crate::storage::{PersistenceBackend, PersistenceError};

/// Why a save was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveReason {
    Auto,
    Manual,
}

/// The save currently in flight or waiting for its retry.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveTask {
    pub reason: SaveReason,
    /// 1 for the first try.
    pub attempt: u32,
    /// Oldest unsaved mutation covered by this task.
    pub pending_since: Instant,
}

/// Save status as reported to observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SaveState {
    #[default]
    Idle,
    /// Unsaved changes, debounce running.
    Pending,
    Saving,
    Saved,
    /// Last attempt failed, another one is scheduled.
    Retrying,
    /// Retries exhausted. Editing continues; the next mutation re-arms.
    Failed,
}

/// Events produced by [`AutoSaveScheduler::next_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum SaveEvent {
    /// A save should start now; answer with [`AutoSaveScheduler::start`].
    Due(SaveReason),
    StatusChanged {
        state: SaveState,
        last_saved_at: Option<SystemTime>,
    },
}

pub struct AutoSaveScheduler<B: PersistenceBackend> {
    backend: Arc<B>,
    doc_id: Uuid,
    debounce: Duration,
    retry_delay: Duration,
    max_retries: u32,

    state: SaveState,
    last_saved_at: Option<SystemTime>,
    /// Oldest mutation not yet handed to a save.
    dirty_since: Option<Instant>,

    debounce_at: Option<Instant>,
    retry_at: Option<Instant>,
    /// Issue a save as soon as nothing is in flight.
    due: Option<SaveReason>,

    task: Option<SaveTask>,
    in_flight: Option<BoxFuture<'static, Result<(), PersistenceError>>>,

    outbox: VecDeque<SaveEvent>,
    closed: bool,
}

impl<B: PersistenceBackend> AutoSaveScheduler<B> {
    pub fn new(backend: Arc<B>, doc_id: Uuid, config: &CollabConfig) -> Self {
        Self {
            backend,
            doc_id,
            debounce: config.auto_save_debounce(),
            retry_delay: config.save_retry_delay(),
            max_retries: config.max_save_retries,
            state: SaveState::Idle,
            last_saved_at: None,
            dirty_since: None,
            debounce_at: None,
            retry_at: None,
            due: None,
            task: None,
            in_flight: None,
            outbox: VecDeque::new(),
            closed: false,
        }
    }

    /// Record a local or merged mutation and restart the quiet period.
    pub fn notify_mutation(&mut self) {
        if self.closed {
            return;
        }
        let now = Instant::now();
        self.dirty_since.get_or_insert(now);
        self.debounce_at = Some(now + self.debounce);
        if self.in_flight.is_none() && self.retry_at.is_none() {
            self.set_state(SaveState::Pending);
        }
    }

    /// Skip the debounce and save as soon as possible.
    pub fn trigger_manual(&mut self) {
        if self.closed {
            return;
        }
        self.debounce_at = None;
        if self.retry_at.take().is_some() {
            // A manual save starts a fresh attempt count.
            self.task = None;
        }
        self.due = Some(SaveReason::Manual);
    }

    /// Begin a save of `snapshot`. Called in answer to [`SaveEvent::Due`].
    ///
    /// Ignored while another save is in flight; that request stays parked.
    pub fn start(&mut self, snapshot: Vec<u8>) {
        if self.closed || self.in_flight.is_some() {
            return;
        }
        let now = Instant::now();
        let reason = self.due.take().unwrap_or(SaveReason::Auto);
        let pending_since = self.dirty_since.take().unwrap_or(now);

        // A retry keeps counting attempts; anything else starts fresh.
        let task = match self.task.take() {
            Some(prev) if self.retry_at.is_none() => SaveTask {
                reason: prev.reason,
                attempt: prev.attempt + 1,
                pending_since: prev.pending_since.min(pending_since),
            },
            _ => SaveTask {
                reason,
                attempt: 1,
                pending_since,
            },
        };
        self.retry_at = None;
        self.debounce_at = None;

        log::debug!(
            "Saving {} ({:?}, attempt {}, {} bytes)",
            self.doc_id,
            task.reason,
            task.attempt,
            snapshot.len()
        );
        let backend = Arc::clone(&self.backend);
        let doc_id = self.doc_id;
        self.in_flight = Some(async move { backend.save(doc_id, snapshot).await }.boxed());
        self.task = Some(task);
        self.set_state(SaveState::Saving);
    }

    /// Wait for the next scheduler event. Cancel-safe.
    ///
    /// Never resolves after [`flush_and_wait`](Self::flush_and_wait).
    pub async fn next_event(&mut self) -> SaveEvent {
        loop {
            if let Some(event) = self.outbox.pop_front() {
                return event;
            }
            if self.closed {
                std::future::pending::<()>().await;
            }
            if self.in_flight.is_none() {
                if let Some(reason) = self.due {
                    return SaveEvent::Due(reason);
                }
            }

            let debounce = self.debounce_at;
            let retry = self.retry_at;

            tokio::select! {
                result = async {
                    match self.in_flight.as_mut() {
                        Some(fut) => fut.await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.in_flight = None;
                    self.on_complete(result);
                }

                _ = wait_for(debounce) => {
                    self.debounce_at = None;
                    self.due.get_or_insert(SaveReason::Auto);
                }

                _ = wait_for(retry) => {
                    // Retry keeps the reason of the task being retried.
                    let reason = self.task.as_ref().map_or(SaveReason::Auto, |t| t.reason);
                    self.retry_at = None;
                    self.due = Some(reason);
                }
            }
        }
    }

    /// Final save at shutdown.
    ///
    /// Cancels the debounce and any retry, waits out a save already in
    /// flight, then saves `snapshot` once if anything is unsaved. The
    /// scheduler is inert afterwards.
    pub async fn flush_and_wait(&mut self, snapshot: Vec<u8>) -> Result<(), PersistenceError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.debounce_at = None;
        self.outbox.clear();

        let mut unsaved = self.dirty_since.is_some()
            || self.due.is_some()
            || self.retry_at.is_some()
            || self.state == SaveState::Failed;
        self.retry_at = None;
        self.due = None;

        if let Some(fut) = self.in_flight.take() {
            if let Err(e) = fut.await {
                log::warn!("In-flight save of {} failed during flush: {e}", self.doc_id);
                unsaved = true;
            } else {
                self.last_saved_at = Some(SystemTime::now());
            }
        }
        self.task = None;

        if !unsaved {
            self.state = if self.last_saved_at.is_some() {
                SaveState::Saved
            } else {
                SaveState::Idle
            };
            return Ok(());
        }

        self.state = SaveState::Saving;
        match self.backend.save(self.doc_id, snapshot).await {
            Ok(()) => {
                self.dirty_since = None;
                self.last_saved_at = Some(SystemTime::now());
                self.state = SaveState::Saved;
                log::info!("Final save of {} complete", self.doc_id);
                Ok(())
            }
            Err(e) => {
                self.state = SaveState::Failed;
                log::error!("Final save of {} failed: {e}", self.doc_id);
                Err(e)
            }
        }
    }

    fn on_complete(&mut self, result: Result<(), PersistenceError>) {
        let task = match self.task.take() {
            Some(task) => task,
            None => return,
        };
        match result {
            Ok(()) => {
                self.last_saved_at = Some(SystemTime::now());
                log::info!(
                    "Saved {} after {:?} ({:?}, attempt {})",
                    self.doc_id,
                    task.pending_since.elapsed(),
                    task.reason,
                    task.attempt
                );
                self.set_state(SaveState::Saved);
                if self.dirty_since.is_some() || self.due.is_some() {
                    self.set_state(SaveState::Pending);
                }
            }
            Err(e) if task.attempt <= self.max_retries => {
                log::warn!(
                    "Save of {} failed (attempt {}): {e}, retrying in {:?}",
                    self.doc_id,
                    task.attempt,
                    self.retry_delay
                );
                self.dirty_since = Some(
                    self.dirty_since
                        .map_or(task.pending_since, |d| d.min(task.pending_since)),
                );
                if self.due.is_some() {
                    // A fresh request is already parked; it carries newer content.
                    self.set_state(SaveState::Pending);
                } else {
                    self.retry_at = Some(Instant::now() + self.retry_delay);
                    self.task = Some(task);
                    self.set_state(SaveState::Retrying);
                }
            }
            Err(e) => {
                log::error!(
                    "Save of {} failed after {} attempts: {e}",
                    self.doc_id,
                    task.attempt
                );
                self.dirty_since = Some(
                    self.dirty_since
                        .map_or(task.pending_since, |d| d.min(task.pending_since)),
                );
                self.set_state(SaveState::Failed);
            }
        }
    }

    fn set_state(&mut self, state: SaveState) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.outbox.push_back(SaveEvent::StatusChanged {
            state,
            last_saved_at: self.last_saved_at,
        });
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn state(&self) -> SaveState {
        self.state
    }

    pub fn last_saved_at(&self) -> Option<SystemTime> {
        self.last_saved_at
    }

    pub fn is_saving(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Task in flight or waiting for a retry.
    pub fn task(&self) -> Option<&SaveTask> {
        self.task.as_ref()
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.dirty_since.is_some() || self.in_flight.is_some()
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn scheduler() -> (AutoSaveScheduler<MemoryBackend>, MemoryBackend, Uuid) {
        let backend = MemoryBackend::new();
        let doc = Uuid::new_v4();
        let sched = AutoSaveScheduler::new(Arc::new(backend.clone()), doc, &CollabConfig::for_testing());
        (sched, backend, doc)
    }

    /// Drive the scheduler like the session loop does, answering `Due`
    /// with `snapshot()` at that moment. Returns the statuses seen until
    /// `until` matches one of them.
    async fn drive(
        sched: &mut AutoSaveScheduler<MemoryBackend>,
        snapshot: impl Fn() -> Vec<u8>,
        until: SaveState,
    ) -> Vec<SaveState> {
        let mut seen = Vec::new();
        loop {
            match sched.next_event().await {
                SaveEvent::Due(_) => sched.start(snapshot()),
                SaveEvent::StatusChanged { state, .. } => {
                    seen.push(state);
                    if state == until {
                        return seen;
                    }
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_debounce_uses_latest_snapshot() {
        let (mut sched, backend, doc) = scheduler();
        let mut latest = Vec::new();
        let mut last_mutation = Instant::now();
        for i in 0..5u8 {
            latest.push(i);
            sched.notify_mutation();
            last_mutation = Instant::now();
            tokio::time::advance(Duration::from_millis(30)).await;
        }
        assert_eq!(sched.state(), SaveState::Pending);

        let snap = latest.clone();
        drive(&mut sched, || snap.clone(), SaveState::Saved).await;

        // Debounce restarted at the fifth mutation.
        assert!(last_mutation.elapsed() >= Duration::from_millis(200));
        assert_eq!(backend.save_calls(), vec![(doc, vec![0, 1, 2, 3, 4])]);
        assert!(sched.last_saved_at().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_trigger_skips_debounce() {
        let (mut sched, backend, _) = scheduler();
        sched.notify_mutation();
        sched.trigger_manual();

        let started = Instant::now();
        drive(&mut sched, || vec![7], SaveState::Saved).await;
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(backend.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_during_flight_are_coalesced() {
        let (mut sched, backend, doc) = scheduler();
        backend.set_latency(Duration::from_millis(100));

        sched.trigger_manual();
        assert_eq!(sched.next_event().await, SaveEvent::Due(SaveReason::Manual));
        sched.start(vec![1]);
        assert!(sched.is_saving());
        assert_eq!(sched.task().unwrap().reason, SaveReason::Manual);
        assert!(matches!(
            sched.next_event().await,
            SaveEvent::StatusChanged { state: SaveState::Saving, .. }
        ));

        // Three more requests while the first save runs.
        sched.notify_mutation();
        sched.trigger_manual();
        sched.trigger_manual();
        sched.start(vec![99]);

        let seen = drive(&mut sched, || vec![1, 2, 3], SaveState::Saving).await;
        assert_eq!(seen, vec![SaveState::Saved, SaveState::Pending, SaveState::Saving]);
        drive(&mut sched, || vec![1, 2, 3], SaveState::Saved).await;

        assert_eq!(backend.save_calls(), vec![(doc, vec![1]), (doc, vec![1, 2, 3])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_fixed_delay_then_succeeds() {
        let (mut sched, backend, doc) = scheduler();
        backend.fail_next_saves(2);
        sched.trigger_manual();

        let started = Instant::now();
        let seen = drive(&mut sched, || vec![5], SaveState::Saved).await;
        assert_eq!(
            seen,
            vec![
                SaveState::Saving,
                SaveState::Retrying,
                SaveState::Saving,
                SaveState::Retrying,
                SaveState::Saving,
                SaveState::Saved
            ]
        );
        // Two fixed 50ms retry delays.
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_millis(150));
        assert_eq!(backend.save_count(), 3);
        assert_eq!(backend.stored(doc), Some(vec![5]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_surface_failed() {
        let (mut sched, backend, _) = scheduler();
        backend.fail_next_saves(10);
        sched.trigger_manual();

        drive(&mut sched, || vec![5], SaveState::Failed).await;
        // First try plus max_save_retries (2 in the test config).
        assert_eq!(backend.save_count(), 3);
        assert!(sched.task().is_none());
        assert!(sched.has_unsaved_changes());

        // Nothing further is scheduled on its own.
        let idle = tokio::time::timeout(Duration::from_secs(5), sched.next_event()).await;
        assert!(idle.is_err());

        // A new mutation re-arms the debounce.
        backend.fail_next_saves(0);
        sched.notify_mutation();
        assert_eq!(sched.state(), SaveState::Pending);
        drive(&mut sched, || vec![6], SaveState::Saved).await;
        assert_eq!(backend.save_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_cancels_debounce_and_saves_once() {
        let (mut sched, backend, doc) = scheduler();
        sched.notify_mutation();
        sched.notify_mutation();

        sched.flush_and_wait(vec![8, 8]).await.unwrap();
        assert_eq!(backend.save_calls(), vec![(doc, vec![8, 8])]);
        assert_eq!(sched.state(), SaveState::Saved);

        // Inert afterwards.
        sched.notify_mutation();
        sched.trigger_manual();
        let idle = tokio::time::timeout(Duration::from_secs(5), sched.next_event()).await;
        assert!(idle.is_err());
        assert_eq!(backend.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_waits_for_in_flight_save() {
        let (mut sched, backend, doc) = scheduler();
        backend.set_latency(Duration::from_millis(100));
        sched.trigger_manual();
        assert!(matches!(sched.next_event().await, SaveEvent::Due(_)));
        sched.start(vec![1]);
        sched.notify_mutation();

        sched.flush_and_wait(vec![2]).await.unwrap();
        assert_eq!(backend.save_calls(), vec![(doc, vec![1]), (doc, vec![2])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_without_changes_skips_save() {
        let (mut sched, backend, _) = scheduler();
        sched.flush_and_wait(vec![1]).await.unwrap();
        assert_eq!(backend.save_count(), 0);
        assert_eq!(sched.state(), SaveState::Idle);
    }
}
