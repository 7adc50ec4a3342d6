// src/pipeline/poller.rs

//! Per-target polling worker.
//!
//! A worker owns one target and runs its cycles strictly one after another:
//!
//! ```text
//! Idle -> Polling -> Cooling -> Idle      (cycle completed)
//!                 -> Backoff -> Idle      (blocked or authentication exhausted)
//!                 -> Idle                 (parse, transient or storage failure)
//! ```
//!
//! Within a cycle: session, fetch, diff, commit(snapshot + outbox), notify,
//! commit(snapshot + what is still undelivered). Events are committed before
//! any delivery starts, so a crash between the two commits re-delivers rather
//! than loses them.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::{
    NotificationEvent, Recipient, SessionHealth, SlotChange, Snapshot, Target, TargetKey,
};
use crate::pipeline::backoff::{Backoff, RetryPolicy, jittered};
use crate::pipeline::diff::{SlotDiff, diff};
use crate::pipeline::rate_limit::HostRateLimiter;
use crate::services::{Authenticator, Fetcher, Notifier, SessionProvider};
use crate::storage::SnapshotStore;

/// Where a worker is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Polling,
    Cooling,
    Backoff,
}

/// Counts for a cycle that reached the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub slots: usize,
    pub baseline: bool,
    pub appeared: usize,
    pub disappeared: usize,
    pub sent: usize,
    pub failed: usize,
    pub pending: usize,
}

/// Result of one polling cycle.
#[derive(Debug)]
pub enum CycleOutcome {
    Completed(CycleSummary),
    Failed(AppError),
    Cancelled,
}

impl CycleOutcome {
    /// State the worker moves to after this outcome.
    pub fn next_state(&self) -> PollState {
        match self {
            CycleOutcome::Completed(_) => PollState::Cooling,
            CycleOutcome::Failed(AppError::Blocked { .. })
            | CycleOutcome::Failed(AppError::AuthExhausted { .. }) => PollState::Backoff,
            CycleOutcome::Failed(_) | CycleOutcome::Cancelled => PollState::Idle,
        }
    }
}

/// Collaborators shared by every worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn SnapshotStore>,
    pub notifier: Arc<Notifier>,
    pub fetch_limiter: Arc<HostRateLimiter>,
    pub auth_limiter: Arc<HostRateLimiter>,
    pub fetch_retry: RetryPolicy,
    pub auth_retry: RetryPolicy,
    pub session_max_age: Duration,
    pub notify_disappeared: bool,
}

/// Drives one target.
pub struct TargetWorker {
    target: Arc<Target>,
    key: TargetKey,
    host: String,
    recipients: Vec<Recipient>,
    fetcher: Arc<dyn Fetcher>,
    session: SessionProvider,
    ctx: WorkerContext,
    backoff: Backoff,
    state: PollState,
}

impl TargetWorker {
    pub fn new(
        target: Target,
        recipients: Vec<Recipient>,
        fetcher: Arc<dyn Fetcher>,
        authenticator: Arc<dyn Authenticator>,
        ctx: WorkerContext,
    ) -> Result<Self> {
        let target = Arc::new(target);
        let session = SessionProvider::new(
            Arc::clone(&target),
            authenticator,
            Arc::clone(&ctx.auth_limiter),
            ctx.auth_retry,
            ctx.session_max_age,
        )?;
        Ok(Self {
            key: target.key(),
            host: target.host()?,
            backoff: Backoff::new(&target.polling),
            target,
            recipients,
            fetcher,
            session,
            ctx,
            state: PollState::Idle,
        })
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn key(&self) -> &TargetKey {
        &self.key
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Deliver events left in the outbox by a previous run.
    pub async fn flush_pending(&mut self, abort: &CancellationToken) -> Result<usize> {
        let Some(record) = self.ctx.store.load_record(&self.key).await? else {
            return Ok(0);
        };
        if record.pending.is_empty() {
            return Ok(0);
        }

        let count = record.pending.len();
        log::info!(
            "[{}] delivering {} event(s) left from the previous run",
            self.target.name,
            count
        );
        let report = self.ctx.notifier.notify_all(record.pending, abort).await;
        self.ctx
            .store
            .commit(&self.key, &record.snapshot, &report.pending)
            .await?;
        Ok(count - report.pending.len())
    }

    /// Run one full cycle.
    pub async fn run_cycle(&mut self, abort: &CancellationToken) -> CycleOutcome {
        self.state = PollState::Polling;
        match self.poll(abort).await {
            Ok(summary) => CycleOutcome::Completed(summary),
            Err(AppError::Cancelled) => CycleOutcome::Cancelled,
            Err(e) => CycleOutcome::Failed(e),
        }
    }

    async fn poll(&mut self, abort: &CancellationToken) -> Result<CycleSummary> {
        let current = self.fetch(abort).await?;
        let record = self.ctx.store.load_record(&self.key).await?;
        let (previous, carried) = match record {
            Some(r) => (Some(r.snapshot), r.pending),
            None => (None, Vec::new()),
        };

        let delta = diff(previous.as_ref(), &current);
        let mut events = carried;
        events.extend(self.events_for(&delta));

        // Nothing is sent unless the new baseline and its events are stored.
        self.ctx.store.commit(&self.key, &current, &events).await?;

        let mut summary = CycleSummary {
            slots: current.len(),
            baseline: delta.baseline,
            appeared: delta.appeared.len(),
            disappeared: delta.disappeared.len(),
            ..CycleSummary::default()
        };
        if events.is_empty() {
            return Ok(summary);
        }

        let report = self.ctx.notifier.notify_all(events, abort).await;
        self.ctx
            .store
            .commit(&self.key, &current, &report.pending)
            .await?;

        summary.sent = report.sent;
        summary.failed = report.failed;
        summary.pending = report.pending.len();
        Ok(summary)
    }

    fn events_for(&self, delta: &SlotDiff) -> Vec<NotificationEvent> {
        let label = self.target.describe();
        let mut changes: Vec<_> = delta
            .appeared
            .iter()
            .map(|slot| (slot, SlotChange::Appeared))
            .collect();
        if self.ctx.notify_disappeared {
            changes.extend(delta.disappeared.iter().map(|s| (s, SlotChange::Disappeared)));
        }

        changes
            .into_iter()
            .flat_map(|(slot, change)| {
                self.recipients.iter().map(move |recipient| (slot, change, recipient))
            })
            .map(|(slot, change, recipient)| {
                NotificationEvent::new(
                    self.key.clone(),
                    label.clone(),
                    slot.clone(),
                    change,
                    recipient.clone(),
                )
            })
            .collect()
    }

    /// Session then fetch, retrying transient failures within the cycle.
    async fn fetch(&mut self, abort: &CancellationToken) -> Result<Snapshot> {
        let retry = self.ctx.fetch_retry;
        let mut attempt = 1;
        loop {
            let session = tokio::select! {
                session = self.session.acquire() => session?,
                _ = abort.cancelled() => return Err(AppError::Cancelled),
            };
            tokio::select! {
                _ = self.ctx.fetch_limiter.acquire(&self.host) => {}
                _ = abort.cancelled() => return Err(AppError::Cancelled),
            }
            let result = tokio::select! {
                result = self.fetcher.fetch(&self.target, &session) => result,
                _ = abort.cancelled() => return Err(AppError::Cancelled),
            };

            match result {
                Ok(snapshot) => return Ok(snapshot),
                Err(e @ AppError::Blocked { .. }) => {
                    self.session.invalidate(SessionHealth::Blocked, &e.to_string());
                    return Err(e);
                }
                Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                    log::warn!(
                        "[{}] fetch attempt {}/{} failed: {}",
                        self.target.name,
                        attempt,
                        retry.max_attempts,
                        e
                    );
                    tokio::select! {
                        _ = sleep(retry.delay_after(attempt)) => {}
                        _ = abort.cancelled() => return Err(AppError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Apply an outcome to the backoff and return the cooling wait.
    pub fn settle(&mut self, outcome: &CycleOutcome, cycle_started: Instant) -> Duration {
        self.state = outcome.next_state();
        match outcome {
            CycleOutcome::Completed(summary) => {
                let was_backing_off = self.backoff.is_backing_off();
                self.backoff.record_clean();
                if was_backing_off && !self.backoff.is_backing_off() {
                    log::info!("[{}] back to the base interval", self.target.name);
                }
                log::info!(
                    "[{}] key={} slots={} appeared={} disappeared={} sent={} failed={} pending={}{}",
                    self.target.name,
                    self.key,
                    summary.slots,
                    summary.appeared,
                    summary.disappeared,
                    summary.sent,
                    summary.failed,
                    summary.pending,
                    if summary.baseline { " (baseline)" } else { "" }
                );
                self.target
                    .polling
                    .min_spacing()
                    .saturating_sub(cycle_started.elapsed())
            }
            CycleOutcome::Failed(e) => {
                if self.state == PollState::Backoff {
                    let interval = self.backoff.escalate();
                    log::warn!(
                        "[{}] key={} kind={} backing off to {:?}: {}",
                        self.target.name,
                        self.key,
                        e.kind(),
                        interval,
                        e
                    );
                } else {
                    log::error!(
                        "[{}] key={} kind={} cycle failed: {}",
                        self.target.name,
                        self.key,
                        e.kind(),
                        e
                    );
                }
                Duration::ZERO
            }
            CycleOutcome::Cancelled => Duration::ZERO,
        }
    }

    /// Wait before the next cycle, including jitter.
    pub fn idle_wait(&self) -> Duration {
        jittered(self.backoff.current(), self.target.polling.jitter())
    }

    /// Poll until `shutdown` fires.
    ///
    /// `abort` cancels in-flight network calls; store writes always finish.
    pub async fn run(mut self, shutdown: CancellationToken, abort: CancellationToken) {
        log::info!(
            "[{}] monitoring {} (key {})",
            self.target.name,
            self.target.describe(),
            self.key
        );

        if let Err(e) = self.flush_pending(&abort).await {
            log::error!(
                "[{}] key={} kind={} could not flush outbox: {}",
                self.target.name,
                self.key,
                e.kind(),
                e
            );
        }

        while !shutdown.is_cancelled() {
            let started = Instant::now();
            let outcome = self.run_cycle(&abort).await;
            if matches!(outcome, CycleOutcome::Cancelled) {
                break;
            }

            let cooling = self.settle(&outcome, started);
            if !cooling.is_zero() {
                tokio::select! {
                    _ = sleep(cooling) => {}
                    _ = shutdown.cancelled() => break,
                }
                self.state = PollState::Idle;
            }

            tokio::select! {
                _ = sleep(self.idle_wait()) => {}
                _ = shutdown.cancelled() => break,
            }
            self.state = PollState::Idle;
        }

        log::info!("[{}] stopped", self.target.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SessionCredentials, SessionHandle, Slot};
    use crate::services::{AnonymousAuthenticator, Channel};
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a scripted sequence of fetch results.
    struct Scripted(Mutex<VecDeque<Result<Snapshot>>>);

    #[async_trait]
    impl Fetcher for Scripted {
        async fn fetch(&self, _target: &Target, _session: &SessionHandle) -> Result<Snapshot> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Snapshot::new([])))
        }
    }

    struct Sink(Mutex<Vec<String>>);

    #[async_trait]
    impl Channel for Sink {
        fn name(&self) -> &str {
            "ops"
        }

        async fn send(&self, _event: &NotificationEvent, text: &str) -> Result<()> {
            self.0.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    /// Counts authentications.
    struct Counting(Mutex<u32>);

    #[async_trait]
    impl Authenticator for Counting {
        async fn authenticate(&self, _target: &Target) -> Result<SessionCredentials> {
            *self.0.lock().unwrap() += 1;
            Ok(SessionCredentials::default())
        }
    }

    /// Rejects every login and counts the attempts.
    struct Refusing(Mutex<u32>);

    #[async_trait]
    impl Authenticator for Refusing {
        async fn authenticate(&self, target: &Target) -> Result<SessionCredentials> {
            *self.0.lock().unwrap() += 1;
            Err(AppError::blocked(&target.name, "login refused"))
        }
    }

    fn slot(day: u32) -> Slot {
        Slot::new(NaiveDate::from_ymd_opt(2026, 3, day).unwrap(), None, "Madrid")
    }

    fn target() -> Target {
        toml::from_str(
            r#"
            name = "madrid"
            endpoint = "https://citas.example.es/slots"
            [layout]
            kind = "json"
            [polling]
            interval_secs = 60
            jitter_secs = 0
            backoff_factor = 2.0
            backoff_ceiling_secs = 600
            decay_after = 2
            min_spacing_ms = 0
            "#,
        )
        .unwrap()
    }

    fn context(store: Arc<MemoryStorage>, sink: Arc<Sink>) -> WorkerContext {
        WorkerContext {
            store,
            notifier: Arc::new(Notifier::new(
                [sink as Arc<dyn Channel>],
                RetryPolicy::new(2, 10, 10),
                "{change} {date}",
            )),
            fetch_limiter: Arc::new(HostRateLimiter::new(Duration::ZERO)),
            auth_limiter: Arc::new(HostRateLimiter::new(Duration::ZERO)),
            fetch_retry: RetryPolicy::new(3, 10, 100),
            auth_retry: RetryPolicy::new(2, 10, 100),
            session_max_age: Duration::from_secs(900),
            notify_disappeared: false,
        }
    }

    fn worker(
        script: Vec<Result<Snapshot>>,
        store: Arc<MemoryStorage>,
        sink: Arc<Sink>,
    ) -> TargetWorker {
        TargetWorker::new(
            target(),
            vec![Recipient {
                channel: "ops".into(),
                address: "42".into(),
            }],
            Arc::new(Scripted(Mutex::new(script.into()))),
            Arc::new(AnonymousAuthenticator),
            context(store, sink),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_baseline_then_changes() {
        let store = Arc::new(MemoryStorage::new());
        let sink = Arc::new(Sink(Mutex::new(Vec::new())));
        let mut w = worker(
            vec![
                Ok(Snapshot::new([slot(1), slot(2)])),
                Ok(Snapshot::new([slot(2), slot(3)])),
            ],
            Arc::clone(&store),
            Arc::clone(&sink),
        );
        let abort = CancellationToken::new();

        let CycleOutcome::Completed(first) = w.run_cycle(&abort).await else {
            panic!("first cycle failed");
        };
        assert!(first.baseline);
        assert!(sink.0.lock().unwrap().is_empty());

        let CycleOutcome::Completed(second) = w.run_cycle(&abort).await else {
            panic!("second cycle failed");
        };
        assert_eq!((second.appeared, second.disappeared, second.sent), (1, 1, 1));
        assert_eq!(sink.0.lock().unwrap().as_slice(), ["new slot 2026-03-03"]);

        let stored = store.load(w.key()).await.unwrap().unwrap();
        assert_eq!(stored.slots, Snapshot::new([slot(2), slot(3)]).slots);
        assert!(store.pending(w.key()).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retry_within_cycle() {
        let store = Arc::new(MemoryStorage::new());
        let sink = Arc::new(Sink(Mutex::new(Vec::new())));
        let mut w = worker(
            vec![
                Err(AppError::transient("madrid", "timeout")),
                Err(AppError::transient("madrid", "502")),
                Ok(Snapshot::new([slot(1)])),
            ],
            store,
            sink,
        );
        let outcome = w.run_cycle(&CancellationToken::new()).await;
        assert!(matches!(outcome, CycleOutcome::Completed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_escalates_and_reauthenticates() {
        let store = Arc::new(MemoryStorage::new());
        let sink = Arc::new(Sink(Mutex::new(Vec::new())));
        let auth = Arc::new(Counting(Mutex::new(0)));
        let mut w = TargetWorker::new(
            target(),
            Vec::new(),
            Arc::new(Scripted(Mutex::new(
                vec![
                    Err(AppError::blocked("madrid", "HTTP 429")),
                    Ok(Snapshot::new([slot(1)])),
                ]
                .into(),
            ))),
            auth.clone(),
            context(store, sink),
        )
        .unwrap();
        let abort = CancellationToken::new();

        let started = Instant::now();
        let outcome = w.run_cycle(&abort).await;
        w.settle(&outcome, started);
        assert_eq!(w.state(), PollState::Backoff);
        assert_eq!(w.backoff().current(), Duration::from_secs(120));

        let started = Instant::now();
        let outcome = w.run_cycle(&abort).await;
        w.settle(&outcome, started);
        assert_eq!(w.state(), PollState::Cooling);
        assert_eq!(*auth.0.lock().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_exhaustion_backs_off_and_keeps_polling() {
        let store = Arc::new(MemoryStorage::new());
        let sink = Arc::new(Sink(Mutex::new(Vec::new())));
        let auth = Arc::new(Refusing(Mutex::new(0)));
        let mut w = TargetWorker::new(
            target(),
            Vec::new(),
            Arc::new(Scripted(Mutex::new(VecDeque::new()))),
            auth.clone(),
            context(Arc::clone(&store), Arc::clone(&sink)),
        )
        .unwrap();
        let abort = CancellationToken::new();

        let started = Instant::now();
        let outcome = w.run_cycle(&abort).await;
        assert!(matches!(
            outcome,
            CycleOutcome::Failed(AppError::AuthExhausted { attempts: 2, .. })
        ));
        w.settle(&outcome, started);
        assert_eq!(w.state(), PollState::Backoff);
        assert_eq!(w.backoff().current(), Duration::from_secs(120));
        assert_eq!(*auth.0.lock().unwrap(), 2);

        let started = Instant::now();
        let outcome = w.run_cycle(&abort).await;
        w.settle(&outcome, started);
        assert_eq!(w.state(), PollState::Backoff);
        assert_eq!(w.backoff().current(), Duration::from_secs(240));
        assert!(store.load(w.key()).await.unwrap().is_none());

        // The running worker keeps retrying after each backoff wait.
        let attempts_before = *auth.0.lock().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(w.run(shutdown.clone(), CancellationToken::new()));
        tokio::time::sleep(Duration::from_secs(500)).await;
        shutdown.cancel();
        handle.await.unwrap();
        assert!(*auth.0.lock().unwrap() >= attempts_before + 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parse_error_leaves_backoff_and_baseline() {
        let store = Arc::new(MemoryStorage::new());
        let sink = Arc::new(Sink(Mutex::new(Vec::new())));
        let mut w = worker(
            vec![
                Ok(Snapshot::new([slot(1)])),
                Err(AppError::parse("madrid", "layout changed")),
            ],
            Arc::clone(&store),
            sink,
        );
        let abort = CancellationToken::new();
        w.run_cycle(&abort).await;

        let started = Instant::now();
        let outcome = w.run_cycle(&abort).await;
        w.settle(&outcome, started);
        assert_eq!(w.state(), PollState::Idle);
        assert_eq!(w.backoff().current(), Duration::from_secs(60));
        let stored = store.load(w.key()).await.unwrap().unwrap();
        assert!(stored.contains(&slot(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooling_enforces_min_spacing() {
        let store = Arc::new(MemoryStorage::new());
        let sink = Arc::new(Sink(Mutex::new(Vec::new())));
        let mut t = target();
        t.polling.min_spacing_ms = 10_000;
        let mut w = TargetWorker::new(
            t,
            Vec::new(),
            Arc::new(Scripted(Mutex::new(VecDeque::new()))),
            Arc::new(AnonymousAuthenticator),
            context(store, sink),
        )
        .unwrap();

        let started = Instant::now();
        let outcome = w.run_cycle(&CancellationToken::new()).await;
        tokio::time::advance(Duration::from_secs(3)).await;
        let cooling = w.settle(&outcome, started);
        assert_eq!(w.state(), PollState::Cooling);
        assert_eq!(cooling, Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(MemoryStorage::new());
        let sink = Arc::new(Sink(Mutex::new(Vec::new())));
        let w = worker(vec![Ok(Snapshot::new([slot(1)]))], Arc::clone(&store), sink);
        let key = w.key().clone();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(w.run(shutdown.clone(), CancellationToken::new()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        handle.await.unwrap();
        assert!(store.load(&key).await.unwrap().is_some());
    }
}
