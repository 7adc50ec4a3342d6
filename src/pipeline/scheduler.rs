// src/pipeline/scheduler.rs

//! Scheduler: wires collaborators from configuration and runs one worker per target.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::models::{Config, TargetKey};
use crate::pipeline::backoff::RetryPolicy;
use crate::pipeline::poller::{CycleOutcome, TargetWorker, WorkerContext};
use crate::pipeline::rate_limit::HostRateLimiter;
use crate::services::{
    BlockDetector, Notifier, build_authenticator, build_channels, build_fetcher,
};
use crate::storage::{self, SnapshotStore, StoredRecord};
use crate::utils::http::create_async_client;

/// Owns every target worker.
pub struct Scheduler {
    workers: Vec<TargetWorker>,
    grace: Duration,
}

impl Scheduler {
    pub fn new(workers: Vec<TargetWorker>, grace: Duration) -> Self {
        Self { workers, grace }
    }

    /// Build from configuration with the configured store backend.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::with_store(config, storage::open(config))
    }

    /// Build from configuration with an explicit store.
    pub fn with_store(config: &Config, store: Arc<dyn SnapshotStore>) -> Result<Self> {
        config.validate()?;

        let client = create_async_client(&config.bot)?;
        let detector = Arc::new(BlockDetector::new(&config.fetch.block_markers)?);
        let channels = build_channels(&config.channels, &client)?;
        let delivery = &config.delivery;
        let notifier = Arc::new(Notifier::new(
            channels,
            RetryPolicy::new(delivery.max_attempts, delivery.base_delay_ms, delivery.max_delay_ms),
            delivery.template.clone(),
        ));

        let ctx = WorkerContext {
            store,
            notifier,
            fetch_limiter: Arc::new(HostRateLimiter::new(config.rate_limit.per_host_interval())),
            auth_limiter: Arc::new(HostRateLimiter::new(config.rate_limit.auth_interval())),
            fetch_retry: RetryPolicy::new(
                config.fetch.max_attempts,
                config.fetch.base_delay_ms,
                config.fetch.max_delay_ms,
            ),
            auth_retry: RetryPolicy::new(
                config.auth.max_attempts,
                config.auth.base_delay_ms,
                config.auth.max_delay_ms,
            ),
            session_max_age: Duration::from_secs(config.auth.session_max_age_secs),
            notify_disappeared: delivery.notify_disappeared,
        };

        let workers = config
            .targets
            .iter()
            .map(|target| {
                TargetWorker::new(
                    target.clone(),
                    config.recipients_for(&target.name),
                    build_fetcher(target, client.clone(), Arc::clone(&detector)),
                    build_authenticator(target, client.clone(), Arc::clone(&detector)),
                    ctx.clone(),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(workers, config.shutdown.grace()))
    }

    pub fn workers(&self) -> &[TargetWorker] {
        &self.workers
    }

    /// Run every worker until `shutdown` fires.
    ///
    /// After shutdown, in-flight network calls get the grace period to finish
    /// before they are cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let abort = CancellationToken::new();
        log::info!("starting {} worker(s)", self.workers.len());

        let handles: Vec<_> = self
            .workers
            .into_iter()
            .map(|worker| tokio::spawn(worker.run(shutdown.clone(), abort.clone())))
            .collect();

        let grace = self.grace;
        let timer = {
            let shutdown = shutdown.clone();
            let abort = abort.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                log::info!("shutdown requested, waiting up to {grace:?} for in-flight work");
                sleep(grace).await;
                log::warn!("grace period elapsed, cancelling in-flight requests");
                abort.cancel();
            })
        };

        for result in join_all(handles).await {
            if let Err(e) = result {
                log::error!("worker task ended abnormally: {e}");
            }
        }
        timer.abort();
        log::info!("all workers stopped");
    }

    /// Run a single cycle for every target concurrently.
    pub async fn run_once(&mut self, abort: &CancellationToken) -> Vec<(String, CycleOutcome)> {
        let cycles = self.workers.iter_mut().map(|worker| async move {
            if let Err(e) = worker.flush_pending(abort).await {
                log::error!(
                    "[{}] kind={} could not flush outbox: {}",
                    worker.target().name,
                    e.kind(),
                    e
                );
            }
            let started = Instant::now();
            let outcome = worker.run_cycle(abort).await;
            worker.settle(&outcome, started);
            (worker.target().name.clone(), outcome)
        });
        join_all(cycles).await
    }
}

/// Stored state of one configured target.
#[derive(Debug)]
pub struct TargetStatus {
    pub name: String,
    pub key: TargetKey,
    pub record: Option<StoredRecord>,
}

/// Read the stored record of every configured target.
pub async fn collect_status(config: &Config, store: &dyn SnapshotStore) -> Result<Vec<TargetStatus>> {
    let mut statuses = Vec::with_capacity(config.targets.len());
    for target in &config.targets {
        let key = target.key();
        let record = store.load_record(&key).await?;
        statuses.push(TargetStatus {
            name: target.name.clone(),
            key,
            record,
        });
    }
    Ok(statuses)
}

/// Stored keys that no configured target maps to, e.g. after a target's query changed.
pub async fn orphaned_keys(config: &Config, store: &dyn SnapshotStore) -> Result<Vec<TargetKey>> {
    let configured: HashSet<TargetKey> = config.targets.iter().map(|t| t.key()).collect();
    Ok(store
        .keys()
        .await?
        .into_iter()
        .filter(|k| !configured.contains(k))
        .collect())
}
