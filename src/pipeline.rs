//! Stage wiring: collectors -> dedup -> batcher -> dispatcher.
//!
//! Long-running mode spawns one task per stage connected by bounded channels
//! and stops through a `watch` flag. One-shot mode ([`run_cycle`]) runs the same
//! stages in sequence and returns a report.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::batch::{Batch, TopicalBatcher};
use crate::clock::{Clock, SharedClock};
use crate::dedup::{DedupOutcome, Deduplicator, FingerprintStore, StoreError, TaggedItem};
use crate::dispatch::{DispatchError, DispatchMonitor, DispatchOutcome, Dispatcher};
use crate::ingest::collect_once;
use crate::ingest::scheduler::spawn_poller;
use crate::ingest::types::{RawItem, SourceProvider};

/// Retries for a store-unavailable item in one-shot mode before it is skipped.
const ONE_SHOT_STORE_ATTEMPTS: u32 = 3;

pub struct PipelineSettings {
    pub tick: Duration,
    pub retention: chrono::Duration,
    pub purge_interval: Duration,
    /// First pause after a store-unavailable error; doubles up to 30s.
    pub store_retry: Duration,
    pub channel_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(5),
            retention: chrono::Duration::days(30),
            purge_interval: Duration::from_secs(3_600),
            store_retry: Duration::from_millis(500),
            channel_capacity: 1024,
        }
    }
}

/// A collector and how often to poll it.
pub struct PolledSource {
    pub provider: Arc<dyn SourceProvider>,
    pub interval: Duration,
}

pub struct PipelineParts {
    pub sources: Vec<PolledSource>,
    pub dedup: Deduplicator,
    pub batcher: TopicalBatcher,
    pub dispatcher: Dispatcher,
    pub clock: SharedClock,
    pub settings: PipelineSettings,
}

pub struct PipelineHandle {
    shutdown: Arc<watch::Sender<bool>>,
    pollers: Vec<JoinHandle<()>>,
    dedup: JoinHandle<Result<(), StoreError>>,
    dispatch: JoinHandle<()>,
    purge: JoinHandle<()>,
    monitor: DispatchMonitor,
}

impl PipelineHandle {
    pub fn spawn(parts: PipelineParts) -> Self {
        let PipelineParts {
            sources,
            dedup,
            batcher,
            dispatcher,
            clock,
            settings,
        } = parts;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown = Arc::new(shutdown_tx);
        let (raw_tx, raw_rx) = mpsc::channel::<RawItem>(settings.channel_capacity.max(1));
        let (tagged_tx, tagged_rx) = mpsc::channel::<TaggedItem>(settings.channel_capacity.max(1));

        let pollers = sources
            .into_iter()
            .map(|s| spawn_poller(s.provider, s.interval, raw_tx.clone(), shutdown_rx.clone()))
            .collect::<Vec<_>>();
        // Pollers hold the only senders; the dedup stage ends when they are gone.
        drop(raw_tx);

        let monitor = dispatcher.monitor();
        let dedup_task = tokio::spawn(dedup_stage(
            dedup.clone(),
            raw_rx,
            tagged_tx,
            clock.clone(),
            settings.store_retry,
            shutdown.clone(),
        ));
        let dispatch_task = tokio::spawn(dispatch_stage(
            batcher,
            dispatcher,
            tagged_rx,
            clock.clone(),
            settings.tick,
        ));
        let purge_task = tokio::spawn(purge_loop(
            dedup,
            clock,
            settings.retention,
            settings.purge_interval,
            shutdown_rx,
        ));

        tracing::info!(pollers = pollers.len(), "pipeline started");
        Self {
            shutdown,
            pollers,
            dedup: dedup_task,
            dispatch: dispatch_task,
            purge: purge_task,
            monitor,
        }
    }

    pub fn monitor(&self) -> DispatchMonitor {
        self.monitor.clone()
    }

    /// Subscribe to the stop flag; it flips on `shutdown` or on store corruption.
    pub fn stopped(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Run until `signal` resolves or the pipeline stops on its own (store
    /// corruption), then shut down.
    pub async fn run_until<F>(self, signal: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let mut stopped = self.stopped();
        let stopped_itself = async move {
            while !*stopped.borrow_and_update() {
                if stopped.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::select! {
            _ = signal => tracing::info!("shutdown requested, draining pipeline"),
            _ = stopped_itself => {}
        }
        self.shutdown().await
    }

    /// Stop collectors, let in-flight items flow through, drain open batches.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.shutdown.send_replace(true);
        for p in self.pollers {
            if let Err(e) = p.await {
                tracing::warn!(error = ?e, "poller task failed");
            }
        }
        let dedup = self.dedup.await;
        if let Err(e) = self.dispatch.await {
            tracing::warn!(error = ?e, "dispatch task failed");
        }
        if let Err(e) = self.purge.await {
            tracing::warn!(error = ?e, "purge task failed");
        }
        match dedup {
            Ok(Ok(())) => {
                tracing::info!("pipeline stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(anyhow::Error::new(e).context("dedup stage stopped")),
            Err(e) => Err(anyhow::Error::new(e).context("dedup task panicked")),
        }
    }
}

/// Resolves on SIGINT (Ctrl+C) or, on unix, SIGTERM.
///
/// A handler that cannot be installed never fires; the other one still does.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("received SIGINT (Ctrl+C)"),
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                tracing::info!("received SIGTERM");
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn dedup_stage(
    dedup: Deduplicator,
    mut raw_rx: mpsc::Receiver<RawItem>,
    tagged_tx: mpsc::Sender<TaggedItem>,
    clock: SharedClock,
    store_retry: Duration,
    shutdown: Arc<watch::Sender<bool>>,
) -> Result<(), StoreError> {
    while let Some(item) = raw_rx.recv().await {
        let mut pause = store_retry;
        let outcome = loop {
            match dedup.process(item.clone()).await {
                Ok(o) => break o,
                Err(e) if e.is_transient() => {
                    if *shutdown.borrow() {
                        tracing::warn!(error = %e, "store unavailable during shutdown, item dropped");
                        break DedupOutcome::Duplicate;
                    }
                    tracing::warn!(
                        error = %e,
                        pause_ms = pause.as_millis() as u64,
                        "fingerprint store unavailable, pausing dedup stage"
                    );
                    clock.sleep(pause).await;
                    pause = (pause * 2).min(Duration::from_secs(30));
                }
                Err(e) => {
                    tracing::error!(error = %e, "fingerprint store failed, stopping pipeline");
                    shutdown.send_replace(true);
                    return Err(e);
                }
            }
        };

        if let DedupOutcome::Accepted(tagged) = outcome {
            if tagged_tx.send(tagged).await.is_err() {
                tracing::debug!("tagged channel closed, dedup stage exiting");
                break;
            }
        }
    }
    tracing::debug!("dedup stage stopped");
    Ok(())
}

async fn dispatch_stage(
    mut batcher: TopicalBatcher,
    mut dispatcher: Dispatcher,
    mut tagged_rx: mpsc::Receiver<TaggedItem>,
    clock: SharedClock,
    tick: Duration,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            next = tagged_rx.recv() => {
                let Some(item) = next else { break };
                if let Some(batch) = batcher.offer(item, clock.now()) {
                    submit_and_log(&mut dispatcher, batch).await;
                }
            }
            _ = ticker.tick() => {
                for batch in batcher.tick(clock.now()) {
                    submit_and_log(&mut dispatcher, batch).await;
                }
                for (batch_id, res) in dispatcher.pump().await {
                    log_result(batch_id, &res);
                }
            }
        }
    }

    for batch in batcher.drain(clock.now()) {
        submit_and_log(&mut dispatcher, batch).await;
    }
    let discarded = dispatcher.shutdown().await;
    tracing::info!(discarded, "dispatch stage stopped");
}

async fn purge_loop(
    dedup: Deduplicator,
    clock: SharedClock,
    retention: chrono::Duration,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                purge(&dedup, clock.as_ref(), retention).await;
            }
        }
    }
}

async fn purge(dedup: &Deduplicator, clock: &dyn Clock, retention: chrono::Duration) -> u64 {
    let cutoff = clock.now() - retention;
    match dedup.store().purge_older_than(cutoff).await {
        Ok(n) => {
            if n > 0 {
                tracing::info!(purged = n, cutoff = %cutoff, "old fingerprints purged");
            }
            n
        }
        Err(e) => {
            tracing::warn!(error = %e, "fingerprint purge failed");
            0
        }
    }
}

async fn submit_and_log(dispatcher: &mut Dispatcher, batch: Batch) {
    let id = batch.id;
    let res = dispatcher.submit(batch).await;
    log_result(id, &res);
}

fn log_result(batch_id: u64, res: &Result<DispatchOutcome, DispatchError>) {
    match res {
        Ok(DispatchOutcome::Delivered { parts }) => {
            tracing::info!(batch_id, parts, "digest delivered")
        }
        Ok(DispatchOutcome::Queued) => tracing::debug!(batch_id, "batch queued"),
        Ok(DispatchOutcome::Skipped) => tracing::info!(batch_id, "batch skipped by summarizer"),
        // Drops are reported on the operator channel by the dispatcher.
        Err(e) => tracing::debug!(batch_id, error = %e, "batch dropped"),
    }
}

/// Totals for one [`run_cycle`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub collected: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub unidentifiable: usize,
    pub store_errors: usize,
    pub batches: usize,
    pub delivered: usize,
    pub skipped: usize,
    pub dropped: usize,
    pub discarded: usize,
    pub purged: u64,
}

impl CycleReport {
    fn tally(&mut self, res: &Result<DispatchOutcome, DispatchError>) {
        match res {
            Ok(DispatchOutcome::Delivered { .. }) => self.delivered += 1,
            Ok(DispatchOutcome::Skipped) => self.skipped += 1,
            Ok(DispatchOutcome::Queued) => {}
            Err(_) => self.dropped += 1,
        }
    }
}

/// One collection cycle: collect, dedup, batch everything, dispatch, purge.
///
/// Waits for rate-limit capacity until the dispatch queue is empty. Queue
/// entries expire after the configured wait, so the loop ends. Only store
/// corruption is returned as an error.
pub async fn run_cycle(
    providers: &[Arc<dyn SourceProvider>],
    dedup: &Deduplicator,
    batcher: &mut TopicalBatcher,
    dispatcher: &mut Dispatcher,
    clock: &dyn Clock,
    retention: chrono::Duration,
) -> Result<CycleReport, StoreError> {
    let mut report = CycleReport::default();
    let items = collect_once(providers).await;
    report.collected = items.len();

    let mut sealed: Vec<Batch> = Vec::new();
    for item in items {
        let mut attempt = 1u32;
        let outcome = loop {
            match dedup.process(item.clone()).await {
                Ok(o) => break Some(o),
                Err(e) if e.is_transient() && attempt < ONE_SHOT_STORE_ATTEMPTS => {
                    tracing::warn!(error = %e, attempt, "fingerprint store unavailable, retrying item");
                    clock.sleep(Duration::from_millis(250u64 << (attempt - 1))).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, "fingerprint store unavailable, item skipped");
                    report.store_errors += 1;
                    break None;
                }
                Err(e) => return Err(e),
            }
        };
        match outcome {
            Some(DedupOutcome::Accepted(tagged)) => {
                report.accepted += 1;
                sealed.extend(batcher.offer(tagged, clock.now()));
            }
            Some(DedupOutcome::Duplicate) => report.duplicates += 1,
            Some(DedupOutcome::Unidentifiable) => report.unidentifiable += 1,
            None => {}
        }
    }
    sealed.extend(batcher.drain(clock.now()));
    report.batches = sealed.len();

    for batch in sealed {
        let id = batch.id;
        let res = dispatcher.submit(batch).await;
        log_result(id, &res);
        report.tally(&res);
    }

    while dispatcher.queue_len() > 0 {
        if let Some(wait) = dispatcher.next_ready_in() {
            if !wait.is_zero() {
                tracing::debug!(wait_ms = wait.as_millis() as u64, "waiting for rate-limit capacity");
                clock.sleep(wait).await;
            }
        }
        for (id, res) in dispatcher.pump().await {
            log_result(id, &res);
            report.tally(&res);
        }
    }
    report.discarded = dispatcher.shutdown().await;

    report.purged = purge(dedup, clock, retention).await;
    tracing::info!(
        collected = report.collected,
        accepted = report.accepted,
        duplicates = report.duplicates,
        batches = report.batches,
        delivered = report.delivered,
        dropped = report.dropped,
        "cycle complete"
    );
    Ok(report)
}
