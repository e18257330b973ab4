//! Rate-limited dispatcher: the only place where money is spent.
//!
//! A sealed batch is summarized once and delivered. Three token buckets bound
//! summarizer calls per minute, summarizer tokens per day and delivery
//! messages per second; a [`DailyBudget`] bounds USD spend per UTC day.
//! Batches that cannot run now wait in a bounded FIFO queue and are expired
//! after `max_queue_wait`. Every drop is reported on the operator channel.

pub mod bucket;
pub mod budget;
pub mod failed;

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use serde::Serialize;

use crate::batch::Batch;
use crate::clock::{Clock, SharedClock};
use crate::dedup::{Category, TaggedItem};
use crate::notify::operator::{OperatorSink, SharedOperatorSink};
use crate::notify::{
    format_digest, split_message, Delivery, DeliveryError, OperatorEvent, SharedDelivery, SourceLink,
};
use crate::summarize::{
    estimate_tokens, is_skip, pricing, SharedSummarizer, SummarizeError, Summarizer, SummaryItem,
    TokenUsage,
};

pub use bucket::TokenBucket;
pub use budget::DailyBudget;
pub use failed::{FailedDelivery, FailedLog};

/// Pause applied when the provider rate-limits without saying for how long.
const DEFAULT_RATE_LIMIT_PAUSE: Duration = Duration::from_secs(60);

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "dispatch_batches_total",
            "Batches leaving the dispatcher, by outcome."
        );
        describe_counter!(
            "dispatch_summarizer_calls_total",
            "Summarizer calls, by result."
        );
        describe_counter!(
            "dispatch_tokens_total",
            "Tokens reported by the summarizer, by direction."
        );
        describe_counter!(
            "dispatch_messages_total",
            "Delivery attempts per message part, by result."
        );
        describe_gauge!("dispatch_queue_len", "Batches waiting for rate-limit capacity.");
        describe_gauge!("dispatch_spend_usd", "Summarizer spend for the current UTC day.");
    });
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub calls_per_minute: u32,
    /// 0 disables the daily token ceiling.
    pub tokens_per_day: u64,
    pub messages_per_second: u32,
    pub max_queue_len: usize,
    pub max_queue_wait: Duration,
    pub summarizer_max_attempts: u32,
    pub summarizer_backoff_ms: u64,
    pub delivery_max_attempts: u32,
    pub delivery_backoff_ms: u64,
    pub call_timeout: Duration,
    pub send_timeout: Duration,
    pub failed_log_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            calls_per_minute: 20,
            tokens_per_day: 500_000,
            messages_per_second: 1,
            max_queue_len: 64,
            max_queue_wait: Duration::from_secs(30 * 60),
            summarizer_max_attempts: 3,
            summarizer_backoff_ms: 500,
            delivery_max_attempts: 4,
            delivery_backoff_ms: 500,
            call_timeout: Duration::from_secs(60),
            send_timeout: Duration::from_secs(15),
            failed_log_capacity: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Delivered { parts: usize },
    /// Waiting for capacity; the result shows up in a later `pump`.
    Queued,
    /// The summarizer judged the batch not worth sending.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("daily budget exhausted")]
    BudgetExhausted,
    #[error("no delivery route for category {0}")]
    Unroutable(Category),
    #[error("dispatch queue full")]
    QueueFull,
    #[error("batch expired in the dispatch queue")]
    QueueTimeout,
    #[error("summarizer failed: {0}")]
    SummarizerFailed(#[source] SummarizeError),
    #[error("delivery failed after {parts_sent}/{parts_total} parts: {error}")]
    DeliveryFailed {
        parts_sent: usize,
        parts_total: usize,
        #[source]
        error: DeliveryError,
    },
}

impl DispatchError {
    fn outcome_label(&self) -> &'static str {
        match self {
            DispatchError::BudgetExhausted => "budget_exhausted",
            DispatchError::Unroutable(_) => "unroutable",
            DispatchError::QueueFull => "queue_full",
            DispatchError::QueueTimeout => "queue_timeout",
            DispatchError::SummarizerFailed(_) => "summarizer_failed",
            DispatchError::DeliveryFailed { .. } => "delivery_failed",
        }
    }
}

/// Running totals for the operator surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchStats {
    pub delivered: u64,
    pub skipped: u64,
    pub messages_sent: u64,
    pub dropped_budget: u64,
    pub dropped_queue_timeout: u64,
    pub dropped_queue_full: u64,
    pub dropped_unroutable: u64,
    pub summarizer_failed: u64,
    pub delivery_failed: u64,
    pub discarded_on_shutdown: u64,
    pub queue_len: usize,
    pub spent_usd: f64,
    pub ceiling_usd: Option<f64>,
}

/// Read-side handle on dispatcher state, shared with the HTTP layer.
#[derive(Debug, Clone)]
pub struct DispatchMonitor {
    stats: Arc<Mutex<DispatchStats>>,
    failed: Arc<Mutex<FailedLog>>,
}

impl DispatchMonitor {
    pub fn new(failed_log_capacity: usize) -> Self {
        Self {
            stats: Arc::new(Mutex::new(DispatchStats::default())),
            failed: Arc::new(Mutex::new(FailedLog::new(failed_log_capacity))),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats.lock().expect("dispatch stats poisoned").clone()
    }

    pub fn failed(&self, limit: usize) -> Vec<FailedDelivery> {
        self.failed
            .lock()
            .expect("failed log poisoned")
            .recent(limit)
    }

    pub fn failed_len(&self) -> usize {
        self.failed.lock().expect("failed log poisoned").len()
    }

    fn update(&self, f: impl FnOnce(&mut DispatchStats)) {
        f(&mut *self.stats.lock().expect("dispatch stats poisoned"));
    }

    fn push_failed(&self, entry: FailedDelivery) {
        self.failed.lock().expect("failed log poisoned").push(entry);
    }
}

struct Pending {
    batch: Batch,
    enqueued_at: DateTime<Utc>,
    estimate: u64,
}

enum Attempt {
    Finished(Result<DispatchOutcome, DispatchError>),
    /// Upstream asked us to slow down; the batch goes back to the queue front.
    Requeue(Pending),
}

/// Single owner; callers serialize access (`&mut self`).
pub struct Dispatcher {
    cfg: DispatcherConfig,
    summarizer: SharedSummarizer,
    delivery: SharedDelivery,
    budget: DailyBudget,
    clock: SharedClock,
    operator: SharedOperatorSink,
    calls: TokenBucket,
    tokens: Option<TokenBucket>,
    messages: TokenBucket,
    paused_until: Option<DateTime<Utc>>,
    queue: VecDeque<Pending>,
    monitor: DispatchMonitor,
}

impl Dispatcher {
    pub fn new(
        cfg: DispatcherConfig,
        summarizer: SharedSummarizer,
        delivery: SharedDelivery,
        budget: DailyBudget,
        clock: SharedClock,
        operator: SharedOperatorSink,
    ) -> Self {
        ensure_metrics_described();
        let now = clock.now();
        let tokens = (cfg.tokens_per_day > 0).then(|| TokenBucket::per_day(cfg.tokens_per_day, now));
        let monitor = DispatchMonitor::new(cfg.failed_log_capacity);
        let mut d = Self {
            calls: TokenBucket::per_minute(cfg.calls_per_minute.max(1), now),
            messages: TokenBucket::per_second(cfg.messages_per_second.max(1), now),
            tokens,
            cfg,
            summarizer,
            delivery,
            budget,
            clock,
            operator,
            paused_until: None,
            queue: VecDeque::new(),
            monitor,
        };
        d.publish_spend();
        d
    }

    pub fn monitor(&self) -> DispatchMonitor {
        self.monitor.clone()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn spent_today(&mut self) -> f64 {
        self.budget.spent(self.clock.now())
    }

    /// Summarize and deliver `batch` now, or queue it until capacity frees up.
    pub async fn submit(&mut self, batch: Batch) -> Result<DispatchOutcome, DispatchError> {
        let now = self.clock.now();
        let outcome = self.admit(batch, now).await;
        match &outcome {
            Ok(o) => tracing::debug!(outcome = ?o, "batch dispatched"),
            Err(e) => tracing::debug!(error = %e, "batch not dispatched"),
        }
        outcome
    }

    async fn admit(
        &mut self,
        batch: Batch,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        if self.budget.is_exhausted(now) {
            self.drop_for_budget(&batch, now).await;
            return Err(DispatchError::BudgetExhausted);
        }

        if !self.delivery.accepts(batch.category) {
            let err = DispatchError::Unroutable(batch.category);
            self.count_drop(&err);
            self.report(OperatorEvent::Unroutable {
                batch_id: batch.id,
                category: batch.category,
                items: batch.len(),
            })
            .await;
            return Err(err);
        }

        let pending = Pending {
            estimate: self.estimate(&batch),
            batch,
            enqueued_at: now,
        };

        if !self.queue.is_empty() || !self.has_capacity(pending.estimate, now) {
            return self.enqueue(pending).await;
        }

        match self.process(pending).await {
            Attempt::Finished(r) => r,
            Attempt::Requeue(p) => {
                self.queue.push_front(p);
                self.publish_queue();
                Ok(DispatchOutcome::Queued)
            }
        }
    }

    /// Expire stale entries, then run queued batches oldest-first while capacity allows.
    pub async fn pump(&mut self) -> Vec<(u64, Result<DispatchOutcome, DispatchError>)> {
        let mut out = Vec::new();
        let now = self.clock.now();

        self.expire(now, &mut out).await;

        if !self.queue.is_empty() && self.budget.is_exhausted(now) {
            while let Some(p) = self.queue.pop_front() {
                self.drop_for_budget(&p.batch, now).await;
                out.push((p.batch.id, Err(DispatchError::BudgetExhausted)));
            }
        }

        while let Some(front) = self.queue.front() {
            let estimate = front.estimate;
            let now = self.clock.now();
            if !self.has_capacity(estimate, now) {
                break;
            }
            let Some(p) = self.queue.pop_front() else {
                break;
            };
            if self.budget.is_exhausted(now) {
                self.drop_for_budget(&p.batch, now).await;
                out.push((p.batch.id, Err(DispatchError::BudgetExhausted)));
                continue;
            }
            let id = p.batch.id;
            match self.process(p).await {
                Attempt::Finished(r) => out.push((id, r)),
                Attempt::Requeue(p) => {
                    self.queue.push_front(p);
                    break;
                }
            }
        }

        self.publish_queue();
        out
    }

    /// How long until the queue front could run; `None` when the queue is empty.
    pub fn next_ready_in(&mut self) -> Option<Duration> {
        let estimate = self.queue.front()?.estimate;
        let now = self.clock.now();
        let mut wait = self.calls.time_until(1.0, now);
        if let Some(tokens) = self.tokens.as_mut() {
            wait = wait.max(tokens.time_until(estimate as f64, now));
        }
        if let Some(until) = self.paused_until.filter(|t| *t > now) {
            wait = wait.max((until - now).to_std().unwrap_or_default());
        }
        Some(wait)
    }

    /// Discard everything still queued. Returns the number of discarded batches.
    pub async fn shutdown(&mut self) -> usize {
        let batches = self.queue.len();
        if batches == 0 {
            return 0;
        }
        let items: usize = self.queue.iter().map(|p| p.batch.len()).sum();
        self.queue.clear();
        counter!("dispatch_batches_total", "outcome" => "discarded").increment(batches as u64);
        self.monitor
            .update(|s| s.discarded_on_shutdown += batches as u64);
        self.publish_queue();
        self.report(OperatorEvent::ShutdownDiscarded { batches, items })
            .await;
        batches
    }

    fn estimate(&self, batch: &Batch) -> u64 {
        let items: Vec<SummaryItem> = batch.items.iter().map(summary_item).collect();
        estimate_tokens(batch.category, &items, self.summarizer.max_output_tokens())
    }

    fn has_capacity(&mut self, estimate: u64, now: DateTime<Utc>) -> bool {
        if self.paused_until.is_some_and(|t| now < t) {
            return false;
        }
        self.calls.has(1.0, now)
            && self
                .tokens
                .as_mut()
                .map_or(true, |b| b.has(estimate as f64, now))
    }

    async fn enqueue(&mut self, pending: Pending) -> Result<DispatchOutcome, DispatchError> {
        if self.queue.len() >= self.cfg.max_queue_len {
            let err = DispatchError::QueueFull;
            self.count_drop(&err);
            self.report(OperatorEvent::QueueFull {
                batch_id: pending.batch.id,
                category: pending.batch.category,
                items: pending.batch.len(),
            })
            .await;
            return Err(err);
        }
        tracing::debug!(
            batch_id = pending.batch.id,
            category = %pending.batch.category,
            queue_len = self.queue.len() + 1,
            "batch queued for rate-limit capacity"
        );
        self.queue.push_back(pending);
        self.publish_queue();
        Ok(DispatchOutcome::Queued)
    }

    async fn expire(
        &mut self,
        now: DateTime<Utc>,
        out: &mut Vec<(u64, Result<DispatchOutcome, DispatchError>)>,
    ) {
        let max_wait = chrono::Duration::from_std(self.cfg.max_queue_wait)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let (expired, kept): (Vec<Pending>, Vec<Pending>) = self
            .queue
            .drain(..)
            .partition(|p| now - p.enqueued_at > max_wait);
        self.queue = kept.into();

        for p in expired {
            let err = DispatchError::QueueTimeout;
            self.count_drop(&err);
            self.report(OperatorEvent::QueueTimeout {
                batch_id: p.batch.id,
                category: p.batch.category,
                items: p.batch.len(),
                waited_secs: (now - p.enqueued_at).num_seconds(),
            })
            .await;
            out.push((p.batch.id, Err(err)));
        }
    }

    async fn process(&mut self, pending: Pending) -> Attempt {
        let category = pending.batch.category;
        let batch_id = pending.batch.id;
        let items: Vec<SummaryItem> = pending.batch.items.iter().map(summary_item).collect();

        let now = self.clock.now();
        self.calls.try_take(1.0, now);
        if let Some(tokens) = self.tokens.as_mut() {
            tokens.debit(pending.estimate as f64, now);
        }

        let mut attempt = 1u32;
        let response = loop {
            let res = match tokio::time::timeout(
                self.cfg.call_timeout,
                self.summarizer.summarize(category, &items),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => Err(SummarizeError::Timeout),
            };

            match res {
                Ok(r) => {
                    counter!("dispatch_summarizer_calls_total", "result" => "ok").increment(1);
                    break r;
                }
                Err(SummarizeError::RateLimited { retry_after }) => {
                    counter!("dispatch_summarizer_calls_total", "result" => "rate_limited")
                        .increment(1);
                    let now = self.clock.now();
                    let pause = retry_after.unwrap_or(DEFAULT_RATE_LIMIT_PAUSE);
                    self.calls.drain(now);
                    if let Some(tokens) = self.tokens.as_mut() {
                        tokens.credit(pending.estimate as f64, now);
                    }
                    self.paused_until = Some(
                        now + chrono::Duration::from_std(pause)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60)),
                    );
                    tracing::warn!(
                        batch_id,
                        category = %category,
                        pause_ms = pause.as_millis() as u64,
                        "summarizer rate limited, batch requeued"
                    );
                    return Attempt::Requeue(pending);
                }
                Err(e) if e.is_retryable() && attempt < self.cfg.summarizer_max_attempts => {
                    counter!("dispatch_summarizer_calls_total", "result" => "retry").increment(1);
                    let wait = backoff(self.cfg.summarizer_backoff_ms, attempt);
                    tracing::warn!(
                        error = %e,
                        batch_id,
                        attempt,
                        backoff_ms = wait.as_millis() as u64,
                        "summarizer call failed, retrying"
                    );
                    self.clock.sleep(wait).await;
                    self.wait_for_call_slot().await;
                    attempt += 1;
                }
                Err(e) => {
                    counter!("dispatch_summarizer_calls_total", "result" => "failed").increment(1);
                    let err = DispatchError::SummarizerFailed(e.clone());
                    self.count_drop(&err);
                    self.report(OperatorEvent::SummarizerFailed {
                        batch_id,
                        category,
                        items: items.len(),
                        error: e.to_string(),
                    })
                    .await;
                    return Attempt::Finished(Err(err));
                }
            }
        };

        let now = self.clock.now();
        self.reconcile_tokens(pending.estimate, &response.usage, now);
        let cost = pricing::cost_usd(self.summarizer.model(), &response.usage);
        self.budget.record(cost, now);
        self.publish_spend();
        tracing::info!(
            batch_id,
            category = %category,
            items = items.len(),
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            cost_usd = cost,
            "batch summarized"
        );

        if is_skip(&response.text) {
            counter!("dispatch_batches_total", "outcome" => "skipped").increment(1);
            self.monitor.update(|s| s.skipped += 1);
            tracing::info!(batch_id, category = %category, "summarizer skipped batch");
            return Attempt::Finished(Ok(DispatchOutcome::Skipped));
        }

        Attempt::Finished(self.deliver(&pending.batch, &response.text).await)
    }

    /// Send every part; a failing part is retried on its own, never re-summarized.
    async fn deliver(
        &mut self,
        batch: &Batch,
        summary: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        let message = format_digest(batch.category, summary, &source_links(batch));
        let parts = split_message(&message, self.delivery.max_message_chars());
        let total = parts.len();

        for (idx, part) in parts.iter().enumerate() {
            let mut attempt = 1u32;
            loop {
                self.wait_for_message_slot().await;
                let res = match tokio::time::timeout(
                    self.cfg.send_timeout,
                    self.delivery.send(batch.category, part),
                )
                .await
                {
                    Ok(r) => r,
                    Err(_) => Err(DeliveryError::Timeout),
                };

                match res {
                    Ok(ack) => {
                        counter!("dispatch_messages_total", "result" => "ok").increment(1);
                        self.monitor.update(|s| s.messages_sent += 1);
                        tracing::debug!(
                            batch_id = batch.id,
                            part = idx + 1,
                            total,
                            message_id = ?ack.message_id,
                            "digest part delivered"
                        );
                        break;
                    }
                    Err(e) if e.is_retryable() && attempt < self.cfg.delivery_max_attempts => {
                        counter!("dispatch_messages_total", "result" => "retry").increment(1);
                        let mut wait = backoff(self.cfg.delivery_backoff_ms, attempt);
                        if let DeliveryError::Throttled {
                            retry_after: Some(ra),
                        } = &e
                        {
                            wait = wait.max(*ra);
                        }
                        tracing::warn!(
                            error = %e,
                            batch_id = batch.id,
                            part = idx + 1,
                            attempt,
                            backoff_ms = wait.as_millis() as u64,
                            "delivery failed, retrying part"
                        );
                        self.clock.sleep(wait).await;
                        attempt += 1;
                    }
                    Err(e) => {
                        counter!("dispatch_messages_total", "result" => "failed").increment(1);
                        return Err(self.fail_delivery(batch, &message, idx, total, e).await);
                    }
                }
            }
        }

        counter!("dispatch_batches_total", "outcome" => "delivered").increment(1);
        self.monitor.update(|s| s.delivered += 1);
        Ok(DispatchOutcome::Delivered { parts: total })
    }

    async fn fail_delivery(
        &mut self,
        batch: &Batch,
        message: &str,
        parts_sent: usize,
        parts_total: usize,
        error: DeliveryError,
    ) -> DispatchError {
        self.monitor.push_failed(FailedDelivery {
            batch_id: batch.id,
            category: batch.category,
            fingerprints: batch.items.iter().map(|t| t.fingerprint.clone()).collect(),
            message: message.to_string(),
            parts_sent,
            parts_total,
            error: error.to_string(),
            failed_at: self.clock.now(),
        });
        let err = DispatchError::DeliveryFailed {
            parts_sent,
            parts_total,
            error: error.clone(),
        };
        self.count_drop(&err);
        self.report(OperatorEvent::DeliveryFailed {
            batch_id: batch.id,
            category: batch.category,
            items: batch.len(),
            parts_sent,
            parts_total,
            error: error.to_string(),
        })
        .await;
        err
    }

    async fn drop_for_budget(&mut self, batch: &Batch, now: DateTime<Utc>) {
        let err = DispatchError::BudgetExhausted;
        self.count_drop(&err);
        let spent_usd = self.budget.spent(now);
        let ceiling_usd = self.budget.ceiling().unwrap_or_default();
        self.report(OperatorEvent::BudgetExhausted {
            batch_id: batch.id,
            category: batch.category,
            items: batch.len(),
            spent_usd,
            ceiling_usd,
        })
        .await;
    }

    async fn wait_for_call_slot(&mut self) {
        loop {
            let now = self.clock.now();
            if self.calls.try_take(1.0, now) {
                return;
            }
            let wait = self.calls.time_until(1.0, now);
            self.clock.sleep(wait).await;
        }
    }

    async fn wait_for_message_slot(&mut self) {
        loop {
            let now = self.clock.now();
            if self.messages.try_take(1.0, now) {
                return;
            }
            let wait = self.messages.time_until(1.0, now);
            self.clock.sleep(wait).await;
        }
    }

    /// Settle the pre-call estimate against what the provider actually billed.
    fn reconcile_tokens(&mut self, estimate: u64, usage: &TokenUsage, now: DateTime<Utc>) {
        counter!("dispatch_tokens_total", "direction" => "input").increment(usage.input_tokens);
        counter!("dispatch_tokens_total", "direction" => "output").increment(usage.output_tokens);
        let Some(tokens) = self.tokens.as_mut() else {
            return;
        };
        let actual = usage.total();
        if actual > estimate {
            tokens.debit((actual - estimate) as f64, now);
        } else {
            tokens.credit((estimate - actual) as f64, now);
        }
    }

    fn count_drop(&self, err: &DispatchError) {
        counter!("dispatch_batches_total", "outcome" => err.outcome_label()).increment(1);
        self.monitor.update(|s| match err {
            DispatchError::BudgetExhausted => s.dropped_budget += 1,
            DispatchError::Unroutable(_) => s.dropped_unroutable += 1,
            DispatchError::QueueFull => s.dropped_queue_full += 1,
            DispatchError::QueueTimeout => s.dropped_queue_timeout += 1,
            DispatchError::SummarizerFailed(_) => s.summarizer_failed += 1,
            DispatchError::DeliveryFailed { .. } => s.delivery_failed += 1,
        });
    }

    async fn report(&self, event: OperatorEvent) {
        self.operator.notify(&event).await;
    }

    fn publish_queue(&self) {
        let len = self.queue.len();
        gauge!("dispatch_queue_len").set(len as f64);
        self.monitor.update(|s| s.queue_len = len);
    }

    fn publish_spend(&mut self) {
        let spent = self.budget.spent(self.clock.now());
        let ceiling = self.budget.ceiling();
        gauge!("dispatch_spend_usd").set(spent);
        self.monitor.update(|s| {
            s.spent_usd = spent;
            s.ceiling_usd = ceiling;
        });
    }
}

/// `base_ms << (attempt - 1)`, capped to keep the shift sane.
fn backoff(base_ms: u64, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    Duration::from_millis(base_ms.saturating_mul(1u64 << shift))
}

fn summary_item(t: &TaggedItem) -> SummaryItem {
    SummaryItem {
        source: t.item.source_id.clone(),
        title: t.item.title.clone(),
        body: t.item.body.clone(),
    }
}

fn source_links(batch: &Batch) -> Vec<SourceLink> {
    let mut seen = HashSet::new();
    batch
        .items
        .iter()
        .filter(|t| !t.item.url.is_empty() && seen.insert(t.item.url.as_str()))
        .map(|t| SourceLink {
            source: t.item.source_id.clone(),
            url: t.item.url.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::dedup::fingerprint;
    use crate::ingest::types::{RawItem, SourceKind};
    use crate::notify::{Ack, Delivery, LogSink};
    use crate::summarize::{MockSummarizer, Summarizer, SummarizerResponse};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 17, 8, 0, 0).unwrap()
    }

    fn batch(id: u64, category: Category, n: usize) -> Batch {
        let items = (0..n)
            .map(|i| {
                let item = RawItem {
                    source_kind: SourceKind::Rss,
                    source_id: "Reuters".into(),
                    external_id: Some(format!("{id}-{i}")),
                    url: format!("https://example.com/{id}/{i}"),
                    title: format!("Headline {id}-{i}"),
                    body: "Body text".into(),
                    published_at: None,
                    fetched_at: t0(),
                };
                let (fp, _) = fingerprint::compute(&item).unwrap();
                TaggedItem {
                    item,
                    fingerprint: fp,
                    category,
                }
            })
            .collect();
        Batch {
            id,
            category,
            items,
            created_at: t0(),
        }
    }

    #[derive(Default)]
    struct CountingDelivery {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl Delivery for CountingDelivery {
        async fn send(&self, _c: Category, _t: &str) -> Result<Ack, DeliveryError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(Ack::default())
        }
        fn accepts(&self, category: Category) -> bool {
            category != Category::Crypto
        }
        fn name(&self) -> &'static str {
            "counting"
        }
    }

    struct RateLimitedOnce {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Summarizer for RateLimitedOnce {
        async fn summarize(
            &self,
            _c: Category,
            _i: &[SummaryItem],
        ) -> Result<SummarizerResponse, SummarizeError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(SummarizeError::RateLimited {
                    retry_after: Some(Duration::from_secs(30)),
                });
            }
            Ok(SummarizerResponse {
                text: "digest".into(),
                usage: TokenUsage::default(),
            })
        }
        fn model(&self) -> &str {
            "mock"
        }
        fn name(&self) -> &'static str {
            "rate-limited-once"
        }
    }

    fn dispatcher(
        cfg: DispatcherConfig,
        summarizer: SharedSummarizer,
        delivery: SharedDelivery,
        clock: Arc<ManualClock>,
    ) -> Dispatcher {
        let budget = DailyBudget::new(None, clock.now());
        Dispatcher::new(cfg, summarizer, delivery, budget, clock, Arc::new(LogSink))
    }

    #[test]
    fn backoff_doubles() {
        assert_eq!(backoff(500, 1), Duration::from_millis(500));
        assert_eq!(backoff(500, 3), Duration::from_millis(2_000));
    }

    #[tokio::test]
    async fn unroutable_category_spends_nothing() {
        let clock = Arc::new(ManualClock::new(t0()));
        let summarizer = Arc::new(MockSummarizer::new("d"));
        let mut d = dispatcher(
            DispatcherConfig::default(),
            summarizer.clone(),
            Arc::new(CountingDelivery::default()),
            clock,
        );
        let r = d.submit(batch(1, Category::Crypto, 2)).await;
        assert_eq!(r, Err(DispatchError::Unroutable(Category::Crypto)));
        assert_eq!(summarizer.calls(), 0);
        assert_eq!(d.monitor().stats().dropped_unroutable, 1);
    }

    #[tokio::test]
    async fn call_ceiling_queues_then_pump_drains() {
        let clock = Arc::new(ManualClock::new(t0()));
        let summarizer = Arc::new(MockSummarizer::new("d"));
        let delivery = Arc::new(CountingDelivery::default());
        let cfg = DispatcherConfig {
            calls_per_minute: 1,
            tokens_per_day: 0,
            ..DispatcherConfig::default()
        };
        let mut d = dispatcher(cfg, summarizer.clone(), delivery.clone(), clock.clone());

        assert!(matches!(
            d.submit(batch(1, Category::Macro, 1)).await,
            Ok(DispatchOutcome::Delivered { parts: 1 })
        ));
        assert_eq!(d.submit(batch(2, Category::Macro, 1)).await, Ok(DispatchOutcome::Queued));
        assert_eq!(d.queue_len(), 1);
        assert!(d.pump().await.is_empty());

        let wait = d.next_ready_in().unwrap();
        assert_eq!(wait, Duration::from_secs(60));
        clock.advance(wait);
        let done = d.pump().await;
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].0, 2);
        assert_eq!(summarizer.calls(), 2);
        assert_eq!(delivery.sent.load(Ordering::SeqCst), 2);
        assert_eq!(d.next_ready_in(), None);
    }

    #[tokio::test]
    async fn rate_limit_requeues_at_front_and_pauses() {
        let clock = Arc::new(ManualClock::new(t0()));
        let summarizer = Arc::new(RateLimitedOnce {
            calls: AtomicUsize::new(0),
        });
        let mut d = dispatcher(
            DispatcherConfig::default(),
            summarizer.clone(),
            Arc::new(CountingDelivery::default()),
            clock.clone(),
        );
        assert_eq!(d.submit(batch(1, Category::Macro, 1)).await, Ok(DispatchOutcome::Queued));
        assert!(d.next_ready_in().unwrap() >= Duration::from_secs(30));
        assert!(d.pump().await.is_empty());

        clock.advance(Duration::from_secs(30));
        let done = d.pump().await;
        assert_eq!(done, vec![(1, Ok(DispatchOutcome::Delivered { parts: 1 }))]);
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_discards_queue() {
        let clock = Arc::new(ManualClock::new(t0()));
        let cfg = DispatcherConfig {
            calls_per_minute: 1,
            ..DispatcherConfig::default()
        };
        let mut d = dispatcher(
            cfg,
            Arc::new(MockSummarizer::new("d")),
            Arc::new(CountingDelivery::default()),
            clock,
        );
        d.submit(batch(1, Category::Macro, 1)).await.unwrap();
        d.submit(batch(2, Category::Equities, 3)).await.unwrap();
        d.submit(batch(3, Category::Currency, 2)).await.unwrap();
        assert_eq!(d.shutdown().await, 2);
        assert_eq!(d.queue_len(), 0);
        assert_eq!(d.monitor().stats().discarded_on_shutdown, 2);
    }
}
