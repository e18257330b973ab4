// tests/common/mod.rs
//
// Shared scripted doubles for integration tests. Each test binary only uses a
// subset, hence the allow.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use finnews_digest::batch::Batch;
use finnews_digest::clock::ManualClock;
use finnews_digest::dedup::{
    fingerprint, Category, Fingerprint, FingerprintStore, MemoryStore, SeenRecord, StoreError,
    TaggedItem,
};
use finnews_digest::ingest::types::{RawItem, SourceKind};
use finnews_digest::notify::{Ack, Delivery, DeliveryError, OperatorEvent, OperatorSink};
use finnews_digest::summarize::{
    SummarizeError, Summarizer, SummarizerResponse, SummaryItem, TokenUsage,
};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 17, 8, 0, 0).unwrap()
}

pub fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(t0()))
}

pub fn raw(source: &str, external_id: Option<&str>, title: &str, body: &str) -> RawItem {
    RawItem {
        source_kind: SourceKind::Rss,
        source_id: source.to_string(),
        external_id: external_id.map(str::to_string),
        url: String::new(),
        title: title.to_string(),
        body: body.to_string(),
        published_at: None,
        fetched_at: t0(),
    }
}

pub fn tagged(id: &str, category: Category, fetched_at: DateTime<Utc>) -> TaggedItem {
    let mut item = raw("Reuters", Some(id), &format!("Headline {id}"), "Body");
    item.url = format!("https://example.com/{id}");
    item.fetched_at = fetched_at;
    let (fp, _) = fingerprint::compute(&item).unwrap();
    TaggedItem {
        item,
        fingerprint: fp,
        category,
    }
}

pub fn batch(id: u64, category: Category, n: usize) -> Batch {
    Batch {
        id,
        category,
        items: (0..n)
            .map(|i| tagged(&format!("{id}-{i}"), category, t0()))
            .collect(),
        created_at: t0(),
    }
}

/// Summarizer that replays a script, then answers with a fixed digest.
pub struct ScriptedSummarizer {
    model: String,
    script: Mutex<VecDeque<Result<SummarizerResponse, SummarizeError>>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<(Category, usize)>>,
}

impl ScriptedSummarizer {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, step: Result<SummarizerResponse, SummarizeError>) -> Self {
        self.script.lock().push_back(step);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// (category, item count) per call, in call order.
    pub fn seen(&self) -> Vec<(Category, usize)> {
        self.seen.lock().clone()
    }
}

pub fn reply(text: &str, input_tokens: u64, output_tokens: u64) -> Result<SummarizerResponse, SummarizeError> {
    Ok(SummarizerResponse {
        text: text.to_string(),
        usage: TokenUsage {
            input_tokens,
            output_tokens,
        },
    })
}

#[async_trait]
impl Summarizer for ScriptedSummarizer {
    async fn summarize(
        &self,
        category: Category,
        items: &[SummaryItem],
    ) -> Result<SummarizerResponse, SummarizeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push((category, items.len()));
        match self.script.lock().pop_front() {
            Some(step) => step,
            None => reply(&format!("{} items summarized", items.len()), 1_000, 200),
        }
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn name(&self) -> &'static str {
        "scripted"
    }

    fn max_output_tokens(&self) -> u32 {
        200
    }
}

/// Delivery that answers sends from a script: `None` succeeds, `Some` fails.
/// Once the script is exhausted every send succeeds.
pub struct FlakyDelivery {
    failures: Mutex<VecDeque<Option<DeliveryError>>>,
    attempts: AtomicUsize,
    sent: Mutex<Vec<(Category, String)>>,
    routable: Vec<Category>,
    max_chars: usize,
}

impl FlakyDelivery {
    pub fn reliable() -> Self {
        Self {
            failures: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            routable: Category::ALL.to_vec(),
            max_chars: 4096,
        }
    }

    pub fn failing(errors: Vec<DeliveryError>) -> Self {
        Self::scripted(errors.into_iter().map(Some).collect())
    }

    pub fn scripted(script: Vec<Option<DeliveryError>>) -> Self {
        let d = Self::reliable();
        *d.failures.lock() = script.into();
        d
    }

    pub fn only(mut self, categories: &[Category]) -> Self {
        self.routable = categories.to_vec();
        self
    }

    pub fn with_max_chars(mut self, n: usize) -> Self {
        self.max_chars = n;
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(Category, String)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Delivery for FlakyDelivery {
    async fn send(&self, category: Category, text: &str) -> Result<Ack, DeliveryError> {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(Some(err)) = self.failures.lock().pop_front() {
            return Err(err);
        }
        self.sent.lock().push((category, text.to_string()));
        Ok(Ack {
            message_id: Some(n as i64 + 1),
        })
    }

    fn accepts(&self, category: Category) -> bool {
        self.routable.contains(&category)
    }

    fn max_message_chars(&self) -> usize {
        self.max_chars
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

/// Memory store whose next calls fail on demand.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    unavailable: AtomicUsize,
    corrupted: Mutex<bool>,
}

impl FlakyStore {
    pub fn fail_next(&self, n: usize) {
        self.unavailable.store(n, Ordering::SeqCst);
    }

    pub fn corrupt(&self) {
        *self.corrupted.lock() = true;
    }

    fn check(&self) -> Result<(), StoreError> {
        if *self.corrupted.lock() {
            return Err(StoreError::Corrupted("checksum mismatch".into()));
        }
        let left = self.unavailable.load(Ordering::SeqCst);
        if left > 0 {
            self.unavailable.store(left - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("database is locked".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl FingerprintStore for FlakyStore {
    async fn exists(&self, fp: &Fingerprint) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.exists(fp).await
    }

    async fn record(
        &self,
        fp: &Fingerprint,
        category: Category,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.inner.record(fp, category, at).await
    }

    async fn get(&self, fp: &Fingerprint) -> Result<Option<SeenRecord>, StoreError> {
        self.check()?;
        self.inner.get(fp).await
    }

    async fn len(&self) -> Result<u64, StoreError> {
        self.inner.len().await
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.purge_older_than(cutoff).await
    }
}

/// Operator sink that keeps every event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<OperatorEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<OperatorEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.kind()).collect()
    }
}

#[async_trait]
impl OperatorSink for RecordingSink {
    async fn notify(&self, event: &OperatorEvent) {
        self.events.lock().push(event.clone());
    }
}
