//! In-memory collaborators for exercising the orchestrator without a network or a file system.
//! Every double has a small failure injector, shaped like the error injectors of a test KV store.

use crate::checkpoint::CheckpointStore;
use crate::error::{Error, Result};
use crate::sink::RecordSink;
use crate::source::{AuditLogRecord, AuditLogSource, Page};
use crate::watermark::{Clock, Watermark};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Decrements `counter` if it is positive and reports whether the operation should fail.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// A clock that only moves when told to, optionally stepping forward after every sample.
#[derive(Clone)]
pub(crate) struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
    step: TimeDelta,
}

impl ManualClock {
    pub(crate) fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            step: TimeDelta::zero(),
        }
    }

    pub(crate) fn with_step(mut self, step: TimeDelta) -> Self {
        self.step = step;
        self
    }

    pub(crate) fn advance(&self, by: TimeDelta) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let mut now = self.now.lock();
        let sampled = *now;
        *now += self.step;
        sampled
    }
}

#[derive(Debug, Default)]
pub(crate) struct CheckpointErrorInjector {
    fail_next_reads: AtomicUsize,
    fail_next_writes: AtomicUsize,
}

impl CheckpointErrorInjector {
    pub(crate) fn fail_reads(&self, count: usize) {
        self.fail_next_reads.store(count, Ordering::SeqCst);
    }

    pub(crate) fn fail_writes(&self, count: usize) {
        self.fail_next_writes.store(count, Ordering::SeqCst);
    }
}

/// Checkpoint store backed by a shared string. Clones share the value.
#[derive(Clone)]
pub(crate) struct InMemoryCheckpointStore {
    key: &'static str,
    value: Arc<Mutex<Option<String>>>,
    writes: Arc<AtomicUsize>,
    error_injector: Arc<CheckpointErrorInjector>,
}

impl InMemoryCheckpointStore {
    pub(crate) fn new(key: &'static str) -> Self {
        Self {
            key,
            value: Arc::new(Mutex::new(None)),
            writes: Arc::new(AtomicUsize::new(0)),
            error_injector: Arc::new(CheckpointErrorInjector::default()),
        }
    }

    pub(crate) fn with_value(key: &'static str, value: &str) -> Self {
        let store = Self::new(key);
        *store.value.lock() = Some(value.to_string());
        store
    }

    pub(crate) fn value(&self) -> Option<String> {
        self.value.lock().clone()
    }

    pub(crate) fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub(crate) fn error_injector(&self) -> &CheckpointErrorInjector {
        &self.error_injector
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn key(&self) -> &str {
        self.key
    }

    async fn read(&self) -> Result<Option<String>> {
        if take_failure(&self.error_injector.fail_next_reads) {
            return Err(Error::Checkpoint("injected read failure".to_string()));
        }
        Ok(self.value())
    }

    async fn store(&self, watermark: Watermark) -> Result<()> {
        if take_failure(&self.error_injector.fail_next_writes) {
            return Err(Error::Checkpoint("injected write failure".to_string()));
        }
        *self.value.lock() = Some(watermark.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Serves a fixed list of pages for any `since`, recording every call.
#[derive(Clone)]
pub(crate) struct ScriptedSource {
    identity: Option<String>,
    pages: Arc<Vec<Vec<AuditLogRecord>>>,
    fetches: Arc<Mutex<Vec<(Watermark, u32)>>>,
    identity_checks: Arc<AtomicUsize>,
    fail_identity: Arc<AtomicUsize>,
    fail_page_once: Arc<Mutex<Option<u32>>>,
}

impl ScriptedSource {
    /// `page_sizes[i]` is the number of records on page `i + 1`, pages past the end are empty.
    pub(crate) fn new(page_sizes: &[usize]) -> Self {
        let mut next_id = 0;
        let pages = page_sizes
            .iter()
            .map(|size| {
                (0..*size)
                    .map(|_| {
                        next_id += 1;
                        AuditLogRecord::new(serde_json::json!({ "id": format!("evt-{next_id}") }))
                    })
                    .collect()
            })
            .collect();

        Self {
            identity: Some("ops@example.com".to_string()),
            pages: Arc::new(pages),
            fetches: Arc::new(Mutex::new(Vec::new())),
            identity_checks: Arc::new(AtomicUsize::new(0)),
            fail_identity: Arc::new(AtomicUsize::new(0)),
            fail_page_once: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn with_identity(mut self, identity: Option<&str>) -> Self {
        self.identity = identity.map(str::to_string);
        self
    }

    pub(crate) fn fail_identity(&self, count: usize) {
        self.fail_identity.store(count, Ordering::SeqCst);
    }

    /// The next fetch of `page` fails, later fetches of it succeed.
    pub(crate) fn fail_page_once(&self, page: u32) {
        *self.fail_page_once.lock() = Some(page);
    }

    pub(crate) fn fetches(&self) -> Vec<(Watermark, u32)> {
        self.fetches.lock().clone()
    }

    pub(crate) fn identity_checks(&self) -> usize {
        self.identity_checks.load(Ordering::SeqCst)
    }

    pub(crate) fn total_records(&self) -> usize {
        self.pages.iter().map(Vec::len).sum()
    }
}

impl AuditLogSource for ScriptedSource {
    async fn identity(&self) -> Result<Option<String>> {
        self.identity_checks.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.fail_identity) {
            return Err(Error::Source("injected identity failure".to_string()));
        }
        Ok(self.identity.clone())
    }

    async fn fetch_page(&self, since: Watermark, page: u32) -> Result<Page> {
        self.fetches.lock().push((since, page));
        {
            let mut fail_page = self.fail_page_once.lock();
            if *fail_page == Some(page) {
                *fail_page = None;
                return Err(Error::Source(format!("injected failure on page {page}")));
            }
        }

        let records = usize::try_from(page)
            .ok()
            .and_then(|page| page.checked_sub(1))
            .and_then(|index| self.pages.get(index))
            .cloned()
            .unwrap_or_default();
        Ok(Page {
            number: page,
            records,
        })
    }
}

/// Collects emitted records in a shared buffer, optionally failing after `fail_after` records.
#[derive(Clone, Default)]
pub(crate) struct CollectingSink {
    records: Arc<Mutex<Vec<AuditLogRecord>>>,
    fail_after: Option<usize>,
}

impl CollectingSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing_after(count: usize) -> Self {
        Self {
            fail_after: Some(count),
            ..Self::default()
        }
    }

    pub(crate) fn records(&self) -> Vec<AuditLogRecord> {
        self.records.lock().clone()
    }
}

impl RecordSink for CollectingSink {
    async fn emit(&mut self, record: &AuditLogRecord) -> Result<()> {
        let mut records = self.records.lock();
        if self.fail_after.is_some_and(|limit| records.len() >= limit) {
            return Err(Error::Sink("injected sink failure".to_string()));
        }
        records.push(record.clone());
        Ok(())
    }
}
