#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use flowlogd::upstream::{CollectionWindow, FlowDirection, FlowLogSource};
use flowlogd::{
    AccountDescriptor, AccountDirectory, ArchivePurger, CoordinationBackend, Dispatcher,
    FlowLogCollector, FlowlogConfig, FlowlogError, InMemoryCoordinationBackend, LockToken,
    Result, TaskChain, Timestamp,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration as StdDuration;
use tokio::sync::Mutex;

pub fn t0() -> Timestamp {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

pub fn hours(n: i64) -> Duration {
    Duration::hours(n)
}

pub fn test_config(identity: &str) -> FlowlogConfig {
    FlowlogConfig::new()
        .namespace("flowlog")
        .node_identity(identity)
        .collect_interval(StdDuration::from_secs(3600))
        .purge_interval(StdDuration::from_secs(86_400))
        .collection_window(StdDuration::from_secs(3600))
        .max_correction_runs(12)
        .tick_slack(StdDuration::from_secs(10))
        .lock_ttl(StdDuration::from_secs(300))
}

pub fn account(id: &str) -> AccountDescriptor {
    AccountDescriptor::new(id, format!("flowlogs-{}", id))
}

/// Account directory returning a fixed answer that tests can swap.
#[derive(Default)]
pub struct StaticAccounts {
    accounts: Mutex<Vec<AccountDescriptor>>,
    failing: AtomicBool,
}

impl StaticAccounts {
    pub fn new(accounts: Vec<AccountDescriptor>) -> Self {
        Self {
            accounts: Mutex::new(accounts),
            failing: AtomicBool::new(false),
        }
    }

    pub async fn replace(&self, accounts: Vec<AccountDescriptor>) {
        *self.accounts.lock().await = accounts;
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl AccountDirectory for StaticAccounts {
    async fn list_enabled_accounts(&self) -> Result<Vec<AccountDescriptor>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(FlowlogError::Upstream("directory unavailable".to_string()));
        }
        Ok(self.accounts.lock().await.clone())
    }
}

/// Dispatcher that only remembers what was submitted.
#[derive(Default)]
pub struct RecordingDispatcher {
    chains: Mutex<Vec<TaskChain>>,
}

impl RecordingDispatcher {
    pub async fn chains(&self) -> Vec<TaskChain> {
        self.chains.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.chains.lock().await.clear();
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn submit(&self, chain: TaskChain) -> Result<()> {
        self.chains.lock().await.push(chain);
        Ok(())
    }
}

/// Dispatcher whose queue is always closed.
pub struct ClosedDispatcher;

#[async_trait]
impl Dispatcher for ClosedDispatcher {
    async fn submit(&self, _chain: TaskChain) -> Result<()> {
        Err(FlowlogError::Dispatch("task queue closed".to_string()))
    }
}

/// Shared buffer that `tracing_subscriber::fmt` writes into.
#[derive(Clone, Default)]
pub struct LogCapture {
    buffer: Arc<std::sync::Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn contents(&self) -> String {
        let buffer = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Collector that records every start it was asked for and returns
/// `start + 1h` (or a fixed end when started without a cursor).
pub struct RecordingCollector {
    pub default_end: Timestamp,
    pub delay: StdDuration,
    pub failures_left: AtomicUsize,
    pub calls: Mutex<Vec<(String, Option<Timestamp>)>>,
}

impl RecordingCollector {
    pub fn new(default_end: Timestamp) -> Self {
        Self {
            default_end,
            delay: StdDuration::ZERO,
            failures_left: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: StdDuration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_first(self, failures: usize) -> Self {
        self.failures_left.store(failures, Ordering::SeqCst);
        self
    }

    pub async fn starts(&self) -> Vec<Option<Timestamp>> {
        self.calls.lock().await.iter().map(|(_, start)| *start).collect()
    }
}

#[async_trait]
impl FlowLogCollector for RecordingCollector {
    async fn collect_logs(
        &self,
        account_id: &str,
        _bucket_name: &str,
        start_time: Option<Timestamp>,
    ) -> Result<Timestamp> {
        self.calls
            .lock()
            .await
            .push((account_id.to_string(), start_time));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(FlowlogError::collection(account_id, "upstream timed out"));
        }
        Ok(start_time.map_or(self.default_end, |start| start + Duration::hours(1)))
    }
}

#[derive(Default)]
pub struct CountingPurger {
    pub purged: Mutex<Vec<String>>,
}

#[async_trait]
impl ArchivePurger for CountingPurger {
    async fn purge_old_objects(&self, account: &AccountDescriptor) -> Result<usize> {
        self.purged.lock().await.push(account.account_id.clone());
        Ok(1)
    }
}

/// Flow-log source answering with one record per direction.
#[derive(Default)]
pub struct CannedSource {
    pub requests: Mutex<Vec<(String, CollectionWindow, FlowDirection)>>,
}

#[async_trait]
impl FlowLogSource for CannedSource {
    async fn fetch_records(
        &self,
        account_id: &str,
        window: &CollectionWindow,
        direction: FlowDirection,
    ) -> Result<Vec<Value>> {
        self.requests
            .lock()
            .await
            .push((account_id.to_string(), *window, direction));
        Ok(vec![json!({
            "account": account_id,
            "direction": direction.as_query(),
            "bytes": 1500,
        })])
    }
}

/// In-memory backend whose reads can be made to fail.
#[derive(Clone, Default)]
pub struct FlakyBackend {
    pub inner: InMemoryCoordinationBackend,
    pub fail_reads: Arc<AtomicBool>,
}

#[async_trait]
impl CoordinationBackend for FlakyBackend {
    async fn create_if_absent(&self, path: &str, value: &[u8]) -> Result<bool> {
        self.inner.create_if_absent(path, value).await
    }

    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(FlowlogError::coordination(path, "connection loss"));
        }
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, value: &[u8]) -> Result<()> {
        self.inner.write(path, value).await
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>> {
        self.inner.list_children(path).await
    }

    async fn try_lock(
        &self,
        path: &str,
        holder: &str,
        ttl: StdDuration,
    ) -> Result<Option<LockToken>> {
        self.inner.try_lock(path, holder, ttl).await
    }

    async fn unlock(&self, token: &LockToken) -> Result<()> {
        self.inner.unlock(token).await
    }
}
