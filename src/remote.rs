//! Best-effort remote mirror.
//!
//! Records and lot metadata are pushed to a JSON-over-REST database
//! (`{base_url}/{path}.json`). The tick loop never waits on the network:
//! jobs go through a bounded queue to a background worker that retries a
//! bounded number of times and then gives up with a warning.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, Utc};
use rand::RngCore;
use serde_json::{json, Value};

use crate::config::RemoteSettings;
use crate::record::{Lot, PlateRecord, SessionStats};

const RETRY_BACKOFF: Duration = Duration::from_millis(250);
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
pub const PUSH_SOURCE: &str = "plate-inspector";

pub trait RemoteMirror: Send {
    /// Replaces the object at `path`.
    fn put(&self, path: &str, body: &Value) -> Result<()>;
    /// Appends `body` under `path`.
    fn post(&self, path: &str, body: &Value) -> Result<()>;
}

// -------------------- REST --------------------

pub struct RestMirror {
    base_url: String,
    auth_token: Option<String>,
    agent: ureq::Agent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Method {
    Put,
    Post,
}

impl Method {
    fn as_str(self) -> &'static str {
        match self {
            Method::Put => "PUT",
            Method::Post => "POST",
        }
    }
}

impl RestMirror {
    pub fn new(settings: &RemoteSettings) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(settings.timeout).build();
        Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            auth_token: settings.auth_token.clone(),
            agent,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}.json", self.base_url, path.trim_matches('/'))
    }

    fn send(&self, method: Method, path: &str, auth: Option<&str>, body: &Value) -> Result<()> {
        let url = self.url(path);
        let mut request = self
            .agent
            .request(method.as_str(), &url)
            .set("Content-Type", "application/json");
        if let Some(token) = auth {
            request = request.query("auth", token);
        }
        request
            .send_json(body)
            .map_err(describe_error)
            .with_context(|| format!("remote {} {}", method.as_str(), url))?;
        Ok(())
    }

    /// Authenticated first when a token is configured, then plain REST.
    fn dispatch(&self, method: Method, path: &str, body: &Value) -> Result<()> {
        if let Some(token) = self.auth_token.as_deref() {
            match self.send(method, path, Some(token), body) {
                Ok(()) => return Ok(()),
                Err(err) => log::warn!(
                    "remote authenticated {} failed, falling back to unauthenticated: {:#}",
                    method.as_str(),
                    err
                ),
            }
        }
        self.send(method, path, None, body)
    }
}

impl RemoteMirror for RestMirror {
    fn put(&self, path: &str, body: &Value) -> Result<()> {
        self.dispatch(Method::Put, path, body)
    }

    fn post(&self, path: &str, body: &Value) -> Result<()> {
        self.dispatch(Method::Post, path, body)
    }
}

/// ureq errors carry the full request URL, token included; keep only the cause.
fn describe_error(err: ureq::Error) -> anyhow::Error {
    match err {
        ureq::Error::Status(code, response) => {
            anyhow!("HTTP {} {}", code, response.status_text())
        }
        ureq::Error::Transport(transport) => anyhow!("transport error: {}", transport.kind()),
    }
}

// -------------------- In-memory --------------------

#[derive(Clone, Debug, PartialEq)]
pub struct MirrorCall {
    pub method: &'static str,
    pub path: String,
    pub body: Value,
}

/// Records calls instead of sending them. Clones share the same log.
#[derive(Clone, Debug, Default)]
pub struct InMemoryMirror {
    calls: Arc<Mutex<Vec<MirrorCall>>>,
    failures_left: Arc<AtomicU32>,
}

impl InMemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the first `n` calls.
    pub fn failing_first(n: u32) -> Self {
        let mirror = Self::default();
        mirror.failures_left.store(n, Ordering::SeqCst);
        mirror
    }

    pub fn calls(&self) -> Vec<MirrorCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, method: &'static str, path: &str, body: &Value) -> Result<()> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow!("remote unavailable"));
        }
        self.calls
            .lock()
            .map_err(|_| anyhow!("mirror call log poisoned"))?
            .push(MirrorCall {
                method,
                path: path.to_string(),
                body: body.clone(),
            });
        Ok(())
    }
}

impl RemoteMirror for InMemoryMirror {
    fn put(&self, path: &str, body: &Value) -> Result<()> {
        self.record("PUT", path, body)
    }

    fn post(&self, path: &str, body: &Value) -> Result<()> {
        self.record("POST", path, body)
    }
}

// -------------------- Worker --------------------

#[derive(Clone, Debug, PartialEq)]
pub enum MirrorJob {
    Put { path: String, body: Value },
    Post { path: String, body: Value },
}

impl MirrorJob {
    fn describe(&self) -> String {
        match self {
            MirrorJob::Put { path, .. } => format!("PUT {}", path),
            MirrorJob::Post { path, .. } => format!("POST {}", path),
        }
    }

    fn run(&self, mirror: &dyn RemoteMirror) -> Result<()> {
        match self {
            MirrorJob::Put { path, body } => mirror.put(path, body),
            MirrorJob::Post { path, body } => mirror.post(path, body),
        }
    }
}

/// Shared between the handle and the worker thread.
#[derive(Debug, Default)]
struct WorkerState {
    dropped: AtomicU64,
    /// Set at shutdown; past it, queued jobs are dropped instead of sent.
    deadline: Mutex<Option<Instant>>,
}

impl WorkerState {
    fn expired(&self) -> bool {
        self.deadline
            .lock()
            .map(|d| d.map_or(false, |at| Instant::now() >= at))
            .unwrap_or(true)
    }

    fn drop_job(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Background sender with a bounded queue and bounded retries.
///
/// Shutdown keeps delivering queued jobs for at most the drain timeout,
/// then drops whatever is left. A request already in flight still runs to
/// its own timeout.
pub struct MirrorWorker {
    tx: Option<SyncSender<MirrorJob>>,
    join: Option<JoinHandle<()>>,
    state: Arc<WorkerState>,
    drain_timeout: Duration,
}

impl MirrorWorker {
    pub fn spawn(mirror: Box<dyn RemoteMirror>, max_attempts: u32, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::sync_channel(queue_capacity.max(1));
        let state = Arc::new(WorkerState::default());
        let state_thread = state.clone();
        let join = std::thread::spawn(move || {
            run_worker(mirror, rx, max_attempts.max(1), state_thread);
        });
        Self {
            tx: Some(tx),
            join: Some(join),
            state,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Queues a job without blocking. Returns false when it was dropped.
    pub fn submit(&self, job: MirrorJob) -> bool {
        let Some(tx) = self.tx.as_ref() else {
            return false;
        };
        match tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                self.state.drop_job();
                log::warn!("remote queue full, dropping {}", job.describe());
                false
            }
            Err(TrySendError::Disconnected(job)) => {
                self.state.drop_job();
                log::warn!("remote worker gone, dropping {}", job.describe());
                false
            }
        }
    }

    /// Jobs dropped because the queue was full, every attempt failed, or
    /// the shutdown drain ran out of time.
    pub fn dropped(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }

    /// Drains the queue within the drain timeout and joins the worker thread.
    pub fn shutdown(mut self) -> Result<()> {
        self.close()
    }

    fn close(&mut self) -> Result<()> {
        if self.tx.take().is_some() {
            if let Ok(mut deadline) = self.state.deadline.lock() {
                *deadline = Some(Instant::now() + self.drain_timeout);
            }
        }
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("remote worker thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for MirrorWorker {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!("{}", err);
        }
    }
}

fn run_worker(
    mirror: Box<dyn RemoteMirror>,
    rx: Receiver<MirrorJob>,
    max_attempts: u32,
    state: Arc<WorkerState>,
) {
    let mut abandoned = 0u64;
    for job in rx {
        if state.expired() {
            state.drop_job();
            abandoned += 1;
            continue;
        }
        let mut attempt = 1;
        loop {
            match job.run(mirror.as_ref()) {
                Ok(()) => break,
                Err(err) if attempt < max_attempts && !state.expired() => {
                    log::debug!(
                        "remote {} attempt {}/{} failed: {:#}",
                        job.describe(),
                        attempt,
                        max_attempts,
                        err
                    );
                    std::thread::sleep(RETRY_BACKOFF * attempt);
                    attempt += 1;
                }
                Err(err) => {
                    state.drop_job();
                    log::warn!(
                        "remote {} gave up after {} attempt(s): {:#}",
                        job.describe(),
                        attempt,
                        err
                    );
                    break;
                }
            }
        }
    }
    if abandoned > 0 {
        log::warn!(
            "remote drain timed out, dropped {} queued job(s)",
            abandoned
        );
    }
}

// -------------------- Payloads --------------------

pub fn meta_path(session_key: &str) -> String {
    format!("sessions/{}/meta", session_key)
}

pub fn records_path(session_key: &str) -> String {
    format!("sessions/{}/records", session_key)
}

/// Posted body for one record. Downstream keeps the latest body per
/// `(lot_id, sequence_no)`; `supersedes` marks a replacement.
pub fn record_payload(record: &PlateRecord, supersedes: bool) -> Value {
    let ts = record.timestamp();
    json!({
        "sequence_no": record.sequence_no(),
        "date": ts.format("%Y-%m-%d").to_string(),
        "time": ts.format("%H:%M:%S").to_string(),
        "lot_id": record.lot_id(),
        "shape": record.shape(),
        "defects": record.defects(),
        "defects_text": record.defects_text(),
        "supersedes": supersedes,
        "_meta": push_meta(Utc::now()),
    })
}

/// Lot metadata `put` at start and again at stop.
pub fn lot_payload(lot: &Lot, stats: &SessionStats, ended_at: Option<DateTime<Local>>) -> Value {
    json!({
        "lot_id": lot.lot_id(),
        "date": lot.date().format("%Y-%m-%d").to_string(),
        "start_time": lot.started_at().format("%H:%M:%S").to_string(),
        "end_time": ended_at.map(|t| t.format("%H:%M:%S").to_string()),
        "total": stats.total,
        "defective": stats.defective,
        "passed": stats.passed,
        "shapes": stats.shapes,
    })
}

fn push_meta(pushed_at: DateTime<Utc>) -> Value {
    let mut id = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut id);
    json!({
        "source": PUSH_SOURCE,
        "pushed_at": pushed_at.to_rfc3339(),
        "push_id": hex::encode(id),
    })
}
