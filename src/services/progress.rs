//! Progress log pipeline.
//!
//! Every goal invocation holds one logical log composed of an always-on
//! ephemeral sink and a persistent sink (first available of the remote log
//! service and local logging). Writes broadcast to all sinks through a
//! buffer flushed by size or time; close is guaranteed on all exit paths
//! before the goal's terminal state is published.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::domain::models::ProgressConfig;

/// A sink for goal execution output.
#[async_trait::async_trait]
pub trait ProgressLog: Send + Sync {
    fn name(&self) -> &str;

    /// Public URL where consumers can follow this log, when one exists.
    fn url(&self) -> Option<String>;

    /// Whether the sink can currently accept writes.
    async fn is_available(&self) -> bool;

    async fn write(&self, line: &str);

    async fn flush(&self);

    async fn close(&self);
}

/// Always-on in-memory sink that mirrors lines to tracing.
#[derive(Default)]
pub struct EphemeralProgressLog {
    lines: Mutex<Vec<String>>,
}

impl EphemeralProgressLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captured lines, for observers and tests.
    pub async fn lines(&self) -> Vec<String> {
        self.lines.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl ProgressLog for EphemeralProgressLog {
    fn name(&self) -> &str {
        "ephemeral"
    }

    fn url(&self) -> Option<String> {
        None
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn write(&self, line: &str) {
        tracing::debug!(target: "progress", "{line}");
        self.lines.lock().await.push(line.to_string());
    }

    async fn flush(&self) {}

    async fn close(&self) {}
}

/// Pick the first available sink from `candidates`, falling back to an
/// ephemeral log when none responds.
pub async fn first_available(candidates: Vec<Arc<dyn ProgressLog>>) -> Arc<dyn ProgressLog> {
    for candidate in candidates {
        if candidate.is_available().await {
            return candidate;
        }
    }
    Arc::new(EphemeralProgressLog::new())
}

struct Buffer {
    pending: String,
}

/// Broadcasts writes to all sinks through a size/time-triggered buffer.
pub struct WriteToAllProgressLog {
    sinks: Vec<Arc<dyn ProgressLog>>,
    buffer: Mutex<Buffer>,
    flush_bytes: usize,
    closed: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl WriteToAllProgressLog {
    /// Compose sinks behind one buffered front. A background ticker flushes
    /// on the configured interval; size-triggered flushes happen inline.
    pub fn new(sinks: Vec<Arc<dyn ProgressLog>>, config: &ProgressConfig) -> Arc<Self> {
        let log = Arc::new(Self {
            sinks,
            buffer: Mutex::new(Buffer {
                pending: String::new(),
            }),
            flush_bytes: config.flush_bytes,
            closed: AtomicBool::new(false),
            ticker: Mutex::new(None),
        });

        let weak = Arc::downgrade(&log);
        let interval = Duration::from_millis(config.flush_interval_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(log) = weak.upgrade() else { break };
                if log.closed.load(Ordering::SeqCst) {
                    break;
                }
                log.flush().await;
            }
        });
        if let Ok(mut slot) = log.ticker.try_lock() {
            *slot = Some(handle);
        }
        log
    }

    async fn drain(&self) -> Option<String> {
        let mut buffer = self.buffer.lock().await;
        if buffer.pending.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut buffer.pending))
    }
}

#[async_trait::async_trait]
impl ProgressLog for WriteToAllProgressLog {
    fn name(&self) -> &str {
        "write-to-all"
    }

    fn url(&self) -> Option<String> {
        self.sinks.iter().find_map(|s| s.url())
    }

    async fn is_available(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn write(&self, line: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let should_flush = {
            let mut buffer = self.buffer.lock().await;
            buffer.pending.push_str(line);
            buffer.pending.push('\n');
            buffer.pending.len() >= self.flush_bytes
        };
        if should_flush {
            self.flush().await;
        }
    }

    async fn flush(&self) {
        let Some(chunk) = self.drain().await else {
            return;
        };
        for sink in &self.sinks {
            for line in chunk.lines() {
                sink.write(line).await;
            }
            sink.flush().await;
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.flush().await;
        for sink in &self.sinks {
            sink.close().await;
        }
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }
    }
}
