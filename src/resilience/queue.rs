//! Command queue
//!
//! Bounded landing zone for commands refused by an open circuit breaker.
//! Every entry settles exactly once: with the executor's result on drain,
//! with `Expired` once older than its max age, or with `QueueCleared`.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::clock::{self, SharedClock};
use crate::error::{CoreError, Result};
use crate::protocol::Request;

/// Queue limits
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_size: usize,
    pub max_age: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            max_age: Duration::from_secs(60),
        }
    }
}

/// Completion handle for a queued command
#[derive(Debug)]
pub struct Ticket {
    rx: oneshot::Receiver<Result<Value>>,
}

impl Future for Ticket {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|settled| settled.unwrap_or(Err(CoreError::QueueCleared)))
    }
}

struct QueuedCommand {
    request: Request,
    enqueued_at: Instant,
    max_age: Duration,
    reply: oneshot::Sender<Result<Value>>,
}

impl QueuedCommand {
    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }

    fn expire(self, now: Instant) {
        let age = self.age(now);
        debug!("Queued {} expired after {:?}", self.request.command_type, age);
        let _ = self.reply.send(Err(CoreError::Expired { age }));
    }
}

/// Outcome counts of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub succeeded: usize,
    pub failed: usize,
    pub expired: usize,
}

/// Queue statistics
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub capacity: usize,
    pub enqueued: u64,
    pub expired: u64,
    pub drained: u64,
}

/// Bounded FIFO of deferred commands
pub struct CommandQueue {
    config: QueueConfig,
    clock: SharedClock,
    entries: Mutex<VecDeque<QueuedCommand>>,
    enqueued: AtomicU64,
    expired: AtomicU64,
    drained: AtomicU64,
}

impl CommandQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_clock(config, clock::system())
    }

    pub fn with_clock(config: QueueConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            entries: Mutex::new(VecDeque::new()),
            enqueued: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            drained: AtomicU64::new(0),
        }
    }

    /// Store a command. A full queue rejects with `QueueFull` and is left
    /// untouched; otherwise aged entries are expired first.
    pub fn enqueue(&self, request: Request) -> Result<Ticket> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        if entries.len() >= self.config.max_size {
            warn!(
                "Command queue full ({} entries), rejecting {}",
                entries.len(),
                request.command_type
            );
            return Err(CoreError::QueueFull {
                capacity: self.config.max_size,
            });
        }

        let expired = self.expire_locked(&mut entries, now);
        if expired > 0 {
            debug!("Expired {} queued command(s) on enqueue", expired);
        }

        let (reply, rx) = oneshot::channel();
        debug!("Queued {} ({} waiting)", request.command_type, entries.len() + 1);
        entries.push_back(QueuedCommand {
            request,
            enqueued_at: now,
            max_age: self.config.max_age,
            reply,
        });
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(Ticket { rx })
    }

    /// Run every queued command through `executor` in FIFO order.
    ///
    /// Entries past their max age at their turn are rejected with `Expired`
    /// and never reach the executor. Commands enqueued while draining wait for
    /// the next pass.
    pub async fn drain<F, Fut>(&self, mut executor: F) -> DrainReport
    where
        F: FnMut(Request) -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let batch: Vec<QueuedCommand> = self.entries.lock().drain(..).collect();
        let mut report = DrainReport::default();
        if batch.is_empty() {
            return report;
        }
        info!("Draining {} queued command(s)", batch.len());

        for entry in batch {
            let now = self.clock.now();
            if entry.age(now) > entry.max_age {
                entry.expire(now);
                self.expired.fetch_add(1, Ordering::Relaxed);
                report.expired += 1;
                continue;
            }

            let outcome = executor(entry.request).await;
            match &outcome {
                Ok(_) => report.succeeded += 1,
                Err(e) => {
                    debug!("Queued command failed on drain: {}", e);
                    report.failed += 1;
                }
            }
            self.drained.fetch_add(1, Ordering::Relaxed);
            let _ = entry.reply.send(outcome);
        }

        info!(
            "Queue drained: {} ok, {} failed, {} expired",
            report.succeeded, report.failed, report.expired
        );
        report
    }

    /// Reject every entry older than its max age
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        self.expire_locked(&mut entries, now)
    }

    /// Reject everything with `QueueCleared`
    pub fn clear(&self) -> usize {
        let batch: Vec<QueuedCommand> = self.entries.lock().drain(..).collect();
        let count = batch.len();
        for entry in batch {
            let _ = entry.reply.send(Err(CoreError::QueueCleared));
        }
        if count > 0 {
            info!("Cleared {} queued command(s)", count);
        }
        count
    }

    fn expire_locked(&self, entries: &mut VecDeque<QueuedCommand>, now: Instant) -> usize {
        let mut kept = VecDeque::with_capacity(entries.len());
        let mut expired = 0;
        for entry in entries.drain(..) {
            if entry.age(now) > entry.max_age {
                entry.expire(now);
                expired += 1;
            } else {
                kept.push_back(entry);
            }
        }
        *entries = kept;
        self.expired.fetch_add(expired as u64, Ordering::Relaxed);
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.config.max_size
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.len(),
            capacity: self.config.max_size,
            enqueued: self.enqueued.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            drained: self.drained.load(Ordering::Relaxed),
        }
    }
}
