use crate::broker::MessageHandler;
use crate::reading::Reading;
use crate::store::ReadingStore;
use anyhow::Result;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{self, JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlushError {
    #[error("batch write failed: {0}")]
    Store(String),
    #[error("reading pipeline is not running")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Interval,
    Demand,
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Interval => "interval",
            FlushTrigger::Demand => "demand",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug)]
pub struct PendingReading {
    reading: Reading,
    done: oneshot::Sender<Result<(), FlushError>>,
}

#[derive(Debug)]
pub enum BatchCommand {
    Reading(PendingReading),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Resolves once the batch holding the reading has been committed or has failed.
#[derive(Debug)]
pub struct FlushReceipt {
    rx: oneshot::Receiver<Result<(), FlushError>>,
}

impl FlushReceipt {
    pub async fn wait(self) -> Result<(), FlushError> {
        self.rx.await.unwrap_or(Err(FlushError::Closed))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_inflight_flushes: usize,
}

#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<BatchCommand>,
    stats: Arc<PipelineStats>,
}

impl PipelineHandle {
    pub fn new(tx: mpsc::Sender<BatchCommand>, stats: Arc<PipelineStats>) -> Self {
        Self { tx, stats }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub async fn enqueue(&self, reading: Reading) -> Result<FlushReceipt, FlushError> {
        let queue_depth = self.stats.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(queue_depth, reading = %reading.id, sensor = %reading.sensor_id, "queued reading");
        let (done, rx) = oneshot::channel();
        let command = BatchCommand::Reading(PendingReading { reading, done });
        if self.tx.send(command).await.is_err() {
            self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
            return Err(FlushError::Closed);
        }
        Ok(FlushReceipt { rx })
    }

    /// Buffers `reading` and waits until the flush that contains it has finished.
    pub async fn on_message_received(
        &self,
        reading: Reading,
        cancel: &CancellationToken,
    ) -> Result<(), FlushError> {
        if cancel.is_cancelled() {
            return Err(FlushError::Closed);
        }
        self.enqueue(reading).await?.wait().await
    }

    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(BatchCommand::Flush(tx)).await;
        let _ = rx.await;
        Ok(())
    }

    /// Writes everything still buffered, waits for in-flight writes and stops the worker.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(BatchCommand::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
        Ok(())
    }
}

impl MessageHandler<Reading> for PipelineHandle {
    async fn handle(&self, message: Reading, cancel: CancellationToken) -> Result<()> {
        self.on_message_received(message, &cancel).await?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct PipelineStats {
    pub queue_depth: AtomicU64,
    pub buffered: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub average_flush_micros: AtomicU64,
    pub inflight_flushes: AtomicU64,
    pub flushed_readings_total: AtomicU64,
    pub failed_batches_total: AtomicU64,
    pub rejected_deliveries_total: AtomicU64,
    pub broker_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            queue_depth: AtomicU64::new(0),
            buffered: AtomicU64::new(0),
            last_flush_unix_ms: AtomicU64::new(0),
            last_batch_len: AtomicU64::new(0),
            average_flush_micros: AtomicU64::new(0),
            inflight_flushes: AtomicU64::new(0),
            flushed_readings_total: AtomicU64::new(0),
            failed_batches_total: AtomicU64::new(0),
            rejected_deliveries_total: AtomicU64::new(0),
            broker_connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn set_broker_connected(&self, connected: bool) {
        self.broker_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_rejected_delivery(&self) {
        self.rejected_deliveries_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    fn record_flush(&self, len: usize, elapsed: Duration) {
        self.last_batch_len.store(len as u64, Ordering::Relaxed);
        self.flushed_readings_total
            .fetch_add(len as u64, Ordering::Relaxed);
        let now = Utc::now().timestamp_millis() as u64;
        self.last_flush_unix_ms.store(now, Ordering::Relaxed);
        let micros = elapsed.as_micros() as u64;
        let prev = self.average_flush_micros.load(Ordering::Relaxed);
        let avg = if prev == 0 { micros } else { (prev + micros) / 2 };
        self.average_flush_micros.store(avg, Ordering::Relaxed);
    }
}

pub fn spawn_worker<S: ReadingStore>(
    store: Arc<S>,
    rx: mpsc::Receiver<BatchCommand>,
    stats: Arc<PipelineStats>,
    settings: BatchSettings,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let worker = Accumulator {
            store,
            stats,
            settings,
            buffer: Vec::with_capacity(settings.batch_size),
            inflight: JoinSet::new(),
            inflight_ids: HashSet::new(),
            deferred: None,
            pushed: 0,
            taken: 0,
            flush_waiters: Vec::new(),
        };
        worker.run(rx).await;
    })
}

/// Sole owner of the pending buffer. Size, interval, on-demand and shutdown
/// triggers all arrive on this task, so they can never flush the same reading twice.
struct Accumulator<S> {
    store: Arc<S>,
    stats: Arc<PipelineStats>,
    settings: BatchSettings,
    buffer: Vec<PendingReading>,
    inflight: JoinSet<()>,
    inflight_ids: HashSet<task::Id>,
    deferred: Option<FlushTrigger>,
    /// Readings appended since start.
    pushed: u64,
    /// Readings handed to a write since start.
    taken: u64,
    flush_waiters: Vec<FlushWaiter>,
}

/// An on-demand flush, answered once every reading appended before it has been written.
struct FlushWaiter {
    done: oneshot::Sender<()>,
    target: u64,
    writes: HashSet<task::Id>,
}

impl<S: ReadingStore> Accumulator<S> {
    async fn run(mut self, mut rx: mpsc::Receiver<BatchCommand>) {
        let period = self.settings.flush_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.buffer.is_empty() {
                        tracing::debug!(count = self.buffer.len(), "flush interval elapsed with partial batch");
                        self.trigger(FlushTrigger::Interval);
                    }
                }
                Some(joined) = self.inflight.join_next_with_id(), if !self.inflight.is_empty() => {
                    self.completed(joined);
                    self.resume();
                    self.settle_waiters();
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(BatchCommand::Reading(pending)) => self.push(pending),
                        Some(BatchCommand::Flush(done)) => self.request_flush(done),
                        Some(BatchCommand::Shutdown(done)) => {
                            rx.close();
                            let mut waiters = vec![done];
                            while let Some(cmd) = rx.recv().await {
                                match cmd {
                                    BatchCommand::Reading(pending) => self.push_quiet(pending),
                                    BatchCommand::Flush(done) | BatchCommand::Shutdown(done) => {
                                        waiters.push(done)
                                    }
                                }
                            }
                            self.drain(FlushTrigger::Shutdown).await;
                            for done in waiters {
                                let _ = done.send(());
                            }
                            break;
                        }
                        None => {
                            self.drain(FlushTrigger::Shutdown).await;
                            break;
                        }
                    }
                }
            }
        }
        tracing::info!("reading batch worker stopped");
    }

    fn push(&mut self, pending: PendingReading) {
        self.push_quiet(pending);
        if self.buffer.len() >= self.settings.batch_size {
            self.trigger(FlushTrigger::Size);
        }
    }

    fn push_quiet(&mut self, pending: PendingReading) {
        self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
        self.pushed += 1;
        self.buffer.push(pending);
        self.stats
            .buffered
            .store(self.buffer.len() as u64, Ordering::Relaxed);
    }

    fn saturated(&self) -> bool {
        self.inflight.len() >= self.settings.max_inflight_flushes
    }

    fn trigger(&mut self, trigger: FlushTrigger) {
        if self.saturated() {
            if self.deferred.is_none() {
                tracing::debug!(
                    trigger = trigger.as_str(),
                    buffered = self.buffer.len(),
                    "writes saturated; deferring flush"
                );
                self.deferred = Some(trigger);
            }
            return;
        }
        self.spawn_write(trigger);
    }

    /// Writes are spawned like any other trigger; the caller is answered from
    /// `settle_waiters` so appends keep flowing meanwhile.
    fn request_flush(&mut self, done: oneshot::Sender<()>) {
        self.flush_waiters.push(FlushWaiter {
            done,
            target: self.pushed,
            writes: self.inflight_ids.clone(),
        });
        if self.saturated() && !self.buffer.is_empty() {
            tracing::debug!(buffered = self.buffer.len(), "writes saturated; deferring flush");
        }
        self.resume();
        self.settle_waiters();
    }

    fn demand_pending(&self) -> bool {
        self.flush_waiters
            .iter()
            .any(|waiter| self.taken < waiter.target)
    }

    /// Runs deferred triggers, full batches and outstanding on-demand flushes.
    fn resume(&mut self) {
        while !self.saturated() && !self.buffer.is_empty() {
            let trigger = match self.deferred.take() {
                Some(trigger) => trigger,
                None if self.buffer.len() >= self.settings.batch_size => FlushTrigger::Size,
                None if self.demand_pending() => FlushTrigger::Demand,
                None => break,
            };
            self.spawn_write(trigger);
        }
    }

    fn completed(&mut self, joined: Result<(task::Id, ()), JoinError>) {
        let id = match joined {
            Ok((id, ())) => id,
            Err(err) => {
                tracing::error!(error=%err, "reading batch write task failed");
                err.id()
            }
        };
        self.inflight_ids.remove(&id);
        for waiter in &mut self.flush_waiters {
            waiter.writes.remove(&id);
        }
    }

    fn settle_waiters(&mut self) {
        let taken = self.taken;
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.flush_waiters)
            .into_iter()
            .partition(|waiter| waiter.writes.is_empty() && taken >= waiter.target);
        self.flush_waiters = waiting;
        for waiter in ready {
            let _ = waiter.done.send(());
        }
    }

    async fn drain(&mut self, trigger: FlushTrigger) {
        self.deferred = None;
        while !self.buffer.is_empty() {
            while self.saturated() {
                match self.inflight.join_next_with_id().await {
                    Some(joined) => self.completed(joined),
                    None => break,
                }
            }
            self.spawn_write(trigger);
        }
        while let Some(joined) = self.inflight.join_next_with_id().await {
            self.completed(joined);
        }
        self.settle_waiters();
    }

    fn spawn_write(&mut self, trigger: FlushTrigger) {
        let batch = take_batch(&mut self.buffer, self.settings.batch_size);
        self.stats
            .buffered
            .store(self.buffer.len() as u64, Ordering::Relaxed);
        if batch.is_empty() {
            return;
        }
        let first = self.taken;
        self.taken += batch.len() as u64;
        self.stats.inflight_flushes.fetch_add(1, Ordering::Relaxed);
        let id = self
            .inflight
            .spawn(write_batch(
                self.store.clone(),
                batch,
                self.stats.clone(),
                trigger,
            ))
            .id();
        self.inflight_ids.insert(id);
        for waiter in &mut self.flush_waiters {
            if first < waiter.target {
                waiter.writes.insert(id);
            }
        }
    }
}

/// Takes the oldest `max` items, or the whole buffer when it holds no more than that.
fn take_batch<T>(buffer: &mut Vec<T>, max: usize) -> Vec<T> {
    if buffer.len() <= max {
        return std::mem::take(buffer);
    }
    let rest = buffer.split_off(max);
    std::mem::replace(buffer, rest)
}

async fn write_batch<S: ReadingStore>(
    store: Arc<S>,
    batch: Vec<PendingReading>,
    stats: Arc<PipelineStats>,
    trigger: FlushTrigger,
) {
    let started = Instant::now();
    let (readings, waiters): (Vec<Reading>, Vec<_>) = batch
        .into_iter()
        .map(|pending| (pending.reading, pending.done))
        .unzip();
    let len = readings.len();

    let result = store.save_batch(&readings).await;
    stats.inflight_flushes.fetch_sub(1, Ordering::Relaxed);

    match result {
        Ok(outcome) => {
            let elapsed = started.elapsed();
            stats.record_flush(len, elapsed);
            stats.clear_error();
            tracing::info!(
                count = len,
                inserted = outcome.inserted,
                updated = outcome.updated,
                trigger = trigger.as_str(),
                micros = elapsed.as_micros() as u64,
                "flushed readings batch"
            );
            for done in waiters {
                let _ = done.send(Ok(()));
            }
        }
        Err(err) => {
            let message = format!("{err:#}");
            stats.failed_batches_total.fetch_add(1, Ordering::Relaxed);
            stats.record_error(message.clone());
            tracing::error!(
                error = %message,
                count = len,
                trigger = trigger.as_str(),
                "failed to flush readings batch"
            );
            let failure = FlushError::Store(message);
            for done in waiters {
                let _ = done.send(Err(failure.clone()));
            }
        }
    }
}
