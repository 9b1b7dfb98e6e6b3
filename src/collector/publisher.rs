use crate::collector::{CollectorMetrics, PointBuffer};
use crate::error::DeliveryError;
use crate::point::{MetricPoint, to_line_protocol};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Destination for encoded line-protocol batches.
#[async_trait]
pub trait PointSink: Send + Sync {
    async fn write(&self, body: &[u8]) -> Result<(), DeliveryError>;
}

/// What to do with a batch the store would not take within the retry budget.
/// A batch the store rejects outright (a non-retryable error) is dropped under
/// either policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryPolicy {
    /// Drop the batch and count the loss.
    #[default]
    BestEffort,
    /// Put the batch back at the head of the buffer; it is retried on the
    /// next flush and may be delivered twice.
    AtLeastOnce,
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Maximum points held in memory before the oldest are dropped.
    pub capacity: usize,
    /// Maximum points per write request.
    pub batch_size: usize,
    /// How often the worker flushes on its own.
    pub flush_interval: Duration,
    /// Retries after the first attempt, for transient failures only.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub policy: DeliveryPolicy,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            capacity: 50_000,
            batch_size: 5_000,
            flush_interval: Duration::from_secs(1),
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            policy: DeliveryPolicy::BestEffort,
        }
    }
}

type Ack = oneshot::Sender<Result<usize, DeliveryError>>;

enum Command {
    Flush(Ack),
    Close(Ack),
}

/// Buffers points and ships them to a [`PointSink`] from a worker task.
///
/// `enqueue` never blocks. `flush` and `close` wait for the worker and
/// report how many points were delivered.
pub struct Publisher {
    buffer: PointBuffer,
    metrics: Arc<CollectorMetrics>,
    commands: mpsc::Sender<Command>,
    worker: JoinHandle<()>,
}

impl Publisher {
    /// Start the worker on the current tokio runtime.
    pub fn spawn(
        sink: Arc<dyn PointSink>,
        config: PublisherConfig,
        metrics: Arc<CollectorMetrics>,
    ) -> Self {
        let buffer = PointBuffer::new(config.capacity);
        let (commands, rx) = mpsc::channel(8);
        let worker = Worker {
            sink,
            buffer: buffer.clone(),
            config,
            metrics: metrics.clone(),
        };

        Self {
            buffer,
            metrics,
            commands,
            worker: tokio::spawn(worker.run(rx)),
        }
    }

    pub fn enqueue(&self, point: MetricPoint) {
        let evicted = self.buffer.push(point);
        self.metrics.points_enqueued.inc();
        if evicted > 0 {
            self.metrics.points_dropped.inc_by(evicted as u64);
        }
        self.metrics.buffered_points.set(self.buffer.len() as i64);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Deliver everything buffered so far.
    pub async fn flush(&self) -> Result<usize, DeliveryError> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Flush(ack))
            .await
            .map_err(|_| DeliveryError::WorkerStopped)?;
        done.await.map_err(|_| DeliveryError::WorkerStopped)?
    }

    /// Final flush, then stop and join the worker.
    pub async fn close(self) -> Result<usize, DeliveryError> {
        let (ack, done) = oneshot::channel();
        let result = match self.commands.send(Command::Close(ack)).await {
            Ok(()) => done.await.unwrap_or(Err(DeliveryError::WorkerStopped)),
            Err(_) => Err(DeliveryError::WorkerStopped),
        };
        if let Err(e) = self.worker.await {
            tracing::error!("Publisher worker panicked: {}", e);
        }
        result
    }
}

struct Worker {
    sink: Arc<dyn PointSink>,
    buffer: PointBuffer,
    config: PublisherConfig,
    metrics: Arc<CollectorMetrics>,
}

impl Worker {
    async fn run(self, mut commands: mpsc::Receiver<Command>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Flush(ack)) => {
                        let _ = ack.send(self.flush().await);
                    }
                    Some(Command::Close(ack)) => {
                        let result = self.flush().await;
                        match &result {
                            Ok(n) => tracing::info!("Shutdown: flushed {} buffered points", n),
                            Err(e) => tracing::error!("Shutdown: final flush failed: {}", e),
                        }
                        let _ = ack.send(result);
                        return;
                    }
                    None => {
                        if let Err(e) = self.flush().await {
                            tracing::error!("Publisher dropped, final flush failed: {}", e);
                        }
                        return;
                    }
                },
                _ = ticker.tick() => {
                    if self.buffer.is_empty() {
                        tracing::trace!("Buffer empty, waiting...");
                        continue;
                    }
                    if let Err(e) = self.flush().await {
                        tracing::warn!("Background flush failed: {}", e);
                    }
                }
            }
        }
    }

    async fn flush(&self) -> Result<usize, DeliveryError> {
        let mut points = self.buffer.drain_all();
        self.metrics.buffered_points.set(self.buffer.len() as i64);
        if points.is_empty() {
            return Ok(0);
        }
        tracing::debug!("Draining {} points from buffer", points.len());

        let batch_size = self.config.batch_size.max(1);
        let mut start = 0;
        let mut written = 0;
        let mut rejected = None;
        while start < points.len() {
            let end = (start + batch_size).min(points.len());
            let result = self.write_with_retry(&points[start..end]).await;
            match result {
                Ok(()) => {
                    self.metrics.points_written.inc_by((end - start) as u64);
                    written += end - start;
                }
                Err(e @ DeliveryError::RetriesExhausted { .. }) => {
                    self.metrics.write_failures.inc();
                    let unsent = points.split_off(start);
                    self.give_up(unsent, &e);
                    return Err(e);
                }
                Err(e) => {
                    // Permanent rejection: drop this batch, keep going.
                    self.metrics.write_failures.inc();
                    self.metrics.points_dropped.inc_by((end - start) as u64);
                    tracing::error!("Dropping {} rejected points: {}", end - start, e);
                    if rejected.is_none() {
                        rejected = Some(e);
                    }
                }
            }
            start = end;
        }

        tracing::debug!("Wrote {} points", written);
        match rejected {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Apply the delivery policy to points that ran out of retries.
    fn give_up(&self, unsent: Vec<MetricPoint>, cause: &DeliveryError) {
        let count = unsent.len();
        match self.config.policy {
            DeliveryPolicy::BestEffort => {
                self.metrics.points_dropped.inc_by(count as u64);
                tracing::error!("Dropping {} points: {}", count, cause);
            }
            DeliveryPolicy::AtLeastOnce => {
                let evicted = self.buffer.extend_front(unsent);
                self.metrics.points_dropped.inc_by(evicted as u64);
                self.metrics.buffered_points.set(self.buffer.len() as i64);
                tracing::warn!(
                    "Requeued {} points for the next flush: {}",
                    count - evicted,
                    cause
                );
            }
        }
    }

    async fn write_with_retry(&self, points: &[MetricPoint]) -> Result<(), DeliveryError> {
        let body = to_line_protocol(points);
        let mut backoff = self.config.initial_backoff;
        let mut attempts = 0;

        loop {
            attempts += 1;
            tracing::trace!("Writing {} points ({} bytes)", points.len(), body.len());

            let err = match self.sink.write(&body).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if !err.is_transient() {
                return Err(err);
            }
            if attempts > self.config.max_retries {
                return Err(DeliveryError::RetriesExhausted {
                    points: points.len(),
                    attempts,
                    last: Box::new(err),
                });
            }

            tracing::warn!(
                "Failed to write {} points: {}. Retrying in {:?}",
                points.len(),
                err,
                backoff
            );
            self.metrics.write_retries.inc();
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }
}
