use std::time::Duration;

use async_trait::async_trait;
use snafu::Snafu;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    breaker::CircuitBreaker,
    retry::RetryPolicy,
};

/// Writes one accumulated batch of rows to the store.
#[async_trait]
pub trait BatchWriter: Send + 'static {
    type Row: Send + 'static;

    async fn write_rows(&mut self, rows: &[Self::Row]) -> Result<(), SinkWriteError>;
}

/// A single write attempt failed. Carries the downstream's rendered error;
/// the sink decides whether to retry.
#[derive(Debug, Snafu)]
#[snafu(display("{message}"))]
pub struct SinkWriteError {
    pub message: String,
}

#[derive(Debug, Snafu)]
pub enum SinkError {
    /// A batch could not be written within the retry budget. Fatal: the
    /// operator must investigate the store.
    #[snafu(display("batch of {rows} rows failed after {attempts} attempts: {message}"))]
    RetriesExhausted {
        rows: usize,
        attempts: u32,
        message: String,
    },
}

pub type Result<T, E = SinkError> = std::result::Result<T, E>;

#[derive(Debug, Clone)]
pub struct SinkOptions {
    /// Rows accumulated before a flush is forced.
    pub batch_size: usize,
    /// Longest a partial batch may sit before being flushed.
    pub batch_timeout: Duration,
    /// Capacity of the ingestion queue feeding the sink.
    pub queue_capacity: usize,
    /// Backoff schedule for failed flush attempts.
    pub insert_retry: RetryPolicy,
}

impl SinkOptions {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            batch_timeout: Duration::from_secs(5),
            queue_capacity: 5_000,
            insert_retry: RetryPolicy::transport(),
        }
    }
}

/// The single consumer of parsed rows: batches them and bulk-writes to the
/// store behind retries and a circuit breaker.
pub struct RowSink<W: BatchWriter> {
    writer: W,
    options: SinkOptions,
    breaker: CircuitBreaker,
    rx: mpsc::Receiver<W::Row>,
    rows_written: u64,
}

/// Create the ingestion queue and its sink.
pub fn row_sink<W: BatchWriter>(writer: W, options: SinkOptions) -> (mpsc::Sender<W::Row>, RowSink<W>) {
    let (tx, rx) = mpsc::channel(options.queue_capacity);
    let sink = RowSink {
        writer,
        options,
        breaker: CircuitBreaker::new(),
        rx,
        rows_written: 0,
    };
    (tx, sink)
}

impl<W: BatchWriter> RowSink<W> {
    /// Drain the queue until it closes or the token fires; returns the total
    /// number of rows committed.
    ///
    /// On cancellation the sink drains at most twice the batch size of
    /// residual rows, flushes once more, and exits. An exhausted flush is
    /// fatal and propagates.
    pub async fn run(mut self, ct: CancellationToken) -> Result<u64> {
        let mut batch: Vec<W::Row> = Vec::with_capacity(self.options.batch_size);
        let mut flush_timer = tokio::time::interval(self.options.batch_timeout);
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        flush_timer.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = ct.cancelled() => {
                    self.drain_remaining(&mut batch);
                    self.flush(&mut batch).await?;
                    info!(rows = self.rows_written, "sink shutting down after cancellation");
                    return Ok(self.rows_written);
                }
                row = self.rx.recv() => match row {
                    None => {
                        self.flush(&mut batch).await?;
                        info!(rows = self.rows_written, "sink shutting down, queue closed");
                        return Ok(self.rows_written);
                    }
                    Some(row) => {
                        batch.push(row);
                        if batch.len() >= self.options.batch_size {
                            self.flush(&mut batch).await?;
                            flush_timer.reset();
                        }
                    }
                },
                _ = flush_timer.tick() => {
                    self.flush(&mut batch).await?;
                }
            }
        }
    }

    /// Pull already-queued rows without waiting, bounded so shutdown cannot
    /// stall behind an arbitrarily deep queue.
    fn drain_remaining(&mut self, batch: &mut Vec<W::Row>) {
        let limit = self.options.batch_size * 2;
        while batch.len() < limit {
            match self.rx.try_recv() {
                Ok(row) => batch.push(row),
                Err(_) => break,
            }
        }
    }

    async fn flush(&mut self, batch: &mut Vec<W::Row>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let policy = self.options.insert_retry;
        let mut attempt = 0u32;

        loop {
            let failure = if self.breaker.can_execute() {
                match self.writer.write_rows(batch).await {
                    Ok(()) => {
                        self.breaker.record_success();
                        self.rows_written += batch.len() as u64;
                        info!(rows = batch.len(), "inserted batch");
                        batch.clear();
                        return Ok(());
                    }
                    Err(error) => {
                        self.breaker.record_failure();
                        error.message
                    }
                }
            } else {
                "circuit breaker is open, rejecting batch write".to_string()
            };

            attempt += 1;
            if attempt >= policy.max_attempts {
                return RetriesExhaustedSnafu {
                    rows: batch.len(),
                    attempts: attempt,
                    message: failure,
                }
                .fail();
            }

            let delay = policy.delay_for(attempt - 1);
            warn!(
                rows = batch.len(),
                attempt,
                error = %failure,
                ?delay,
                "batch insert failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
