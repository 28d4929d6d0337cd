use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{Semaphore, mpsc},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    assembler::{SequencedBatch, run_assembler},
    governor::RateGovernor,
    retry::retry_operation,
    source::{BatchRequest, LeafSource},
};

/// Capacity of the ordered result channel handed to the consumer.
const RESULT_CHANNEL_CAPACITY: usize = 100;

/// One chunk of contiguous leaf indexes, split into per-request sub-batches.
#[derive(Debug)]
pub struct ChunkPlan {
    pub batches: Vec<BatchRequest>,
    pub start_index: u64,
    pub entry_count: u64,
}

impl ChunkPlan {
    pub fn first_batch_index(&self) -> u64 {
        self.batches.first().map(|b| b.batch_index).unwrap_or(0)
    }
}

/// Plan the next chunk: up to `concurrency * per_request` indexes starting
/// at `start_index`, bounded by `remaining`, as sub-batches of at most
/// `per_request` with strictly increasing batch indexes continuing from
/// `first_batch_index`.
pub fn plan_chunk(
    start_index: u64,
    first_batch_index: u64,
    remaining: u64,
    per_request: u64,
    concurrency: usize,
) -> ChunkPlan {
    let entry_count = remaining.min(per_request.saturating_mul(concurrency as u64));

    let mut batches = Vec::new();
    let mut batch_index = first_batch_index;
    let mut cursor = start_index;
    let chunk_end = start_index + entry_count;

    while cursor < chunk_end {
        let count = per_request.min(chunk_end - cursor);
        batches.push(BatchRequest {
            batch_index,
            start_index: cursor,
            count,
        });
        batch_index += 1;
        cursor += count;
    }

    ChunkPlan {
        batches,
        start_index,
        entry_count,
    }
}

/// Fans a chunk's sub-batches out to concurrent workers and hands back a
/// channel of results in dispatch order.
pub struct ChunkExecutor<S: LeafSource> {
    source: Arc<S>,
    governor: Arc<RateGovernor>,
    dispatch_delay: Duration,
}

impl<S: LeafSource> ChunkExecutor<S> {
    pub fn new(source: Arc<S>, governor: Arc<RateGovernor>) -> Self {
        Self {
            source,
            governor,
            dispatch_delay: Duration::ZERO,
        }
    }

    /// Pause between worker dispatches, to spread request starts.
    pub fn with_dispatch_delay(mut self, delay: Duration) -> Self {
        self.dispatch_delay = delay;
        self
    }

    /// Execute one chunk.
    ///
    /// Workers run behind a semaphore sized to the governor's current
    /// concurrency; their results flow through the ordered assembler into
    /// the returned receiver. Dropping the receiver early unwinds the
    /// in-flight workers. The channel closes once every sub-batch has been
    /// delivered (or on cancellation).
    pub fn run_chunk(
        &self,
        plan: ChunkPlan,
        ct: &CancellationToken,
    ) -> mpsc::Receiver<SequencedBatch<S::Batch>> {
        let concurrency = self.governor.current().max(1);
        let (raw_tx, raw_rx) = mpsc::channel(plan.batches.len().max(1));
        let (ordered_tx, ordered_rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);

        tokio::spawn(run_assembler(
            raw_rx,
            ordered_tx,
            plan.first_batch_index(),
            ct.clone(),
        ));

        debug!(
            start = plan.start_index,
            entries = plan.entry_count,
            batches = plan.batches.len(),
            concurrency,
            "dispatching chunk"
        );

        let source = self.source.clone();
        let governor = self.governor.clone();
        let dispatch_delay = self.dispatch_delay;
        let ct = ct.clone();

        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(concurrency));
            let mut workers = JoinSet::new();

            for request in plan.batches {
                let permit = tokio::select! {
                    biased;
                    _ = ct.cancelled() => break,
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let source = source.clone();
                let governor = governor.clone();
                let raw_tx = raw_tx.clone();
                let worker_ct = ct.clone();

                workers.spawn(async move {
                    let _permit = permit;
                    let result = retry_operation("batch fetch", Some(governor.as_ref()), &worker_ct, || {
                        let source = source.clone();
                        async move { source.fetch_batch(request).await }
                    })
                    .await;
                    let sequenced = SequencedBatch {
                        batch_index: request.batch_index,
                        start_index: request.start_index,
                        requested: request.count,
                        result,
                    };
                    tokio::select! {
                        biased;
                        _ = worker_ct.cancelled() => {}
                        _ = raw_tx.send(sequenced) => {}
                    }
                });

                if !dispatch_delay.is_zero() {
                    tokio::select! {
                        biased;
                        _ = ct.cancelled() => break,
                        _ = tokio::time::sleep(dispatch_delay) => {}
                    }
                }
            }

            drop(raw_tx);
            while workers.join_next().await.is_some() {}
        });

        ordered_rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plans_full_chunks() {
        let plan = plan_chunk(100, 7, 1_000, 10, 4);
        assert_eq!(40, plan.entry_count);
        assert_eq!(4, plan.batches.len());
        assert_eq!(7, plan.first_batch_index());
        assert_eq!(
            BatchRequest {
                batch_index: 7,
                start_index: 100,
                count: 10
            },
            plan.batches[0]
        );
        assert_eq!(
            BatchRequest {
                batch_index: 10,
                start_index: 130,
                count: 10
            },
            plan.batches[3]
        );
    }

    #[test]
    fn clamps_the_tail_chunk() {
        let plan = plan_chunk(95, 0, 17, 10, 4);
        assert_eq!(17, plan.entry_count);
        assert_eq!(2, plan.batches.len());
        assert_eq!(10, plan.batches[0].count);
        assert_eq!(7, plan.batches[1].count);
        assert_eq!(105, plan.batches[1].start_index);
        assert_eq!(111, plan.batches[1].end_index());
    }

    #[test]
    fn empty_when_nothing_remains() {
        let plan = plan_chunk(42, 3, 0, 10, 4);
        assert!(plan.batches.is_empty());
        assert_eq!(0, plan.entry_count);
    }
}
