use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;

/// The outcome of one worker's batch fetch, tagged with its dispatch
/// position so the assembler can restore order.
#[derive(Debug)]
pub struct SequencedBatch<T> {
    pub batch_index: u64,
    pub start_index: u64,
    /// Number of leaf indexes the originating request asked for.
    pub requested: u64,
    pub result: Result<T, FetchError>,
}

/// Reorders worker results and forwards them strictly by ascending
/// `batch_index`.
///
/// Results arrive out of order on `incoming`; each is buffered until the
/// next expected batch index is present, then released downstream. The task
/// ends (closing `outgoing` exactly once, by dropping it) when the workers
/// are done, when the downstream receiver goes away, or on cancellation.
pub async fn run_assembler<T: Send + 'static>(
    mut incoming: mpsc::Receiver<SequencedBatch<T>>,
    outgoing: mpsc::Sender<SequencedBatch<T>>,
    first_batch_index: u64,
    ct: CancellationToken,
) {
    let mut pending = BTreeMap::new();
    let mut next_expected = first_batch_index;

    loop {
        let batch = tokio::select! {
            biased;
            _ = ct.cancelled() => return,
            batch = incoming.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };

        pending.insert(batch.batch_index, batch);

        while let Some(ready) = pending.remove(&next_expected) {
            tokio::select! {
                biased;
                _ = ct.cancelled() => return,
                sent = outgoing.send(ready) => {
                    if sent.is_err() {
                        return;
                    }
                    next_expected += 1;
                }
            }
        }
    }

    // Workers are done; release whatever consecutive tail is buffered.
    while let Some(ready) = pending.remove(&next_expected) {
        tokio::select! {
            _ = ct.cancelled() => return,
            sent = outgoing.send(ready) => {
                if sent.is_err() {
                    return;
                }
                next_expected += 1;
            }
        }
    }
}
