use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use tcafe_ingest_core::{
    BatchWriter, ChunkExecutor, FetchError, RateGovernor, SinkError, SinkOptions, SinkWriteError,
    plan_chunk, proxy::ProxyPool, retry_operation, row_sink,
};
use tcafe_store::{StoreClient, StoreError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    client::{MAX_RETRIEVE_BATCH, RekorClient},
    entry::{RekorEntryError, RekorRow, parse_rekor_entry},
    types::{RekorLogEntry, RekorLogInfo},
};

pub const TABLE: &str = "rekor_log_entries";
pub const MAX_CONCURRENCY: usize = 500;
pub const DEFAULT_CONCURRENCY: usize = 20;

const DB_BATCH_SIZE: usize = 5_000;
const POLL_INTERVAL: Duration = Duration::from_secs(30);
const DISPATCH_DELAY: Duration = Duration::from_millis(10);

/// The log surface the fetch loop needs; tests substitute a mock.
#[async_trait]
pub trait RekorLog:
    tcafe_ingest_core::LeafSource<Batch = HashMap<String, RekorLogEntry>>
{
    async fn fetch_log_info(&self) -> std::result::Result<RekorLogInfo, FetchError>;
}

#[async_trait]
impl RekorLog for RekorClient {
    async fn fetch_log_info(&self) -> std::result::Result<RekorLogInfo, FetchError> {
        RekorClient::fetch_log_info(self).await
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum IngestError {
    #[snafu(display("invalid configuration: {message}"))]
    Config { message: String },
    #[snafu(display("store error"))]
    Store { source: StoreError },
    #[snafu(display("failed to fetch log state"))]
    State { source: FetchError },
    #[snafu(display("failed to resolve resume index"))]
    Resume { source: FetchError },
    /// Invariant violation: a row's checkpoint named a different tree.
    #[snafu(display("fatal entry invariant violation"))]
    Entry { source: RekorEntryError },
    #[snafu(display("sink failed"))]
    Sink { source: SinkError },
    #[snafu(display("sink task panicked"))]
    SinkJoin { source: tokio::task::JoinError },
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;

#[derive(Debug, Clone)]
pub struct RekorIngestOptions {
    pub base_url: String,
    /// `-1` resumes from the highest stored tree-local index.
    pub start_index: i64,
    pub batch_size: u64,
    pub concurrency: usize,
}

struct RekorRowWriter {
    store: StoreClient,
}

#[async_trait]
impl BatchWriter for RekorRowWriter {
    type Row = RekorRow;

    async fn write_rows(&mut self, rows: &[RekorRow]) -> std::result::Result<(), SinkWriteError> {
        self.store
            .insert_rows(TABLE, rows)
            .await
            .map_err(|err| SinkWriteError {
                message: err.to_string(),
            })
    }
}

/// Run the Rekor ingester until the token fires or a fatal error occurs.
pub async fn run_rekor_ingester(
    options: RekorIngestOptions,
    proxy_pool: Option<Arc<ProxyPool>>,
    ct: CancellationToken,
) -> Result<()> {
    validate_options(&options)?;
    let client = Arc::new(RekorClient::new(options.base_url.as_str(), proxy_pool));

    let store = StoreClient::from_env().context(StoreSnafu)?;
    store.ping().await.context(StoreSnafu)?;

    let governor = Arc::new(RateGovernor::new(options.concurrency));

    let log_info = retry_operation("fetch log info", Some(governor.as_ref()), &ct, || {
        let client = client.clone();
        async move { client.fetch_log_info().await }
    })
    .await
    .context(StateSnafu)?;

    info!(
        tree_id = log_info.tree_id,
        tree_size = log_info.tree_size,
        total_size = log_info.total_log_size(),
        inactive_shards = log_info.inactive_shards.len(),
        root_hash = log_info.root_hash,
        "fetched rekor log info"
    );
    for (position, shard) in log_info.inactive_shards.iter().enumerate() {
        info!(
            position,
            tree_id = shard.tree_id,
            tree_size = shard.tree_size,
            "inactive shard"
        );
    }

    let start_index = resolve_start_index(&options, &store, &log_info, &ct).await?;
    info!(global_start = start_index, "starting fetch loop");

    let (row_tx, sink) = row_sink(
        RekorRowWriter {
            store: store.clone(),
        },
        SinkOptions::new(DB_BATCH_SIZE),
    );
    let sink_task = tokio::spawn(sink.run(ct.clone()));

    let executor =
        ChunkExecutor::new(client.clone(), governor.clone()).with_dispatch_delay(DISPATCH_DELAY);
    let fetch_result = run_fetch_loop(
        &client,
        &executor,
        &governor,
        &row_tx,
        start_index,
        log_info,
        options.batch_size,
        &ct,
    )
    .await;

    if fetch_result.is_err() {
        // Fatal invariant violation: stop the workers, then let the sink
        // flush what was already emitted.
        ct.cancel();
    }

    drop(row_tx);
    let written = sink_task
        .await
        .context(SinkJoinSnafu)?
        .context(SinkSnafu)?;
    info!(rows = written, "rekor ingester finished");

    fetch_result
}

fn validate_options(options: &RekorIngestOptions) -> Result<()> {
    if options.start_index < -1 {
        return ConfigSnafu {
            message: "start_index must be non-negative, or -1 to resume".to_string(),
        }
        .fail();
    }
    if options.batch_size == 0 || options.batch_size > MAX_RETRIEVE_BATCH as u64 {
        return ConfigSnafu {
            message: format!("batch_size must be between 1 and {MAX_RETRIEVE_BATCH}"),
        }
        .fail();
    }
    if options.concurrency == 0 || options.concurrency > MAX_CONCURRENCY {
        return ConfigSnafu {
            message: format!("concurrency must be between 1 and {MAX_CONCURRENCY}"),
        }
        .fail();
    }
    Ok(())
}

async fn resolve_start_index(
    options: &RekorIngestOptions,
    store: &StoreClient,
    log_info: &RekorLogInfo,
    ct: &CancellationToken,
) -> Result<u64> {
    if options.start_index >= 0 {
        return Ok(options.start_index as u64);
    }

    let tree_id = log_info.tree_id.clone();
    let max = retry_operation("resolve resume index", None, ct, || {
        let tree_id = tree_id.clone();
        async move {
            store
                .max_index(TABLE, "log_index", "tree_id", &tree_id)
                .await
                .map_err(|err| FetchError::Transient {
                    message: err.to_string(),
                })
        }
    })
    .await
    .context(ResumeSnafu)?;

    let tree_local = max.map(|max| max + 1).unwrap_or(0);
    let global = log_info.global_index(tree_local);
    info!(
        tree_id = log_info.tree_id,
        tree_local, global, "resuming from the highest stored tree index"
    );
    Ok(global)
}

/// The Pulling/Polling loop over the global index space.
///
/// Entries are fetched by global index but persisted under the tree-local
/// index from their inclusion proof; the checkpoint on every row must name
/// the active tree or the loop unwinds fatally.
#[allow(clippy::too_many_arguments)]
pub async fn run_fetch_loop<L: RekorLog>(
    client: &Arc<L>,
    executor: &ChunkExecutor<L>,
    governor: &RateGovernor,
    row_tx: &mpsc::Sender<RekorRow>,
    start_index: u64,
    initial_log_info: RekorLogInfo,
    batch_size: u64,
    ct: &CancellationToken,
) -> Result<()> {
    let mut log_info = initial_log_info;
    let mut current_index = start_index;
    let mut next_batch_index = 0u64;

    loop {
        if ct.is_cancelled() {
            info!("fetch loop cancelled");
            return Ok(());
        }

        let total_size = log_info.total_log_size();
        if current_index >= total_size {
            info!(
                index = current_index,
                total_size, "caught up with the log, polling for new entries"
            );
            tokio::select! {
                _ = ct.cancelled() => return Ok(()),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }

            match retry_operation("refresh log info", Some(governor), ct, || {
                let client = client.clone();
                async move { client.fetch_log_info().await }
            })
            .await
            {
                Ok(refreshed) => {
                    if refreshed.total_log_size() > total_size {
                        info!(
                            previous = total_size,
                            current = refreshed.total_log_size(),
                            "log grew, resuming fetch"
                        );
                    }
                    log_info = refreshed;
                }
                Err(FetchError::Cancelled) => return Ok(()),
                Err(error) => {
                    warn!(error = %error, "failed to refresh log info, will poll again")
                }
            }
            continue;
        }

        let remaining = total_size - current_index;
        let plan = plan_chunk(
            current_index,
            next_batch_index,
            remaining,
            batch_size,
            governor.current(),
        );
        next_batch_index += plan.batches.len() as u64;

        let limit_events_before = governor.limit_events();
        let mut results = executor.run_chunk(plan, ct);
        let mut chunk_clean = true;

        while let Some(batch) = results.recv().await {
            let entries = match batch.result {
                Ok(entries) => entries,
                Err(FetchError::Cancelled) => return Ok(()),
                Err(error) => {
                    error!(
                        batch = batch.batch_index,
                        start = batch.start_index,
                        error = %error,
                        "batch failed after retries, rewinding to its start"
                    );
                    chunk_clean = false;
                    break;
                }
            };

            for global_index in batch.start_index..batch.start_index + batch.requested {
                let Some((uuid, entry)) = entries
                    .iter()
                    .find(|(_, entry)| entry.log_index == global_index)
                else {
                    warn!(global_index, "entry missing from batch result, skipping");
                    current_index = global_index + 1;
                    continue;
                };

                match parse_rekor_entry(uuid, entry, &log_info.tree_id) {
                    Ok(row) => {
                        tokio::select! {
                            biased;
                            _ = ct.cancelled() => return Ok(()),
                            sent = row_tx.send(row) => {
                                if sent.is_err() {
                                    warn!("sink queue closed, stopping fetch loop");
                                    return Ok(());
                                }
                            }
                        }
                    }
                    Err(fatal) => {
                        error!(
                            uuid,
                            global_index,
                            error = %fatal,
                            "fatal invariant violation, unwinding fetch loop"
                        );
                        return Err(fatal).context(EntrySnafu);
                    }
                }
                current_index = global_index + 1;
            }
        }
        drop(results);

        if chunk_clean && governor.limit_events() == limit_events_before {
            governor.on_chunk_success();
        }
    }
}
