use std::{sync::Arc, time::Duration};

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
use url::Url;

use crate::{
    client::{CtClient, RawCtEntry, SignedTreeHead},
    entry::{CtRow, parse_log_entry},
};

/// The log surface the fetch loop needs: range fetches through
/// [`tcafe_ingest_core::LeafSource`] plus the state endpoint and the stable
/// identity. Tests substitute a mock.
#[async_trait]
pub trait CtLog: tcafe_ingest_core::LeafSource<Batch = Vec<RawCtEntry>> {
    fn log_id(&self) -> &str;
    async fn fetch_state(&self) -> std::result::Result<SignedTreeHead, FetchError>;
}

#[async_trait]
impl CtLog for CtClient {
    fn log_id(&self) -> &str {
        CtClient::log_id(self)
    }

    async fn fetch_state(&self) -> std::result::Result<SignedTreeHead, FetchError> {
        CtClient::fetch_state(self).await
    }
}

pub const TABLE: &str = "ct_log_entries";
pub const MAX_BATCH_SIZE: u64 = 1024;

const DB_BATCH_SIZE: usize = 2_000;
const POLL_INTERVAL: Duration = Duration::from_secs(30);

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
    #[snafu(display("sink failed"))]
    Sink { source: SinkError },
    #[snafu(display("sink task panicked"))]
    SinkJoin { source: tokio::task::JoinError },
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;

#[derive(Debug, Clone)]
pub struct CtIngestOptions {
    pub log_url: String,
    /// `-1` resumes from the highest stored index.
    pub start_index: i64,
    pub batch_size: u64,
}

struct CtRowWriter {
    store: StoreClient,
}

#[async_trait]
impl BatchWriter for CtRowWriter {
    type Row = CtRow;

    async fn write_rows(&mut self, rows: &[CtRow]) -> std::result::Result<(), SinkWriteError> {
        self.store
            .insert_rows(TABLE, rows)
            .await
            .map_err(|err| SinkWriteError {
                message: err.to_string(),
            })
    }
}

/// Run the CT ingester until the token fires or a fatal error occurs.
pub async fn run_ct_ingester(
    options: CtIngestOptions,
    proxy_pool: Option<Arc<ProxyPool>>,
    ct: CancellationToken,
) -> Result<()> {
    let log_url = validate_options(&options)?;
    let client = Arc::new(CtClient::new(&log_url, proxy_pool));

    let store = StoreClient::from_env().context(StoreSnafu)?;
    store.ping().await.context(StoreSnafu)?;

    // The CT fetch path is serial; the governor still observes 429s so the
    // retry layer backs off coherently.
    let governor = Arc::new(RateGovernor::new(1));

    let sth = retry_operation("fetch signed tree head", Some(governor.as_ref()), &ct, || {
        let client = client.clone();
        async move { client.fetch_state().await }
    })
    .await
    .context(StateSnafu)?;

    info!(
        log_id = client.log_id(),
        tree_size = sth.tree_size,
        timestamp = sth.timestamp,
        root_hash = sth.sha256_root_hash,
        "fetched signed tree head"
    );

    let start_index = resolve_start_index(&options, &store, client.log_id(), &ct).await?;
    info!(start_index, "starting fetch loop");

    let (row_tx, sink) = row_sink(
        CtRowWriter {
            store: store.clone(),
        },
        SinkOptions::new(DB_BATCH_SIZE),
    );
    let sink_task = tokio::spawn(sink.run(ct.clone()));

    let executor = ChunkExecutor::new(client.clone(), governor.clone());
    let fetch_result = run_fetch_loop(
        &client,
        &executor,
        &governor,
        &row_tx,
        start_index,
        sth.tree_size,
        options.batch_size,
        &ct,
    )
    .await;

    // Closing the queue lets the sink flush its tail and exit.
    drop(row_tx);
    let written = sink_task
        .await
        .context(SinkJoinSnafu)?
        .context(SinkSnafu)?;
    info!(rows = written, "ct ingester finished");

    fetch_result
}

fn validate_options(options: &CtIngestOptions) -> Result<Url> {
    if options.start_index < -1 {
        return ConfigSnafu {
            message: "start_index must be non-negative, or -1 to resume".to_string(),
        }
        .fail();
    }
    if options.batch_size == 0 || options.batch_size > MAX_BATCH_SIZE {
        return ConfigSnafu {
            message: format!("batch_size must be between 1 and {MAX_BATCH_SIZE}"),
        }
        .fail();
    }

    let url = Url::parse(&options.log_url).map_err(|err| {
        ConfigSnafu {
            message: format!("invalid log_url: {err}"),
        }
        .build()
    })?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return ConfigSnafu {
            message: format!("log_url must be http or https, got {}", url.scheme()),
        }
        .fail();
    }

    Ok(url)
}

async fn resolve_start_index(
    options: &CtIngestOptions,
    store: &StoreClient,
    log_id: &str,
    ct: &CancellationToken,
) -> Result<u64> {
    if options.start_index >= 0 {
        return Ok(options.start_index as u64);
    }

    let max = retry_operation("resolve resume index", None, ct, || async move {
        store
            .max_index(TABLE, "log_index", "log_id", log_id)
            .await
            .map_err(|err| FetchError::Transient {
                message: err.to_string(),
            })
    })
    .await
    .context(ResumeSnafu)?;

    let start = max.map(|max| max + 1).unwrap_or(0);
    info!(log_id, start, "resuming from the highest stored index");
    Ok(start)
}

/// The Pulling/Polling loop: plans chunks, parses ordered results, feeds
/// the sink, and polls the tree head once caught up.
#[allow(clippy::too_many_arguments)]
pub async fn run_fetch_loop<L: CtLog>(
    client: &Arc<L>,
    executor: &ChunkExecutor<L>,
    governor: &RateGovernor,
    row_tx: &mpsc::Sender<CtRow>,
    start_index: u64,
    initial_tree_size: u64,
    batch_size: u64,
    ct: &CancellationToken,
) -> Result<()> {
    let mut tree_size = initial_tree_size;
    let mut current_index = start_index;
    let mut next_batch_index = 0u64;

    loop {
        if ct.is_cancelled() {
            info!("fetch loop cancelled");
            return Ok(());
        }

        if current_index >= tree_size {
            info!(
                index = current_index,
                tree_size, "caught up with the log, polling for new entries"
            );
            tokio::select! {
                _ = ct.cancelled() => return Ok(()),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }

            match retry_operation("refresh signed tree head", Some(governor), ct, || {
                let client = client.clone();
                async move { client.fetch_state().await }
            })
            .await
            {
                Ok(sth) => {
                    if sth.tree_size > tree_size {
                        info!(
                            previous = tree_size,
                            current = sth.tree_size,
                            "log grew, resuming fetch"
                        );
                        tree_size = sth.tree_size;
                    }
                }
                Err(FetchError::Cancelled) => return Ok(()),
                Err(error) => {
                    warn!(error = %error, "failed to refresh signed tree head, will poll again")
                }
            }
            continue;
        }

        let remaining = tree_size - current_index;
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
        let mut end_of_log = false;

        while let Some(batch) = results.recv().await {
            let entries = match batch.result {
                Ok(entries) => entries,
                Err(FetchError::EndOfLog) => {
                    end_of_log = true;
                    break;
                }
                Err(FetchError::Cancelled) => return Ok(()),
                Err(error) => {
                    // Stop the chunk here: emission stays strictly
                    // ascending and the next chunk replans from the
                    // failure start.
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

            let received = entries.len() as u64;
            for (offset, raw) in entries.iter().enumerate() {
                let index = batch.start_index + offset as u64;
                match parse_log_entry(raw, client.log_id(), index) {
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
                    Err(error) => {
                        warn!(index, error = %error, "skipping unparseable log entry");
                    }
                }
                current_index = index + 1;
            }

            if received < batch.requested {
                // Short read: the log capped the response. Replan from the
                // high-water mark rather than trusting the remaining
                // batches' offsets.
                chunk_clean = false;
                break;
            }
        }
        drop(results);

        if end_of_log {
            // The head receded below the announced size; poll until the
            // log grows past what we have.
            tree_size = current_index;
            continue;
        }

        if chunk_clean && governor.limit_events() == limit_events_before {
            governor.on_chunk_success();
        }
    }
}
