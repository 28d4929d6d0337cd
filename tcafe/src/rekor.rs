use clap::Args;
use snafu::ResultExt;
use tcafe_rekor::{DEFAULT_BASE_URL, DEFAULT_CONCURRENCY, RekorIngestOptions, run_rekor_ingester};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{RekorSnafu, Result},
    proxy::ProxyArgs,
};

/// Mirror the Rekor transparency log.
#[derive(Debug, Args)]
pub struct RekorArgs {
    /// Base URL of the Rekor server
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    base_url: String,
    /// Global log index to start from; -1 resumes from the highest stored
    /// tree-local index
    #[arg(long, default_value_t = -1)]
    start_index: i64,
    /// Entries per retrieve request (the upstream caps this at 10)
    #[arg(long, default_value_t = 10)]
    batch_size: u64,
    /// Concurrent batch fetches (at most 500)
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,
    #[clap(flatten)]
    proxy: ProxyArgs,
}

impl RekorArgs {
    pub async fn run(self, ct: CancellationToken) -> Result<()> {
        let proxy_pool = self.proxy.load(&ct).await?;

        let options = RekorIngestOptions {
            base_url: self.base_url,
            start_index: self.start_index,
            batch_size: self.batch_size,
            concurrency: self.concurrency,
        };

        run_rekor_ingester(options, proxy_pool, ct)
            .await
            .context(RekorSnafu)
    }
}
