use clap::Args;
use snafu::ResultExt;
use tcafe_ct::{CtIngestOptions, run_ct_ingester};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{CtSnafu, Result},
    proxy::ProxyArgs,
};

/// Mirror one Certificate Transparency log.
#[derive(Debug, Args)]
pub struct CtArgs {
    /// Base URL of the CT log (e.g. https://ct.googleapis.com/logs/us1/argon2025h2)
    #[arg(long)]
    log_url: String,
    /// Log entry index to start from; -1 resumes from the highest stored index
    #[arg(long, default_value_t = -1)]
    start_index: i64,
    /// Entries per get-entries request (at most 1024)
    #[arg(long, default_value_t = 1000)]
    batch_size: u64,
    #[clap(flatten)]
    proxy: ProxyArgs,
}

impl CtArgs {
    pub async fn run(self, ct: CancellationToken) -> Result<()> {
        let proxy_pool = self.proxy.load(&ct).await?;

        let options = CtIngestOptions {
            log_url: self.log_url,
            start_index: self.start_index,
            batch_size: self.batch_size,
        };

        run_ct_ingester(options, proxy_pool, ct)
            .await
            .context(CtSnafu)
    }
}
