use std::{path::PathBuf, sync::Arc};

use clap::Args;
use snafu::ResultExt;
use tcafe_ingest_core::proxy::ProxyPool;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{ProxySnafu, Result};

/// Proxy flags shared by both ingesters. The two sources are mutually
/// exclusive; with neither, all traffic goes direct.
#[derive(Debug, Args)]
pub struct ProxyArgs {
    /// Path to a proxy list file (one host:port:username:password per line)
    #[arg(long, conflicts_with = "proxy_list_url")]
    proxy_file: Option<PathBuf>,
    /// URL to fetch the proxy list from, re-read every minute
    #[arg(long)]
    proxy_list_url: Option<String>,
}

impl ProxyArgs {
    pub async fn load(&self, ct: &CancellationToken) -> Result<Option<Arc<ProxyPool>>> {
        if let Some(path) = &self.proxy_file {
            let pool = ProxyPool::from_file(path).context(ProxySnafu)?;
            info!(proxies = pool.len(), "proxy mode enabled from file");
            return Ok(Some(pool));
        }
        if let Some(url) = &self.proxy_list_url {
            let pool = ProxyPool::from_url(url, ct).await.context(ProxySnafu)?;
            info!(proxies = pool.len(), "proxy mode enabled from url");
            return Ok(Some(pool));
        }
        info!("direct connection mode, no proxies configured");
        Ok(None)
    }
}
