use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tcafe_ingest_core::{
    BatchRequest, FetchError, LeafSource,
    http::{build_client, classify_decode_error, classify_error_response, classify_transport_error},
    proxy::ProxyPool,
};
use url::Url;

/// RFC 6962 get-sth response.
#[derive(Debug, Clone, Deserialize)]
pub struct SignedTreeHead {
    pub tree_size: u64,
    pub timestamp: u64,
    pub sha256_root_hash: String,
    pub tree_head_signature: String,
}

/// One element of a get-entries response, kept base64 encoded: the leaf is
/// the durable source of truth and is stored as received.
#[derive(Debug, Clone, Deserialize)]
pub struct RawCtEntry {
    pub leaf_input: String,
    #[serde(default)]
    pub extra_data: String,
}

#[derive(Debug, Deserialize)]
struct GetEntriesResponse {
    entries: Vec<RawCtEntry>,
}

/// Client for one CT log's HTTP API.
pub struct CtClient {
    base_url: String,
    log_id: String,
    proxy_pool: Option<Arc<ProxyPool>>,
}

impl CtClient {
    pub fn new(log_url: &Url, proxy_pool: Option<Arc<ProxyPool>>) -> Self {
        let base_url = log_url.as_str().trim_end_matches('/').to_string();
        // The stable log identity: host plus path, as given by the operator.
        let log_id = format!(
            "{}{}",
            log_url.host_str().unwrap_or_default(),
            log_url.path()
        );

        Self {
            base_url,
            log_id,
            proxy_pool,
        }
    }

    pub fn log_id(&self) -> &str {
        &self.log_id
    }

    pub async fn fetch_state(&self) -> Result<SignedTreeHead, FetchError> {
        let client = build_client(self.proxy_pool.as_deref())?;
        let url = format!("{}/ct/v1/get-sth", self.base_url);

        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|err| classify_transport_error(err, "get-sth"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error_response(status, &body, "get-sth"));
        }

        response
            .json::<SignedTreeHead>()
            .await
            .map_err(|err| classify_decode_error(err, "get-sth"))
    }

    /// Fetch leaves for `[start, end]` inclusive.
    ///
    /// An HTTP 400 carrying the log's "Bad Request" phrasing means the range
    /// is past the head and surfaces as `EndOfLog`; other 400s degrade to a
    /// transient error and the retry budget.
    pub async fn fetch_range(&self, start: u64, end: u64) -> Result<Vec<RawCtEntry>, FetchError> {
        let client = build_client(self.proxy_pool.as_deref())?;
        let url = format!(
            "{}/ct/v1/get-entries?start={start}&end={end}",
            self.base_url
        );

        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|err| classify_transport_error(err, "get-entries"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status == reqwest::StatusCode::BAD_REQUEST && body.contains("Bad Request") {
                return Err(FetchError::EndOfLog);
            }
            return Err(classify_error_response(status, &body, "get-entries"));
        }

        let decoded = response
            .json::<GetEntriesResponse>()
            .await
            .map_err(|err| classify_decode_error(err, "get-entries"))?;

        Ok(decoded.entries)
    }
}

#[async_trait]
impl LeafSource for CtClient {
    type Batch = Vec<RawCtEntry>;

    async fn fetch_batch(&self, request: BatchRequest) -> Result<Self::Batch, FetchError> {
        let entries = self
            .fetch_range(request.start_index, request.end_index())
            .await?;
        if entries.is_empty() {
            // Logs answer an in-range request with at least one entry; an
            // empty list only happens past the head.
            return Err(FetchError::EndOfLog);
        }
        Ok(entries)
    }
}
