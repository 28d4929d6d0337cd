use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tcafe_ingest_core::{
    BatchRequest, FetchError, LeafSource,
    http::{build_client, classify_decode_error, classify_error_response, classify_transport_error},
    proxy::ProxyPool,
};

use crate::types::{RekorLogEntry, RekorLogInfo, SearchLogQuery};

pub const DEFAULT_BASE_URL: &str = "https://rekor.sigstore.dev";

/// Hard upstream cap on `entries/retrieve`.
pub const MAX_RETRIEVE_BATCH: usize = 10;

/// Client for the Rekor HTTP API.
pub struct RekorClient {
    base_url: String,
    proxy_pool: Option<Arc<ProxyPool>>,
}

impl RekorClient {
    pub fn new(base_url: impl Into<String>, proxy_pool: Option<Arc<ProxyPool>>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            proxy_pool,
        }
    }

    pub async fn fetch_log_info(&self) -> Result<RekorLogInfo, FetchError> {
        let client = build_client(self.proxy_pool.as_deref())?;
        let url = format!("{}/api/v1/log", self.base_url);

        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|err| classify_transport_error(err, "log info"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error_response(status, &body, "log info"));
        }

        response
            .json::<RekorLogInfo>()
            .await
            .map_err(|err| classify_decode_error(err, "log info"))
    }

    /// Retrieve entries by global index, keyed by entry UUID.
    ///
    /// Requests above [`MAX_RETRIEVE_BATCH`] are a programming error, not a
    /// retryable condition.
    pub async fn fetch_by_indexes(
        &self,
        indexes: &[u64],
    ) -> Result<HashMap<String, RekorLogEntry>, FetchError> {
        if indexes.is_empty() {
            return Ok(HashMap::new());
        }
        if indexes.len() > MAX_RETRIEVE_BATCH {
            return Err(FetchError::BatchTooLarge {
                count: indexes.len(),
                limit: MAX_RETRIEVE_BATCH,
            });
        }

        let client = build_client(self.proxy_pool.as_deref())?;
        let url = format!("{}/api/v1/log/entries/retrieve", self.base_url);
        let query = SearchLogQuery {
            log_indexes: indexes.to_vec(),
        };

        let response = client
            .post(&url)
            .json(&query)
            .send()
            .await
            .map_err(|err| classify_transport_error(err, "entries/retrieve"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error_response(status, &body, "entries/retrieve"));
        }

        // Each element is a single-entry map of UUID to entry.
        let decoded = response
            .json::<Vec<HashMap<String, RekorLogEntry>>>()
            .await
            .map_err(|err| classify_decode_error(err, "entries/retrieve"))?;

        let mut entries = HashMap::new();
        for map in decoded {
            entries.extend(map);
        }
        Ok(entries)
    }
}

#[async_trait]
impl LeafSource for RekorClient {
    type Batch = HashMap<String, RekorLogEntry>;

    async fn fetch_batch(&self, request: BatchRequest) -> Result<Self::Batch, FetchError> {
        let indexes: Vec<u64> =
            (request.start_index..request.start_index + request.count).collect();
        self.fetch_by_indexes(&indexes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn oversized_requests_are_rejected_without_io() {
        let client = RekorClient::new("https://rekor.invalid", None);
        let indexes: Vec<u64> = (0..11).collect();
        let error = client.fetch_by_indexes(&indexes).await.unwrap_err();
        assert!(matches!(
            error,
            FetchError::BatchTooLarge {
                count: 11,
                limit: 10
            }
        ));
    }

    #[tokio::test]
    async fn empty_requests_short_circuit() {
        let client = RekorClient::new("https://rekor.invalid", None);
        let entries = client.fetch_by_indexes(&[]).await.unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn base_url_is_normalized() {
        let client = RekorClient::new("https://rekor.sigstore.dev/", None);
        assert_eq!("https://rekor.sigstore.dev", client.base_url);
    }
}
