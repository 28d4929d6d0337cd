use async_trait::async_trait;

use crate::error::FetchError;

/// One planned upstream request: a contiguous window of leaf indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRequest {
    /// Position of this request in the global dispatch sequence. The
    /// assembler releases results strictly in this order.
    pub batch_index: u64,
    /// First leaf index covered by the request.
    pub start_index: u64,
    /// Number of leaf indexes covered.
    pub count: u64,
}

impl BatchRequest {
    /// Last leaf index covered, inclusive.
    pub fn end_index(&self) -> u64 {
        self.start_index + self.count - 1
    }
}

/// A log backend the range scheduler can pull batches of raw leaves from.
///
/// Implementations own their transport. Each call should draw a fresh
/// connection (and proxy, when a pool is configured) so that concurrent
/// batches spread across egress routes.
#[async_trait]
pub trait LeafSource: Send + Sync + 'static {
    type Batch: Send + 'static;

    async fn fetch_batch(&self, request: BatchRequest) -> Result<Self::Batch, FetchError>;
}
