//! Rekor ingester: mirrors the Sigstore transparency log into the columnar
//! store, resolving the multi-shard global index space and parsing
//! hashedrekord/rekord payloads.

pub mod checkpoint;
pub mod client;
pub mod entry;
pub mod pgp;
pub mod supervisor;
pub mod types;

pub use client::{DEFAULT_BASE_URL, MAX_RETRIEVE_BATCH, RekorClient};
pub use entry::{RekorEntryError, RekorRow, parse_rekor_entry};
pub use supervisor::{
    DEFAULT_CONCURRENCY, IngestError, MAX_CONCURRENCY, RekorIngestOptions, run_rekor_ingester,
};
pub use types::{InactiveShard, RekorLogEntry, RekorLogInfo};
