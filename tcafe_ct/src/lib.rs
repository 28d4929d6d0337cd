//! Certificate Transparency ingester: mirrors an RFC 6962 log into the
//! columnar store, one parsed row per leaf.

pub mod client;
pub mod entry;
pub mod leaf;
pub mod supervisor;
mod wire;

pub use client::{CtClient, RawCtEntry, SignedTreeHead};
pub use entry::{CtRow, parse_log_entry};
pub use supervisor::{CtIngestOptions, IngestError, MAX_BATCH_SIZE, run_ct_ingester};
