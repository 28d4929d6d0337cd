//! ClickHouse access for the tcafe ingesters.
//!
//! The store is deliberately a thin surface: a bulk insert of `Row`-derived
//! batches, a scalar max-index lookup used at resume, and a startup ping.
//! Schema, views and the query side live outside this process.

pub mod client;
pub mod error;

pub use client::StoreClient;
pub use error::{Result, StoreError};
