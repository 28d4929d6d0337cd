//! Log-agnostic machinery shared by the tcafe ingesters.
//!
//! The pipeline is: a [`scheduler::ChunkExecutor`] fans per-request
//! sub-batches out to workers bounded by a semaphore sized from the
//! [`governor::RateGovernor`]; worker results flow through the ordered
//! assembler so downstream parsing always sees batches in dispatch order;
//! parsed rows are queued into a [`sink::RowSink`] which bulk-writes behind
//! retries and a circuit breaker.

pub mod assembler;
pub mod breaker;
pub mod error;
pub mod governor;
pub mod http;
pub mod proxy;
pub mod retry;
pub mod scheduler;
pub mod sink;
pub mod source;

pub use assembler::SequencedBatch;
pub use breaker::{BreakerState, CircuitBreaker};
pub use error::FetchError;
pub use governor::RateGovernor;
pub use proxy::{ProxyEntry, ProxyError, ProxyPool};
pub use retry::{RetryPolicy, retry_operation};
pub use scheduler::{ChunkExecutor, ChunkPlan, plan_chunk};
pub use sink::{BatchWriter, RowSink, SinkError, SinkOptions, SinkWriteError, row_sink};
pub use source::{BatchRequest, LeafSource};
