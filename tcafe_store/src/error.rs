use std::time::Duration;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    #[snafu(display("invalid {name} environment variable: {value}"))]
    InvalidEnv { name: &'static str, value: String },
    #[snafu(display("clickhouse {operation} failed"))]
    Query {
        operation: &'static str,
        source: clickhouse::error::Error,
    },
    #[snafu(display("clickhouse {operation} timed out after {timeout:?}"))]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
