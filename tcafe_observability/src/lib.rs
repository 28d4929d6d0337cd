//! Logging initialization shared by the tcafe binaries.

use tracing::Subscriber;
use tracing_subscriber::{EnvFilter, Layer, prelude::*, registry::LookupSpan};

pub type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

/// Initialize the global tracing subscriber.
///
/// Logs go to stdout, filtered by `RUST_LOG` (default `info`). Setting
/// `RUST_LOG_FORMAT=json` switches to newline-delimited JSON for log
/// shippers.
pub fn init_observability() {
    tracing_subscriber::registry().with(stdout()).init();
}

fn stdout<S>() -> BoxedLayer<S>
where
    S: Subscriber,
    for<'a> S: LookupSpan<'a>,
{
    let log_env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_fmt = std::env::var("RUST_LOG_FORMAT")
        .map(|val| val == "json")
        .unwrap_or(false);

    if json_fmt {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .json()
            .with_filter(log_env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(log_env_filter)
            .boxed()
    }
}
