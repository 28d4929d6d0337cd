use snafu::Snafu;

/// Classification of upstream fetch failures.
///
/// The retry layer dispatches on the variant: transient and malformed
/// responses consume the general retry budget, rate limits consume their own
/// budget with a shorter backoff cap, and `EndOfLog` is not an error at all
/// but a signal for the supervisor to start polling.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FetchError {
    #[snafu(display("transient network error: {message}"))]
    Transient { message: String },
    #[snafu(display("rate limited by upstream: {message}"))]
    RateLimited { message: String },
    #[snafu(display("reached the end of the log"))]
    EndOfLog,
    #[snafu(display("malformed upstream response: {message}"))]
    Malformed { message: String },
    #[snafu(display("requested {count} entries but the upstream caps requests at {limit}"))]
    BatchTooLarge { count: usize, limit: usize },
    #[snafu(display("fetch cancelled"))]
    Cancelled,
    #[snafu(display("fetch failed after {attempts} attempts: {source}"))]
    RetriesExhausted {
        attempts: u32,
        #[snafu(source(from(FetchError, Box::new)))]
        source: Box<FetchError>,
    },
}

impl FetchError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Transient { .. }
                | FetchError::RateLimited { .. }
                | FetchError::Malformed { .. }
        )
    }
}

pub type Result<T, E = FetchError> = std::result::Result<T, E>;
