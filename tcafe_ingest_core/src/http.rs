use std::time::Duration;

use crate::{
    error::{FetchError, MalformedSnafu, RateLimitedSnafu, TransientSnafu},
    proxy::ProxyPool,
};

/// Per-request timeout, covering connect through body.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Identifies the operator to upstream log operators.
pub const USER_AGENT: &str = "transparency.cafe (hello@su3.io)";

/// Longest slice of an upstream body kept in error messages and logs.
const BODY_SNIPPET_LEN: usize = 256;

/// Build a client for one batch fetch.
///
/// Called once per worker draw: when a pool is configured each in-flight
/// batch gets its own transport bound to the next proxy in rotation.
pub fn build_client(pool: Option<&ProxyPool>) -> Result<reqwest::Client, FetchError> {
    let mut builder = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(10)
        .user_agent(USER_AGENT);

    if let Some(entry) = pool.and_then(|pool| pool.next_proxy()) {
        let proxy = reqwest::Proxy::all(entry.proxy_url()).map_err(|err| {
            FetchError::Transient {
                message: format!("invalid proxy url for {}:{}: {err}", entry.host, entry.port),
            }
        })?;
        builder = builder.proxy(proxy);
    }

    builder.build().map_err(|err| FetchError::Transient {
        message: format!("failed to build http client: {err}"),
    })
}

/// Map a reqwest transport failure (timeout, connect, reset) onto the fetch
/// error taxonomy.
pub fn classify_transport_error(error: reqwest::Error, operation: &str) -> FetchError {
    TransientSnafu {
        message: format!("{operation}: {error}"),
    }
    .build()
}

/// Classify a non-success response by status and body.
///
/// 429s and bodies carrying the upstream's rate-limit phrasing map to
/// `RateLimited`; everything else is `Transient` and subject to the general
/// retry budget.
pub fn classify_error_response(
    status: reqwest::StatusCode,
    body: &str,
    operation: &str,
) -> FetchError {
    if is_rate_limit(status, body) {
        RateLimitedSnafu {
            message: format!("{operation}: status {status}: {}", snippet(body)),
        }
        .build()
    } else {
        TransientSnafu {
            message: format!("{operation}: status {status}: {}", snippet(body)),
        }
        .build()
    }
}

/// Map a JSON decode failure onto `Malformed`.
pub fn classify_decode_error(error: reqwest::Error, operation: &str) -> FetchError {
    MalformedSnafu {
        message: format!("{operation}: {error}"),
    }
    .build()
}

pub fn is_rate_limit(status: reqwest::StatusCode, body: &str) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || body.contains("429")
        || body.contains("Too Many Requests")
}

pub fn snippet(body: &str) -> &str {
    if body.len() <= BODY_SNIPPET_LEN {
        return body;
    }
    let mut end = BODY_SNIPPET_LEN;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
