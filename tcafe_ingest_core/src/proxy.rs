use std::{path::Path, sync::Arc, sync::RwLock, time::Duration};

use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::http;

/// How often a URL-backed pool re-reads its source.
pub const PROXY_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProxyError {
    #[snafu(display("failed to read proxy file {path}"))]
    ReadFile {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("no valid proxies found in {origin}"))]
    EmptyPool { origin: String },
    #[snafu(display("failed to fetch proxy list from {url}"))]
    FetchList { url: String, source: reqwest::Error },
    #[snafu(display("proxy list request to {url} returned status {status}"))]
    ListStatus {
        url: String,
        status: reqwest::StatusCode,
    },
}

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

/// One upstream HTTP proxy, as parsed from a `host:port:user:pass` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEntry {
    pub host: String,
    pub port: String,
    pub username: String,
    pub password: String,
}

impl ProxyEntry {
    pub fn proxy_url(&self) -> String {
        format!(
            "http://{}:{}@{}:{}",
            self.username, self.password, self.host, self.port
        )
    }
}

/// A rotating pool of egress proxies.
///
/// Readers draw entries round-robin; the background refresher swaps the
/// whole list atomically. Refresh failures keep the previous list.
pub struct ProxyPool {
    rotation: RwLock<Rotation>,
}

struct Rotation {
    entries: Vec<ProxyEntry>,
    next: usize,
}

impl ProxyPool {
    pub fn from_entries(entries: Vec<ProxyEntry>) -> Self {
        Self {
            rotation: RwLock::new(Rotation { entries, next: 0 }),
        }
    }

    /// Load a pool from a proxy list file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).context(ReadFileSnafu {
            path: path.display().to_string(),
        })?;
        let entries = parse_proxy_list(&content, &path.display().to_string())?;
        info!(count = entries.len(), path = %path.display(), "loaded proxy pool");
        Ok(Arc::new(Self::from_entries(entries)))
    }

    /// Load a pool from a URL and keep it fresh in the background until the
    /// cancellation token fires.
    pub async fn from_url(url: &str, ct: &CancellationToken) -> Result<Arc<Self>> {
        let entries = fetch_proxy_list(url).await?;
        info!(count = entries.len(), url, "loaded proxy pool");

        let pool = Arc::new(Self::from_entries(entries));
        tokio::spawn(refresh_loop(pool.clone(), url.to_string(), ct.clone()));

        Ok(pool)
    }

    /// The next proxy in round-robin order, if the pool is non-empty.
    pub fn next_proxy(&self) -> Option<ProxyEntry> {
        let mut rotation = self.rotation.write().expect("proxy pool lock poisoned");
        if rotation.entries.is_empty() {
            return None;
        }
        let index = rotation.next % rotation.entries.len();
        rotation.next = (index + 1) % rotation.entries.len();
        Some(rotation.entries[index].clone())
    }

    pub fn len(&self) -> usize {
        self.rotation
            .read()
            .expect("proxy pool lock poisoned")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn replace(&self, entries: Vec<ProxyEntry>) {
        let mut rotation = self.rotation.write().expect("proxy pool lock poisoned");
        rotation.entries = entries;
        rotation.next = 0;
    }
}

/// Parse `host:port:user:pass` lines. Comments (`#`) and blank lines are
/// skipped; malformed lines are logged and skipped.
pub fn parse_proxy_list(content: &str, origin: &str) -> Result<Vec<ProxyEntry>> {
    let mut entries = Vec::new();

    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() != 4 {
            warn!(
                origin,
                line = number + 1,
                "invalid proxy entry, expected host:port:username:password"
            );
            continue;
        }

        entries.push(ProxyEntry {
            host: parts[0].to_string(),
            port: parts[1].to_string(),
            username: parts[2].to_string(),
            password: parts[3].to_string(),
        });
    }

    if entries.is_empty() {
        return EmptyPoolSnafu { origin }.fail();
    }

    Ok(entries)
}

/// Fetch and parse a proxy list from a URL.
pub async fn fetch_proxy_list(url: &str) -> Result<Vec<ProxyEntry>> {
    let client = reqwest::Client::builder()
        .timeout(http::REQUEST_TIMEOUT)
        .user_agent(http::USER_AGENT)
        .build()
        .context(FetchListSnafu { url })?;

    let response = client
        .get(url)
        .send()
        .await
        .context(FetchListSnafu { url })?;

    let status = response.status();
    if !status.is_success() {
        return ListStatusSnafu { url, status }.fail();
    }

    let body = response.text().await.context(FetchListSnafu { url })?;
    parse_proxy_list(&body, url)
}

async fn refresh_loop(pool: Arc<ProxyPool>, url: String, ct: CancellationToken) {
    let mut ticker = tokio::time::interval(PROXY_REFRESH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ct.cancelled() => {
                info!("stopping proxy list refresh");
                return;
            }
            _ = ticker.tick() => {}
        }

        match fetch_proxy_list(&url).await {
            Ok(entries) => {
                let previous = pool.len();
                let current = entries.len();
                pool.replace(entries);
                if current != previous {
                    info!(current, previous, "refreshed proxy list");
                }
            }
            Err(error) => {
                warn!(url, error = %error, "failed to refresh proxy list, keeping previous pool");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST: &str = "\
# egress fleet
proxy-a.example.com:8080:alice:secret

proxy-b.example.com:8080:bob:hunter2
not-a-proxy-line
proxy-c.example.com:3128:carol:pw:extra
proxy-d.example.com:1080:dave:pw
";

    #[test]
    fn parses_and_skips_malformed_lines() {
        let entries = parse_proxy_list(LIST, "test").unwrap();
        assert_eq!(3, entries.len());
        assert_eq!("proxy-a.example.com", entries[0].host);
        assert_eq!("8080", entries[0].port);
        assert_eq!("alice", entries[0].username);
        assert_eq!("secret", entries[0].password);
        assert_eq!("proxy-d.example.com", entries[2].host);
    }

    #[test]
    fn empty_pool_is_an_error() {
        let result = parse_proxy_list("# comments only\n\n", "test");
        assert!(matches!(result, Err(ProxyError::EmptyPool { .. })));
    }

    #[test]
    fn proxy_url_embeds_credentials() {
        let entries = parse_proxy_list("h:1:u:p", "test").unwrap();
        assert_eq!("http://u:p@h:1", entries[0].proxy_url());
    }

    #[test]
    fn round_robin_is_fair() {
        let entries = parse_proxy_list(LIST, "test").unwrap();
        let pool = ProxyPool::from_entries(entries.clone());

        let mut counts = vec![0usize; entries.len()];
        for _ in 0..100 {
            let drawn = pool.next_proxy().unwrap();
            let position = entries.iter().position(|e| *e == drawn).unwrap();
            counts[position] += 1;
        }

        // Over 100 draws from 3 proxies each share is within one of 100/3.
        for count in counts {
            assert!((33..=34).contains(&count), "unbalanced draw count {count}");
        }
    }

    #[test]
    fn replace_resets_the_rotation() {
        let pool = ProxyPool::from_entries(parse_proxy_list("a:1:u:p\nb:2:u:p", "test").unwrap());
        assert_eq!("a", pool.next_proxy().unwrap().host);
        pool.replace(parse_proxy_list("c:3:u:p", "test").unwrap());
        assert_eq!("c", pool.next_proxy().unwrap().host);
        assert_eq!(1, pool.len());
    }

    #[test]
    fn loads_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(LIST.as_bytes()).unwrap();

        let pool = ProxyPool::from_file(file.path()).unwrap();
        assert_eq!(3, pool.len());
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = ProxyPool::from_file("/nonexistent/proxies.txt");
        assert!(matches!(result, Err(ProxyError::ReadFile { .. })));
    }
}
