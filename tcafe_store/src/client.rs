use std::time::Duration;

use serde::Serialize;
use snafu::ResultExt;
use tracing::info;

use crate::error::{InvalidEnvSnafu, QuerySnafu, Result, TimeoutSnafu};

const PING_TIMEOUT: Duration = Duration::from_secs(5);
const INSERT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection parameters are read from the environment:
/// `CLICKHOUSE_HOST`, `CLICKHOUSE_PORT`, `CLICKHOUSE_USER`,
/// `CLICKHOUSE_PASSWORD`, `CLICKHOUSE_DATABASE`.
#[derive(Clone)]
pub struct StoreClient {
    client: clickhouse::Client,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl StoreClient {
    pub fn from_env() -> Result<Self> {
        let host = env_or("CLICKHOUSE_HOST", "localhost");
        let port = env_or("CLICKHOUSE_PORT", "8123");
        let user = env_or("CLICKHOUSE_USER", "default");
        let password = env_or("CLICKHOUSE_PASSWORD", "");
        let database = env_or("CLICKHOUSE_DATABASE", "default");

        if port.parse::<u16>().is_err() {
            return InvalidEnvSnafu {
                name: "CLICKHOUSE_PORT",
                value: port,
            }
            .fail();
        }

        let url = format!("https://{host}:{port}");
        info!(url, database, user, "connecting to clickhouse");

        let client = clickhouse::Client::default()
            .with_url(url)
            .with_user(user)
            .with_password(password)
            .with_database(database);

        Ok(Self { client })
    }

    /// Verify connectivity once at startup.
    pub async fn ping(&self) -> Result<()> {
        let query = self.client.query("SELECT 1").fetch_one::<u8>();
        tokio::time::timeout(PING_TIMEOUT, query)
            .await
            .map_err(|_| {
                TimeoutSnafu {
                    operation: "ping",
                    timeout: PING_TIMEOUT,
                }
                .build()
            })?
            .context(QuerySnafu { operation: "ping" })?;
        Ok(())
    }

    /// Highest stored index for one log identity, or `None` when the log has
    /// no rows yet.
    pub async fn max_index(
        &self,
        table: &str,
        index_column: &str,
        scope_column: &str,
        scope: &str,
    ) -> Result<Option<u64>> {
        // GROUP BY yields no rows at all for an unseen log identity, which
        // keeps "no rows" distinct from a stored index of zero.
        let sql = format!(
            "SELECT max({index_column}) FROM {table} WHERE {scope_column} = ? GROUP BY {scope_column}"
        );

        self.client
            .query(&sql)
            .bind(scope)
            .fetch_optional::<u64>()
            .await
            .context(QuerySnafu {
                operation: "max_index",
            })
    }

    /// Bulk-insert one batch as a single statement.
    pub async fn insert_rows<R>(&self, table: &str, rows: &[R]) -> Result<()>
    where
        R: clickhouse::Row + Serialize,
    {
        let write = async {
            let mut insert = self.client.insert(table).context(QuerySnafu {
                operation: "insert",
            })?;
            for row in rows {
                insert.write(row).await.context(QuerySnafu {
                    operation: "insert",
                })?;
            }
            insert.end().await.context(QuerySnafu {
                operation: "insert",
            })
        };

        tokio::time::timeout(INSERT_TIMEOUT, write)
            .await
            .map_err(|_| {
                TimeoutSnafu {
                    operation: "insert",
                    timeout: INSERT_TIMEOUT,
                }
                .build()
            })?
    }
}
