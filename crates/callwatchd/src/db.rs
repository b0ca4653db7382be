//! Shared SQL helpers for the CDR, lead and directory sources.

use std::time::Duration;

use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use thiserror::Error;
use tracing::info;

/// Connections per pool; every source issues one query at a time.
const MAX_CONNECTIONS: u32 = 3;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("invalid table name {0:?}")]
    InvalidIdentifier(String),
}

/// Opens a small MySQL pool.
pub async fn connect(database_url: &str) -> Result<MySqlPool, DbError> {
    let pool = MySqlPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await
        .map_err(DbError::Connect)?;
    info!("Database pool ready");
    Ok(pool)
}

/// Validates a table name from configuration and backtick-quotes it.
///
/// Table names cannot be bound as query parameters, so only
/// `[A-Za-z0-9_$]` is accepted.
pub fn quote_identifier(name: &str) -> Result<String, DbError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if valid {
        Ok(format!("`{name}`"))
    } else {
        Err(DbError::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("cdr_pbx").unwrap(), "`cdr_pbx`");
        assert!(quote_identifier("cdr; DROP TABLE x").is_err());
        assert!(quote_identifier("a`b").is_err());
        assert!(quote_identifier("").is_err());
    }
}
