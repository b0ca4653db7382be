//! Agent directory: maps SIP extensions to the humans behind them.
//!
//! The directory is reloaded on a fixed interval and pushed to the engine
//! as a whole. A failed reload keeps the previous entries.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::mysql::MySqlPool;
use sqlx::Row;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use callwatch_core::{sip_extension_from_code, AgentInfo, Extension};

use crate::db::{self, DbError};
use crate::engine::EngineHandle;

/// Agents keyed by SIP extension.
pub type AgentDirectory = HashMap<Extension, AgentInfo>;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("failed to read agent file {path:?}: {error}")]
    Read {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    #[error("failed to parse agent file {path:?}: {error}")]
    Parse {
        path: PathBuf,
        #[source]
        error: toml::de::Error,
    },

    #[error("agent query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error(transparent)]
    Db(#[from] DbError),
}

#[async_trait]
pub trait AgentDirectorySource: Send + Sync {
    /// Loads every agent that has a directory code.
    async fn load(&self) -> Result<Vec<AgentInfo>, DirectoryError>;
}

/// Keys agents by the extension derived from their code ("0602" -> "602").
pub fn build_directory(agents: Vec<AgentInfo>) -> AgentDirectory {
    agents
        .into_iter()
        .filter(|a| !a.code.trim().is_empty())
        .map(|a| (Extension::new(sip_extension_from_code(&a.code)), a))
        .collect()
}

// ============================================================================
// File Source
// ============================================================================

/// Agents listed in a TOML file:
///
/// ```toml
/// [[agents]]
/// id = "a-17"
/// name = "Jane Doe"
/// code = "0602"
/// ```
pub struct FileAgentDirectory {
    path: PathBuf,
}

#[derive(Deserialize)]
struct AgentFile {
    #[serde(default)]
    agents: Vec<AgentEntry>,
}

#[derive(Deserialize)]
struct AgentEntry {
    id: String,
    name: String,
    code: String,
}

impl FileAgentDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn parse(&self, content: &str) -> Result<Vec<AgentInfo>, DirectoryError> {
        let file: AgentFile = toml::from_str(content).map_err(|error| DirectoryError::Parse {
            path: self.path.clone(),
            error,
        })?;
        Ok(file
            .agents
            .into_iter()
            .map(|e| AgentInfo {
                id: e.id,
                display_name: e.name,
                code: e.code,
            })
            .collect())
    }
}

#[async_trait]
impl AgentDirectorySource for FileAgentDirectory {
    async fn load(&self) -> Result<Vec<AgentInfo>, DirectoryError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|error| DirectoryError::Read {
                path: self.path.clone(),
                error,
            })?;
        self.parse(&content)
    }
}

// ============================================================================
// MySQL Source
// ============================================================================

/// Agents stored in a SQL table with columns `id, name, code`.
pub struct MySqlAgentDirectory {
    pool: MySqlPool,
    table: String,
}

impl MySqlAgentDirectory {
    pub fn new(pool: MySqlPool, table: &str) -> Result<Self, DirectoryError> {
        Ok(Self {
            pool,
            table: db::quote_identifier(table)?,
        })
    }
}

#[async_trait]
impl AgentDirectorySource for MySqlAgentDirectory {
    async fn load(&self) -> Result<Vec<AgentInfo>, DirectoryError> {
        let sql = format!(
            "SELECT CAST(id AS CHAR) AS id, name, code FROM {} \
             WHERE code IS NOT NULL AND code <> ''",
            self.table
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut agents = Vec::with_capacity(rows.len());
        for row in rows {
            let name: Option<String> = row.try_get("name")?;
            agents.push(AgentInfo {
                id: row.try_get("id")?,
                display_name: name.unwrap_or_default(),
                code: row.try_get("code")?,
            });
        }
        Ok(agents)
    }
}

// ============================================================================
// Refresh Task
// ============================================================================

/// Loads the directory now and then every `every`, pushing it to the engine.
pub fn spawn_directory_refresh(
    source: Arc<dyn AgentDirectorySource>,
    engine: EngineHandle,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match source.load().await {
                Ok(agents) => {
                    let directory = build_directory(agents);
                    debug!(count = directory.len(), "Loaded agent directory");
                    if engine.replace_directory(directory).await.is_err() {
                        debug!("Directory refresh stopping: engine channel closed");
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Agent directory refresh failed, keeping previous entries");
                }
            }
        }
        info!("Agent directory refresh stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_directory_strips_leading_zeros() {
        let directory = build_directory(vec![
            AgentInfo {
                id: "a-1".to_string(),
                display_name: "Jane Doe".to_string(),
                code: "0602".to_string(),
            },
            AgentInfo {
                id: "a-2".to_string(),
                display_name: "No Code".to_string(),
                code: " ".to_string(),
            },
        ]);
        assert_eq!(directory.len(), 1);
        let jane = directory.get(&Extension::new("602")).unwrap();
        assert_eq!(jane.display_name, "Jane Doe");
        assert_eq!(jane.code, "0602");
    }

    #[tokio::test]
    async fn test_file_directory_loads_agents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.toml");
        std::fs::write(
            &path,
            r#"
            [[agents]]
            id = "a-1"
            name = "Jane Doe"
            code = "0602"

            [[agents]]
            id = "a-2"
            name = "Sam Roe"
            code = "605"
            "#,
        )
        .unwrap();

        let agents = FileAgentDirectory::new(&path).load().await.unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[1].display_name, "Sam Roe");
    }

    #[tokio::test]
    async fn test_file_directory_missing_file() {
        let source = FileAgentDirectory::new("/nonexistent/agents.toml");
        assert!(matches!(source.load().await, Err(DirectoryError::Read { .. })));
    }
}
