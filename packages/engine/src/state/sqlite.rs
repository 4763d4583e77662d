// packages/engine/src/state/sqlite.rs
//! SQLite-backed repositories
//!
//! Every aggregate is stored as a JSON document keyed by `(kind, id)`,
//! with its status and version lifted into columns for filtering.

use crate::consensus::coordinator::ConsensusRequest;
use crate::executor::workflow::Workflow;
use crate::runtime::lifecycle::ManagedAgentInstance;
use crate::state::{ConsensusRepository, InstanceRepository, WorkflowRepository};
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::{InstanceId, RequestId, WorkflowId};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

const WORKFLOW: &str = "workflow";
const CONSENSUS: &str = "consensus";
const INSTANCE: &str = "instance";

pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::StorageFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let conn = Connection::open(path)
            .map_err(|e| EngineError::StorageFailed(format!("Failed to open database: {}", e)))?;
        init_schema(&conn)?;

        info!("State storage initialized at {:?}", path);
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Number of stored documents of every kind
    pub async fn document_count(&self) -> Result<u64> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    async fn put<T: Serialize>(
        &self,
        kind: &str,
        id: String,
        status: &str,
        version: u64,
        doc: &T,
    ) -> Result<()> {
        let body = serde_json::to_string(doc)?;
        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT INTO documents (kind, id, status, version, body, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(kind, id) DO UPDATE SET
                status = excluded.status,
                version = excluded.version,
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
            params![
                kind,
                id,
                status,
                version as i64,
                body,
                chrono::Utc::now().timestamp_millis(),
            ],
        )
        .map_err(|e| EngineError::StorageFailed(format!("Failed to save {} {}: {}", kind, id, e)))?;

        debug!("Saved {} {} ({})", kind, id, status);
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, kind: &str, id: String) -> Result<Option<T>> {
        let db = self.db.lock().await;
        let body: Option<String> = db
            .query_row(
                "SELECT body FROM documents WHERE kind = ?1 AND id = ?2",
                params![kind, id],
                |row| row.get(0),
            )
            .optional()?;

        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    async fn list_in<T: DeserializeOwned>(&self, kind: &str, statuses: &[&str]) -> Result<Vec<T>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT status, body FROM documents WHERE kind = ?1 ORDER BY updated_at, id",
        )?;

        let rows = stmt
            .query_map(params![kind], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .filter(|(status, _)| statuses.contains(&status.as_str()))
            .map(|(_, body)| serde_json::from_str(&body).map_err(EngineError::from))
            .collect()
    }

    async fn remove(&self, kind: &str, id: String) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "DELETE FROM documents WHERE kind = ?1 AND id = ?2",
            params![kind, id],
        )?;
        Ok(())
    }

    async fn stored_version(&self, kind: &str, id: String) -> Result<Option<u64>> {
        let db = self.db.lock().await;
        let version: Option<i64> = db
            .query_row(
                "SELECT version FROM documents WHERE kind = ?1 AND id = ?2",
                params![kind, id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.map(|v| v as u64))
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            kind TEXT NOT NULL,
            id TEXT NOT NULL,
            status TEXT NOT NULL,
            version INTEGER NOT NULL,
            body TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (kind, id)
        )
        "#,
        [],
    )
    .map_err(|e| EngineError::StorageFailed(format!("Schema creation failed: {}", e)))?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(kind, status)",
        [],
    )
    .map_err(|e| EngineError::StorageFailed(format!("Index creation failed: {}", e)))?;

    Ok(())
}

#[async_trait]
impl WorkflowRepository for SqliteStore {
    async fn save(&self, workflow: &Workflow) -> Result<()> {
        let status = workflow.status.to_string();
        self.put(WORKFLOW, workflow.id.to_string(), &status, 0, workflow)
            .await
    }

    async fn find_by_id(&self, id: WorkflowId) -> Result<Option<Workflow>> {
        self.get(WORKFLOW, id.to_string()).await
    }

    async fn find_active(&self) -> Result<Vec<Workflow>> {
        self.list_in(WORKFLOW, &["pending", "running"]).await
    }

    async fn delete(&self, id: WorkflowId) -> Result<()> {
        self.remove(WORKFLOW, id.to_string()).await
    }
}

#[async_trait]
impl ConsensusRepository for SqliteStore {
    async fn save(&self, request: &ConsensusRequest) -> Result<()> {
        let id = request.id.to_string();
        if let Some(stored) = self.stored_version(CONSENSUS, id.clone()).await? {
            if stored > request.version {
                return Err(EngineError::ConcurrencyConflict(format!(
                    "consensus {} version {} is older than stored version {}",
                    request.id, request.version, stored
                )));
            }
        }

        let status = if request.is_finalized() { "finalized" } else { "open" };
        self.put(CONSENSUS, id, status, request.version, request).await
    }

    async fn find_by_id(&self, id: RequestId) -> Result<Option<ConsensusRequest>> {
        self.get(CONSENSUS, id.to_string()).await
    }

    async fn find_pending(&self) -> Result<Vec<ConsensusRequest>> {
        self.list_in(CONSENSUS, &["open"]).await
    }
}

#[async_trait]
impl InstanceRepository for SqliteStore {
    async fn save(&self, instance: &ManagedAgentInstance) -> Result<()> {
        let status = instance.status.to_string();
        self.put(INSTANCE, instance.id.to_string(), &status, 0, instance)
            .await
    }

    async fn find_by_id(&self, id: InstanceId) -> Result<Option<ManagedAgentInstance>> {
        self.get(INSTANCE, id.to_string()).await
    }

    async fn find_active(&self) -> Result<Vec<ManagedAgentInstance>> {
        self.list_in(INSTANCE, &["creating", "active", "paused"]).await
    }

    async fn delete(&self, id: InstanceId) -> Result<()> {
        self.remove(INSTANCE, id.to_string()).await
    }
}
