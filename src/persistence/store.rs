//! SQLite-based persistence stores

use crate::core::{
    error::{EngineError, Result},
    node_execution::NodeExecution,
    state::PlanStatus,
};
use crate::persistence::{ExecutionSummary, NodeExecutionStore, PlanHistoryStore};
use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{
    sqlite::{SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};
use uuid::Uuid;

/// Convert DateTime<Utc> to NaiveDateTime for SQLite
fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
    dt.naive_utc()
}

/// Convert NaiveDateTime to DateTime<Utc>
fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
    DateTime::from_naive_utc_and_offset(dt, Utc)
}

fn persistence(context: &str) -> impl Fn(sqlx::Error) -> EngineError + '_ {
    move |e| EngineError::Persistence(format!("{}: {}", context, e))
}

async fn connect(db_path: &str) -> anyhow::Result<SqlitePool> {
    // every connection to :memory: opens a fresh database
    let max_connections = if db_path == ":memory:" { 1 } else { 5 };
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect(&format!("sqlite:{}", db_path))
        .await
        .context("Failed to connect to database")
}

/// Node executions stored as JSON bodies with indexed lookup columns
pub struct SqliteNodeExecutionStore {
    pool: SqlitePool,
}

impl SqliteNodeExecutionStore {
    /// Create a new SQLite store
    pub async fn new(db_path: &str) -> anyhow::Result<Self> {
        let store = Self {
            pool: connect(db_path).await?,
        };
        store.init().await?;
        Ok(store)
    }

    /// Initialize database schema
    async fn init(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS node_executions (
                id TEXT PRIMARY KEY,
                plan_execution_id TEXT NOT NULL,
                parent_id TEXT,
                status TEXT NOT NULL,
                version INTEGER NOT NULL,
                deadline TEXT,
                created_at TEXT NOT NULL,
                body TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_node_plan ON node_executions(plan_execution_id);
            CREATE INDEX IF NOT EXISTS idx_node_parent ON node_executions(parent_id);
            CREATE INDEX IF NOT EXISTS idx_node_status ON node_executions(status);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create node_executions table")?;

        Ok(())
    }

    fn body(node: &NodeExecution) -> Result<String> {
        serde_json::to_string(node)
            .map_err(|e| EngineError::Persistence(format!("encode node execution: {}", e)))
    }

    fn decode(row: &SqliteRow) -> Result<NodeExecution> {
        let body: String = row.get("body");
        let mut node: NodeExecution = serde_json::from_str(&body)
            .map_err(|e| EngineError::Persistence(format!("decode node execution: {}", e)))?;
        node.version = row.get::<i64, _>("version") as u64;
        Ok(node)
    }

    async fn fetch_where(&self, clause: &str, bind: Option<String>) -> Result<Vec<NodeExecution>> {
        let sql = format!(
            "SELECT version, body FROM node_executions WHERE {} ORDER BY created_at ASC",
            clause
        );
        let mut query = sqlx::query(&sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(persistence("list node executions"))?;
        rows.iter().map(Self::decode).collect()
    }
}

#[async_trait::async_trait]
impl NodeExecutionStore for SqliteNodeExecutionStore {
    async fn insert(&self, node: &NodeExecution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO node_executions
            (id, plan_execution_id, parent_id, status, version, deadline, created_at, body)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(node.id.to_string())
        .bind(node.plan_execution_id.to_string())
        .bind(node.parent_id.map(|p| p.to_string()))
        .bind(node.status.to_string())
        .bind(node.version as i64)
        .bind(node.deadline.map(to_naive))
        .bind(to_naive(node.created_at))
        .bind(Self::body(node)?)
        .execute(&self.pool)
        .await
        .map_err(persistence("insert node execution"))?;

        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<NodeExecution> {
        let row = sqlx::query("SELECT version, body FROM node_executions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(persistence("load node execution"))?;

        match row {
            Some(row) => Self::decode(&row),
            None => Err(EngineError::NotFound(id)),
        }
    }

    async fn save(&self, node: &NodeExecution) -> Result<u64> {
        let version = node.version + 1;
        let mut stored = node.clone();
        stored.version = version;

        let result = sqlx::query(
            r#"
            UPDATE node_executions
            SET status = ?1, version = ?2, deadline = ?3, body = ?4
            WHERE id = ?5 AND version = ?6
            "#,
        )
        .bind(stored.status.to_string())
        .bind(version as i64)
        .bind(stored.deadline.map(to_naive))
        .bind(Self::body(&stored)?)
        .bind(node.id.to_string())
        .bind(node.version as i64)
        .execute(&self.pool)
        .await
        .map_err(persistence("save node execution"))?;

        if result.rows_affected() == 0 {
            // either gone or moved on
            self.load(node.id).await?;
            return Err(EngineError::StateConflict {
                id: node.id,
                expected: node.version,
            });
        }

        Ok(version)
    }

    async fn list_by_plan(&self, plan_execution_id: Uuid) -> Result<Vec<NodeExecution>> {
        self.fetch_where("plan_execution_id = ?1", Some(plan_execution_id.to_string()))
            .await
    }

    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<NodeExecution>> {
        self.fetch_where("parent_id = ?1", Some(parent_id.to_string()))
            .await
    }

    async fn list_waiting(&self) -> Result<Vec<NodeExecution>> {
        self.fetch_where(
            "status IN ('TASK_WAITING', 'ASYNC_WAITING', 'CHILD_WAITING') AND deadline IS NOT NULL",
            None,
        )
        .await
    }
}

/// SQLite plan history store
pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    /// Create a new SQLite store
    pub async fn new(db_path: &str) -> anyhow::Result<Self> {
        let store = Self {
            pool: connect(db_path).await?,
        };
        store.init().await?;
        Ok(store)
    }

    /// Create store with default path
    pub async fn with_default_path() -> anyhow::Result<Self> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("orchestrator");
        std::fs::create_dir_all(&db_dir)
            .with_context(|| format!("Failed to create {}", db_dir.display()))?;

        let db_path = db_dir.join("history.db");
        let db_path = db_path
            .to_str()
            .context("Database path is not valid UTF-8")?;
        Self::new(&format!("{}?mode=rwc", db_path)).await
    }

    /// Initialize database schema
    async fn init(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                plan_name TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                progress REAL NOT NULL DEFAULT 0.0,
                completed_nodes INTEGER NOT NULL DEFAULT 0,
                failed_nodes INTEGER NOT NULL DEFAULT 0,
                total_nodes INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_plan_name ON executions(plan_name);
            CREATE INDEX IF NOT EXISTS idx_started_at ON executions(started_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn summary(row: &SqliteRow) -> anyhow::Result<ExecutionSummary> {
        let status: String = row.get("status");
        Ok(ExecutionSummary {
            execution_id: Uuid::parse_str(&row.get::<String, _>("id"))?,
            plan_name: row.get("plan_name"),
            status: PlanStatus::parse(&status)
                .with_context(|| format!("Unknown plan status '{}'", status))?,
            started_at: from_naive(row.get("started_at")),
            completed_at: row
                .get::<Option<NaiveDateTime>, _>("completed_at")
                .map(from_naive),
            progress: row.get("progress"),
            completed_nodes: row.get::<i64, _>("completed_nodes") as usize,
            failed_nodes: row.get::<i64, _>("failed_nodes") as usize,
            total_nodes: row.get::<i64, _>("total_nodes") as usize,
        })
    }
}

#[async_trait::async_trait]
impl PlanHistoryStore for SqliteHistoryStore {
    async fn save_execution(&self, execution: &ExecutionSummary) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO executions
            (id, plan_name, status, started_at, completed_at, progress, completed_nodes, failed_nodes, total_nodes)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(execution.execution_id.to_string())
        .bind(&execution.plan_name)
        .bind(execution.status.as_str())
        .bind(to_naive(execution.started_at))
        .bind(execution.completed_at.map(to_naive))
        .bind(execution.progress)
        .bind(execution.completed_nodes as i64)
        .bind(execution.failed_nodes as i64)
        .bind(execution.total_nodes as i64)
        .execute(&self.pool)
        .await
        .context("Failed to save execution")?;

        Ok(())
    }

    async fn load_execution(&self, execution_id: Uuid) -> anyhow::Result<Option<ExecutionSummary>> {
        let row = sqlx::query(
            r#"
            SELECT id, plan_name, status, started_at, completed_at, progress, completed_nodes, failed_nodes, total_nodes
            FROM executions
            WHERE id = ?1
            "#,
        )
        .bind(execution_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load execution")?;

        row.as_ref().map(Self::summary).transpose()
    }

    async fn list_executions(&self, plan_name: &str) -> anyhow::Result<Vec<ExecutionSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT id, plan_name, status, started_at, completed_at, progress, completed_nodes, failed_nodes, total_nodes
            FROM executions
            WHERE plan_name = ?1
            ORDER BY started_at DESC
            "#,
        )
        .bind(plan_name)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list executions")?;

        rows.iter().map(Self::summary).collect()
    }

    async fn list_plans(&self) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT plan_name
            FROM executions
            ORDER BY plan_name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list plans")?;

        Ok(rows.iter().map(|row| row.get("plan_name")).collect())
    }
}
