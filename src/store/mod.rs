//! Persistent state storage using SQLite
//!
//! This module handles all durable state:
//! - Targets (tracked sounds/hashtags with their dedup state)
//! - Subscriptions (chat <-> target associations)
//! - Poll runs (cycle history and stats)

mod schema;

pub use schema::*;

use crate::error::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

/// Target types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Sound,
    Hashtag,
}

impl std::fmt::Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetType::Sound => write!(f, "sound"),
            TargetType::Hashtag => write!(f, "hashtag"),
        }
    }
}

impl FromStr for TargetType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sound" => Ok(TargetType::Sound),
            "hashtag" => Ok(TargetType::Hashtag),
            _ => Err(Error::Config(format!("Unknown target type: {}", s))),
        }
    }
}

/// Poll run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(Error::Config(format!("Unknown run status: {}", s))),
        }
    }
}

/// Dedup state for one target: the last seen timestamp and a bounded,
/// insertion-ordered (oldest first) set of last seen item ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetState {
    pub last_ts: i64,
    pub last_ids: Vec<String>,
}

impl TargetState {
    /// True before the first successful poll of a target
    pub fn is_first_poll(&self) -> bool {
        self.last_ts == 0 && self.last_ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.last_ids.iter().any(|known| known == id)
    }
}

/// A tracked target row
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TrackedTarget {
    pub target_type: String,
    pub target_id: String,
    pub title: Option<String>,
    pub last_ts: i64,
    pub last_ids: String,
    pub created_at: String,
    pub updated_at: String,
}

impl TrackedTarget {
    pub fn new(target_type: TargetType, target_id: String, title: Option<String>) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            target_type: target_type.to_string(),
            target_id,
            title,
            last_ts: 0,
            last_ids: "[]".to_string(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn get_type(&self) -> Result<TargetType> {
        self.target_type.parse()
    }

    /// Decode the persisted dedup state. A malformed id list is treated as
    /// empty rather than failing the whole cycle.
    pub fn state(&self) -> TargetState {
        let last_ids: Vec<String> = serde_json::from_str(&self.last_ids).unwrap_or_default();
        TargetState {
            last_ts: self.last_ts,
            last_ids,
        }
    }

    /// Human-readable label, e.g. `sound:7016547803243022337` or `hashtag:fyp`
    pub fn label(&self) -> String {
        format!("{}:{}", self.target_type, self.target_id)
    }
}

/// A poll run record
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PollRun {
    pub id: String,
    pub target_type: String,
    pub target_id: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub status: String,
    pub items_fetched: i64,
    pub new_items: i64,
    pub deliveries_ok: i64,
    pub deliveries_failed: i64,
    pub error: Option<String>,
}

impl PollRun {
    pub fn new(target_type: TargetType, target_id: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target_type: target_type.to_string(),
            target_id,
            started_at: Utc::now().to_rfc3339(),
            completed_at: None,
            status: RunStatus::Running.to_string(),
            items_fetched: 0,
            new_items: 0,
            deliveries_ok: 0,
            deliveries_failed: 0,
            error: None,
        }
    }
}

/// Global statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchStats {
    pub target_count: usize,
    pub subscription_count: usize,
    pub run_count: usize,
}

/// Watch database handle
#[derive(Clone)]
pub struct WatchDb {
    pool: SqlitePool,
}

impl WatchDb {
    /// Open (or create) the database at the given path and ensure the schema
    pub async fn new(db_path: &std::path::Path) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        debug!("Connecting to SQLite database at {:?}", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };

        if !db.is_initialized().await? {
            db.init_schema().await?;
        }

        Ok(db)
    }

    /// Initialize the database schema
    pub async fn init_schema(&self) -> Result<()> {
        info!("Initializing database schema");
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Check if database is initialized
    pub async fn is_initialized(&self) -> Result<bool> {
        let result: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM sqlite_master WHERE type='table' AND name='targets'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(result.is_some())
    }

    // ===== Target Operations =====

    /// Insert a target, or refresh its title on conflict. Idempotent; the
    /// persisted `last_ts` never decreases and `last_ids` is left untouched.
    pub async fn upsert_target(&self, target: &TrackedTarget) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO targets (target_type, target_id, title, last_ts, last_ids, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(target_type, target_id) DO UPDATE SET
                title = COALESCE(excluded.title, targets.title),
                last_ts = max(targets.last_ts, excluded.last_ts),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&target.target_type)
        .bind(&target.target_id)
        .bind(&target.title)
        .bind(target.last_ts)
        .bind(&target.last_ids)
        .bind(&target.created_at)
        .bind(&target.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get a target by type and id
    pub async fn get_target(
        &self,
        target_type: TargetType,
        target_id: &str,
    ) -> Result<Option<TrackedTarget>> {
        let target = sqlx::query_as::<_, TrackedTarget>(
            "SELECT * FROM targets WHERE target_type = ? AND target_id = ?",
        )
        .bind(target_type.to_string())
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(target)
    }

    /// List all tracked targets
    pub async fn list_targets(&self) -> Result<Vec<TrackedTarget>> {
        let targets =
            sqlx::query_as::<_, TrackedTarget>(
                "SELECT * FROM targets ORDER BY created_at, target_id",
            )
                .fetch_all(&self.pool)
                .await?;
        Ok(targets)
    }

    /// Commit the post-cycle dedup state for a target in one statement.
    /// `last_ts`, `last_ids` and the title land together or not at all, and
    /// `last_ts` stays monotone even against a stale writer.
    pub async fn commit_state(
        &self,
        target_type: TargetType,
        target_id: &str,
        state: &TargetState,
        title: Option<&str>,
    ) -> Result<()> {
        let last_ids = serde_json::to_string(&state.last_ids)?;
        let result = sqlx::query(
            r#"
            UPDATE targets SET
                last_ts = max(last_ts, ?),
                last_ids = ?,
                title = COALESCE(?, title),
                updated_at = ?
            WHERE target_type = ? AND target_id = ?
            "#,
        )
        .bind(state.last_ts)
        .bind(&last_ids)
        .bind(title)
        .bind(Utc::now().to_rfc3339())
        .bind(target_type.to_string())
        .bind(target_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::TargetNotFound(format!(
                "{}:{}",
                target_type, target_id
            )));
        }
        Ok(())
    }

    /// Delete a target and all its subscriptions and run history
    pub async fn remove_target(&self, target_type: TargetType, target_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM poll_runs WHERE target_type = ? AND target_id = ?")
            .bind(target_type.to_string())
            .bind(target_id)
            .execute(&self.pool)
            .await?;

        sqlx::query("DELETE FROM subscriptions WHERE target_type = ? AND target_id = ?")
            .bind(target_type.to_string())
            .bind(target_id)
            .execute(&self.pool)
            .await?;

        sqlx::query("DELETE FROM targets WHERE target_type = ? AND target_id = ?")
            .bind(target_type.to_string())
            .bind(target_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ===== Subscription Operations =====

    /// Subscribe a chat to a target (idempotent)
    pub async fn subscribe(
        &self,
        chat_id: i64,
        target_type: TargetType,
        target_id: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO subscriptions (chat_id, target_type, target_id, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(chat_id)
        .bind(target_type.to_string())
        .bind(target_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Unsubscribe a chat from a target
    pub async fn unsubscribe(
        &self,
        chat_id: i64,
        target_type: TargetType,
        target_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM subscriptions WHERE chat_id = ? AND target_type = ? AND target_id = ?",
        )
        .bind(chat_id)
        .bind(target_type.to_string())
        .bind(target_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// List subscriber chats for a target
    pub async fn subscribers(&self, target_type: TargetType, target_id: &str) -> Result<Vec<i64>> {
        let chats: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT chat_id FROM subscriptions
            WHERE target_type = ? AND target_id = ?
            ORDER BY chat_id
            "#,
        )
        .bind(target_type.to_string())
        .bind(target_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(chats)
    }

    /// Count subscribers for a target
    pub async fn subscription_count(
        &self,
        target_type: TargetType,
        target_id: &str,
    ) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM subscriptions WHERE target_type = ? AND target_id = ?",
        )
        .bind(target_type.to_string())
        .bind(target_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    // ===== Poll Run Operations =====

    /// Start a new poll run record
    pub async fn start_poll_run(
        &self,
        target_type: TargetType,
        target_id: &str,
    ) -> Result<PollRun> {
        let run = PollRun::new(target_type, target_id.to_string());
        sqlx::query(
            r#"
            INSERT INTO poll_runs (id, target_type, target_id, started_at, status)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.target_type)
        .bind(&run.target_id)
        .bind(&run.started_at)
        .bind(&run.status)
        .execute(&self.pool)
        .await?;
        Ok(run)
    }

    /// Complete a poll run
    pub async fn complete_poll_run(
        &self,
        id: &str,
        status: RunStatus,
        items_fetched: usize,
        new_items: usize,
        deliveries_ok: usize,
        deliveries_failed: usize,
        error: Option<String>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE poll_runs SET
                completed_at = ?,
                status = ?,
                items_fetched = ?,
                new_items = ?,
                deliveries_ok = ?,
                deliveries_failed = ?,
                error = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(status.to_string())
        .bind(items_fetched as i64)
        .bind(new_items as i64)
        .bind(deliveries_ok as i64)
        .bind(deliveries_failed as i64)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get the latest poll run for a target
    pub async fn latest_run(
        &self,
        target_type: TargetType,
        target_id: &str,
    ) -> Result<Option<PollRun>> {
        let run = sqlx::query_as::<_, PollRun>(
            r#"
            SELECT * FROM poll_runs
            WHERE target_type = ? AND target_id = ?
            ORDER BY started_at DESC LIMIT 1
            "#,
        )
        .bind(target_type.to_string())
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(run)
    }

    /// Get the latest successful poll run for a target
    pub async fn latest_successful_run(
        &self,
        target_type: TargetType,
        target_id: &str,
    ) -> Result<Option<PollRun>> {
        let run = sqlx::query_as::<_, PollRun>(
            r#"
            SELECT * FROM poll_runs
            WHERE target_type = ? AND target_id = ? AND status = 'completed'
            ORDER BY started_at DESC LIMIT 1
            "#,
        )
        .bind(target_type.to_string())
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(run)
    }

    // ===== Statistics =====

    /// Get global statistics
    pub async fn global_stats(&self) -> Result<WatchStats> {
        let target_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM targets")
            .fetch_one(&self.pool)
            .await?;

        let subscription_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM subscriptions")
            .fetch_one(&self.pool)
            .await?;

        let run_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM poll_runs")
            .fetch_one(&self.pool)
            .await?;

        Ok(WatchStats {
            target_count: target_count as usize,
            subscription_count: subscription_count as usize,
            run_count: run_count as usize,
        })
    }
}
