//! Persistent store for the relay: channels, posts, settings, the model
//! catalog and worker control rows.
//!
//! Every post transition is a single conditional `UPDATE` guarded by the set of
//! statuses the transition may leave from, so two writers racing on one row can
//! never both succeed.

mod ai_models;
mod channels;
mod control;
mod posts;
mod rows;


use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use relay_core::{PostId, PostStatus, Transition, TransitionError};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::info;

pub use channels::{SourceChannelUpdate, TargetChannelUpdate};
pub use control::DashboardStats;
pub use posts::{IngestOutcome, PostFilter};

pub const CRATE_NAME: &str = "relay-storage";

pub const IN_MEMORY_URL: &str = "sqlite::memory:";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("decode error: {0}")]
    Decode(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
            other => StoreError::Query(other.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open (creating if needed) the database at `url` and apply migrations.
    pub async fn open(url: &str) -> Result<Self, StoreError> {
        if url.trim() == IN_MEMORY_URL {
            return Self::open_in_memory().await;
        }

        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!(url, "relay database opened");

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(IN_MEMORY_URL)
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .foreign_keys(true);

        // A single connection kept alive forever; dropping it drops the database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        info!("relay database migrations complete");
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Explain why a guarded transition touched no row.
    async fn transition_failure(&self, id: PostId, transition: Transition) -> StoreError {
        match self.get_post(id).await {
            Ok(post) if transition.allows(post.status) => StoreError::Conflict(format!(
                "post {id} has no target channel; {} requires one",
                transition.target()
            )),
            Ok(post) => StoreError::InvalidTransition(TransitionError {
                from: post.status,
                to: transition.target(),
            }),
            Err(err) => err,
        }
    }
}

/// Comma-separated SQL literal list of the statuses a transition may leave from.
pub(crate) fn status_list(statuses: &[PostStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Decode(format!("timestamp out of range: {ms}")))
}

pub(crate) fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    ms.map(from_millis).transpose()
}

pub(crate) fn now_millis() -> i64 {
    to_millis(Utc::now())
}
