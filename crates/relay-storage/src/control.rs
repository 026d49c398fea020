use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use relay_core::{PostStatus, Setting, WorkerControl, WorkerKind};
use serde::Serialize;

use crate::rows::{convert_all, SettingRow, WorkerControlRow};
use crate::{now_millis, to_millis, Store, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DashboardStats {
    pub posts_by_status: BTreeMap<String, i64>,
    pub total_posts: i64,
    pub posts_today: i64,
    pub source_channels: i64,
    pub active_source_channels: i64,
    pub target_channels: i64,
    pub active_target_channels: i64,
}

impl DashboardStats {
    pub fn count(&self, status: PostStatus) -> i64 {
        self.posts_by_status
            .get(status.as_str())
            .copied()
            .unwrap_or(0)
    }
}

impl Store {
    // =========================================================================
    // Settings
    // =========================================================================

    pub async fn get_setting(&self, key: &str) -> Result<Option<Setting>, StoreError> {
        sqlx::query_as::<_, SettingRow>("SELECT * FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await?
            .map(Setting::try_from)
            .transpose()
    }

    pub async fn setting_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.get_setting(key).await?.map(|s| s.value))
    }

    /// Boolean setting; accepts true/false, 1/0, yes/no, on/off.
    pub async fn setting_flag(&self, key: &str, default: bool) -> Result<bool, StoreError> {
        let Some(raw) = self.setting_value(key).await? else {
            return Ok(default);
        };
        Ok(match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            _ => default,
        })
    }

    pub async fn list_settings(&self) -> Result<Vec<Setting>, StoreError> {
        let rows = sqlx::query_as::<_, SettingRow>("SELECT * FROM settings ORDER BY key")
            .fetch_all(self.pool())
            .await?;
        convert_all(rows)
    }

    pub async fn upsert_setting(
        &self,
        key: &str,
        value: &str,
        description: Option<&str>,
    ) -> Result<Setting, StoreError> {
        sqlx::query(
            "INSERT INTO settings (key, value, description, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET \
                 value = excluded.value, \
                 description = COALESCE(excluded.description, settings.description), \
                 updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(description)
        .bind(now_millis())
        .execute(self.pool())
        .await?;

        self.get_setting(key)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("setting {key}")))
    }

    // =========================================================================
    // Worker control
    // =========================================================================

    /// Fetch the control row for `kind`, creating it if absent.
    pub async fn worker_control(&self, kind: WorkerKind) -> Result<WorkerControl, StoreError> {
        sqlx::query("INSERT OR IGNORE INTO worker_control (kind) VALUES (?)")
            .bind(kind.as_str())
            .execute(self.pool())
            .await?;

        sqlx::query_as::<_, WorkerControlRow>("SELECT * FROM worker_control WHERE kind = ?")
            .bind(kind.as_str())
            .fetch_one(self.pool())
            .await?
            .try_into()
    }

    pub async fn list_worker_controls(&self) -> Result<Vec<WorkerControl>, StoreError> {
        for kind in WorkerKind::ALL {
            self.worker_control(kind).await?;
        }
        let rows = sqlx::query_as::<_, WorkerControlRow>(
            "SELECT * FROM worker_control ORDER BY kind",
        )
        .fetch_all(self.pool())
        .await?;
        convert_all(rows)
    }

    /// Operator intent: whether the worker should be running.
    pub async fn set_should_run(
        &self,
        kind: WorkerKind,
        should_run: bool,
    ) -> Result<WorkerControl, StoreError> {
        self.worker_control(kind).await?;
        sqlx::query("UPDATE worker_control SET should_run = ? WHERE kind = ?")
            .bind(should_run)
            .bind(kind.as_str())
            .execute(self.pool())
            .await?;
        self.worker_control(kind).await
    }

    /// Actual state, written by the worker itself.
    pub async fn set_running(
        &self,
        kind: WorkerKind,
        is_running: bool,
    ) -> Result<WorkerControl, StoreError> {
        self.worker_control(kind).await?;
        let now = now_millis();
        let sql = if is_running {
            "UPDATE worker_control SET is_running = 1, started_at = ?, last_heartbeat = ? WHERE kind = ?"
        } else {
            "UPDATE worker_control SET is_running = 0, stopped_at = ?, last_heartbeat = ? WHERE kind = ?"
        };
        sqlx::query(sql)
            .bind(now)
            .bind(now)
            .bind(kind.as_str())
            .execute(self.pool())
            .await?;
        self.worker_control(kind).await
    }

    pub async fn heartbeat(&self, kind: WorkerKind) -> Result<(), StoreError> {
        sqlx::query("UPDATE worker_control SET last_heartbeat = ? WHERE kind = ?")
            .bind(now_millis())
            .bind(kind.as_str())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    pub async fn dashboard_stats(&self, now: DateTime<Utc>) -> Result<DashboardStats, StoreError> {
        let mut stats = DashboardStats::default();

        let counts: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM posts GROUP BY status")
                .fetch_all(self.pool())
                .await?;
        for (status, count) in counts {
            stats.total_posts += count;
            stats.posts_by_status.insert(status, count);
        }

        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or(now);
        stats.posts_today = sqlx::query_scalar("SELECT COUNT(*) FROM posts WHERE created_at >= ?")
            .bind(to_millis(midnight))
            .fetch_one(self.pool())
            .await?;

        let (sources, active_sources): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(is_active), 0) FROM source_channels",
        )
        .fetch_one(self.pool())
        .await?;
        let (targets, active_targets): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(is_active), 0) FROM target_channels",
        )
        .fetch_one(self.pool())
        .await?;

        stats.source_channels = sources;
        stats.active_source_channels = active_sources;
        stats.target_channels = targets;
        stats.active_target_channels = active_targets;
        Ok(stats)
    }
}
