use relay_core::{AiModel, NewAiModel};
use tracing::info;

use crate::rows::{convert_all, AiModelRow};
use crate::{now_millis, Store, StoreError};

impl Store {
    /// Add a model to the catalog. A new default replaces the previous one.
    pub async fn create_ai_model(&self, model: &NewAiModel) -> Result<AiModel, StoreError> {
        if model.name.trim().is_empty() || model.model_id.trim().is_empty() {
            return Err(StoreError::Invalid(
                "model name and model id are required".to_string(),
            ));
        }
        if model.is_default && !model.is_active {
            return Err(StoreError::Invalid(
                "an inactive model cannot be the default".to_string(),
            ));
        }

        let mut tx = self.pool().begin().await?;
        if model.is_default {
            sqlx::query("UPDATE ai_models SET is_default = 0, updated_at = ? WHERE is_default = 1")
                .bind(now_millis())
                .execute(&mut *tx)
                .await?;
        }
        let result = sqlx::query(
            "INSERT INTO ai_models (name, model_id, description, is_active, is_default, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(model.name.trim())
        .bind(model.model_id.trim())
        .bind(model.description.as_deref())
        .bind(model.is_active)
        .bind(model.is_default)
        .bind(now_millis())
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(format!("model {} already exists", model.model_id))
            }
            other => other.into(),
        })?;
        tx.commit().await?;

        info!(model_id = %model.model_id, is_default = model.is_default, "ai model added");
        self.get_ai_model(result.last_insert_rowid()).await
    }

    pub async fn get_ai_model(&self, id: i64) -> Result<AiModel, StoreError> {
        sqlx::query_as::<_, AiModelRow>("SELECT * FROM ai_models WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("ai model {id}")))?
            .try_into()
    }

    pub async fn ai_model_by_model_id(&self, model_id: &str) -> Result<Option<AiModel>, StoreError> {
        sqlx::query_as::<_, AiModelRow>("SELECT * FROM ai_models WHERE model_id = ?")
            .bind(model_id.trim())
            .fetch_optional(self.pool())
            .await?
            .map(AiModel::try_from)
            .transpose()
    }

    pub async fn list_ai_models(&self, active_only: bool) -> Result<Vec<AiModel>, StoreError> {
        let rows = sqlx::query_as::<_, AiModelRow>(
            "SELECT * FROM ai_models WHERE (? = 0 OR is_active = 1) ORDER BY created_at, id",
        )
        .bind(active_only)
        .fetch_all(self.pool())
        .await?;
        convert_all(rows)
    }

    /// The model workers should use, if the operator picked one and it is still active.
    pub async fn default_ai_model(&self) -> Result<Option<AiModel>, StoreError> {
        sqlx::query_as::<_, AiModelRow>(
            "SELECT * FROM ai_models WHERE is_default = 1 AND is_active = 1 LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await?
        .map(AiModel::try_from)
        .transpose()
    }

    /// Make `id` the only default. Inactive models are refused.
    pub async fn set_default_ai_model(&self, id: i64) -> Result<AiModel, StoreError> {
        let model = self.get_ai_model(id).await?;
        if !model.is_active {
            return Err(StoreError::Conflict(format!(
                "ai model {} is inactive",
                model.model_id
            )));
        }

        let now = now_millis();
        let mut tx = self.pool().begin().await?;
        sqlx::query("UPDATE ai_models SET is_default = 0, updated_at = ? WHERE is_default = 1 AND id <> ?")
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query(
            "UPDATE ai_models SET is_default = 1, updated_at = ? WHERE id = ? AND is_active = 1",
        )
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "ai model {} changed concurrently",
                model.model_id
            )));
        }
        tx.commit().await?;

        info!(model_id = %model.model_id, "default ai model set");
        self.get_ai_model(id).await
    }

    pub async fn set_ai_model_active(&self, id: i64, active: bool) -> Result<AiModel, StoreError> {
        let result = sqlx::query("UPDATE ai_models SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(active)
            .bind(now_millis())
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("ai model {id}")));
        }
        self.get_ai_model(id).await
    }

    /// The default model cannot be deleted; pick another default first.
    pub async fn delete_ai_model(&self, id: i64) -> Result<(), StoreError> {
        let model = self.get_ai_model(id).await?;
        if model.is_default {
            return Err(StoreError::Conflict(format!(
                "ai model {} is the default",
                model.model_id
            )));
        }
        sqlx::query("DELETE FROM ai_models WHERE id = ? AND is_default = 0")
            .bind(id)
            .execute(self.pool())
            .await?;
        info!(model_id = %model.model_id, "ai model deleted");
        Ok(())
    }
}
