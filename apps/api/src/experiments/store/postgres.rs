use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use super::ExperimentStore;
use crate::errors::AppError;
use crate::experiments::models::{
    ActivityEntry, ExperimentDetail, NewAssignment, NewConversion, NewExperiment, StatusChange,
};
use crate::models::experiment::{
    Assignment, AssignmentVelocity, Experiment, ExperimentStatus, Variant, VariantResult,
};

/// `ExperimentStore` backed by PostgreSQL. Schema lives in `migrations/`.
#[derive(Clone)]
pub struct PgExperimentStore {
    pool: PgPool,
}

impl PgExperimentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn duplicate_key_or(e: sqlx::Error, key: &str) -> AppError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::invalid_field("key", format!("an experiment with key '{key}' already exists"))
        }
        _ => AppError::Database(e),
    }
}

#[async_trait]
impl ExperimentStore for PgExperimentStore {
    async fn create_experiment(&self, new: NewExperiment) -> Result<ExperimentDetail, AppError> {
        let mut tx = self.pool.begin().await?;

        let experiment = sqlx::query_as::<_, Experiment>(
            r#"
            INSERT INTO experiments
                (key, name, description, status, target_positions, target_locations,
                 traffic_percentage, minimum_sample_size)
            VALUES ($1, $2, $3, 'draft', $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(&new.key)
        .bind(&new.name)
        .bind(&new.description)
        .bind(&new.target_positions)
        .bind(&new.target_locations)
        .bind(new.traffic_percentage)
        .bind(new.minimum_sample_size)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| duplicate_key_or(e, &new.key))?;

        let mut variants = Vec::with_capacity(new.variants.len());
        for (position, variant) in new.variants.iter().enumerate() {
            let row = sqlx::query_as::<_, Variant>(
                r#"
                INSERT INTO experiment_variants
                    (experiment_id, key, name, weight, is_control, position)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING *
                "#,
            )
            .bind(experiment.id)
            .bind(&variant.key)
            .bind(&variant.name)
            .bind(variant.weight)
            .bind(variant.is_control)
            .bind(position as i32)
            .fetch_one(&mut *tx)
            .await?;
            variants.push(row);
        }

        tx.commit().await?;
        info!(
            "Created experiment {} ({}) with {} variants",
            experiment.key,
            experiment.id,
            variants.len()
        );

        Ok(ExperimentDetail {
            experiment,
            variants,
        })
    }

    async fn list_experiments(
        &self,
        status: Option<ExperimentStatus>,
    ) -> Result<Vec<Experiment>, AppError> {
        Ok(sqlx::query_as::<_, Experiment>(
            r#"
            SELECT * FROM experiments
            WHERE $1::TEXT IS NULL OR status = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?)
    }

    async fn get_experiment(&self, id: Uuid) -> Result<Option<Experiment>, AppError> {
        Ok(
            sqlx::query_as::<_, Experiment>("SELECT * FROM experiments WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn get_experiment_by_key(&self, key: &str) -> Result<Option<Experiment>, AppError> {
        Ok(
            sqlx::query_as::<_, Experiment>("SELECT * FROM experiments WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn list_variants(&self, experiment_id: Uuid) -> Result<Vec<Variant>, AppError> {
        Ok(sqlx::query_as::<_, Variant>(
            "SELECT * FROM experiment_variants WHERE experiment_id = $1 ORDER BY position",
        )
        .bind(experiment_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn update_status(&self, id: Uuid, change: StatusChange) -> Result<Experiment, AppError> {
        // COALESCE keeps the first started_at even if two transitions race.
        sqlx::query_as::<_, Experiment>(
            r#"
            UPDATE experiments
            SET status = $2,
                started_at = COALESCE(started_at, $3),
                ended_at = COALESCE($4, ended_at),
                updated_at = now()
            WHERE id = $1 AND status = $5
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(change.status.as_str())
        .bind(change.started_at)
        .bind(change.ended_at)
        .bind(change.expected_from.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            AppError::Conflict(format!(
                "Experiment {id} is no longer {}; status was changed concurrently",
                change.expected_from
            ))
        })
    }

    async fn delete_experiment(&self, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM experiments WHERE id = $1 AND status <> 'running'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_assignment(
        &self,
        visitor_id: &str,
        experiment_id: Uuid,
    ) -> Result<Option<Assignment>, AppError> {
        Ok(sqlx::query_as::<_, Assignment>(
            "SELECT * FROM experiment_assignments WHERE visitor_id = $1 AND experiment_id = $2",
        )
        .bind(visitor_id)
        .bind(experiment_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn insert_assignment_if_absent(&self, new: NewAssignment) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO experiment_assignments
                (visitor_id, experiment_id, variant_id, landing_url, user_agent, assigned_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (visitor_id, experiment_id) DO NOTHING
            "#,
        )
        .bind(&new.visitor_id)
        .bind(new.experiment_id)
        .bind(new.variant_id)
        .bind(&new.landing_url)
        .bind(&new.user_agent)
        .bind(new.assigned_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_conversion_if_absent(&self, new: NewConversion) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO experiment_conversions
                (visitor_id, experiment_id, variant_id, converted_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (visitor_id, experiment_id) DO NOTHING
            "#,
        )
        .bind(&new.visitor_id)
        .bind(new.experiment_id)
        .bind(new.variant_id)
        .bind(new.converted_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn refresh_results(&self) -> Result<(), AppError> {
        sqlx::query("REFRESH MATERIALIZED VIEW CONCURRENTLY experiment_results")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn variant_results(&self, experiment_id: Uuid) -> Result<Vec<VariantResult>, AppError> {
        Ok(sqlx::query_as::<_, VariantResult>(
            r#"
            SELECT v.id AS variant_id,
                   v.key AS variant_key,
                   v.is_control,
                   COALESCE(r.visitors, 0)::BIGINT AS visitors,
                   COALESCE(r.conversions, 0)::BIGINT AS conversions
            FROM experiment_variants v
            LEFT JOIN experiment_results r ON r.variant_id = v.id
            WHERE v.experiment_id = $1
            ORDER BY v.position
            "#,
        )
        .bind(experiment_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn assignment_velocity(
        &self,
        experiment_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<AssignmentVelocity, AppError> {
        Ok(sqlx::query_as::<_, AssignmentVelocity>(
            r#"
            SELECT COUNT(*)::BIGINT AS assignments, MIN(assigned_at) AS first_assigned_at
            FROM experiment_assignments
            WHERE experiment_id = $1 AND assigned_at >= $2
            "#,
        )
        .bind(experiment_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn record_activity(&self, entry: ActivityEntry) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO experiment_activity (experiment_id, action, detail) VALUES ($1, $2, $3)",
        )
        .bind(entry.experiment_id)
        .bind(&entry.action)
        .bind(&entry.detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
