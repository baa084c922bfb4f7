//! Persistence seam for experiments, assignments, conversions and the results rollup.
//!
//! `AppState` holds an `Arc<dyn ExperimentStore>`. Production runs against
//! `PgExperimentStore`; `MemoryExperimentStore` backs tests and local runs.
//!
//! Assignment and conversion writes are insert-if-absent: the first writer for a
//! (visitor, experiment) pair wins and later attempts report `false`.

mod memory;
mod postgres;

pub use memory::MemoryExperimentStore;
pub use postgres::PgExperimentStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::AppError;
use crate::experiments::models::{
    ActivityEntry, ExperimentDetail, NewAssignment, NewConversion, NewExperiment, StatusChange,
};
use crate::models::experiment::{
    Assignment, AssignmentVelocity, Experiment, ExperimentStatus, Variant, VariantResult,
};

#[async_trait]
pub trait ExperimentStore: Send + Sync {
    /// Creates a draft experiment with its variants. A duplicate key is a `key` validation error.
    async fn create_experiment(&self, new: NewExperiment) -> Result<ExperimentDetail, AppError>;

    async fn list_experiments(
        &self,
        status: Option<ExperimentStatus>,
    ) -> Result<Vec<Experiment>, AppError>;

    async fn get_experiment(&self, id: Uuid) -> Result<Option<Experiment>, AppError>;

    async fn get_experiment_by_key(&self, key: &str) -> Result<Option<Experiment>, AppError>;

    /// Variants in declaration order.
    async fn list_variants(&self, experiment_id: Uuid) -> Result<Vec<Variant>, AppError>;

    /// Compare-and-set on status. `Conflict` when the row has left `change.expected_from`.
    async fn update_status(&self, id: Uuid, change: StatusChange) -> Result<Experiment, AppError>;

    /// Deletes a non-running experiment. Returns `false` if nothing was deleted.
    async fn delete_experiment(&self, id: Uuid) -> Result<bool, AppError>;

    async fn find_assignment(
        &self,
        visitor_id: &str,
        experiment_id: Uuid,
    ) -> Result<Option<Assignment>, AppError>;

    /// Returns `true` when this call created the row.
    async fn insert_assignment_if_absent(&self, new: NewAssignment) -> Result<bool, AppError>;

    /// Returns `true` when this call created the row.
    async fn insert_conversion_if_absent(&self, new: NewConversion) -> Result<bool, AppError>;

    /// Recomputes the per-variant rollup from assignments and conversions.
    async fn refresh_results(&self) -> Result<(), AppError>;

    /// Rollup rows for every variant of the experiment, in declaration order.
    /// Reflects the last refresh, not live counts.
    async fn variant_results(&self, experiment_id: Uuid) -> Result<Vec<VariantResult>, AppError>;

    async fn assignment_velocity(
        &self,
        experiment_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<AssignmentVelocity, AppError>;

    async fn record_activity(&self, entry: ActivityEntry) -> Result<(), AppError>;
}
