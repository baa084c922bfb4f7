use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::errors::AppError;
use crate::experiments::models::NewConversion;
use crate::experiments::store::ExperimentStore;
use crate::models::experiment::ExperimentStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionOutcome {
    Recorded,
    AlreadyRecorded,
    /// The visitor never saw this experiment, so the conversion is not attributable.
    NotAssigned,
    /// Conversions only count while the experiment is running.
    ExperimentInactive,
}

/// Records that an assigned visitor converted. At most one conversion per
/// visitor per experiment is stored; repeats report `AlreadyRecorded`.
pub async fn record_conversion(
    store: &dyn ExperimentStore,
    visitor_id: &str,
    experiment_key: &str,
) -> Result<ConversionOutcome, AppError> {
    let experiment = store
        .get_experiment_by_key(experiment_key)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Experiment '{experiment_key}' not found")))?;

    if experiment.status != ExperimentStatus::Running {
        return Ok(ConversionOutcome::ExperimentInactive);
    }

    let Some(assignment) = store.find_assignment(visitor_id.trim(), experiment.id).await? else {
        return Ok(ConversionOutcome::NotAssigned);
    };

    let inserted = store
        .insert_conversion_if_absent(NewConversion {
            visitor_id: assignment.visitor_id,
            experiment_id: experiment.id,
            variant_id: assignment.variant_id,
            converted_at: Utc::now(),
        })
        .await?;

    debug!(
        "Conversion for experiment {}: {}",
        experiment.key,
        if inserted { "recorded" } else { "duplicate" }
    );

    Ok(if inserted {
        ConversionOutcome::Recorded
    } else {
        ConversionOutcome::AlreadyRecorded
    })
}
