//! Experiment status machine: draft → running → {completed, archived}.
//!
//! A draft may also be archived directly. Completed and archived are terminal.
//! `started_at` is written once, on the first move to running; `ended_at` is
//! written on the move to a terminal status.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::activity;
use crate::errors::AppError;
use crate::experiments::models::StatusChange;
use crate::experiments::store::ExperimentStore;
use crate::models::experiment::{Experiment, ExperimentStatus};

/// Works out the change needed to move `current` to `target`.
/// `Ok(None)` means the experiment is already there and nothing is written.
pub fn plan_transition(
    current: &Experiment,
    target: ExperimentStatus,
    now: DateTime<Utc>,
) -> Result<Option<StatusChange>, AppError> {
    use ExperimentStatus::{Archived, Completed, Draft, Running};

    if current.status == target {
        return Ok(None);
    }
    if current.status.is_terminal() {
        return Err(AppError::Conflict(format!(
            "Experiment '{}' is {} and accepts no further status changes",
            current.key, current.status
        )));
    }

    let change = match (current.status, target) {
        (Draft, Running) => StatusChange {
            expected_from: Draft,
            status: Running,
            started_at: current.started_at.is_none().then_some(now),
            ended_at: None,
        },
        (Running, Completed) | (Running, Archived) | (Draft, Archived) => StatusChange {
            expected_from: current.status,
            status: target,
            started_at: None,
            ended_at: Some(now),
        },
        (from, to) => {
            return Err(AppError::Conflict(format!(
                "Cannot move experiment '{}' from {from} to {to}",
                current.key
            )))
        }
    };
    Ok(Some(change))
}

pub async fn transition_status(
    store: &Arc<dyn ExperimentStore>,
    id: Uuid,
    target: ExperimentStatus,
) -> Result<Experiment, AppError> {
    let current = store
        .get_experiment(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Experiment {id} not found")))?;

    let Some(change) = plan_transition(&current, target, Utc::now())? else {
        return Ok(current);
    };

    let updated = store.update_status(id, change).await?;
    info!(
        "Experiment {} moved from {} to {}",
        updated.key, current.status, updated.status
    );
    activity::record_best_effort(
        store.clone(),
        Some(id),
        "status_changed",
        json!({ "from": current.status, "to": updated.status }),
    );
    Ok(updated)
}

pub async fn delete_experiment(store: &Arc<dyn ExperimentStore>, id: Uuid) -> Result<(), AppError> {
    let experiment = store
        .get_experiment(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Experiment {id} not found")))?;

    if experiment.status == ExperimentStatus::Running {
        return Err(AppError::Conflict(format!(
            "Experiment '{}' is running; complete or archive it before deleting",
            experiment.key
        )));
    }

    // The store re-checks the status, so a concurrent start wins over the delete.
    if !store.delete_experiment(id).await? {
        return Err(AppError::Conflict(format!(
            "Experiment '{}' could not be deleted in its current state",
            experiment.key
        )));
    }

    info!("Deleted experiment {} ({id})", experiment.key);
    activity::record_best_effort(
        store.clone(),
        Some(id),
        "deleted",
        json!({ "key": experiment.key, "status": experiment.status }),
    );
    Ok(())
}
