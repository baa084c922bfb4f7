use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::AppError;
use crate::experiments::stats::{calculate_experiment_stats, VariantStats};
use crate::experiments::store::ExperimentStore;
use crate::models::experiment::{AssignmentVelocity, VariantResult};

/// Trailing window used to estimate daily visitor velocity.
pub const VELOCITY_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone, Serialize)]
pub struct ResultsReport {
    pub experiment_id: Uuid,
    pub variants: Vec<VariantStats>,
    pub is_significant: bool,
    pub sample_size_reached: bool,
    pub winner: Option<String>,
    pub daily_visitors: f64,
    pub estimated_days_remaining: Option<i64>,
    pub raw_results: Vec<VariantResult>,
    /// True only when this request refreshed the rollup successfully.
    pub refreshed: bool,
}

/// Days until `required_total` visitors at the current rate.
///
/// None when there is no traffic to extrapolate from, or when enough data
/// has already been collected.
pub fn estimate_time_to_significance(
    daily_visitor_rate: f64,
    current_total: i64,
    required_total: i64,
) -> Option<i64> {
    if daily_visitor_rate <= 0.0 || !daily_visitor_rate.is_finite() || current_total >= required_total
    {
        return None;
    }
    Some(((required_total - current_total) as f64 / daily_visitor_rate).ceil() as i64)
}

/// Assignments in the window divided by days since the first of them (at least one day).
pub fn daily_visitor_rate(velocity: &AssignmentVelocity, now: DateTime<Utc>) -> f64 {
    let Some(first) = velocity.first_assigned_at else {
        return 0.0;
    };
    let elapsed_days = ((now - first).num_seconds() as f64 / 86_400.0).ceil().max(1.0);
    velocity.assignments as f64 / elapsed_days
}

/// Refreshes the rollup, logging instead of failing. Returns whether it succeeded.
pub async fn refresh_results_best_effort(store: &dyn ExperimentStore) -> bool {
    match store.refresh_results().await {
        Ok(()) => {
            info!("Experiment results rollup refreshed");
            true
        }
        Err(e) => {
            warn!("Experiment results refresh failed; serving previous rollup: {e}");
            false
        }
    }
}

pub async fn build_results_report(
    store: &dyn ExperimentStore,
    experiment_id: Uuid,
    refresh: bool,
    now: DateTime<Utc>,
) -> Result<ResultsReport, AppError> {
    let experiment = store
        .get_experiment(experiment_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Experiment {experiment_id} not found")))?;

    let refreshed = refresh && refresh_results_best_effort(store).await;

    let raw_results = store.variant_results(experiment_id).await?;
    let minimum_sample_size = i64::from(experiment.minimum_sample_size);
    let stats = calculate_experiment_stats(&raw_results, minimum_sample_size);

    let velocity = store
        .assignment_velocity(experiment_id, now - Duration::days(VELOCITY_WINDOW_DAYS))
        .await?;
    let daily_visitors = daily_visitor_rate(&velocity, now);

    let current_total: i64 = raw_results.iter().map(|r| r.visitors).sum();
    let required_total = minimum_sample_size * raw_results.len() as i64;
    let estimated_days_remaining =
        estimate_time_to_significance(daily_visitors, current_total, required_total);

    let (variants, is_significant, sample_size_reached, winner) = match stats {
        Some(stats) => (
            stats.variants,
            stats.is_significant,
            stats.sample_size_reached,
            stats.winner,
        ),
        None => (Vec::new(), false, false, None),
    };

    Ok(ResultsReport {
        experiment_id,
        variants,
        is_significant,
        sample_size_reached,
        winner,
        daily_visitors,
        estimated_days_remaining,
        raw_results,
        refreshed,
    })
}
