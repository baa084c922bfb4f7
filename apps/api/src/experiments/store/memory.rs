use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::ExperimentStore;
use crate::errors::AppError;
use crate::experiments::models::{
    ActivityEntry, ExperimentDetail, NewAssignment, NewConversion, NewExperiment, StatusChange,
};
use crate::models::experiment::{
    ActivityRow, Assignment, AssignmentVelocity, Conversion, Experiment, ExperimentStatus,
    Variant, VariantResult,
};

type VisitorKey = (String, Uuid);

#[derive(Default)]
struct MemoryState {
    experiments: HashMap<Uuid, Experiment>,
    variants: Vec<Variant>,
    assignments: HashMap<VisitorKey, Assignment>,
    conversions: HashMap<VisitorKey, Conversion>,
    /// variant_id → (visitors, conversions) as of the last refresh.
    results: HashMap<Uuid, (i64, i64)>,
    activity: Vec<ActivityRow>,
}

/// Process-local `ExperimentStore`. A single lock makes every insert-if-absent atomic.
#[derive(Default)]
pub struct MemoryExperimentStore {
    state: RwLock<MemoryState>,
}

impl MemoryExperimentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored assignments for an experiment.
    #[cfg(test)]
    pub async fn assignment_count(&self, experiment_id: Uuid) -> usize {
        let state = self.state.read().await;
        state
            .assignments
            .values()
            .filter(|a| a.experiment_id == experiment_id)
            .count()
    }

    #[cfg(test)]
    pub async fn activity(&self) -> Vec<ActivityRow> {
        self.state.read().await.activity.clone()
    }
}

#[async_trait]
impl ExperimentStore for MemoryExperimentStore {
    async fn create_experiment(&self, new: NewExperiment) -> Result<ExperimentDetail, AppError> {
        let mut state = self.state.write().await;
        if state.experiments.values().any(|e| e.key == new.key) {
            return Err(AppError::invalid_field(
                "key",
                format!("an experiment with key '{}' already exists", new.key),
            ));
        }

        let now = Utc::now();
        let experiment = Experiment {
            id: Uuid::new_v4(),
            key: new.key,
            name: new.name,
            description: new.description,
            status: ExperimentStatus::Draft,
            target_positions: new.target_positions,
            target_locations: new.target_locations,
            traffic_percentage: new.traffic_percentage,
            minimum_sample_size: new.minimum_sample_size,
            started_at: None,
            ended_at: None,
            created_at: now,
            updated_at: now,
        };

        let variants: Vec<Variant> = new
            .variants
            .into_iter()
            .enumerate()
            .map(|(position, v)| Variant {
                id: Uuid::new_v4(),
                experiment_id: experiment.id,
                key: v.key,
                name: v.name,
                weight: v.weight,
                is_control: v.is_control,
                position: position as i32,
            })
            .collect();

        state.experiments.insert(experiment.id, experiment.clone());
        state.variants.extend(variants.iter().cloned());

        Ok(ExperimentDetail {
            experiment,
            variants,
        })
    }

    async fn list_experiments(
        &self,
        status: Option<ExperimentStatus>,
    ) -> Result<Vec<Experiment>, AppError> {
        let state = self.state.read().await;
        let mut experiments: Vec<Experiment> = state
            .experiments
            .values()
            .filter(|e| status.map_or(true, |s| e.status == s))
            .cloned()
            .collect();
        experiments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(experiments)
    }

    async fn get_experiment(&self, id: Uuid) -> Result<Option<Experiment>, AppError> {
        Ok(self.state.read().await.experiments.get(&id).cloned())
    }

    async fn get_experiment_by_key(&self, key: &str) -> Result<Option<Experiment>, AppError> {
        let state = self.state.read().await;
        Ok(state.experiments.values().find(|e| e.key == key).cloned())
    }

    async fn list_variants(&self, experiment_id: Uuid) -> Result<Vec<Variant>, AppError> {
        let state = self.state.read().await;
        let mut variants: Vec<Variant> = state
            .variants
            .iter()
            .filter(|v| v.experiment_id == experiment_id)
            .cloned()
            .collect();
        variants.sort_by_key(|v| v.position);
        Ok(variants)
    }

    async fn update_status(&self, id: Uuid, change: StatusChange) -> Result<Experiment, AppError> {
        let mut state = self.state.write().await;
        let experiment = state
            .experiments
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Experiment {id} not found")))?;

        if experiment.status != change.expected_from {
            return Err(AppError::Conflict(format!(
                "Experiment '{}' is {}, not {}; status was changed concurrently",
                experiment.key, experiment.status, change.expected_from
            )));
        }

        experiment.status = change.status;
        if experiment.started_at.is_none() {
            experiment.started_at = change.started_at;
        }
        if change.ended_at.is_some() {
            experiment.ended_at = change.ended_at;
        }
        experiment.updated_at = Utc::now();
        Ok(experiment.clone())
    }

    async fn delete_experiment(&self, id: Uuid) -> Result<bool, AppError> {
        let mut state = self.state.write().await;
        match state.experiments.get(&id) {
            Some(e) if e.status != ExperimentStatus::Running => {}
            _ => return Ok(false),
        }

        state.experiments.remove(&id);
        let removed: Vec<Uuid> = state
            .variants
            .iter()
            .filter(|v| v.experiment_id == id)
            .map(|v| v.id)
            .collect();
        state.variants.retain(|v| v.experiment_id != id);
        state.assignments.retain(|_, a| a.experiment_id != id);
        state.conversions.retain(|_, c| c.experiment_id != id);
        for variant_id in removed {
            state.results.remove(&variant_id);
        }
        Ok(true)
    }

    async fn find_assignment(
        &self,
        visitor_id: &str,
        experiment_id: Uuid,
    ) -> Result<Option<Assignment>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .assignments
            .get(&(visitor_id.to_string(), experiment_id))
            .cloned())
    }

    async fn insert_assignment_if_absent(&self, new: NewAssignment) -> Result<bool, AppError> {
        let mut state = self.state.write().await;
        let key = (new.visitor_id.clone(), new.experiment_id);
        if state.assignments.contains_key(&key) {
            return Ok(false);
        }
        state.assignments.insert(
            key,
            Assignment {
                id: Uuid::new_v4(),
                visitor_id: new.visitor_id,
                experiment_id: new.experiment_id,
                variant_id: new.variant_id,
                landing_url: new.landing_url,
                user_agent: new.user_agent,
                assigned_at: new.assigned_at,
            },
        );
        Ok(true)
    }

    async fn insert_conversion_if_absent(&self, new: NewConversion) -> Result<bool, AppError> {
        let mut state = self.state.write().await;
        let key = (new.visitor_id.clone(), new.experiment_id);
        if state.conversions.contains_key(&key) {
            return Ok(false);
        }
        state.conversions.insert(
            key,
            Conversion {
                id: Uuid::new_v4(),
                visitor_id: new.visitor_id,
                experiment_id: new.experiment_id,
                variant_id: new.variant_id,
                converted_at: new.converted_at,
            },
        );
        Ok(true)
    }

    async fn refresh_results(&self) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        let mut results: HashMap<Uuid, (i64, i64)> = HashMap::new();
        for assignment in state.assignments.values() {
            results.entry(assignment.variant_id).or_default().0 += 1;
        }
        for (key, conversion) in &state.conversions {
            // Only conversions from visitors who still hold the same assignment count.
            let assigned = state
                .assignments
                .get(key)
                .is_some_and(|a| a.variant_id == conversion.variant_id);
            if assigned {
                results.entry(conversion.variant_id).or_default().1 += 1;
            }
        }
        state.results = results;
        Ok(())
    }

    async fn variant_results(&self, experiment_id: Uuid) -> Result<Vec<VariantResult>, AppError> {
        let state = self.state.read().await;
        let mut variants: Vec<&Variant> = state
            .variants
            .iter()
            .filter(|v| v.experiment_id == experiment_id)
            .collect();
        variants.sort_by_key(|v| v.position);

        Ok(variants
            .into_iter()
            .map(|v| {
                let (visitors, conversions) = state.results.get(&v.id).copied().unwrap_or((0, 0));
                VariantResult {
                    variant_id: v.id,
                    variant_key: v.key.clone(),
                    is_control: v.is_control,
                    visitors,
                    conversions,
                }
            })
            .collect())
    }

    async fn assignment_velocity(
        &self,
        experiment_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<AssignmentVelocity, AppError> {
        let state = self.state.read().await;
        let recent = state
            .assignments
            .values()
            .filter(|a| a.experiment_id == experiment_id && a.assigned_at >= since);

        let mut velocity = AssignmentVelocity::default();
        for assignment in recent {
            velocity.assignments += 1;
            velocity.first_assigned_at = Some(match velocity.first_assigned_at {
                Some(first) => first.min(assignment.assigned_at),
                None => assignment.assigned_at,
            });
        }
        Ok(velocity)
    }

    async fn record_activity(&self, entry: ActivityEntry) -> Result<(), AppError> {
        self.state.write().await.activity.push(ActivityRow {
            id: Uuid::new_v4(),
            experiment_id: entry.experiment_id,
            action: entry.action,
            detail: entry.detail,
            created_at: Utc::now(),
        });
        Ok(())
    }
}
