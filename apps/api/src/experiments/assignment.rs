use anyhow::anyhow;
use chrono::Utc;
use tracing::{debug, info};

use crate::errors::AppError;
use crate::experiments::audience::{check_eligibility, Eligibility};
use crate::experiments::bucketing::select_variant;
use crate::experiments::models::{AudienceContext, NewAssignment};
use crate::experiments::store::ExperimentStore;
use crate::models::experiment::{Assignment, ExperimentStatus, Variant};

#[derive(Debug, Clone)]
pub struct ResolvedAssignment {
    pub assignment: Assignment,
    pub variant: Variant,
    /// False when an earlier request (possibly a concurrent one) created the row.
    pub newly_assigned: bool,
}

fn variant_for(variants: Vec<Variant>, assignment: &Assignment) -> Result<Variant, AppError> {
    variants
        .into_iter()
        .find(|v| v.id == assignment.variant_id)
        .ok_or_else(|| {
            AppError::Internal(anyhow!(
                "assignment {} points at missing variant {}",
                assignment.id,
                assignment.variant_id
            ))
        })
}

/// Resolves the visitor's variant for an experiment.
///
/// An existing assignment is always returned unchanged. Otherwise the visitor is
/// bucketed only if the experiment is running and the audience matches; `None`
/// means the visitor gets the default experience. New assignments are written
/// insert-if-absent, and a visitor who loses a concurrent race gets the row the
/// winner stored.
pub async fn assign(
    store: &dyn ExperimentStore,
    visitor_id: &str,
    experiment_key: &str,
    ctx: &AudienceContext,
) -> Result<Option<ResolvedAssignment>, AppError> {
    let visitor_id = visitor_id.trim();
    if visitor_id.is_empty() {
        return Ok(None);
    }

    let Some(experiment) = store.get_experiment_by_key(experiment_key).await? else {
        debug!("Assignment requested for unknown experiment '{experiment_key}'");
        return Ok(None);
    };

    if let Some(existing) = store.find_assignment(visitor_id, experiment.id).await? {
        let variants = store.list_variants(experiment.id).await?;
        let variant = variant_for(variants, &existing)?;
        return Ok(Some(ResolvedAssignment {
            assignment: existing,
            variant,
            newly_assigned: false,
        }));
    }

    if experiment.status != ExperimentStatus::Running {
        return Ok(None);
    }

    let eligibility = check_eligibility(&experiment, visitor_id, ctx);
    if eligibility != Eligibility::Eligible {
        debug!(
            "Visitor not eligible for experiment {}: {eligibility:?}",
            experiment.key
        );
        return Ok(None);
    }

    let variants = store.list_variants(experiment.id).await?;
    let Some(chosen) = select_variant(&experiment.key, visitor_id, &variants) else {
        return Ok(None);
    };

    let inserted = store
        .insert_assignment_if_absent(NewAssignment {
            visitor_id: visitor_id.to_string(),
            experiment_id: experiment.id,
            variant_id: chosen.id,
            landing_url: ctx.url.clone(),
            user_agent: ctx.user_agent.clone(),
            assigned_at: Utc::now(),
        })
        .await?;

    let stored = store
        .find_assignment(visitor_id, experiment.id)
        .await?
        .ok_or_else(|| {
            AppError::Internal(anyhow!(
                "assignment for experiment {} vanished after insert",
                experiment.key
            ))
        })?;

    if inserted {
        info!(
            "Assigned visitor to variant {} of experiment {}",
            chosen.key, experiment.key
        );
    }

    let variant = variant_for(variants, &stored)?;
    Ok(Some(ResolvedAssignment {
        assignment: stored,
        variant,
        newly_assigned: inserted,
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::experiments::models::{NewExperiment, NewVariant, StatusChange};
    use crate::experiments::store::MemoryExperimentStore;
    use crate::models::experiment::Experiment;

    async fn create(
        store: &MemoryExperimentStore,
        key: &str,
        positions: &[&str],
        running: bool,
    ) -> Experiment {
        let detail = store
            .create_experiment(NewExperiment {
                key: key.to_string(),
                name: key.to_string(),
                description: None,
                target_positions: positions.iter().map(|p| p.to_string()).collect(),
                target_locations: vec![],
                traffic_percentage: 100,
                minimum_sample_size: 100,
                variants: vec![
                    NewVariant {
                        key: "control".to_string(),
                        name: "Control".to_string(),
                        weight: 50,
                        is_control: true,
                    },
                    NewVariant {
                        key: "video".to_string(),
                        name: "Video intro".to_string(),
                        weight: 50,
                        is_control: false,
                    },
                ],
            })
            .await
            .unwrap();
        if !running {
            return detail.experiment;
        }
        store
            .update_status(
                detail.experiment.id,
                StatusChange {
                    expected_from: ExperimentStatus::Draft,
                    status: ExperimentStatus::Running,
                    started_at: Some(Utc::now()),
                    ended_at: None,
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_assign_twice_returns_same_variant() {
        let store = MemoryExperimentStore::new();
        let exp = create(&store, "crew-profile", &[], true).await;
        let ctx = AudienceContext::default();

        let first = assign(&store, "visitor-7", "crew-profile", &ctx)
            .await
            .unwrap()
            .unwrap();
        assert!(first.newly_assigned);

        let second = assign(&store, "visitor-7", "crew-profile", &ctx)
            .await
            .unwrap()
            .unwrap();
        assert!(!second.newly_assigned);
        assert_eq!(first.variant.id, second.variant.id);
        assert_eq!(first.assignment.id, second.assignment.id);
        assert_eq!(store.assignment_count(exp.id).await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_requests_converge_on_one_row() {
        let store = Arc::new(MemoryExperimentStore::new());
        let exp = create(&store, "race", &[], true).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                assign(store.as_ref(), "racer", "race", &AudienceContext::default())
                    .await
                    .unwrap()
                    .unwrap()
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        let assignment_id = results[0].assignment.id;
        assert!(results.iter().all(|r| r.assignment.id == assignment_id));
        assert_eq!(results.iter().filter(|r| r.newly_assigned).count(), 1);
        assert_eq!(store.assignment_count(exp.id).await, 1);
    }

    #[tokio::test]
    async fn test_draft_experiment_assigns_nobody() {
        let store = MemoryExperimentStore::new();
        let exp = create(&store, "not-yet", &[], false).await;
        let result = assign(&store, "visitor", "not-yet", &AudienceContext::default())
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(store.assignment_count(exp.id).await, 0);
    }

    #[tokio::test]
    async fn test_unknown_experiment_or_visitor_assigns_nothing() {
        let store = MemoryExperimentStore::new();
        create(&store, "known", &[], true).await;
        let ctx = AudienceContext::default();
        assert!(assign(&store, "v", "missing", &ctx).await.unwrap().is_none());
        assert!(assign(&store, "   ", "known", &ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_audience_mismatch_is_not_persisted() {
        let store = MemoryExperimentStore::new();
        let exp = create(&store, "chef-only", &["Head Chef"], true).await;

        let butler = AudienceContext {
            position: Some("Butler".to_string()),
            ..Default::default()
        };
        assert!(assign(&store, "v1", "chef-only", &butler).await.unwrap().is_none());
        assert_eq!(store.assignment_count(exp.id).await, 0);

        let chef = AudienceContext {
            position: Some("head-chef".to_string()),
            url: Some("https://example.com/jobs/head-chef".to_string()),
            ..Default::default()
        };
        let resolved = assign(&store, "v1", "chef-only", &chef).await.unwrap().unwrap();
        assert_eq!(
            resolved.assignment.landing_url.as_deref(),
            Some("https://example.com/jobs/head-chef")
        );
    }

    #[tokio::test]
    async fn test_existing_assignment_survives_completion() {
        let store = MemoryExperimentStore::new();
        let exp = create(&store, "sticky", &[], true).await;
        let ctx = AudienceContext::default();
        let before = assign(&store, "v9", "sticky", &ctx).await.unwrap().unwrap();

        store
            .update_status(
                exp.id,
                StatusChange {
                    expected_from: ExperimentStatus::Running,
                    status: ExperimentStatus::Completed,
                    started_at: None,
                    ended_at: Some(Utc::now()),
                },
            )
            .await
            .unwrap();

        let after = assign(&store, "v9", "sticky", &ctx).await.unwrap().unwrap();
        assert_eq!(before.variant.id, after.variant.id);
        // New visitors are no longer bucketed.
        assert!(assign(&store, "v10", "sticky", &ctx).await.unwrap().is_none());
    }
}
