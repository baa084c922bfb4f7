//! Best-effort activity log for operator actions.
//!
//! Entries are written after the primary change has committed, on a detached
//! task. A failed write is logged and dropped; callers never wait on it and
//! nothing retries it.

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::experiments::models::ActivityEntry;
use crate::experiments::store::ExperimentStore;

pub fn record_best_effort(
    store: Arc<dyn ExperimentStore>,
    experiment_id: Option<Uuid>,
    action: &str,
    detail: Value,
) -> JoinHandle<()> {
    let entry = ActivityEntry {
        experiment_id,
        action: action.to_string(),
        detail,
    };
    tokio::spawn(async move {
        let action = entry.action.clone();
        if let Err(e) = store.record_activity(entry).await {
            warn!("Dropped activity entry '{action}': {e}");
        }
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::experiments::store::MemoryExperimentStore;

    #[tokio::test]
    async fn test_activity_is_recorded() {
        let store = Arc::new(MemoryExperimentStore::new());
        let id = Uuid::new_v4();

        record_best_effort(store.clone(), Some(id), "status_changed", json!({"to": "running"}))
            .await
            .unwrap();

        let activity = store.activity().await;
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].experiment_id, Some(id));
        assert_eq!(activity[0].action, "status_changed");
        assert_eq!(activity[0].detail["to"], "running");
    }
}
