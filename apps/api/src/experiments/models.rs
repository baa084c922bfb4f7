use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::experiment::{Experiment, ExperimentStatus, Variant};

// ────────────────────────────────────────────────────────────────────────────
// Operator requests
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CreateExperimentRequest {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub target_positions: Vec<String>,
    #[serde(default)]
    pub target_locations: Vec<String>,
    #[serde(default)]
    pub traffic_percentage: Option<i32>,
    #[serde(default)]
    pub minimum_sample_size: Option<i32>,
    #[serde(default)]
    pub variants: Vec<VariantRequest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VariantRequest {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub weight: Option<i32>,
    #[serde(default)]
    pub is_control: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: ExperimentStatus,
}

// ────────────────────────────────────────────────────────────────────────────
// Validated inputs handed to the store
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewExperiment {
    pub key: String,
    pub name: String,
    pub description: Option<String>,
    pub target_positions: Vec<String>,
    pub target_locations: Vec<String>,
    pub traffic_percentage: i32,
    pub minimum_sample_size: i32,
    pub variants: Vec<NewVariant>,
}

#[derive(Debug, Clone)]
pub struct NewVariant {
    pub key: String,
    pub name: String,
    pub weight: i32,
    pub is_control: bool,
}

#[derive(Debug, Clone)]
pub struct NewAssignment {
    pub visitor_id: String,
    pub experiment_id: Uuid,
    pub variant_id: Uuid,
    pub landing_url: Option<String>,
    pub user_agent: Option<String>,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewConversion {
    pub visitor_id: String,
    pub experiment_id: Uuid,
    pub variant_id: Uuid,
    pub converted_at: DateTime<Utc>,
}

/// Status change computed by the lifecycle rules and applied by the store.
/// The store applies it only while the row is still in `expected_from`.
/// `started_at` is only written when the stored value is still unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub expected_from: ExperimentStatus,
    pub status: ExperimentStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub experiment_id: Option<Uuid>,
    pub action: String,
    pub detail: Value,
}

// ────────────────────────────────────────────────────────────────────────────
// Visitor-facing types
// ────────────────────────────────────────────────────────────────────────────

/// Optional audience-matching context sent with an assignment request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AudienceContext {
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentDetail {
    #[serde(flatten)]
    pub experiment: Experiment,
    pub variants: Vec<Variant>,
}
