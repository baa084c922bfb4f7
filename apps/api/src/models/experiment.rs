use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Completed,
    Archived,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Draft => "draft",
            ExperimentStatus::Running => "running",
            ExperimentStatus::Completed => "completed",
            ExperimentStatus::Archived => "archived",
        }
    }

    /// Completed and archived experiments accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExperimentStatus::Completed | ExperimentStatus::Archived)
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown experiment status '{0}'")]
pub struct UnknownStatus(pub String);

impl TryFrom<String> for ExperimentStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "draft" => Ok(ExperimentStatus::Draft),
            "running" => Ok(ExperimentStatus::Running),
            "completed" => Ok(ExperimentStatus::Completed),
            "archived" => Ok(ExperimentStatus::Archived),
            _ => Err(UnknownStatus(value)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Experiment {
    pub id: Uuid,
    pub key: String,
    pub name: String,
    pub description: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: ExperimentStatus,
    pub target_positions: Vec<String>,
    pub target_locations: Vec<String>,
    pub traffic_percentage: i32,
    pub minimum_sample_size: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Variant {
    pub id: Uuid,
    pub experiment_id: Uuid,
    pub key: String,
    pub name: String,
    pub weight: i32,
    pub is_control: bool,
    /// Declaration order within the experiment; bucketing walks variants in this order.
    pub position: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Assignment {
    pub id: Uuid,
    pub visitor_id: String,
    pub experiment_id: Uuid,
    pub variant_id: Uuid,
    pub landing_url: Option<String>,
    pub user_agent: Option<String>,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Conversion {
    pub id: Uuid,
    pub visitor_id: String,
    pub experiment_id: Uuid,
    pub variant_id: Uuid,
    pub converted_at: DateTime<Utc>,
}

/// One row of the per-variant visitor/conversion rollup.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct VariantResult {
    pub variant_id: Uuid,
    pub variant_key: String,
    pub is_control: bool,
    pub visitors: i64,
    pub conversions: i64,
}

/// Assignment traffic inside the trailing velocity window.
#[derive(Debug, Clone, Default, Serialize, Deserialize, FromRow)]
pub struct AssignmentVelocity {
    pub assignments: i64,
    pub first_assigned_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ActivityRow {
    pub id: Uuid,
    pub experiment_id: Option<Uuid>,
    pub action: String,
    pub detail: Value,
    pub created_at: DateTime<Utc>,
}
