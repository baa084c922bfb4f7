use std::collections::HashSet;

use crate::errors::{AppError, FieldError};
use crate::experiments::models::{CreateExperimentRequest, NewExperiment, NewVariant};

pub const MAX_KEY_LEN: usize = 64;
pub const MIN_VARIANTS: usize = 2;
pub const MAX_VARIANTS: usize = 10;
pub const DEFAULT_VARIANT_WEIGHT: i32 = 50;
pub const DEFAULT_TRAFFIC_PERCENTAGE: i32 = 100;
pub const DEFAULT_MINIMUM_SAMPLE_SIZE: i32 = 100;

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

fn clean_labels(labels: &[String]) -> Vec<String> {
    labels
        .iter()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

/// Validates a create request, collecting every field error before failing.
/// When no variant is flagged as control, the first one becomes the control.
pub fn validate_new_experiment(req: CreateExperimentRequest) -> Result<NewExperiment, AppError> {
    let mut errors = Vec::new();

    let key = req.key.trim().to_string();
    if !is_valid_key(&key) {
        errors.push(FieldError::new(
            "key",
            format!("must be 1-{MAX_KEY_LEN} characters of a-z, 0-9, '-' or '_'"),
        ));
    }

    let name = req.name.trim().to_string();
    if name.is_empty() {
        errors.push(FieldError::new("name", "must not be empty"));
    }

    let traffic_percentage = req.traffic_percentage.unwrap_or(DEFAULT_TRAFFIC_PERCENTAGE);
    if !(0..=100).contains(&traffic_percentage) {
        errors.push(FieldError::new("traffic_percentage", "must be between 0 and 100"));
    }

    let minimum_sample_size = req.minimum_sample_size.unwrap_or(DEFAULT_MINIMUM_SAMPLE_SIZE);
    if minimum_sample_size < 1 {
        errors.push(FieldError::new("minimum_sample_size", "must be at least 1"));
    }

    if !(MIN_VARIANTS..=MAX_VARIANTS).contains(&req.variants.len()) {
        errors.push(FieldError::new(
            "variants",
            format!("must contain between {MIN_VARIANTS} and {MAX_VARIANTS} variants"),
        ));
    }

    let mut seen = HashSet::new();
    let mut variants = Vec::with_capacity(req.variants.len());
    for (i, variant) in req.variants.iter().enumerate() {
        let variant_key = variant.key.trim().to_string();
        if !is_valid_key(&variant_key) {
            errors.push(FieldError::new(
                format!("variants[{i}].key"),
                format!("must be 1-{MAX_KEY_LEN} characters of a-z, 0-9, '-' or '_'"),
            ));
        } else if !seen.insert(variant_key.clone()) {
            errors.push(FieldError::new(
                format!("variants[{i}].key"),
                format!("duplicate variant key '{variant_key}'"),
            ));
        }

        let weight = variant.weight.unwrap_or(DEFAULT_VARIANT_WEIGHT);
        if weight <= 0 {
            errors.push(FieldError::new(format!("variants[{i}].weight"), "must be positive"));
        }

        let name = variant
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| variant_key.clone());

        variants.push(NewVariant {
            key: variant_key,
            name,
            weight,
            is_control: variant.is_control,
        });
    }

    match variants.iter().filter(|v| v.is_control).count() {
        0 => {
            if let Some(first) = variants.first_mut() {
                first.is_control = true;
            }
        }
        1 => {}
        _ => errors.push(FieldError::new("variants", "at most one variant may be the control")),
    }

    if !errors.is_empty() {
        let message = errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(AppError::Validation {
            message,
            fields: errors,
        });
    }

    Ok(NewExperiment {
        key,
        name,
        description: req
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty()),
        target_positions: clean_labels(&req.target_positions),
        target_locations: clean_labels(&req.target_locations),
        traffic_percentage,
        minimum_sample_size,
        variants,
    })
}
