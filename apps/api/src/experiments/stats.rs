//! Conversion statistics for A/B experiments.
//!
//! Each non-baseline variant is compared to the baseline with a pooled
//! two-proportion z-test. A variant is significant only when both it and the
//! baseline have reached the minimum sample size and the two-tailed p-value is
//! below `SIGNIFICANCE_LEVEL`.
//!
//! Baseline: the variant flagged `is_control`, or the first variant in input
//! order when none is flagged.

use serde::Serialize;
use uuid::Uuid;

use crate::models::experiment::VariantResult;

pub const SIGNIFICANCE_LEVEL: f64 = 0.05;

#[derive(Debug, Clone, Serialize)]
pub struct VariantStats {
    pub variant_id: Uuid,
    pub variant_key: String,
    pub visitors: i64,
    pub conversions: i64,
    pub conversion_rate: f64,
    pub is_baseline: bool,
    /// Relative change vs the baseline rate. None for the baseline itself, and
    /// when the baseline rate is zero but this rate is not.
    pub uplift: Option<f64>,
    pub z_score: Option<f64>,
    pub p_value: Option<f64>,
    pub sample_size_reached: bool,
    pub is_significant: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentStats {
    pub baseline_key: String,
    pub variants: Vec<VariantStats>,
    /// True only when every variant reached the minimum sample size.
    pub sample_size_reached: bool,
    /// True when any variant is significant against the baseline.
    pub is_significant: bool,
    /// Significant variant with the best positive uplift, if any.
    pub winner: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZTest {
    pub z_score: f64,
    pub p_value: f64,
}

/// conversions / visitors, or 0 when there are no visitors.
pub fn conversion_rate(conversions: i64, visitors: i64) -> f64 {
    if visitors <= 0 {
        return 0.0;
    }
    conversions as f64 / visitors as f64
}

/// Standard normal cumulative distribution function.
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + libm::erf(x / std::f64::consts::SQRT_2))
}

/// Pooled-variance two-proportion z-test of sample b against sample a.
///
/// Returns None when either sample is empty. A zero standard error (both
/// samples all-converted or all-unconverted) yields z = 0 and p = 1.
pub fn two_proportion_z_test(
    conversions_a: i64,
    visitors_a: i64,
    conversions_b: i64,
    visitors_b: i64,
) -> Option<ZTest> {
    if visitors_a <= 0 || visitors_b <= 0 {
        return None;
    }

    let (n_a, n_b) = (visitors_a as f64, visitors_b as f64);
    let p_a = conversions_a as f64 / n_a;
    let p_b = conversions_b as f64 / n_b;
    let pooled = (conversions_a + conversions_b) as f64 / (n_a + n_b);
    let standard_error = (pooled * (1.0 - pooled) * (1.0 / n_a + 1.0 / n_b)).sqrt();

    if standard_error == 0.0 || !standard_error.is_finite() {
        return Some(ZTest {
            z_score: 0.0,
            p_value: 1.0,
        });
    }

    let z_score = (p_b - p_a) / standard_error;
    let p_value = (2.0 * (1.0 - normal_cdf(z_score.abs()))).clamp(0.0, 1.0);
    Some(ZTest { z_score, p_value })
}

fn relative_uplift(rate: f64, baseline_rate: f64) -> Option<f64> {
    if rate == baseline_rate {
        return Some(0.0);
    }
    if baseline_rate == 0.0 {
        return None;
    }
    Some((rate - baseline_rate) / baseline_rate)
}

/// Computes per-variant rates and significance against the baseline.
///
/// Returns None with fewer than two variants or when no variant has visitors.
pub fn calculate_experiment_stats(
    raw_results: &[VariantResult],
    minimum_sample_size: i64,
) -> Option<ExperimentStats> {
    if raw_results.len() < 2 || raw_results.iter().all(|r| r.visitors <= 0) {
        return None;
    }

    let baseline_index = raw_results.iter().position(|r| r.is_control).unwrap_or(0);
    let baseline = &raw_results[baseline_index];
    let baseline_rate = conversion_rate(baseline.conversions, baseline.visitors);
    let baseline_reached = baseline.visitors >= minimum_sample_size;

    let variants: Vec<VariantStats> = raw_results
        .iter()
        .enumerate()
        .map(|(index, result)| {
            let rate = conversion_rate(result.conversions, result.visitors);
            let reached = result.visitors >= minimum_sample_size;

            if index == baseline_index {
                return VariantStats {
                    variant_id: result.variant_id,
                    variant_key: result.variant_key.clone(),
                    visitors: result.visitors,
                    conversions: result.conversions,
                    conversion_rate: rate,
                    is_baseline: true,
                    uplift: None,
                    z_score: None,
                    p_value: None,
                    sample_size_reached: reached,
                    is_significant: false,
                };
            }

            let test = two_proportion_z_test(
                baseline.conversions,
                baseline.visitors,
                result.conversions,
                result.visitors,
            );
            let is_significant = reached
                && baseline_reached
                && test.is_some_and(|t| t.p_value < SIGNIFICANCE_LEVEL);

            VariantStats {
                variant_id: result.variant_id,
                variant_key: result.variant_key.clone(),
                visitors: result.visitors,
                conversions: result.conversions,
                conversion_rate: rate,
                is_baseline: false,
                uplift: relative_uplift(rate, baseline_rate),
                z_score: test.map(|t| t.z_score),
                p_value: test.map(|t| t.p_value),
                sample_size_reached: reached,
                is_significant,
            }
        })
        .collect();

    let sample_size_reached = variants.iter().all(|v| v.sample_size_reached);
    let is_significant = variants.iter().any(|v| v.is_significant);
    let winner = variants
        .iter()
        .filter(|v| v.is_significant && v.conversion_rate > baseline_rate)
        .max_by(|a, b| a.conversion_rate.total_cmp(&b.conversion_rate))
        .map(|v| v.variant_key.clone());

    Some(ExperimentStats {
        baseline_key: baseline.variant_key.clone(),
        variants,
        sample_size_reached,
        is_significant,
        winner,
    })
}
