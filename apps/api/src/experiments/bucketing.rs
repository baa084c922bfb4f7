//! Deterministic hashing of visitors into traffic and variant buckets.

use sha1::{Digest, Sha1};

use crate::models::experiment::Variant;

const LONG_SCALE: u64 = 0xfffffffffffffff;

pub const TRAFFIC_SALT: &str = "traffic";
pub const VARIANT_SALT: &str = "variant";

/// Maps (experiment key, visitor id, salt) to a float in [0, 1].
///
/// Same inputs always give the same value, and values are uniformly distributed,
/// so showing something to 20% of visitors is `bucket_hash(..) < 0.2`.
pub fn bucket_hash(experiment_key: &str, visitor_id: &str, salt: &str) -> f64 {
    let mut hasher = Sha1::new();
    hasher.update(format!("{experiment_key}.{visitor_id}{salt}").as_bytes());
    let digest = hasher.finalize();

    // First 15 hex digits of the digest: top 60 bits of the first 8 bytes.
    let head = digest
        .iter()
        .take(8)
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
    (head >> 4) as f64 / LONG_SCALE as f64
}

/// Whether the visitor falls inside the experiment's traffic allocation.
pub fn in_traffic_allocation(experiment_key: &str, visitor_id: &str, traffic_percentage: i32) -> bool {
    if traffic_percentage >= 100 {
        return true;
    }
    if traffic_percentage <= 0 {
        return false;
    }
    bucket_hash(experiment_key, visitor_id, TRAFFIC_SALT) < f64::from(traffic_percentage) / 100.0
}

/// Picks a variant by walking cumulative weights in declaration order.
/// Weights are relative; they do not need to sum to 100.
pub fn select_variant<'a>(
    experiment_key: &str,
    visitor_id: &str,
    variants: &'a [Variant],
) -> Option<&'a Variant> {
    let total: i64 = variants.iter().map(|v| i64::from(v.weight.max(0))).sum();
    if total == 0 {
        return None;
    }

    let target = bucket_hash(experiment_key, visitor_id, VARIANT_SALT) * total as f64;
    let mut cumulative = 0.0;
    for variant in variants.iter().filter(|v| v.weight > 0) {
        cumulative += f64::from(variant.weight);
        if target < cumulative {
            return Some(variant);
        }
    }
    // hash == 1.0 lands past the last boundary
    variants.iter().rev().find(|v| v.weight > 0)
}
