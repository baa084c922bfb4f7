use crate::experiments::bucketing::in_traffic_allocation;
use crate::experiments::models::AudienceContext;
use crate::models::experiment::Experiment;

/// Outcome of matching a visitor against an experiment's audience filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Bot,
    PositionMismatch,
    LocationMismatch,
    OutsideTraffic,
}

const BOT_MARKERS: &[&str] = &[
    "bot",
    "crawler",
    "spider",
    "slurp",
    "headlesschrome",
    "facebookexternalhit",
    "bingpreview",
    "lighthouse",
];

pub fn is_bot_user_agent(user_agent: &str) -> bool {
    let ua = user_agent.to_ascii_lowercase();
    BOT_MARKERS.iter().any(|marker| ua.contains(marker))
}

/// Normalizes a position or location label for comparison:
/// "Chief-Stewardess " and "chief stewardess" compare equal.
pub fn normalize_label(label: &str) -> String {
    label
        .to_lowercase()
        .replace(['-', '_', '/'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// An empty target list matches everyone. A non-empty one requires a value that
/// normalizes to one of the targets.
pub fn matches_targets(targets: &[String], value: Option<&str>) -> bool {
    if targets.is_empty() {
        return true;
    }
    let Some(value) = value.map(normalize_label).filter(|v| !v.is_empty()) else {
        return false;
    };
    targets.iter().any(|t| normalize_label(t) == value)
}

pub fn check_eligibility(
    experiment: &Experiment,
    visitor_id: &str,
    ctx: &AudienceContext,
) -> Eligibility {
    if ctx.user_agent.as_deref().is_some_and(is_bot_user_agent) {
        return Eligibility::Bot;
    }
    if !matches_targets(&experiment.target_positions, ctx.position.as_deref()) {
        return Eligibility::PositionMismatch;
    }
    if !matches_targets(&experiment.target_locations, ctx.location.as_deref()) {
        return Eligibility::LocationMismatch;
    }
    if !in_traffic_allocation(&experiment.key, visitor_id, experiment.traffic_percentage) {
        return Eligibility::OutsideTraffic;
    }
    Eligibility::Eligible
}
