use std::sync::Arc;

use crate::config::Config;
use crate::experiments::store::ExperimentStore;

/// Shared application state injected into all route handlers via Axum extractors.
/// Built once in `main`; nothing here is a module-level singleton.
#[derive(Clone)]
pub struct AppState {
    /// Pluggable persistence. Default: PgExperimentStore. Swap via STORE_BACKEND.
    pub store: Arc<dyn ExperimentStore>,
    pub config: Config,
}
