//! Application state shared across request handlers.

use crate::coordinator::{FetchCoordinator, StampedeConfig};
use crate::origin::OriginFetch;
use crate::store::CoordinationStore;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<FetchCoordinator>,
    /// Same store the coordinator uses; held separately for health checks.
    pub store: Arc<dyn CoordinationStore>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        origin: Arc<dyn OriginFetch>,
        stampede: StampedeConfig,
    ) -> Self {
        let coordinator = Arc::new(FetchCoordinator::new(store.clone(), origin, stampede));
        Self {
            coordinator,
            store,
            started_at: Instant::now(),
        }
    }
}
