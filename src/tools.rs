use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use uuid::Uuid;

use crate::model::ToolDownload;

/// Base period between tool catalog refreshes.
pub const TOOLS_UPDATE_INTERVAL: Duration = Duration::from_secs(40 * 60);
/// Upper bound of the jitter added to each refresh period so that a fleet
/// of controllers does not hit the forge in lockstep.
const TOOLS_UPDATE_JITTER_SECS: u64 = 120;

pub fn jittered_update_interval() -> Duration {
    let jitter = rand::rng().random_range(0..=TOOLS_UPDATE_JITTER_SECS);
    TOOLS_UPDATE_INTERVAL + Duration::from_secs(jitter)
}

/// Runner-tool download catalogs keyed by entity, shared between each
/// entity's updater loop and its add-pending reconciler.
#[derive(Clone, Default)]
pub struct ToolsCache {
    inner: Arc<DashMap<Uuid, Vec<ToolDownload>>>,
}

impl ToolsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, entity_id: Uuid, tools: Vec<ToolDownload>) {
        self.inner.insert(entity_id, tools);
    }

    pub fn get(&self, entity_id: Uuid) -> Option<Vec<ToolDownload>> {
        self.inner.get(&entity_id).map(|tools| tools.clone())
    }

    /// Drop the catalog, typically because credentials changed and cached
    /// download tokens may no longer be valid.
    pub fn reset(&self, entity_id: Uuid) {
        self.inner.remove(&entity_id);
    }
}
