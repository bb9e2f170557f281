//! Registry of platform adapters keyed by target identifier.
//!
//! Besides lookup, the registry owns the optional global concurrency cap of
//! each backend. The cap is shared by every deployment, so API rate limits
//! that apply to one set of credentials are respected across runs.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::PlatformLimits;
use crate::error::{Error, Result};
use crate::platform::PlatformAdapter;

struct RegisteredPlatform {
    adapter: Arc<dyn PlatformAdapter>,
    limit: Option<Arc<Semaphore>>,
}

/// Maps platform targets to adapters.
#[derive(Default)]
pub struct PlatformRegistry {
    platforms: HashMap<String, RegisteredPlatform>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter for `target`, replacing any previous one.
    pub fn register(&mut self, target: &str, adapter: Arc<dyn PlatformAdapter>) {
        debug!(platform = target, backend = adapter.name(), "registering platform adapter");
        let limit = self.platforms.remove(target).and_then(|p| p.limit);
        self.platforms
            .insert(target.to_string(), RegisteredPlatform { adapter, limit });
    }

    /// Cap the number of in-flight operations against `target`.
    ///
    /// Does nothing if no adapter is registered for the target. The limit is
    /// clamped to `1..=Semaphore::MAX_PERMITS`.
    pub fn set_limit(&mut self, target: &str, max_concurrent: usize) {
        if let Some(platform) = self.platforms.get_mut(target) {
            let permits = max_concurrent.clamp(1, Semaphore::MAX_PERMITS);
            platform.limit = Some(Arc::new(Semaphore::new(permits)));
        }
    }

    /// Apply per-platform limits from configuration.
    pub fn apply_limits(&mut self, limits: &HashMap<String, PlatformLimits>) {
        for (target, limit) in limits {
            if let Some(max) = limit.max_concurrent_operations {
                self.set_limit(target, max);
            }
        }
    }

    /// Look up the adapter for `target`.
    pub fn get(&self, target: &str) -> Result<Arc<dyn PlatformAdapter>> {
        self.platforms
            .get(target)
            .map(|p| Arc::clone(&p.adapter))
            .ok_or_else(|| Error::PlatformNotRegistered(target.to_string()))
    }

    pub fn contains(&self, target: &str) -> bool {
        self.platforms.contains_key(target)
    }

    /// Wait for a slot under the target's global cap, if it has one.
    pub async fn acquire(&self, target: &str) -> Option<OwnedSemaphorePermit> {
        let semaphore = self.platforms.get(target)?.limit.clone()?;
        semaphore.acquire_owned().await.ok()
    }

    /// Registered target identifiers, sorted.
    pub fn targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.platforms.keys().cloned().collect();
        targets.sort();
        targets
    }
}

impl std::fmt::Debug for PlatformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformRegistry")
            .field("targets", &self.targets())
            .finish()
    }
}
