//! Routing table - adapter registry and target resolution.
//!
//! Features:
//!   - Adapter registration and status tracking
//!   - Idempotent key → adapter route lists
//!   - Built-in services resolved ahead of any adapter
//!   - Pluggable selection among live candidates

mod adapter;
mod selector;

pub use adapter::{AdapterMetrics, AdapterRegistration, AdapterStatus, ConnectionHandle};
pub use selector::{AdapterSelector, RandomSelector, RoundRobinSelector};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::services::BuiltinService;
use crate::types::{AdapterId, Error, Result};

/// Where a target resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Builtin(BuiltinService),
    Adapter(AdapterId),
}

/// Snapshot counters for health reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingStats {
    pub total_adapters: usize,
    pub connected_adapters: usize,
    pub route_keys: usize,
}

/// Adapter registry plus key → adapter route lists.
///
/// Plain data; the kernel serializes access with one lock and keeps its
/// critical sections short.
#[derive(Debug, Default)]
pub struct RoutingTable {
    adapters: HashMap<AdapterId, AdapterRegistration>,

    /// Route key (language, capability or service name) → adapters, in
    /// registration order.
    routes: HashMap<String, Vec<AdapterId>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    // =============================================================================
    // Adapter Registry
    // =============================================================================

    /// Insert or replace the registration for `registration.id`.
    pub fn upsert_adapter(&mut self, registration: AdapterRegistration) {
        self.adapters.insert(registration.id.clone(), registration);
    }

    /// Remove an adapter and every route pointing at it.
    pub fn remove_adapter(&mut self, id: &AdapterId) -> Option<AdapterRegistration> {
        for list in self.routes.values_mut() {
            list.retain(|a| a != id);
        }
        self.routes.retain(|_, list| !list.is_empty());
        self.adapters.remove(id)
    }

    pub fn adapter(&self, id: &AdapterId) -> Option<&AdapterRegistration> {
        self.adapters.get(id)
    }

    /// All registrations, sorted by id.
    pub fn adapters(&self) -> Vec<AdapterRegistration> {
        let mut all: Vec<AdapterRegistration> = self.adapters.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn status(&self, id: &AdapterId) -> Option<AdapterStatus> {
        self.adapters.get(id).map(|reg| reg.status)
    }

    /// Refresh `last_seen` after a heartbeat.
    pub fn touch(&mut self, id: &AdapterId) -> bool {
        match self.adapters.get_mut(id) {
            Some(reg) => {
                reg.touch();
                true
            }
            None => false,
        }
    }

    /// Count one dispatch outcome against the adapter's metrics.
    pub fn record_result(&mut self, id: &AdapterId, success: bool) {
        if let Some(reg) = self.adapters.get_mut(id) {
            reg.record(success);
        }
    }

    /// Identifiers of every known adapter, sorted.
    pub fn known_adapters(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.keys().map(|id| id.to_string()).collect();
        ids.sort();
        ids
    }

    // =============================================================================
    // Routes
    // =============================================================================

    /// Add `id` to the route list for `key`. Returns false if already present.
    pub fn register_adapter(&mut self, key: &str, id: &AdapterId) -> bool {
        let list = self.routes.entry(key.to_string()).or_default();
        if list.contains(id) {
            return false;
        }
        list.push(id.clone());
        true
    }

    /// Remove `id` from the route list for `key`. Idempotent.
    pub fn unregister_adapter(&mut self, key: &str, id: &AdapterId) -> bool {
        let Some(list) = self.routes.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|a| a != id);
        let removed = before != list.len();
        if list.is_empty() {
            self.routes.remove(key);
        }
        removed
    }

    /// Adapters registered for `key`, whatever their status.
    pub fn registered(&self, key: &str) -> &[AdapterId] {
        self.routes.get(key).map_or(&[], Vec::as_slice)
    }

    /// Routable adapters for `key`.
    pub fn candidates(&self, key: &str) -> Vec<AdapterId> {
        self.registered(key)
            .iter()
            .filter(|id| {
                self.adapters
                    .get(*id)
                    .is_some_and(|reg| reg.status.is_routable())
            })
            .cloned()
            .collect()
    }

    /// Resolve `target` to a built-in service or one live adapter.
    pub fn resolve(&self, target: &str, selector: &dyn AdapterSelector) -> Result<Route> {
        if let Some(service) = BuiltinService::from_target(target) {
            return Ok(Route::Builtin(service));
        }

        let candidates = self.candidates(target);
        selector
            .select(target, &candidates)
            .map(Route::Adapter)
            .ok_or_else(|| Error::no_route(target, self.known_adapters()))
    }

    /// Route key → adapter ids, for diagnostics.
    pub fn routes(&self) -> BTreeMap<String, Vec<String>> {
        self.routes
            .iter()
            .map(|(k, ids)| (k.clone(), ids.iter().map(|id| id.to_string()).collect()))
            .collect()
    }

    pub fn stats(&self) -> RoutingStats {
        RoutingStats {
            total_adapters: self.adapters.len(),
            connected_adapters: self
                .adapters
                .values()
                .filter(|r| r.status.is_routable())
                .count(),
            route_keys: self.routes.len(),
        }
    }
}
