//! In-memory platform backend.
//!
//! [`InMemoryPlatform`] implements the full adapter contract against a map
//! of simulated resources. It backs the test suite and dry runs, and can
//! inject failures per operation and resource to exercise retry, poisoning
//! and idempotency paths.
//!
//! ## Behaviour
//!
//! - `create_*` is not idempotent on its own: two creates with the same key
//!   produce two resources, as on a backend without client tokens.
//! - `delete_network` refuses to delete a network that still has instances
//!   attached.
//! - Deletes of unknown ids return `NotFound`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::lab::{ResourceKind, ResourceSpec};
use crate::platform::{
    ComputeHandle, NetworkHandle, Placement, PlatformAdapter, PlatformError, PlatformResult,
    ResourceKey, ResourceState, ResourceStatus,
};

/// Adapter operations, for fault injection and call inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateNetwork,
    DeleteNetwork,
    CreateCompute,
    StartCompute,
    StopCompute,
    DeleteCompute,
    GetStatus,
}

/// An injected failure.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail before touching any state.
    Fail(PlatformError),
    /// Apply the operation, then report the error (the response was lost).
    ApplyThenFail(PlatformError),
    /// Apply the operation, then stall before responding.
    Stall(Duration),
}

/// One observed adapter call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub operation: Operation,
    /// Logical resource name the call acted on.
    pub resource: String,
    pub started: Instant,
    /// `None` if the call failed or was abandoned.
    pub completed: Option<Instant>,
}

#[derive(Debug, Clone)]
struct SimResource {
    key: String,
    name: String,
    kind: ResourceKind,
    state: ResourceState,
    address: Option<String>,
    networks: Vec<String>,
}

#[derive(Debug, Default)]
struct Inner {
    resources: HashMap<String, SimResource>,
    faults: HashMap<(Operation, String), VecDeque<Fault>>,
    calls: Vec<CallRecord>,
    in_flight: usize,
    max_in_flight: usize,
    next_id: u64,
}

/// Simulated backend holding resources in memory.
#[derive(Debug)]
pub struct InMemoryPlatform {
    name: String,
    latency: Duration,
    inner: Mutex<Inner>,
}

/// Tracks one in-flight call; records completion or abandonment on drop.
struct CallGuard<'a> {
    platform: &'a InMemoryPlatform,
    index: usize,
    completed: bool,
}

impl CallGuard<'_> {
    fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.platform.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        if self.completed {
            if let Some(call) = inner.calls.get_mut(self.index) {
                call.completed = Some(Instant::now());
            }
        }
    }
}

impl InMemoryPlatform {
    /// Create a backend that answers immediately.
    pub fn new(name: &str) -> Self {
        Self::with_latency(name, Duration::ZERO)
    }

    /// Create a backend that takes `latency` for every mutating call.
    pub fn with_latency(name: &str, latency: Duration) -> Self {
        Self {
            name: name.to_string(),
            latency,
            inner: Mutex::new(Inner::default()),
        }
    }

    // The lock is never held across an await, so a poisoned lock only
    // means a test assertion panicked mid-call; the data is still usable.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a fault for the next call of `operation` on `resource`.
    ///
    /// Faults queue up: injecting two makes the next two calls fail.
    pub fn inject(&self, operation: Operation, resource: &str, fault: Fault) {
        self.lock()
            .faults
            .entry((operation, resource.to_string()))
            .or_default()
            .push_back(fault);
    }

    /// Shorthand for `inject(operation, resource, Fault::Fail(error))`.
    pub fn fail_next(&self, operation: Operation, resource: &str, error: PlatformError) {
        self.inject(operation, resource, Fault::Fail(error));
    }

    /// Remove a resource behind the orchestrator's back.
    pub fn remove_out_of_band(&self, resource: &str) -> usize {
        let mut inner = self.lock();
        let before = inner.resources.len();
        inner.resources.retain(|_, r| r.name != resource);
        before - inner.resources.len()
    }

    /// Number of live resources with the given logical name.
    pub fn resource_count(&self, resource: &str) -> usize {
        self.lock()
            .resources
            .values()
            .filter(|r| r.name == resource)
            .count()
    }

    /// Number of live resources of any name.
    pub fn total_resources(&self) -> usize {
        self.lock().resources.len()
    }

    /// State of the first live resource with the given logical name.
    pub fn state_of(&self, resource: &str) -> Option<ResourceState> {
        self.lock()
            .resources
            .values()
            .find(|r| r.name == resource)
            .map(|r| r.state)
    }

    /// Every call observed so far, in start order.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.lock().calls.clone()
    }

    /// Calls of `operation` on `resource`.
    pub fn call_count(&self, operation: Operation, resource: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation && c.resource == resource)
            .count()
    }

    /// Highest number of simultaneous mutating calls seen.
    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    fn begin(&self, operation: Operation, resource: &str) -> CallGuard<'_> {
        let mut inner = self.lock();
        inner.in_flight += 1;
        inner.max_in_flight = inner.max_in_flight.max(inner.in_flight);
        inner.calls.push(CallRecord {
            operation,
            resource: resource.to_string(),
            started: Instant::now(),
            completed: None,
        });
        CallGuard {
            platform: self,
            index: inner.calls.len() - 1,
            completed: false,
        }
    }

    fn take_fault(&self, operation: Operation, resource: &str) -> Option<Fault> {
        self.lock()
            .faults
            .get_mut(&(operation, resource.to_string()))
            .and_then(VecDeque::pop_front)
    }

    fn name_of(&self, id: &str) -> String {
        self.lock()
            .resources
            .get(id)
            .map(|r| r.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    /// Run one mutating operation with latency and fault handling.
    async fn perform<T>(
        &self,
        operation: Operation,
        resource: &str,
        apply: impl FnOnce(&mut Inner) -> PlatformResult<T>,
    ) -> PlatformResult<T> {
        let guard = self.begin(operation, resource);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let fault = self.take_fault(operation, resource);
        if let Some(Fault::Fail(err)) = fault {
            return Err(err);
        }

        let result = apply(&mut *self.lock());

        match fault {
            Some(Fault::ApplyThenFail(err)) => Err(err),
            Some(Fault::Stall(duration)) => {
                tokio::time::sleep(duration).await;
                guard.complete();
                result
            }
            _ => {
                if result.is_ok() {
                    guard.complete();
                }
                result
            }
        }
    }
}

impl Inner {
    fn allocate_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:04}", prefix, self.next_id)
    }
}

#[async_trait]
impl PlatformAdapter for InMemoryPlatform {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_network(
        &self,
        key: &ResourceKey,
        spec: &ResourceSpec,
    ) -> PlatformResult<NetworkHandle> {
        self.perform(Operation::CreateNetwork, &spec.name, |inner| {
            let id = inner.allocate_id("net");
            inner.resources.insert(
                id.clone(),
                SimResource {
                    key: key.to_string(),
                    name: spec.name.clone(),
                    kind: ResourceKind::Network,
                    state: ResourceState::Available,
                    address: None,
                    networks: Vec::new(),
                },
            );
            Ok(NetworkHandle { network_id: id })
        })
        .await
    }

    async fn delete_network(&self, network_id: &str) -> PlatformResult<()> {
        let name = self.name_of(network_id);
        self.perform(Operation::DeleteNetwork, &name, |inner| {
            if !inner.resources.contains_key(network_id) {
                return Err(PlatformError::NotFound(network_id.to_string()));
            }
            let attached = inner
                .resources
                .values()
                .filter(|r| r.networks.iter().any(|n| n == network_id))
                .count();
            if attached > 0 {
                return Err(PlatformError::Permanent(format!(
                    "network {} still has {} attached instances",
                    network_id, attached
                )));
            }
            inner.resources.remove(network_id);
            Ok(())
        })
        .await
    }

    async fn create_compute(
        &self,
        key: &ResourceKey,
        spec: &ResourceSpec,
        placement: &Placement,
    ) -> PlatformResult<ComputeHandle> {
        self.perform(Operation::CreateCompute, &spec.name, |inner| {
            for network in &placement.network_ids {
                if !inner.resources.contains_key(network) {
                    return Err(PlatformError::NotFound(format!("network {}", network)));
                }
            }
            let id = inner.allocate_id("vm");
            let address = format!("10.0.{}.{}", inner.next_id / 250, inner.next_id % 250 + 2);
            inner.resources.insert(
                id.clone(),
                SimResource {
                    key: key.to_string(),
                    name: spec.name.clone(),
                    kind: ResourceKind::Compute,
                    state: ResourceState::Stopped,
                    address: Some(address.clone()),
                    networks: placement.network_ids.clone(),
                },
            );
            Ok(ComputeHandle {
                compute_id: id,
                address: Some(address),
            })
        })
        .await
    }

    async fn start_compute(&self, compute_id: &str) -> PlatformResult<()> {
        let name = self.name_of(compute_id);
        self.perform(Operation::StartCompute, &name, |inner| {
            let vm = inner
                .resources
                .get_mut(compute_id)
                .ok_or_else(|| PlatformError::NotFound(compute_id.to_string()))?;
            vm.state = ResourceState::Running;
            Ok(())
        })
        .await
    }

    async fn stop_compute(&self, compute_id: &str) -> PlatformResult<()> {
        let name = self.name_of(compute_id);
        self.perform(Operation::StopCompute, &name, |inner| {
            let vm = inner
                .resources
                .get_mut(compute_id)
                .ok_or_else(|| PlatformError::NotFound(compute_id.to_string()))?;
            vm.state = ResourceState::Stopped;
            Ok(())
        })
        .await
    }

    async fn delete_compute(&self, compute_id: &str) -> PlatformResult<()> {
        let name = self.name_of(compute_id);
        self.perform(Operation::DeleteCompute, &name, |inner| {
            inner
                .resources
                .remove(compute_id)
                .map(|_| ())
                .ok_or_else(|| PlatformError::NotFound(compute_id.to_string()))
        })
        .await
    }

    async fn get_status(
        &self,
        kind: ResourceKind,
        key: &ResourceKey,
    ) -> PlatformResult<ResourceStatus> {
        let guard = self.begin(Operation::GetStatus, key.resource());
        if let Some(Fault::Fail(err)) = self.take_fault(Operation::GetStatus, key.resource()) {
            return Err(err);
        }

        let key = key.to_string();
        let status = {
            let inner = self.lock();
            let found = inner
                .resources
                .iter()
                .filter(|(_, r)| r.key == key && r.kind == kind)
                .min_by(|(a, _), (b, _)| a.cmp(b));
            lookup_status(found)
        };
        guard.complete();
        Ok(status)
    }
}

fn lookup_status(found: Option<(&String, &SimResource)>) -> ResourceStatus {
    match found {
        Some((id, r)) => ResourceStatus {
            exists: true,
            resource_id: Some(id.clone()),
            state: r.state,
            address: r.address.clone(),
        },
        None => ResourceStatus::absent(),
    }
}
