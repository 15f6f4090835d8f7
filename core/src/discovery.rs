use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::area::Area;
use crate::future::NetworkFuture;
use crate::model::{ParticipantId, PositionTime, ServiceDescriptor};
use crate::Result;

/// Source of participant positions and advertised services.
///
/// Whether the answers come from a local cache or a distributed index is up
/// to the implementation.
#[async_trait]
pub trait SpatialStore: Send + Sync {
    /// Participants whose last known position may lie in `area`. Returning a
    /// superset is allowed; the index re-checks containment.
    async fn query(&self, area: &Area) -> Result<Vec<(ParticipantId, PositionTime)>>;

    /// Every advertised (participant, service) pair.
    async fn services(&self) -> Result<Vec<(ParticipantId, ServiceDescriptor)>>;

    fn advertise(&self, _participant: &ParticipantId, _descriptor: &ServiceDescriptor) {}

    fn withdraw(&self, _participant: &ParticipantId, _descriptor: &ServiceDescriptor) {}

    fn withdraw_all(&self, _participant: &ParticipantId) {}
}

/// Decides whether an advertised service satisfies a requested service type.
pub trait CapabilityRegistry: Send + Sync {
    fn matches(&self, service_type: &ServiceDescriptor, descriptor: &ServiceDescriptor) -> bool;
}

/// Same service name and an advertised version at least the requested one.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionedCapabilities;

impl CapabilityRegistry for VersionedCapabilities {
    fn matches(&self, service_type: &ServiceDescriptor, descriptor: &ServiceDescriptor) -> bool {
        service_type.name == descriptor.name && descriptor.version >= service_type.version
    }
}

/// In-memory store of last known positions and advertised services
#[derive(Debug, Default)]
pub struct MemorySpatialStore {
    positions: DashMap<ParticipantId, PositionTime>,
    services: DashMap<ParticipantId, HashSet<ServiceDescriptor>>, // participant -> advertised services
}

impl MemorySpatialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an observation; older observations than the stored one are ignored.
    pub fn report(&self, participant: ParticipantId, observation: PositionTime) {
        self.positions
            .entry(participant)
            .and_modify(|current| {
                if observation.time >= current.time {
                    *current = observation;
                }
            })
            .or_insert(observation);
    }

    pub fn last_position(&self, participant: &ParticipantId) -> Option<PositionTime> {
        self.positions.get(participant).map(|e| *e.value())
    }

    pub fn forget(&self, participant: &ParticipantId) {
        self.positions.remove(participant);
        self.services.remove(participant);
    }

    pub fn advertised_by(&self, participant: &ParticipantId) -> Vec<ServiceDescriptor> {
        let mut list: Vec<_> = self
            .services
            .get(participant)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        list.sort();
        list
    }
}

#[async_trait]
impl SpatialStore for MemorySpatialStore {
    async fn query(&self, area: &Area) -> Result<Vec<(ParticipantId, PositionTime)>> {
        Ok(self
            .positions
            .iter()
            .filter(|e| area.contains(&e.value().position))
            .map(|e| (e.key().clone(), *e.value()))
            .collect())
    }

    async fn services(&self) -> Result<Vec<(ParticipantId, ServiceDescriptor)>> {
        Ok(self
            .services
            .iter()
            .flat_map(|e| {
                let id = e.key().clone();
                e.value()
                    .iter()
                    .map(move |d| (id.clone(), d.clone()))
                    .collect::<Vec<_>>()
            })
            .collect())
    }

    fn advertise(&self, participant: &ParticipantId, descriptor: &ServiceDescriptor) {
        self.services
            .entry(participant.clone())
            .or_default()
            .insert(descriptor.clone());
    }

    fn withdraw(&self, participant: &ParticipantId, descriptor: &ServiceDescriptor) {
        if let Some(mut set) = self.services.get_mut(participant) {
            set.remove(descriptor);
        }
        self.services.remove_if(participant, |_, set| set.is_empty());
    }

    fn withdraw_all(&self, participant: &ParticipantId) {
        self.services.remove(participant);
    }
}

/// Discovery Index: answers area and capability lookups through futures.
///
/// Both lookups run on the runtime, never on the caller, and resolve to a
/// snapshot as of their resolution.
pub struct DiscoveryIndex {
    store: Arc<dyn SpatialStore>,
    capabilities: Arc<dyn CapabilityRegistry>,
    runtime: Handle,
    deadline: Option<Duration>,
}

impl DiscoveryIndex {
    pub(crate) fn new(
        store: Arc<dyn SpatialStore>,
        capabilities: Arc<dyn CapabilityRegistry>,
        runtime: Handle,
        deadline: Option<Duration>,
    ) -> Self {
        Self {
            store,
            capabilities,
            runtime,
            deadline,
        }
    }

    /// Last known positions of every participant inside `area`.
    pub fn find_all(&self, area: Area) -> NetworkFuture<HashMap<ParticipantId, PositionTime>> {
        let future = self.new_future();
        let result = future.clone();
        let store = Arc::clone(&self.store);
        self.runtime.spawn(async move {
            match store.query(&area).await {
                Ok(rows) => {
                    let mut found: HashMap<ParticipantId, PositionTime> = HashMap::new();
                    for (id, observation) in rows {
                        if !area.contains(&observation.position) {
                            continue;
                        }
                        match found.get(&id) {
                            Some(current) if current.time > observation.time => {}
                            _ => {
                                found.insert(id, observation);
                            }
                        }
                    }
                    debug!(target: "discovery", matches = found.len(), "Area lookup resolved");
                    result.complete(found);
                }
                Err(err) => {
                    warn!(target: "discovery", error = %err, "Area lookup failed");
                    result.fail(err);
                }
            }
        });
        future
    }

    /// Participants advertising a service compatible with `service_type`. When
    /// a participant advertises several compatible versions the highest wins.
    pub fn find_services(
        &self,
        service_type: ServiceDescriptor,
    ) -> NetworkFuture<HashMap<ParticipantId, ServiceDescriptor>> {
        let future = self.new_future();
        let result = future.clone();
        let store = Arc::clone(&self.store);
        let capabilities = Arc::clone(&self.capabilities);
        self.runtime.spawn(async move {
            match store.services().await {
                Ok(rows) => {
                    let mut found: HashMap<ParticipantId, ServiceDescriptor> = HashMap::new();
                    for (id, descriptor) in rows {
                        if !capabilities.matches(&service_type, &descriptor) {
                            continue;
                        }
                        match found.get(&id) {
                            Some(current) if current.version >= descriptor.version => {}
                            _ => {
                                found.insert(id, descriptor);
                            }
                        }
                    }
                    debug!(target: "discovery", service = %service_type, matches = found.len(), "Service lookup resolved");
                    result.complete(found);
                }
                Err(err) => {
                    warn!(target: "discovery", service = %service_type, error = %err, "Service lookup failed");
                    result.fail(err);
                }
            }
        });
        future
    }

    pub(crate) fn advertise(&self, participant: &ParticipantId, descriptor: &ServiceDescriptor) {
        self.store.advertise(participant, descriptor);
    }

    pub(crate) fn store(&self) -> Arc<dyn SpatialStore> {
        Arc::clone(&self.store)
    }

    fn new_future<T: Clone + Send + 'static>(&self) -> NetworkFuture<T> {
        let future = NetworkFuture::new();
        match self.deadline {
            Some(deadline) => future.with_deadline_on(&self.runtime, deadline),
            None => future,
        }
    }
}
