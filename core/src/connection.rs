//! Connection Lifecycle Manager.
//!
//! A [`MaritimeConnection`] is one participant's session on the network. It
//! owns the connection state and, through it, the lifetime of the service
//! multiplexer, the delivery channel and the discovery index:
//!
//! ```text
//! OPEN --close()--> CLOSING --(drained | drain deadline)--> CLOSED --(released)--> FULLY_CLOSED
//! ```
//!
//! While CLOSING no new invocations, messages or registrations are accepted,
//! but responses keep flowing so outstanding requests can finish. Whatever is
//! still pending when the drain deadline elapses is failed with
//! [`NetworkError::ConnectionClosed`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::area::Area;
use crate::config::ConnectionConfig;
use crate::delivery::{DeliveryChannel, InformationListener, InformationSubscription};
use crate::discovery::{
    CapabilityRegistry, DiscoveryIndex, MemorySpatialStore, SpatialStore, VersionedCapabilities,
};
use crate::envelope::Envelope;
use crate::future::NetworkFuture;
use crate::model::{MessageKind, ParticipantId, PositionTime, ServiceDescriptor, ServiceMessage};
use crate::multiplexer::{ServiceCallback, ServiceMultiplexer, ServiceRegistration};
use crate::telemetry::{ConnectionStats, SessionCounters};
use crate::transport::{InboundHandle, InboundRouter, Transport};
use crate::{NetworkError, Result};

/// Lifecycle state, ordered from OPEN to FULLY_CLOSED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
    FullyClosed,
}

impl ConnectionState {
    fn ensure_open(self) -> Result<()> {
        match self {
            ConnectionState::Open => Ok(()),
            ConnectionState::Closing => Err(NetworkError::ConnectionClosing),
            ConnectionState::Closed | ConnectionState::FullyClosed => {
                Err(NetworkError::ConnectionClosed)
            }
        }
    }
}

/// Builder for [`MaritimeConnection`].
pub struct ConnectionBuilder {
    local: ParticipantId,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn SpatialStore>>,
    capabilities: Arc<dyn CapabilityRegistry>,
    config: ConnectionConfig,
    runtime: Option<Handle>,
}

impl ConnectionBuilder {
    pub fn new(local: impl Into<ParticipantId>) -> Self {
        Self {
            local: local.into(),
            transport: None,
            store: None,
            capabilities: Arc::new(VersionedCapabilities),
            config: ConnectionConfig::default(),
            runtime: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn spatial_store(mut self, store: Arc<dyn SpatialStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn capabilities(mut self, capabilities: Arc<dyn CapabilityRegistry>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Runtime for background work; defaults to the runtime `connect` is
    /// called from.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Opens the connection and binds it to its transport.
    pub fn connect(self) -> Result<MaritimeConnection> {
        let transport = self
            .transport
            .ok_or_else(|| NetworkError::Config("a transport is required".into()))?;
        if !transport.is_open() {
            return Err(NetworkError::Transport("transport is not open".into()));
        }
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|e| {
                NetworkError::Config(format!("no tokio runtime available: {e}"))
            })?,
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemorySpatialStore::new()));

        let counters = Arc::new(SessionCounters::default());
        let inner = Arc::new(ConnectionInner {
            local: self.local.clone(),
            state: RwLock::new(ConnectionState::Open),
            multiplexer: ServiceMultiplexer::new(
                self.local.clone(),
                Arc::clone(&transport),
                runtime.clone(),
                Arc::clone(&counters),
            ),
            delivery: DeliveryChannel::new(
                self.local.clone(),
                Arc::clone(&transport),
                runtime.clone(),
                Arc::clone(&counters),
            ),
            discovery: DiscoveryIndex::new(
                store,
                self.capabilities,
                runtime.clone(),
                self.config.discovery_timeout,
            ),
            transport: Arc::clone(&transport),
            runtime,
            fully_closed: NetworkFuture::new(),
            counters,
            config: self.config,
        });

        let weak: Weak<ConnectionInner> = Arc::downgrade(&inner);
        let router: Weak<dyn InboundRouter> = weak;
        transport.bind(&self.local, InboundHandle::new(router));

        info!(target: "connection", participant = %self.local, "Connection opened");
        Ok(MaritimeConnection { inner })
    }
}

struct ConnectionInner {
    local: ParticipantId,
    config: ConnectionConfig,
    state: RwLock<ConnectionState>,
    multiplexer: ServiceMultiplexer,
    delivery: DeliveryChannel,
    discovery: DiscoveryIndex,
    transport: Arc<dyn Transport>,
    runtime: Handle,
    fully_closed: NetworkFuture<()>,
    counters: Arc<SessionCounters>,
}

impl InboundRouter for ConnectionInner {
    fn route(&self, envelope: Envelope) {
        let state = *self.state.read();
        match envelope.kind() {
            // Responses are needed while draining; afterwards they are orphans.
            MessageKind::Response => self.multiplexer.handle_response(envelope),
            MessageKind::Initiating if state <= ConnectionState::Closing => {
                self.multiplexer.handle_request(envelope)
            }
            MessageKind::Information if state <= ConnectionState::Closing => {
                self.delivery.dispatch(envelope)
            }
            kind => {
                debug!(target: "connection", participant = %self.local, ?kind, ?state, from = %envelope.sender, "Dropping inbound envelope on closed connection");
            }
        }
    }
}

// Fails the fully-closed future if the close task is dropped before finishing.
struct CloseGuard {
    fully_closed: NetworkFuture<()>,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if self.fully_closed.fail(NetworkError::Interrupted) {
            warn!(target: "connection", "Close interrupted before the connection was fully closed");
        }
    }
}

impl ConnectionInner {
    // The guard is an argument so that dropping the task unpolled still trips it.
    async fn shutdown(self: Arc<Self>, _guard: CloseGuard) {
        let pending = self.multiplexer.pending_count();
        debug!(target: "connection", participant = %self.local, pending, drain_timeout = ?self.config.drain_timeout, "Draining pending requests");
        let drained = self.multiplexer.drain(self.config.drain_timeout).await;

        *self.state.write() = ConnectionState::Closed;
        let forced = self.multiplexer.fail_pending(NetworkError::ConnectionClosed);
        if !drained || forced > 0 {
            warn!(target: "connection", participant = %self.local, forced, "Drain deadline elapsed; failed remaining requests");
        }

        let services = self.multiplexer.clear_registrations();
        self.delivery.clear();
        self.discovery.store().withdraw_all(&self.local);
        self.transport.shutdown().await;
        debug!(target: "connection", participant = %self.local, services, "Released connection resources");

        *self.state.write() = ConnectionState::FullyClosed;
        info!(target: "connection", participant = %self.local, "Connection fully closed");
        self.fully_closed.complete(());
    }
}

/// A participant's session on the maritime network.
///
/// Cloning is cheap and every clone refers to the same session.
#[derive(Clone)]
pub struct MaritimeConnection {
    inner: Arc<ConnectionInner>,
}

impl MaritimeConnection {
    pub fn builder(local: impl Into<ParticipantId>) -> ConnectionBuilder {
        ConnectionBuilder::new(local)
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.inner.local
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    /// True once `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.state() != ConnectionState::Open
    }

    pub fn is_fully_closed(&self) -> bool {
        self.state() == ConnectionState::FullyClosed
    }

    /// Starts a graceful shutdown and returns immediately. Later calls do
    /// nothing.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.write();
            if *state != ConnectionState::Open {
                return;
            }
            *state = ConnectionState::Closing;
        }
        info!(target: "connection", participant = %self.inner.local, pending = self.inner.multiplexer.pending_count(), "Closing connection");
        let guard = CloseGuard {
            fully_closed: self.inner.fully_closed.clone(),
        };
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(inner.shutdown(guard));
    }

    /// Blocks the calling thread until the connection is fully closed or
    /// `timeout` elapses, returning whether it is fully closed.
    ///
    /// Returns [`NetworkError::Interrupted`] if the close task was torn down
    /// before it finished. Must not be called from a task on a single-threaded
    /// runtime that also has to run the close.
    pub fn await_fully_closed(&self, timeout: Duration) -> Result<bool> {
        match self.inner.fully_closed.get(timeout) {
            Ok(()) => Ok(true),
            Err(NetworkError::Elapsed(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Future resolving when the connection reaches FULLY_CLOSED.
    pub fn fully_closed(&self) -> NetworkFuture<()> {
        self.inner.fully_closed.clone()
    }

    /// Invokes a service on `target` with the configured default deadline.
    pub fn invoke_service(
        &self,
        target: ParticipantId,
        message: ServiceMessage,
    ) -> Result<NetworkFuture<ServiceMessage>> {
        self.invoke_with_deadline(target, message, self.inner.config.invoke_timeout)
    }

    /// Invokes a service on `target`; `deadline` overrides the configured one.
    pub fn invoke_with_deadline(
        &self,
        target: ParticipantId,
        message: ServiceMessage,
        deadline: Option<Duration>,
    ) -> Result<NetworkFuture<ServiceMessage>> {
        // The read lock keeps close() from draining between the check and the insert.
        let state = self.inner.state.read();
        state.ensure_open()?;
        self.inner.multiplexer.invoke(target, message, deadline)
    }

    /// Binds `callback` to inbound requests for `descriptor` and advertises the
    /// service to the spatial store.
    pub fn register_service(
        &self,
        descriptor: ServiceDescriptor,
        callback: Arc<dyn ServiceCallback>,
    ) -> Result<ServiceRegistration> {
        let state = self.inner.state.read();
        state.ensure_open()?;
        let registration = self.inner.multiplexer.register(descriptor.clone(), callback)?;
        self.inner.discovery.advertise(&self.inner.local, &descriptor);

        let store = self.inner.discovery.store();
        let local = self.inner.local.clone();
        Ok(registration.on_cancel(move || store.withdraw(&local, &descriptor)))
    }

    /// Sends an information message to `target`. The future resolves once the
    /// transport has accepted it.
    pub fn send_message(
        &self,
        target: ParticipantId,
        message: ServiceMessage,
    ) -> Result<NetworkFuture<()>> {
        let state = self.inner.state.read();
        state.ensure_open()?;
        self.inner.delivery.send(target, message)
    }

    /// Sends an information message to every reachable participant.
    pub fn broadcast_message(&self, message: ServiceMessage) -> Result<NetworkFuture<()>> {
        let state = self.inner.state.read();
        state.ensure_open()?;
        self.inner.delivery.broadcast(message)
    }

    /// Delivers inbound information messages for `descriptor` to `listener`.
    pub fn subscribe_information(
        &self,
        descriptor: ServiceDescriptor,
        listener: Arc<dyn InformationListener>,
    ) -> Result<InformationSubscription> {
        let state = self.inner.state.read();
        state.ensure_open()?;
        Ok(self.inner.delivery.subscribe(descriptor, listener))
    }

    /// Last known positions of the participants inside `area`.
    pub fn find_all(&self, area: Area) -> Result<NetworkFuture<HashMap<ParticipantId, PositionTime>>> {
        self.ensure_not_closed()?;
        Ok(self.inner.discovery.find_all(area))
    }

    /// Participants offering a service compatible with `service_type`.
    pub fn find_services(
        &self,
        service_type: ServiceDescriptor,
    ) -> Result<NetworkFuture<HashMap<ParticipantId, ServiceDescriptor>>> {
        self.ensure_not_closed()?;
        Ok(self.inner.discovery.find_services(service_type))
    }

    /// Hook for transports that deliver envelopes outside of `Transport::bind`.
    pub fn inbound(&self) -> InboundHandle {
        let weak: Weak<ConnectionInner> = Arc::downgrade(&self.inner);
        let router: Weak<dyn InboundRouter> = weak;
        InboundHandle::new(router)
    }

    pub fn stats(&self) -> ConnectionStats {
        self.inner.counters.snapshot(
            self.inner.multiplexer.pending_count(),
            self.inner.multiplexer.registration_count(),
        )
    }

    // Lookups stay available while draining.
    fn ensure_not_closed(&self) -> Result<()> {
        if self.state() >= ConnectionState::Closed {
            return Err(NetworkError::ConnectionClosed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for MaritimeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaritimeConnection")
            .field("local", &self.inner.local)
            .field("state", &self.state())
            .field("pending", &self.inner.multiplexer.pending_count())
            .finish()
    }
}
