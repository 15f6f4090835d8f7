//! Transport seam and an in-process implementation.
//!
//! Wire encoding, security and physical I/O live behind [`Transport`]. The
//! session hands outbound envelopes to the transport and receives inbound ones
//! through the [`InboundHandle`] it binds at connect time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, trace};

use crate::envelope::Envelope;
use crate::model::ParticipantId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,

    #[error("participant unreachable: {0}")]
    Unreachable(ParticipantId),

    #[error("I/O failure: {0}")]
    Io(String),
}

/// Receiving side of a connection, called by the transport for every
/// arriving envelope.
pub(crate) trait InboundRouter: Send + Sync {
    fn route(&self, envelope: Envelope);
}

/// Hook a transport uses to deliver inbound envelopes to its connection.
///
/// The handle does not keep the connection alive; delivering to a dropped
/// connection reports `false`.
#[derive(Clone)]
pub struct InboundHandle {
    router: Weak<dyn InboundRouter>,
}

impl InboundHandle {
    pub(crate) fn new(router: Weak<dyn InboundRouter>) -> Self {
        Self { router }
    }

    /// Hands `envelope` to the connection. Never blocks on service callbacks.
    pub fn deliver(&self, envelope: Envelope) -> bool {
        match self.router.upgrade() {
            Some(router) => {
                router.route(envelope);
                true
            }
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.router.strong_count() > 0
    }
}

impl std::fmt::Debug for InboundHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundHandle")
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Outbound half of the network, implemented by concrete transports.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Attaches the inbound hook for `local`; called once when the connection
    /// is built.
    fn bind(&self, local: &ParticipantId, inbound: InboundHandle);

    /// Sends `envelope` to a single participant.
    async fn send(&self, target: &ParticipantId, envelope: Envelope)
        -> Result<(), TransportError>;

    /// Sends `envelope` to every reachable participant except the sender.
    async fn broadcast(&self, envelope: Envelope) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    /// Releases the transport; later sends fail with [`TransportError::Closed`].
    async fn shutdown(&self);
}

/// In-process network linking any number of [`MemoryTransport`]s.
///
/// Delivery is synchronous and ordered per sender. Traffic from a muted
/// participant is accepted by its transport and then silently lost, which is
/// how tests model requests whose responses never arrive.
#[derive(Debug, Default)]
pub struct MemoryNetwork {
    endpoints: DashMap<ParticipantId, InboundHandle>,
    muted: DashSet<ParticipantId>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A fresh, unbound transport on this network.
    pub fn transport(self: &Arc<Self>) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: Arc::clone(self),
            local: RwLock::new(None),
            open: AtomicBool::new(true),
        })
    }

    /// Drops everything `id` sends from now on.
    pub fn mute(&self, id: &ParticipantId) {
        self.muted.insert(id.clone());
    }

    pub fn unmute(&self, id: &ParticipantId) {
        self.muted.remove(id);
    }

    pub fn participants(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self.endpoints.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn endpoint(&self, id: &ParticipantId) -> Option<InboundHandle> {
        self.endpoints.get(id).map(|e| e.value().clone())
    }
}

/// Transport attached to a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    local: RwLock<Option<ParticipantId>>,
    open: AtomicBool,
}

impl MemoryTransport {
    fn sender_is_muted(&self) -> bool {
        self.local
            .read()
            .as_ref()
            .map(|id| self.network.muted.contains(id))
            .unwrap_or(false)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn bind(&self, local: &ParticipantId, inbound: InboundHandle) {
        debug!(target: "transport", participant = %local, "Binding memory transport");
        *self.local.write() = Some(local.clone());
        self.network.endpoints.insert(local.clone(), inbound);
    }

    async fn send(
        &self,
        target: &ParticipantId,
        envelope: Envelope,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.sender_is_muted() {
            trace!(target: "transport", to = %target, correlation_id = %envelope.correlation_id, "Muted sender; dropping envelope");
            return Ok(());
        }
        let endpoint = self
            .network
            .endpoint(target)
            .ok_or_else(|| TransportError::Unreachable(target.clone()))?;
        if endpoint.deliver(envelope) {
            Ok(())
        } else {
            self.network.endpoints.remove(target);
            Err(TransportError::Unreachable(target.clone()))
        }
    }

    async fn broadcast(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.sender_is_muted() {
            return Ok(());
        }
        let local = self.local.read().clone();
        let targets: Vec<(ParticipantId, InboundHandle)> = self
            .network
            .endpoints
            .iter()
            .filter(|e| Some(e.key()) != local.as_ref())
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (id, endpoint) in targets {
            if !endpoint.deliver(envelope.clone()) {
                self.network.endpoints.remove(&id);
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn shutdown(&self) {
        self.open.store(false, Ordering::Release);
        if let Some(id) = self.local.read().as_ref() {
            debug!(target: "transport", participant = %id, "Memory transport shut down");
            self.network.endpoints.remove(id);
        }
    }
}
