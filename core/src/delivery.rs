//! Message Delivery Channel: fire-and-forget information messages.
//!
//! Outbound messages resolve their future once the transport has accepted
//! them; there is no end-to-end receipt. Inbound information messages are
//! handed to every subscriber of their descriptor, in arrival order, on the
//! thread that delivered them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::envelope::Envelope;
use crate::future::NetworkFuture;
use crate::model::{MessageKind, ParticipantId, ServiceDescriptor, ServiceMessage};
use crate::telemetry::SessionCounters;
use crate::transport::Transport;
use crate::{NetworkError, Result};

/// Receiver of inbound information messages.
pub trait InformationListener: Send + Sync {
    fn on_information(&self, sender: &ParticipantId, message: &ServiceMessage);
}

impl<F> InformationListener for F
where
    F: Fn(&ParticipantId, &ServiceMessage) + Send + Sync,
{
    fn on_information(&self, sender: &ParticipantId, message: &ServiceMessage) {
        self(sender, message)
    }
}

struct Subscriber {
    id: u64,
    listener: Arc<dyn InformationListener>,
}

type Subscribers = DashMap<ServiceDescriptor, Vec<Subscriber>>;

/// Handle of one information subscription.
pub struct InformationSubscription {
    descriptor: ServiceDescriptor,
    id: u64,
    subscribers: Weak<Subscribers>,
}

impl InformationSubscription {
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Stops delivery to this subscription. Idempotent.
    pub fn cancel(&self) -> bool {
        let Some(subscribers) = self.subscribers.upgrade() else {
            return false;
        };
        let mut removed = false;
        if let Some(mut list) = subscribers.get_mut(&self.descriptor) {
            let before = list.len();
            list.retain(|s| s.id != self.id);
            removed = list.len() != before;
        }
        subscribers.remove_if(&self.descriptor, |_, list| list.is_empty());
        removed
    }
}

pub struct DeliveryChannel {
    local: ParticipantId,
    transport: Arc<dyn Transport>,
    runtime: Handle,
    subscribers: Arc<Subscribers>,
    next_subscription: AtomicU64,
    counters: Arc<SessionCounters>,
}

impl DeliveryChannel {
    pub(crate) fn new(
        local: ParticipantId,
        transport: Arc<dyn Transport>,
        runtime: Handle,
        counters: Arc<SessionCounters>,
    ) -> Self {
        Self {
            local,
            transport,
            runtime,
            subscribers: Arc::new(DashMap::new()),
            next_subscription: AtomicU64::new(1),
            counters,
        }
    }

    /// Sends an information message to one participant.
    pub fn send(&self, target: ParticipantId, message: ServiceMessage) -> Result<NetworkFuture<()>> {
        let envelope = self.envelope(message)?;
        let ack = NetworkFuture::new();
        let pending = ack.clone();
        let transport = Arc::clone(&self.transport);
        let counters = Arc::clone(&self.counters);
        self.runtime.spawn(async move {
            match transport.send(&target, envelope).await {
                Ok(()) => {
                    SessionCounters::incr(&counters.information_sent);
                    pending.complete(());
                }
                Err(err) => {
                    warn!(target: "delivery", to = %target, error = %err, "Failed to deliver information message");
                    SessionCounters::incr(&counters.transport_failures);
                    pending.fail(err.into());
                }
            }
        });
        Ok(ack)
    }

    /// Sends an information message to every reachable participant.
    pub fn broadcast(&self, message: ServiceMessage) -> Result<NetworkFuture<()>> {
        let envelope = self.envelope(message)?;
        let ack = NetworkFuture::new();
        let pending = ack.clone();
        let transport = Arc::clone(&self.transport);
        let counters = Arc::clone(&self.counters);
        self.runtime.spawn(async move {
            match transport.broadcast(envelope).await {
                Ok(()) => {
                    SessionCounters::incr(&counters.information_sent);
                    pending.complete(());
                }
                Err(err) => {
                    warn!(target: "delivery", error = %err, "Failed to broadcast information message");
                    SessionCounters::incr(&counters.transport_failures);
                    pending.fail(err.into());
                }
            }
        });
        Ok(ack)
    }

    /// Registers `listener` for inbound information tagged with `descriptor`.
    pub fn subscribe(
        &self,
        descriptor: ServiceDescriptor,
        listener: Arc<dyn InformationListener>,
    ) -> InformationSubscription {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(descriptor.clone())
            .or_default()
            .push(Subscriber { id, listener });
        info!(target: "delivery", service = %descriptor, "Subscribed to information messages");
        InformationSubscription {
            descriptor,
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    pub(crate) fn dispatch(&self, envelope: Envelope) {
        SessionCounters::incr(&self.counters.information_received);
        let listeners: Vec<Arc<dyn InformationListener>> = self
            .subscribers
            .get(envelope.descriptor())
            .map(|list| list.iter().map(|s| Arc::clone(&s.listener)).collect())
            .unwrap_or_default();
        if listeners.is_empty() {
            debug!(target: "delivery", service = %envelope.descriptor(), from = %envelope.sender, "No subscriber for information message");
            return;
        }
        for listener in listeners {
            listener.on_information(&envelope.sender, &envelope.message);
        }
    }

    pub(crate) fn clear(&self) {
        self.subscribers.clear();
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribers.iter().map(|e| e.value().len()).sum()
    }

    fn envelope(&self, message: ServiceMessage) -> Result<Envelope> {
        if message.kind != MessageKind::Information {
            return Err(NetworkError::InvalidArgument(format!(
                "delivery requires an information message, got {:?}",
                message.kind
            )));
        }
        Ok(Envelope::information(self.local.clone(), message))
    }
}
