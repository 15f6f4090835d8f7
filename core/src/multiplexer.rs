use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::envelope::{Envelope, RemoteFault};
use crate::future::{CorrelationId, NetworkFuture, Outcome};
use crate::model::{MessageKind, ParticipantId, ServiceDescriptor, ServiceMessage};
use crate::telemetry::SessionCounters;
use crate::transport::Transport;
use crate::{NetworkError, Result};

/// Handler for inbound requests of one registered service.
///
/// The returned message is sent back to the requester as the response; an
/// error is sent back as a service fault. Calls for one registration never
/// overlap.
#[async_trait]
pub trait ServiceCallback: Send + Sync {
    async fn call(&self, sender: ParticipantId, request: ServiceMessage) -> Result<ServiceMessage>;
}

/// Callback backed by a plain closure.
pub struct FnService<F>(F);

#[async_trait]
impl<F> ServiceCallback for FnService<F>
where
    F: Fn(ParticipantId, ServiceMessage) -> Result<ServiceMessage> + Send + Sync,
{
    async fn call(&self, sender: ParticipantId, request: ServiceMessage) -> Result<ServiceMessage> {
        (self.0)(sender, request)
    }
}

/// Wraps a synchronous closure as a [`ServiceCallback`].
pub fn service_fn<F>(f: F) -> Arc<dyn ServiceCallback>
where
    F: Fn(ParticipantId, ServiceMessage) -> Result<ServiceMessage> + Send + Sync + 'static,
{
    Arc::new(FnService(f))
}

struct RegisteredService {
    id: u64,
    queue: mpsc::UnboundedSender<Envelope>,
}

type Registry = DashMap<ServiceDescriptor, RegisteredService>;

/// Outstanding invocation awaiting its response.
pub(crate) struct PendingRequest {
    future: NetworkFuture<ServiceMessage>,
    target: ParticipantId,
    sent_at: DateTime<Utc>,
}

/// Handle owning one inbound-service binding.
///
/// The binding stays active until [`cancel`](Self::cancel) is called or the
/// owning connection closes. Dropping the handle does not cancel it.
pub struct ServiceRegistration {
    descriptor: ServiceDescriptor,
    id: u64,
    registry: Weak<Registry>,
    on_cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ServiceRegistration {
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Removes this binding. Returns true only for the call that actually
    /// removed it; a later registration for the same descriptor is untouched.
    pub fn cancel(&self) -> bool {
        let removed = self
            .registry
            .upgrade()
            .and_then(|registry| registry.remove_if(&self.descriptor, |_, s| s.id == self.id))
            .is_some();
        if removed {
            info!(target: "multiplexer", service = %self.descriptor, "Service registration cancelled");
            if let Some(hook) = self.on_cancel.lock().take() {
                hook();
            }
        }
        removed
    }

    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .map(|registry| {
                registry
                    .get(&self.descriptor)
                    .map(|s| s.id == self.id)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// Runs `hook` once when this registration is cancelled through the handle.
    pub(crate) fn on_cancel(self, hook: impl FnOnce() + Send + 'static) -> Self {
        *self.on_cancel.lock() = Some(Box::new(hook));
        self
    }
}

impl std::fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("descriptor", &self.descriptor)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Service Invocation Multiplexer: routes inbound requests to registered
/// callbacks and pairs outbound requests with their responses.
pub struct ServiceMultiplexer {
    local: ParticipantId,
    transport: Arc<dyn Transport>,
    runtime: Handle,
    // key: descriptor; at most one active binding each
    registry: Arc<Registry>,
    // key: correlation id of the outstanding request
    pending: Arc<DashMap<CorrelationId, PendingRequest>>,
    drained: Arc<Notify>,
    next_registration: AtomicU64,
    counters: Arc<SessionCounters>,
}

impl ServiceMultiplexer {
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
            registry: Arc::new(DashMap::new()),
            pending: Arc::new(DashMap::new()),
            drained: Arc::new(Notify::new()),
            next_registration: AtomicU64::new(1),
            counters,
        }
    }

    /// Binds `callback` to `descriptor`.
    ///
    /// Fails with [`NetworkError::DuplicateRegistration`] while another binding
    /// for the same descriptor is active.
    #[tracing::instrument(skip_all, fields(service = %descriptor))]
    pub fn register(
        &self,
        descriptor: ServiceDescriptor,
        callback: Arc<dyn ServiceCallback>,
    ) -> Result<ServiceRegistration> {
        let id = self.next_registration.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        match self.registry.entry(descriptor.clone()) {
            Entry::Occupied(_) => {
                warn!(target: "multiplexer", service = %descriptor, "Service already registered");
                return Err(NetworkError::DuplicateRegistration(descriptor));
            }
            Entry::Vacant(slot) => {
                slot.insert(RegisteredService { id, queue: tx });
            }
        }

        let worker = ServiceWorker {
            local: self.local.clone(),
            descriptor: descriptor.clone(),
            transport: Arc::clone(&self.transport),
            callback,
        };
        self.runtime.spawn(worker.run(rx));

        info!(target: "multiplexer", service = %descriptor, "Registered service");
        Ok(ServiceRegistration {
            descriptor,
            id,
            registry: Arc::downgrade(&self.registry),
            on_cancel: Mutex::new(None),
        })
    }

    /// Sends an initiating `message` to `target` and returns the future of its
    /// response.
    ///
    /// Only argument errors are returned synchronously; delivery, remote and
    /// deadline failures surface through the future.
    #[tracing::instrument(skip_all, fields(to = %target, service = %message.descriptor))]
    pub fn invoke(
        &self,
        target: ParticipantId,
        message: ServiceMessage,
        deadline: Option<Duration>,
    ) -> Result<NetworkFuture<ServiceMessage>> {
        if message.kind != MessageKind::Initiating {
            return Err(NetworkError::InvalidArgument(format!(
                "invoke requires an initiating message, got {:?}",
                message.kind
            )));
        }

        let future = NetworkFuture::new();
        let correlation_id = future.correlation_id();
        self.pending.insert(
            correlation_id,
            PendingRequest {
                future: future.clone(),
                target: target.clone(),
                sent_at: Utc::now(),
            },
        );

        let pending = Arc::downgrade(&self.pending);
        let drained = Arc::clone(&self.drained);
        let counters = Arc::clone(&self.counters);
        future.on_complete(move |outcome| {
            if let Outcome::Failed(NetworkError::Timeout(_)) = outcome {
                SessionCounters::incr(&counters.timeouts);
            }
            if let Some(pending) = pending.upgrade() {
                pending.remove(&correlation_id);
                if pending.is_empty() {
                    drained.notify_one();
                }
            }
        });
        let future = match deadline {
            Some(deadline) => future.with_deadline_on(&self.runtime, deadline),
            None => future,
        };

        SessionCounters::incr(&self.counters.invocations);
        debug!(target: "multiplexer", correlation_id = %correlation_id, "Invoking remote service");

        let envelope = Envelope::request(correlation_id, self.local.clone(), message);
        let transport = Arc::clone(&self.transport);
        let counters = Arc::clone(&self.counters);
        let sending = future.clone();
        self.runtime.spawn(async move {
            // Cancelled or timed out before it left
            if sending.is_done() {
                return;
            }
            if let Err(err) = transport.send(&target, envelope).await {
                warn!(target: "multiplexer", correlation_id = %correlation_id, to = %target, error = %err, "Failed to send request");
                SessionCounters::incr(&counters.transport_failures);
                sending.fail(err.into());
            }
        });
        Ok(future)
    }

    /// Routes an inbound initiating envelope to its registration, or answers
    /// with a service-unknown fault.
    pub(crate) fn handle_request(&self, envelope: Envelope) {
        SessionCounters::incr(&self.counters.inbound_requests);
        let queue = self
            .registry
            .get(envelope.descriptor())
            .map(|s| s.queue.clone());
        let rejected = match queue {
            Some(queue) => queue.send(envelope).err().map(|e| e.0),
            None => Some(envelope),
        };
        if let Some(request) = rejected {
            self.reply_unknown(request);
        }
    }

    fn reply_unknown(&self, request: Envelope) {
        debug!(target: "multiplexer", service = %request.descriptor(), from = %request.sender, "No registration for inbound request");
        SessionCounters::incr(&self.counters.unknown_service_replies);
        let fault = Envelope::fault(
            &request,
            self.local.clone(),
            RemoteFault::service_unknown(request.descriptor()),
        );
        let transport = Arc::clone(&self.transport);
        self.runtime.spawn(async move {
            if let Err(err) = transport.send(&request.sender, fault).await {
                warn!(target: "multiplexer", to = %request.sender, error = %err, "Failed to send service-unknown reply");
            }
        });
    }

    /// Resolves the pending request a response belongs to. Responses without a
    /// matching entry (late, duplicate, cancelled, or from another participant
    /// than the one asked) are dropped.
    pub(crate) fn handle_response(&self, envelope: Envelope) {
        let correlation_id = envelope.correlation_id;
        let matched = self
            .pending
            .remove_if(&correlation_id, |_, p| p.target == envelope.sender);
        let Some((_, request)) = matched else {
            SessionCounters::incr(&self.counters.orphaned_responses);
            debug!(target: "multiplexer", correlation_id = %correlation_id, from = %envelope.sender, "Discarding orphaned response");
            return;
        };

        SessionCounters::incr(&self.counters.responses);
        let latency_ms = (Utc::now() - request.sent_at).num_milliseconds();
        debug!(target: "multiplexer", correlation_id = %correlation_id, latency_ms, "Response received");
        match envelope.fault {
            None => request.future.complete(envelope.message),
            Some(fault) => request.future.fail(fault.into_error(&envelope.message.descriptor)),
        };
    }

    /// Waits until no request is pending or `timeout` elapses. Returns whether
    /// the registry drained.
    pub(crate) async fn drain(&self, timeout: Duration) -> bool {
        // None: the timeout is beyond the clock's range, wait until drained.
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        loop {
            if self.pending.is_empty() {
                return true;
            }
            match deadline {
                Some(deadline) => tokio::select! {
                    _ = self.drained.notified() => {}
                    _ = tokio::time::sleep_until(deadline) => return self.pending.is_empty(),
                },
                None => self.drained.notified().await,
            }
        }
    }

    /// Fails every pending request with `error`; returns how many were failed.
    pub(crate) fn fail_pending(&self, error: NetworkError) -> usize {
        let ids: Vec<CorrelationId> = self.pending.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, request)) = self.pending.remove(&id) {
                if request.future.fail(error.clone()) {
                    failed += 1;
                }
            }
        }
        failed
    }

    /// Drops every registration; their workers finish queued requests and stop.
    pub(crate) fn clear_registrations(&self) -> usize {
        let count = self.registry.len();
        self.registry.clear();
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn registration_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_registered(&self, descriptor: &ServiceDescriptor) -> bool {
        self.registry.contains_key(descriptor)
    }
}

struct ServiceWorker {
    local: ParticipantId,
    descriptor: ServiceDescriptor,
    transport: Arc<dyn Transport>,
    callback: Arc<dyn ServiceCallback>,
}

impl ServiceWorker {
    // One worker per registration keeps calls to a callback serialized.
    async fn run(self, mut queue: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(request) = queue.recv().await {
            let reply = match self
                .callback
                .call(request.sender.clone(), request.message.clone())
                .await
            {
                Ok(message) => Envelope::answer(&request, self.local.clone(), message),
                Err(err) => {
                    warn!(target: "multiplexer", service = %self.descriptor, from = %request.sender, error = %err, "Service callback failed");
                    Envelope::fault(
                        &request,
                        self.local.clone(),
                        RemoteFault::service_error(err.to_string()),
                    )
                }
            };
            if let Err(err) = self.transport.send(&request.sender, reply).await {
                warn!(target: "multiplexer", service = %self.descriptor, to = %request.sender, error = %err, "Failed to send response");
            }
        }
        debug!(target: "multiplexer", service = %self.descriptor, "Service worker stopped");
    }
}
