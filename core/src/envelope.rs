use serde::{Deserialize, Serialize};

use crate::future::CorrelationId;
use crate::model::{MessageKind, ParticipantId, ServiceDescriptor, ServiceMessage};
use crate::NetworkError;

/// Machine-readable reason carried by a failed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultCode {
    /// The receiver has no active registration for the requested service.
    ServiceUnknown,
    /// The receiver's service callback returned an error.
    ServiceError,
}

/// Failure attached to a response envelope in place of a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFault {
    pub code: FaultCode,
    pub message: String,
}

impl RemoteFault {
    pub fn service_unknown(descriptor: &ServiceDescriptor) -> Self {
        Self {
            code: FaultCode::ServiceUnknown,
            message: format!("no service registered for {descriptor}"),
        }
    }

    pub fn service_error(message: impl Into<String>) -> Self {
        Self {
            code: FaultCode::ServiceError,
            message: message.into(),
        }
    }

    /// Maps the fault onto the error the invoking caller observes.
    pub fn into_error(self, descriptor: &ServiceDescriptor) -> NetworkError {
        match self.code {
            FaultCode::ServiceUnknown => NetworkError::ServiceUnknown(descriptor.clone()),
            FaultCode::ServiceError => NetworkError::Remote(self.message),
        }
    }
}

/// Unit of transmission handed to a [`Transport`](crate::Transport).
///
/// Every envelope carries the correlation id chosen by the requester. Responses
/// copy it from the request they answer, which is how the multiplexer pairs
/// them with pending invocations. Information envelopes get a fresh id that
/// nobody waits on.
///
/// # Examples
///
/// ```
/// use enav_core::{CorrelationId, Envelope, MessageKind, ServiceDescriptor, ServiceMessage};
///
/// let route = ServiceDescriptor::new("route-exchange", 1);
/// let request = Envelope::request(
///     CorrelationId::from_raw(42),
///     "mmsi:219000123".into(),
///     ServiceMessage::initiating(route, b"plan".to_vec()),
/// );
/// let reply = Envelope::response(&request, "shore:dk".into(), b"ok".to_vec());
///
/// assert_eq!(reply.correlation_id, request.correlation_id);
/// assert_eq!(reply.kind(), MessageKind::Response);
/// assert!(reply.fault.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub correlation_id: CorrelationId,
    pub sender: ParticipantId,
    pub message: ServiceMessage,
    pub fault: Option<RemoteFault>,
    /// Creation timestamp in milliseconds since epoch
    pub timestamp_ms: i64,
}

impl Envelope {
    pub fn request(
        correlation_id: CorrelationId,
        sender: ParticipantId,
        message: ServiceMessage,
    ) -> Self {
        Self {
            correlation_id,
            sender,
            message,
            fault: None,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Successful answer to `request`.
    pub fn response(request: &Envelope, sender: ParticipantId, payload: Vec<u8>) -> Self {
        Self::answer(request, sender, request.message.reply(payload))
    }

    /// Answer to `request` carrying a full response message.
    pub fn answer(request: &Envelope, sender: ParticipantId, mut message: ServiceMessage) -> Self {
        message.kind = MessageKind::Response;
        Self {
            correlation_id: request.correlation_id,
            sender,
            message,
            fault: None,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Failed answer to `request`.
    pub fn fault(request: &Envelope, sender: ParticipantId, fault: RemoteFault) -> Self {
        Self {
            correlation_id: request.correlation_id,
            sender,
            message: request.message.reply(Vec::new()),
            fault: Some(fault),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn information(sender: ParticipantId, message: ServiceMessage) -> Self {
        Self::request(CorrelationId::next(), sender, message)
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.message.descriptor
    }
}
