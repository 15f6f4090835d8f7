//! Value types shared by every layer of the session: participant identity,
//! positions, service descriptors and the service message itself.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{NetworkError, Result};

/// Stable identifier of a network participant (vessel or shore station).
///
/// The identifier is opaque to the session; transports and stores decide what
/// it means (an MMSI, a station call sign, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier of a vessel keyed by its MMSI, e.g. `mmsi:219000123`.
    pub fn mmsi(mmsi: u32) -> Self {
        Self(format!("mmsi:{mmsi}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A geodetic position in decimal degrees (WGS84).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PositionFields")]
pub struct Position {
    latitude: f64,
    longitude: f64,
}

#[derive(Deserialize)]
struct PositionFields {
    latitude: f64,
    longitude: f64,
}

impl TryFrom<PositionFields> for Position {
    type Error = NetworkError;

    fn try_from(f: PositionFields) -> Result<Self> {
        Position::new(f.latitude, f.longitude)
    }
}

impl Position {
    /// Creates a position, rejecting coordinates outside
    /// `[-90, 90] x [-180, 180]` and non-finite values.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(NetworkError::InvalidArgument(format!(
                "latitude out of range: {latitude}"
            )));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(NetworkError::InvalidArgument(format!(
                "longitude out of range: {longitude}"
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Great-circle distance in metres (haversine on a spherical earth).
    pub fn distance_to(&self, other: &Position) -> f64 {
        const EARTH_RADIUS_M: f64 = 6_371_008.8;
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.longitude - self.longitude).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
    }
}

/// A position paired with the time it was observed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionTime {
    pub position: Position,
    pub time: DateTime<Utc>,
}

impl PositionTime {
    pub fn new(position: Position, time: DateTime<Utc>) -> Self {
        Self { position, time }
    }

    /// Position observed now.
    pub fn now(position: Position) -> Self {
        Self::new(position, Utc::now())
    }
}

/// Versioned identifier of a service type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub version: u32,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:v{}", self.name, self.version)
    }
}

/// Role of a message in an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Begins a request/response exchange.
    Initiating,
    /// Answers an initiating message.
    Response,
    /// Fire-and-forget information, never answered.
    Information,
}

/// Data envelope tagged with the service it belongs to and its role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMessage {
    pub descriptor: ServiceDescriptor,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl ServiceMessage {
    pub fn new(descriptor: ServiceDescriptor, kind: MessageKind, payload: Vec<u8>) -> Self {
        Self {
            descriptor,
            kind,
            payload,
        }
    }

    pub fn initiating(descriptor: ServiceDescriptor, payload: Vec<u8>) -> Self {
        Self::new(descriptor, MessageKind::Initiating, payload)
    }

    pub fn information(descriptor: ServiceDescriptor, payload: Vec<u8>) -> Self {
        Self::new(descriptor, MessageKind::Information, payload)
    }

    /// Builds the response to this message, keeping its descriptor.
    pub fn reply(&self, payload: Vec<u8>) -> Self {
        Self::new(self.descriptor.clone(), MessageKind::Response, payload)
    }

    /// Builds a message whose payload is `value` encoded as JSON.
    pub fn json<T: Serialize>(
        descriptor: ServiceDescriptor,
        kind: MessageKind,
        value: &T,
    ) -> Result<Self> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(descriptor, kind, payload))
    }

    /// Decodes a JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn is_initiating(&self) -> bool {
        self.kind == MessageKind::Initiating
    }
}
