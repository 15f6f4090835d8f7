//! Geometric areas used to bound discovery queries.

use serde::{Deserialize, Serialize};

use crate::model::Position;
use crate::{NetworkError, Result};

/// All positions within `radius_m` metres of `center`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CircleFields")]
pub struct Circle {
    pub center: Position,
    pub radius_m: f64,
}

/// A simple (non self-intersecting) polygon; the ring is closed implicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PolygonFields")]
pub struct Polygon {
    vertices: Vec<Position>,
}

/// A latitude/longitude rectangle. `west > east` means the box crosses the
/// antimeridian.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BoundingBoxFields")]
pub struct BoundingBox {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

// Wire shapes; decoding goes through the validating constructors.
#[derive(Deserialize)]
struct CircleFields {
    center: Position,
    radius_m: f64,
}

#[derive(Deserialize)]
struct PolygonFields {
    vertices: Vec<Position>,
}

#[derive(Deserialize)]
struct BoundingBoxFields {
    south: f64,
    west: f64,
    north: f64,
    east: f64,
}

impl TryFrom<CircleFields> for Circle {
    type Error = NetworkError;

    fn try_from(f: CircleFields) -> Result<Self> {
        Circle::new(f.center, f.radius_m)
    }
}

impl TryFrom<PolygonFields> for Polygon {
    type Error = NetworkError;

    fn try_from(f: PolygonFields) -> Result<Self> {
        Polygon::new(f.vertices)
    }
}

impl TryFrom<BoundingBoxFields> for BoundingBox {
    type Error = NetworkError;

    fn try_from(f: BoundingBoxFields) -> Result<Self> {
        BoundingBox::new(f.south, f.west, f.north, f.east)
    }
}

/// Containment predicate over positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Area {
    Circle(Circle),
    Polygon(Polygon),
    BoundingBox(BoundingBox),
}

impl Area {
    pub fn circle(center: Position, radius_m: f64) -> Result<Self> {
        Circle::new(center, radius_m).map(Area::Circle)
    }

    pub fn polygon(vertices: Vec<Position>) -> Result<Self> {
        Polygon::new(vertices).map(Area::Polygon)
    }

    pub fn bounding_box(south: f64, west: f64, north: f64, east: f64) -> Result<Self> {
        BoundingBox::new(south, west, north, east).map(Area::BoundingBox)
    }

    pub fn contains(&self, position: &Position) -> bool {
        match self {
            Area::Circle(c) => c.contains(position),
            Area::Polygon(p) => p.contains(position),
            Area::BoundingBox(b) => b.contains(position),
        }
    }
}

impl Circle {
    pub fn new(center: Position, radius_m: f64) -> Result<Self> {
        if !radius_m.is_finite() || radius_m < 0.0 {
            return Err(NetworkError::InvalidArgument(format!(
                "circle radius must be a non-negative distance, got {radius_m}"
            )));
        }
        Ok(Self { center, radius_m })
    }

    pub fn contains(&self, position: &Position) -> bool {
        self.center.distance_to(position) <= self.radius_m
    }
}

impl Polygon {
    pub fn new(vertices: Vec<Position>) -> Result<Self> {
        if vertices.len() < 3 {
            return Err(NetworkError::InvalidArgument(format!(
                "polygon needs at least 3 vertices, got {}",
                vertices.len()
            )));
        }
        Ok(Self { vertices })
    }

    pub fn vertices(&self) -> &[Position] {
        &self.vertices
    }

    /// Even-odd ray casting in the lat/lon plane.
    pub fn contains(&self, position: &Position) -> bool {
        let (x, y) = (position.longitude(), position.latitude());
        let mut inside = false;
        let mut j = self.vertices.len() - 1;
        for i in 0..self.vertices.len() {
            let (xi, yi) = (self.vertices[i].longitude(), self.vertices[i].latitude());
            let (xj, yj) = (self.vertices[j].longitude(), self.vertices[j].latitude());
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

impl BoundingBox {
    pub fn new(south: f64, west: f64, north: f64, east: f64) -> Result<Self> {
        // Corners go through Position so out-of-range values are rejected.
        Position::new(south, west)?;
        Position::new(north, east)?;
        if south > north {
            return Err(NetworkError::InvalidArgument(format!(
                "bounding box south edge {south} is north of {north}"
            )));
        }
        Ok(Self {
            south,
            west,
            north,
            east,
        })
    }

    pub fn contains(&self, position: &Position) -> bool {
        let lat = position.latitude();
        let lon = position.longitude();
        if lat < self.south || lat > self.north {
            return false;
        }
        if self.west <= self.east {
            lon >= self.west && lon <= self.east
        } else {
            lon >= self.west || lon <= self.east
        }
    }
}
