//! Records produced by an external collision detector for one collidable pair.
//!
//! Normals point away from the opposing surface, i.e. along the direction the
//! penetrating feature must move to separate.

use glam::DVec3;
use serde::{Deserialize, Serialize};

/// A vertex of one collidable found inside the other.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PenetratingPoint {
    /// Vertex index in the penetrating collidable.
    pub vertex: usize,
    /// Vertex indices of the nearest face on the opposing collidable.
    pub face: [usize; 3],
    /// Barycentric coordinates of the nearest face point, if the detector supplies them.
    pub coords: Option<DVec3>,
    pub position: DVec3,
    pub normal: DVec3,
    pub depth: f64,
}

/// Two intersecting edges, one per collidable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EdgeEdgeContact {
    pub edge0: [usize; 2],
    pub edge1: [usize; 2],
    /// Parameters of the closest points along each edge, 0 at the first vertex.
    pub s0: f64,
    pub s1: f64,
    pub point0: DVec3,
    pub point1: DVec3,
    /// Points away from the second collidable.
    pub normal: DVec3,
    pub depth: f64,
}

/// Detector output for one collidable pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactData {
    /// Vertices of the first collidable inside the second.
    pub points0: Vec<PenetratingPoint>,
    /// Vertices of the second collidable inside the first.
    pub points1: Vec<PenetratingPoint>,
    pub edge_edge: Vec<EdgeEdgeContact>,
}

impl ContactData {
    pub fn is_empty(&self) -> bool {
        self.points0.is_empty() && self.points1.is_empty() && self.edge_edge.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points0.len() + self.points1.len() + self.edge_edge.len()
    }
}
