use glam::DVec3;
use serde::{Deserialize, Serialize};

use crate::utils::math::{segment_parameter, triangle_barycentric};

/// A captured contact location: world position plus the mesh vertices, with
/// weights summing to one, that interpolate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactPoint {
    position: DVec3,
    vertices: Vec<usize>,
    weights: Vec<f64>,
}

impl ContactPoint {
    /// A point with no vertex support, e.g. a point on a rigid body.
    pub fn at(position: DVec3) -> Self {
        Self {
            position,
            vertices: Vec::new(),
            weights: Vec::new(),
        }
    }

    pub fn from_vertex(position: DVec3, vertex: usize) -> Self {
        Self {
            position,
            vertices: vec![vertex],
            weights: vec![1.0],
        }
    }

    /// Point on a face with known barycentric coordinates.
    pub fn on_face(position: DVec3, face: [usize; 3], coords: DVec3) -> Self {
        Self {
            position,
            vertices: face.to_vec(),
            weights: coords.to_array().to_vec(),
        }
    }

    /// Projects `position` onto the triangle `corners` and records the barycentric weights.
    pub fn on_triangle(position: DVec3, face: [usize; 3], corners: [DVec3; 3]) -> Self {
        let coords = triangle_barycentric(position, corners[0], corners[1], corners[2]);
        Self::on_face(position, face, coords)
    }

    /// Point on an edge at parameter `s` from the first vertex.
    pub fn on_edge(position: DVec3, edge: [usize; 2], s: f64) -> Self {
        Self {
            position,
            vertices: edge.to_vec(),
            weights: vec![1.0 - s, s],
        }
    }

    /// Projects `position` onto the segment `ends` and records the edge weights.
    pub fn on_segment(position: DVec3, edge: [usize; 2], ends: [DVec3; 2]) -> Self {
        let s = segment_parameter(position, ends[0], ends[1]);
        Self::on_edge(position, edge, s)
    }

    pub fn position(&self) -> DVec3 {
        self.position
    }

    pub fn vertices(&self) -> &[usize] {
        &self.vertices
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    /// Pairs of (vertex, weight).
    pub fn support(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.vertices.iter().copied().zip(self.weights.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn random_point(rng: &mut StdRng) -> DVec3 {
        DVec3::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0))
    }

    #[test]
    fn triangle_weights_are_recovered() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut checked = 0;
        while checked < 200 {
            let corners = [random_point(&mut rng), random_point(&mut rng), random_point(&mut rng)];
            let e0 = corners[1] - corners[0];
            let e1 = corners[2] - corners[0];
            let normal = e0.cross(e1);
            // well-shaped triangles only
            if e0.length() < 0.5
                || e1.length() < 0.5
                || normal.length_squared() < 0.25 * e0.length_squared() * e1.length_squared()
            {
                continue;
            }
            let (u, v) = (rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0));
            let (u, v) = if u + v > 1.0 { (1.0 - u, 1.0 - v) } else { (u, v) };
            let weights = [1.0 - u - v, u, v];
            let inside = corners[0] * weights[0] + corners[1] * weights[1] + corners[2] * weights[2];
            let point = inside + normal.normalize() * rng.gen_range(-0.05..0.05);

            let cp = ContactPoint::on_triangle(point, [0, 1, 2], corners);
            for (got, want) in cp.weights().iter().zip(weights) {
                assert_relative_eq!(*got, want, epsilon = 1e-13);
            }
            let rebuilt: DVec3 = cp.support().map(|(v, w)| corners[v] * w).sum();
            assert!((rebuilt - inside).length() < 1e-13);
            checked += 1;
        }
    }

    #[test]
    fn segment_weights_are_recovered() {
        let mut rng = StdRng::seed_from_u64(13);
        let mut checked = 0;
        while checked < 200 {
            let ends = [random_point(&mut rng), random_point(&mut rng)];
            let dir = ends[1] - ends[0];
            if dir.length() < 0.5 {
                continue;
            }
            let s = rng.gen_range(0.0..1.0);
            let on_edge = ends[0] + dir * s;
            let offset = dir.any_orthonormal_vector() * rng.gen_range(-0.1..0.1);

            let cp = ContactPoint::on_segment(on_edge + offset, [4, 9], ends);
            assert_eq!(cp.vertices(), &[4, 9]);
            assert_relative_eq!(cp.weights()[0], 1.0 - s, epsilon = 1e-13);
            assert_relative_eq!(cp.weights()[1], s, epsilon = 1e-13);
            let rebuilt = ends[0] * cp.weights()[0] + ends[1] * cp.weights()[1];
            assert!((rebuilt - on_edge).length() < 1e-13);
            checked += 1;
        }
    }
}
