//! Additional math helpers layered on top of `glam`.

use std::f64::consts::{PI, TAU};

use glam::{DMat3, DQuat, DVec3};
use nalgebra::{DMatrix, DVector};

/// Cross-product matrix `[v]x` such that `[v]x * u == v.cross(u)`.
pub fn skew(v: DVec3) -> DMat3 {
    DMat3::from_cols(
        DVec3::new(0.0, v.z, -v.y),
        DVec3::new(-v.z, 0.0, v.x),
        DVec3::new(v.y, -v.x, 0.0),
    )
}

/// Returns the angle equivalent to `angle` (modulo 2π) closest to `reference`.
pub fn find_nearest_angle(reference: f64, angle: f64) -> f64 {
    let mut ang = angle;
    while ang - reference > PI {
        ang -= TAU;
    }
    while ang - reference < -PI {
        ang += TAU;
    }
    ang
}

/// Rotation vector (axis scaled by angle) of a unit quaternion.
pub fn rotation_vector(q: DQuat) -> DVec3 {
    let q = if q.w < 0.0 { -q } else { q };
    let (axis, angle) = q.to_axis_angle();
    if angle.abs() < 1e-300 {
        DVec3::ZERO
    } else {
        axis * angle
    }
}

/// Quaternion for a rotation vector.
pub fn quat_from_rotation_vector(w: DVec3) -> DQuat {
    let angle = w.length();
    if angle < 1e-300 {
        return DQuat::IDENTITY;
    }
    DQuat::from_axis_angle(w / angle, angle)
}

/// Unit vector perpendicular to `n`, used as a fallback tangent direction.
pub fn orthogonal_unit(n: DVec3) -> DVec3 {
    n.any_orthonormal_vector()
}

/// Barycentric weights `(wa, wb, wc)` of `p` with respect to triangle `abc`.
///
/// The point is projected onto the triangle plane. Degenerate triangles
/// return all the weight on `a`.
pub fn triangle_barycentric(p: DVec3, a: DVec3, b: DVec3, c: DVec3) -> DVec3 {
    let v0 = b - a;
    let v1 = c - a;
    let v2 = p - a;
    let d00 = v0.dot(v0);
    let d01 = v0.dot(v1);
    let d11 = v1.dot(v1);
    let d20 = v2.dot(v0);
    let d21 = v2.dot(v1);
    let denom = d00 * d11 - d01 * d01;
    if denom.abs() <= f64::EPSILON * d00 * d11 {
        return DVec3::X;
    }
    let wb = (d11 * d20 - d01 * d21) / denom;
    let wc = (d00 * d21 - d01 * d20) / denom;
    DVec3::new(1.0 - wb - wc, wb, wc)
}

/// Parameter `s` such that `a + s (b - a)` is the projection of `p` onto the line `ab`.
pub fn segment_parameter(p: DVec3, a: DVec3, b: DVec3) -> f64 {
    let d = b - a;
    let len2 = d.length_squared();
    if len2 == 0.0 {
        return 0.0;
    }
    (p - a).dot(d) / len2
}

/// Barycentric weights of `p` with respect to tetrahedron `abcd`, or `None` if it is flat.
pub fn tetrahedron_barycentric(p: DVec3, a: DVec3, b: DVec3, c: DVec3, d: DVec3) -> Option<[f64; 4]> {
    let m = DMat3::from_cols(b - a, c - a, d - a);
    let det = m.determinant();
    if det.abs() < 1e-300 {
        return None;
    }
    let w = m.inverse() * (p - a);
    Some([1.0 - w.x - w.y - w.z, w.x, w.y, w.z])
}

/// Copies a 3x3 `glam` matrix into a block of a dynamic matrix.
pub fn set_block3(dst: &mut DMatrix<f64>, row: usize, col: usize, m: &DMat3) {
    for c in 0..3 {
        let column = m.col(c);
        for r in 0..3 {
            dst[(row + r, col + c)] = column[r];
        }
    }
}

pub fn dvec3_at(v: &DVector<f64>, offset: usize) -> DVec3 {
    DVec3::new(v[offset], v[offset + 1], v[offset + 2])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_angle_wraps_by_full_turns() {
        let a = find_nearest_angle(3.0, -3.0);
        assert!((a - (-3.0 + TAU)).abs() < 1e-12);
        assert!((find_nearest_angle(0.0, 0.5) - 0.5).abs() < 1e-12);
        assert!((find_nearest_angle(-10.0, 0.0) - (-2.0 * TAU)).abs() < 1e-12);
    }

    #[test]
    fn skew_matches_cross_product() {
        let v = DVec3::new(1.0, -2.0, 0.5);
        let u = DVec3::new(0.3, 0.7, -1.1);
        let diff = skew(v) * u - v.cross(u);
        assert!(diff.length() < 1e-14);
    }

    #[test]
    fn rotation_vector_round_trips() {
        let w = DVec3::new(0.2, -0.4, 0.9);
        let back = rotation_vector(quat_from_rotation_vector(w));
        assert!((back - w).length() < 1e-12);
    }

    #[test]
    fn tetrahedron_weights_sum_to_one() {
        let w = tetrahedron_barycentric(
            DVec3::new(0.1, 0.2, 0.3),
            DVec3::ZERO,
            DVec3::X,
            DVec3::Y,
            DVec3::Z,
        )
        .expect("tetrahedron is not flat");
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-14);
        assert!((w[1] - 0.1).abs() < 1e-14);
    }
}
