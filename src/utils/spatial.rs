use glam::{DMat3, DVec3};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use super::math::{set_block3, skew};

/// Spatial velocity `[v; w]` in world coordinates.
///
/// `v` is the velocity of the frame origin and `w` the angular velocity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Twist {
    pub v: DVec3,
    pub w: DVec3,
}

impl Twist {
    pub const ZERO: Self = Self {
        v: DVec3::ZERO,
        w: DVec3::ZERO,
    };

    pub fn new(v: DVec3, w: DVec3) -> Self {
        Self { v, w }
    }

    /// Velocity of a material point at world offset `r` from the origin.
    pub fn point_velocity(&self, r: DVec3) -> DVec3 {
        self.v + self.w.cross(r)
    }

    /// The same motion described at an origin shifted by `r`.
    pub fn shifted(&self, r: DVec3) -> Twist {
        Twist::new(self.point_velocity(r), self.w)
    }

    pub fn to_vector(&self) -> DVector<f64> {
        DVector::from_column_slice(&[self.v.x, self.v.y, self.v.z, self.w.x, self.w.y, self.w.z])
    }

    pub fn from_slice(s: &[f64]) -> Self {
        Self {
            v: DVec3::new(s[0], s[1], s[2]),
            w: DVec3::new(s[3], s[4], s[5]),
        }
    }

    pub fn rotated(&self, r: &DMat3) -> Twist {
        Twist::new(*r * self.v, *r * self.w)
    }
}

impl std::ops::Sub for Twist {
    type Output = Self;
    fn sub(self, other: Self) -> Self {
        Self::new(self.v - other.v, self.w - other.w)
    }
}

/// Spatial force `[f; m]`, moment taken about the frame origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Wrench {
    pub f: DVec3,
    pub m: DVec3,
}

impl Wrench {
    pub const ZERO: Self = Self {
        f: DVec3::ZERO,
        m: DVec3::ZERO,
    };

    pub fn new(f: DVec3, m: DVec3) -> Self {
        Self { f, m }
    }

    pub fn force(f: DVec3) -> Self {
        Self::new(f, DVec3::ZERO)
    }

    pub fn moment(m: DVec3) -> Self {
        Self::new(DVec3::ZERO, m)
    }

    /// Power delivered against a twist.
    pub fn dot(&self, twist: &Twist) -> f64 {
        self.f.dot(twist.v) + self.m.dot(twist.w)
    }

    /// The same wrench about an origin from which the current origin lies at `r`.
    pub fn about(&self, r: DVec3) -> Wrench {
        Wrench::new(self.f, self.m + r.cross(self.f))
    }

    pub fn rotated(&self, r: &DMat3) -> Wrench {
        Wrench::new(*r * self.f, *r * self.m)
    }

    pub fn scaled(&self, s: f64) -> Wrench {
        Wrench::new(self.f * s, self.m * s)
    }

    pub fn to_vector(&self) -> DVector<f64> {
        DVector::from_column_slice(&[self.f.x, self.f.y, self.f.z, self.m.x, self.m.y, self.m.z])
    }

    pub fn from_slice(s: &[f64]) -> Self {
        Self {
            f: DVec3::new(s[0], s[1], s[2]),
            m: DVec3::new(s[3], s[4], s[5]),
        }
    }
}

impl std::ops::Add for Wrench {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self::new(self.f + other.f, self.m + other.m)
    }
}

impl std::ops::AddAssign for Wrench {
    fn add_assign(&mut self, other: Self) {
        self.f += other.f;
        self.m += other.m;
    }
}

impl std::ops::Neg for Wrench {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.f, -self.m)
    }
}

/// Mass and rotational inertia of a frame, both about the frame origin.
///
/// `inertia` is expressed in body coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpatialInertia {
    pub mass: f64,
    pub inertia: DMat3,
}

impl Default for SpatialInertia {
    fn default() -> Self {
        Self {
            mass: 1.0,
            inertia: DMat3::IDENTITY,
        }
    }
}

impl SpatialInertia {
    pub fn new(mass: f64, inertia: DMat3) -> Self {
        Self { mass, inertia }
    }

    pub fn solid_box(mass: f64, half_extents: DVec3) -> Self {
        let l = half_extents * 2.0;
        let factor = mass / 12.0;
        Self::new(
            mass,
            DMat3::from_diagonal(DVec3::new(
                factor * (l.y * l.y + l.z * l.z),
                factor * (l.x * l.x + l.z * l.z),
                factor * (l.x * l.x + l.y * l.y),
            )),
        )
    }

    pub fn solid_sphere(mass: f64, radius: f64) -> Self {
        Self::new(mass, DMat3::from_diagonal(DVec3::splat(0.4 * mass * radius * radius)))
    }

    /// 6x6 world-frame mass matrix for a frame rotated by `rotation`.
    pub fn world_matrix(&self, rotation: &DMat3) -> DMatrix<f64> {
        let mut m = DMatrix::zeros(6, 6);
        set_block3(&mut m, 0, 0, &DMat3::from_diagonal(DVec3::splat(self.mass)));
        let j = *rotation * self.inertia * rotation.transpose();
        set_block3(&mut m, 3, 3, &j);
        m
    }
}

/// Jacobian mapping a frame twist to the velocity of a point at world offset `r`.
pub fn point_jacobian(r: DVec3) -> DMatrix<f64> {
    let mut j = DMatrix::zeros(3, 6);
    set_block3(&mut j, 0, 0, &DMat3::IDENTITY);
    set_block3(&mut j, 0, 3, &(-skew(r)));
    j
}

/// Jacobian mapping a frame twist to the twist of a frame rigidly offset by `r`.
pub fn frame_jacobian(r: DVec3) -> DMatrix<f64> {
    let mut j = DMatrix::zeros(6, 6);
    set_block3(&mut j, 0, 0, &DMat3::IDENTITY);
    set_block3(&mut j, 0, 3, &(-skew(r)));
    set_block3(&mut j, 3, 3, &DMat3::IDENTITY);
    j
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrench_power_is_origin_independent() {
        let twist = Twist::new(DVec3::new(0.1, 0.2, -0.3), DVec3::new(1.0, 0.5, 0.2));
        let wrench = Wrench::new(DVec3::new(2.0, -1.0, 0.5), DVec3::new(0.0, 0.3, 0.1));
        let r = DVec3::new(0.4, -0.7, 1.2);
        // moving the origin by r changes the twist and wrench consistently
        let p0 = wrench.dot(&twist);
        let p1 = wrench.about(-r).dot(&twist.shifted(r));
        assert!((p0 - p1).abs() < 1e-12);
    }

    #[test]
    fn point_jacobian_matches_point_velocity() {
        let twist = Twist::new(DVec3::new(1.0, 0.0, 2.0), DVec3::new(0.0, 3.0, -1.0));
        let r = DVec3::new(0.5, 0.25, -1.0);
        let v = point_jacobian(r) * twist.to_vector();
        let expected = twist.point_velocity(r);
        assert!((v[0] - expected.x).abs() < 1e-14);
        assert!((v[1] - expected.y).abs() < 1e-14);
        assert!((v[2] - expected.z).abs() < 1e-14);
    }
}
