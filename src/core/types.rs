use glam::{DMat3, DQuat, DVec3};
use serde::{Deserialize, Serialize};

use crate::utils::{
    math::{quat_from_rotation_vector, rotation_vector},
    spatial::Twist,
};

/// Rigid transform `T` mapping local coordinates to a parent frame.
///
/// Products compose right to left: `(a * b).transform_point(p) == a.transform_point(b.transform_point(p))`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RigidTransform {
    pub translation: DVec3,
    pub rotation: DQuat,
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl RigidTransform {
    pub const IDENTITY: Self = Self {
        translation: DVec3::ZERO,
        rotation: DQuat::IDENTITY,
    };

    pub fn new(translation: DVec3, rotation: DQuat) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    pub fn from_translation(translation: DVec3) -> Self {
        Self::new(translation, DQuat::IDENTITY)
    }

    pub fn from_rotation(rotation: DQuat) -> Self {
        Self::new(DVec3::ZERO, rotation)
    }

    pub fn rotation_matrix(&self) -> DMat3 {
        DMat3::from_quat(self.rotation)
    }

    pub fn inverse(&self) -> Self {
        let inv = self.rotation.inverse();
        Self::new(-(inv * self.translation), inv)
    }

    pub fn transform_point(&self, p: DVec3) -> DVec3 {
        self.rotation * p + self.translation
    }

    pub fn transform_vector(&self, v: DVec3) -> DVec3 {
        self.rotation * v
    }

    /// Advances the transform by a world-frame twist over `h`.
    pub fn integrate(&mut self, twist: &Twist, h: f64) {
        self.translation += twist.v * h;
        self.rotation = (quat_from_rotation_vector(twist.w * h) * self.rotation).normalize();
    }

    /// Applies a small world-frame displacement `[dp; dr]`.
    pub fn displace(&mut self, dp: DVec3, dr: DVec3) {
        self.translation += dp;
        self.rotation = (quat_from_rotation_vector(dr) * self.rotation).normalize();
    }

    /// Translation and rotation vector taking `self` to `other`, both expressed in the parent frame.
    pub fn difference(&self, other: &RigidTransform) -> (DVec3, DVec3) {
        (
            other.translation - self.translation,
            rotation_vector(other.rotation * self.rotation.inverse()),
        )
    }
}

impl std::ops::Mul for RigidTransform {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.rotation * rhs.translation + self.translation,
            (self.rotation * rhs.rotation).normalize(),
        )
    }
}

/// Friction and compliance of a collidable surface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactMaterial {
    pub friction: f64,
    pub compliance: f64,
    pub damping: f64,
    pub mixing: MixingMode,
}

impl Default for ContactMaterial {
    fn default() -> Self {
        Self {
            friction: 0.0,
            compliance: 0.0,
            damping: 0.0,
            mixing: MixingMode::default(),
        }
    }
}

impl ContactMaterial {
    pub fn with_friction(mut self, friction: f64) -> Self {
        self.friction = friction;
        self
    }

    /// Combined coefficients for a pair of surfaces in contact.
    pub fn combine_with(&self, other: &Self) -> ContactMaterial {
        let mode = self.mixing.resolve(other.mixing);
        ContactMaterial {
            friction: mode.combine(self.friction, other.friction),
            compliance: self.compliance + other.compliance,
            damping: 0.5 * (self.damping + other.damping),
            mixing: mode,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MixingMode {
    #[default]
    Average,
    Min,
    Max,
    GeometricMean,
}

impl MixingMode {
    fn combine(self, a: f64, b: f64) -> f64 {
        match self {
            MixingMode::Average => 0.5 * (a + b),
            MixingMode::Min => a.min(b),
            MixingMode::Max => a.max(b),
            MixingMode::GeometricMean => (a.abs() * b.abs()).sqrt(),
        }
    }

    fn resolve(self, other: MixingMode) -> MixingMode {
        if matches!(self, MixingMode::Average) {
            other
        } else {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixing_modes_combine_expected_values() {
        assert!((MixingMode::Average.combine(0.6, 0.2) - 0.4).abs() < 1e-12);
        assert!((MixingMode::Min.combine(0.6, 0.2) - 0.2).abs() < 1e-12);
        assert!((MixingMode::Max.combine(0.6, 0.2) - 0.6).abs() < 1e-12);
        let expected = (0.6_f64 * 0.2).sqrt();
        assert!((MixingMode::GeometricMean.combine(0.6, 0.2) - expected).abs() < 1e-12);
    }

    #[test]
    fn non_average_mode_wins() {
        let a = ContactMaterial::default().with_friction(0.8);
        let b = ContactMaterial {
            mixing: MixingMode::Min,
            ..ContactMaterial::default().with_friction(0.2)
        };
        assert!((a.combine_with(&b).friction - 0.2).abs() < 1e-12);
    }

    #[test]
    fn transform_composition_and_inverse() {
        let a = RigidTransform::new(
            DVec3::new(1.0, 2.0, 3.0),
            DQuat::from_rotation_z(0.7),
        );
        let b = RigidTransform::new(DVec3::new(-0.5, 0.0, 0.25), DQuat::from_rotation_x(-0.3));
        let p = DVec3::new(0.3, -0.2, 0.9);
        let lhs = (a * b).transform_point(p);
        let rhs = a.transform_point(b.transform_point(p));
        assert!((lhs - rhs).length() < 1e-12);
        let back = (a.inverse() * a).transform_point(p);
        assert!((back - p).length() < 1e-12);
    }
}
