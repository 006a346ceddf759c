//! Geometric couplings between the joint frames C (on body A) and D (on body B).
//!
//! A coupling restricts the relative transform `TCD`. Each kind defines its
//! coordinates, how coordinates map to a constraint-satisfying transform
//! `TGD`, the bilateral constraint wrenches and the coordinate wrenches. All
//! wrenches and the relative twist are expressed in D's orientation at C's
//! origin, so a wrench dotted with the relative twist is the rate of the
//! corresponding constraint function.

use glam::{DQuat, DVec3};
use serde::{Deserialize, Serialize};

use crate::{
    core::{constraints::Engagement, types::RigidTransform},
    error::{CoreError, CoreResult},
    utils::{
        math::find_nearest_angle,
        spatial::{Twist, Wrench},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionType {
    Linear,
    Rotary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CouplingKind {
    /// Rotation about D's z axis.
    Revolute,
    /// Translation along D's z axis.
    Prismatic,
    /// Translation along and rotation about D's z axis.
    Cylindrical,
    /// Motion in D's xy plane.
    Planar,
    /// Translation along D's x axis and rotation about its z axis.
    SlottedHinge,
    /// Rotation about D's z axis followed by rotation about the rotated y axis.
    Universal,
    /// Coincident origins.
    Spherical,
    /// No relative motion.
    Solid,
}

impl CouplingKind {
    pub fn coordinate_specs(self) -> &'static [(&'static str, MotionType)] {
        use MotionType::{Linear, Rotary};
        match self {
            CouplingKind::Revolute => &[("theta", Rotary)],
            CouplingKind::Prismatic => &[("z", Linear)],
            CouplingKind::Cylindrical => &[("z", Linear), ("theta", Rotary)],
            CouplingKind::Planar => &[("x", Linear), ("y", Linear), ("theta", Rotary)],
            CouplingKind::SlottedHinge => &[("x", Linear), ("theta", Rotary)],
            CouplingKind::Universal => &[("roll", Rotary), ("pitch", Rotary)],
            CouplingKind::Spherical | CouplingKind::Solid => &[],
        }
    }

    pub fn num_coordinates(self) -> usize {
        self.coordinate_specs().len()
    }

    pub fn num_bilaterals(self) -> usize {
        match self {
            CouplingKind::Spherical => 3,
            _ => 6 - self.num_coordinates(),
        }
    }

    /// Raw coordinates of `tcd`; angles are not yet unwrapped.
    fn raw_coordinates(self, tcd: &RigidTransform) -> Vec<f64> {
        let p = tcd.translation;
        let r = tcd.rotation_matrix();
        let yaw = r.x_axis.y.atan2(r.x_axis.x);
        match self {
            CouplingKind::Revolute => vec![yaw],
            CouplingKind::Prismatic => vec![p.z],
            CouplingKind::Cylindrical => vec![p.z, yaw],
            CouplingKind::Planar => vec![p.x, p.y, yaw],
            CouplingKind::SlottedHinge => vec![p.x, yaw],
            CouplingKind::Universal => {
                // R = Rz(roll) Ry(pitch)
                let roll = (-r.y_axis.x).atan2(r.y_axis.y);
                let pitch = (-r.x_axis.z).atan2(r.z_axis.z);
                vec![roll, pitch]
            }
            CouplingKind::Spherical | CouplingKind::Solid => Vec::new(),
        }
    }

    /// Constraint-satisfying transform for the given coordinates.
    pub fn transform_for(self, coords: &[f64]) -> RigidTransform {
        match self {
            CouplingKind::Revolute => RigidTransform::from_rotation(DQuat::from_rotation_z(coords[0])),
            CouplingKind::Prismatic => RigidTransform::from_translation(DVec3::new(0.0, 0.0, coords[0])),
            CouplingKind::Cylindrical => RigidTransform::new(
                DVec3::new(0.0, 0.0, coords[0]),
                DQuat::from_rotation_z(coords[1]),
            ),
            CouplingKind::Planar => RigidTransform::new(
                DVec3::new(coords[0], coords[1], 0.0),
                DQuat::from_rotation_z(coords[2]),
            ),
            CouplingKind::SlottedHinge => RigidTransform::new(
                DVec3::new(coords[0], 0.0, 0.0),
                DQuat::from_rotation_z(coords[1]),
            ),
            CouplingKind::Universal => RigidTransform::from_rotation(
                DQuat::from_rotation_z(coords[0]) * DQuat::from_rotation_y(coords[1]),
            ),
            CouplingKind::Spherical | CouplingKind::Solid => RigidTransform::IDENTITY,
        }
    }

    /// Projection of `tcd` onto the constraint surface. Spherical couplings keep the rotation.
    fn project(self, tcd: &RigidTransform, coords: &[f64]) -> RigidTransform {
        match self {
            CouplingKind::Spherical => RigidTransform::from_rotation(tcd.rotation),
            _ => self.transform_for(coords),
        }
    }

    fn bilateral_wrenches(self, coords: &[f64]) -> Vec<Wrench> {
        let fx = Wrench::force(DVec3::X);
        let fy = Wrench::force(DVec3::Y);
        let fz = Wrench::force(DVec3::Z);
        let mx = Wrench::moment(DVec3::X);
        let my = Wrench::moment(DVec3::Y);
        let mz = Wrench::moment(DVec3::Z);
        match self {
            CouplingKind::Revolute => vec![fx, fy, fz, mx, my],
            CouplingKind::Prismatic => vec![fx, fy, mx, my, mz],
            CouplingKind::Cylindrical => vec![fx, fy, mx, my],
            CouplingKind::Planar => vec![fz, mx, my],
            CouplingKind::SlottedHinge => vec![fy, fz, mx, my],
            CouplingKind::Universal => {
                let (s, c) = coords[0].sin_cos();
                vec![fx, fy, fz, Wrench::moment(DVec3::new(c, s, 0.0))]
            }
            CouplingKind::Spherical => vec![fx, fy, fz],
            CouplingKind::Solid => vec![fx, fy, fz, mx, my, mz],
        }
    }

    fn coordinate_wrenches(self, coords: &[f64]) -> Vec<Wrench> {
        let fx = Wrench::force(DVec3::X);
        let fy = Wrench::force(DVec3::Y);
        let fz = Wrench::force(DVec3::Z);
        let mz = Wrench::moment(DVec3::Z);
        match self {
            CouplingKind::Revolute => vec![mz],
            CouplingKind::Prismatic => vec![fz],
            CouplingKind::Cylindrical => vec![fz, mz],
            CouplingKind::Planar => vec![fx, fy, mz],
            CouplingKind::SlottedHinge => vec![fx, mz],
            CouplingKind::Universal => {
                let (s, c) = coords[0].sin_cos();
                vec![mz, Wrench::moment(DVec3::new(-s, c, 0.0))]
            }
            CouplingKind::Spherical | CouplingKind::Solid => Vec::new(),
        }
    }
}

/// A named scalar coordinate with its range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinateInfo {
    pub name: String,
    pub motion: MotionType,
    pub value: f64,
    pub min: f64,
    pub max: f64,
    reset_engaged: bool,
}

impl CoordinateInfo {
    fn new(name: &str, motion: MotionType) -> Self {
        Self {
            name: name.to_string(),
            motion,
            value: 0.0,
            min: f64::NEG_INFINITY,
            max: f64::INFINITY,
            reset_engaged: false,
        }
    }

    pub fn has_restricted_range(&self) -> bool {
        self.min != f64::NEG_INFINITY || self.max != f64::INFINITY
    }

    pub fn clip_to_range(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    /// Clamps and stores a value; the limit row is re-evaluated on the next engagement pass.
    fn clip_and_set_value(&mut self, value: f64) -> f64 {
        self.value = self.clip_to_range(value);
        self.reset_engaged = true;
        self.value
    }

    /// Signed distance to the nearer limit; negative when outside the range.
    pub fn distance_to_limit(&self) -> f64 {
        (self.value - self.min).min(self.max - self.value)
    }
}

/// One constraint row of a coupling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CouplingRow {
    /// Row wrench in D's orientation.
    pub wrench: Wrench,
    pub motion: MotionType,
    pub distance: f64,
    pub multiplier: f64,
    pub engaged: Engagement,
    pub engaged_count: u32,
    /// Coordinate limited by this row, for unilateral limit rows.
    pub coordinate: Option<usize>,
}

impl CouplingRow {
    fn bilateral(wrench: Wrench) -> Self {
        let motion = if wrench.f.length_squared() > 0.0 {
            MotionType::Linear
        } else {
            MotionType::Rotary
        };
        Self {
            wrench,
            motion,
            distance: 0.0,
            multiplier: 0.0,
            engaged: Engagement::Disengaged,
            engaged_count: 0,
            coordinate: None,
        }
    }

    fn limit(coordinate: usize, motion: MotionType) -> Self {
        Self {
            wrench: Wrench::ZERO,
            motion,
            distance: 0.0,
            multiplier: 0.0,
            engaged: Engagement::Disengaged,
            engaged_count: 0,
            coordinate: Some(coordinate),
        }
    }

    /// Rate of the row's constraint function under a relative twist.
    pub fn contact_speed(&self, rel: &Twist) -> f64 {
        self.wrench.dot(rel)
    }
}

/// Stateful coupling: coordinates, bilateral rows and one limit row per coordinate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RigidBodyCoupling {
    kind: CouplingKind,
    coordinates: Vec<CoordinateInfo>,
    bilaterals: Vec<CouplingRow>,
    limits: Vec<CouplingRow>,
    coordinate_wrenches: Vec<Wrench>,
    tgd: RigidTransform,
    error: Twist,
    pub break_speed: f64,
}

impl RigidBodyCoupling {
    pub fn new(kind: CouplingKind) -> Self {
        let coordinates: Vec<CoordinateInfo> = kind
            .coordinate_specs()
            .iter()
            .map(|(name, motion)| CoordinateInfo::new(name, *motion))
            .collect();
        let zeros = vec![0.0; coordinates.len()];
        let bilaterals = kind
            .bilateral_wrenches(&zeros)
            .into_iter()
            .map(CouplingRow::bilateral)
            .collect();
        let limits = coordinates
            .iter()
            .enumerate()
            .map(|(i, c)| CouplingRow::limit(i, c.motion))
            .collect();
        Self {
            kind,
            coordinate_wrenches: kind.coordinate_wrenches(&zeros),
            coordinates,
            bilaterals,
            limits,
            tgd: RigidTransform::IDENTITY,
            error: Twist::ZERO,
            break_speed: crate::config::DEFAULT_BREAK_SPEED,
        }
    }

    pub fn kind(&self) -> CouplingKind {
        self.kind
    }

    pub fn coordinates(&self) -> &[CoordinateInfo] {
        &self.coordinates
    }

    pub fn coordinate(&self, index: usize) -> CoreResult<&CoordinateInfo> {
        self.coordinates
            .get(index)
            .ok_or(CoreError::CoordinateOutOfBounds {
                index,
                count: self.coordinates.len(),
            })
    }

    pub fn coordinate_values(&self) -> Vec<f64> {
        self.coordinates.iter().map(|c| c.value).collect()
    }

    pub fn set_coordinate_range(&mut self, index: usize, min: f64, max: f64) -> CoreResult<()> {
        if min > max {
            return Err(CoreError::InvalidRange { min, max });
        }
        let count = self.coordinates.len();
        let coord = self
            .coordinates
            .get_mut(index)
            .ok_or(CoreError::CoordinateOutOfBounds { index, count })?;
        coord.min = min;
        coord.max = max;
        if !coord.has_restricted_range() {
            if let Some(row) = self.limits.get_mut(index) {
                row.engaged = Engagement::Disengaged;
                row.engaged_count = 0;
                row.multiplier = 0.0;
                row.distance = 0.0;
                row.wrench = Wrench::ZERO;
            }
        }
        Ok(())
    }

    /// Clamps `value` into range and returns the transform `TCD` realizing it,
    /// with the other coordinates at their current values.
    pub fn set_coordinate(&mut self, index: usize, value: f64) -> CoreResult<(f64, RigidTransform)> {
        let count = self.coordinates.len();
        let coord = self
            .coordinates
            .get_mut(index)
            .ok_or(CoreError::CoordinateOutOfBounds { index, count })?;
        let clamped = coord.clip_and_set_value(value);
        Ok((clamped, self.kind.transform_for(&self.coordinate_values())))
    }

    /// Coordinate wrench in D's orientation; its dot with the relative twist is the coordinate rate.
    pub fn coordinate_wrench(&self, index: usize) -> CoreResult<Wrench> {
        self.coordinate_wrenches
            .get(index)
            .copied()
            .ok_or(CoreError::CoordinateOutOfBounds {
                index,
                count: self.coordinate_wrenches.len(),
            })
    }

    pub fn bilaterals(&self) -> &[CouplingRow] {
        &self.bilaterals
    }

    pub fn limits(&self) -> &[CouplingRow] {
        &self.limits
    }

    pub fn bilaterals_mut(&mut self) -> &mut [CouplingRow] {
        &mut self.bilaterals
    }

    pub fn limits_mut(&mut self) -> &mut [CouplingRow] {
        &mut self.limits
    }

    /// Indices of currently engaged limit rows.
    pub fn engaged_limits(&self) -> Vec<usize> {
        self.limits
            .iter()
            .enumerate()
            .filter(|(_, row)| row.engaged.is_engaged())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn constrained_transform(&self) -> RigidTransform {
        self.tgd
    }

    /// Deviation of C from the constraint surface, in D's orientation.
    pub fn error(&self) -> Twist {
        self.error
    }

    /// Recomputes coordinates, projected transform, row wrenches and distances.
    ///
    /// With `update_engaged`, limit rows are engaged when their coordinate is
    /// outside the range and disengaged when the previous multiplier shows
    /// separation.
    pub fn update(&mut self, tcd: &RigidTransform, rel_vel: &Twist, update_engaged: bool) {
        let raw = self.kind.raw_coordinates(tcd);
        for (coord, value) in self.coordinates.iter_mut().zip(raw) {
            coord.value = match coord.motion {
                MotionType::Rotary => find_nearest_angle(coord.value, value),
                MotionType::Linear => value,
            };
        }
        let values = self.coordinate_values();
        self.tgd = self.kind.project(tcd, &values);
        let (dp, dr) = self.tgd.difference(tcd);
        self.error = Twist::new(dp, dr);

        for (row, wrench) in self
            .bilaterals
            .iter_mut()
            .zip(self.kind.bilateral_wrenches(&values))
        {
            row.wrench = wrench;
            row.distance = wrench.dot(&self.error);
        }
        self.coordinate_wrenches = self.kind.coordinate_wrenches(&values);

        for (i, coord) in self.coordinates.iter_mut().enumerate() {
            let row = &mut self.limits[i];
            let base = self.coordinate_wrenches[i];
            if update_engaged {
                if coord.has_restricted_range() {
                    row.wrench = base.scaled(row.engaged.sign());
                    update_engaged_row(row, coord, rel_vel, self.break_speed);
                }
                coord.reset_engaged = false;
            }
            row.wrench = base.scaled(row.engaged.sign());
            row.distance = match row.engaged {
                Engagement::Lower => coord.value - coord.min,
                Engagement::Upper => coord.max - coord.value,
                Engagement::Disengaged => 0.0,
            };
        }
    }

    pub fn zero_multipliers(&mut self) {
        for row in self.bilaterals.iter_mut().chain(self.limits.iter_mut()) {
            row.multiplier = 0.0;
        }
    }
}

fn update_engaged_row(row: &mut CouplingRow, coord: &CoordinateInfo, rel_vel: &Twist, break_speed: f64) {
    if coord.value <= coord.min {
        if row.engaged != Engagement::Lower {
            row.engaged = Engagement::Lower;
            row.engaged_count = 0;
        }
    } else if coord.value >= coord.max {
        if row.engaged != Engagement::Upper {
            row.engaged = Engagement::Upper;
            row.engaged_count = 0;
        }
    } else if row.engaged.is_engaged() {
        let separating = row.multiplier <= 0.0
            && row.contact_speed(rel_vel) > break_speed
            && row.engaged_count > 1;
        if coord.distance_to_limit() > 0.0 && (coord.reset_engaged || separating) {
            row.engaged = Engagement::Disengaged;
            row.engaged_count = 0;
            row.multiplier = 0.0;
        }
    }
    if row.engaged.is_engaged() {
        row.engaged_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn row_counts_complement_coordinates() {
        for kind in [
            CouplingKind::Revolute,
            CouplingKind::Prismatic,
            CouplingKind::Cylindrical,
            CouplingKind::Planar,
            CouplingKind::SlottedHinge,
            CouplingKind::Universal,
            CouplingKind::Solid,
        ] {
            let coupling = RigidBodyCoupling::new(kind);
            assert_eq!(
                coupling.bilaterals().len() + coupling.coordinates().len(),
                6,
                "{kind:?}"
            );
            assert_eq!(coupling.bilaterals().len(), kind.num_bilaterals());
        }
        assert_eq!(RigidBodyCoupling::new(CouplingKind::Spherical).bilaterals().len(), 3);
        assert_eq!(CouplingKind::Spherical.num_bilaterals(), 3);
    }

    #[test]
    fn coordinates_round_trip_through_transforms() {
        let cases: [(CouplingKind, Vec<f64>); 6] = [
            (CouplingKind::Revolute, vec![0.7]),
            (CouplingKind::Prismatic, vec![-0.3]),
            (CouplingKind::Cylindrical, vec![0.2, -1.1]),
            (CouplingKind::Planar, vec![0.4, -0.2, 2.5]),
            (CouplingKind::SlottedHinge, vec![0.1, 0.9]),
            (CouplingKind::Universal, vec![0.6, -0.4]),
        ];
        for (kind, coords) in cases {
            let mut coupling = RigidBodyCoupling::new(kind);
            let tcd = kind.transform_for(&coords);
            coupling.update(&tcd, &Twist::ZERO, true);
            for (got, want) in coupling.coordinate_values().iter().zip(&coords) {
                assert!((got - want).abs() < 1e-12, "{kind:?}: {got} vs {want}");
            }
            for row in coupling.bilaterals() {
                assert!(row.distance.abs() < 1e-12, "{kind:?}");
            }
        }
    }

    #[test]
    fn revolute_angle_unwraps_past_pi() {
        let mut coupling = RigidBodyCoupling::new(CouplingKind::Revolute);
        for step in 0..=8 {
            let angle = step as f64 * FRAC_PI_2;
            let tcd = CouplingKind::Revolute.transform_for(&[angle]);
            coupling.update(&tcd, &Twist::ZERO, false);
        }
        assert!((coupling.coordinate_values()[0] - 4.0 * std::f64::consts::PI).abs() < 1e-9);
    }

    #[test]
    fn bilateral_distance_reports_translation_error() {
        let mut coupling = RigidBodyCoupling::new(CouplingKind::Revolute);
        let tcd = RigidTransform::from_translation(DVec3::new(0.01, -0.02, 0.03));
        coupling.update(&tcd, &Twist::ZERO, false);
        let d: Vec<f64> = coupling.bilaterals().iter().map(|r| r.distance).collect();
        assert!((d[0] - 0.01).abs() < 1e-15);
        assert!((d[1] + 0.02).abs() < 1e-15);
        assert!((d[2] - 0.03).abs() < 1e-15);
    }

    #[test]
    fn universal_wrenches_are_orthogonal_to_free_axes() {
        let coords = [0.8, -0.3];
        let w = CouplingKind::Universal.bilateral_wrenches(&coords)[3].m;
        let free = CouplingKind::Universal.coordinate_wrenches(&coords);
        for axis in free {
            assert!(w.dot(axis.m).abs() < 1e-15);
        }
    }

    #[test]
    fn limit_engages_and_holds_within_pass() {
        let mut coupling = RigidBodyCoupling::new(CouplingKind::Prismatic);
        coupling.set_coordinate_range(0, -0.1, 0.1).expect("range");
        let tcd = CouplingKind::Prismatic.transform_for(&[0.12]);
        coupling.update(&tcd, &Twist::ZERO, true);
        assert_eq!(coupling.engaged_limits(), vec![0]);
        let row = coupling.limits()[0];
        assert_eq!(row.engaged, Engagement::Upper);
        assert!((row.distance + 0.02).abs() < 1e-12);
        assert_eq!(row.wrench.f, -DVec3::Z);
        assert!(matches!(
            coupling.set_coordinate_range(0, 1.0, -1.0),
            Err(CoreError::InvalidRange { .. })
        ));
    }

    #[test]
    fn unlimiting_a_range_releases_an_engaged_limit() {
        let mut coupling = RigidBodyCoupling::new(CouplingKind::Prismatic);
        coupling.set_coordinate_range(0, -0.1, 0.1).expect("range");
        let tcd = CouplingKind::Prismatic.transform_for(&[0.12]);
        coupling.update(&tcd, &Twist::ZERO, true);
        coupling.limits_mut()[0].multiplier = 3.0;

        coupling.set_coordinate_range(0, -0.1, f64::INFINITY).expect("range");
        assert_eq!(coupling.engaged_limits(), vec![0]);

        coupling
            .set_coordinate_range(0, f64::NEG_INFINITY, f64::INFINITY)
            .expect("range");
        assert!(coupling.engaged_limits().is_empty());
        let row = coupling.limits()[0];
        assert_eq!(row.multiplier, 0.0);
        assert_eq!(row.engaged_count, 0);

        coupling.update(&tcd, &Twist::ZERO, false);
        assert!(coupling.engaged_limits().is_empty());
    }

    #[test]
    fn set_coordinate_clamps() {
        let mut coupling = RigidBodyCoupling::new(CouplingKind::Revolute);
        coupling.set_coordinate_range(0, -1.0, 1.0).expect("range");
        let (value, tcd) = coupling.set_coordinate(0, 2.0).expect("coordinate");
        assert_eq!(value, 1.0);
        let yaw = tcd.rotation_matrix().x_axis.y.atan2(tcd.rotation_matrix().x_axis.x);
        assert!((yaw - 1.0).abs() < 1e-12);
        assert!(coupling.set_coordinate(3, 0.0).is_err());
    }
}
