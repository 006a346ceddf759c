//! Joints connect frame C on body A to frame D on body B (or ground) through a
//! [`RigidBodyCoupling`], and expose the coupling rows to the assembler.
//!
//! Row wrenches live in D's orientation at C's origin. They are mapped to
//! world wrenches on each body about the body origin, then folded through the
//! attachment graph when a body is itself attached.

use glam::DVec3;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use super::{
    constrainer::{AssemblyContext, Constrainer},
    coupling::{CouplingKind, CouplingRow, MotionType, RigidBodyCoupling},
};
use crate::{
    config::{CoreConfig, DEFAULT_LINEAR_LIMIT_TOL, DEFAULT_ROTARY_LIMIT_TOL},
    core::{constraints::ConstraintInfo, entity::EntitySet, sparse::BlockColumn, types::RigidTransform},
    error::{CoreError, CoreResult},
    utils::{
        allocator::{Arena, EntityId, JointId},
        spatial::{Twist, Wrench},
    },
};

/// Names one scalar coordinate of one joint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JointCoordinateHandle {
    pub joint: JointId,
    pub index: usize,
}

impl JointCoordinateHandle {
    pub fn new(joint: JointId, index: usize) -> Self {
        Self { joint, index }
    }

    pub fn value(&self, joints: &Arena<Joint, JointId>) -> CoreResult<f64> {
        self.resolve(joints)?.coordinate(self.index)
    }

    pub fn resolve<'a>(&self, joints: &'a Arena<Joint, JointId>) -> CoreResult<&'a Joint> {
        let joint = joints.get(self.joint).ok_or(CoreError::UnknownJoint(self.joint))?;
        if self.index >= joint.num_coordinates() {
            return Err(CoreError::CoordinateOutOfBounds {
                index: self.index,
                count: joint.num_coordinates(),
            });
        }
        Ok(joint)
    }
}

#[derive(Debug, Clone)]
pub struct Joint {
    name: Option<String>,
    body_a: EntityId,
    body_b: Option<EntityId>,
    tca: RigidTransform,
    tdb: RigidTransform,
    coupling: RigidBodyCoupling,
    pub compliance: f64,
    pub damping: f64,
    linear_limit_tol: f64,
    rotary_limit_tol: f64,
    // cached by update_body_states
    tcw: RigidTransform,
    tdw: RigidTransform,
    origin_a: DVec3,
    origin_b: DVec3,
    rel_vel: Twist,
    engaged: Vec<usize>,
}

impl Joint {
    /// Creates a joint whose C and D frames both start at `joint_pose` in world coordinates.
    pub fn new(
        kind: CouplingKind,
        entities: &EntitySet,
        body_a: EntityId,
        body_b: Option<EntityId>,
        joint_pose: RigidTransform,
    ) -> CoreResult<Self> {
        let taw = entities.frame(body_a)?.pose;
        let tbw = match body_b {
            Some(b) => entities.frame(b)?.pose,
            None => RigidTransform::IDENTITY,
        };
        let mut joint = Self::from_frames(
            kind,
            body_a,
            taw.inverse() * joint_pose,
            body_b,
            tbw.inverse() * joint_pose,
        );
        joint.update_body_states(entities, true)?;
        Ok(joint)
    }

    /// Creates a joint from C's pose relative to A and D's pose relative to B.
    pub fn from_frames(
        kind: CouplingKind,
        body_a: EntityId,
        tca: RigidTransform,
        body_b: Option<EntityId>,
        tdb: RigidTransform,
    ) -> Self {
        Self {
            name: None,
            body_a,
            body_b,
            tca,
            tdb,
            coupling: RigidBodyCoupling::new(kind),
            compliance: 0.0,
            damping: 0.0,
            linear_limit_tol: DEFAULT_LINEAR_LIMIT_TOL,
            rotary_limit_tol: DEFAULT_ROTARY_LIMIT_TOL,
            tcw: RigidTransform::IDENTITY,
            tdw: RigidTransform::IDENTITY,
            origin_a: DVec3::ZERO,
            origin_b: DVec3::ZERO,
            rel_vel: Twist::ZERO,
            engaged: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_config(mut self, config: &CoreConfig) -> Self {
        self.linear_limit_tol = config.linear_limit_tol;
        self.rotary_limit_tol = config.rotary_limit_tol;
        self.coupling.break_speed = config.break_speed;
        self
    }

    pub fn with_compliance(mut self, compliance: f64, damping: f64) -> Self {
        self.compliance = compliance;
        self.damping = damping;
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn body_a(&self) -> EntityId {
        self.body_a
    }

    pub fn body_b(&self) -> Option<EntityId> {
        self.body_b
    }

    pub fn kind(&self) -> CouplingKind {
        self.coupling.kind()
    }

    pub fn coupling(&self) -> &RigidBodyCoupling {
        &self.coupling
    }

    pub fn coupling_mut(&mut self) -> &mut RigidBodyCoupling {
        &mut self.coupling
    }

    pub fn num_coordinates(&self) -> usize {
        self.coupling.coordinates().len()
    }

    pub fn coordinate(&self, index: usize) -> CoreResult<f64> {
        Ok(self.coupling.coordinate(index)?.value)
    }

    pub fn coordinate_values(&self) -> Vec<f64> {
        self.coupling.coordinate_values()
    }

    /// Sets a coordinate's range; an unbounded range releases its limit row at once.
    pub fn set_coordinate_range(&mut self, index: usize, min: f64, max: f64) -> CoreResult<()> {
        self.coupling.set_coordinate_range(index, min, max)?;
        let engaged = self.coupling.engaged_limits();
        self.engaged.retain(|i| engaged.contains(i));
        Ok(())
    }

    /// World pose of frame C, as of the last update.
    pub fn tcw(&self) -> RigidTransform {
        self.tcw
    }

    /// World pose of frame D, as of the last update.
    pub fn tdw(&self) -> RigidTransform {
        self.tdw
    }

    /// Velocity of C relative to D, in D's orientation.
    pub fn relative_velocity(&self) -> Twist {
        self.rel_vel
    }

    /// Rate of change of a coordinate under the current relative velocity.
    pub fn coordinate_speed(&self, index: usize) -> CoreResult<f64> {
        Ok(self.coupling.coordinate_wrench(index)?.dot(&self.rel_vel))
    }

    /// Recomputes the joint frames, relative velocity, coordinates and row
    /// distances from the current body states.
    ///
    /// With `set_engaged`, unilateral limit rows may engage or disengage;
    /// otherwise the engaged set is required to be unchanged. Returns the
    /// largest penetration of an engaged limit.
    pub fn update_body_states(&mut self, entities: &EntitySet, set_engaged: bool) -> CoreResult<f64> {
        let a = entities.frame(self.body_a)?;
        let (tbw, vel_b) = match self.body_b {
            Some(b) => {
                let fb = entities.frame(b)?;
                (fb.pose, fb.velocity)
            }
            None => (RigidTransform::IDENTITY, Twist::ZERO),
        };
        self.tcw = a.pose * self.tca;
        self.tdw = tbw * self.tdb;
        self.origin_a = a.pose.translation;
        self.origin_b = tbw.translation;

        let pc = self.tcw.translation;
        let rdt = self.tdw.rotation_matrix().transpose();
        let v = a.velocity.point_velocity(pc - self.origin_a) - vel_b.point_velocity(pc - self.origin_b);
        self.rel_vel = Twist::new(rdt * v, rdt * (a.velocity.w - vel_b.w));

        let tcd = self.tdw.inverse() * self.tcw;
        self.coupling.update(&tcd, &self.rel_vel, set_engaged);

        let engaged = self.coupling.engaged_limits();
        if set_engaged {
            self.engaged = engaged;
        } else if engaged != self.engaged {
            return Err(CoreError::RowAccounting {
                constrainer: self.label(),
                reported: self.engaged.len(),
                produced: engaged.len(),
            });
        }

        Ok(self
            .engaged
            .iter()
            .map(|&i| -self.coupling.limits()[i].distance)
            .fold(0.0, f64::max))
    }

    /// Sets a coordinate, clamped to its range, by moving body A so that C
    /// lies on the constraint surface at the new value.
    pub fn set_coordinate(&mut self, index: usize, value: f64, entities: &mut EntitySet) -> CoreResult<f64> {
        let body_a = entities.entity(self.body_a)?;
        if body_a.flags.attached {
            return Err(CoreError::NotIndependent(self.body_a));
        }
        self.update_body_states(entities, false)?;
        let (clamped, tgd) = self.coupling.set_coordinate(index, value)?;
        let taw = self.tdw * tgd * self.tca.inverse();
        let frame = entities
            .entity_mut(self.body_a)?
            .as_frame_mut()
            .ok_or(CoreError::WrongEntityKind {
                entity: self.body_a,
                expected: "frame",
            })?;
        frame.pose = taw;
        self.update_body_states(entities, false)?;
        Ok(clamped)
    }

    /// Maps a wrench in D's orientation at C to velocity-sized blocks on A and B.
    fn side_blocks(&self, wrench: &Wrench, scale: f64) -> Vec<(EntityId, DMatrix<f64>)> {
        let world = wrench.rotated(&self.tdw.rotation_matrix()).scaled(scale);
        let pc = self.tcw.translation;
        let mut blocks = Vec::with_capacity(2);
        blocks.push((self.body_a, as_column(&world.about(pc - self.origin_a))));
        if let Some(b) = self.body_b {
            blocks.push((b, as_column(&(-world).about(pc - self.origin_b))));
        }
        blocks
    }

    /// Blocks of the coordinate's rate row, scaled, on A and B.
    pub fn coordinate_blocks(&self, index: usize, scale: f64) -> CoreResult<Vec<(EntityId, DMatrix<f64>)>> {
        let wrench = self.coupling.coordinate_wrench(index)?;
        Ok(self.side_blocks(&wrench, scale))
    }

    /// Constraint wrench currently exerted on A, in world coordinates about C's origin.
    pub fn reaction_wrench(&self) -> Wrench {
        let rd = self.tdw.rotation_matrix();
        let mut total = Wrench::ZERO;
        let engaged = self.engaged.iter().map(|&i| &self.coupling.limits()[i]);
        for row in self.coupling.bilaterals().iter().chain(engaged) {
            total += row.wrench.rotated(&rd).scaled(row.multiplier);
        }
        total
    }

    fn rows_column<'r>(
        &self,
        ctx: &AssemblyContext<'_>,
        rows: impl ExactSizeIterator<Item = &'r CouplingRow>,
    ) -> CoreResult<BlockColumn> {
        let mut column = BlockColumn::new(rows.len());
        for (j, row) in rows.enumerate() {
            ctx.add_folded_entries(self.side_blocks(&row.wrench, 1.0), &mut column, j)?;
        }
        Ok(column)
    }

    fn limit_tol(&self, motion: MotionType) -> f64 {
        match motion {
            MotionType::Linear => self.linear_limit_tol,
            MotionType::Rotary => self.rotary_limit_tol,
        }
    }
}

fn as_column(wrench: &Wrench) -> DMatrix<f64> {
    let v = wrench.to_vector();
    DMatrix::from_column_slice(6, 1, v.as_slice())
}

impl Constrainer for Joint {
    fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("joint '{name}'"),
            None => format!("joint {:?}-{:?}", self.body_a, self.body_b),
        }
    }

    fn is_active(&self, ctx: &AssemblyContext<'_>) -> bool {
        ctx.attachments.is_controllable(ctx.entities, self.body_a)
            || self
                .body_b
                .is_some_and(|b| ctx.attachments.is_controllable(ctx.entities, b))
    }

    fn bilateral_sizes(&self, sizes: &mut Vec<usize>) {
        let n = self.coupling.bilaterals().len();
        if n > 0 {
            sizes.push(n);
        }
    }

    fn add_bilateral_constraints(&self, ctx: &AssemblyContext<'_>) -> CoreResult<Vec<BlockColumn>> {
        if self.coupling.bilaterals().is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![self.rows_column(ctx, self.coupling.bilaterals().iter())?])
    }

    fn bilateral_info(&self, info: &mut Vec<ConstraintInfo>) {
        info.extend(
            self.coupling
                .bilaterals()
                .iter()
                .map(|row| ConstraintInfo::new(row.distance, self.compliance, self.damping, row.multiplier)),
        );
    }

    fn set_bilateral_forces(&mut self, lam: &[f64], scale: f64, idx: usize) -> usize {
        let rows = self.coupling.bilaterals_mut();
        for (row, value) in rows.iter_mut().zip(&lam[idx..]) {
            row.multiplier = value * scale;
        }
        idx + rows.len()
    }

    fn bilateral_forces(&self, out: &mut Vec<f64>) {
        out.extend(self.coupling.bilaterals().iter().map(|row| row.multiplier));
    }

    fn unilateral_sizes(&self, sizes: &mut Vec<usize>) {
        if !self.engaged.is_empty() {
            sizes.push(self.engaged.len());
        }
    }

    fn add_unilateral_constraints(&self, ctx: &AssemblyContext<'_>) -> CoreResult<Vec<BlockColumn>> {
        if self.engaged.is_empty() {
            return Ok(Vec::new());
        }
        let limits = self.coupling.limits();
        let rows = self.engaged.iter().map(|&i| &limits[i]);
        Ok(vec![self.rows_column(ctx, rows)?])
    }

    fn unilateral_info(&self, info: &mut Vec<ConstraintInfo>) {
        let limits = self.coupling.limits();
        for &i in &self.engaged {
            let row = &limits[i];
            let tol = self.limit_tol(row.motion);
            let distance = if row.distance < -tol { row.distance + tol } else { 0.0 };
            info.push(ConstraintInfo::new(distance, self.compliance, self.damping, row.multiplier));
        }
    }

    fn set_unilateral_forces(&mut self, lam: &[f64], scale: f64, idx: usize) -> usize {
        let engaged = self.engaged.clone();
        let limits = self.coupling.limits_mut();
        for (k, &i) in engaged.iter().enumerate() {
            limits[i].multiplier = lam[idx + k] * scale;
        }
        idx + engaged.len()
    }

    fn unilateral_forces(&self, out: &mut Vec<f64>) {
        let limits = self.coupling.limits();
        out.extend(self.engaged.iter().map(|&i| limits[i].multiplier));
    }

    fn zero_forces(&mut self) {
        self.coupling.zero_multipliers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::entity::DynamicEntity, dynamics::attachment_graph::AttachmentGraph,
        utils::spatial::SpatialInertia,
    };
    use glam::DQuat;

    fn body(entities: &mut EntitySet, pos: DVec3) -> EntityId {
        entities.add(DynamicEntity::frame(
            RigidTransform::from_translation(pos),
            SpatialInertia::solid_box(1.0, DVec3::splat(0.5)),
        ))
    }

    #[test]
    fn new_joint_starts_on_constraint_surface() {
        let mut entities = EntitySet::new();
        let a = body(&mut entities, DVec3::new(1.0, 0.0, 0.0));
        let b = body(&mut entities, DVec3::new(-1.0, 0.0, 0.0));
        let joint = Joint::new(
            CouplingKind::Revolute,
            &entities,
            a,
            Some(b),
            RigidTransform::IDENTITY,
        )
        .expect("joint");
        assert_eq!(joint.coordinate(0).expect("theta"), 0.0);
        for row in joint.coupling().bilaterals() {
            assert!(row.distance.abs() < 1e-15);
        }
    }

    #[test]
    fn relative_velocity_matches_coordinate_rate() {
        let mut entities = EntitySet::new();
        let a = body(&mut entities, DVec3::new(1.0, 0.0, 0.0));
        let mut joint =
            Joint::new(CouplingKind::Revolute, &entities, a, None, RigidTransform::IDENTITY).expect("joint");
        entities
            .entity_mut(a)
            .and_then(|e| e.as_frame_mut().ok_or(CoreError::UnknownEntity(a)))
            .expect("frame")
            .velocity = Twist::new(DVec3::new(0.0, 2.0, 0.0), DVec3::new(0.0, 0.0, 2.0));
        joint.update_body_states(&entities, false).expect("update");
        // pure rotation about the pivot: no translational slip at C
        assert!(joint.relative_velocity().v.length() < 1e-12);
        assert!((joint.coordinate_speed(0).expect("speed") - 2.0).abs() < 1e-12);
    }

    #[test]
    fn set_coordinate_moves_body_a() {
        let mut entities = EntitySet::new();
        let a = body(&mut entities, DVec3::new(1.0, 0.0, 0.0));
        let mut joint =
            Joint::new(CouplingKind::Revolute, &entities, a, None, RigidTransform::IDENTITY).expect("joint");
        joint.set_coordinate_range(0, -1.0, 1.0).expect("range");
        let value = joint
            .set_coordinate(0, std::f64::consts::FRAC_PI_2, &mut entities)
            .expect("set");
        assert_eq!(value, 1.0);
        let pose = entities.frame(a).expect("frame").pose;
        let expected = DQuat::from_rotation_z(1.0) * DVec3::X;
        assert!((pose.translation - expected).length() < 1e-12);
        assert!((joint.coordinate(0).expect("theta") - 1.0).abs() < 1e-12);
    }

    #[test]
    fn set_coordinate_rejects_attached_body() {
        let mut entities = EntitySet::new();
        let a = body(&mut entities, DVec3::ZERO);
        let mut joint =
            Joint::new(CouplingKind::Prismatic, &entities, a, None, RigidTransform::IDENTITY).expect("joint");
        entities.entity_mut(a).expect("a").flags.attached = true;
        assert_eq!(
            joint.set_coordinate(0, 0.5, &mut entities),
            Err(CoreError::NotIndependent(a))
        );
    }

    #[test]
    fn bilateral_column_matches_reported_sizes() {
        let mut entities = EntitySet::new();
        let a = body(&mut entities, DVec3::new(0.0, 1.0, 0.0));
        let b = body(&mut entities, DVec3::new(0.0, -1.0, 0.0));
        let joint =
            Joint::new(CouplingKind::Spherical, &entities, a, Some(b), RigidTransform::IDENTITY).expect("joint");
        entities.assign_solve_indices();
        let graph = AttachmentGraph::new();
        let joints = Arena::new();
        let ctx = AssemblyContext {
            entities: &entities,
            attachments: &graph,
            joints: &joints,
        };
        let mut sizes = Vec::new();
        joint.bilateral_sizes(&mut sizes);
        let columns = joint.add_bilateral_constraints(&ctx).expect("columns");
        assert_eq!(sizes, vec![3]);
        assert_eq!(columns.len(), 1);
        assert_eq!(columns[0].width(), 3);
        // x force row on A at offset (0,-1,0): moment about A's origin is r x f
        let block_a = columns[0].blocks().next().expect("block for A").1;
        assert!((block_a[(0, 0)] - 1.0).abs() < 1e-15);
        assert!((block_a[(5, 0)] - 1.0).abs() < 1e-15);
    }

    #[test]
    fn limit_row_reports_tolerance_adjusted_distance() {
        let mut entities = EntitySet::new();
        let a = body(&mut entities, DVec3::ZERO);
        let mut joint = Joint::new(CouplingKind::Prismatic, &entities, a, None, RigidTransform::IDENTITY)
            .expect("joint")
            .with_config(&CoreConfig {
                linear_limit_tol: 0.01,
                ..CoreConfig::default()
            });
        joint.set_coordinate_range(0, -0.1, 0.1).expect("range");
        entities
            .entity_mut(a)
            .and_then(|e| e.as_frame_mut().ok_or(CoreError::UnknownEntity(a)))
            .expect("frame")
            .pose = RigidTransform::from_translation(DVec3::new(0.0, 0.0, 0.15));
        let penetration = joint.update_body_states(&entities, true).expect("update");
        assert!((penetration - 0.05).abs() < 1e-12);
        let mut info = Vec::new();
        joint.unilateral_info(&mut info);
        assert_eq!(info.len(), 1);
        assert!((info[0].distance + 0.04).abs() < 1e-12);
    }
}
