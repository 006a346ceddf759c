//! Attachments express a dependent (slave) entity as a function of master entities.
//!
//! For each master `i` the attachment supplies the Jacobian `J_i` mapping the
//! master velocity to the slave velocity, so `u_s = sum_i J_i u_i`. The
//! constraint matrix in the usual `G u_m + u_s = 0` form is `G_i = -J_i`;
//! [`Attachment::mul_sub_gt_m`] and [`Attachment::mul_sub_m_g`] therefore add
//! `J_i^T M` and `M J_i`.

use std::sync::OnceLock;

use glam::DVec3;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::{
    core::{
        entity::{DynamicEntity, EntitySet},
        types::RigidTransform,
    },
    error::{CoreError, CoreResult},
    utils::{
        allocator::EntityId,
        math::{dvec3_at, segment_parameter, tetrahedron_barycentric, triangle_barycentric},
        spatial::{frame_jacobian, point_jacobian},
    },
};

/// One weighted master of a point attachment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PointMaster {
    Point { point: EntityId, weight: f64 },
    /// Material point `loc` (frame coordinates) of a frame.
    Frame {
        frame: EntityId,
        weight: f64,
        loc: DVec3,
    },
}

impl PointMaster {
    pub fn entity(&self) -> EntityId {
        match *self {
            PointMaster::Point { point, .. } => point,
            PointMaster::Frame { frame, .. } => frame,
        }
    }

    pub fn weight(&self) -> f64 {
        match *self {
            PointMaster::Point { weight, .. } | PointMaster::Frame { weight, .. } => weight,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttachmentKind {
    /// Slave position is `sum_i w_i p_i`.
    Point { masters: Vec<PointMaster> },
    /// Slave pose is `master.pose * offset`.
    Frame {
        master: EntityId,
        offset: RigidTransform,
    },
}

#[derive(Debug)]
pub struct Attachment {
    slave: Option<EntityId>,
    kind: AttachmentKind,
    masters: OnceLock<Vec<EntityId>>,
}

impl Clone for Attachment {
    fn clone(&self) -> Self {
        Self::new(self.slave, self.kind.clone())
    }
}

impl Attachment {
    pub fn new(slave: Option<EntityId>, kind: AttachmentKind) -> Self {
        Self {
            slave,
            kind,
            masters: OnceLock::new(),
        }
    }

    /// Attaches a particle to a material point of a frame, given in frame coordinates.
    pub fn point_to_frame(slave: EntityId, frame: EntityId, loc: DVec3) -> Self {
        Self::new(
            Some(slave),
            AttachmentKind::Point {
                masters: vec![PointMaster::Frame {
                    frame,
                    weight: 1.0,
                    loc,
                }],
            },
        )
    }

    /// Attaches a particle to a weighted combination of particles (element or skin nodes).
    pub fn point_to_points(slave: EntityId, masters: &[(EntityId, f64)]) -> Self {
        Self::point_weighted(
            Some(slave),
            masters
                .iter()
                .map(|&(point, weight)| PointMaster::Point { point, weight })
                .collect(),
        )
    }

    /// Point attachment with an arbitrary mix of point and frame masters.
    ///
    /// A `None` slave describes a virtual point, such as a mesh vertex that is
    /// not itself a dynamic entity.
    pub fn point_weighted(slave: Option<EntityId>, masters: Vec<PointMaster>) -> Self {
        Self::new(slave, AttachmentKind::Point { masters })
    }

    /// Attaches a frame rigidly to another frame.
    pub fn frame_to_frame(slave: Option<EntityId>, master: EntityId, offset: RigidTransform) -> Self {
        Self::new(slave, AttachmentKind::Frame { master, offset })
    }

    pub fn slave(&self) -> Option<EntityId> {
        self.slave
    }

    pub fn kind(&self) -> &AttachmentKind {
        &self.kind
    }

    /// Ordered master list, computed on first use.
    pub fn masters(&self) -> &[EntityId] {
        self.masters.get_or_init(|| match &self.kind {
            AttachmentKind::Point { masters } => masters.iter().map(PointMaster::entity).collect(),
            AttachmentKind::Frame { master, .. } => vec![*master],
        })
    }

    /// Drops the cached master list after a change to the master set.
    pub fn invalidate_masters(&mut self) {
        self.masters = OnceLock::new();
    }

    /// Replaces the masters of a point attachment.
    pub fn set_point_masters(&mut self, masters: Vec<PointMaster>) -> CoreResult<()> {
        match &mut self.kind {
            AttachmentKind::Point { masters: current } => {
                *current = masters;
                self.invalidate_masters();
                Ok(())
            }
            AttachmentKind::Frame { .. } => Err(CoreError::InvalidAttachment(
                "frame attachments have a single master".into(),
            )),
        }
    }

    pub fn slave_vel_size(&self) -> usize {
        match self.kind {
            AttachmentKind::Point { .. } => 3,
            AttachmentKind::Frame { .. } => 6,
        }
    }

    /// Checks master kinds and weights against the entity set.
    pub fn validate(&self, entities: &EntitySet) -> CoreResult<()> {
        if let Some(slave) = self.slave {
            let entity = entities.entity(slave)?;
            if entity.vel_state_size() != self.slave_vel_size() {
                return Err(CoreError::CountMismatch {
                    what: "slave velocity size",
                    expected: self.slave_vel_size(),
                    actual: entity.vel_state_size(),
                });
            }
            if self.masters().contains(&slave) {
                return Err(CoreError::CyclicDependency { slave });
            }
        }
        match &self.kind {
            AttachmentKind::Point { masters } => {
                if masters.is_empty() {
                    return Err(CoreError::InvalidAttachment(
                        "point attachment has no masters".into(),
                    ));
                }
                for master in masters {
                    let entity = entities.entity(master.entity())?;
                    let expected_frame = matches!(master, PointMaster::Frame { .. });
                    if entity.is_frame() != expected_frame {
                        return Err(CoreError::WrongEntityKind {
                            entity: master.entity(),
                            expected: if expected_frame { "frame" } else { "particle" },
                        });
                    }
                }
            }
            AttachmentKind::Frame { master, .. } => {
                entities.frame(*master)?;
            }
        }
        Ok(())
    }

    /// World position of a point slave, evaluated from the current master states.
    pub fn slave_position(&self, entities: &EntitySet) -> CoreResult<DVec3> {
        match &self.kind {
            AttachmentKind::Point { masters } => {
                let mut pos = DVec3::ZERO;
                for master in masters {
                    pos += master.weight() * master_point(entities, master)?;
                }
                Ok(pos)
            }
            AttachmentKind::Frame { .. } => Ok(self.slave_pose(entities)?.translation),
        }
    }

    /// World pose of a frame slave; point slaves report an unrotated pose.
    pub fn slave_pose(&self, entities: &EntitySet) -> CoreResult<RigidTransform> {
        match &self.kind {
            AttachmentKind::Frame { master, offset } => Ok(entities.frame(*master)?.pose * *offset),
            AttachmentKind::Point { .. } => {
                Ok(RigidTransform::from_translation(self.slave_position(entities)?))
            }
        }
    }

    /// Jacobian `J_i` of the slave velocity with respect to master `i`.
    pub fn master_jacobian(&self, i: usize, entities: &EntitySet) -> CoreResult<DMatrix<f64>> {
        match &self.kind {
            AttachmentKind::Point { masters } => {
                let master = masters.get(i).ok_or(CoreError::CountMismatch {
                    what: "master index",
                    expected: masters.len(),
                    actual: i,
                })?;
                match *master {
                    PointMaster::Point { weight, .. } => {
                        Ok(DMatrix::identity(3, 3) * weight)
                    }
                    PointMaster::Frame { frame, weight, loc } => {
                        let pose = entities.frame(frame)?.pose;
                        Ok(point_jacobian(pose.transform_vector(loc)) * weight)
                    }
                }
            }
            AttachmentKind::Frame { master, offset } => {
                let pose = entities.frame(*master)?.pose;
                Ok(frame_jacobian(pose.transform_vector(offset.translation)))
            }
        }
    }

    /// Slave velocity `sum_i J_i u_i`.
    pub fn slave_velocity(&self, entities: &EntitySet) -> CoreResult<DVector<f64>> {
        let mut vel = DVector::zeros(self.slave_vel_size());
        for (i, master) in self.masters().iter().enumerate() {
            let u = entities.entity(*master)?.velocity_vector();
            vel += self.master_jacobian(i, entities)? * u;
        }
        Ok(vel)
    }

    /// Writes the slave position computed from the masters.
    pub fn update_pos_state(&self, entities: &mut EntitySet) -> CoreResult<()> {
        let Some(slave) = self.slave else {
            return Ok(());
        };
        match &self.kind {
            AttachmentKind::Point { .. } => {
                let pos = self.slave_position(entities)?;
                let particle = entities
                    .entity_mut(slave)?
                    .as_particle_mut()
                    .ok_or(CoreError::WrongEntityKind {
                        entity: slave,
                        expected: "particle",
                    })?;
                particle.position = pos;
            }
            AttachmentKind::Frame { .. } => {
                let pose = self.slave_pose(entities)?;
                let frame = entities
                    .entity_mut(slave)?
                    .as_frame_mut()
                    .ok_or(CoreError::WrongEntityKind {
                        entity: slave,
                        expected: "frame",
                    })?;
                frame.pose = pose;
            }
        }
        Ok(())
    }

    /// Writes the slave velocity computed from the masters.
    pub fn update_vel_state(&self, entities: &mut EntitySet) -> CoreResult<()> {
        let Some(slave) = self.slave else {
            return Ok(());
        };
        let vel = self.slave_velocity(entities)?;
        entities.entity_mut(slave)?.set_velocity(vel.as_slice());
        Ok(())
    }

    /// Recomputes internal coefficients so that the masters reproduce the
    /// current slave state, e.g. after the slave was moved externally.
    ///
    /// Frame masters get a new local offset. Two to four point masters get
    /// new barycentric weights from the projection onto their simplex; other
    /// point weights are kept.
    pub fn update_attachment(&mut self, entities: &EntitySet) -> CoreResult<()> {
        let Some(slave) = self.slave else {
            return Ok(());
        };
        let slave_entity = entities.entity(slave)?;
        let target_pose = slave_entity.pose();
        let target = slave_entity.position();
        match &mut self.kind {
            AttachmentKind::Frame { master, offset } => {
                *offset = entities.frame(*master)?.pose.inverse() * target_pose;
            }
            AttachmentKind::Point { masters } => {
                for master in masters.iter_mut() {
                    if let PointMaster::Frame { frame, loc, .. } = master {
                        *loc = entities.frame(*frame)?.pose.inverse().transform_point(target);
                    }
                }
                let all_points = masters
                    .iter()
                    .all(|m| matches!(m, PointMaster::Point { .. }));
                if all_points {
                    let positions = masters
                        .iter()
                        .map(|m| entities.entity(m.entity()).map(DynamicEntity::position))
                        .collect::<CoreResult<Vec<_>>>()?;
                    if let Some(weights) = simplex_weights(target, &positions) {
                        for (master, w) in masters.iter_mut().zip(weights) {
                            if let PointMaster::Point { weight, .. } = master {
                                *weight = w;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Adds `J_i^T f_s` to every master's force.
    pub fn apply_forces(&self, entities: &mut EntitySet) -> CoreResult<()> {
        let Some(slave) = self.slave else {
            return Ok(());
        };
        let force = entities.entity(slave)?.force_vector();
        for (i, master) in self.masters().iter().enumerate() {
            let jac = self.master_jacobian(i, entities)?;
            let mapped = jac.transpose() * &force;
            entities.entity_mut(*master)?.add_force(mapped.as_slice());
        }
        Ok(())
    }

    /// Adds `J_i^T M_s J_i` to each master's effective mass.
    pub fn add_mass_to_masters(
        &self,
        entities: &EntitySet,
        slave_mass: &DMatrix<f64>,
        mut add: impl FnMut(EntityId, DMatrix<f64>),
    ) -> CoreResult<()> {
        for (i, master) in self.masters().iter().enumerate() {
            let jac = self.master_jacobian(i, entities)?;
            add(*master, jac.transpose() * slave_mass * &jac);
        }
        Ok(())
    }

    /// `D -= G_i^T M`, i.e. `D += J_i^T M`, folding a slave-side column block onto master `i`.
    pub fn mul_sub_gt_m(
        &self,
        i: usize,
        entities: &EntitySet,
        d: &mut DMatrix<f64>,
        m: &DMatrix<f64>,
    ) -> CoreResult<()> {
        let jac = self.master_jacobian(i, entities)?;
        *d += jac.transpose() * m;
        Ok(())
    }

    /// `D -= M G_i`, i.e. `D += M J_i`, folding a slave-side row block onto master `i`.
    pub fn mul_sub_m_g(
        &self,
        i: usize,
        entities: &EntitySet,
        d: &mut DMatrix<f64>,
        m: &DMatrix<f64>,
    ) -> CoreResult<()> {
        let jac = self.master_jacobian(i, entities)?;
        *d += m * jac;
        Ok(())
    }
}

fn master_point(entities: &EntitySet, master: &PointMaster) -> CoreResult<DVec3> {
    match *master {
        PointMaster::Point { point, .. } => Ok(entities.entity(point)?.position()),
        PointMaster::Frame { frame, loc, .. } => {
            Ok(entities.frame(frame)?.pose.transform_point(loc))
        }
    }
}

/// Barycentric weights of `p` on the simplex spanned by 2 to 4 points.
fn simplex_weights(p: DVec3, points: &[DVec3]) -> Option<Vec<f64>> {
    match points {
        [a, b] => {
            let s = segment_parameter(p, *a, *b);
            Some(vec![1.0 - s, s])
        }
        [a, b, c] => {
            let w = triangle_barycentric(p, *a, *b, *c);
            Some(vec![w.x, w.y, w.z])
        }
        [a, b, c, d] => tetrahedron_barycentric(p, *a, *b, *c, *d).map(|w| w.to_vec()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::spatial::SpatialInertia;
    use glam::DQuat;

    fn frame_set() -> (EntitySet, EntityId, EntityId) {
        let mut set = EntitySet::new();
        let frame = set.add(DynamicEntity::frame(
            RigidTransform::new(DVec3::new(1.0, 0.0, 0.0), DQuat::from_rotation_z(0.3)),
            SpatialInertia::default(),
        ));
        let point = set.add(DynamicEntity::particle(DVec3::ZERO, 0.5));
        (set, frame, point)
    }

    #[test]
    fn point_on_frame_follows_pose_and_twist() {
        let (mut set, frame, point) = frame_set();
        let loc = DVec3::new(0.0, 2.0, 0.0);
        let att = Attachment::point_to_frame(point, frame, loc);
        att.validate(&set).expect("valid attachment");
        att.update_pos_state(&mut set).expect("pos update");

        let pose = set.frame(frame).expect("frame").pose;
        let pos = set.entity(point).expect("point").position();
        assert!((pos - pose.transform_point(loc)).length() < 1e-14);

        set.entity_mut(frame)
            .expect("frame")
            .set_velocity(&[0.1, 0.0, 0.0, 0.0, 0.0, 1.0]);
        att.update_vel_state(&mut set).expect("vel update");
        let vel = dvec3_at(&set.entity(point).expect("point").velocity_vector(), 0);
        let r = pose.transform_vector(loc);
        let expected = DVec3::new(0.1, 0.0, 0.0) + DVec3::Z.cross(r);
        assert!((vel - expected).length() < 1e-14);
    }

    #[test]
    fn update_attachment_recovers_offsets_and_weights() {
        let (mut set, frame, point) = frame_set();
        let mut att = Attachment::point_to_frame(point, frame, DVec3::ZERO);
        set.entity_mut(point)
            .expect("point")
            .set_pos_state(&[0.5, 0.5, 0.25]);
        att.update_attachment(&set).expect("update");
        assert!((att.slave_position(&set).expect("pos") - DVec3::new(0.5, 0.5, 0.25)).length() < 1e-12);

        let a = set.add(DynamicEntity::particle(DVec3::ZERO, 1.0));
        let b = set.add(DynamicEntity::particle(DVec3::new(2.0, 0.0, 0.0), 1.0));
        let slave = set.add(DynamicEntity::particle(DVec3::new(0.5, 0.0, 0.0), 1.0));
        let mut weighted = Attachment::point_to_points(slave, &[(a, 0.5), (b, 0.5)]);
        weighted.update_attachment(&set).expect("update");
        match weighted.kind() {
            AttachmentKind::Point { masters } => {
                assert!((masters[0].weight() - 0.75).abs() < 1e-14);
                assert!((masters[1].weight() - 0.25).abs() < 1e-14);
            }
            AttachmentKind::Frame { .. } => panic!("expected point attachment"),
        }
    }

    #[test]
    fn wrong_master_kind_is_rejected() {
        let (set, frame, point) = frame_set();
        let att = Attachment::point_to_points(point, &[(frame, 1.0)]);
        assert!(matches!(
            att.validate(&set),
            Err(CoreError::WrongEntityKind { .. })
        ));
        let self_ref = Attachment::point_to_points(point, &[(point, 1.0)]);
        assert!(matches!(
            self_ref.validate(&set),
            Err(CoreError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn masters_cache_is_rebuilt_after_change() {
        let (set, frame, point) = frame_set();
        let other = point;
        let mut att = Attachment::point_weighted(
            None,
            vec![PointMaster::Frame {
                frame,
                weight: 1.0,
                loc: DVec3::ZERO,
            }],
        );
        assert_eq!(att.masters(), &[frame]);
        att.set_point_masters(vec![PointMaster::Point {
            point: other,
            weight: 1.0,
        }])
        .expect("point attachment");
        assert_eq!(att.masters(), &[other]);
        assert!(att.validate(&set).is_ok());
    }
}
