//! Dynamic entities that carry a contact, with the weight of their contribution.

use glam::DVec3;
use nalgebra::DMatrix;

use crate::{
    core::entity::{EntityKind, EntitySet},
    error::CoreResult,
    utils::allocator::EntityId,
};

/// One weighted master of a contact.
///
/// For frames, `point` is the world location of the material point carried
/// by the frame; without it the frame origin is used.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContactMaster {
    pub entity: EntityId,
    pub weight: f64,
    pub point: Option<DVec3>,
}

impl ContactMaster {
    pub fn new(entity: EntityId, weight: f64) -> Self {
        Self {
            entity,
            weight,
            point: None,
        }
    }

    pub fn at_point(entity: EntityId, weight: f64, point: DVec3) -> Self {
        Self {
            entity,
            weight,
            point: Some(point),
        }
    }

    /// `vel_size x dirs.len()` block mapping the entity velocity onto the
    /// weighted point velocity along each direction.
    pub fn block(&self, entities: &EntitySet, dirs: &[DVec3]) -> CoreResult<DMatrix<f64>> {
        let entity = entities.entity(self.entity)?;
        let mut block = DMatrix::zeros(entity.vel_state_size(), dirs.len());
        match &entity.kind {
            EntityKind::Particle(_) => {
                for (j, d) in dirs.iter().enumerate() {
                    let d = *d * self.weight;
                    block[(0, j)] = d.x;
                    block[(1, j)] = d.y;
                    block[(2, j)] = d.z;
                }
            }
            EntityKind::Frame(frame) => {
                let r = self.point.map_or(DVec3::ZERO, |p| p - frame.pose.translation);
                for (j, d) in dirs.iter().enumerate() {
                    let d = *d * self.weight;
                    let m = r.cross(d);
                    for (i, value) in [d.x, d.y, d.z, m.x, m.y, m.z].into_iter().enumerate() {
                        block[(i, j)] = value;
                    }
                }
            }
        }
        Ok(block)
    }

    /// Adds this master's weighted point velocity to `vel`.
    pub fn add_relative_velocity(&self, entities: &EntitySet, vel: &mut DVec3) -> CoreResult<()> {
        let entity = entities.entity(self.entity)?;
        let v = match &entity.kind {
            EntityKind::Particle(p) => p.velocity,
            EntityKind::Frame(frame) => {
                let r = self.point.map_or(DVec3::ZERO, |p| p - frame.pose.translation);
                frame.velocity.point_velocity(r)
            }
        };
        *vel += v * self.weight;
        Ok(())
    }
}
