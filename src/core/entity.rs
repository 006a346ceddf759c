//! Dynamic entities and the state/index model shared by every constraint source.

use glam::{DMat3, DQuat, DVec3};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use super::types::RigidTransform;
use crate::{
    error::{CoreError, CoreResult},
    utils::{
        allocator::{Arena, EntityId},
        math::set_block3,
        spatial::{SpatialInertia, Twist, Wrench},
    },
};

/// Point mass; also used for the nodes of deformable bodies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    pub position: DVec3,
    pub velocity: DVec3,
    pub force: DVec3,
    pub mass: f64,
}

impl Particle {
    pub fn new(position: DVec3, mass: f64) -> Self {
        Self {
            position,
            velocity: DVec3::ZERO,
            force: DVec3::ZERO,
            mass,
        }
    }
}

/// Rigid frame with pose, twist and wrench in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameBody {
    pub pose: RigidTransform,
    pub velocity: Twist,
    pub force: Wrench,
    pub inertia: SpatialInertia,
}

impl FrameBody {
    pub fn new(pose: RigidTransform, inertia: SpatialInertia) -> Self {
        Self {
            pose,
            velocity: Twist::ZERO,
            force: Wrench::ZERO,
            inertia,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntityKind {
    Particle(Particle),
    Frame(FrameBody),
}

/// Role flags of an entity.
///
/// An entity is *independent*, and receives a solve index, when it is
/// dynamic and not attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFlags {
    /// State is advanced by the dynamics.
    pub dynamic: bool,
    /// State is a function of other entities through an attachment.
    pub attached: bool,
    /// State is prescribed externally.
    pub parametric: bool,
}

impl Default for EntityFlags {
    fn default() -> Self {
        Self {
            dynamic: true,
            attached: false,
            parametric: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicEntity {
    pub name: Option<String>,
    pub kind: EntityKind,
    pub flags: EntityFlags,
    solve_index: Option<usize>,
}

impl DynamicEntity {
    pub fn particle(position: DVec3, mass: f64) -> Self {
        Self::from_kind(EntityKind::Particle(Particle::new(position, mass)))
    }

    pub fn frame(pose: RigidTransform, inertia: SpatialInertia) -> Self {
        Self::from_kind(EntityKind::Frame(FrameBody::new(pose, inertia)))
    }

    fn from_kind(kind: EntityKind) -> Self {
        Self {
            name: None,
            kind,
            flags: EntityFlags::default(),
            solve_index: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Marks the entity as externally driven.
    pub fn parametric(mut self) -> Self {
        self.flags.dynamic = false;
        self.flags.parametric = true;
        self
    }

    /// Marks the entity as fixed in place.
    pub fn fixed(mut self) -> Self {
        self.flags.dynamic = false;
        self.flags.parametric = false;
        self
    }

    pub fn pos_state_size(&self) -> usize {
        match self.kind {
            EntityKind::Particle(_) => 3,
            EntityKind::Frame(_) => 7,
        }
    }

    pub fn vel_state_size(&self) -> usize {
        match self.kind {
            EntityKind::Particle(_) => 3,
            EntityKind::Frame(_) => 6,
        }
    }

    /// Block row in the assembled system, or `None` when not independent.
    pub fn solve_index(&self) -> Option<usize> {
        self.solve_index
    }

    pub(crate) fn set_solve_index(&mut self, index: Option<usize>) {
        self.solve_index = index;
    }

    pub fn is_independent(&self) -> bool {
        self.flags.dynamic && !self.flags.attached
    }

    pub fn is_frame(&self) -> bool {
        matches!(self.kind, EntityKind::Frame(_))
    }

    pub fn as_particle(&self) -> Option<&Particle> {
        match &self.kind {
            EntityKind::Particle(p) => Some(p),
            EntityKind::Frame(_) => None,
        }
    }

    pub fn as_particle_mut(&mut self) -> Option<&mut Particle> {
        match &mut self.kind {
            EntityKind::Particle(p) => Some(p),
            EntityKind::Frame(_) => None,
        }
    }

    pub fn as_frame(&self) -> Option<&FrameBody> {
        match &self.kind {
            EntityKind::Frame(f) => Some(f),
            EntityKind::Particle(_) => None,
        }
    }

    pub fn as_frame_mut(&mut self) -> Option<&mut FrameBody> {
        match &mut self.kind {
            EntityKind::Frame(f) => Some(f),
            EntityKind::Particle(_) => None,
        }
    }

    /// Particle position or frame origin.
    pub fn position(&self) -> DVec3 {
        match &self.kind {
            EntityKind::Particle(p) => p.position,
            EntityKind::Frame(f) => f.pose.translation,
        }
    }

    /// Pose of a frame; particles report an unrotated pose at their position.
    pub fn pose(&self) -> RigidTransform {
        match &self.kind {
            EntityKind::Particle(p) => RigidTransform::from_translation(p.position),
            EntityKind::Frame(f) => f.pose,
        }
    }

    pub fn rotation_matrix(&self) -> DMat3 {
        match &self.kind {
            EntityKind::Particle(_) => DMat3::IDENTITY,
            EntityKind::Frame(f) => f.pose.rotation_matrix(),
        }
    }

    pub fn pos_state(&self, out: &mut Vec<f64>) {
        match &self.kind {
            EntityKind::Particle(p) => out.extend_from_slice(&p.position.to_array()),
            EntityKind::Frame(f) => {
                out.extend_from_slice(&f.pose.translation.to_array());
                let q = f.pose.rotation;
                out.extend_from_slice(&[q.w, q.x, q.y, q.z]);
            }
        }
    }

    /// Reads position state from `state`, returning the number of values consumed.
    pub fn set_pos_state(&mut self, state: &[f64]) -> usize {
        match &mut self.kind {
            EntityKind::Particle(p) => {
                p.position = DVec3::new(state[0], state[1], state[2]);
                3
            }
            EntityKind::Frame(f) => {
                f.pose.translation = DVec3::new(state[0], state[1], state[2]);
                f.pose.rotation =
                    DQuat::from_xyzw(state[4], state[5], state[6], state[3]).normalize();
                7
            }
        }
    }

    pub fn velocity_vector(&self) -> DVector<f64> {
        match &self.kind {
            EntityKind::Particle(p) => DVector::from_column_slice(&p.velocity.to_array()),
            EntityKind::Frame(f) => f.velocity.to_vector(),
        }
    }

    pub fn set_velocity(&mut self, vel: &[f64]) {
        match &mut self.kind {
            EntityKind::Particle(p) => p.velocity = DVec3::new(vel[0], vel[1], vel[2]),
            EntityKind::Frame(f) => f.velocity = Twist::from_slice(vel),
        }
    }

    pub fn force_vector(&self) -> DVector<f64> {
        match &self.kind {
            EntityKind::Particle(p) => DVector::from_column_slice(&p.force.to_array()),
            EntityKind::Frame(f) => f.force.to_vector(),
        }
    }

    pub fn add_force(&mut self, force: &[f64]) {
        match &mut self.kind {
            EntityKind::Particle(p) => p.force += DVec3::new(force[0], force[1], force[2]),
            EntityKind::Frame(f) => f.force += Wrench::from_slice(force),
        }
    }

    pub fn zero_force(&mut self) {
        match &mut self.kind {
            EntityKind::Particle(p) => p.force = DVec3::ZERO,
            EntityKind::Frame(f) => f.force = Wrench::ZERO,
        }
    }

    /// World-frame mass block of size `vel_state_size`.
    pub fn mass_block(&self) -> DMatrix<f64> {
        match &self.kind {
            EntityKind::Particle(p) => {
                let mut m = DMatrix::zeros(3, 3);
                set_block3(&mut m, 0, 0, &DMat3::from_diagonal(DVec3::splat(p.mass)));
                m
            }
            EntityKind::Frame(f) => f.inertia.world_matrix(&f.pose.rotation_matrix()),
        }
    }

    /// Advances the position by the current velocity over `h`.
    pub fn integrate(&mut self, h: f64) {
        match &mut self.kind {
            EntityKind::Particle(p) => p.position += p.velocity * h,
            EntityKind::Frame(f) => {
                let twist = f.velocity;
                f.pose.integrate(&twist, h);
            }
        }
    }

    /// Applies a small displacement expressed in velocity coordinates.
    pub fn displace(&mut self, delta: &[f64]) {
        match &mut self.kind {
            EntityKind::Particle(p) => p.position += DVec3::new(delta[0], delta[1], delta[2]),
            EntityKind::Frame(f) => f.pose.displace(
                DVec3::new(delta[0], delta[1], delta[2]),
                DVec3::new(delta[3], delta[4], delta[5]),
            ),
        }
    }

    /// True if the velocity is non-finite or exceeds the given limits.
    pub fn velocity_limit_exceeded(&self, translational: f64, rotational: f64) -> bool {
        let exceeds = |v: DVec3, limit: f64| !v.is_finite() || v.abs().max_element() > limit;
        match &self.kind {
            EntityKind::Particle(p) => exceeds(p.velocity, translational),
            EntityKind::Frame(f) => {
                exceeds(f.velocity.v, translational) || exceeds(f.velocity.w, rotational)
            }
        }
    }
}

/// Owner of every dynamic entity plus the solve index assignment.
#[derive(Debug, Clone, Default)]
pub struct EntitySet {
    entities: Arena<DynamicEntity, EntityId>,
    active: Vec<EntityId>,
    offsets: Vec<usize>,
}

impl EntitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entity: DynamicEntity) -> EntityId {
        self.entities.insert(entity)
    }

    pub fn remove(&mut self, id: EntityId) -> Option<DynamicEntity> {
        self.entities.remove(id)
    }

    pub fn get(&self, id: EntityId) -> Option<&DynamicEntity> {
        self.entities.get(id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut DynamicEntity> {
        self.entities.get_mut(id)
    }

    pub fn entity(&self, id: EntityId) -> CoreResult<&DynamicEntity> {
        self.entities.get(id).ok_or(CoreError::UnknownEntity(id))
    }

    pub fn entity_mut(&mut self, id: EntityId) -> CoreResult<&mut DynamicEntity> {
        self.entities.get_mut(id).ok_or(CoreError::UnknownEntity(id))
    }

    pub fn frame(&self, id: EntityId) -> CoreResult<&FrameBody> {
        self.entity(id)?.as_frame().ok_or(CoreError::WrongEntityKind {
            entity: id,
            expected: "frame",
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &DynamicEntity)> + '_ {
        self.entities.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EntityId, &mut DynamicEntity)> + '_ {
        self.entities.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Assigns solve indices to independent entities in handle order.
    ///
    /// Returns the velocity size of each block row.
    pub fn assign_solve_indices(&mut self) -> Vec<usize> {
        self.active.clear();
        self.offsets.clear();
        let mut sizes = Vec::new();
        let mut offset = 0;
        for (id, entity) in self.entities.iter_mut() {
            if entity.is_independent() {
                entity.set_solve_index(Some(sizes.len()));
                sizes.push(entity.vel_state_size());
                self.active.push(id);
                self.offsets.push(offset);
                offset += entity.vel_state_size();
            } else {
                entity.set_solve_index(None);
            }
        }
        sizes
    }

    /// Independent entities in solve-index order, as of the last assignment.
    pub fn active(&self) -> &[EntityId] {
        &self.active
    }

    pub fn active_vel_size(&self) -> usize {
        self.active
            .iter()
            .filter_map(|id| self.entities.get(*id))
            .map(DynamicEntity::vel_state_size)
            .sum()
    }

    /// Velocity offset of a block row.
    pub fn vel_offset(&self, solve_index: usize) -> Option<usize> {
        self.offsets.get(solve_index).copied()
    }

    pub fn gather_velocities(&self) -> DVector<f64> {
        self.gather(DynamicEntity::velocity_vector)
    }

    pub fn gather_forces(&self) -> DVector<f64> {
        self.gather(DynamicEntity::force_vector)
    }

    fn gather(&self, f: impl Fn(&DynamicEntity) -> DVector<f64>) -> DVector<f64> {
        let mut out = DVector::zeros(self.active_vel_size());
        for (bi, id) in self.active.iter().enumerate() {
            if let (Some(entity), Some(off)) = (self.entities.get(*id), self.vel_offset(bi)) {
                let v = f(entity);
                out.rows_mut(off, v.len()).copy_from(&v);
            }
        }
        out
    }

    pub fn scatter_velocities(&mut self, vel: &DVector<f64>) {
        for (bi, id) in self.active.clone().into_iter().enumerate() {
            let Some(off) = self.vel_offset(bi) else {
                continue;
            };
            if let Some(entity) = self.entities.get_mut(id) {
                let n = entity.vel_state_size();
                entity.set_velocity(&vel.as_slice()[off..off + n]);
            }
        }
    }

    /// Applies a displacement vector laid out like the active velocities.
    pub fn displace_active(&mut self, delta: &DVector<f64>) {
        for (bi, id) in self.active.clone().into_iter().enumerate() {
            let Some(off) = self.vel_offset(bi) else {
                continue;
            };
            if let Some(entity) = self.entities.get_mut(id) {
                let n = entity.vel_state_size();
                entity.displace(&delta.as_slice()[off..off + n]);
            }
        }
    }

    pub fn integrate_active(&mut self, h: f64) {
        for id in self.active.clone() {
            if let Some(entity) = self.entities.get_mut(id) {
                entity.integrate(h);
            }
        }
    }

    pub fn zero_forces(&mut self) {
        for (_, entity) in self.entities.iter_mut() {
            entity.zero_force();
        }
    }

    /// Adds the weight of every dynamic, unattached entity to its force.
    pub fn apply_gravity(&mut self, gravity: DVec3) {
        for (_, entity) in self.entities.iter_mut() {
            if !entity.is_independent() {
                continue;
            }
            match &mut entity.kind {
                EntityKind::Particle(p) => p.force += gravity * p.mass,
                EntityKind::Frame(f) => f.force.f += gravity * f.inertia.mass,
            }
        }
    }

    /// First entity, in handle order, whose velocity is non-finite or above the limits.
    pub fn first_unstable(&self, translational: f64, rotational: f64) -> Option<EntityId> {
        self.entities
            .iter()
            .find(|(_, e)| e.velocity_limit_exceeded(translational, rotational))
            .map(|(id, _)| id)
    }
}
