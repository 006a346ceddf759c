//! Per-feature contact constraints between two collidables.

use glam::DVec3;

use super::{contact_master::ContactMaster, contact_point::ContactPoint};
use crate::{
    config::DEGENERATE_DIRECTION_EPS,
    core::{entity::EntitySet, sparse::BlockColumn},
    dynamics::{attachment_graph::AttachmentGraph, constrainer::AssemblyContext},
    error::CoreResult,
    utils::{allocator::EntityId, math::orthogonal_unit},
};

/// Which collidable a vertex index refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Side {
    First,
    Second,
}

impl Side {
    /// Sign of master weights on this side: the first collidable's masters are positive.
    pub fn sign(self) -> f64 {
        match self {
            Side::First => 1.0,
            Side::Second => -1.0,
        }
    }

    pub fn other(self) -> Side {
        match self {
            Side::First => Side::Second,
            Side::Second => Side::First,
        }
    }
}

/// Canonical identity of a contact: its sorted mesh vertices.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContactKey(Vec<(Side, usize)>);

impl ContactKey {
    pub fn new(vertices: impl IntoIterator<Item = (Side, usize)>) -> Self {
        let mut vertices: Vec<_> = vertices.into_iter().collect();
        vertices.sort_unstable();
        vertices.dedup();
        Self(vertices)
    }

    pub fn vertices(&self) -> &[(Side, usize)] {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactKind {
    /// A surface vertex against a deformable face.
    VertexFace,
    /// A surface vertex against a rigid body.
    VertexBody,
    /// Two deformable edges.
    EdgeEdge,
    /// A deformable edge against a rigid body.
    EdgeBody,
    /// A rigid body against a deformable face, keyed by the face.
    BodyFace,
}

#[derive(Debug, Clone)]
pub struct ContactConstraint {
    key: ContactKey,
    pub kind: ContactKind,
    pub point0: ContactPoint,
    pub point1: ContactPoint,
    /// Points from the second collidable toward the first.
    pub normal: DVec3,
    pub friction: f64,
    /// Normal force from the last solve; negative means separating.
    pub impulse: f64,
    /// Negative when penetrating.
    pub distance: f64,
    pub active: bool,
    /// Allocated during the current update.
    pub added: bool,
    pub bilateral: bool,
    masters: Vec<ContactMaster>,
    prev_entities: Vec<EntityId>,
    masters_changed: bool,
}

impl ContactConstraint {
    pub fn new(key: ContactKey, kind: ContactKind) -> Self {
        Self {
            key,
            kind,
            point0: ContactPoint::at(DVec3::ZERO),
            point1: ContactPoint::at(DVec3::ZERO),
            normal: DVec3::Z,
            friction: 0.0,
            impulse: 0.0,
            distance: 0.0,
            active: false,
            added: true,
            bilateral: true,
            masters: Vec::new(),
            prev_entities: Vec::new(),
            masters_changed: true,
        }
    }

    pub fn key(&self) -> &ContactKey {
        &self.key
    }

    pub fn masters(&self) -> &[ContactMaster] {
        &self.masters
    }

    pub fn masters_changed(&self) -> bool {
        self.masters_changed
    }

    /// Opens a new master set; the previous entity list is kept for comparison.
    pub fn begin_set(&mut self) {
        self.prev_entities = self.masters.iter().map(|m| m.entity).collect();
        self.masters.clear();
    }

    pub fn add_master(&mut self, master: ContactMaster) {
        self.masters.push(master);
    }

    pub fn add_masters(&mut self, masters: impl IntoIterator<Item = ContactMaster>) {
        self.masters.extend(masters);
    }

    pub fn end_set(&mut self) {
        self.masters_changed = self.masters.len() != self.prev_entities.len()
            || self
                .masters
                .iter()
                .zip(&self.prev_entities)
                .any(|(m, prev)| m.entity != *prev);
    }

    pub fn penetration(&self) -> f64 {
        (-self.distance).max(0.0)
    }

    pub fn is_controllable(&self, entities: &EntitySet, graph: &AttachmentGraph) -> bool {
        self.masters
            .iter()
            .any(|m| graph.is_controllable(entities, m.entity))
    }

    /// Velocity of the first side's point relative to the second's.
    pub fn relative_velocity(&self, ctx: &AssemblyContext<'_>) -> CoreResult<DVec3> {
        let mut vel = DVec3::ZERO;
        for master in &self.masters {
            master.add_relative_velocity(ctx.entities, &mut vel)?;
        }
        Ok(vel)
    }

    /// Adds the contact's rows along `dirs` to columns `first..first + dirs.len()`.
    pub fn add_to_column(
        &self,
        ctx: &AssemblyContext<'_>,
        dirs: &[DVec3],
        column: &mut BlockColumn,
        first: usize,
    ) -> CoreResult<()> {
        for (j, dir) in dirs.iter().enumerate() {
            let mut blocks = Vec::with_capacity(self.masters.len());
            for master in &self.masters {
                blocks.push((master.entity, master.block(ctx.entities, &[*dir])?));
            }
            ctx.add_folded_entries(blocks, column, first + j)?;
        }
        Ok(())
    }

    /// Friction directions: the first opposes the tangential slip, the second completes the frame.
    pub fn friction_directions(&self, ctx: &AssemblyContext<'_>) -> CoreResult<[DVec3; 2]> {
        let vel = self.relative_velocity(ctx)?;
        let slip = vel - self.normal * vel.dot(self.normal);
        let len = slip.length();
        let t1 = if len > DEGENERATE_DIRECTION_EPS {
            -slip / len
        } else {
            orthogonal_unit(self.normal)
        };
        Ok([t1, self.normal.cross(t1)])
    }
}
