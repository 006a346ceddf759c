//! Dependency graph of installed attachments.
//!
//! Every attachment is stored in an arena; the graph records which
//! attachment drives each slave and, as back-reference edges, which
//! attachments depend on each master. The propagation order (masters before
//! slaves) is rebuilt in full whenever an attachment is installed or removed.

use std::collections::{BTreeMap, HashMap, HashSet};

use glam::DVec3;
use nalgebra::DMatrix;

use super::attachment::{Attachment, AttachmentKind, PointMaster};
use crate::{
    core::{entity::EntitySet, types::RigidTransform},
    error::{CoreError, CoreResult},
    utils::allocator::{Arena, AttachmentId, EntityId},
};

#[derive(Debug, Clone, Default)]
pub struct AttachmentGraph {
    attachments: Arena<Attachment, AttachmentId>,
    slave_index: HashMap<EntityId, AttachmentId>,
    dependents: HashMap<EntityId, Vec<AttachmentId>>,
    ordered: Vec<AttachmentId>,
}

impl AttachmentGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs an attachment after validating it and checking for cycles.
    ///
    /// The slave is flagged as attached and its state is updated from the masters.
    pub fn attach(
        &mut self,
        entities: &mut EntitySet,
        attachment: Attachment,
    ) -> CoreResult<AttachmentId> {
        attachment.validate(entities)?;
        if let Some(slave) = attachment.slave() {
            if self.slave_index.contains_key(&slave) {
                return Err(CoreError::AlreadyAttached(slave));
            }
            for master in attachment.masters() {
                if self.depends_on(*master, slave) {
                    return Err(CoreError::CyclicDependency { slave });
                }
            }
        }

        let masters = attachment.masters().to_vec();
        let slave = attachment.slave();
        let id = self.attachments.insert(attachment);
        for master in masters {
            let edges = self.dependents.entry(master).or_default();
            if !edges.contains(&id) {
                edges.push(id);
            }
        }
        if let Some(slave) = slave {
            self.slave_index.insert(slave, id);
            entities.entity_mut(slave)?.flags.attached = true;
        }
        self.rebuild_order();
        if let Some(attachment) = self.attachments.get(id) {
            attachment.update_pos_state(entities)?;
            attachment.update_vel_state(entities)?;
        }
        log::debug!("installed attachment {id:?} for slave {slave:?}");
        Ok(id)
    }

    /// Removes an attachment and its back-reference edges.
    pub fn detach(&mut self, entities: &mut EntitySet, id: AttachmentId) -> CoreResult<Attachment> {
        let attachment = self
            .attachments
            .remove(id)
            .ok_or(CoreError::UnknownAttachment(id))?;
        for master in attachment.masters() {
            if let Some(edges) = self.dependents.get_mut(master) {
                edges.retain(|a| *a != id);
                if edges.is_empty() {
                    self.dependents.remove(master);
                }
            }
        }
        if let Some(slave) = attachment.slave() {
            self.slave_index.remove(&slave);
            if let Some(entity) = entities.get_mut(slave) {
                entity.flags.attached = false;
            }
        }
        self.rebuild_order();
        log::debug!("removed attachment {id:?}");
        Ok(attachment)
    }

    /// True if `entity` is `target` or depends on it through installed attachments.
    pub fn depends_on(&self, entity: EntityId, target: EntityId) -> bool {
        let mut stack = vec![entity];
        let mut visited = HashSet::new();
        while let Some(node) = stack.pop() {
            if node == target {
                return true;
            }
            if !visited.insert(node) {
                continue;
            }
            if let Some(att) = self.attachment_of(node) {
                stack.extend(att.masters().iter().copied());
            }
        }
        false
    }

    pub fn get(&self, id: AttachmentId) -> Option<&Attachment> {
        self.attachments.get(id)
    }

    pub fn len(&self) -> usize {
        self.attachments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty()
    }

    /// Attachment whose slave is `entity`, if any.
    pub fn attachment_of(&self, entity: EntityId) -> Option<&Attachment> {
        self.slave_index
            .get(&entity)
            .and_then(|id| self.attachments.get(*id))
    }

    pub fn attachment_id_of(&self, entity: EntityId) -> Option<AttachmentId> {
        self.slave_index.get(&entity).copied()
    }

    /// Attachments that list `entity` as a master.
    pub fn dependents(&self, entity: EntityId) -> &[AttachmentId] {
        self.dependents
            .get(&entity)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Attachments in propagation order, masters before slaves.
    pub fn ordered(&self) -> &[AttachmentId] {
        &self.ordered
    }

    /// Recomputes the internal coefficients of an attachment from the current slave state.
    pub fn update_attachment(&mut self, entities: &EntitySet, id: AttachmentId) -> CoreResult<()> {
        self.attachments
            .get_mut(id)
            .ok_or(CoreError::UnknownAttachment(id))?
            .update_attachment(entities)
    }

    fn rebuild_order(&mut self) {
        let mut ordered = Vec::with_capacity(self.attachments.len());
        let mut visited = HashSet::new();
        for id in self.attachments.ids() {
            self.visit(id, &mut visited, &mut ordered);
        }
        self.ordered = ordered;
    }

    fn visit(&self, id: AttachmentId, visited: &mut HashSet<AttachmentId>, out: &mut Vec<AttachmentId>) {
        if !visited.insert(id) {
            return;
        }
        if let Some(att) = self.attachments.get(id) {
            for master in att.masters() {
                if let Some(parent) = self.slave_index.get(master) {
                    self.visit(*parent, visited, out);
                }
            }
        }
        out.push(id);
    }

    pub fn update_pos_states(&self, entities: &mut EntitySet) -> CoreResult<()> {
        for id in &self.ordered {
            if let Some(att) = self.attachments.get(*id) {
                att.update_pos_state(entities)?;
            }
        }
        Ok(())
    }

    pub fn update_vel_states(&self, entities: &mut EntitySet) -> CoreResult<()> {
        for id in &self.ordered {
            if let Some(att) = self.attachments.get(*id) {
                att.update_vel_state(entities)?;
            }
        }
        Ok(())
    }

    /// Forwards slave forces to masters, deepest slaves first so chains reach their roots.
    pub fn apply_forces(&self, entities: &mut EntitySet) -> CoreResult<()> {
        for id in self.ordered.iter().rev() {
            if let Some(att) = self.attachments.get(*id) {
                att.apply_forces(entities)?;
            }
        }
        Ok(())
    }

    /// Effective mass of every entity after moving dependent inertia onto masters.
    ///
    /// Only the diagonal blocks are accumulated; coupling terms between
    /// different masters of one attachment are dropped.
    pub fn add_mass_to_masters(&self, entities: &EntitySet) -> CoreResult<BTreeMap<EntityId, DMatrix<f64>>> {
        let mut masses: BTreeMap<EntityId, DMatrix<f64>> = entities
            .iter()
            .map(|(id, e)| (id, e.mass_block()))
            .collect();
        for id in self.ordered.iter().rev() {
            let Some(att) = self.attachments.get(*id) else {
                continue;
            };
            let Some(slave) = att.slave() else {
                continue;
            };
            let Some(slave_mass) = masses.get(&slave).cloned() else {
                continue;
            };
            att.add_mass_to_masters(entities, &slave_mass, |master, m| {
                if let Some(block) = masses.get_mut(&master) {
                    *block += m;
                }
            })?;
        }
        Ok(masses)
    }

    /// Folds column blocks (`vel_size x k`) placed on arbitrary entities onto
    /// non-dependent entities, applying `D -= G^T M` through every nesting level.
    pub fn fold_column_blocks(
        &self,
        entities: &EntitySet,
        blocks: impl IntoIterator<Item = (EntityId, DMatrix<f64>)>,
    ) -> CoreResult<BTreeMap<EntityId, DMatrix<f64>>> {
        self.fold(entities, blocks, |att, i, d, m| att.mul_sub_gt_m(i, entities, d, m), true)
    }

    /// Folds row blocks (`k x vel_size`) onto non-dependent entities, applying `D -= M G`.
    pub fn fold_row_blocks(
        &self,
        entities: &EntitySet,
        blocks: impl IntoIterator<Item = (EntityId, DMatrix<f64>)>,
    ) -> CoreResult<BTreeMap<EntityId, DMatrix<f64>>> {
        self.fold(entities, blocks, |att, i, d, m| att.mul_sub_m_g(i, entities, d, m), false)
    }

    fn fold(
        &self,
        entities: &EntitySet,
        blocks: impl IntoIterator<Item = (EntityId, DMatrix<f64>)>,
        apply: impl Fn(&Attachment, usize, &mut DMatrix<f64>, &DMatrix<f64>) -> CoreResult<()>,
        column_form: bool,
    ) -> CoreResult<BTreeMap<EntityId, DMatrix<f64>>> {
        let mut pending: BTreeMap<EntityId, DMatrix<f64>> = BTreeMap::new();
        for (entity, block) in blocks {
            accumulate(&mut pending, entity, block);
        }
        let mut folded = BTreeMap::new();
        while let Some((entity, block)) = pending.pop_first() {
            let Some(att) = self.attachment_of(entity) else {
                accumulate(&mut folded, entity, block);
                continue;
            };
            for (i, master) in att.masters().iter().enumerate() {
                let size = entities.entity(*master)?.vel_state_size();
                let mut d = if column_form {
                    DMatrix::zeros(size, block.ncols())
                } else {
                    DMatrix::zeros(block.nrows(), size)
                };
                apply(att, i, &mut d, &block)?;
                accumulate(&mut pending, *master, d);
            }
        }
        Ok(folded)
    }

    /// Composite Jacobian of an entity's velocity with respect to its root
    /// (non-dependent) masters.
    pub fn root_masters(&self, entities: &EntitySet, entity: EntityId) -> CoreResult<BTreeMap<EntityId, DMatrix<f64>>> {
        let size = entities.entity(entity)?.vel_state_size();
        self.fold_row_blocks(entities, [(entity, DMatrix::identity(size, size))])
    }

    /// True if the entity is independent or some dependency root is.
    pub fn is_controllable(&self, entities: &EntitySet, entity: EntityId) -> bool {
        let mut stack = vec![entity];
        let mut visited = HashSet::new();
        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            match self.attachment_of(node) {
                Some(att) => stack.extend(att.masters().iter().copied()),
                None => {
                    if entities.get(node).is_some_and(|e| e.is_independent()) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Position of an entity evaluated recursively from its roots, without
    /// reading any stored dependent state.
    pub fn evaluate_position(&self, entities: &EntitySet, entity: EntityId) -> CoreResult<DVec3> {
        Ok(self.evaluate_pose(entities, entity)?.translation)
    }

    /// Pose of an entity evaluated recursively from its roots.
    pub fn evaluate_pose(&self, entities: &EntitySet, entity: EntityId) -> CoreResult<RigidTransform> {
        let Some(att) = self.attachment_of(entity) else {
            return Ok(entities.entity(entity)?.pose());
        };
        match att.kind() {
            AttachmentKind::Frame { master, offset } => {
                Ok(self.evaluate_pose(entities, *master)? * *offset)
            }
            AttachmentKind::Point { masters } => {
                let mut pos = DVec3::ZERO;
                for master in masters {
                    let p = match *master {
                        PointMaster::Point { point, .. } => {
                            self.evaluate_position(entities, point)?
                        }
                        PointMaster::Frame { frame, loc, .. } => {
                            self.evaluate_pose(entities, frame)?.transform_point(loc)
                        }
                    };
                    pos += master.weight() * p;
                }
                Ok(RigidTransform::from_translation(pos))
            }
        }
    }
}

fn accumulate(map: &mut BTreeMap<EntityId, DMatrix<f64>>, entity: EntityId, block: DMatrix<f64>) {
    match map.get_mut(&entity) {
        Some(existing) => *existing += block,
        None => {
            map.insert(entity, block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{core::entity::DynamicEntity, utils::spatial::SpatialInertia};
    use glam::DQuat;

    #[test]
    fn cyclic_attachment_is_rejected_before_install() {
        let mut set = EntitySet::new();
        let a = set.add(DynamicEntity::particle(DVec3::ZERO, 1.0));
        let b = set.add(DynamicEntity::particle(DVec3::X, 1.0));
        let c = set.add(DynamicEntity::particle(DVec3::Y, 1.0));
        let mut graph = AttachmentGraph::new();
        graph
            .attach(&mut set, Attachment::point_to_points(b, &[(a, 1.0)]))
            .expect("b on a");
        graph
            .attach(&mut set, Attachment::point_to_points(c, &[(b, 1.0)]))
            .expect("c on b");
        let err = graph
            .attach(&mut set, Attachment::point_to_points(a, &[(c, 1.0)]))
            .expect_err("a on c closes a cycle");
        assert_eq!(err, CoreError::CyclicDependency { slave: a });
        assert_eq!(graph.len(), 2);
        assert!(!set.get(a).expect("a").flags.attached);
        assert!(graph.dependents(c).is_empty());
    }

    #[test]
    fn back_references_follow_install_and_removal() {
        let mut set = EntitySet::new();
        let frame = set.add(DynamicEntity::frame(RigidTransform::IDENTITY, SpatialInertia::default()));
        let p = set.add(DynamicEntity::particle(DVec3::ZERO, 1.0));
        let mut graph = AttachmentGraph::new();
        let id = graph
            .attach(&mut set, Attachment::point_to_frame(p, frame, DVec3::X))
            .expect("attach");
        assert_eq!(graph.dependents(frame), &[id]);
        assert!(set.get(p).expect("p").flags.attached);
        assert_eq!(
            graph.attach(&mut set, Attachment::point_to_frame(p, frame, DVec3::Y)).err(),
            Some(CoreError::AlreadyAttached(p))
        );

        graph.detach(&mut set, id).expect("detach");
        assert!(graph.dependents(frame).is_empty());
        assert!(!set.get(p).expect("p").flags.attached);
        assert!(graph.ordered().is_empty());
    }

    #[test]
    fn order_puts_masters_first_regardless_of_install_order() {
        let mut set = EntitySet::new();
        let root = set.add(DynamicEntity::frame(RigidTransform::IDENTITY, SpatialInertia::default()));
        let mid = set.add(DynamicEntity::frame(RigidTransform::IDENTITY, SpatialInertia::default()));
        let leaf = set.add(DynamicEntity::particle(DVec3::ZERO, 1.0));
        let mut graph = AttachmentGraph::new();
        let leaf_att = graph
            .attach(&mut set, Attachment::point_to_frame(leaf, mid, DVec3::X))
            .expect("leaf");
        let mid_att = graph
            .attach(
                &mut set,
                Attachment::frame_to_frame(
                    Some(mid),
                    root,
                    RigidTransform::new(DVec3::Y, DQuat::from_rotation_x(0.5)),
                ),
            )
            .expect("mid");
        assert_eq!(graph.ordered(), &[mid_att, leaf_att]);
        assert!(graph.is_controllable(&set, leaf));
    }

    #[test]
    fn effective_mass_moves_to_roots() {
        let mut set = EntitySet::new();
        let a = set.add(DynamicEntity::particle(DVec3::ZERO, 1.0));
        let b = set.add(DynamicEntity::particle(DVec3::X, 1.0));
        let s = set.add(DynamicEntity::particle(DVec3::new(0.5, 0.0, 0.0), 2.0));
        let mut graph = AttachmentGraph::new();
        graph
            .attach(&mut set, Attachment::point_to_points(s, &[(a, 0.5), (b, 0.5)]))
            .expect("attach");
        let masses = graph.add_mass_to_masters(&set).expect("masses");
        // 1 + 0.5 * 2 * 0.5
        assert!((masses[&a][(0, 0)] - 1.5).abs() < 1e-14);
        assert!((masses[&b][(1, 1)] - 1.5).abs() < 1e-14);
    }
}
