//! Turns detector records for one collidable pair into contact constraints.
//!
//! Contacts are keyed by their sorted vertex tuple and kept across steps, so
//! warm data (impulse, masters) survives while a contact persists. Rows are
//! emitted in key order, first-collidable vertices before second.

use std::collections::{btree_map::Entry, BTreeMap};

use glam::DVec3;

use super::{
    collidable::Collidable,
    contact::{ContactConstraint, ContactKey, ContactKind, Side},
    contact_master::ContactMaster,
    contact_point::ContactPoint,
    detector::{ContactData, EdgeEdgeContact, PenetratingPoint},
};
use crate::{
    config::CoreConfig,
    core::{
        constraints::{ConstraintInfo, FrictionInfo},
        entity::EntitySet,
        sparse::BlockColumn,
        types::ContactMaterial,
    },
    dynamics::{
        attachment_graph::AttachmentGraph,
        constrainer::{AssemblyContext, Constrainer},
    },
    error::{CoreError, CoreResult},
    utils::{
        allocator::{Arena, CollidableId},
        profiling::{Stage, StageTimer},
    },
};

#[derive(Debug, Clone)]
pub struct ContactGenerator {
    collidable0: CollidableId,
    collidable1: CollidableId,
    /// Contacts keyed by first-collidable vertices, including edge contacts.
    contacts0: BTreeMap<ContactKey, ContactConstraint>,
    /// Contacts of second-collidable vertices against the first.
    contacts1: BTreeMap<ContactKey, ContactConstraint>,
    pub friction: f64,
    pub compliance: f64,
    pub damping: f64,
    pub penetration_tol: f64,
    pub friction_impulse_threshold: f64,
    /// Key contacts of a rigid collidable by the opposing face when it has more vertices.
    pub hash_by_face: bool,
    structure_changed: bool,
    max_penetration: f64,
}

impl ContactGenerator {
    pub fn new(collidable0: CollidableId, collidable1: CollidableId, config: &CoreConfig) -> Self {
        Self {
            collidable0,
            collidable1,
            contacts0: BTreeMap::new(),
            contacts1: BTreeMap::new(),
            friction: config.contact_friction,
            compliance: config.contact_compliance,
            damping: config.contact_damping,
            penetration_tol: config.penetration_tol,
            friction_impulse_threshold: config.friction_impulse_threshold,
            hash_by_face: false,
            structure_changed: false,
            max_penetration: 0.0,
        }
    }

    /// Takes friction, compliance and damping from a surface material.
    pub fn with_material(mut self, material: &ContactMaterial) -> Self {
        self.friction = material.friction;
        self.compliance = material.compliance;
        self.damping = material.damping;
        self
    }

    pub fn collidables(&self) -> (CollidableId, CollidableId) {
        (self.collidable0, self.collidable1)
    }

    pub fn num_contacts(&self) -> usize {
        self.contacts0.len() + self.contacts1.len()
    }

    /// Contacts in row order.
    pub fn contacts(&self) -> impl Iterator<Item = &ContactConstraint> + '_ {
        self.contacts0.values().chain(self.contacts1.values())
    }

    fn contacts_mut(&mut self) -> impl Iterator<Item = &mut ContactConstraint> + '_ {
        self.contacts0.values_mut().chain(self.contacts1.values_mut())
    }

    /// The set of contacts or their masters changed in the last update.
    pub fn structure_changed(&self) -> bool {
        self.structure_changed
    }

    pub fn max_penetration(&self) -> f64 {
        self.max_penetration
    }

    pub fn clear(&mut self) {
        self.structure_changed = self.num_contacts() > 0;
        self.contacts0.clear();
        self.contacts1.clear();
        self.max_penetration = 0.0;
    }

    /// Rebuilds the contact set from this step's detector records.
    ///
    /// A record that cannot be processed is skipped with a warning. Returns
    /// the maximum penetration over the surviving contacts.
    pub fn update(
        &mut self,
        data: &ContactData,
        collidables: &Arena<Collidable, CollidableId>,
        entities: &EntitySet,
        graph: &AttachmentGraph,
    ) -> CoreResult<f64> {
        let _timer = StageTimer::trace(Stage::ContactUpdate);
        let c0 = collidables
            .get(self.collidable0)
            .ok_or(CoreError::UnknownCollidable(self.collidable0))?;
        let c1 = collidables
            .get(self.collidable1)
            .ok_or(CoreError::UnknownCollidable(self.collidable1))?;

        let prev_keys: Vec<ContactKey> = self.contacts().map(|c| c.key().clone()).collect();
        for contact in self.contacts_mut() {
            contact.active = false;
            contact.added = false;
        }

        let pair = PairView {
            first: c0,
            second: c1,
            entities,
            graph,
        };
        for record in &data.points0 {
            if let Err(err) = self.add_point_contact(&pair, Side::First, record) {
                log::warn!("skipping vertex {} contact: {err}", record.vertex);
            }
        }
        for record in &data.points1 {
            if let Err(err) = self.add_point_contact(&pair, Side::Second, record) {
                log::warn!("skipping vertex {} contact: {err}", record.vertex);
            }
        }
        for record in &data.edge_edge {
            if let Err(err) = self.add_edge_contact(&pair, record) {
                log::warn!("skipping edge contact {:?}/{:?}: {err}", record.edge0, record.edge1);
            }
        }

        for contact in self.contacts_mut() {
            if contact.active && !contact.is_controllable(entities, graph) {
                contact.active = false;
            }
        }
        self.contacts0.retain(|_, c| c.active);
        self.contacts1.retain(|_, c| c.active);

        let keys_changed = !self.contacts().map(ContactConstraint::key).eq(prev_keys.iter());
        self.structure_changed = keys_changed || self.contacts().any(|c| c.added || c.masters_changed());
        self.max_penetration = self.contacts().map(ContactConstraint::penetration).fold(0.0, f64::max);
        if self.structure_changed {
            log::debug!(
                "{} contacts between {:?} and {:?}, structure changed",
                self.num_contacts(),
                self.collidable0,
                self.collidable1
            );
        }
        Ok(self.max_penetration)
    }

    /// Finds or allocates the contact for `key`. Contacts whose last impulse
    /// was separating are not reused, and a contact already filled this step
    /// with a deeper penetration is kept as is.
    fn get_contact<'m>(
        map: &'m mut BTreeMap<ContactKey, ContactConstraint>,
        key: ContactKey,
        kind: ContactKind,
        depth: f64,
    ) -> Option<&'m mut ContactConstraint> {
        match map.entry(key) {
            Entry::Occupied(entry) => {
                let contact = entry.into_mut();
                if contact.impulse < 0.0 || (contact.active && -contact.distance >= depth) {
                    return None;
                }
                contact.kind = kind;
                Some(contact)
            }
            Entry::Vacant(entry) => {
                let key = entry.key().clone();
                Some(entry.insert(ContactConstraint::new(key, kind)))
            }
        }
    }

    fn map_for(&mut self, side: Side) -> &mut BTreeMap<ContactKey, ContactConstraint> {
        match side {
            Side::First => &mut self.contacts0,
            Side::Second => &mut self.contacts1,
        }
    }

    fn add_point_contact(&mut self, pair: &PairView<'_>, side: Side, record: &PenetratingPoint) -> CoreResult<()> {
        let penetrating = pair.collidable(side);
        let opposing = pair.collidable(side.other());
        let sign = side.sign();

        let face_corners = if opposing.is_rigid() {
            None
        } else {
            let mut corners = [DVec3::ZERO; 3];
            for (corner, v) in corners.iter_mut().zip(record.face) {
                *corner = opposing.vertex_position(v, pair.entities, pair.graph)?;
            }
            Some(corners)
        };
        let vertex_point = ContactPoint::from_vertex(record.position, record.vertex);
        let face_point = match (face_corners, record.coords) {
            (None, _) => ContactPoint::at(record.position),
            (Some(_), Some(coords)) => ContactPoint::on_face(record.position, record.face, coords),
            (Some(corners), None) => ContactPoint::on_triangle(record.position, record.face, corners),
        };

        let by_face = self.hash_by_face
            && penetrating.is_rigid()
            && !opposing.is_rigid()
            && penetrating.num_vertices() > opposing.num_vertices();
        let (kind, key) = if by_face {
            (
                ContactKind::BodyFace,
                ContactKey::new(record.face.iter().map(|v| (side.other(), *v))),
            )
        } else if opposing.is_rigid() {
            (ContactKind::VertexBody, ContactKey::new([(side, record.vertex)]))
        } else {
            let face = record.face.iter().map(|v| (side.other(), *v));
            (
                ContactKind::VertexFace,
                ContactKey::new(std::iter::once((side, record.vertex)).chain(face)),
            )
        };

        let mut masters = Vec::new();
        match (kind, penetrating.body()) {
            (ContactKind::BodyFace, Some(body)) => {
                masters.push(ContactMaster::at_point(body, sign, record.position));
            }
            _ => penetrating.vertex_masters(record.vertex, sign, pair.entities, pair.graph, &mut masters)?,
        }
        match opposing.body() {
            Some(body) => masters.push(ContactMaster::at_point(body, -sign, record.position)),
            None => opposing.support_masters(face_point.support(), -sign, pair.entities, pair.graph, &mut masters)?,
        }

        let friction = self.friction;
        // the first collidable's masters carry positive weight, so normals point toward it
        let normal = record.normal * sign;
        let Some(contact) = Self::get_contact(self.map_for(side), key, kind, record.depth) else {
            return Ok(());
        };
        let (point0, point1) = match side {
            Side::First => (vertex_point, face_point),
            Side::Second => (face_point, vertex_point),
        };
        fill_contact(contact, point0, point1, normal, record.depth, friction, masters);
        Ok(())
    }

    fn add_edge_contact(&mut self, pair: &PairView<'_>, record: &EdgeEdgeContact) -> CoreResult<()> {
        let point0 = ContactPoint::on_edge(record.point0, record.edge0, record.s0);
        let point1 = ContactPoint::on_edge(record.point1, record.edge1, record.s1);

        let mut key = Vec::new();
        let mut masters = Vec::new();
        for (side, edge, point) in [(Side::First, record.edge0, &point0), (Side::Second, record.edge1, &point1)] {
            let collidable = pair.collidable(side);
            match collidable.body() {
                Some(body) => masters.push(ContactMaster::at_point(body, side.sign(), point.position())),
                None => {
                    key.extend(edge.iter().map(|v| (side, *v)));
                    collidable.support_masters(point.support(), side.sign(), pair.entities, pair.graph, &mut masters)?;
                }
            }
        }
        let kind = match key.len() {
            4 => ContactKind::EdgeEdge,
            2 => ContactKind::EdgeBody,
            _ => {
                // both rigid: rigid pairs are keyed by both edges
                key.extend(record.edge0.iter().map(|v| (Side::First, *v)));
                key.extend(record.edge1.iter().map(|v| (Side::Second, *v)));
                ContactKind::EdgeEdge
            }
        };

        let friction = self.friction;
        let Some(contact) = Self::get_contact(&mut self.contacts0, ContactKey::new(key), kind, record.depth) else {
            return Ok(());
        };
        fill_contact(contact, point0, point1, record.normal, record.depth, friction, masters);
        Ok(())
    }

    fn contact_info(&self, contact: &ContactConstraint) -> ConstraintInfo {
        let d = contact.distance;
        let distance = if d < -self.penetration_tol {
            d + self.penetration_tol
        } else {
            0.0
        };
        ConstraintInfo::new(distance, self.compliance, self.damping, contact.impulse)
    }
}

fn fill_contact(
    contact: &mut ContactConstraint,
    point0: ContactPoint,
    point1: ContactPoint,
    normal: DVec3,
    depth: f64,
    friction: f64,
    masters: Vec<ContactMaster>,
) {
    contact.active = true;
    contact.point0 = point0;
    contact.point1 = point1;
    contact.normal = normal.normalize_or_zero();
    contact.distance = -depth;
    contact.friction = friction;
    contact.begin_set();
    contact.add_masters(masters);
    contact.end_set();
}

struct PairView<'a> {
    first: &'a Collidable,
    second: &'a Collidable,
    entities: &'a EntitySet,
    graph: &'a AttachmentGraph,
}

impl<'a> PairView<'a> {
    fn collidable(&self, side: Side) -> &'a Collidable {
        match side {
            Side::First => self.first,
            Side::Second => self.second,
        }
    }
}

impl Constrainer for ContactGenerator {
    fn label(&self) -> String {
        format!("contacts {:?}/{:?}", self.collidable0, self.collidable1)
    }

    fn is_active(&self, ctx: &AssemblyContext<'_>) -> bool {
        self.contacts()
            .any(|c| c.is_controllable(ctx.entities, ctx.attachments))
    }

    fn bilateral_sizes(&self, sizes: &mut Vec<usize>) {
        sizes.resize(sizes.len() + self.num_contacts(), 1);
    }

    fn add_bilateral_constraints(&self, ctx: &AssemblyContext<'_>) -> CoreResult<Vec<BlockColumn>> {
        self.contacts()
            .map(|contact| {
                let mut column = BlockColumn::new(1);
                contact.add_to_column(ctx, &[contact.normal], &mut column, 0)?;
                Ok(column)
            })
            .collect()
    }

    fn bilateral_info(&self, info: &mut Vec<ConstraintInfo>) {
        info.extend(self.contacts().map(|c| self.contact_info(c)));
    }

    /// A separating (negative) multiplier deactivates the contact for the next update.
    fn set_bilateral_forces(&mut self, lam: &[f64], scale: f64, idx: usize) -> usize {
        let mut k = idx;
        for contact in self.contacts_mut() {
            contact.impulse = lam[k] * scale;
            if contact.impulse < 0.0 {
                contact.active = false;
            }
            k += 1;
        }
        k
    }

    fn bilateral_forces(&self, out: &mut Vec<f64>) {
        out.extend(self.contacts().map(|c| c.impulse));
    }

    fn max_friction_constraint_sets(&self) -> usize {
        self.num_contacts()
    }

    fn add_friction_constraints(
        &self,
        ctx: &AssemblyContext<'_>,
        bilateral_offset: usize,
    ) -> CoreResult<(Vec<BlockColumn>, Vec<FrictionInfo>)> {
        let mut columns = Vec::new();
        let mut infos = Vec::new();
        for (k, contact) in self.contacts().enumerate() {
            let mu = contact.friction;
            if mu == 0.0 || mu * contact.impulse.abs() < self.friction_impulse_threshold {
                continue;
            }
            let dirs = contact.friction_directions(ctx)?;
            let mut column = BlockColumn::new(2);
            contact.add_to_column(ctx, &dirs, &mut column, 0)?;
            columns.push(column);
            infos.push(FrictionInfo {
                mu,
                contact_index: bilateral_offset + k,
                bilateral: contact.bilateral,
                block_size: 2,
            });
        }
        Ok((columns, infos))
    }

    fn zero_forces(&mut self) {
        for contact in self.contacts_mut() {
            contact.impulse = 0.0;
        }
    }
}
