//! Collidable surfaces: mesh vertices bound to the dynamic entities that move them.

use glam::DVec3;

use super::contact_master::ContactMaster;
use crate::{
    core::{entity::EntitySet, types::ContactMaterial},
    dynamics::{
        attachment::{AttachmentKind, PointMaster},
        attachment_graph::AttachmentGraph,
    },
    error::{CoreError, CoreResult},
    utils::allocator::{AttachmentId, EntityId},
};

/// How a surface vertex follows the dynamics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VertexBinding {
    /// The vertex is a particle, e.g. a finite element node.
    Node(EntityId),
    /// The vertex is fixed at `loc` in a rigid frame.
    Rigid { frame: EntityId, loc: DVec3 },
    /// The vertex is the virtual slave of a point attachment (embedded or skinned).
    Attached(AttachmentId),
}

#[derive(Debug, Clone)]
pub struct Collidable {
    pub name: Option<String>,
    vertices: Vec<VertexBinding>,
    /// Frame carrying the whole surface, for rigid collidables.
    body: Option<EntityId>,
    /// Surface material; generators fall back to the configured defaults without one.
    pub material: Option<ContactMaterial>,
}

impl Collidable {
    pub fn rigid(frame: EntityId, local_vertices: &[DVec3]) -> Self {
        Self {
            name: None,
            vertices: local_vertices
                .iter()
                .map(|loc| VertexBinding::Rigid { frame, loc: *loc })
                .collect(),
            body: Some(frame),
            material: None,
        }
    }

    pub fn deformable(nodes: &[EntityId]) -> Self {
        Self::from_bindings(nodes.iter().map(|n| VertexBinding::Node(*n)).collect())
    }

    pub fn from_bindings(vertices: Vec<VertexBinding>) -> Self {
        Self {
            name: None,
            vertices,
            body: None,
            material: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_material(mut self, material: ContactMaterial) -> Self {
        self.material = Some(material);
        self
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn vertex(&self, index: usize) -> CoreResult<&VertexBinding> {
        self.vertices.get(index).ok_or_else(|| {
            CoreError::InvalidAttachment(format!(
                "vertex {index} out of range for collidable with {} vertices",
                self.vertices.len()
            ))
        })
    }

    pub fn body(&self) -> Option<EntityId> {
        self.body
    }

    pub fn is_rigid(&self) -> bool {
        self.body.is_some()
    }

    pub fn vertex_position(
        &self,
        index: usize,
        entities: &EntitySet,
        graph: &AttachmentGraph,
    ) -> CoreResult<DVec3> {
        match *self.vertex(index)? {
            VertexBinding::Node(node) => Ok(entities.entity(node)?.position()),
            VertexBinding::Rigid { frame, loc } => Ok(entities.frame(frame)?.pose.transform_point(loc)),
            VertexBinding::Attached(id) => graph
                .get(id)
                .ok_or(CoreError::UnknownAttachment(id))?
                .slave_position(entities),
        }
    }

    /// Appends the masters of a vertex, each scaled by `weight`.
    ///
    /// Attached vertices expand into the attachment's masters; masters that
    /// are themselves dependent are folded onto their roots at assembly.
    pub fn vertex_masters(
        &self,
        index: usize,
        weight: f64,
        entities: &EntitySet,
        graph: &AttachmentGraph,
        out: &mut Vec<ContactMaster>,
    ) -> CoreResult<()> {
        match *self.vertex(index)? {
            VertexBinding::Node(node) => out.push(ContactMaster::new(node, weight)),
            VertexBinding::Rigid { frame, loc } => {
                let point = entities.frame(frame)?.pose.transform_point(loc);
                out.push(ContactMaster::at_point(frame, weight, point));
            }
            VertexBinding::Attached(id) => {
                let attachment = graph.get(id).ok_or(CoreError::UnknownAttachment(id))?;
                let AttachmentKind::Point { masters } = attachment.kind() else {
                    return Err(CoreError::InvalidAttachment(
                        "surface vertices need point attachments".to_string(),
                    ));
                };
                for master in masters {
                    match *master {
                        PointMaster::Point { point, weight: w } => {
                            out.push(ContactMaster::new(point, weight * w));
                        }
                        PointMaster::Frame { frame, weight: w, loc } => {
                            let point = entities.frame(frame)?.pose.transform_point(loc);
                            out.push(ContactMaster::at_point(frame, weight * w, point));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Masters of a point interpolated from several vertices.
    pub fn support_masters(
        &self,
        support: impl IntoIterator<Item = (usize, f64)>,
        weight: f64,
        entities: &EntitySet,
        graph: &AttachmentGraph,
        out: &mut Vec<ContactMaster>,
    ) -> CoreResult<()> {
        for (vertex, w) in support {
            if w != 0.0 {
                self.vertex_masters(vertex, weight * w, entities, graph, out)?;
            }
        }
        Ok(())
    }
}
