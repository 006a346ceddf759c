//! Constraint Core – constraint-based multibody dynamics for Rust.
//!
//! Rigid frames and particles are coupled by attachments, joints, coordinate
//! couplings and contacts. Every constraint source contributes rows to one
//! sparse block system per step through the [`Constrainer`] contract; the
//! solve itself is delegated to a [`ConstraintSolver`].

pub mod collision;
pub mod config;
pub mod core;
pub mod dynamics;
pub mod error;
pub mod utils;
pub mod world;

pub use glam::{DMat3, DQuat, DVec3};

pub use collision::{
    collidable::{Collidable, VertexBinding},
    contact::{ContactConstraint, ContactKey, ContactKind, Side},
    contact_master::ContactMaster,
    contact_point::ContactPoint,
    detector::{ContactData, EdgeEdgeContact, PenetratingPoint},
    handler::ContactGenerator,
};
pub use config::CoreConfig;
pub use core::{
    constraints::{ConstraintInfo, Engagement, FrictionInfo},
    entity::{DynamicEntity, EntityFlags, EntityKind, EntitySet, FrameBody, Particle},
    sparse::{BlockColumn, SparseBlockMatrix},
    types::{ContactMaterial, MixingMode, RigidTransform},
};
pub use dynamics::{
    attachment::{Attachment, AttachmentKind, PointMaster},
    attachment_graph::AttachmentGraph,
    constrainer::{AssemblyContext, Constrainer, ConstrainerHandle, ConstraintSystem},
    coordinate_coupling::{CoordinateCoupling, CouplingFunction, LinearFunction, PolynomialFunction},
    coupling::{CouplingKind, MotionType, RigidBodyCoupling},
    joint::{Joint, JointCoordinateHandle},
    reference_solver::{ConstraintSolver, DenseSolver, SolveProblem, SolveResult},
    topology::KinematicTopology,
};
pub use error::{CoreError, CoreResult};
pub use utils::{
    allocator::{Arena, AttachmentId, CollidableId, CouplingId, EntityId, GeneratorId, JointId},
    spatial::{SpatialInertia, Twist, Wrench},
};
pub use world::{ContactFeed, MechSystem};
