//! Utility helpers: handles and arenas, math and spatial algebra, stage timing and profiling.

pub mod allocator;
pub mod math;
pub mod profiling;
pub mod spatial;

pub use allocator::{
    Arena, ArenaKey, AttachmentId, CollidableId, CouplingId, EntityId, GenerationalId,
    GeneratorId, JointId,
};
pub use spatial::{SpatialInertia, Twist, Wrench};
