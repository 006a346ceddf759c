//! State, index and sparse-matrix types shared by every constraint source.

pub mod constraints;
pub mod entity;
pub mod sparse;
pub mod types;

pub use constraints::{ConstraintInfo, Engagement, FrictionInfo};
pub use entity::{DynamicEntity, EntitySet};
pub use sparse::{BlockColumn, SparseBlockMatrix};
pub use types::{ContactMaterial, RigidTransform};
