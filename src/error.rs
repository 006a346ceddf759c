//! Error types shared across the constraint core.

use thiserror::Error;

use crate::utils::allocator::{AttachmentId, CollidableId, EntityId, JointId};

/// Errors raised while building or stepping a mechanical system.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// Installing the attachment would make an entity depend on itself.
    #[error("attaching {slave:?} would create a dependency cycle")]
    CyclicDependency { slave: EntityId },

    #[error("entity {0:?} is already attached")]
    AlreadyAttached(EntityId),

    #[error("unknown entity {0:?}")]
    UnknownEntity(EntityId),

    #[error("unknown attachment {0:?}")]
    UnknownAttachment(AttachmentId),

    #[error("unknown joint {0:?}")]
    UnknownJoint(JointId),

    #[error("unknown collidable {0:?}")]
    UnknownCollidable(CollidableId),

    #[error("invalid attachment: {0}")]
    InvalidAttachment(String),

    #[error("entity {entity:?} is not a {expected}")]
    WrongEntityKind {
        entity: EntityId,
        expected: &'static str,
    },

    /// A coordinate coupling must relate a dependent coordinate to at least one other.
    #[error("coordinate coupling needs at least 2 coordinates, got {0}")]
    TooFewCoordinates(usize),

    #[error("{what}: expected {expected}, got {actual}")]
    CountMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("coordinate {index} out of bounds for joint with {count} coordinates")]
    CoordinateOutOfBounds { index: usize, count: usize },

    #[error("invalid coordinate range [{min}, {max}]")]
    InvalidRange { min: f64, max: f64 },

    #[error("entity {0:?} is not independent and cannot be positioned directly")]
    NotIndependent(EntityId),

    /// A constrainer wrote a different number of rows than it reported.
    #[error("{constrainer} reported {reported} rows but produced {produced}")]
    RowAccounting {
        constrainer: String,
        reported: usize,
        produced: usize,
    },

    #[error("constraint system is singular")]
    SingularSystem,
}

pub type CoreResult<T> = Result<T, CoreError>;
