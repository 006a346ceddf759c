//! Attachments, joints, couplings, row assembly and the solver hand-off.

pub mod attachment;
pub mod attachment_graph;
pub mod constrainer;
pub mod coordinate_coupling;
pub mod coupling;
pub mod joint;
pub mod reference_solver;
pub mod topology;

pub use attachment::Attachment;
pub use attachment_graph::AttachmentGraph;
pub use constrainer::{Constrainer, ConstrainerHandle, ConstraintSystem};
pub use coordinate_coupling::CoordinateCoupling;
pub use joint::{Joint, JointCoordinateHandle};
pub use reference_solver::{ConstraintSolver, DenseSolver};
pub use topology::KinematicTopology;
