//! Contact constraints generated from collision-detector records.

pub mod collidable;
pub mod contact;
pub mod contact_master;
pub mod contact_point;
pub mod detector;
pub mod handler;

pub use collidable::Collidable;
pub use contact::ContactConstraint;
pub use detector::ContactData;
pub use handler::ContactGenerator;
