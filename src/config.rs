//! Global configuration for the constraint core.
//!
//! The constants are the defaults used by [`CoreConfig::default`]; joints and
//! contact generators copy their tolerances from the active config when they
//! are created.

use glam::DVec3;
use serde::{Deserialize, Serialize};

/// Gravity applied to independent entities each step. Off unless configured.
pub const DEFAULT_GRAVITY: [f64; 3] = [0.0, 0.0, 0.0];

/// Penetration allowed before a contact or linear limit reports a nonzero distance.
pub const DEFAULT_PENETRATION_TOL: f64 = 1e-4;

/// Tolerance for linear coordinate limits.
pub const DEFAULT_LINEAR_LIMIT_TOL: f64 = 1e-4;

/// Tolerance for rotary coordinate limits (radians).
pub const DEFAULT_ROTARY_LIMIT_TOL: f64 = 1e-4;

/// Separation speed a limit must exceed before it may disengage.
///
/// Negative infinity leaves disengagement to the solved multiplier alone.
pub const DEFAULT_BREAK_SPEED: f64 = f64::NEG_INFINITY;

/// Friction rows are skipped when `mu * |impulse|` falls below this value.
pub const DEFAULT_FRICTION_IMPULSE_THRESHOLD: f64 = 1e-4;

/// Translational speed above which an entity is reported unstable.
pub const DEFAULT_TRANSLATIONAL_VELOCITY_LIMIT: f64 = 1e10;

/// Rotational speed above which an entity is reported unstable.
pub const DEFAULT_ROTATIONAL_VELOCITY_LIMIT: f64 = 1e10;

/// Tangential slip below this magnitude uses a default friction direction.
pub const DEGENERATE_DIRECTION_EPS: f64 = f64::EPSILON;

/// Tunable parameters shared by the system components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub gravity: DVec3,
    pub penetration_tol: f64,
    pub linear_limit_tol: f64,
    pub rotary_limit_tol: f64,
    pub break_speed: f64,
    pub friction_impulse_threshold: f64,
    pub translational_velocity_limit: f64,
    pub rotational_velocity_limit: f64,
    /// Default friction coefficient for new contact generators.
    pub contact_friction: f64,
    pub contact_compliance: f64,
    pub contact_damping: f64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            gravity: DVec3::from_array(DEFAULT_GRAVITY),
            penetration_tol: DEFAULT_PENETRATION_TOL,
            linear_limit_tol: DEFAULT_LINEAR_LIMIT_TOL,
            rotary_limit_tol: DEFAULT_ROTARY_LIMIT_TOL,
            break_speed: DEFAULT_BREAK_SPEED,
            friction_impulse_threshold: DEFAULT_FRICTION_IMPULSE_THRESHOLD,
            translational_velocity_limit: DEFAULT_TRANSLATIONAL_VELOCITY_LIMIT,
            rotational_velocity_limit: DEFAULT_ROTATIONAL_VELOCITY_LIMIT,
            contact_friction: 0.0,
            contact_compliance: 0.0,
            contact_damping: 0.0,
        }
    }
}
