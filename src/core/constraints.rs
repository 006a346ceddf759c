use serde::{Deserialize, Serialize};

/// Per-row data handed to the solver alongside a constraint column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstraintInfo {
    /// Constraint violation; negative means penetration.
    pub distance: f64,
    pub compliance: f64,
    pub damping: f64,
    /// Last multiplier written back for this row.
    pub force: f64,
}

impl ConstraintInfo {
    pub fn new(distance: f64, compliance: f64, damping: f64, force: f64) -> Self {
        Self {
            distance,
            compliance,
            damping,
            force,
        }
    }
}

/// Data for one friction constraint set (a block column of tangent rows).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrictionInfo {
    pub mu: f64,
    /// Global index of the normal row bounding this set.
    pub contact_index: usize,
    /// The bounding normal row lives in the bilateral matrix.
    pub bilateral: bool,
    pub block_size: usize,
}

/// Unilateral row engagement state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Engagement {
    #[default]
    Disengaged,
    /// Pressed against the lower limit.
    Lower,
    /// Pressed against the upper limit.
    Upper,
}

impl Engagement {
    pub fn is_engaged(self) -> bool {
        !matches!(self, Engagement::Disengaged)
    }

    /// Sign applied to the coordinate wrench of the limited coordinate.
    pub fn sign(self) -> f64 {
        match self {
            Engagement::Disengaged => 0.0,
            Engagement::Lower => 1.0,
            Engagement::Upper => -1.0,
        }
    }
}
