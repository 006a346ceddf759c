//! Couples joint coordinates: `c_dep = scale * f(c_1, ..., c_n)`.
//!
//! The first handle names the dependent coordinate; the rest are the inputs
//! of `f`. The coupling contributes exactly one bilateral row.

use std::fmt::Debug;

use nalgebra::DMatrix;

use super::{
    constrainer::{AssemblyContext, Constrainer},
    joint::{Joint, JointCoordinateHandle},
};
use crate::{
    core::{constraints::ConstraintInfo, sparse::BlockColumn},
    error::{CoreError, CoreResult},
    utils::allocator::{Arena, EntityId, JointId},
};

/// Scalar function of joint coordinates with an analytic gradient.
pub trait CouplingFunction: Debug + Send + Sync {
    fn num_inputs(&self) -> usize;

    fn eval(&self, inputs: &[f64]) -> f64;

    /// Writes `df/dc_i` into `out`, which has `num_inputs()` entries.
    fn gradient(&self, inputs: &[f64], out: &mut [f64]);
}

/// `f(c) = offset + sum(coefficients[i] * c[i])`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearFunction {
    pub coefficients: Vec<f64>,
    pub offset: f64,
}

impl LinearFunction {
    pub fn new(coefficients: Vec<f64>, offset: f64) -> Self {
        Self {
            coefficients,
            offset,
        }
    }

    /// `f(c) = c`, the usual choice for gear-ratio style couplings.
    pub fn identity() -> Self {
        Self::new(vec![1.0], 0.0)
    }
}

impl CouplingFunction for LinearFunction {
    fn num_inputs(&self) -> usize {
        self.coefficients.len()
    }

    fn eval(&self, inputs: &[f64]) -> f64 {
        self.offset
            + self
                .coefficients
                .iter()
                .zip(inputs)
                .map(|(a, c)| a * c)
                .sum::<f64>()
    }

    fn gradient(&self, _inputs: &[f64], out: &mut [f64]) {
        out.copy_from_slice(&self.coefficients);
    }
}

/// Single-input polynomial `f(c) = sum(coefficients[k] * c^k)`.
#[derive(Debug, Clone, PartialEq)]
pub struct PolynomialFunction {
    pub coefficients: Vec<f64>,
}

impl PolynomialFunction {
    pub fn new(coefficients: Vec<f64>) -> Self {
        Self { coefficients }
    }
}

impl CouplingFunction for PolynomialFunction {
    fn num_inputs(&self) -> usize {
        1
    }

    fn eval(&self, inputs: &[f64]) -> f64 {
        let x = inputs[0];
        self.coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c)
    }

    fn gradient(&self, inputs: &[f64], out: &mut [f64]) {
        let x = inputs[0];
        out[0] = self
            .coefficients
            .iter()
            .enumerate()
            .skip(1)
            .rev()
            .fold(0.0, |acc, (k, c)| acc * x + k as f64 * c);
    }
}

#[derive(Debug)]
pub struct CoordinateCoupling {
    name: Option<String>,
    coordinates: Vec<JointCoordinateHandle>,
    function: Box<dyn CouplingFunction>,
    scale: f64,
    pub compliance: f64,
    pub damping: f64,
    distance: f64,
    multiplier: f64,
}

impl CoordinateCoupling {
    /// `coordinates[0]` is the dependent coordinate.
    pub fn new(
        coordinates: Vec<JointCoordinateHandle>,
        function: Box<dyn CouplingFunction>,
        scale: f64,
    ) -> CoreResult<Self> {
        if coordinates.len() < 2 {
            return Err(CoreError::TooFewCoordinates(coordinates.len()));
        }
        if function.num_inputs() != coordinates.len() - 1 {
            return Err(CoreError::CountMismatch {
                what: "coupling function inputs",
                expected: coordinates.len() - 1,
                actual: function.num_inputs(),
            });
        }
        Ok(Self {
            name: None,
            coordinates,
            function,
            scale,
            compliance: 0.0,
            damping: 0.0,
            distance: 0.0,
            multiplier: 0.0,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn coordinates(&self) -> &[JointCoordinateHandle] {
        &self.coordinates
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// `c_dep - scale * f(c)`, as of the last update.
    pub fn distance(&self) -> f64 {
        self.distance
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    fn inputs(&self, joints: &Arena<Joint, JointId>) -> CoreResult<Vec<f64>> {
        self.coordinates[1..].iter().map(|h| h.value(joints)).collect()
    }

    /// Recomputes the coupling violation; joints must already be updated.
    pub fn update(&mut self, joints: &Arena<Joint, JointId>) -> CoreResult<f64> {
        let dependent = self.coordinates[0].value(joints)?;
        let inputs = self.inputs(joints)?;
        self.distance = dependent - self.scale * self.function.eval(&inputs);
        Ok(self.distance)
    }

    /// Row blocks before folding: `+1` on the dependent coordinate and
    /// `-scale * df/dc_i` on each input.
    fn row_blocks(&self, joints: &Arena<Joint, JointId>) -> CoreResult<Vec<(EntityId, DMatrix<f64>)>> {
        let inputs = self.inputs(joints)?;
        let mut grad = vec![0.0; inputs.len()];
        self.function.gradient(&inputs, &mut grad);

        let dependent = self.coordinates[0];
        let mut blocks = dependent
            .resolve(joints)?
            .coordinate_blocks(dependent.index, 1.0)?;
        for (handle, g) in self.coordinates[1..].iter().zip(grad) {
            let joint = handle.resolve(joints)?;
            blocks.extend(joint.coordinate_blocks(handle.index, -self.scale * g)?);
        }
        Ok(blocks)
    }
}

impl Constrainer for CoordinateCoupling {
    fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("coordinate coupling '{name}'"),
            None => format!("coordinate coupling of {:?}", self.coordinates[0]),
        }
    }

    fn is_active(&self, ctx: &AssemblyContext<'_>) -> bool {
        self.coordinates.iter().any(|h| {
            h.resolve(ctx.joints)
                .map(|joint| joint.is_active(ctx))
                .unwrap_or(false)
        })
    }

    fn bilateral_sizes(&self, sizes: &mut Vec<usize>) {
        sizes.push(1);
    }

    fn add_bilateral_constraints(&self, ctx: &AssemblyContext<'_>) -> CoreResult<Vec<BlockColumn>> {
        let mut column = BlockColumn::new(1);
        ctx.add_folded_entries(self.row_blocks(ctx.joints)?, &mut column, 0)?;
        Ok(vec![column])
    }

    fn bilateral_info(&self, info: &mut Vec<ConstraintInfo>) {
        info.push(ConstraintInfo::new(
            self.distance,
            self.compliance,
            self.damping,
            self.multiplier,
        ));
    }

    fn set_bilateral_forces(&mut self, lam: &[f64], scale: f64, idx: usize) -> usize {
        self.multiplier = lam[idx] * scale;
        idx + 1
    }

    fn bilateral_forces(&self, out: &mut Vec<f64>) {
        out.push(self.multiplier);
    }

    fn zero_forces(&mut self) {
        self.multiplier = 0.0;
    }
}
