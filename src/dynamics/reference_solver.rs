//! The solver hand-off and a small dense reference implementation.
//!
//! Multipliers are impulses over the step; the system writes them back
//! scaled by `1/h` so constrainers hold forces.

use nalgebra::{DMatrix, DVector};

use super::constrainer::ConstraintSystem;
use crate::{
    core::constraints::ConstraintInfo,
    error::{CoreError, CoreResult},
    utils::profiling::{Stage, StageTimer},
};

/// Everything a velocity-level solve needs, over the independent DOFs.
pub struct SolveProblem<'a> {
    pub h: f64,
    /// Effective mass, attachments folded in.
    pub mass: &'a DMatrix<f64>,
    pub velocity: &'a DVector<f64>,
    pub force: &'a DVector<f64>,
    pub system: &'a ConstraintSystem,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolveResult {
    pub velocity: DVector<f64>,
    pub bilateral: Vec<f64>,
    pub unilateral: Vec<f64>,
    pub friction: Vec<f64>,
}

pub trait ConstraintSolver {
    fn solve(&mut self, problem: &SolveProblem<'_>) -> CoreResult<SolveResult>;
}

/// Dense Schur-complement solver with a primal active set for unilateral rows.
///
/// Solves `(A^T M^-1 A + C) lambda = -g/h - A^T u_free` with
/// `u_free = u + h M^-1 f`; unilateral rows with negative impulses are
/// dropped and the system re-solved. Friction rows are ignored.
#[derive(Debug, Clone)]
pub struct DenseSolver {
    pub max_active_set_iterations: usize,
}

impl Default for DenseSolver {
    fn default() -> Self {
        Self {
            max_active_set_iterations: 32,
        }
    }
}

impl ConstraintSolver for DenseSolver {
    fn solve(&mut self, problem: &SolveProblem<'_>) -> CoreResult<SolveResult> {
        let _timer = StageTimer::trace(Stage::DenseSolve);
        let h = problem.h;
        let system = problem.system;
        let m_inv = problem
            .mass
            .clone()
            .try_inverse()
            .ok_or(CoreError::SingularSystem)?;
        let u_free = problem.velocity + (&m_inv * problem.force) * h;

        let g = system.gt.to_dense();
        let n = system.nt.to_dense();
        let mb = system.num_bilaterals();
        let mu = system.num_unilaterals();

        let mut active: Vec<bool> = vec![true; mu];
        let mut lambda_u = vec![0.0; mu];
        let mut lambda_b = vec![0.0; mb];

        for _ in 0..self.max_active_set_iterations.max(1) {
            let unilateral: Vec<usize> = (0..mu).filter(|&i| active[i]).collect();
            let cols = mb + unilateral.len();
            let mut a = DMatrix::zeros(u_free.len(), cols);
            let mut info: Vec<&ConstraintInfo> = Vec::with_capacity(cols);
            for j in 0..mb {
                a.set_column(j, &g.column(j));
                info.push(&system.g_info[j]);
            }
            for (k, &i) in unilateral.iter().enumerate() {
                a.set_column(mb + k, &n.column(i));
                info.push(&system.n_info[i]);
            }

            let mut lhs = a.transpose() * &m_inv * &a;
            let mut rhs = -(a.transpose() * &u_free);
            for (j, row) in info.iter().enumerate() {
                lhs[(j, j)] += row.compliance / (h * h);
                rhs[j] -= row.distance / h;
            }
            let lambda = if cols == 0 {
                DVector::zeros(0)
            } else {
                lhs.lu().solve(&rhs).ok_or(CoreError::SingularSystem)?
            };

            lambda_b.copy_from_slice(&lambda.as_slice()[..mb]);
            lambda_u.iter_mut().for_each(|l| *l = 0.0);
            let mut separating = false;
            for (k, &i) in unilateral.iter().enumerate() {
                let value = lambda[mb + k];
                if value < 0.0 {
                    active[i] = false;
                    separating = true;
                } else {
                    lambda_u[i] = value;
                }
            }
            if !separating {
                let velocity = &u_free + &m_inv * (&a * &lambda);
                return Ok(SolveResult {
                    velocity,
                    bilateral: lambda_b,
                    unilateral: lambda_u,
                    friction: vec![0.0; system.f_info.len()],
                });
            }
        }
        log::warn!("active set did not settle after {} iterations", self.max_active_set_iterations);
        Err(CoreError::SingularSystem)
    }
}
