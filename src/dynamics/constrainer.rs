//! The contract every constraint source implements, and the assembler that
//! visits all sources once per step to build the global sparse system.
//!
//! Sources are named by a closed [`ConstrainerHandle`]; the assembler
//! resolves each handle to a `&dyn Constrainer` and visits them in
//! registration order, so row indexing is reproducible.

use std::ops::Range;

use nalgebra::DMatrix;

use super::{
    attachment_graph::AttachmentGraph, coordinate_coupling::CoordinateCoupling, joint::Joint,
};
use crate::{
    collision::handler::ContactGenerator,
    core::{
        constraints::{ConstraintInfo, FrictionInfo},
        entity::EntitySet,
        sparse::{BlockColumn, SparseBlockMatrix},
    },
    error::{CoreError, CoreResult},
    utils::{
        allocator::{Arena, CouplingId, EntityId, GeneratorId, JointId},
        profiling::{Stage, StageTimer},
    },
};

/// Read-only view of the model handed to constrainers during assembly.
#[derive(Clone, Copy)]
pub struct AssemblyContext<'a> {
    pub entities: &'a EntitySet,
    pub attachments: &'a AttachmentGraph,
    pub joints: &'a Arena<Joint, JointId>,
}

impl<'a> AssemblyContext<'a> {
    /// Folds blocks placed on arbitrary entities onto independent masters and
    /// accumulates them into column `col`.
    pub fn add_folded_entries(
        &self,
        blocks: Vec<(EntityId, DMatrix<f64>)>,
        column: &mut BlockColumn,
        col: usize,
    ) -> CoreResult<()> {
        let folded = self.attachments.fold_column_blocks(self.entities, blocks)?;
        for (entity, block) in folded {
            let Some(bi) = self.entities.get(entity).and_then(|e| e.solve_index()) else {
                continue;
            };
            column.add_entry(bi, col, &block.column(0).into_owned());
        }
        Ok(())
    }
}

/// Uniform contract for bilateral, unilateral and friction row sources.
///
/// Row structure may change only in the engagement pass that precedes
/// assembly; assembly and force write-back never change it.
pub trait Constrainer: Send + Sync {
    fn label(&self) -> String;

    /// Whether any row can act on an independent entity.
    fn is_active(&self, ctx: &AssemblyContext<'_>) -> bool;

    /// Appends one width per bilateral block column.
    fn bilateral_sizes(&self, sizes: &mut Vec<usize>);

    fn add_bilateral_constraints(&self, ctx: &AssemblyContext<'_>) -> CoreResult<Vec<BlockColumn>>;

    fn bilateral_info(&self, info: &mut Vec<ConstraintInfo>);

    /// Stores `lam[idx..] * scale` and returns the index past the consumed rows.
    fn set_bilateral_forces(&mut self, lam: &[f64], scale: f64, idx: usize) -> usize;

    fn bilateral_forces(&self, out: &mut Vec<f64>);

    fn unilateral_sizes(&self, _sizes: &mut Vec<usize>) {}

    fn add_unilateral_constraints(&self, _ctx: &AssemblyContext<'_>) -> CoreResult<Vec<BlockColumn>> {
        Ok(Vec::new())
    }

    fn unilateral_info(&self, _info: &mut Vec<ConstraintInfo>) {}

    fn set_unilateral_forces(&mut self, _lam: &[f64], _scale: f64, idx: usize) -> usize {
        idx
    }

    fn unilateral_forces(&self, _out: &mut Vec<f64>) {}

    fn max_friction_constraint_sets(&self) -> usize {
        0
    }

    /// Friction columns bounded by this source's bilateral rows, which start at `bilateral_offset`.
    fn add_friction_constraints(
        &self,
        _ctx: &AssemblyContext<'_>,
        _bilateral_offset: usize,
    ) -> CoreResult<(Vec<BlockColumn>, Vec<FrictionInfo>)> {
        Ok((Vec::new(), Vec::new()))
    }

    fn zero_forces(&mut self);
}

/// Closed set of constraint source kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstrainerHandle {
    Joint(JointId),
    Coupling(CouplingId),
    Contact(GeneratorId),
}

/// Borrowed collections the handles resolve into.
pub struct ConstrainerSet<'a> {
    pub joints: &'a Arena<Joint, JointId>,
    pub couplings: &'a Arena<CoordinateCoupling, CouplingId>,
    pub generators: &'a Arena<ContactGenerator, GeneratorId>,
}

impl<'a> ConstrainerSet<'a> {
    pub fn resolve(&self, handle: ConstrainerHandle) -> Option<&'a dyn Constrainer> {
        match handle {
            ConstrainerHandle::Joint(id) => self.joints.get(id).map(|c| c as &dyn Constrainer),
            ConstrainerHandle::Coupling(id) => self.couplings.get(id).map(|c| c as &dyn Constrainer),
            ConstrainerHandle::Contact(id) => self.generators.get(id).map(|c| c as &dyn Constrainer),
        }
    }
}

/// Mutable counterpart of [`ConstrainerSet`] for force write-back.
pub struct ConstrainerSetMut<'a> {
    pub joints: &'a mut Arena<Joint, JointId>,
    pub couplings: &'a mut Arena<CoordinateCoupling, CouplingId>,
    pub generators: &'a mut Arena<ContactGenerator, GeneratorId>,
}

impl<'a> ConstrainerSetMut<'a> {
    pub fn resolve_mut(&mut self, handle: ConstrainerHandle) -> Option<&mut dyn Constrainer> {
        match handle {
            ConstrainerHandle::Joint(id) => self.joints.get_mut(id).map(|c| c as &mut dyn Constrainer),
            ConstrainerHandle::Coupling(id) => {
                self.couplings.get_mut(id).map(|c| c as &mut dyn Constrainer)
            }
            ConstrainerHandle::Contact(id) => {
                self.generators.get_mut(id).map(|c| c as &mut dyn Constrainer)
            }
        }
    }
}

/// Output of one assembly pass.
#[derive(Debug, Clone, Default)]
pub struct ConstraintSystem {
    /// Bilateral constraint matrix transpose: rows are velocity DOFs, columns constraints.
    pub gt: SparseBlockMatrix,
    pub g_info: Vec<ConstraintInfo>,
    pub nt: SparseBlockMatrix,
    pub n_info: Vec<ConstraintInfo>,
    pub dt: SparseBlockMatrix,
    pub f_info: Vec<FrictionInfo>,
    /// Bilateral row range of each visited constrainer.
    pub bilateral_ranges: Vec<(ConstrainerHandle, Range<usize>)>,
    pub unilateral_ranges: Vec<(ConstrainerHandle, Range<usize>)>,
    /// The block structure differs from the previous assembly.
    pub structure_changed: bool,
}

impl ConstraintSystem {
    pub fn num_bilaterals(&self) -> usize {
        self.g_info.len()
    }

    pub fn num_unilaterals(&self) -> usize {
        self.n_info.len()
    }

    /// Block positions of `GT` and `NT`, used to detect structural change.
    pub fn signature(&self) -> (Vec<(usize, usize)>, Vec<usize>, Vec<(usize, usize)>, Vec<usize>) {
        let cols = |m: &SparseBlockMatrix| (0..m.num_block_cols()).map(|j| m.col_size(j)).collect();
        (self.gt.structure(), cols(&self.gt), self.nt.structure(), cols(&self.nt))
    }
}

/// Rows produced by one constrainer, before placement.
struct Contribution {
    handle: ConstrainerHandle,
    bilateral: Vec<BlockColumn>,
    g_info: Vec<ConstraintInfo>,
    unilateral: Vec<BlockColumn>,
    n_info: Vec<ConstraintInfo>,
    friction: Vec<BlockColumn>,
    f_info: Vec<FrictionInfo>,
}

fn check_columns(label: &str, sizes: &[usize], columns: &[BlockColumn], rows: usize) -> CoreResult<()> {
    let reported: usize = sizes.iter().sum();
    let produced: usize = columns.iter().map(BlockColumn::width).sum();
    let widths_match = sizes.len() == columns.len()
        && sizes.iter().zip(columns).all(|(s, c)| *s == c.width());
    if !widths_match || reported != produced {
        return Err(CoreError::RowAccounting {
            constrainer: label.to_string(),
            reported,
            produced,
        });
    }
    if rows != reported {
        return Err(CoreError::RowAccounting {
            constrainer: label.to_string(),
            reported,
            produced: rows,
        });
    }
    Ok(())
}

fn contribute(
    handle: ConstrainerHandle,
    constrainer: &dyn Constrainer,
    ctx: &AssemblyContext<'_>,
) -> CoreResult<Contribution> {
    let label = constrainer.label();

    let mut sizes = Vec::new();
    constrainer.bilateral_sizes(&mut sizes);
    let bilateral = constrainer.add_bilateral_constraints(ctx)?;
    let mut g_info = Vec::new();
    constrainer.bilateral_info(&mut g_info);
    check_columns(&label, &sizes, &bilateral, g_info.len())?;

    sizes.clear();
    constrainer.unilateral_sizes(&mut sizes);
    let unilateral = constrainer.add_unilateral_constraints(ctx)?;
    let mut n_info = Vec::new();
    constrainer.unilateral_info(&mut n_info);
    check_columns(&label, &sizes, &unilateral, n_info.len())?;

    Ok(Contribution {
        handle,
        bilateral,
        g_info,
        unilateral,
        n_info,
        friction: Vec::new(),
        f_info: Vec::new(),
    })
}

/// Visits every active constrainer in `order` and assembles the global system.
///
/// With `parallel`, each constrainer builds its columns independently; the
/// columns are then appended in constrainer order, so the result matches the
/// serial path exactly.
pub fn assemble(
    order: &[ConstrainerHandle],
    set: &ConstrainerSet<'_>,
    ctx: &AssemblyContext<'_>,
    block_sizes: &[usize],
    parallel: bool,
) -> CoreResult<ConstraintSystem> {
    let _timer = StageTimer::trace(Stage::RowAssembly);

    let active: Vec<(ConstrainerHandle, &dyn Constrainer)> = order
        .iter()
        .filter_map(|h| set.resolve(*h).map(|c| (*h, c)))
        .filter(|(_, c)| c.is_active(ctx))
        .collect();

    let contributions: Vec<CoreResult<Contribution>> = if parallel {
        contribute_all_parallel(&active, ctx)
    } else {
        active
            .iter()
            .map(|(h, c)| contribute(*h, *c, ctx))
            .collect()
    };

    let mut system = ConstraintSystem {
        gt: SparseBlockMatrix::new(block_sizes),
        nt: SparseBlockMatrix::new(block_sizes),
        dt: SparseBlockMatrix::new(block_sizes),
        ..ConstraintSystem::default()
    };

    let mut placed = Vec::with_capacity(contributions.len());
    for contribution in contributions {
        let contribution = contribution?;
        let start = system.g_info.len();
        for column in contribution.bilateral.iter().cloned() {
            system.gt.append_column(column);
        }
        system.g_info.extend_from_slice(&contribution.g_info);
        system
            .bilateral_ranges
            .push((contribution.handle, start..system.g_info.len()));

        let start = system.n_info.len();
        for column in contribution.unilateral.iter().cloned() {
            system.nt.append_column(column);
        }
        system.n_info.extend_from_slice(&contribution.n_info);
        system
            .unilateral_ranges
            .push((contribution.handle, start..system.n_info.len()));
        placed.push(contribution);
    }

    // friction rows reference global bilateral indices, so they follow placement
    for ((handle, range), contribution) in system.bilateral_ranges.clone().iter().zip(&mut placed) {
        let Some(constrainer) = set.resolve(*handle) else {
            continue;
        };
        if constrainer.max_friction_constraint_sets() == 0 {
            continue;
        }
        let (columns, infos) = constrainer.add_friction_constraints(ctx, range.start)?;
        contribution.friction = columns;
        contribution.f_info = infos;
    }
    for contribution in placed {
        for column in contribution.friction {
            system.dt.append_column(column);
        }
        system.f_info.extend(contribution.f_info);
    }

    log::trace!(
        "assembled {} bilateral, {} unilateral rows and {} friction sets",
        system.g_info.len(),
        system.n_info.len(),
        system.f_info.len()
    );
    Ok(system)
}

#[cfg(feature = "parallel")]
fn contribute_all_parallel(
    active: &[(ConstrainerHandle, &dyn Constrainer)],
    ctx: &AssemblyContext<'_>,
) -> Vec<CoreResult<Contribution>> {
    use rayon::prelude::*;

    active
        .par_iter()
        .map(|(h, c)| contribute(*h, *c, ctx))
        .collect()
}

#[cfg(not(feature = "parallel"))]
fn contribute_all_parallel(
    active: &[(ConstrainerHandle, &dyn Constrainer)],
    ctx: &AssemblyContext<'_>,
) -> Vec<CoreResult<Contribution>> {
    active
        .iter()
        .map(|(h, c)| contribute(*h, *c, ctx))
        .collect()
}

/// Writes solved multipliers back to each constrainer over its recorded row ranges.
pub fn write_back(
    system: &ConstraintSystem,
    set: &mut ConstrainerSetMut<'_>,
    bilateral: &[f64],
    unilateral: &[f64],
    scale: f64,
) -> CoreResult<()> {
    let _timer = StageTimer::trace(Stage::ForceWriteBack);
    check_multiplier_count("bilateral multipliers", system.num_bilaterals(), bilateral.len())?;
    check_multiplier_count("unilateral multipliers", system.num_unilaterals(), unilateral.len())?;
    for (handle, range) in &system.bilateral_ranges {
        if let Some(constrainer) = set.resolve_mut(*handle) {
            let end = constrainer.set_bilateral_forces(bilateral, scale, range.start);
            check_write_back(constrainer.label(), range, end)?;
        }
    }
    for (handle, range) in &system.unilateral_ranges {
        if let Some(constrainer) = set.resolve_mut(*handle) {
            let end = constrainer.set_unilateral_forces(unilateral, scale, range.start);
            check_write_back(constrainer.label(), range, end)?;
        }
    }
    Ok(())
}

fn check_multiplier_count(label: &str, expected: usize, given: usize) -> CoreResult<()> {
    if expected != given {
        return Err(CoreError::RowAccounting {
            constrainer: label.to_string(),
            reported: expected,
            produced: given,
        });
    }
    Ok(())
}

fn check_write_back(label: String, range: &Range<usize>, end: usize) -> CoreResult<()> {
    if end != range.end {
        return Err(CoreError::RowAccounting {
            constrainer: label,
            reported: range.len(),
            produced: end.saturating_sub(range.start),
        });
    }
    Ok(())
}
