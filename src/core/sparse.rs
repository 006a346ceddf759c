//! Sparse block matrices for the constraint system hand-off.
//!
//! Block rows follow entity solve indices (sized by velocity state), block
//! columns are appended one per constraint group. Blocks are stored in a
//! `BTreeMap` keyed by `(block_row, block_col)` so iteration order is stable.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{CooMatrix, CscMatrix};

/// Blocks contributed to a single block column, before it is placed in a matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockColumn {
    width: usize,
    blocks: BTreeMap<usize, DMatrix<f64>>,
}

impl BlockColumn {
    pub fn new(width: usize) -> Self {
        Self {
            width,
            blocks: BTreeMap::new(),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Accumulates `values` into column `col` of the block at `block_row`.
    pub fn add_entry(&mut self, block_row: usize, col: usize, values: &DVector<f64>) {
        let width = self.width;
        let block = self
            .blocks
            .entry(block_row)
            .or_insert_with(|| DMatrix::zeros(values.len(), width));
        let mut column = block.column_mut(col);
        column += values;
    }

    /// Accumulates a full `rows x width` block.
    pub fn add_block(&mut self, block_row: usize, block: &DMatrix<f64>) {
        debug_assert_eq!(block.ncols(), self.width);
        match self.blocks.get_mut(&block_row) {
            Some(existing) => *existing += block,
            None => {
                self.blocks.insert(block_row, block.clone());
            }
        }
    }

    pub fn blocks(&self) -> impl Iterator<Item = (usize, &DMatrix<f64>)> + '_ {
        self.blocks.iter().map(|(row, block)| (*row, block))
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseBlockMatrix {
    row_sizes: Vec<usize>,
    row_offsets: Vec<usize>,
    col_sizes: Vec<usize>,
    col_offsets: Vec<usize>,
    blocks: BTreeMap<(usize, usize), DMatrix<f64>>,
}

impl SparseBlockMatrix {
    /// Creates a matrix with fixed block rows and no columns.
    pub fn new(row_sizes: &[usize]) -> Self {
        let mut row_offsets = Vec::with_capacity(row_sizes.len());
        let mut offset = 0;
        for size in row_sizes {
            row_offsets.push(offset);
            offset += size;
        }
        Self {
            row_sizes: row_sizes.to_vec(),
            row_offsets,
            col_sizes: Vec::new(),
            col_offsets: Vec::new(),
            blocks: BTreeMap::new(),
        }
    }

    pub fn num_block_rows(&self) -> usize {
        self.row_sizes.len()
    }

    pub fn num_block_cols(&self) -> usize {
        self.col_sizes.len()
    }

    pub fn rows(&self) -> usize {
        self.row_sizes.iter().sum()
    }

    pub fn cols(&self) -> usize {
        self.col_sizes.iter().sum()
    }

    pub fn row_offset(&self, block_row: usize) -> usize {
        self.row_offsets[block_row]
    }

    pub fn col_offset(&self, block_col: usize) -> usize {
        self.col_offsets[block_col]
    }

    pub fn col_size(&self, block_col: usize) -> usize {
        self.col_sizes[block_col]
    }

    /// Appends an empty block column of the given width and returns its index.
    pub fn add_block_column(&mut self, width: usize) -> usize {
        self.col_offsets.push(self.cols());
        self.col_sizes.push(width);
        self.col_sizes.len() - 1
    }

    /// Appends a prepared column. Blocks outside the block rows are dropped.
    pub fn append_column(&mut self, column: BlockColumn) -> usize {
        let bj = self.add_block_column(column.width);
        for (bi, block) in column.blocks {
            if bi < self.row_sizes.len() {
                debug_assert_eq!(block.nrows(), self.row_sizes[bi]);
                self.add_block(bi, bj, block);
            }
        }
        bj
    }

    pub fn add_block(&mut self, bi: usize, bj: usize, block: DMatrix<f64>) {
        match self.blocks.get_mut(&(bi, bj)) {
            Some(existing) => *existing += block,
            None => {
                self.blocks.insert((bi, bj), block);
            }
        }
    }

    pub fn block(&self, bi: usize, bj: usize) -> Option<&DMatrix<f64>> {
        self.blocks.get(&(bi, bj))
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Block positions in row-major order; two matrices with equal structure
    /// can reuse a symbolic factorization.
    pub fn structure(&self) -> Vec<(usize, usize)> {
        self.blocks.keys().copied().collect()
    }

    /// Computes `self * x`.
    pub fn mul(&self, x: &DVector<f64>) -> DVector<f64> {
        let mut y = DVector::zeros(self.rows());
        for (&(bi, bj), block) in &self.blocks {
            let xr = x.rows(self.col_offsets[bj], block.ncols());
            let mut yr = y.rows_mut(self.row_offsets[bi], block.nrows());
            yr += block * xr;
        }
        y
    }

    /// Computes `self^T * x`.
    pub fn mul_transpose(&self, x: &DVector<f64>) -> DVector<f64> {
        let mut y = DVector::zeros(self.cols());
        for (&(bi, bj), block) in &self.blocks {
            let xr = x.rows(self.row_offsets[bi], block.nrows());
            let mut yr = y.rows_mut(self.col_offsets[bj], block.ncols());
            yr += block.transpose() * xr;
        }
        y
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut m = DMatrix::zeros(self.rows(), self.cols());
        for (&(bi, bj), block) in &self.blocks {
            let mut view = m.view_mut(
                (self.row_offsets[bi], self.col_offsets[bj]),
                (block.nrows(), block.ncols()),
            );
            view += block;
        }
        m
    }

    /// Compressed sparse column export, omitting exact zeros.
    pub fn to_csc(&self) -> CscMatrix<f64> {
        let mut coo = CooMatrix::new(self.rows(), self.cols());
        for (&(bi, bj), block) in &self.blocks {
            let r0 = self.row_offsets[bi];
            let c0 = self.col_offsets[bj];
            for c in 0..block.ncols() {
                for r in 0..block.nrows() {
                    let value = block[(r, c)];
                    if value != 0.0 {
                        coo.push(r0 + r, c0 + c, value);
                    }
                }
            }
        }
        CscMatrix::from(&coo)
    }
}
