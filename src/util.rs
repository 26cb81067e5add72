use super::error::*;
use crate::rand_xoshiro;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::prelude::*;
use std::time::Instant;

/// index of a worker in the process grid, in `[0, node_num)`
pub type NodeIndex = usize;
/// the number of collectives a worker has completed; tags every message it sends
pub type Round = usize;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct IndexRange {
    pub range: [usize; 2],
}

// just to distinguish them in code, essentially nothing different
pub type RowRange = IndexRange;
pub type ColumnRange = IndexRange;

impl IndexRange {
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(end >= start, "invalid range [{}, {})", start, end);
        Self { range: [start, end] }
    }
    pub fn new_length(start: usize, length: usize) -> Self {
        Self::new(start, start + length)
    }
    pub fn is_empty(&self) -> bool {
        self.range[1] == self.range[0]
    }
    pub fn len(&self) -> usize {
        self.range[1] - self.range[0]
    }
    pub fn start(&self) -> usize {
        self.range[0]
    }
    pub fn end(&self) -> usize {
        self.range[1]
    }
    pub fn contains(&self, index: usize) -> bool {
        index >= self.start() && index < self.end()
    }
    pub fn iter(&self) -> std::ops::Range<usize> {
        self.range[0]..self.range[1]
    }
}

/// immutable `rows` x `cols` arrangement of workers; worker `id` sits at row `id / cols`, column `id % cols`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProcessGrid {
    /// p_r: number of grid rows
    pub rows: usize,
    /// p_c: number of grid columns
    pub cols: usize,
}

impl ProcessGrid {
    pub fn new(rows: usize, cols: usize) -> Result<Self, NmfError> {
        if rows == 0 || cols == 0 {
            return Err(NmfError::InvalidConfig(format!("process grid {rows}x{cols} has no worker")));
        }
        Ok(Self { rows, cols })
    }

    pub fn node_num(&self) -> usize {
        self.rows * self.cols
    }

    pub fn row_of(&self, node: NodeIndex) -> usize {
        node / self.cols
    }

    pub fn col_of(&self, node: NodeIndex) -> usize {
        node % self.cols
    }

    pub fn node_at(&self, row: usize, col: usize) -> NodeIndex {
        debug_assert!(row < self.rows && col < self.cols);
        row * self.cols + col
    }

    /// workers sharing the grid row of `node`, in ascending grid column
    pub fn row_partners(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let row = self.row_of(node);
        (0..self.cols).map(|col| self.node_at(row, col)).collect()
    }

    /// workers sharing the grid column of `node`, in ascending grid row
    pub fn column_partners(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let col = self.col_of(node);
        (0..self.rows).map(|row| self.node_at(row, col)).collect()
    }

    pub fn all_nodes(&self) -> Vec<NodeIndex> {
        (0..self.node_num()).collect()
    }
}

/// the factorization problem A (m x n) ≈ W (m x k) · H (k x n)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProblemShape {
    pub m: usize,
    pub n: usize,
    /// factorization rank
    pub k: usize,
}

impl ProblemShape {
    pub fn new(m: usize, n: usize, k: usize) -> Self {
        Self { m, n, k }
    }

    /// every block of every role must have an integral size on this grid
    pub fn sanity_check(&self, grid: &ProcessGrid) -> Result<(), NmfError> {
        let node_num = grid.node_num();
        if self.k == 0 {
            return Err(NmfError::InvalidConfig("factorization rank k must be at least 1".to_string()));
        }
        if self.m == 0 || self.m % node_num != 0 {
            return Err(NmfError::InvalidConfig(format!(
                "m = {} is not a positive multiple of the worker count {}",
                self.m, node_num
            )));
        }
        if self.n == 0 || self.n % node_num != 0 {
            return Err(NmfError::InvalidConfig(format!(
                "n = {} is not a positive multiple of the worker count {}",
                self.n, node_num
            )));
        }
        Ok(())
    }
}

/// which part of A, W and H each worker owns; the W and H layout matches the slices handed out by reduce-scatter
#[derive(Debug, Clone, Copy)]
pub struct BlockLayout {
    pub shape: ProblemShape,
    pub grid: ProcessGrid,
}

impl BlockLayout {
    pub fn new(shape: ProblemShape, grid: ProcessGrid) -> Result<Self, NmfError> {
        shape.sanity_check(&grid)?;
        Ok(Self { shape, grid })
    }

    /// m / p_r
    pub fn a_block_rows(&self) -> usize {
        self.shape.m / self.grid.rows
    }

    /// n / p_c
    pub fn a_block_cols(&self) -> usize {
        self.shape.n / self.grid.cols
    }

    /// m / p
    pub fn w_block_rows(&self) -> usize {
        self.shape.m / self.grid.node_num()
    }

    /// n / p
    pub fn h_block_cols(&self) -> usize {
        self.shape.n / self.grid.node_num()
    }

    pub fn a_rows(&self, node: NodeIndex) -> RowRange {
        RowRange::new_length(self.grid.row_of(node) * self.a_block_rows(), self.a_block_rows())
    }

    pub fn a_cols(&self, node: NodeIndex) -> ColumnRange {
        ColumnRange::new_length(self.grid.col_of(node) * self.a_block_cols(), self.a_block_cols())
    }

    /// slice `col` of row block `row`, which is simply the `node`-th slice of height m / p
    pub fn w_rows(&self, node: NodeIndex) -> RowRange {
        RowRange::new_length(node * self.w_block_rows(), self.w_block_rows())
    }

    /// slice `row` of column block `col`
    pub fn h_cols(&self, node: NodeIndex) -> ColumnRange {
        let slot = self.grid.col_of(node) * self.grid.rows + self.grid.row_of(node);
        ColumnRange::new_length(slot * self.h_block_cols(), self.h_block_cols())
    }
}

/// use Xoshiro256StarStar for deterministic random number generator
pub type DeterministicRng = rand_xoshiro::Xoshiro256StarStar;

/// record the solving time of multiple runs
pub struct BenchmarkProfiler {
    /// each record corresponds to a different run
    pub records: Vec<BenchmarkProfilerEntry>,
    /// summation of all solving time
    pub sum_round_time: f64,
    /// summation of the final residual of each run
    pub sum_residual: f64,
    /// iterations per run
    pub max_iter: usize,
    /// the file to output the profiler results
    pub benchmark_profiler_output: Option<File>,
}

impl BenchmarkProfiler {
    pub fn new(max_iter: usize, detail_log_file: Option<(String, &ProblemShape, &ProcessGrid)>) -> std::io::Result<Self> {
        let benchmark_profiler_output = match detail_log_file {
            Some((filename, shape, grid)) => {
                let mut file = File::create(filename)?;
                let header = json!({
                    "shape": shape,
                    "grid": grid,
                    "max_iter": max_iter,
                });
                file.write_all(header.to_string().as_bytes())?;
                file.write_all(b"\n")?;
                Some(file)
            }
            None => None,
        };
        Ok(Self {
            records: vec![],
            sum_round_time: 0.,
            sum_residual: 0.,
            max_iter,
            benchmark_profiler_output,
        })
    }
    /// record the beginning of a solving procedure
    pub fn begin(&mut self, seed: u64) {
        // sanity check last entry, if exists, is complete
        if let Some(last_entry) = self.records.last() {
            assert!(
                last_entry.is_complete(),
                "the last benchmark profiler entry is not complete, make sure to call `begin` and `end` in pairs"
            );
        }
        let mut entry = BenchmarkProfilerEntry::new(seed);
        entry.record_begin();
        self.records.push(entry);
    }
    /// record the ending of a solving procedure
    pub fn end(&mut self, residual: f64) -> std::io::Result<()> {
        let last_entry = self
            .records
            .last_mut()
            .expect("last entry not exists, call `begin` before `end`");
        last_entry.record_end(residual);
        let round_time = last_entry.round_time.unwrap_or_default();
        self.sum_round_time += round_time;
        self.sum_residual += residual;
        if let Some(file) = self.benchmark_profiler_output.as_mut() {
            let value = json!({
                "seed": last_entry.seed,
                "round_time": round_time,
                "residual": residual,
            });
            file.write_all(value.to_string().as_bytes())?;
            file.write_all(b"\n")?;
        }
        Ok(())
    }
    /// print out a brief one-line statistics
    pub fn brief(&self) -> String {
        let runs = self.records.len() as f64;
        let total = self.sum_round_time / runs;
        let per_iteration = total / (self.max_iter.max(1) as f64);
        let residual = self.sum_residual / runs;
        format!("total: {total:.3e}, iteration: {per_iteration:.3e}, residual: {residual:.3e},")
    }
}

pub struct BenchmarkProfilerEntry {
    /// the random seed of this run
    pub seed: u64,
    /// the time of beginning a solving procedure
    begin_time: Option<Instant>,
    /// interval between calling [`Self::record_begin`] to calling [`Self::record_end`]
    pub round_time: Option<f64>,
    /// ‖A − W·H‖ of the final factors
    pub residual: Option<f64>,
}

impl BenchmarkProfilerEntry {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            begin_time: None,
            round_time: None,
            residual: None,
        }
    }
    /// record the beginning of a solving procedure
    pub fn record_begin(&mut self) {
        assert_eq!(self.begin_time, None, "do not call `record_begin` twice on the same entry");
        self.begin_time = Some(Instant::now());
    }
    /// record the ending of a solving procedure
    pub fn record_end(&mut self, residual: f64) {
        let begin_time = self
            .begin_time
            .as_ref()
            .expect("make sure to call `record_begin` before calling `record_end`");
        self.round_time = Some(begin_time.elapsed().as_secs_f64());
        self.residual = Some(residual);
    }
    pub fn is_complete(&self) -> bool {
        self.round_time.is_some()
    }
}
