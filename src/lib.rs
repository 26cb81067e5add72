extern crate derivative;
extern crate parking_lot;
extern crate rand_xoshiro;
extern crate rayon;
extern crate serde;
#[macro_use]
extern crate serde_json;

pub mod collective;
pub mod error;
pub mod mailbox;
pub mod matrix;
pub mod multiplicative_update;
pub mod nmf_parallel;
pub mod nmf_serial;
pub mod util;

use error::NmfError;
use matrix::Matrix;
use nmf_serial::NmfResult;
use util::*;

/// factorize `a` ≈ W·H with rank `k` on a `grid_rows` x `grid_cols` grid of workers, using the default configuration
/// (to run repeatedly on the same problem, consider reusing a [`nmf_parallel::NmfParallel`] object)
pub fn grid_nmf(a: Matrix, k: usize, grid_rows: usize, grid_cols: usize) -> Result<NmfResult, NmfError> {
    let (m, n) = a.dim();
    let grid = ProcessGrid::new(grid_rows, grid_cols)?;
    let shape = ProblemShape::new(m, n, k);
    let config = nmf_parallel::NmfParallelConfig::default();
    nmf_parallel::NmfParallel::new(a, shape, grid, config)?.solve_seeded()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_nmf_default_run() {
        // cargo test grid_nmf_default_run -- --nocapture
        let result = grid_nmf(matrix::ramp_matrix(8, 8), 2, 2, 2).unwrap();
        assert_eq!(result.w.dim(), (8, 2));
        assert_eq!(result.h.dim(), (2, 8));
        assert_eq!(result.residuals.len(), 1);
        assert!(grid_nmf(matrix::ramp_matrix(8, 6), 2, 2, 2).is_err());
    }
}
