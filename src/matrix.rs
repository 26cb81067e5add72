//! Dense Matrix
//!
//! The factorization only needs a handful of dense operations; they all come from [`ndarray`].
//! This module adds the block-level helpers shared by the serial and parallel solvers.
//!

use super::error::*;
use super::util::*;
use ndarray::{concatenate, s, Array2, ArrayView2, Axis};
use rand::Rng;
use rand_distr::StandardNormal;

pub type Matrix = Array2<f64>;

/// fail fast if a block does not have the shape its role requires
pub fn ensure_shape(
    op: &'static str,
    round: Round,
    peer: Option<NodeIndex>,
    block: &Matrix,
    expected: (usize, usize),
) -> Result<(), NmfError> {
    let found = block.dim();
    if found != expected {
        return Err(NmfError::DimensionMismatch {
            op,
            round,
            peer,
            expected,
            found,
        });
    }
    Ok(())
}

/// every entry is |x| with x ~ N(0, 1), so the multiplicative updates start from a non-negative point
pub fn random_non_negative<R: Rng>(rows: usize, cols: usize, rng: &mut R) -> Matrix {
    Matrix::from_shape_simple_fn((rows, cols), || {
        let value: f64 = rng.sample(StandardNormal);
        value.abs()
    })
}

/// owned copy of rows `range` of `matrix`
pub fn row_block(matrix: &Matrix, range: RowRange) -> Matrix {
    matrix.slice(s![range.start()..range.end(), ..]).to_owned()
}

/// owned copy of columns `range` of `matrix`
pub fn column_block(matrix: &Matrix, range: ColumnRange) -> Matrix {
    matrix.slice(s![.., range.start()..range.end()]).to_owned()
}

/// owned copy of the sub-block `rows` x `cols` of `matrix`
pub fn sub_block(matrix: &Matrix, rows: RowRange, cols: ColumnRange) -> Matrix {
    matrix
        .slice(s![rows.start()..rows.end(), cols.start()..cols.end()])
        .to_owned()
}

/// stack blocks on top of each other, in slice order; all blocks must have the same column count
pub fn concatenate_rows(op: &'static str, round: Round, blocks: &[Matrix]) -> Result<Matrix, NmfError> {
    concatenate_along(op, round, Axis(0), blocks)
}

/// place blocks side by side, in slice order; all blocks must have the same row count
pub fn concatenate_columns(op: &'static str, round: Round, blocks: &[Matrix]) -> Result<Matrix, NmfError> {
    concatenate_along(op, round, Axis(1), blocks)
}

fn concatenate_along(op: &'static str, round: Round, axis: Axis, blocks: &[Matrix]) -> Result<Matrix, NmfError> {
    let first = blocks
        .first()
        .ok_or_else(|| NmfError::InvalidInput(format!("{op}: nothing to concatenate")))?;
    // the kept axis must agree, otherwise ndarray would only report a bare shape error;
    // blocks are indexed by slot here, so no peer is named
    let kept = 1 - axis.index();
    for block in blocks.iter() {
        if block.len_of(Axis(kept)) != first.len_of(Axis(kept)) {
            return Err(NmfError::DimensionMismatch {
                op,
                round,
                peer: None,
                expected: first.dim(),
                found: block.dim(),
            });
        }
    }
    let views: Vec<ArrayView2<f64>> = blocks.iter().map(|block| block.view()).collect();
    concatenate(axis, &views).map_err(|err| NmfError::InvalidInput(format!("{op}: {err}")))
}

/// ‖A − W·H‖_F
pub fn frobenius_residual(a: &Matrix, w: &Matrix, h: &Matrix) -> f64 {
    squared_residual(a, w, h).sqrt()
}

/// ‖A − W·H‖_F², the additive form used when partial sums come from different workers
pub fn squared_residual(a: &Matrix, w: &Matrix, h: &Matrix) -> f64 {
    let approximation = w.dot(h);
    a.iter().zip(approximation.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

pub fn is_non_negative(matrix: &Matrix) -> bool {
    matrix.iter().all(|&value| value >= 0.)
}

pub fn is_finite(matrix: &Matrix) -> bool {
    matrix.iter().all(|value| value.is_finite())
}

/// nested rows, the layout used by the JSON files of the command line
pub fn to_rows(matrix: &Matrix) -> Vec<Vec<f64>> {
    matrix.rows().into_iter().map(|row| row.to_vec()).collect()
}

pub fn from_rows(rows: &[Vec<f64>]) -> Result<Matrix, NmfError> {
    let cols = rows.first().map(Vec::len).unwrap_or(0);
    if let Some((index, row)) = rows.iter().enumerate().find(|(_, row)| row.len() != cols) {
        return Err(NmfError::InvalidInput(format!(
            "row {index} has {} entries while row 0 has {cols}",
            row.len()
        )));
    }
    let data: Vec<f64> = rows.iter().flatten().copied().collect();
    Matrix::from_shape_vec((rows.len(), cols), data).map_err(|err| NmfError::InvalidInput(err.to_string()))
}

/// the default input when none is given: A[i][j] = i·n + j
pub fn ramp_matrix(m: usize, n: usize) -> Matrix {
    Matrix::from_shape_fn((m, n), |(i, j)| (i * n + j) as f64)
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::rand_xoshiro::rand_core::SeedableRng;

    #[test]
    fn matrix_random_non_negative() {
        // cargo test matrix_random_non_negative -- --nocapture
        let mut rng = DeterministicRng::seed_from_u64(7);
        let matrix = random_non_negative(30, 20, &mut rng);
        assert_eq!(matrix.dim(), (30, 20));
        assert!(is_non_negative(&matrix));
        assert!(matrix.iter().any(|&value| value > 1.), "folded normal should exceed 1 sometimes");
    }

    #[test]
    fn matrix_concatenate_in_order() {
        // cargo test matrix_concatenate_in_order -- --nocapture
        let a = ramp_matrix(6, 4);
        let top = row_block(&a, RowRange::new(0, 2));
        let middle = row_block(&a, RowRange::new(2, 5));
        let bottom = row_block(&a, RowRange::new(5, 6));
        assert_eq!(concatenate_rows("test", 0, &[top, middle, bottom]).unwrap(), a);
        let left = column_block(&a, ColumnRange::new(0, 1));
        let right = column_block(&a, ColumnRange::new(1, 4));
        assert_eq!(concatenate_columns("test", 0, &[left, right]).unwrap(), a);
        // seams: first column of the right block is column 1 of A
        assert_eq!(a[[3, 1]], 13.);
    }

    #[test]
    fn matrix_concatenate_rejects_ragged() {
        // cargo test matrix_concatenate_rejects_ragged -- --nocapture
        let blocks = vec![Matrix::zeros((2, 3)), Matrix::zeros((2, 4))];
        match concatenate_rows("gather", 4, &blocks) {
            Err(NmfError::DimensionMismatch { op, round, peer, expected, found }) => {
                assert_eq!((op, round, peer), ("gather", 4, None));
                assert_eq!((expected, found), ((2, 3), (2, 4)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn matrix_rows_conversion() {
        // cargo test matrix_rows_conversion -- --nocapture
        let a = ramp_matrix(3, 2);
        let rows = to_rows(&a);
        assert_eq!(rows, vec![vec![0., 1.], vec![2., 3.], vec![4., 5.]]);
        assert_eq!(from_rows(&rows).unwrap(), a);
        assert!(from_rows(&[vec![1., 2.], vec![3.]]).is_err());
    }

    #[test]
    fn matrix_ensure_shape() {
        // cargo test matrix_ensure_shape -- --nocapture
        let block = Matrix::zeros((3, 5));
        assert!(ensure_shape("all_reduce", 0, Some(1), &block, (3, 5)).is_ok());
        let err = ensure_shape("all_reduce", 2, Some(1), &block, (5, 5)).unwrap_err();
        assert!(err.to_string().contains("all_reduce"), "{err}");
    }

    #[test]
    fn matrix_residual_of_exact_factorization() {
        // cargo test matrix_residual_of_exact_factorization -- --nocapture
        let w = ramp_matrix(4, 2);
        let h = ramp_matrix(2, 3);
        let a = w.dot(&h);
        assert_eq!(frobenius_residual(&a, &w, &h), 0.);
        let shifted = &a + 1.;
        assert!((frobenius_residual(&shifted, &w, &h) - (12f64).sqrt()).abs() < 1e-12);
    }
}
