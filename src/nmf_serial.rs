//! Serial NMF
//!
//! Single-threaded reference solver working on the complete matrices. It draws its initial factors
//! the same way the parallel coordinator does, so the two can be compared iteration by iteration.
//!

use super::error::*;
use super::matrix::*;
use super::multiplicative_update::*;
use super::util::*;
use crate::rand_xoshiro::rand_core::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NmfSerialConfig {
    /// number of full iterations, each updating W and then H
    #[serde(default = "nmf_serial_default_configs::max_iter")]
    pub max_iter: usize,
    /// seed of the initial factors
    #[serde(default = "nmf_serial_default_configs::seed")]
    pub seed: u64,
    /// floor of every denominator in the update rules
    #[serde(default = "nmf_serial_default_configs::epsilon")]
    pub epsilon: f64,
    #[serde(default = "nmf_serial_default_configs::update_rule")]
    pub update_rule: UpdateRule,
    /// record ‖A − W·H‖_F after every iteration instead of only at the end
    #[serde(default = "nmf_serial_default_configs::residual_trace")]
    pub residual_trace: bool,
}

pub mod nmf_serial_default_configs {
    use super::UpdateRule;
    pub fn max_iter() -> usize {
        100
    }
    pub fn seed() -> u64 {
        0
    }
    pub fn epsilon() -> f64 {
        1e-16
    }
    pub fn update_rule() -> UpdateRule {
        UpdateRule::Frobenius
    }
    pub fn residual_trace() -> bool {
        false
    }
}

impl Default for NmfSerialConfig {
    fn default() -> Self {
        serde_json::from_value(json!({})).unwrap()
    }
}

/// the factors of a finished run
#[derive(Debug, Clone)]
pub struct NmfResult {
    pub w: Matrix,
    pub h: Matrix,
    /// ‖A − W·H‖_F after each iteration when tracing, otherwise only the final one
    pub residuals: Vec<f64>,
}

impl NmfResult {
    pub fn final_residual(&self) -> Option<f64> {
        self.residuals.last().copied()
    }
}

/// draw W₀ (m x k) then H₀ (k x n) from one deterministic stream
pub fn initial_factors(shape: &ProblemShape, seed: u64) -> (Matrix, Matrix) {
    let mut rng = DeterministicRng::seed_from_u64(seed);
    let w = random_non_negative(shape.m, shape.k, &mut rng);
    let h = random_non_negative(shape.k, shape.n, &mut rng);
    (w, h)
}

/// reject inputs the multiplicative updates cannot handle
pub fn check_input_matrix(a: &Matrix) -> Result<(), NmfError> {
    if a.is_empty() {
        return Err(NmfError::InvalidInput("the input matrix is empty".to_string()));
    }
    if !is_finite(a) {
        return Err(NmfError::InvalidInput("the input matrix has a non-finite entry".to_string()));
    }
    if !is_non_negative(a) {
        return Err(NmfError::InvalidInput("the input matrix has a negative entry".to_string()));
    }
    Ok(())
}

pub fn check_epsilon(epsilon: f64) -> Result<(), NmfError> {
    if !(epsilon > 0. && epsilon.is_finite()) {
        return Err(NmfError::InvalidConfig(format!("epsilon must be positive and finite, got {epsilon}")));
    }
    Ok(())
}

pub struct NmfSerial {
    a: Matrix,
    shape: ProblemShape,
    pub config: NmfSerialConfig,
}

impl NmfSerial {
    pub fn new(a: Matrix, k: usize, config: NmfSerialConfig) -> Result<Self, NmfError> {
        check_input_matrix(&a)?;
        check_epsilon(config.epsilon)?;
        if k == 0 {
            return Err(NmfError::InvalidConfig("factorization rank k must be at least 1".to_string()));
        }
        let (m, n) = a.dim();
        Ok(Self {
            a,
            shape: ProblemShape::new(m, n, k),
            config,
        })
    }

    pub fn shape(&self) -> &ProblemShape {
        &self.shape
    }

    pub fn a(&self) -> &Matrix {
        &self.a
    }

    /// run from the factors drawn with the configured seed
    pub fn solve_seeded(&self) -> Result<NmfResult, NmfError> {
        let (w0, h0) = initial_factors(&self.shape, self.config.seed);
        self.solve(w0, h0)
    }

    pub fn solve(&self, w0: Matrix, h0: Matrix) -> Result<NmfResult, NmfError> {
        let ProblemShape { m, n, k } = self.shape;
        ensure_shape("solve", 0, None, &w0, (m, k))?;
        ensure_shape("solve", 0, None, &h0, (k, n))?;
        if !is_non_negative(&w0) || !is_non_negative(&h0) {
            return Err(NmfError::InvalidInput("initial factors must be non-negative".to_string()));
        }
        info!(m, n, k, max_iter = self.config.max_iter, rule = ?self.config.update_rule, "serial solve");
        let (mut w, mut h) = (w0, h0);
        let mut residuals = Vec::with_capacity(if self.config.residual_trace { self.config.max_iter } else { 1 });
        for iteration in 0..self.config.max_iter {
            update_both(self.config.update_rule, &self.a, &mut w, &mut h, self.config.epsilon);
            if self.config.residual_trace {
                let residual = frobenius_residual(&self.a, &w, &h);
                debug!(iteration, residual, "serial iteration");
                residuals.push(residual);
            }
        }
        if !self.config.residual_trace {
            residuals.push(frobenius_residual(&self.a, &w, &h));
        }
        info!(residual = residuals.last().copied().unwrap_or_default(), "serial solve done");
        Ok(NmfResult { w, h, residuals })
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    fn traced_config(max_iter: usize) -> NmfSerialConfig {
        serde_json::from_value(json!({
            "max_iter": max_iter,
            "residual_trace": true,
        }))
        .unwrap()
    }

    #[test]
    fn nmf_serial_reduces_residual() {
        // cargo test nmf_serial_reduces_residual -- --nocapture
        let solver = NmfSerial::new(ramp_matrix(18, 12), 5, traced_config(100)).unwrap();
        let result = solver.solve_seeded().unwrap();
        assert_eq!(result.residuals.len(), 100);
        assert!(result.residuals[99] < result.residuals[0]);
        assert!(is_non_negative(&result.w) && is_non_negative(&result.h));
        assert_eq!(result.w.dim(), (18, 5));
        assert_eq!(result.h.dim(), (5, 12));
        // the ramp is rank 2, so rank 5 should approximate it well
        let norm = ramp_matrix(18, 12).iter().map(|x| x * x).sum::<f64>().sqrt();
        assert!(result.final_residual().unwrap() < 0.1 * norm);
    }

    #[test]
    fn nmf_serial_kullback_leibler() {
        // cargo test nmf_serial_kullback_leibler -- --nocapture
        let a = ramp_matrix(3, 4);
        let mut config = traced_config(100);
        config.update_rule = UpdateRule::KullbackLeibler;
        let solver = NmfSerial::new(a.clone(), 2, config).unwrap();
        let (w0, h0) = initial_factors(solver.shape(), 0);
        let before = kullback_leibler_divergence(&a, &w0, &h0, 1e-16);
        let result = solver.solve(w0, h0).unwrap();
        assert!(kullback_leibler_divergence(&a, &result.w, &result.h, 1e-16) < before);
        assert!(is_non_negative(&result.w) && is_non_negative(&result.h));
    }

    #[test]
    fn nmf_serial_deterministic() {
        // cargo test nmf_serial_deterministic -- --nocapture
        let solver = NmfSerial::new(ramp_matrix(8, 6), 3, NmfSerialConfig::default()).unwrap();
        let first = solver.solve_seeded().unwrap();
        let second = solver.solve_seeded().unwrap();
        assert_eq!(first.w, second.w);
        assert_eq!(first.h, second.h);
        assert_eq!(first.residuals.len(), 1);
    }

    #[test]
    fn nmf_serial_rejects_bad_input() {
        // cargo test nmf_serial_rejects_bad_input -- --nocapture
        let mut a = ramp_matrix(4, 4);
        a[[1, 2]] = -1.;
        assert!(matches!(
            NmfSerial::new(a, 2, NmfSerialConfig::default()),
            Err(NmfError::InvalidInput(_))
        ));
        assert!(matches!(
            NmfSerial::new(ramp_matrix(4, 4), 0, NmfSerialConfig::default()),
            Err(NmfError::InvalidConfig(_))
        ));
        let solver = NmfSerial::new(ramp_matrix(4, 4), 2, NmfSerialConfig::default()).unwrap();
        assert!(matches!(
            solver.solve(Matrix::ones((4, 3)), Matrix::ones((2, 4))),
            Err(NmfError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn nmf_serial_config_rejects_unknown_fields() {
        // cargo test nmf_serial_config_rejects_unknown_fields -- --nocapture
        let config: Result<NmfSerialConfig, _> = serde_json::from_value(json!({ "max_iteration": 3 }));
        assert!(config.is_err());
        let config = NmfSerialConfig::default();
        assert_eq!(config.max_iter, 100);
        assert_eq!(config.epsilon, 1e-16);
        assert_eq!(config.update_rule, UpdateRule::Frobenius);
    }
}
