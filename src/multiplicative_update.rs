//! Multiplicative Update
//!
//! Lee-Seung style updates: each factor is rescaled elementwise by a numerator over a denominator,
//! so a non-negative factor stays non-negative as long as both terms are non-negative.
//!
//! Denominators are floored at `epsilon`; numerators are never touched. A zero denominator therefore
//! yields `value * numerator / epsilon` rather than NaN or infinity.
//!

use super::matrix::*;
use ndarray::{Axis, Zip};
use serde::{Deserialize, Serialize};

/// the objective the serial solver minimizes; the parallel solver always uses [`UpdateRule::Frobenius`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateRule {
    /// ‖A − W·H‖_F²
    Frobenius,
    /// generalized Kullback-Leibler divergence D(A ‖ W·H)
    KullbackLeibler,
}

impl Default for UpdateRule {
    fn default() -> Self {
        Self::Frobenius
    }
}

/// `W ← W ⊙ P_H / max(W·G_H, eps)` with G_H = H·Hᵗ (k x k) and P_H = A·Hᵗ (rows of W x k)
pub fn update_w(w: &mut Matrix, gram_h: &Matrix, numerator: &Matrix, epsilon: f64) {
    debug_assert_eq!(w.dim(), numerator.dim());
    let denominator = w.dot(gram_h);
    Zip::from(w)
        .and(numerator)
        .and(&denominator)
        .for_each(|value, &p, &d| *value *= p / d.max(epsilon));
}

/// `H ← H ⊙ P_W / max(G_W·H, eps)` with G_W = Wᵗ·W (k x k) and P_W = Wᵗ·A (k x columns of H)
pub fn update_h(h: &mut Matrix, gram_w: &Matrix, numerator: &Matrix, epsilon: f64) {
    debug_assert_eq!(h.dim(), numerator.dim());
    let denominator = gram_w.dot(h);
    Zip::from(h)
        .and(numerator)
        .and(&denominator)
        .for_each(|value, &p, &d| *value *= p / d.max(epsilon));
}

/// A / max(W·H, eps), elementwise
fn floored_quotient(a: &Matrix, w: &Matrix, h: &Matrix, epsilon: f64) -> Matrix {
    let mut quotient = w.dot(h);
    Zip::from(&mut quotient)
        .and(a)
        .for_each(|value, &a| *value = a / value.max(epsilon));
    quotient
}

/// `H ← H ⊙ (Wᵗ·(A / max(W·H, eps))) / max(Wᵗ·1, eps)`
pub fn update_h_kullback_leibler(a: &Matrix, w: &Matrix, h: &mut Matrix, epsilon: f64) {
    let numerator = w.t().dot(&floored_quotient(a, w, h, epsilon));
    // (Wᵗ·1)[r][c] is the sum of column r of W, whatever c is
    let column_sums = w.sum_axis(Axis(0));
    Zip::indexed(h)
        .and(&numerator)
        .for_each(|(r, _), value, &p| *value *= p / column_sums[r].max(epsilon));
}

/// `W ← W ⊙ ((A / max(W·H, eps))·Hᵗ) / max(1·Hᵗ, eps)`
pub fn update_w_kullback_leibler(a: &Matrix, w: &mut Matrix, h: &Matrix, epsilon: f64) {
    let numerator = floored_quotient(a, w, h, epsilon).dot(&h.t());
    // (1·Hᵗ)[i][r] is the sum of row r of H
    let row_sums = h.sum_axis(Axis(1));
    Zip::indexed(w)
        .and(&numerator)
        .for_each(|(_, r), value, &p| *value *= p / row_sums[r].max(epsilon));
}

/// D(A ‖ W·H) = Σ a·ln(a / wh) − a + wh, with 0·ln(0) = 0 and wh floored at `epsilon` where a > 0
pub fn kullback_leibler_divergence(a: &Matrix, w: &Matrix, h: &Matrix, epsilon: f64) -> f64 {
    let approximation = w.dot(h);
    a.iter()
        .zip(approximation.iter())
        .map(|(&a, &wh)| {
            if a > 0. {
                let wh = wh.max(epsilon);
                a * (a / wh).ln() - a + wh
            } else {
                wh
            }
        })
        .sum()
}

/// one full iteration on complete factors: update W, then H with the new W
pub fn update_both(rule: UpdateRule, a: &Matrix, w: &mut Matrix, h: &mut Matrix, epsilon: f64) {
    match rule {
        UpdateRule::Frobenius => {
            let gram_h = h.dot(&h.t());
            let numerator = a.dot(&h.t());
            update_w(w, &gram_h, &numerator, epsilon);
            let gram_w = w.t().dot(&*w);
            let numerator = w.t().dot(a);
            update_h(h, &gram_w, &numerator, epsilon);
        }
        UpdateRule::KullbackLeibler => {
            update_w_kullback_leibler(a, w, h, epsilon);
            update_h_kullback_leibler(a, w, h, epsilon);
        }
    }
}
