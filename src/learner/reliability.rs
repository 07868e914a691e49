//! Per-challenge reliability scores and their correlation.
//!
//! Reliability is the stability of a response bit across repeated noisy
//! measurements. The measured score of a challenge row is the distance of
//! its +1 count from half the repetitions: 0 for an even split (maximally
//! unstable), R/2 for a unanimous row. A candidate model instead marks a
//! challenge reliable when the magnitude of its raw delay difference
//! clears an epsilon margin; the attack compares the two notions through
//! their Pearson correlation.
use ndarray::prelude::*;

/// Measured reliability per challenge: `|R/2 - count(+1)|` over each row
/// of an `(N, R)` matrix of ±1 responses.
///
/// Raw counts, no normalization; comparisons only make sense across
/// vectors measured with the same R.
pub fn measured_reliability(responses: &ArrayView2<f64>) -> Array1<f64> {
    let half = responses.ncols() as f64 / 2.;
    responses.map_axis(Axis(1), |row| {
        let ones = row.iter().filter(|&&r| r > 0.).count() as f64;
        (half - ones).abs()
    })
}

/// Modeled reliability per challenge: 1 where the raw delay difference
/// clears the epsilon margin, 0 otherwise.
pub fn modeled_reliability(delay_diffs: &ArrayView1<f64>, epsilon: f64)
                           -> Array1<f64> {
    delay_diffs.mapv(|d| if d.abs() > epsilon { 1. } else { 0. })
}

/// Pearson correlation coefficient of two equally long vectors.
///
/// When either vector is constant the coefficient is undefined (zero
/// variance); this returns -1.0 in that case, so a candidate whose
/// reliability vector is constant scores as badly as possible in the
/// correlation objective. Never returns NaN for finite inputs.
pub fn pearson(x: &ArrayView1<f64>, y: &ArrayView1<f64>) -> f64 {
    debug_assert_eq!(x.len(), y.len());
    let n = x.len() as f64;
    let mean_x = x.sum() / n;
    let mean_y = y.sum() / n;
    let centered_x = x.mapv(|v| v - mean_x);
    let centered_y = y.mapv(|v| v - mean_y);
    let var_x = centered_x.dot(&centered_x);
    let var_y = centered_y.dot(&centered_y);
    if var_x == 0. || var_y == 0. {
        return -1.;
    }
    centered_x.dot(&centered_y) / (var_x * var_y).sqrt()
}
