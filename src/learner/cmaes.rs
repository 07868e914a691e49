//! Covariance matrix adaptation evolution strategy (CMA-ES).
//!
//! A derivative-free optimizer over R^dim in the standard
//! (mu/mu_w, lambda) form of Hansen's comparing review: each generation
//! samples a population from a multivariate normal search distribution,
//! ranks it by the objective, and adapts the distribution's mean,
//! covariance and overall step size toward the better-ranked samples.
//!
//! The objective is evaluated on the whole population at once, as a pure
//! function from a `(lambda, dim)` candidate matrix to a `(lambda,)`
//! score vector; results do not depend on any iteration order.
//!
//! Termination follows a stagnation rule: the search stops when the
//! best-ever objective has not improved by more than `abort_delta` for
//! `limit_stag` consecutive generations, or when the `limit_iter`
//! generation ceiling is reached. Reaching the ceiling is not an error;
//! the best candidate found so far is returned regardless.
use ndarray::prelude::*;
use itertools::Itertools;
use ordered_float::OrderedFloat;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::learner::{GenerationRecord, Logger};

/// Population size and termination parameters of one search.
#[derive(Clone, Copy, Debug)]
pub struct SearchConfig {
    /// Population size lambda.
    pub pop_size: usize,
    /// Minimal improvement of the best objective that counts as progress.
    pub abort_delta: f64,
    /// Consecutive non-improving generations before stopping.
    pub limit_stag: usize,
    /// Hard ceiling on the number of generations.
    pub limit_iter: usize,
}

/// Best candidate found by a search, with diagnostics.
#[derive(Clone, Debug)]
pub struct SearchResult {
    /// Best-ever parameter vector.
    pub solution: Array1<f64>,
    /// Its objective value.
    pub objective: f64,
    /// Number of generations run.
    pub generations: usize,
}

/// One CMA-ES instance. Owns the full search distribution state; nothing
/// is shared between instances, so independent searches only need
/// independently seeded PRNG streams.
pub struct CmaEs {
    config: SearchConfig,
    dim: usize,
    // Selection weights for the mu = lambda/2 best samples.
    weights: Array1<f64>,
    mu_eff: f64,
    // Adaptation rates.
    c_sigma: f64,
    d_sigma: f64,
    c_c: f64,
    c_1: f64,
    c_mu: f64,
    // E||N(0,I)||, used by step size control.
    chi_n: f64,
    // Search distribution.
    mean: Array1<f64>,
    sigma: f64,
    cov: Array2<f64>,
    // Evolution paths.
    p_sigma: Array1<f64>,
    p_c: Array1<f64>,
}

impl CmaEs {
    /// Sets up a search distribution centered on `initial_mean` with an
    /// isotropic covariance and the given initial step size.
    ///
    /// Callers validate `config` beforehand; `pop_size` must be at
    /// least 4 so that mu = lambda/2 leaves a usable selection.
    pub fn new(initial_mean: Array1<f64>, step_size: f64,
               config: SearchConfig) -> CmaEs {
        let dim = initial_mean.len();
        let lambda = config.pop_size;
        debug_assert!(lambda >= 4);
        let mu = lambda / 2;

        let mut weights: Array1<f64> = (0..mu)
            .map(|i| ((lambda as f64 + 1.) / 2.).ln() - ((i + 1) as f64).ln())
            .collect();
        let total = weights.sum();
        weights /= total;
        let mu_eff = 1. / weights.mapv(|w| w * w).sum();

        let dim_f = dim as f64;
        let c_sigma = (mu_eff + 2.) / (dim_f + mu_eff + 5.);
        let d_sigma = 1. + c_sigma
            + 2. * (((mu_eff - 1.) / (dim_f + 1.)).sqrt() - 1.).max(0.);
        let c_c = (4. + mu_eff / dim_f) / (dim_f + 4. + 2. * mu_eff / dim_f);
        let c_1 = 2. / ((dim_f + 1.3).powi(2) + mu_eff);
        let c_mu = (1. - c_1).min(
            2. * (mu_eff - 2. + 1. / mu_eff) / ((dim_f + 2.).powi(2) + mu_eff));
        let chi_n = dim_f.sqrt()
            * (1. - 1. / (4. * dim_f) + 1. / (21. * dim_f * dim_f));

        CmaEs {
            config,
            dim,
            weights,
            mu_eff,
            c_sigma,
            d_sigma,
            c_c,
            c_1,
            c_mu,
            chi_n,
            mean: initial_mean,
            sigma: step_size,
            cov: Array2::eye(dim),
            p_sigma: Array1::zeros(dim),
            p_c: Array1::zeros(dim),
        }
    }

    /// Runs the search until stagnation or the generation ceiling.
    ///
    /// `objective` scores a whole population: `(lambda, dim)` candidates
    /// in, `(lambda,)` scores out, lower is better. `chain` is only
    /// recorded in progress records.
    pub fn run<F, R>(&mut self, mut objective: F, rng: &mut R, chain: usize,
                     logger: &mut Option<Logger<GenerationRecord>>)
                     -> SearchResult
    where F: FnMut(&ArrayView2<f64>) -> Array1<f64>,
          R: Rng {
        let lambda = self.config.pop_size;
        let mut best_x = self.mean.clone();
        let mut best_f = f64::INFINITY;
        // Best value at the last generation that counted as progress.
        let mut stagnation_ref = f64::INFINITY;
        let mut stagnation = 0;
        let mut generation = 0;

        while generation < self.config.limit_iter {
            let (eigvals, eigvecs) = symmetric_eigen(&self.cov.view());
            // Numerically tiny negative eigenvalues are clamped before
            // the square root.
            let scales = eigvals.mapv(|e| e.max(1e-20).sqrt());

            // Sample z ~ N(0, I); y = B (D z); x = m + sigma y.
            let zs: Array2<f64> =
                Array2::from_shape_simple_fn((lambda, self.dim),
                                             || rng.sample(StandardNormal));
            let ys = (&zs * &scales).dot(&eigvecs.t());
            let xs = &(&ys * self.sigma) + &self.mean;

            let fitness = objective(&xs.view());
            let order: Vec<usize> = (0..lambda)
                .sorted_by_key(|&i| OrderedFloat(fitness[i]))
                .collect();

            if fitness[order[0]] < best_f {
                best_f = fitness[order[0]];
                best_x = xs.row(order[0]).to_owned();
            }

            // Weighted recombination of the mu best samples.
            let mut y_w: Array1<f64> = Array1::zeros(self.dim);
            let mut z_w: Array1<f64> = Array1::zeros(self.dim);
            for (w, &i) in self.weights.iter().zip(order.iter()) {
                y_w = y_w + ys.row(i).mapv(|v| v * w);
                z_w = z_w + zs.row(i).mapv(|v| v * w);
            }
            self.mean = &self.mean + &y_w.mapv(|v| v * self.sigma);

            // Step size path, in the isotropic coordinate system.
            let decay = 1. - self.c_sigma;
            let norm_coef = (self.c_sigma * (2. - self.c_sigma)
                             * self.mu_eff).sqrt();
            self.p_sigma = self.p_sigma.mapv(|v| v * decay)
                + eigvecs.dot(&z_w).mapv(|v| v * norm_coef);
            let ps_norm = self.p_sigma.dot(&self.p_sigma).sqrt();
            let expected = (1. - decay.powi(2 * (generation as i32 + 1)))
                .sqrt() * self.chi_n;
            let h_sigma = ps_norm
                < (1.4 + 2. / (self.dim as f64 + 1.)) * expected;

            // Covariance path.
            let cc_decay = 1. - self.c_c;
            let cc_coef = (self.c_c * (2. - self.c_c) * self.mu_eff).sqrt();
            self.p_c = self.p_c.mapv(|v| v * cc_decay)
                + y_w.mapv(|v| v * if h_sigma { cc_coef } else { 0. });

            // Rank-one and rank-mu covariance update.
            let pc_col = self.p_c.clone().insert_axis(Axis(1));
            let rank_one = pc_col.dot(&pc_col.t());
            let mut rank_mu: Array2<f64> = Array2::zeros((self.dim, self.dim));
            for (w, &i) in self.weights.iter().zip(order.iter()) {
                let y = ys.row(i).to_owned().insert_axis(Axis(1));
                rank_mu = rank_mu + y.dot(&y.t()).mapv(|v| v * w);
            }
            let stall = if h_sigma { 0. } else {
                self.c_c * (2. - self.c_c)
            };
            let keep = 1. - self.c_1 - self.c_mu + self.c_1 * stall;
            let (c_1, c_mu) = (self.c_1, self.c_mu);
            self.cov = self.cov.mapv(|v| v * keep)
                + rank_one.mapv(|v| v * c_1)
                + rank_mu.mapv(|v| v * c_mu);
            // Keep the covariance exactly symmetric.
            self.cov = (&self.cov + &self.cov.t()) / 2.;

            self.sigma *= ((self.c_sigma / self.d_sigma)
                           * (ps_norm / self.chi_n - 1.)).exp();

            generation += 1;
            if let Some(logger) = logger {
                logger.log(GenerationRecord {
                    chain,
                    generation,
                    best_objective: best_f,
                    step_size: self.sigma,
                });
            }

            // Stagnation rule.
            if stagnation_ref - best_f > self.config.abort_delta {
                stagnation_ref = best_f;
                stagnation = 0;
            } else {
                stagnation += 1;
                if stagnation >= self.config.limit_stag {
                    break;
                }
            }
        }

        SearchResult {
            solution: best_x,
            objective: best_f,
            generations: generation,
        }
    }
}

/// Eigendecomposition of a symmetric matrix by cyclic Jacobi rotations.
///
/// Returns (eigenvalues, eigenvectors-as-columns). Intended for the small
/// covariance matrices of this crate (tens of dimensions); no attempt is
/// made to scale further.
pub fn symmetric_eigen(matrix: &ArrayView2<f64>) -> (Array1<f64>, Array2<f64>) {
    let n = matrix.nrows();
    debug_assert_eq!(n, matrix.ncols());
    let mut a = matrix.to_owned();
    let mut v = Array2::eye(n);

    for _sweep in 0..100 {
        let mut off = 0.;
        for p in 0..n {
            for q in (p + 1)..n {
                off += a[[p, q]] * a[[p, q]];
            }
        }
        if off.sqrt() < 1e-12 {
            break;
        }
        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[[p, q]];
                if apq == 0. {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2. * apq);
                let sign = if theta >= 0. { 1. } else { -1. };
                let t = sign / (theta.abs() + (theta * theta + 1.).sqrt());
                let c = 1. / (t * t + 1.).sqrt();
                let s = t * c;
                for i in 0..n {
                    let aip = a[[i, p]];
                    let aiq = a[[i, q]];
                    a[[i, p]] = c * aip - s * aiq;
                    a[[i, q]] = s * aip + c * aiq;
                }
                for i in 0..n {
                    let api = a[[p, i]];
                    let aqi = a[[q, i]];
                    a[[p, i]] = c * api - s * aqi;
                    a[[q, i]] = s * api + c * aqi;
                }
                for i in 0..n {
                    let vip = v[[i, p]];
                    let viq = v[[i, q]];
                    v[[i, p]] = c * vip - s * viq;
                    v[[i, q]] = s * vip + c * viq;
                }
            }
        }
    }
    (a.diag().to_owned(), v)
}


#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn sphere(xs: &ArrayView2<f64>) -> Array1<f64> {
        xs.map_axis(Axis(1), |x| x.dot(&x))
    }

    fn config(pop_size: usize, limit_stag: usize, limit_iter: usize)
              -> SearchConfig {
        SearchConfig {
            pop_size,
            abort_delta: 1e-10,
            limit_stag,
            limit_iter,
        }
    }

    #[test]
    fn jacobi_recovers_known_spectrum() {
        let a = array![[2., 1.], [1., 2.]];
        let (vals, vecs) = symmetric_eigen(&a.view());
        let mut sorted = vals.to_vec();
        sorted.sort_by(|x, y| x.partial_cmp(y).unwrap());
        assert!(approx_eq!(f64, sorted[0], 1., epsilon = 1e-9));
        assert!(approx_eq!(f64, sorted[1], 3., epsilon = 1e-9));
        // V diag(vals) V^T reconstructs the input.
        let reconstructed = vecs.dot(&Array2::from_diag(&vals))
                                .dot(&vecs.t());
        for (x, y) in reconstructed.iter().zip(a.iter()) {
            assert!(approx_eq!(f64, *x, *y, epsilon = 1e-9));
        }
    }

    #[test]
    fn minimizes_sphere_function() {
        let mut rng = ChaCha8Rng::seed_from_u64(0x11);
        let mut es = CmaEs::new(Array1::from_elem(5, 5.), 1.,
                                config(16, 50, 500));
        let result = es.run(sphere, &mut rng, 0, &mut None);
        assert!(result.objective < 1e-3,
                "objective {} after {} generations",
                result.objective, result.generations);
        for x in result.solution.iter() {
            assert!(x.abs() < 0.1);
        }
    }

    #[test]
    fn minimizes_shifted_sphere() {
        let mut rng = ChaCha8Rng::seed_from_u64(0x12);
        let target = array![1., -2., 0.5, 3.];
        let shifted = |xs: &ArrayView2<f64>| -> Array1<f64> {
            xs.map_axis(Axis(1), |x| {
                x.iter()
                 .zip(target.iter())
                 .map(|(a, b)| (a - b).powi(2))
                 .sum()
            })
        };
        let mut es = CmaEs::new(Array1::zeros(4), 1., config(16, 50, 500));
        let result = es.run(shifted, &mut rng, 0, &mut None);
        for (x, t) in result.solution.iter().zip(target.iter()) {
            assert!((x - t).abs() < 0.1,
                    "solution {:?}", result.solution);
        }
    }

    #[test]
    fn stagnates_on_constant_objective() {
        let mut rng = ChaCha8Rng::seed_from_u64(0x13);
        let flat = |xs: &ArrayView2<f64>| Array1::ones(xs.nrows());
        let mut es = CmaEs::new(Array1::zeros(6), 1., config(8, 10, 500));
        let result = es.run(flat, &mut rng, 0, &mut None);
        // The first generation improves on +inf; after that the best
        // value never moves, so the run ends after limit_stag more.
        assert!(result.generations <= 12);
        assert_eq!(result.objective, 1.);
    }

    #[test]
    fn generation_records_are_logged() {
        let mut rng = ChaCha8Rng::seed_from_u64(0x14);
        let mut logger = Some(Logger::LogVec(Vec::new()));
        let mut es = CmaEs::new(Array1::zeros(3), 1., config(8, 5, 20));
        let result = es.run(sphere, &mut rng, 7, &mut logger);
        if let Some(Logger::LogVec(records)) = logger {
            assert_eq!(records.len(), result.generations);
            assert!(records.iter().all(|r| r.chain == 7));
            assert_eq!(records.last().unwrap().generation,
                       result.generations);
        } else {
            unreachable!();
        }
    }
}
