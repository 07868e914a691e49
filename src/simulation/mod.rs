//! Simulation of Arbiter PUFs as arrays of linear threshold functions
//! (LTFs).
//!
//! A PUF instance is a `k x n` weight matrix: `k` parallel delay chains of
//! `n` stages each. A challenge is a vector of `n` bits in {-1,+1}; it is
//! first mapped through an input transformation (per chain), each chain
//! then computes the inner product of its weights with the transformed
//! challenge, and a combiner merges the `k` raw chain values into one
//! value whose sign is the response bit.
//!
//! Transformations and combiners are injected as plain function pointers,
//! from the small closed set defined here (`transform_id`,
//! `transform_atf`, `combiner_xor`), so that a learned model can be built
//! with exactly the structure of the target instance.
use ndarray::prelude::*;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use crate::AttackError;

/// Maps a challenge matrix `(N, n)` to per-chain feature vectors
/// `(N, k, n)`.
pub type Transform = fn(&ArrayView2<f64>, usize) -> Array3<f64>;

/// Merges raw per-chain values `(N, k)` into one combined value per
/// challenge.
pub type Combiner = fn(&ArrayView2<f64>) -> Array1<f64>;

/// Identity transformation: every chain sees the challenge unchanged.
pub fn transform_id(challenges: &ArrayView2<f64>, k: usize) -> Array3<f64> {
    let (num, n) = challenges.dim();
    let mut out = Array3::zeros((num, k, n));
    for mut chain in out.axis_iter_mut(Axis(1)) {
        chain.assign(challenges);
    }
    out
}

/// Arbiter ("ATF") transformation: feature i is the product of challenge
/// bits i..n, the standard linearization of an arbiter chain's delay
/// difference. All chains see the same feature vector.
pub fn transform_atf(challenges: &ArrayView2<f64>, k: usize) -> Array3<f64> {
    let (num, n) = challenges.dim();
    let mut features = Array2::<f64>::zeros((num, n));
    for (row, mut feat) in challenges.outer_iter()
                                     .zip(features.outer_iter_mut()) {
        let mut acc = 1.;
        for i in (0..n).rev() {
            acc *= row[i];
            feat[i] = acc;
        }
    }
    transform_id(&features.view(), k)
}

/// XOR combiner. On ±1 encodings XOR is multiplication, so the combined
/// value is the row product; its sign is the XOR of the chain signs.
pub fn combiner_xor(outputs: &ArrayView2<f64>) -> Array1<f64> {
    outputs.map_axis(Axis(1), |row| row.product())
}

/// Sign with the convention that 0 maps to +1.
fn signum(v: f64) -> f64 {
    if v >= 0. { 1. } else { -1. }
}

/// A noise-free LTF array: `k` weight vectors of length `n`, an input
/// transformation and a combiner.
///
/// This is both the simulated PUF and the shape of a learned model; it
/// owns its weight matrix.
#[derive(Clone)]
pub struct LtfArray {
    weight_array: Array2<f64>,
    transform: Transform,
    combiner: Combiner,
}

impl LtfArray {
    pub fn new(weight_array: Array2<f64>, transform: Transform,
               combiner: Combiner) -> LtfArray {
        LtfArray {
            weight_array,
            transform,
            combiner,
        }
    }

    /// Number of parallel chains.
    pub fn k(&self) -> usize {
        self.weight_array.nrows()
    }

    /// Number of stages per chain.
    pub fn n(&self) -> usize {
        self.weight_array.ncols()
    }

    pub fn weight_array(&self) -> ArrayView2<f64> {
        self.weight_array.view()
    }

    /// Raw per-chain values `(N, k)` before combining.
    fn ltf_eval(&self, challenges: &ArrayView2<f64>) -> Array2<f64> {
        let k = self.k();
        let transformed = (self.transform)(challenges, k);
        let mut out = Array2::zeros((challenges.nrows(), k));
        for c in 0..k {
            let features = transformed.index_axis(Axis(1), c);
            out.column_mut(c)
               .assign(&features.dot(&self.weight_array.row(c)));
        }
        out
    }

    /// Combined raw value per challenge (the "delay difference" whose
    /// sign is the response).
    pub fn val(&self, challenges: &ArrayView2<f64>) -> Array1<f64> {
        (self.combiner)(&self.ltf_eval(challenges).view())
    }

    /// Response bits in {-1,+1} per challenge.
    pub fn eval(&self, challenges: &ArrayView2<f64>) -> Array1<f64> {
        self.val(challenges).mapv(signum)
    }
}

/// An LTF array whose chain values are perturbed by fresh Gaussian noise
/// on every evaluation, modeling measurement instability.
pub struct NoisyLtfArray {
    ltf: LtfArray,
    sigma_noise: f64,
    rng: ChaCha8Rng,
}

impl NoisyLtfArray {
    pub fn new(weight_array: Array2<f64>, transform: Transform,
               combiner: Combiner, sigma_noise: f64, seed: u64)
               -> NoisyLtfArray {
        NoisyLtfArray {
            ltf: LtfArray::new(weight_array, transform, combiner),
            sigma_noise,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Standard deviation of the chain noise that makes an instance with
    /// N(0, sigma_weight^2) stage weights flip a `noisiness` fraction of
    /// its marginal responses.
    pub fn sigma_noise_from_random_weights(n: usize, sigma_weight: f64,
                                           noisiness: f64) -> f64 {
        (n as f64).sqrt() * sigma_weight * noisiness
    }

    /// The underlying noise-free instance.
    pub fn noise_free(&self) -> &LtfArray {
        &self.ltf
    }

    /// One noisy measurement of every challenge. Repeated calls with the
    /// same challenges give independently perturbed responses.
    pub fn eval(&mut self, challenges: &ArrayView2<f64>) -> Array1<f64> {
        let mut raw = self.ltf.ltf_eval(challenges);
        let noise = Normal::new(0., self.sigma_noise)
            .expect("sigma_noise must be finite and non-negative");
        raw.mapv_inplace(|v| v + noise.sample(&mut self.rng));
        (self.ltf.combiner)(&raw.view()).mapv(signum)
    }
}

/// Draws a `(k, n)` weight matrix with N(0, sigma_weight^2) entries.
pub fn random_weights<R: Rng>(k: usize, n: usize, sigma_weight: f64,
                              rng: &mut R) -> Array2<f64> {
    let normal = Normal::new(0., sigma_weight)
        .expect("sigma_weight must be finite and non-negative");
    Array2::from_shape_simple_fn((k, n), || normal.sample(rng))
}

/// Draws `num` uniform challenges of `n` bits in {-1,+1}.
pub fn sample_challenges<R: Rng>(num: usize, n: usize, rng: &mut R)
                                 -> Array2<f64> {
    Array2::from_shape_simple_fn((num, n), || {
        if rng.gen_bool(0.5) { 1. } else { -1. }
    })
}

/// Fraction of challenges on which two instances disagree, estimated on
/// `num` fresh random challenges.
pub fn approx_dist<R: Rng>(a: &LtfArray, b: &LtfArray, num: usize,
                           rng: &mut R) -> f64 {
    let challenges = sample_challenges(num, a.n(), rng);
    let res_a = a.eval(&challenges.view());
    let res_b = b.eval(&challenges.view());
    res_a.iter()
         .zip(res_b.iter())
         .filter(|(x, y)| x != y)
         .count() as f64 / num as f64
}

/// Per-challenge majority vote over repeated measurements.
///
/// Ties (possible when the number of repetitions is even) resolve to +1,
/// the same convention `LtfArray::eval` uses for a zero delay difference.
pub fn majority_responses(responses: &ArrayView2<f64>) -> Array1<f64> {
    responses.map_axis(Axis(1), |row| signum(row.sum()))
}

/// A repeated-measurement training set: `N` challenges, each measured
/// `R` times.
///
/// Both matrices are read-only for the whole learning run; every chain
/// search shares them without copying.
pub struct TrainingSet {
    pub challenges: Array2<f64>,
    pub responses: Array2<f64>,
}

impl TrainingSet {
    /// Builds a training set, failing fast if the matrices disagree on
    /// the number of challenges.
    pub fn new(challenges: Array2<f64>, responses: Array2<f64>)
               -> Result<TrainingSet, AttackError> {
        if challenges.nrows() != responses.nrows() {
            return Err(AttackError::InputShapeMismatch {
                challenges: challenges.nrows(),
                responses: responses.nrows(),
            });
        }
        Ok(TrainingSet {
            challenges,
            responses,
        })
    }

    /// Samples `num` random challenges and measures each `reps` times on
    /// a noisy instance.
    pub fn sample<R: Rng>(instance: &mut NoisyLtfArray, num: usize,
                          reps: usize, rng: &mut R) -> TrainingSet {
        let challenges = sample_challenges(num, instance.noise_free().n(),
                                           rng);
        let mut responses = Array2::zeros((num, reps));
        for r in 0..reps {
            responses.column_mut(r)
                     .assign(&instance.eval(&challenges.view()));
        }
        TrainingSet {
            challenges,
            responses,
        }
    }

    /// Number of challenges.
    pub fn num(&self) -> usize {
        self.challenges.nrows()
    }

    /// Number of repeated measurements per challenge.
    pub fn reps(&self) -> usize {
        self.responses.ncols()
    }
}
