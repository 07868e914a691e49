//! The reliability-based modeling attack.
//!
//! `ReliabilityAttack` learns one chain at a time: each attempt runs a
//! fresh CMA-ES search whose objective is the Pearson correlation between
//! the candidate's modeled reliability and the measured reliability of
//! the training set, on that chain's slice of the transformed challenges.
//! Learned chains too correlated with an already accepted one are
//! discarded and the attempt is retried, up to a configurable ceiling
//! (the unbounded retry loop of the original algorithm is deliberately
//! not reproduced). Once k chains are assembled, the combined model's
//! output polarity is checked against a majority vote of the repeated
//! measurements and, if needed, corrected by negating the first chain.
use ndarray::prelude::*;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::AttackError;
use crate::learner::{GenerationRecord, Logger};
use crate::learner::cmaes::{CmaEs, SearchConfig};
use crate::learner::reliability::{measured_reliability, modeled_reliability,
                                  pearson};
use crate::simulation::{majority_responses, Combiner, LtfArray, TrainingSet,
                        Transform};

/// Attack parameters. `AttackConfig::new` fills in the defaults; all
/// values are validated once, in `ReliabilityAttack::new`.
#[derive(Clone, Copy)]
pub struct AttackConfig {
    /// Number of parallel chains of the target.
    pub k: usize,
    pub transform: Transform,
    pub combiner: Combiner,
    /// CMA-ES population size.
    pub pop_size: usize,
    /// Minimal objective improvement that counts as progress.
    pub abort_delta: f64,
    /// Consecutive non-improving generations before a search stops.
    pub limit_stag: usize,
    /// Generation ceiling per search.
    pub limit_iter: usize,
    /// Candidates whose |correlation| with a pooled chain exceeds this
    /// are discarded as duplicates.
    pub dup_threshold: f64,
    /// Initial value of the reliability margin parameter.
    pub epsilon_init: f64,
    /// Ceiling on total search attempts across all chains.
    pub max_attempts: usize,
    /// Top-level PRNG seed; attempt i uses stream i of this seed.
    pub seed: u64,
}

impl AttackConfig {
    pub fn new(k: usize, transform: Transform, combiner: Combiner)
               -> AttackConfig {
        AttackConfig {
            k,
            transform,
            combiner,
            pop_size: 24,
            abort_delta: 0.01,
            limit_stag: 100,
            limit_iter: 1000,
            dup_threshold: 0.5,
            epsilon_init: 2.,
            max_attempts: 10 * k,
            seed: 0,
        }
    }
}

/// Diagnostics collected while learning. Not correctness-critical.
#[derive(Clone, Debug, Default)]
pub struct AttackMetadata {
    /// For each target chain index, the pool indexes of the chains that
    /// caused a candidate to be discarded.
    pub discard_count: Vec<Vec<usize>>,
    /// For each target chain index, the generation counts of its search
    /// attempts.
    pub iteration_count: Vec<Vec<usize>>,
    /// Final objective value of each accepted chain.
    pub final_objectives: Vec<f64>,
    /// Total number of search attempts.
    pub attempts: usize,
}

impl AttackMetadata {
    fn new(k: usize) -> AttackMetadata {
        AttackMetadata {
            discard_count: vec![Vec::new(); k],
            iteration_count: vec![Vec::new(); k],
            final_objectives: Vec::with_capacity(k),
            attempts: 0,
        }
    }
}

/// One attack run against a fixed training set.
///
/// The measured reliabilities and the transformed challenge tensor are
/// computed once, here, and shared read-only by every chain search.
pub struct ReliabilityAttack<'a> {
    training_set: &'a TrainingSet,
    config: AttackConfig,
    puf_reliability: Array1<f64>,
    // Transformed challenges, shape (N, k, n).
    linearized: Array3<f64>,
}

impl<'a> ReliabilityAttack<'a> {
    /// Validates the configuration and precomputes the shared state.
    pub fn new(training_set: &'a TrainingSet, config: AttackConfig)
               -> Result<ReliabilityAttack<'a>, AttackError> {
        if config.k == 0 {
            return Err(AttackError::InvalidConfig(
                "k must be at least 1".into()));
        }
        if config.pop_size < 4 {
            return Err(AttackError::InvalidConfig(
                "pop_size must be at least 4".into()));
        }
        if config.limit_iter == 0 {
            return Err(AttackError::InvalidConfig(
                "limit_iter must be at least 1".into()));
        }
        if !(config.dup_threshold > 0. && config.dup_threshold <= 1.) {
            return Err(AttackError::InvalidConfig(
                "dup_threshold must be in (0, 1]".into()));
        }
        if config.max_attempts < config.k {
            return Err(AttackError::InvalidConfig(
                "max_attempts must be at least k".into()));
        }
        if !(config.abort_delta >= 0.) {
            return Err(AttackError::InvalidConfig(
                "abort_delta must be non-negative and finite".into()));
        }

        let puf_reliability =
            measured_reliability(&training_set.responses.view());
        let linearized = (config.transform)(&training_set.challenges.view(),
                                            config.k);
        Ok(ReliabilityAttack {
            training_set,
            config,
            puf_reliability,
            linearized,
        })
    }

    /// Learns a model of the target and returns it with diagnostics.
    ///
    /// Fails with `PoolAssemblyExhausted` if `max_attempts` searches did
    /// not yield k sufficiently uncorrelated chains.
    pub fn learn(&self, logger: &mut Option<Logger<GenerationRecord>>)
                 -> Result<(LtfArray, AttackMetadata), AttackError> {
        let k = self.config.k;
        let n = self.training_set.challenges.ncols();
        let mut pool: Vec<Array1<f64>> = Vec::with_capacity(k);
        let mut meta = AttackMetadata::new(k);

        if let Some(logger) = logger {
            logger.log_header();
        }

        let mut attempt = 0;
        while pool.len() < k {
            if attempt >= self.config.max_attempts {
                return Err(AttackError::PoolAssemblyExhausted {
                    k,
                    assembled: pool.len(),
                    attempts: attempt,
                });
            }
            let chain = pool.len();
            // Every attempt owns an independent, reproducible stream.
            let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
            rng.set_stream(attempt as u64);
            attempt += 1;

            let result = self.search_chain(chain, n, &mut rng, logger);
            meta.iteration_count[chain].push(result.generations);

            let w = canonicalize_sign(
                result.solution.slice(s![..n]).to_owned());
            match find_duplicate(&pool, &w.view(),
                                 self.config.dup_threshold) {
                Some(i) => meta.discard_count[chain].push(i),
                None => {
                    meta.final_objectives.push(result.objective);
                    pool.push(w);
                }
            }
        }
        meta.attempts = attempt;

        let majority =
            majority_responses(&self.training_set.responses.view());
        let model = polarize_chains(pool,
                                    &self.training_set.challenges.view(),
                                    &majority.view(),
                                    self.config.transform,
                                    self.config.combiner);
        Ok((model, meta))
    }

    /// One CMA-ES search for the given chain index.
    fn search_chain<R: Rng>(&self, chain: usize, n: usize, rng: &mut R,
                            logger: &mut Option<Logger<GenerationRecord>>)
                            -> crate::learner::cmaes::SearchResult {
        // This chain's slice of the transformed challenges, (N, n).
        let challenges = self.linearized.index_axis(Axis(1), chain)
                                        .to_owned();
        let measured = &self.puf_reliability;

        // Initial mean: weights ~ N(0,1), trailing epsilon parameter.
        let mut init = Array1::zeros(n + 1);
        for i in 0..n {
            init[i] = rng.sample(StandardNormal);
        }
        init[n] = self.config.epsilon_init;

        let objective = |candidates: &ArrayView2<f64>| -> Array1<f64> {
            let weights = candidates.slice(s![.., ..n]);
            let delay_diffs = weights.dot(&challenges.t());
            let mut scores = Array1::zeros(candidates.nrows());
            for (i, diffs) in delay_diffs.outer_iter().enumerate() {
                let epsilon = candidates[[i, n]];
                let rels = modeled_reliability(&diffs, epsilon);
                scores[i] =
                    (1. - pearson(&rels.view(), &measured.view())).abs();
            }
            scores
        };

        let search = SearchConfig {
            pop_size: self.config.pop_size,
            abort_delta: self.config.abort_delta,
            limit_stag: self.config.limit_stag,
            limit_iter: self.config.limit_iter,
        };
        CmaEs::new(init, 1., search).run(objective, rng, chain, logger)
    }
}

/// Negates the whole vector if its first component is negative. Sign
/// convention only; reliability is invariant under chain negation.
fn canonicalize_sign(mut w: Array1<f64>) -> Array1<f64> {
    if w[0] < 0. {
        w.mapv_inplace(|v| -v);
    }
    w
}

/// Index of the first pool member whose |correlation| with the candidate
/// exceeds the threshold, if any.
fn find_duplicate(pool: &[Array1<f64>], candidate: &ArrayView1<f64>,
                  threshold: f64) -> Option<usize> {
    pool.iter()
        .position(|v| pearson(candidate, &v.view()).abs() > threshold)
}

/// Builds the combined model from the pool and fixes its output polarity
/// against the majority-vote ground truth.
///
/// If mean agreement is below 0.5, the first chain alone is negated
/// (which flips the overall output under an XOR combiner without touching
/// the pool's reliability structure) and the model is rebuilt. The
/// correction is applied at most once; a model still below 0.5 afterwards
/// is returned as is.
pub fn polarize_chains(mut pool: Vec<Array1<f64>>,
                       challenges: &ArrayView2<f64>,
                       majority: &ArrayView1<f64>,
                       transform: Transform, combiner: Combiner)
                       -> LtfArray {
    let model = build_model(&pool, transform, combiner);
    if agreement(&model, challenges, majority) < 0.5 {
        pool[0].mapv_inplace(|v| -v);
        return build_model(&pool, transform, combiner);
    }
    model
}

/// Mean agreement of a model's responses with reference responses.
pub fn agreement(model: &LtfArray, challenges: &ArrayView2<f64>,
                 reference: &ArrayView1<f64>) -> f64 {
    let responses = model.eval(challenges);
    responses.iter()
             .zip(reference.iter())
             .filter(|(a, b)| a == b)
             .count() as f64 / reference.len() as f64
}

fn build_model(pool: &[Array1<f64>], transform: Transform,
               combiner: Combiner) -> LtfArray {
    let k = pool.len();
    let n = pool[0].len();
    let mut weight_array = Array2::zeros((k, n));
    for (mut row, w) in weight_array.outer_iter_mut().zip(pool.iter()) {
        row.assign(w);
    }
    LtfArray::new(weight_array, transform, combiner)
}


#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use crate::simulation::{approx_dist, combiner_xor, random_weights,
                            sample_challenges, transform_id, NoisyLtfArray};

    fn becker_weights() -> Array1<f64> {
        array![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8,
               -0.1, -0.2, -0.3, -0.4, -0.5, -0.6, -0.7, -0.8]
    }

    #[test]
    fn canonicalization_flips_negative_leading_sign() {
        let w = array![-0.5, 1., -2.];
        assert_eq!(canonicalize_sign(w), array![0.5, -1., 2.]);
        let w = array![0.5, 1., -2.];
        assert_eq!(canonicalize_sign(w), array![0.5, 1., -2.]);
    }

    #[test]
    fn identical_chain_is_rejected_as_duplicate() {
        let pool = vec![becker_weights()];
        let candidate = becker_weights();
        assert_eq!(find_duplicate(&pool, &candidate.view(), 0.5), Some(0));
    }

    #[test]
    fn uncorrelated_chain_is_accepted() {
        let pool = vec![becker_weights()];
        let candidate = array![0.8, 0.8, 0.8, 0.8, 0.5, 0.5, 0.5, 0.5,
                               1.4, 1.4, 1.4, 1.4, -0.7, -0.7, -0.7, -0.33];
        assert_eq!(find_duplicate(&pool, &candidate.view(), 0.5), None);
    }

    #[test]
    fn polarity_flip_inverts_agreement_exactly() {
        let mut rng = ChaCha8Rng::seed_from_u64(0x21);
        let weights = random_weights(2, 8, 1., &mut rng);
        let challenges = sample_challenges(10, 8, &mut rng);
        let pool: Vec<Array1<f64>> = weights.outer_iter()
                                            .map(|r| r.to_owned())
                                            .collect();
        let model = build_model(&pool, transform_id, combiner_xor);
        let responses = model.eval(&challenges.view());

        // Reference disagreeing on 7 of 10 challenges: agreement 0.3.
        let mut reference = responses.clone();
        for i in 0..7 {
            reference[i] = -reference[i];
        }
        assert_eq!(agreement(&model, &challenges.view(),
                             &reference.view()), 0.3);

        let polarized = polarize_chains(pool, &challenges.view(),
                                        &reference.view(), transform_id,
                                        combiner_xor);
        // Negating the first chain flips every XOR output, so agreement
        // becomes exactly 1 - 0.3.
        assert_eq!(agreement(&polarized, &challenges.view(),
                             &reference.view()), 0.7);
    }

    #[test]
    fn polarity_left_alone_when_agreement_is_good() {
        let mut rng = ChaCha8Rng::seed_from_u64(0x22);
        let weights = random_weights(2, 8, 1., &mut rng);
        let challenges = sample_challenges(16, 8, &mut rng);
        let pool: Vec<Array1<f64>> = weights.outer_iter()
                                            .map(|r| r.to_owned())
                                            .collect();
        let model = build_model(&pool, transform_id, combiner_xor);
        let responses = model.eval(&challenges.view());
        let polarized = polarize_chains(pool, &challenges.view(),
                                        &responses.view(), transform_id,
                                        combiner_xor);
        assert_eq!(agreement(&polarized, &challenges.view(),
                             &responses.view()), 1.);
    }

    #[test]
    fn config_validation_is_synchronous() {
        let challenges = Array2::ones((8, 4));
        let responses = Array2::ones((8, 3));
        let training_set = TrainingSet::new(challenges, responses).unwrap();

        let mut config = AttackConfig::new(2, transform_id, combiner_xor);
        config.pop_size = 2;
        assert!(matches!(ReliabilityAttack::new(&training_set, config),
                         Err(AttackError::InvalidConfig(_))));

        let mut config = AttackConfig::new(2, transform_id, combiner_xor);
        config.max_attempts = 1;
        assert!(matches!(ReliabilityAttack::new(&training_set, config),
                         Err(AttackError::InvalidConfig(_))));

        let mut config = AttackConfig::new(2, transform_id, combiner_xor);
        config.dup_threshold = 0.;
        assert!(matches!(ReliabilityAttack::new(&training_set, config),
                         Err(AttackError::InvalidConfig(_))));
    }

    #[test]
    fn retry_ceiling_surfaces_as_error() {
        // Random responses carry no reliability signal, and a duplicate
        // threshold this small rejects any second chain, so the bounded
        // assembler must give up instead of looping.
        let mut rng = ChaCha8Rng::seed_from_u64(0x23);
        let challenges = sample_challenges(64, 8, &mut rng);
        let responses = Array2::from_shape_simple_fn((64, 3), || {
            if rng.gen_bool(0.5) { 1. } else { -1. }
        });
        let training_set = TrainingSet::new(challenges, responses).unwrap();

        let mut config = AttackConfig::new(2, transform_id, combiner_xor);
        config.pop_size = 8;
        config.limit_iter = 5;
        config.limit_stag = 2;
        config.max_attempts = 2;
        config.dup_threshold = 1e-9;
        let attack = ReliabilityAttack::new(&training_set, config).unwrap();
        match attack.learn(&mut None) {
            Err(AttackError::PoolAssemblyExhausted { k: 2, assembled: 1,
                                                     attempts: 2 }) => (),
            other => panic!("expected PoolAssemblyExhausted, got {:?}",
                            other.map(|(_, meta)| meta)),
        }
    }

    #[test]
    fn single_chain_attack_returns_model_and_metadata() {
        let mut rng = ChaCha8Rng::seed_from_u64(0x24);
        let weights = random_weights(1, 8, 1., &mut rng);
        let sigma = NoisyLtfArray::sigma_noise_from_random_weights(8, 1.,
                                                                   0.1);
        let mut instance = NoisyLtfArray::new(weights, transform_id,
                                              combiner_xor, sigma, 0x25);
        let training_set = TrainingSet::sample(&mut instance, 256, 5,
                                               &mut rng);

        let mut config = AttackConfig::new(1, transform_id, combiner_xor);
        config.pop_size = 10;
        config.limit_iter = 30;
        config.limit_stag = 10;
        config.seed = 0x26;
        let attack = ReliabilityAttack::new(&training_set, config).unwrap();
        let mut logger = Some(Logger::LogVec(Vec::new()));
        let (model, meta) = attack.learn(&mut logger).unwrap();

        assert_eq!(model.k(), 1);
        assert_eq!(model.n(), 8);
        assert_eq!(meta.attempts, 1);
        assert_eq!(meta.final_objectives.len(), 1);
        assert_eq!(meta.iteration_count[0].len(), 1);
        if let Some(Logger::LogVec(records)) = logger {
            assert_eq!(records.len(), meta.iteration_count[0][0]);
        }
    }

    #[test]
    fn true_weights_score_well_on_the_objective() {
        // Sanity check of the reliability side channel itself: the
        // target's own weights must correlate far better with the
        // measured reliabilities than unrelated weights do.
        let mut rng = ChaCha8Rng::seed_from_u64(0x27);
        let weights = random_weights(1, 16, 1., &mut rng);
        let sigma = NoisyLtfArray::sigma_noise_from_random_weights(16, 1.,
                                                                   0.05);
        let mut instance = NoisyLtfArray::new(weights.clone(), transform_id,
                                              combiner_xor, sigma, 0x28);
        let training_set = TrainingSet::sample(&mut instance, 1024, 5,
                                               &mut rng);
        let measured =
            measured_reliability(&training_set.responses.view());

        let objective = |w: &ArrayView1<f64>, epsilon: f64| -> f64 {
            let diffs = training_set.challenges.dot(w);
            let rels = modeled_reliability(&diffs.view(), epsilon);
            (1. - pearson(&rels.view(), &measured.view())).abs()
        };

        let true_score = objective(&weights.row(0), 0.5);
        let other = random_weights(1, 16, 1., &mut rng);
        let other_score = objective(&other.row(0), 0.5);
        assert!(true_score < 0.7, "true weights scored {}", true_score);
        assert!(true_score < other_score,
                "true {} vs unrelated {}", true_score, other_score);
    }

    // Full pipeline on a small noisy XOR Arbiter PUF; slow, run with
    // `cargo test -- --ignored`. Parameters and the 0.4 tolerance match
    // the attack's usual evaluation setup.
    #[test]
    #[ignore]
    fn recovers_two_chain_xor_arbiter_puf() {
        let mut rng = ChaCha8Rng::seed_from_u64(0x1);
        let weights = array![
            [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8,
             -0.1, -0.2, -0.3, -0.4, -0.5, -0.6, -0.7, -0.83],
            [0.1, 0.2, 0.3, 0.4, -0.5, -0.6, -0.7, -0.8,
             -0.1, -0.2, -0.3, -0.4, 0.5, 0.6, 0.7, 0.81],
        ];
        let sigma = NoisyLtfArray::sigma_noise_from_random_weights(16, 1.,
                                                                   0.05);
        let mut instance = NoisyLtfArray::new(weights.clone(), transform_id,
                                              combiner_xor, sigma, 0x1);
        let training_set = TrainingSet::sample(&mut instance, 4096, 5,
                                               &mut rng);

        let mut config = AttackConfig::new(2, transform_id, combiner_xor);
        config.pop_size = 12;
        config.limit_stag = 100;
        config.limit_iter = 1000;
        config.seed = 0x2;
        config.max_attempts = 40;
        let attack = ReliabilityAttack::new(&training_set, config).unwrap();
        let (model, _meta) = attack.learn(&mut None).unwrap();

        let reference = LtfArray::new(weights, transform_id, combiner_xor);
        let distance = approx_dist(&reference, &model, 10000, &mut rng);
        assert!(distance <= 0.4, "model distance {}", distance);
    }
}
