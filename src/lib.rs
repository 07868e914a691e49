//! `relpuf` simulates Arbiter PUF variants modeled as linear threshold
//! function (LTF) arrays, and implements a machine-learning attack that
//! recovers a close approximation of the PUF's internal delay model from
//! observed challenge-response behavior alone.
//!
//! The attack is the reliability-based one from Becker [1]: a challenge
//! whose response flips across repeated measurements must have a delay
//! difference close to zero, so the *stability* of each response bit
//! carries information about the underlying weights. The learner measures
//! a per-challenge reliability score from repeated responses, and then
//! searches (with a CMA evolution strategy [2]) for chain weight vectors
//! whose modeled reliability correlates best with the measured one. Chains
//! are learned one at a time; candidates too correlated with an already
//! accepted chain are discarded, and the sign ambiguity of the assembled
//! model is resolved against a majority vote of the measurements.
//!
//! # Getting started
//!
//! `relpuf` is mainly used via the binary it provides, `relpuf`, which can
//! both synthesize noisy measurement sets from a simulated PUF and run the
//! attack on CSV measurement data. See the help screen: `relpuf -h`.
//!
//! As a library, the entry point is `learner::ReliabilityAttack`, which
//! consumes a `simulation::TrainingSet` of repeated measurements.
//!
//! # References
//!
//! [1] 2015, "The Gap Between Promise and Reality: On the Insecurity of
//! XOR Arbiter PUFs". _Georg T. Becker_.
//!
//! [2] 2006, "The CMA Evolution Strategy: A Comparing Review".
//! _Nikolaus Hansen_.
extern crate csv;
extern crate ndarray;
extern crate itertools;
extern crate ordered_float;
extern crate float_cmp;
extern crate rand;
extern crate rand_chacha;
extern crate rand_distr;

use thiserror::Error;

pub mod learner;
pub mod simulation;
pub mod utils;

/// Errors reported by configuration validation and pool assembly.
///
/// All validation happens synchronously, before any search starts; a
/// returned error never leaves partially mutated state behind.
#[derive(Debug, Error)]
pub enum AttackError {
    /// Challenge and response matrices disagree on the number of rows.
    #[error("input shape mismatch: {challenges} challenge rows, {responses} response rows")]
    InputShapeMismatch {
        challenges: usize,
        responses: usize,
    },
    /// The pool assembler hit its retry ceiling before collecting k
    /// sufficiently uncorrelated chains.
    #[error("pool assembly exhausted: {assembled} of {k} chains after {attempts} attempts")]
    PoolAssemblyExhausted {
        k: usize,
        assembled: usize,
        attempts: usize,
    },
    /// A configuration parameter is out of its valid range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
