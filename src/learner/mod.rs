//! Reliability-based modeling attack and its building blocks.
//!
//! The attack follows Becker's reliability side channel: `reliability`
//! turns repeated measurements into per-challenge stability scores,
//! `cmaes` searches weight space for one chain at a time, and `attack`
//! drives the per-chain searches, assembles a pool of independent chains
//! and resolves the model's output polarity.
pub mod attack;
pub mod cmaes;
pub mod reliability;

pub use self::attack::{polarize_chains, AttackConfig, AttackMetadata,
                       ReliabilityAttack};
pub use self::cmaes::{CmaEs, SearchConfig, SearchResult};
pub use self::reliability::{measured_reliability, modeled_reliability,
                            pearson};

use std::fs::File;
use std::io::Write;

/// Log per-generation progress either to a .csv file or into a Vec.
pub enum Logger<T> {
    LogFile(File),
    LogVec(Vec<T>),
}

/// One structured record per optimizer generation.
#[derive(Clone, Debug)]
pub struct GenerationRecord {
    /// Index of the chain being searched when this record was produced.
    pub chain: usize,
    pub generation: usize,
    pub best_objective: f64,
    pub step_size: f64,
}

impl Logger<GenerationRecord> {
    /// Writes the .csv header line (no-op for the Vec variant).
    pub fn log_header(&mut self) {
        if let Logger::LogFile(file) = self {
            writeln!(file, "chain, generation, best-objective, step-size")
                .expect("Could not write to log file");
        }
    }

    pub fn log(&mut self, record: GenerationRecord) {
        match self {
            Logger::LogFile(file) => {
                writeln!(file, "{}, {}, {}, {}", record.chain,
                         record.generation, record.best_objective,
                         record.step_size)
                    .expect("Could not write to log file");
            }
            Logger::LogVec(v) => v.push(record),
        }
    }
}
