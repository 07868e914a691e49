//! `relpuf` runs reliability-based modeling attacks against simulated
//! XOR Arbiter PUFs.
//!
//! The `attack` command takes two headerless CSV files: a challenge
//! matrix (one n-bit challenge per row, bits in {-1,+1} or {0,1}) and a
//! response matrix (one row per challenge, one column per repeated
//! measurement, entries in {-1,+1}), such as:
//!
//!     1, -1, -1, 1
//!     -1, -1, 1, 1
//!     ...
//!
//! It learns an LTF-array model of the underlying PUF from the
//! reliability of the repeated measurements alone, and reports the
//! model's agreement with the majority-vote responses plus per-chain
//! search diagnostics.
//!
//! The `simulate` command synthesizes such a pair of files from a random
//! PUF instance with configurable noise, so a full experiment is:
//!
//!     relpuf simulate --stages=32 --num=8192 challenges.csv responses.csv
//!     relpuf attack --chains=2 challenges.csv responses.csv
extern crate docopt;
extern crate rand;
extern crate rand_chacha;
extern crate serde;

extern crate relpuf;

use docopt::Docopt;
use serde::Deserialize;
use std::fs::File;
use std::process;

use relpuf::learner::attack::agreement;
use relpuf::learner::{AttackConfig, GenerationRecord, Logger,
                      ReliabilityAttack};
use relpuf::simulation::{combiner_xor, majority_responses, random_weights,
                         transform_atf, transform_id, NoisyLtfArray,
                         TrainingSet, Transform};
use relpuf::utils::{load_matrix, store_matrix, to_signed_bits};

const USAGE: &str = "
Reliability-based CMA-ES modeling attack on XOR Arbiter PUFs.

Usage: relpuf attack [options] <challenges> <responses>
       relpuf simulate [options] <challenges> <responses>
       relpuf (--help | --version)

Options:
    --chains=<k>          Number of parallel chains [default: 2].
    --transform=<t>       Input transform, id or atf [default: id].
    --pop-size=<l>        CMA-ES population size [default: 24].
    --abort-delta=<d>     Minimal objective improvement that counts as
                          progress [default: 0.01].
    --limit-stag=<s>      Non-improving generations before a chain search
                          stops [default: 100].
    --limit-iter=<i>      Generation ceiling per chain search
                          [default: 1000].
    --dup-threshold=<t>   Absolute correlation above which a learned chain
                          is discarded as a duplicate [default: 0.5].
    --epsilon=<e>         Initial reliability margin [default: 2].
    --max-attempts=<m>    Total search attempts before giving up; 0 means
                          10 per chain [default: 0].
    --seed=<s>            Top-level PRNG seed [default: 0].
    --log=<file>          Write per-generation progress to this .csv file.
    --stages=<n>          (simulate) Stages per chain [default: 16].
    --num=<n>             (simulate) Number of challenges [default: 4096].
    --reps=<r>            (simulate) Measurements per challenge
                          [default: 5].
    --noisiness=<x>       (simulate) Noise level relative to the weight
                          spread [default: 0.05].
    -h, --help            Show help.
    --version             Show the version.
";

#[derive(Deserialize)]
struct Args {
    cmd_attack: bool,
    cmd_simulate: bool,
    flag_chains: usize,
    flag_transform: String,
    flag_pop_size: usize,
    flag_abort_delta: f64,
    flag_limit_stag: usize,
    flag_limit_iter: usize,
    flag_dup_threshold: f64,
    flag_epsilon: f64,
    flag_max_attempts: usize,
    flag_seed: u64,
    flag_log: Option<String>,
    flag_stages: usize,
    flag_num: usize,
    flag_reps: usize,
    flag_noisiness: f64,
    arg_challenges: String,
    arg_responses: String,
}

fn transform_from_name(name: &str) -> Transform {
    match name {
        "id" => transform_id,
        "atf" => transform_atf,
        other => {
            eprintln!("[!] unknown transform {:?} (expected id or atf)",
                      other);
            process::exit(1);
        }
    }
}

fn run_attack(args: &Args) {
    let challenges = to_signed_bits(
            load_matrix(&args.arg_challenges)
                .expect("[!] failed to load challenges"))
        .expect("[!] challenges are not bits");
    let responses = to_signed_bits(
            load_matrix(&args.arg_responses)
                .expect("[!] failed to load responses"))
        .expect("[!] responses are not bits");
    let training_set = TrainingSet::new(challenges, responses)
        .unwrap_or_else(|e| {
            eprintln!("[!] {}", e);
            process::exit(1);
        });

    let mut config = AttackConfig::new(args.flag_chains,
                                       transform_from_name(&args.flag_transform),
                                       combiner_xor);
    config.pop_size = args.flag_pop_size;
    config.abort_delta = args.flag_abort_delta;
    config.limit_stag = args.flag_limit_stag;
    config.limit_iter = args.flag_limit_iter;
    config.dup_threshold = args.flag_dup_threshold;
    config.epsilon_init = args.flag_epsilon;
    config.seed = args.flag_seed;
    if args.flag_max_attempts > 0 {
        config.max_attempts = args.flag_max_attempts;
    }

    let mut logger: Option<Logger<GenerationRecord>> =
        args.flag_log.as_ref().map(|fname| {
            Logger::LogFile(File::create(fname)
                .expect("[!] could not create log file"))
        });

    let attack = ReliabilityAttack::new(&training_set, config)
        .unwrap_or_else(|e| {
            eprintln!("[!] {}", e);
            process::exit(1);
        });

    println!("Learning {} chains from {} challenges x {} measurements...",
             args.flag_chains, training_set.num(), training_set.reps());
    match attack.learn(&mut logger) {
        Ok((model, meta)) => {
            let majority =
                majority_responses(&training_set.responses.view());
            let accuracy = agreement(&model,
                                     &training_set.challenges.view(),
                                     &majority.view());
            println!("Training accuracy vs majority vote: {}", accuracy);
            println!("Search attempts: {}", meta.attempts);
            for chain in 0..args.flag_chains {
                println!("chain {}: generations {:?}, discarded against {:?}",
                         chain, meta.iteration_count[chain],
                         meta.discard_count[chain]);
            }
            println!("Final objective values: {:?}", meta.final_objectives);
        }
        Err(e) => {
            eprintln!("[!] {}", e);
            process::exit(1);
        }
    }
}

fn run_simulate(args: &Args) {
    use rand::SeedableRng;
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(args.flag_seed);

    let weights = random_weights(args.flag_chains, args.flag_stages, 1.,
                                 &mut rng);
    let sigma_noise = NoisyLtfArray::sigma_noise_from_random_weights(
        args.flag_stages, 1., args.flag_noisiness);
    let mut instance = NoisyLtfArray::new(
        weights, transform_from_name(&args.flag_transform), combiner_xor,
        sigma_noise, args.flag_seed.wrapping_add(1));
    let training_set = TrainingSet::sample(&mut instance, args.flag_num,
                                           args.flag_reps, &mut rng);

    store_matrix(&args.arg_challenges,
                 &training_set.challenges.view())
        .expect("[!] failed to store challenges");
    store_matrix(&args.arg_responses, &training_set.responses.view())
        .expect("[!] failed to store responses");
    println!("Simulated {} chains x {} stages, noisiness {}: \
              {} challenges x {} measurements",
             args.flag_chains, args.flag_stages, args.flag_noisiness,
             args.flag_num, args.flag_reps);
}

fn main() {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| {
            d.version(Some(env!("CARGO_PKG_VERSION").to_string()))
             .deserialize()
        })
        .unwrap_or_else(|e| e.exit());

    if args.cmd_simulate {
        run_simulate(&args);
    } else if args.cmd_attack {
        run_attack(&args);
    }
}
