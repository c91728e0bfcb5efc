//! CLI entry point for the trainer driver.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use dns_firewall::config::Config;
use dns_firewall::hmm::Hmm;
use dns_firewall::trainer::Trainer;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::error;

const DEFAULT_ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz0123456789-.$";
const DEFAULT_HMM_STATES: usize = 8;
const DEFAULT_LEARN_RATE: f64 = 0.3;
const DEFAULT_BATCH_SIZE: u64 = 256;
const HMM_SEED: u64 = 0xD5F5_A17E_B00B_1E55;

/// Trains a DNS tunneling / DGA classifier model from a line-delimited
/// domain dataset and writes the resulting artifact.
#[derive(Parser, Debug)]
#[command(name = "dnsfw-train")]
struct Args {
    /// YAML config path.
    #[arg(short = 'c')]
    config: Option<PathBuf>,
    /// Dataset path; overrides any dataset path in the config.
    #[arg(short = 'f')]
    dataset: Option<PathBuf>,
    /// Maximum number of dataset lines to process.
    #[arg(short = 'n')]
    max_lines: Option<usize>,
    /// Output model artifact path.
    #[arg(short = 'o')]
    output: Option<PathBuf>,
    /// Prefix for per-window entropy-distribution CSV graphs.
    #[arg(short = 'g')]
    graph_prefix: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let (Some(config_path), Some(dataset_path), Some(output_path)) =
        (args.config.clone(), args.dataset.clone(), args.output.clone())
    else {
        eprintln!("dnsfw-train: -c <config.yaml>, -f <dataset>, and -o <model.bin> are required");
        return ExitCode::from(1);
    };

    match run(&args, &config_path, &dataset_path, &output_path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "training failed");
            eprintln!("dnsfw-train: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn run(
    args: &Args,
    config_path: &PathBuf,
    dataset_path: &PathBuf,
    output_path: &PathBuf,
) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;

    let alphabet: Vec<char> = DEFAULT_ALPHABET.chars().collect();
    let mut rng = ChaCha8Rng::seed_from_u64(HMM_SEED);
    let hmm = Hmm::random(DEFAULT_HMM_STATES, &alphabet, &mut rng);

    let mut trainer = Trainer::new(config, hmm);
    trainer.train(
        dataset_path,
        args.max_lines,
        DEFAULT_LEARN_RATE,
        DEFAULT_BATCH_SIZE,
    )?;

    let model = trainer.finish();
    model.save(output_path)?;

    if let Some(prefix) = &args.graph_prefix {
        model.save_graphs(prefix, ".csv")?;
    }

    Ok(())
}
