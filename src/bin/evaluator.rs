//! CLI entry point for the evaluator driver.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use dns_firewall::config::{self, Config};
use dns_firewall::entropy::EntropyWindow;
use dns_firewall::evaluator::Evaluator;
use dns_firewall::model::Model;
use dns_firewall::pipeline::DnsClassifier;
use tracing::error;

/// Scores a line-delimited list of DNS names against a trained model and
/// writes `domain;score1;score2;score` CSV rows.
#[derive(Parser, Debug)]
#[command(name = "dnsfw-eval")]
struct Args {
    /// YAML config path (names the model artifact and lists).
    #[arg(short = 'c')]
    config: Option<PathBuf>,
    /// Dataset of DNS names, one per line.
    #[arg(short = 'f')]
    dataset: Option<PathBuf>,
    /// Maximum number of dataset lines to process.
    #[arg(short = 'n')]
    max_lines: Option<usize>,
    /// Output CSV path.
    #[arg(short = 'o')]
    output: Option<PathBuf>,
    #[arg(short = 'g')]
    graph_prefix: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let (Some(config_path), Some(dataset_path), Some(output_path)) =
        (args.config.clone(), args.dataset.clone(), args.output.clone())
    else {
        eprintln!("dnsfw-eval: -c <config.yaml>, -f <dataset>, and -o <scores.csv> are required");
        return ExitCode::from(1);
    };

    match run(
        &config_path,
        &dataset_path,
        &output_path,
        args.max_lines,
        args.graph_prefix.as_deref(),
    ) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "evaluation failed");
            eprintln!("dnsfw-eval: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn run(
    config_path: &PathBuf,
    dataset_path: &PathBuf,
    output_path: &PathBuf,
    max_lines: Option<usize>,
    graph_prefix: Option<&str>,
) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let model = Model::load(&config.model.filename)?;

    if let Some(prefix) = graph_prefix {
        model.save_graphs(prefix, ".csv")?;
    }

    let blacklist = match &config.blacklist {
        Some(p) => config::load_list(p)?,
        None => vec![],
    };
    let whitelist = match &config.whitelist {
        Some(p) => config::load_list(p)?,
        None => vec![],
    };

    let mut entropy_windows = Vec::with_capacity(config.entropy.windows.len());
    for &width in &config.entropy.windows {
        let mut window = EntropyWindow::new(width, model.bins);
        if let Some(dist) = model.entropy_distribution.get(&width) {
            window.set_distribution(dist, config.model.weight, Model::distribution_scale());
        }
        entropy_windows.push((width, window));
    }

    let min_length = config.hmm.min_length;
    let query_max_length = model.query_max_length;
    let max_length_penalty = model.max_length_penalty;
    let classifier = DnsClassifier::new(
        config,
        blacklist,
        whitelist,
        entropy_windows,
        model.hmm,
        query_max_length,
        max_length_penalty,
    )?;

    let mut evaluator = Evaluator::new(classifier, min_length);
    evaluator.run(dataset_path, output_path, max_lines)?;
    Ok(())
}
