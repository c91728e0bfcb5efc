//! Evaluator driver.
//!
//! Streams DNS names through a built [`DnsClassifier`] and emits one CSV
//! line per scored name: `domain;score1;score2;score`.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use tracing::info;

use crate::error::Result;
use crate::pipeline::{DnsClassifier, DnsPacket, DnsQuery};

pub struct Evaluator {
    classifier: DnsClassifier,
    min_length: usize,
}

impl Evaluator {
    pub fn new(classifier: DnsClassifier, min_length: usize) -> Self {
        Self {
            classifier,
            min_length,
        }
    }

    pub fn run(
        &mut self,
        dataset_path: impl AsRef<Path>,
        output_path: impl AsRef<Path>,
        max_lines: Option<usize>,
    ) -> Result<()> {
        let file = File::open(dataset_path)?;
        let reader = BufReader::new(file);
        let mut out = BufWriter::new(File::create(output_path)?);

        let mut processed = 0usize;
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(max) = max_lines {
                if processed >= max {
                    break;
                }
            }
            if line.len() < self.min_length {
                continue;
            }
            processed += 1;

            let packet = DnsPacket {
                questions: vec![DnsQuery {
                    qname: line.to_string(),
                    qtype: 1,
                }],
            };
            let classification = self.classifier.classify(&packet);
            writeln!(
                out,
                "{};{};{};{}",
                classification.domain, classification.score1, classification.score2, classification.score
            )?;

            if processed % 1024 == 0 {
                info!(processed, "evaluation progress");
            }
        }

        out.flush()?;
        info!(processed, "evaluation complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        Config, EntropyConfig, HmmConfig, LengthConfig, Mode, ModelConfig, RejectConfig,
        TimeframeConfig, Verbosity,
    };
    use crate::entropy::EntropyWindow;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn writes_one_csv_line_per_scored_name() {
        let mut cfg = Config {
            mode: Mode::Simple,
            verbosity: Verbosity::None,
            model: ModelConfig {
                filename: "model.bin".into(),
                weight: 1,
            },
            blacklist: None,
            whitelist: None,
            timeframe: TimeframeConfig::default(),
            hmm: HmmConfig {
                enabled: false,
                min_length: 0,
                bias: 0.0,
                weight: 0.0,
            },
            entropy: EntropyConfig {
                enabled: true,
                min_length: 0,
                bias: 0.0,
                weight: 1.0,
                windows: vec![4],
                bins: 10,
            },
            length: LengthConfig {
                min_length: 0,
                max_length: 63,
                max_length_penalty: 0.1,
                percentile: 0.99,
            },
            reject: RejectConfig {
                block_period: 0,
                threshold: -5.0,
            },
        };
        cfg.entropy.enabled = true;

        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let hmm = crate::hmm::Hmm::random(2, &['a', 'b', '$'], &mut rng);
        let classifier = DnsClassifier::new(
            cfg,
            vec![],
            vec![],
            vec![(4, EntropyWindow::new(4, 10))],
            hmm,
            63,
            0.1,
        )
        .unwrap();

        let mut evaluator = Evaluator::new(classifier, 0);
        let dir = tempfile::tempdir().unwrap();
        let dataset = dir.path().join("in.txt");
        let output = dir.path().join("out.csv");
        std::fs::write(&dataset, "a.com\nb.com\n\nc.com\n").unwrap();

        evaluator.run(&dataset, &output, None).unwrap();
        let contents = std::fs::read_to_string(&output).unwrap();
        assert_eq!(contents.lines().count(), 3);
    }
}
