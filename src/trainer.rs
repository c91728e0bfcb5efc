//! Trainer driver.
//!
//! Streams a line-delimited dataset of known-good domains through the
//! entropy windows and the HMM in learn mode, then assembles a [`Model`]
//! artifact. Entropy-window learning is fanned out one worker thread per
//! window (the teacher's channel/worker-thread idiom, see
//! `processor/feature_processor.rs` in the teacher repo); HMM minibatches
//! are parallelized internally by `Hmm::learn_parallel`.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::entropy::EntropyWindow;
use crate::error::Result;
use crate::hmm::Hmm;
use crate::model::Model;

const TRAINING_BATCH: usize = 16384;

pub struct Trainer {
    config: Config,
    hmm: Hmm,
    entropy_windows: Vec<(u64, EntropyWindow)>,
    length_histogram: HashMap<usize, u64>,
    skipped_lines: u64,
}

impl Trainer {
    pub fn new(config: Config, hmm: Hmm) -> Self {
        let entropy_windows = config
            .entropy
            .windows
            .iter()
            .map(|&w| (w, EntropyWindow::new(w, config.entropy.bins)))
            .collect();
        Self {
            config,
            hmm,
            entropy_windows,
            length_histogram: HashMap::new(),
            skipped_lines: 0,
        }
    }

    pub fn skipped_lines(&self) -> u64 {
        self.skipped_lines
    }

    pub fn train(
        &mut self,
        dataset_path: impl AsRef<Path>,
        max_lines: Option<usize>,
        rate: f64,
        batch_size: u64,
    ) -> Result<()> {
        let file = File::open(dataset_path)?;
        let reader = BufReader::new(file);

        let mut batch: Vec<String> = Vec::with_capacity(TRAINING_BATCH);
        let mut processed = 0usize;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            if let Some(max) = max_lines {
                if processed >= max {
                    break;
                }
            }
            processed += 1;
            *self.length_histogram.entry(line.len()).or_insert(0) += 1;

            if line.len() >= self.config.hmm.min_length {
                let sentinel = format!("{line}$");
                if let Err(e) = self.hmm.learn_parallel(&sentinel, rate, batch_size) {
                    warn!(error = %e, line, "skipping line for hmm training");
                    self.skipped_lines += 1;
                }
            }

            if line.len() >= self.config.entropy.min_length {
                batch.push(line);
            }

            if batch.len() >= TRAINING_BATCH {
                self.flush_entropy_batch(&batch);
                batch.clear();
            }

            if processed % TRAINING_BATCH == 0 {
                info!(processed, "training progress");
            }
        }

        if !batch.is_empty() {
            self.flush_entropy_batch(&batch);
        }

        info!(processed, skipped = self.skipped_lines, "training complete");
        Ok(())
    }

    /// Spread one worker per entropy window across `batch`, moving each
    /// window into its worker for the duration and returning it afterward.
    fn flush_entropy_batch(&mut self, batch: &[String]) {
        if self.entropy_windows.is_empty() {
            return;
        }
        let batch = Arc::new(batch.to_vec());
        let windows = std::mem::take(&mut self.entropy_windows);
        let (tx, rx) = crossbeam_channel::bounded(windows.len());

        let mut handles = Vec::with_capacity(windows.len());
        for (width, mut window) in windows {
            let batch = Arc::clone(&batch);
            let tx = tx.clone();
            handles.push(std::thread::spawn(move || {
                for line in batch.iter() {
                    window.learn(line);
                }
                tx.send((width, window))
                    .expect("entropy worker channel closed early");
            }));
        }
        drop(tx);

        let mut results: Vec<(u64, EntropyWindow)> = rx.iter().collect();
        for handle in handles {
            let _ = handle.join();
        }
        results.sort_by_key(|(w, _)| *w);
        self.entropy_windows = results;
    }

    /// Smallest length whose cumulative share of domain counts exceeds the
    /// configured percentile.
    fn query_max_length(&self) -> u64 {
        let total: u64 = self.length_histogram.values().sum();
        if total == 0 {
            return self.config.length.max_length;
        }
        let mut lengths: Vec<&usize> = self.length_histogram.keys().collect();
        lengths.sort();
        let mut cumulative = 0u64;
        for &len in lengths {
            cumulative += self.length_histogram[&len];
            if cumulative as f64 / total as f64 >= self.config.length.percentile {
                return len as u64;
            }
        }
        self.config.length.max_length
    }

    pub fn finish(self) -> Model {
        let query_max_length = self.query_max_length();
        let scale = Model::distribution_scale();
        let entropy_distribution = self
            .entropy_windows
            .iter()
            .map(|(w, window)| (*w, window.get_distribution(scale)))
            .collect();

        Model {
            query_max_length,
            max_length_penalty: self.config.length.max_length_penalty,
            bins: self.config.entropy.bins,
            entropy_distribution,
            hmm: self.hmm,
        }
    }
}
