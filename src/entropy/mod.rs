//! Streaming entropy window.
//!
//! Maintains a fixed-capacity sliding FIFO of recently observed FLDs and
//! incrementally tracks the normalized Shannon entropy of the current
//! multiset in amortized O(1) per update, together with a histogram of
//! that metric that doubles as a training-time probability distribution.

use std::collections::{HashMap, VecDeque};

use crate::fld::fld;

/// Scale used when exporting/importing a histogram as a probability
/// distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionScale {
    Linear,
    Log,
}

/// One sliding window of width `width` binned into `bins` entropy buckets.
#[derive(Debug, Clone)]
pub struct EntropyWindow {
    fifo: VecDeque<String>,
    freq: HashMap<String, u64>,
    size: u64,
    current_metric: f64,
    histogram: Vec<u64>,
    width: u64,
    bins: u64,
    state_shift: bool,
}

impl EntropyWindow {
    pub fn new(width: u64, bins: u64) -> Self {
        Self {
            fifo: VecDeque::with_capacity(width as usize),
            freq: HashMap::new(),
            size: 0,
            current_metric: 0.0,
            histogram: vec![0; bins as usize],
            width,
            bins,
            state_shift: false,
        }
    }

    pub fn width(&self) -> u64 {
        self.width
    }

    pub fn bins(&self) -> u64 {
        self.bins
    }

    /// -(k/size)*ln(k/size), the per-domain contribution to Shannon entropy.
    fn domain_metric(&self, k: u64) -> f64 {
        if k == 0 {
            0.0
        } else {
            let p = k as f64 / self.size as f64;
            -p * p.ln()
        }
    }

    /// Recomputes `current_metric` from scratch over the full frequency map.
    fn metric_from_scratch(&self) -> f64 {
        if self.size < 2 {
            return 0.0;
        }
        let sum: f64 = self.freq.values().map(|&k| self.domain_metric(k)).sum();
        sum / (self.size as f64).ln()
    }

    fn insert(&mut self, domain: &str) {
        self.fifo.push_back(domain.to_string());
        *self.freq.entry(domain.to_string()).or_insert(0) += 1;
        self.size += 1;
        self.current_metric = self.metric_from_scratch();
    }

    #[allow(dead_code)]
    fn pop(&mut self) {
        if let Some(domain) = self.fifo.pop_front() {
            self.size -= 1;
            if let Some(count) = self.freq.get_mut(&domain) {
                *count -= 1;
                if *count == 0 {
                    self.freq.remove(&domain);
                }
            }
            self.current_metric = self.metric_from_scratch();
        }
    }

    /// Hot path: push `domain`, pop the FIFO head, and update
    /// `current_metric` via the local delta rather than a full recompute.
    fn forward_shift(&mut self, domain: &str) {
        let popped = match self.fifo.front() {
            Some(p) => p.clone(),
            None => return,
        };

        if domain == popped {
            self.fifo.push_back(domain.to_string());
            self.fifo.pop_front();
        } else {
            let old_in = *self.freq.get(domain).unwrap_or(&0);
            let old_out = *self.freq.get(&popped).unwrap_or(&0);

            let delta_in = self.domain_metric(old_in + 1) - self.domain_metric(old_in);
            let delta_out = self.domain_metric(old_out - 1) - self.domain_metric(old_out);
            self.current_metric += (delta_in + delta_out) / (self.size as f64).ln();

            *self.freq.entry(domain.to_string()).or_insert(0) += 1;
            if old_out - 1 == 0 {
                self.freq.remove(&popped);
            } else {
                self.freq.insert(popped.clone(), old_out - 1);
            }

            self.fifo.push_back(domain.to_string());
            self.fifo.pop_front();
        }

        if self.current_metric < 1e-10 {
            self.current_metric = self.metric_from_scratch();
        }
    }

    fn bin_of(&self, metric: f64) -> usize {
        let bin = (metric * self.bins as f64).floor() as i64;
        bin.clamp(0, self.bins as i64 - 1) as usize
    }

    /// Feed one training sample into the window, accumulating the entropy
    /// histogram once the window has filled.
    pub fn learn(&mut self, raw_name: &str) {
        let name = fld(raw_name, 2).to_string();
        if self.state_shift {
            self.forward_shift(&name);
            let bin = self.bin_of(self.current_metric);
            self.histogram[bin] += 1;
        } else {
            self.insert(&name);
            if self.size >= self.width {
                self.state_shift = true;
            }
        }
    }

    /// Score one query against the trained distribution. Returns 0 until
    /// the window has filled.
    pub fn classify(&mut self, raw_name: &str) -> f64 {
        let name = fld(raw_name, 2).to_string();
        if !self.state_shift {
            self.insert(&name);
            if self.size >= self.width {
                self.state_shift = true;
            }
            return 0.0;
        }

        self.forward_shift(&name);
        let bin = self.bin_of(self.current_metric);
        let total_obs: u64 = self.histogram.iter().sum();
        if total_obs == 0 {
            return 0.0;
        }
        let bin_prob = self.histogram[bin] as f64 / total_obs as f64;
        let floor_prob = 1.0 / total_obs as f64;
        let domain_freq = *self.freq.get(&name).unwrap_or(&0) as f64 / self.size as f64;
        domain_freq * bin_prob.max(floor_prob).log10()
    }

    pub fn get_distribution(&self, scale: DistributionScale) -> Vec<f64> {
        let total: u64 = self.histogram.iter().sum();
        let total = total.max(1) as f64;
        match scale {
            DistributionScale::Linear => {
                self.histogram.iter().map(|&v| v as f64 / total).collect()
            }
            DistributionScale::Log => self
                .histogram
                .iter()
                .map(|&v| ((v + 1) as f64 / total).log10())
                .collect(),
        }
    }

    pub fn set_distribution(&mut self, dist: &[f64], weight: u64, scale: DistributionScale) {
        self.bins = dist.len() as u64;
        self.histogram = dist
            .iter()
            .map(|&v| match scale {
                DistributionScale::Linear => (weight as f64 * v).round().max(0.0) as u64,
                DistributionScale::Log => (weight as f64 * 10f64.powf(v)).round().max(0.0) as u64,
            })
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_invariant_holds_across_operations() {
        let mut w = EntropyWindow::new(4, 10);
        for name in ["a.com", "b.com", "c.com", "d.com", "e.com", "a.com"] {
            w.learn(name);
            let fifo_sum: u64 = w.freq.values().sum();
            assert_eq!(w.size, w.fifo.len() as u64);
            assert_eq!(w.size, fifo_sum);
            assert!(w.freq.values().all(|&v| v > 0));
        }
    }

    #[test]
    fn singleton_multiset_has_zero_entropy() {
        let mut w = EntropyWindow::new(4, 10);
        for _ in 0..8 {
            w.learn("same.com");
        }
        assert!(w.current_metric.abs() < 1e-10);
    }

    #[test]
    fn distinct_items_have_positive_entropy() {
        let mut w = EntropyWindow::new(4, 10);
        for name in ["a.com", "b.com", "c.com", "d.com", "e.com"] {
            w.learn(name);
        }
        assert!(w.current_metric > 0.0);
        assert!(w.current_metric <= 1.0 + 1e-9);
    }

    #[test]
    fn repeated_shift_of_same_domain_keeps_metric_and_fills_bin_zero() {
        let width = 4;
        let mut w = EntropyWindow::new(width, 10);
        for _ in 0..width {
            w.learn("same.com");
        }
        assert!(w.current_metric.abs() < 1e-10);
        for _ in 0..width {
            w.learn("same.com");
        }
        assert!(w.current_metric.abs() < 1e-10);
        assert_eq!(w.histogram[0], width);
        assert_eq!(w.histogram.iter().skip(1).sum::<u64>(), 0);
    }

    #[test]
    fn distribution_round_trips_through_log_scale() {
        let mut w = EntropyWindow::new(3, 4);
        for name in ["a.com", "b.com", "c.com", "a.com", "b.com", "c.com", "x.com"] {
            w.learn(name);
        }
        let first = w.get_distribution(DistributionScale::Log);
        let total: u64 = w.histogram.iter().sum();
        w.set_distribution(&first, total, DistributionScale::Log);
        let second = w.get_distribution(DistributionScale::Log);
        for (a, b) in first.iter().zip(second.iter()) {
            assert!((a - b).abs() < 0.05, "{a} vs {b}");
        }
    }

    #[test]
    fn fld_extraction_uses_level_two() {
        let mut w = EntropyWindow::new(4, 10);
        w.learn("s2.smtp.google.com");
        assert_eq!(w.freq.get("google.com"), Some(&1));
    }
}
