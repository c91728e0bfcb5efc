//! Decision pipeline.
//!
//! Composes the deny/allow lists, rate window, HMM score, and entropy score
//! into a single [`Classification`] per DNS question, then reduces a
//! packet's questions to one classification by `(note ordinal, score)`.

use regex::RegexSet;
use tracing::{debug, warn};

use crate::config::Config;
use crate::entropy::EntropyWindow;
use crate::hmm::Hmm;
use crate::rate::RateWindow;

/// A parsed DNS question, as handed to the core by the (out-of-scope) wire
/// decoder.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub qname: String,
    pub qtype: u16,
}

/// A packet may carry more than one question; the classifier evaluates
/// each and reports the most severe result.
#[derive(Debug, Clone)]
pub struct DnsPacket {
    pub questions: Vec<DnsQuery>,
}

/// Reject/allow outcome, ordered from "most severe reject" to "most benign
/// allow". A rejecting note always beats an allow note in the per-packet
/// minimum, and a more specific reject reached earlier in the pipeline
/// beats a generic one reached later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Note {
    Blacklist,
    InvalidTimeframe,
    MaxLength,
    Whitelist,
    MinLength,
    Score,
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub domain: String,
    pub note: Note,
    pub score: f64,
    pub score1: f64,
    pub score2: f64,
}

impl Classification {
    fn sentinel(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            note: Note::Score,
            score: f64::INFINITY,
            score1: 0.0,
            score2: 0.0,
        }
    }

    /// True if `self` outranks (is more severe/lower than) `other` under
    /// the `(note, score)` ordering used to reduce a packet's questions.
    fn outranks(&self, other: &Classification) -> bool {
        match self.note.cmp(&other.note) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => self.score < other.score,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Reject,
}

impl Classification {
    pub fn verdict(&self, threshold: f64) -> Verdict {
        match self.note {
            Note::Whitelist | Note::MinLength => Verdict::Allow,
            Note::Blacklist | Note::InvalidTimeframe | Note::MaxLength => Verdict::Reject,
            Note::Score => {
                if self.score >= threshold {
                    Verdict::Allow
                } else {
                    Verdict::Reject
                }
            }
        }
    }
}

/// Runtime classifier state: lists, entropy windows, HMM, and rate window,
/// owned by value (no shared ownership across threads in the packet path).
pub struct DnsClassifier {
    config: Config,
    blacklist: Option<RegexSet>,
    whitelist: Option<RegexSet>,
    entropy_windows: Vec<(u64, EntropyWindow)>,
    hmm: Hmm,
    rate_window: Option<RateWindow>,
    query_max_length: u64,
    max_length_penalty: f64,
}

fn list_regex_set(patterns: &[String]) -> crate::error::Result<RegexSet> {
    let full: Vec<String> = patterns.iter().map(|p| format!(".*{p}")).collect();
    Ok(RegexSet::new(full)?)
}

impl DnsClassifier {
    pub fn new(
        config: Config,
        blacklist_patterns: Vec<String>,
        whitelist_patterns: Vec<String>,
        entropy_windows: Vec<(u64, EntropyWindow)>,
        hmm: Hmm,
        query_max_length: u64,
        max_length_penalty: f64,
    ) -> crate::error::Result<Self> {
        let blacklist = if blacklist_patterns.is_empty() {
            None
        } else {
            Some(list_regex_set(&blacklist_patterns)?)
        };
        let whitelist = if whitelist_patterns.is_empty() {
            None
        } else {
            Some(list_regex_set(&whitelist_patterns)?)
        };
        let rate_window = if config.timeframe.enabled {
            Some(RateWindow::new(
                config.timeframe.period_secs,
                config.timeframe.max_queries,
                config.timeframe.penalty,
            ))
        } else {
            None
        };

        Ok(Self {
            config,
            blacklist,
            whitelist,
            entropy_windows,
            hmm,
            rate_window,
            query_max_length,
            max_length_penalty,
        })
    }

    fn hmm_score(&self, qname: &str) -> f64 {
        if !self.config.hmm.enabled || qname.len() < self.config.hmm.min_length {
            return 0.0;
        }
        let sentinel = format!("{qname}$");
        match self.hmm.find_viterbi_path(&sentinel) {
            Ok(path) => {
                let vp = path.prob;
                vp / qname.len() as f64
                    + (self.hmm.alphabet().len().max(1) as f64).log10()
                    + (self.hmm.n_states().max(1) as f64).log10()
                    + self.config.hmm.bias
            }
            Err(e) => {
                warn!(error = %e, qname, "hmm viterbi failed, scoring as neutral");
                0.0
            }
        }
    }

    fn entropy_score(&mut self, qname: &str) -> f64 {
        if !self.config.entropy.enabled || qname.len() < self.config.entropy.min_length {
            return 0.0;
        }
        if self.entropy_windows.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .entropy_windows
            .iter_mut()
            .map(|(_, w)| w.classify(qname))
            .sum();
        sum / self.entropy_windows.len() as f64 + self.config.entropy.bias
    }

    /// Steps 1-7 of the decision pipeline, applied to a single question.
    fn classify_question(&mut self, qname: &str) -> Classification {
        if let Some(bl) = &self.blacklist {
            if bl.is_match(qname) {
                return Classification {
                    domain: qname.to_string(),
                    note: Note::Blacklist,
                    score: 0.0,
                    score1: 0.0,
                    score2: 0.0,
                };
            }
        }
        if let Some(wl) = &self.whitelist {
            if wl.is_match(qname) {
                return Classification {
                    domain: qname.to_string(),
                    note: Note::Whitelist,
                    score: 0.0,
                    score1: 0.0,
                    score2: 0.0,
                };
            }
        }

        let hmm_weight = if self.config.hmm.enabled && qname.len() >= self.config.hmm.min_length {
            self.config.hmm.weight
        } else {
            0.0
        };
        let hmm_score = self.hmm_score(qname);

        let entropy_weight =
            if self.config.entropy.enabled && qname.len() >= self.config.entropy.min_length {
                self.config.entropy.weight
            } else {
                0.0
            };
        let entropy_score = self.entropy_score(qname);

        let weight_sum = hmm_weight + entropy_weight;
        let score = if weight_sum > 0.0 {
            (hmm_weight * hmm_score + entropy_weight * entropy_score) / weight_sum
        } else {
            0.0
        };

        let mut classification = Classification {
            domain: qname.to_string(),
            note: Note::Score,
            score,
            score1: hmm_score,
            score2: entropy_score,
        };

        let len = qname.len() as u64;
        if len > self.query_max_length {
            let penalty = (len - self.query_max_length) as f64 * self.max_length_penalty;
            classification.score -= penalty;
            classification.note = Note::MaxLength;
            classification.score1 = len as f64;
            classification.score2 = self.query_max_length as f64;
        }

        if let Some(rw) = &mut self.rate_window {
            let now = crate::util::unix_now();
            let verdict = rw.insert(qname, now);
            if verdict.note == Note::InvalidTimeframe {
                classification.note = Note::InvalidTimeframe;
                classification.score -= verdict.score;
            }
        }

        classification
    }

    /// Classify every question in `packet` and report the most severe
    /// result under the `(note, score)` ordering.
    pub fn classify(&mut self, packet: &DnsPacket) -> Classification {
        let mut best = Classification::sentinel("");
        for question in &packet.questions {
            let c = self.classify_question(&question.qname);
            debug!(domain = %c.domain, note = ?c.note, score = c.score, "classified question");
            if c.outranks(&best) {
                best = c;
            }
        }
        best
    }

    pub fn verdict(&self, classification: &Classification) -> Verdict {
        classification.verdict(self.config.reject.threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        EntropyConfig, HmmConfig, LengthConfig, Mode, ModelConfig, RejectConfig, TimeframeConfig,
        Verbosity,
    };
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn base_config(threshold: f64) -> Config {
        Config {
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
                enabled: false,
                min_length: 0,
                bias: 0.0,
                weight: 0.0,
                windows: vec![],
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
                threshold,
            },
        }
    }

    fn dummy_hmm() -> Hmm {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        Hmm::random(2, &['a', 'b', '$'], &mut rng)
    }

    #[test]
    fn blacklist_short_circuits() {
        let mut cfg = base_config(-5.0);
        cfg.entropy.enabled = true;
        cfg.entropy.weight = 1.0;
        let mut classifier = DnsClassifier::new(
            cfg,
            vec!["evil\\.com".to_string()],
            vec![],
            vec![(4, EntropyWindow::new(4, 10))],
            dummy_hmm(),
            40,
            0.1,
        )
        .unwrap();

        let packet = DnsPacket {
            questions: vec![DnsQuery {
                qname: "www.evil.com".to_string(),
                qtype: 1,
            }],
        };
        let c = classifier.classify(&packet);
        assert_eq!(c.note, Note::Blacklist);
        assert_eq!(classifier.verdict(&c), Verdict::Reject);
    }

    #[test]
    fn whitelist_beats_score() {
        let mut cfg = base_config(0.0);
        cfg.entropy.enabled = true;
        cfg.entropy.weight = 1.0;
        let mut classifier = DnsClassifier::new(
            cfg,
            vec![],
            vec!["bank\\.example".to_string()],
            vec![(4, EntropyWindow::new(4, 10))],
            dummy_hmm(),
            40,
            0.1,
        )
        .unwrap();

        let packet = DnsPacket {
            questions: vec![DnsQuery {
                qname: "login.bank.example".to_string(),
                qtype: 1,
            }],
        };
        let c = classifier.classify(&packet);
        assert_eq!(c.note, Note::Whitelist);
        assert_eq!(classifier.verdict(&c), Verdict::Allow);
    }

    #[test]
    fn length_penalty_sets_max_length_note_and_subtracts_penalty() {
        let mut cfg = base_config(-5.0);
        cfg.entropy.enabled = true;
        cfg.entropy.weight = 1.0;
        cfg.entropy.min_length = 1000; // disable actual entropy scoring
        let mut classifier = DnsClassifier::new(
            cfg,
            vec![],
            vec![],
            vec![],
            dummy_hmm(),
            40,
            0.1,
        )
        .unwrap();

        let long_name = "a".repeat(60);
        let packet = DnsPacket {
            questions: vec![DnsQuery {
                qname: long_name,
                qtype: 1,
            }],
        };
        let c = classifier.classify(&packet);
        assert_eq!(c.note, Note::MaxLength);
        assert!((c.score - (0.0 - 20.0 * 0.1)).abs() < 1e-9);
        assert_eq!(classifier.verdict(&c), Verdict::Reject);
    }

    #[test]
    fn note_ordinal_order_matches_the_resolved_ambiguity() {
        assert!(Note::Blacklist < Note::InvalidTimeframe);
        assert!(Note::InvalidTimeframe < Note::MaxLength);
        assert!(Note::MaxLength < Note::Whitelist);
        assert!(Note::Whitelist < Note::MinLength);
        assert!(Note::MinLength < Note::Score);
    }
}
