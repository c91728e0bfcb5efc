//! Trained model artifact.
//!
//! Bundles the length statistics, per-level entropy distributions, and the
//! HMM into a single binary file that the evaluator loads at startup. The
//! layout is hand-rolled little-endian, not a generic serde format, to keep
//! it byte-compatible with the field order the classifier actually reads.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::entropy::DistributionScale;
use crate::error::{FirewallError, Result};
use crate::hmm::Hmm;

/// Everything the evaluator needs to score a query, minus the list files
/// and runtime configuration (those stay in `Config`).
#[derive(Debug)]
pub struct Model {
    pub query_max_length: u64,
    pub max_length_penalty: f64,
    pub bins: u64,
    /// FLD level -> entropy histogram, as produced by each `EntropyWindow`.
    pub entropy_distribution: HashMap<u64, Vec<f64>>,
    pub hmm: Hmm,
}

const MAGIC: &[u8; 4] = b"DFW1";

impl Model {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        w.write_all(MAGIC)?;
        w.write_all(&self.query_max_length.to_le_bytes())?;
        w.write_all(&self.max_length_penalty.to_le_bytes())?;
        w.write_all(&self.bins.to_le_bytes())?;

        w.write_all(&(self.entropy_distribution.len() as u32).to_le_bytes())?;
        let mut levels: Vec<&u64> = self.entropy_distribution.keys().collect();
        levels.sort();
        for level in levels {
            let dist = &self.entropy_distribution[level];
            w.write_all(&level.to_le_bytes())?;
            w.write_all(&(dist.len() as u32).to_le_bytes())?;
            for v in dist {
                w.write_all(&v.to_le_bytes())?;
            }
        }

        self.hmm.write_binary(&mut w)?;
        w.flush()?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut r = BufReader::new(File::open(path)?);
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(FirewallError::Parse(
                "model file missing DFW1 magic header".into(),
            ));
        }

        let query_max_length = read_u64(&mut r)?;
        let max_length_penalty = read_f64(&mut r)?;
        let bins = read_u64(&mut r)?;

        let n_levels = read_u32(&mut r)? as usize;
        let mut entropy_distribution = HashMap::with_capacity(n_levels);
        for _ in 0..n_levels {
            let level = read_u64(&mut r)?;
            let len = read_u32(&mut r)? as usize;
            let mut dist = Vec::with_capacity(len);
            for _ in 0..len {
                dist.push(read_f64(&mut r)?);
            }
            entropy_distribution.insert(level, dist);
        }

        let hmm = Hmm::read_binary(&mut r)?;

        Ok(Self {
            query_max_length,
            max_length_penalty,
            bins,
            entropy_distribution,
            hmm,
        })
    }

    /// Dump each level's distribution as `<prefix><level><suffix>`, one
    /// `bin;value` pair per line, for offline plotting.
    pub fn save_graphs(&self, prefix: &str, suffix: &str) -> Result<()> {
        let mut levels: Vec<&u64> = self.entropy_distribution.keys().collect();
        levels.sort();
        for level in levels {
            let dist = &self.entropy_distribution[level];
            let path = format!("{prefix}{level}{suffix}");
            let mut f = BufWriter::new(File::create(path)?);
            for (i, v) in dist.iter().enumerate() {
                writeln!(f, "{i};{v}")?;
            }
        }
        Ok(())
    }

    /// Convenience accessor matching the entropy window's own export, used
    /// by the trainer when assembling `entropy_distribution` at save time.
    pub fn distribution_scale() -> DistributionScale {
        DistributionScale::Log
    }
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f64<R: Read>(r: &mut R) -> Result<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn round_trips_through_a_temp_file() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let alphabet: Vec<char> = "abcdefghijklmnopqrstuvwxyz0123456789-.".chars().collect();
        let mut hmm = Hmm::random(6, &alphabet, &mut rng);
        for _ in 0..30 {
            let seq = hmm.generate(10, &mut rng).unwrap().sequence;
            hmm.learn(&seq, 0.1, 10).unwrap();
        }

        let mut entropy_distribution = HashMap::new();
        entropy_distribution.insert(2u64, vec![0.1, 0.2, 0.3, 0.4]);
        entropy_distribution.insert(3u64, vec![1.0, 2.0]);

        let model = Model {
            query_max_length: 63,
            max_length_penalty: 0.4,
            bins: 4,
            entropy_distribution,
            hmm,
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        model.save(&path).unwrap();
        let loaded = Model::load(&path).unwrap();

        assert_eq!(loaded.query_max_length, model.query_max_length);
        assert!((loaded.max_length_penalty - model.max_length_penalty).abs() < 1e-12);
        assert_eq!(loaded.bins, model.bins);
        assert_eq!(
            loaded.entropy_distribution.get(&2).unwrap(),
            model.entropy_distribution.get(&2).unwrap()
        );
        assert!(model.hmm.approx_equal(&loaded.hmm, 1e-6));
    }

    #[test]
    fn rejects_files_without_the_magic_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.bin");
        std::fs::write(&path, b"not a model").unwrap();
        let err = Model::load(&path).unwrap_err();
        assert!(matches!(err, FirewallError::Parse(_)));
    }
}
