//! Discrete hidden Markov model over characters.
//!
//! Specialized to `(char, String)`, no generic `E`/`S` type parameters.

use std::io::{Read, Write};

use ndarray::Array2;
use rand::Rng;

use crate::error::{FirewallError, Result};

/// One Viterbi decoding result.
#[derive(Debug, Clone)]
pub struct Path {
    pub states: Vec<usize>,
    pub sequence: String,
    pub prob: f64,
}

/// A discrete HMM over a fixed character alphabet, trained by Viterbi-path
/// minibatch accumulation.
#[derive(Debug, Clone)]
pub struct Hmm {
    current_state: usize,
    alphabet: Vec<char>,
    n_states: usize,
    initial: Array2<f64>,
    transitions: Array2<f64>,
    emissions: Array2<f64>,
    initial_acc: Array2<f64>,
    transitions_acc: Array2<f64>,
    emissions_acc: Array2<f64>,
    processed: u64,
    learning_buffer: Vec<String>,
}

const LEARN_PARALLEL_SLICES: usize = 8;

impl Hmm {
    /// Default-constructed HMM with no states and an empty alphabet.
    /// Only useful as the target of `read_binary`.
    pub fn empty() -> Self {
        Self {
            current_state: 0,
            alphabet: Vec::new(),
            n_states: 0,
            initial: Array2::zeros((1, 0)),
            transitions: Array2::zeros((0, 0)),
            emissions: Array2::zeros((0, 0)),
            initial_acc: Array2::zeros((1, 0)),
            transitions_acc: Array2::zeros((0, 0)),
            emissions_acc: Array2::zeros((0, 0)),
            processed: 0,
            learning_buffer: Vec::new(),
        }
    }

    /// Uniform-random row-stochastic HMM over `n_states` states and the
    /// given alphabet.
    pub fn random<R: Rng + ?Sized>(n_states: usize, alphabet: &[char], rng: &mut R) -> Self {
        let m = alphabet.len();
        let mut initial = Array2::from_shape_fn((1, n_states), |_| rng.gen::<f64>());
        let mut transitions = Array2::from_shape_fn((n_states, n_states), |_| rng.gen::<f64>());
        let mut emissions = Array2::from_shape_fn((n_states, m), |_| rng.gen::<f64>());
        normalize_rows(&mut initial);
        normalize_rows(&mut transitions);
        normalize_rows(&mut emissions);
        let current_state = sample_row(&initial, 0, rng);

        Self {
            current_state,
            alphabet: alphabet.to_vec(),
            n_states,
            initial_acc: Array2::zeros((1, n_states)),
            transitions_acc: Array2::zeros((n_states, n_states)),
            emissions_acc: Array2::zeros((n_states, m)),
            initial,
            transitions,
            emissions,
            processed: 0,
            learning_buffer: Vec::new(),
        }
    }

    /// Construct from explicit matrices, scaling each row to sum to 1.
    /// Fails with `ShapeMismatch` if the four dimensions are inconsistent.
    pub fn with_matrices(
        mut transitions: Array2<f64>,
        mut emissions: Array2<f64>,
        mut initial: Array2<f64>,
        alphabet: Vec<char>,
    ) -> Result<Self> {
        let n_states = transitions.nrows();
        let valid = initial.ncols() == transitions.ncols()
            && transitions.nrows() == transitions.ncols()
            && transitions.nrows() == emissions.nrows()
            && emissions.ncols() == alphabet.len();
        if !valid {
            return Err(FirewallError::ShapeMismatch {
                detail: format!(
                    "transitions {:?}, emissions {:?}, initial {:?}, alphabet {}",
                    transitions.dim(),
                    emissions.dim(),
                    initial.dim(),
                    alphabet.len()
                ),
            });
        }

        normalize_rows(&mut transitions);
        normalize_rows(&mut emissions);
        normalize_rows(&mut initial);
        let m = alphabet.len();

        Ok(Self {
            current_state: 0,
            alphabet,
            n_states,
            initial_acc: Array2::zeros((1, n_states)),
            transitions_acc: Array2::zeros((n_states, n_states)),
            emissions_acc: Array2::zeros((n_states, m)),
            initial,
            transitions,
            emissions,
            processed: 0,
            learning_buffer: Vec::new(),
        })
    }

    pub fn alphabet(&self) -> &[char] {
        &self.alphabet
    }

    pub fn n_states(&self) -> usize {
        self.n_states
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    fn out_index(&self, e: char) -> Result<usize> {
        self.alphabet
            .iter()
            .position(|&c| c == e)
            .ok_or(FirewallError::AlphabetMismatch(e))
    }

    /// Sample the next state and character from the current state's
    /// distributions, advancing `current_state`. Returns the character and
    /// `log10(p_trans) + log10(p_emit)`.
    pub fn next_step<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<(char, f64)> {
        if self.alphabet.is_empty() || self.n_states == 0 {
            return Err(FirewallError::EmptyAlphabet);
        }
        let new_state = sample_row(&self.transitions, self.current_state, rng);
        let p_trans = self.transitions[[self.current_state, new_state]];
        let out_idx = sample_row(&self.emissions, self.current_state, rng);
        let p_emit = self.emissions[[self.current_state, out_idx]];
        let out_char = self.alphabet[out_idx];
        self.current_state = new_state;
        Ok((out_char, p_trans.log10() + p_emit.log10()))
    }

    fn reseed_from_initial<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        if self.n_states == 0 {
            return Err(FirewallError::EmptyAlphabet);
        }
        self.current_state = sample_row(&self.initial, 0, rng);
        Ok(())
    }

    /// Generate a random sequence of the given length.
    pub fn generate<R: Rng + ?Sized>(&mut self, length: usize, rng: &mut R) -> Result<Path> {
        self.reseed_from_initial(rng)?;
        let mut path = Path {
            states: Vec::with_capacity(length),
            sequence: String::with_capacity(length),
            prob: 0.0,
        };
        for _ in 0..length {
            path.states.push(self.current_state);
            let (c, p) = self.next_step(rng)?;
            path.sequence.push(c);
            path.prob += p;
        }
        Ok(path)
    }

    /// Generate a random sequence, terminating once `end_char` is emitted.
    pub fn generate_until<R: Rng + ?Sized>(&mut self, end_char: char, rng: &mut R) -> Result<Path> {
        self.reseed_from_initial(rng)?;
        let mut path = Path {
            states: Vec::new(),
            sequence: String::new(),
            prob: 0.0,
        };
        loop {
            path.states.push(self.current_state);
            let (c, p) = self.next_step(rng)?;
            path.sequence.push(c);
            path.prob += p;
            if c == end_char {
                break;
            }
        }
        Ok(path)
    }

    /// Viterbi-decode the most likely state path for `sequence`.
    pub fn find_viterbi_path(&self, sequence: &str) -> Result<Path> {
        if self.n_states == 0 {
            return Err(FirewallError::EmptyAlphabet);
        }
        let chars: Vec<char> = sequence.chars().collect();
        let len = chars.len();
        let indices: Vec<usize> = chars
            .iter()
            .map(|&c| self.out_index(c))
            .collect::<Result<_>>()?;

        let mut t1 = Array2::<f64>::zeros((self.n_states, len));
        let mut t2 = Array2::<usize>::zeros((self.n_states, len));

        for t in 0..len {
            for i in 0..self.n_states {
                if t == 0 {
                    t1[[i, t]] = self.initial[[0, i]] * self.emissions[[i, indices[0]]];
                    t2[[i, t]] = 0;
                } else {
                    let mut valmax = 0.0f64;
                    let mut argmax = 0usize;
                    for k in 0..self.n_states {
                        let val =
                            t1[[k, t - 1]] * self.transitions[[k, i]] * self.emissions[[i, indices[t]]];
                        if val > valmax {
                            valmax = val;
                            argmax = k;
                        }
                    }
                    t1[[i, t]] = valmax;
                    t2[[i, t]] = argmax;
                }
            }
        }

        let mut z = vec![0usize; len];
        if len > 0 {
            let last = len - 1;
            let mut zmax = 0.0f64;
            let mut zargmax = 0usize;
            for k in 0..self.n_states {
                if t1[[k, last]] > zmax {
                    zmax = t1[[k, last]];
                    zargmax = k;
                }
            }
            z[last] = zargmax;
            for t in (0..last).rev() {
                z[t] = t2[[z[t + 1], t + 1]];
            }
        }

        let mut prob = 0.0;
        for t in 0..len {
            if t == 0 {
                prob = self.initial[[0, z[0]]].log10() + self.emissions[[z[0], indices[0]]].log10();
            } else {
                prob += self.emissions[[z[t], indices[t]]].log10()
                    + self.transitions[[z[t - 1], z[t]]].log10();
            }
        }

        Ok(Path {
            states: z,
            sequence: sequence.to_string(),
            prob,
        })
    }

    fn accumulate(&mut self, path: &Path) -> Result<()> {
        for i in 0..path.states.len().saturating_sub(1) {
            self.transitions_acc[[path.states[i], path.states[i + 1]]] += 1.0;
        }
        for (i, c) in path.sequence.chars().enumerate() {
            let idx = self.out_index(c)?;
            self.emissions_acc[[path.states[i], idx]] += 1.0;
        }
        if let Some(&s0) = path.states.first() {
            self.initial_acc[[0, s0]] += 1.0;
        }
        Ok(())
    }

    /// Viterbi-train on one sequence: accumulate its path into the
    /// minibatch accumulators, then apply `update` once `batch_size`
    /// sequences have been processed since the last update.
    pub fn learn(&mut self, sequence: &str, rate: f64, batch_size: u64) -> Result<()> {
        let path = self.find_viterbi_path(sequence)?;
        self.accumulate(&path)?;
        self.processed += 1;
        if batch_size > 0 && self.processed % batch_size == 0 {
            self.update(rate);
        }
        Ok(())
    }

    /// Buffer `sequence` for parallel minibatch training; once `batch_size`
    /// sequences are queued, Viterbi-decode them concurrently and apply
    /// the accumulation serially.
    pub fn learn_parallel(&mut self, sequence: &str, rate: f64, batch_size: u64) -> Result<()> {
        self.learning_buffer.push(sequence.to_string());
        if self.learning_buffer.len() as u64 != batch_size {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.learning_buffer);

        use rayon::prelude::*;
        let chunk = (batch.len() / LEARN_PARALLEL_SLICES).max(1);
        let paths: Vec<Result<Path>> = batch
            .par_chunks(chunk)
            .flat_map(|slice| slice.par_iter().map(|s| self.find_viterbi_path(s)).collect::<Vec<_>>())
            .collect();

        for path in paths {
            let path = path?;
            self.accumulate(&path)?;
            self.processed += 1;
            if batch_size > 0 && self.processed % batch_size == 0 {
                self.update(rate);
            }
        }
        Ok(())
    }

    /// Apply accumulated counts to the live matrices, renormalize, and
    /// zero the accumulators.
    pub fn update(&mut self, rate: f64) {
        self.transitions.scaled_add(rate, &self.transitions_acc);
        self.emissions.scaled_add(rate, &self.emissions_acc);
        self.initial.scaled_add(rate, &self.initial_acc);
        normalize_rows(&mut self.transitions);
        normalize_rows(&mut self.emissions);
        normalize_rows(&mut self.initial);
        self.transitions_acc.fill(0.0);
        self.emissions_acc.fill(0.0);
        self.initial_acc.fill(0.0);
    }

    pub fn approx_equal(&self, other: &Hmm, tol: f64) -> bool {
        self.current_state == other.current_state
            && self.alphabet == other.alphabet
            && self.processed == other.processed
            && mats_close(&self.initial, &other.initial, tol)
            && mats_close(&self.initial_acc, &other.initial_acc, tol)
            && mats_close(&self.transitions, &other.transitions, tol)
            && mats_close(&self.transitions_acc, &other.transitions_acc, tol)
            && mats_close(&self.emissions, &other.emissions, tol)
            && mats_close(&self.emissions_acc, &other.emissions_acc, tol)
    }

    // --- binary serialization ---

    pub fn write_binary<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&(self.current_state as u32).to_le_bytes())?;
        write_matrix(w, &self.initial)?;
        write_matrix(w, &self.initial_acc)?;
        write_matrix(w, &self.transitions)?;
        write_matrix(w, &self.transitions_acc)?;
        write_matrix(w, &self.emissions)?;
        write_matrix(w, &self.emissions_acc)?;

        w.write_all(&(self.alphabet.len() as u32).to_le_bytes())?;
        for &c in &self.alphabet {
            w.write_all(&[c as u8])?;
        }

        w.write_all(&(self.processed as u32).to_le_bytes())?;

        w.write_all(&(self.learning_buffer.len() as u32).to_le_bytes())?;
        for s in &self.learning_buffer {
            w.write_all(&(s.len() as u32).to_le_bytes())?;
            w.write_all(s.as_bytes())?;
        }
        Ok(())
    }

    pub fn read_binary<R: Read>(r: &mut R) -> Result<Self> {
        let current_state = read_u32(r)? as usize;
        let initial = read_matrix(r)?;
        let initial_acc = read_matrix(r)?;
        let transitions = read_matrix(r)?;
        let transitions_acc = read_matrix(r)?;
        let emissions = read_matrix(r)?;
        let emissions_acc = read_matrix(r)?;

        let alphabet_len = read_u32(r)? as usize;
        let mut alphabet = Vec::with_capacity(alphabet_len);
        for _ in 0..alphabet_len {
            let mut byte = [0u8; 1];
            r.read_exact(&mut byte)?;
            alphabet.push(byte[0] as char);
        }

        let processed = read_u32(r)? as u64;

        let buffer_len = read_u32(r)? as usize;
        let mut learning_buffer = Vec::with_capacity(buffer_len);
        for _ in 0..buffer_len {
            let len = read_u32(r)? as usize;
            let mut buf = vec![0u8; len];
            r.read_exact(&mut buf)?;
            learning_buffer.push(String::from_utf8_lossy(&buf).into_owned());
        }

        let n_states = transitions.nrows();
        Ok(Self {
            current_state,
            alphabet,
            n_states,
            initial,
            initial_acc,
            transitions,
            transitions_acc,
            emissions,
            emissions_acc,
            processed,
            learning_buffer,
        })
    }
}

fn normalize_rows(mat: &mut Array2<f64>) {
    for mut row in mat.rows_mut() {
        let sum: f64 = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|v| v / sum);
        }
    }
}

fn sample_row<R: Rng + ?Sized>(mat: &Array2<f64>, row: usize, rng: &mut R) -> usize {
    let n = mat.ncols();
    let mut seed: f64 = rng.gen();
    for i in 0..n {
        let p = mat[[row, i]];
        if seed < p {
            return i;
        }
        seed -= p;
    }
    n.saturating_sub(1)
}

fn mats_close(a: &Array2<f64>, b: &Array2<f64>, tol: f64) -> bool {
    a.dim() == b.dim() && a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() <= tol)
}

fn write_matrix<W: Write>(w: &mut W, m: &Array2<f64>) -> Result<()> {
    w.write_all(&(m.nrows() as u32).to_le_bytes())?;
    w.write_all(&(m.ncols() as u32).to_le_bytes())?;
    for v in m.iter() {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

fn read_matrix<R: Read>(r: &mut R) -> Result<Array2<f64>> {
    let rows = read_u32(r)? as usize;
    let cols = read_u32(r)? as usize;
    let mut data = Vec::with_capacity(rows * cols);
    for _ in 0..rows * cols {
        let mut buf = [0u8; 8];
        r.read_exact(&mut buf)?;
        data.push(f64::from_le_bytes(buf));
    }
    Array2::from_shape_vec((rows, cols), data)
        .map_err(|e| FirewallError::ShapeMismatch { detail: e.to_string() })
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

    fn alphabet() -> Vec<char> {
        vec!['a', 'b', 'c', 'd', 'e']
    }

    #[test]
    fn rows_sum_to_one_after_update() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut hmm = Hmm::random(4, &alphabet(), &mut rng);
        for _ in 0..20 {
            let seq = hmm.generate(8, &mut rng).unwrap().sequence;
            hmm.learn(&seq, 0.1, 5).unwrap();
        }
        hmm.update(0.1);
        for row in hmm.transitions.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
        }
        for row in hmm.emissions.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
        }
        assert!((hmm.initial.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn viterbi_single_char_sequence() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let hmm = Hmm::random(3, &alphabet(), &mut rng);
        let path = hmm.find_viterbi_path("a").unwrap();
        assert_eq!(path.states.len(), 1);
        let z0 = path.states[0];
        let expected = hmm.initial[[0, z0]].log10() + hmm.emissions[[z0, 0]].log10();
        assert!((path.prob - expected).abs() < 1e-9);
    }

    #[test]
    fn alphabet_mismatch_is_reported() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let hmm = Hmm::random(2, &alphabet(), &mut rng);
        let err = hmm.find_viterbi_path("z").unwrap_err();
        assert!(matches!(err, FirewallError::AlphabetMismatch('z')));
    }

    #[test]
    fn round_trips_through_binary_serialization() {
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        let mut hmm = Hmm::random(4, &alphabet(), &mut rng);
        for _ in 0..50 {
            let seq = hmm.generate(6, &mut rng).unwrap().sequence;
            hmm.learn(&seq, 0.2, 10).unwrap();
        }

        let mut bytes = Vec::new();
        hmm.write_binary(&mut bytes).unwrap();
        let loaded = Hmm::read_binary(&mut &bytes[..]).unwrap();

        assert!(hmm.approx_equal(&loaded, 1e-6));
        for _ in 0..20 {
            let seq = hmm.generate(5, &mut rng).unwrap().sequence;
            let a = hmm.find_viterbi_path(&seq);
            let b = loaded.find_viterbi_path(&seq);
            match (a, b) {
                (Ok(pa), Ok(pb)) => {
                    assert_eq!(pa.states, pb.states);
                    assert!((pa.prob - pb.prob).abs() < 1e-9);
                }
                _ => {}
            }
        }
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let transitions = Array2::zeros((2, 2));
        let emissions = Array2::zeros((3, 5));
        let initial = Array2::zeros((1, 2));
        let err = Hmm::with_matrices(transitions, emissions, initial, alphabet()).unwrap_err();
        assert!(matches!(err, FirewallError::ShapeMismatch { .. }));
    }
}
