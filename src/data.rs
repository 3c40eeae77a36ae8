// SPDX-License-Identifier: MIT OR Apache-2.0

//! Evaluation data: paired inputs and ground-truth outputs.
//!
//! Inputs are token-ID sequences whose first position is the
//! beginning-of-sequence marker; ground truths carry one value per position
//! (class index for categorical programs, the value itself otherwise).
//! [`unique_data`] bounds an input set without repeating a sequence.

use std::collections::HashSet;

use candle_core::{Device, Tensor};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::error::{IiaError, Result};

// ---------------------------------------------------------------------------
// Example
// ---------------------------------------------------------------------------

/// One input sequence with its ground-truth output.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    /// Token IDs, position 0 is the beginning-of-sequence marker.
    pub input: Vec<u32>,
    /// Ground truth per position.
    pub output: Vec<f32>,
}

impl Example {
    /// Create an example.
    #[must_use]
    pub const fn new(input: Vec<u32>, output: Vec<f32>) -> Self {
        Self { input, output }
    }

    /// Identity key used for deduplication: the comma-joined input.
    #[must_use]
    pub fn key(&self) -> String {
        self.input
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

// ---------------------------------------------------------------------------
// CaseDataset
// ---------------------------------------------------------------------------

/// A batch of examples as tensors.
#[derive(Debug, Clone)]
pub struct CaseDataset {
    /// Token IDs: `[n, seq]`, `u32`.
    inputs: Tensor,
    /// Ground truths: `[n, seq]`, `f32`.
    correct_outputs: Tensor,
}

impl CaseDataset {
    /// Stack examples into tensors.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::DataMismatch`] if there are no examples, or if
    /// sequences differ in length or disagree with their outputs.
    pub fn from_examples(examples: &[Example], device: &Device) -> Result<Self> {
        let Some(first) = examples.first() else {
            return Err(IiaError::DataMismatch("no examples".into()));
        };
        let seq = first.input.len();
        let mut ids = Vec::with_capacity(examples.len() * seq);
        let mut outs = Vec::with_capacity(examples.len() * seq);
        for (i, ex) in examples.iter().enumerate() {
            if ex.input.len() != seq || ex.output.len() != seq {
                return Err(IiaError::DataMismatch(format!(
                    "example {i} has input length {} and output length {}, expected {seq}",
                    ex.input.len(),
                    ex.output.len()
                )));
            }
            ids.extend_from_slice(&ex.input);
            outs.extend_from_slice(&ex.output);
        }
        let n = examples.len();
        Ok(Self {
            inputs: Tensor::from_vec(ids, (n, seq), device)?,
            correct_outputs: Tensor::from_vec(outs, (n, seq), device)?,
        })
    }

    /// Token IDs: `[n, seq]`.
    #[must_use]
    pub const fn inputs(&self) -> &Tensor {
        &self.inputs
    }

    /// Ground truths: `[n, seq]`.
    #[must_use]
    pub const fn correct_outputs(&self) -> &Tensor {
        &self.correct_outputs
    }

    /// Number of examples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inputs.dims().first().copied().unwrap_or(0)
    }

    /// Whether the dataset is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check that clean and corrupted batches can be paired.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::DataMismatch`] if counts differ or, when
    /// `require_distinct` is set, the two input batches are identical.
    pub fn check_pair(clean: &Self, corrupted: &Self, require_distinct: bool) -> Result<()> {
        if clean.len() != corrupted.len() {
            return Err(IiaError::DataMismatch(format!(
                "clean has {} examples, corrupted has {}",
                clean.len(),
                corrupted.len()
            )));
        }
        if clean.inputs.dims() != corrupted.inputs.dims() {
            return Err(IiaError::DataMismatch(format!(
                "clean inputs {:?} and corrupted inputs {:?} differ in shape",
                clean.inputs.dims(),
                corrupted.inputs.dims()
            )));
        }
        if require_distinct {
            let differing = clean
                .inputs
                .ne(&corrupted.inputs)?
                .to_dtype(candle_core::DType::U32)?
                .sum_all()?
                .to_scalar::<u32>()?;
            if differing == 0 {
                return Err(IiaError::DataMismatch(
                    "clean and corrupted inputs are identical".into(),
                ));
            }
        }
        Ok(())
    }

    /// Per example, whether clean and corrupted ground truths differ after
    /// the first position.
    ///
    /// Categorical values compare exactly; continuous values differ when
    /// some entry is further apart than `atol`.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::DataMismatch`] if shapes differ.
    pub fn outputs_differ(clean: &Self, corrupted: &Self, categorical: bool, atol: f64) -> Result<Vec<bool>> {
        if clean.correct_outputs.dims() != corrupted.correct_outputs.dims() {
            return Err(IiaError::DataMismatch(
                "clean and corrupted outputs differ in shape".into(),
            ));
        }
        let a = clean.correct_outputs.to_vec2::<f32>()?;
        let b = corrupted.correct_outputs.to_vec2::<f32>()?;
        Ok(a.iter()
            .zip(&b)
            .map(|(ra, rb)| {
                ra.iter().zip(rb).skip(1).any(|(x, y)| {
                    if categorical {
                        x != y
                    } else {
                        f64::from((x - y).abs()) > atol
                    }
                })
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Input generation
// ---------------------------------------------------------------------------

/// Source of program inputs with their ground truths.
pub trait InputGenerator {
    /// Draw `count` examples (duplicates allowed).
    fn generate(&self, count: usize, rng: &mut StdRng) -> Vec<Example>;

    /// Every distinct example in the input space.
    fn all_examples(&self) -> Vec<Example>;

    /// Number of distinct inputs.
    fn input_space_size(&self) -> u128;
}

/// `sum(vocab^l for l in min_len..=max_len)`, saturating at `u128::MAX`.
///
/// ```
/// use candle_iia::data::total_input_space;
///
/// assert_eq!(total_input_space(3, 1, 2), 3 + 9);
/// ```
#[must_use]
pub fn total_input_space(vocab: usize, min_len: usize, max_len: usize) -> u128 {
    let vocab = u128::try_from(vocab).unwrap_or(u128::MAX);
    (min_len..=max_len).fold(0_u128, |acc, l| {
        let term = u32::try_from(l)
            .ok()
            .and_then(|l| vocab.checked_pow(l))
            .unwrap_or(u128::MAX);
        acc.saturating_add(term)
    })
}

/// At most `max_len` examples with pairwise distinct inputs.
///
/// Returns every example when the input space is smaller than `max_len`.
/// Otherwise draws `3 * max_len` examples, keeps the first occurrence of
/// each input, and downsamples to exactly `max_len` without replacement.
/// Each input stays paired with its own output.
#[must_use]
pub fn unique_data(generator: &dyn InputGenerator, max_len: usize, seed: u64) -> Vec<Example> {
    let total = generator.input_space_size();
    if total < u128::try_from(max_len).unwrap_or(u128::MAX) {
        return dedupe(generator.all_examples());
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let unique = dedupe(generator.generate(max_len.saturating_mul(3), &mut rng));
    if unique.len() <= max_len {
        return unique;
    }
    let mut keep = rand::seq::index::sample(&mut rng, unique.len(), max_len).into_vec();
    keep.sort_unstable();
    keep.into_iter()
        .filter_map(|i| unique.get(i).cloned())
        .collect()
}

/// Keep the first occurrence of each input.
fn dedupe(examples: Vec<Example>) -> Vec<Example> {
    let mut seen = HashSet::with_capacity(examples.len());
    examples
        .into_iter()
        .filter(|ex| seen.insert(ex.key()))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rand::Rng;

    use super::*;

    /// Three digits after a BOS token; output is the running digit sum.
    struct Digits;

    impl Digits {
        fn example(digits: [u32; 3]) -> Example {
            let mut input = vec![10];
            input.extend(digits);
            let mut output = vec![0.0];
            let mut acc = 0.0;
            for d in digits {
                acc += f32::from(u8::try_from(d).unwrap());
                output.push(acc);
            }
            Example::new(input, output)
        }
    }

    impl InputGenerator for Digits {
        fn generate(&self, count: usize, rng: &mut StdRng) -> Vec<Example> {
            (0..count)
                .map(|_| Self::example([rng.gen_range(0..10), rng.gen_range(0..10), rng.gen_range(0..10)]))
                .collect()
        }

        fn all_examples(&self) -> Vec<Example> {
            let mut out = Vec::new();
            for a in 0..10 {
                for b in 0..10 {
                    for c in 0..10 {
                        out.push(Self::example([a, b, c]));
                    }
                }
            }
            out
        }

        fn input_space_size(&self) -> u128 {
            total_input_space(10, 3, 3)
        }
    }

    #[test]
    fn unique_data_caps_and_keeps_pairs() {
        let data = unique_data(&Digits, 100, 0);
        assert_eq!(data.len(), 100);
        let keys: HashSet<String> = data.iter().map(Example::key).collect();
        assert_eq!(keys.len(), 100);
        for ex in &data {
            let digits: [u32; 3] = ex.input[1..].try_into().unwrap();
            assert_eq!(*ex, Digits::example(digits));
        }
    }

    #[test]
    fn small_space_returns_everything() {
        let data = unique_data(&Digits, 5_000, 0);
        assert_eq!(data.len(), 1000);
    }

    #[test]
    fn unique_data_is_seeded() {
        assert_eq!(unique_data(&Digits, 50, 9), unique_data(&Digits, 50, 9));
    }

    #[test]
    fn dataset_shapes_and_pair_checks() {
        let examples = Digits.all_examples();
        let clean = CaseDataset::from_examples(&examples[..4], &Device::Cpu).unwrap();
        let corrupted = CaseDataset::from_examples(&examples[4..8], &Device::Cpu).unwrap();
        assert_eq!(clean.len(), 4);
        assert_eq!(clean.inputs().dims(), &[4, 4]);
        CaseDataset::check_pair(&clean, &corrupted, true).unwrap();

        let err = CaseDataset::check_pair(&clean, &clean, true).unwrap_err();
        assert!(matches!(err, IiaError::DataMismatch(_)));

        let short = CaseDataset::from_examples(&examples[..3], &Device::Cpu).unwrap();
        assert!(CaseDataset::check_pair(&clean, &short, false).is_err());
    }

    #[test]
    fn outputs_differ_ignores_first_position() {
        let mut a = Digits::example([1, 2, 3]);
        let b = Digits::example([1, 2, 3]);
        a.output[0] = 99.0;
        let clean = CaseDataset::from_examples(&[a, Digits::example([0, 0, 0])], &Device::Cpu).unwrap();
        let corrupted =
            CaseDataset::from_examples(&[b, Digits::example([0, 0, 1])], &Device::Cpu).unwrap();
        let differ = CaseDataset::outputs_differ(&clean, &corrupted, false, 1e-6).unwrap();
        assert_eq!(differ, vec![false, true]);
    }

    #[test]
    fn input_space_saturates() {
        assert_eq!(total_input_space(1_000, 0, 100), u128::MAX);
    }
}
