// SPDX-License-Identifier: MIT OR Apache-2.0

//! Combinatorial sampling of joint interventions.
//!
//! With `k` intervention points and `m` ablation types per point there are
//! `m^k` joint assignments. Each one is identified by an integer in
//! `[0, m^k)` read as a `k`-digit base-`m` number, most significant digit
//! first; [`assignment_for_index`] is that bijection. A
//! [`CombinatorialSampler`] enumerates every index when the space fits the
//! budget and otherwise draws `budget` distinct indices from a seeded RNG,
//! so any single assignment can be recomputed from its index alone.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::circuit::is_qkv_granularity_hook;
use crate::config::Granularity;
use crate::error::{IiaError, Result};

/// Hook substrings selecting joint intervention points when no filter is given.
pub const DEFAULT_HOOK_FILTERS: [&str; 4] =
    ["hook_embed", "hook_pos_embed", "hook_attn_out", "hook_mlp_out"];

// ---------------------------------------------------------------------------
// Bijection
// ---------------------------------------------------------------------------

/// Size of the joint space `m^k`, `None` if it exceeds `u128`.
#[must_use]
pub fn space_size(k: usize, m: usize) -> Option<u128> {
    let k = u32::try_from(k).ok()?;
    u128::try_from(m).ok()?.checked_pow(k)
}

/// Decode `index` into `k` choices in `[0, m)`, most significant first.
///
/// ```
/// use candle_iia::sampler::assignment_for_index;
///
/// // 5 = 0*9 + 1*3 + 2 in base 3
/// assert_eq!(assignment_for_index(5, 3, 3).unwrap(), vec![0, 1, 2]);
/// // Small indices are left-padded with the first choice.
/// assert_eq!(assignment_for_index(0, 3, 3).unwrap(), vec![0, 0, 0]);
/// ```
///
/// # Errors
///
/// Returns [`IiaError::Config`] if `m` is zero or `index >= m^k`.
pub fn assignment_for_index(index: u128, k: usize, m: usize) -> Result<Vec<usize>> {
    if m == 0 {
        return Err(IiaError::Config("no ablation types to choose from".into()));
    }
    if space_size(k, m).is_some_and(|total| index >= total) {
        return Err(IiaError::Config(format!(
            "assignment index {index} out of range for {m}^{k}"
        )));
    }
    let base = u128::try_from(m).map_err(|_| IiaError::Config(format!("{m} choices overflow")))?;
    let mut digits = vec![0_usize; k];
    let mut rest = index;
    for digit in digits.iter_mut().rev() {
        // rest % base < m, so the conversion is lossless
        *digit = usize::try_from(rest % base).unwrap_or_default();
        rest /= base;
    }
    Ok(digits)
}

// ---------------------------------------------------------------------------
// CombinatorialSampler
// ---------------------------------------------------------------------------

/// Enumerates or samples joint assignments within a budget.
///
/// ```
/// use candle_iia::sampler::CombinatorialSampler;
///
/// let all = CombinatorialSampler::new(2, 3, 100, 0).assignments().unwrap();
/// assert_eq!(all.len(), 9);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CombinatorialSampler {
    /// Number of intervention points.
    k: usize,
    /// Choices per point.
    m: usize,
    /// Maximum number of assignments returned.
    budget: usize,
    /// RNG seed for undersampling.
    seed: u64,
}

impl CombinatorialSampler {
    /// Create a sampler over `m^k` assignments.
    #[must_use]
    pub const fn new(k: usize, m: usize, budget: usize, seed: u64) -> Self {
        Self { k, m, budget, seed }
    }

    /// Whether every assignment fits the budget.
    #[must_use]
    pub fn is_exhaustive(&self) -> bool {
        space_size(self.k, self.m)
            .is_some_and(|total| total <= u128::try_from(self.budget).unwrap_or(u128::MAX))
    }

    /// Distinct assignment indices: all of `[0, m^k)` in order when
    /// exhaustive, else `budget` seeded draws without replacement.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Config`] if `m` is zero or `m^k` does not fit in
    /// `u128` (use [`assignments`](Self::assignments) for such spaces).
    pub fn indices(&self) -> Result<Vec<u128>> {
        if self.m == 0 {
            return Err(IiaError::Config("no ablation types to choose from".into()));
        }
        let total = space_size(self.k, self.m).ok_or_else(|| {
            IiaError::Config(format!("{}^{} assignments overflow u128", self.m, self.k))
        })?;
        if self.is_exhaustive() {
            return Ok((0..total).collect());
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        if let Ok(length) = usize::try_from(total) {
            return Ok(rand::seq::index::sample(&mut rng, length, self.budget)
                .into_iter()
                .filter_map(|i| u128::try_from(i).ok())
                .collect());
        }

        // Sparse draws from a space far larger than the budget.
        let mut seen = HashSet::with_capacity(self.budget);
        let mut out = Vec::with_capacity(self.budget);
        while out.len() < self.budget {
            let index = rng.gen_range(0..total);
            if seen.insert(index) {
                out.push(index);
            }
        }
        Ok(out)
    }

    /// Distinct joint assignments, each a length-`k` vector of choices.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Config`] if `m` is zero.
    pub fn assignments(&self) -> Result<Vec<Vec<usize>>> {
        if space_size(self.k, self.m).is_some() {
            return self
                .indices()?
                .into_iter()
                .map(|i| assignment_for_index(i, self.k, self.m))
                .collect();
        }

        // m^k beyond u128: draw digit vectors directly, rejecting repeats.
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut seen = HashSet::with_capacity(self.budget);
        let mut out = Vec::with_capacity(self.budget);
        while out.len() < self.budget {
            let candidate: Vec<usize> = (0..self.k).map(|_| rng.gen_range(0..self.m)).collect();
            if seen.insert(candidate.clone()) {
                out.push(candidate);
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Eligibility
// ---------------------------------------------------------------------------

/// Joint intervention points among `hook_names`, in input order.
///
/// Drops MLP inputs, drops query/key/value hooks unless `granularity` is
/// [`Granularity::Qkv`], and keeps only hooks containing one of `filters`
/// ([`DEFAULT_HOOK_FILTERS`] when `None`).
#[must_use]
pub fn eligible_hooks<I, S>(hook_names: I, granularity: Granularity, filters: Option<&[String]>) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let matches_filter = |name: &str| match filters {
        Some(filters) => filters.iter().any(|f| name.contains(f.as_str())),
        None => DEFAULT_HOOK_FILTERS.iter().any(|f| name.contains(f)),
    };
    hook_names
        .into_iter()
        .map(|s| s.as_ref().to_string())
        .filter(|name| !name.contains("mlp_in"))
        .filter(|name| granularity == Granularity::Qkv || !is_qkv_granularity_hook(name))
        .filter(|name| matches_filter(name))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn exhaustive_covers_every_assignment_once() {
        let sampler = CombinatorialSampler::new(3, 3, 27, 0);
        assert!(sampler.is_exhaustive());
        let all = sampler.assignments().unwrap();
        assert_eq!(all.len(), 27);
        let distinct: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(distinct.len(), 27);
    }

    #[test]
    fn budgeted_sampling_is_distinct_and_reproducible() {
        let first = CombinatorialSampler::new(3, 3, 5, 42).assignments().unwrap();
        let second = CombinatorialSampler::new(3, 3, 5, 42).assignments().unwrap();
        assert_eq!(first.len(), 5);
        assert_eq!(first, second);
        let distinct: HashSet<_> = first.iter().cloned().collect();
        assert_eq!(distinct.len(), 5);
    }

    #[test]
    fn bijection_roundtrips_through_digits() {
        for index in 0..81_u128 {
            let digits = assignment_for_index(index, 4, 3).unwrap();
            let back = digits.iter().fold(0_u128, |acc, &d| acc * 3 + u128::try_from(d).unwrap());
            assert_eq!(back, index);
        }
        assert!(assignment_for_index(81, 4, 3).is_err());
        assert!(assignment_for_index(0, 4, 0).is_err());
    }

    #[test]
    fn huge_spaces_still_sample() {
        let sampler = CombinatorialSampler::new(200, 3, 10, 7);
        assert!(!sampler.is_exhaustive());
        let drawn = sampler.assignments().unwrap();
        assert_eq!(drawn.len(), 10);
        assert!(drawn.iter().all(|a| a.len() == 200 && a.iter().all(|&d| d < 3)));
    }

    #[test]
    fn mlp_in_never_eligible() {
        let names = [
            "hook_embed",
            "blocks.0.hook_mlp_in",
            "blocks.0.hook_mlp_out",
            "blocks.0.hook_attn_out",
            "blocks.0.attn.hook_q",
        ];
        let all: Vec<String> = vec!["hook".to_string()];
        for granularity in [Granularity::Head, Granularity::Qkv] {
            for filters in [None, Some(all.as_slice())] {
                let eligible = eligible_hooks(names, granularity, filters);
                assert!(eligible.iter().all(|n| !n.contains("mlp_in")));
            }
        }
        let default = eligible_hooks(names, Granularity::Head, None);
        assert_eq!(
            default,
            vec!["hook_embed", "blocks.0.hook_mlp_out", "blocks.0.hook_attn_out"]
        );
        let qkv = eligible_hooks(names, Granularity::Qkv, Some(all.as_slice()));
        assert!(qkv.contains(&"blocks.0.attn.hook_q".to_string()));
    }
}
