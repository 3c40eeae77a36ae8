// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ablation semantics and patch construction.
//!
//! An ablation replaces the activation at one location with a value derived
//! from pre-captured caches:
//!
//! | Type | Replacement |
//! |---|---|
//! | [`Zero`](AblationType::Zero) | all-zero tensor of the clean activation's shape |
//! | [`Mean`](AblationType::Mean) | clean activation averaged over the batch, broadcast back |
//! | [`Resample`](AblationType::Resample) | corrupted-input activation, unchanged |
//!
//! Each network gets replacement values from its own caches, so base and
//! hypothesis can be patched at the same named location even when their
//! internal widths differ.

use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::address::CircuitNode;
use crate::backend::IiaBackend;
use crate::error::{IiaError, Result};
use crate::hooks::{HookCache, HookPoint, HookSpec, Intervention};

// ---------------------------------------------------------------------------
// AblationType
// ---------------------------------------------------------------------------

/// How a location's activation is replaced.
///
/// Deserialization goes through [`FromStr`], so an unknown name reports
/// [`IiaError::UnsupportedAblationType`] in the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum AblationType {
    /// All zeros.
    Zero,
    /// Batch mean of the clean activation.
    Mean,
    /// Activation on a different (corrupted) input.
    Resample,
}

impl AblationType {
    /// Every ablation type, in sweep order.
    pub const ALL: [Self; 3] = [Self::Zero, Self::Mean, Self::Resample];

    /// Lowercase name used in result columns.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Zero => "zero",
            Self::Mean => "mean",
            Self::Resample => "resample",
        }
    }
}

impl fmt::Display for AblationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AblationType {
    type Err = IiaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "zero" => Ok(Self::Zero),
            "mean" => Ok(Self::Mean),
            "resample" => Ok(Self::Resample),
            other => Err(IiaError::UnsupportedAblationType(other.to_string())),
        }
    }
}

impl TryFrom<String> for AblationType {
    type Error = IiaError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

// ---------------------------------------------------------------------------
// Replacement values
// ---------------------------------------------------------------------------

/// Replacement value for one activation.
///
/// # Shapes
/// - `clean`: `[batch, ...]`
/// - `corrupted`: `[batch, ...]` (read only for [`AblationType::Resample`])
/// - returns: same shape as `clean`
///
/// # Errors
///
/// Returns [`IiaError::Intervention`] if a resample source does not have the
/// clean activation's shape, and [`IiaError::Model`] on tensor failures.
pub fn replacement_value(ty: AblationType, clean: &Tensor, corrupted: &Tensor) -> Result<Tensor> {
    match ty {
        AblationType::Zero => Ok(clean.zeros_like()?),
        AblationType::Mean => {
            let mean = clean.mean_keepdim(0)?;
            // CONTIGUOUS: broadcast_as leaves a zero stride on the batch axis
            Ok(mean.broadcast_as(clean.shape())?.contiguous()?)
        }
        AblationType::Resample => {
            if corrupted.dims() != clean.dims() {
                return Err(IiaError::Intervention(format!(
                    "resample source shape {:?} does not match activation shape {:?}",
                    corrupted.dims(),
                    clean.dims()
                )));
            }
            Ok(corrupted.clone())
        }
    }
}

// ---------------------------------------------------------------------------
// ActivationCaches
// ---------------------------------------------------------------------------

/// Clean and corrupted activation caches of one network.
///
/// Captured once per session and reused for every location and ablation
/// type of a sweep.
#[derive(Debug)]
pub struct ActivationCaches {
    /// Activations on the clean inputs.
    pub clean: HookCache,
    /// Activations on the corrupted inputs.
    pub corrupted: HookCache,
}

impl ActivationCaches {
    /// Run `model` on both input batches, capturing every hook.
    ///
    /// # Errors
    ///
    /// Propagates forward-pass errors.
    pub fn capture(model: &dyn IiaBackend, clean: &Tensor, corrupted: &Tensor) -> Result<Self> {
        Ok(Self {
            clean: model.run_with_cache(clean)?,
            corrupted: model.run_with_cache(corrupted)?,
        })
    }

    /// Build the patch for one location.
    ///
    /// `rows` restricts the replacement to a `(start, len)` slice of the
    /// batch axis; the mean is still taken over the full clean batch.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Hook`] if a required activation was not captured,
    /// [`IiaError::Intervention`] if a head is selected on a hook without a
    /// head axis, plus [`replacement_value`] errors.
    pub fn intervention(
        &self,
        node: &CircuitNode,
        ty: AblationType,
        rows: Option<(usize, usize)>,
    ) -> Result<Intervention> {
        let hook = HookPoint::from(node.hook_name.as_str());
        let clean = self.clean.require(&hook)?;
        let corrupted = match ty {
            AblationType::Resample => self.corrupted.require(&hook)?,
            AblationType::Zero | AblationType::Mean => clean,
        };
        let mut value = replacement_value(ty, clean, corrupted)?;
        if let Some((start, len)) = rows {
            value = value.narrow(0, start, len)?;
        }
        Ok(match node.head {
            Some(head) if !hook.has_head_axis() && !matches!(hook, HookPoint::Custom(_)) => {
                return Err(IiaError::Intervention(format!(
                    "`{hook}` has no head axis, cannot select head {head}"
                )));
            }
            Some(head) => Intervention::ReplaceHead { head, value },
            None => Intervention::Replace(value),
        })
    }

    /// Build a [`HookSpec`] patching every `(location, ablation type)` pair.
    ///
    /// # Errors
    ///
    /// Propagates [`intervention`](Self::intervention) errors.
    pub fn hook_spec(
        &self,
        targets: &[(CircuitNode, AblationType)],
        rows: Option<(usize, usize)>,
    ) -> Result<HookSpec> {
        let mut spec = HookSpec::new();
        for (node, ty) in targets {
            let intervention = self.intervention(node, *ty, rows)?;
            spec.intervene(HookPoint::from(node.hook_name.as_str()), intervention);
        }
        Ok(spec)
    }
}

// ---------------------------------------------------------------------------
// PatchPair
// ---------------------------------------------------------------------------

/// Patches for the base and hypothesis networks at the same named locations.
#[derive(Debug)]
pub struct PatchPair {
    /// Patches for the base (ground-truth) network.
    pub base: HookSpec,
    /// Patches for the hypothesis (candidate) network.
    pub hypothesis: HookSpec,
}

impl PatchPair {
    /// Build matching patches from each network's own caches.
    ///
    /// # Errors
    ///
    /// Propagates [`ActivationCaches::hook_spec`] errors.
    pub fn build(
        targets: &[(CircuitNode, AblationType)],
        base: &ActivationCaches,
        hypothesis: &ActivationCaches,
        rows: Option<(usize, usize)>,
    ) -> Result<Self> {
        Ok(Self {
            base: base.hook_spec(targets, rows)?,
            hypothesis: hypothesis.hook_spec(targets, rows)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;

    fn activation() -> Tensor {
        Tensor::arange(0_f32, 24.0, &Device::Cpu)
            .unwrap()
            .reshape((3, 2, 4))
            .unwrap()
    }

    #[test]
    fn parse_and_display() {
        for ty in AblationType::ALL {
            assert_eq!(ty.to_string().parse::<AblationType>().unwrap(), ty);
        }
        let err = "noise".parse::<AblationType>().unwrap_err();
        assert!(matches!(err, IiaError::UnsupportedAblationType(s) if s == "noise"));
    }

    #[test]
    fn zero_keeps_shape() {
        let clean = activation();
        let z = replacement_value(AblationType::Zero, &clean, &clean).unwrap();
        assert_eq!(z.dims(), clean.dims());
        assert_eq!(z.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn mean_is_shape_invariant_and_batch_constant() {
        let clean = activation();
        let mean = replacement_value(AblationType::Mean, &clean, &clean).unwrap();
        assert_eq!(mean.dims(), clean.dims());
        let rows = mean.flatten_from(1).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(rows[0], rows[1]);
        assert_eq!(rows[1], rows[2]);
        // Middle batch element of an arange is the mean.
        let middle = clean.get(1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(rows[0], middle);
    }

    #[test]
    fn resample_uses_corrupted_value() {
        let clean = activation();
        let corrupted = (activation() + 100.0).unwrap();
        let r = replacement_value(AblationType::Resample, &clean, &corrupted).unwrap();
        let diff = (r - &corrupted).unwrap().abs().unwrap().sum_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn resample_shape_mismatch_fails() {
        let clean = activation();
        let corrupted = Tensor::zeros((2, 2, 4), DType::F32, &Device::Cpu).unwrap();
        let err = replacement_value(AblationType::Resample, &clean, &corrupted).unwrap_err();
        assert!(matches!(err, IiaError::Intervention(_)));
    }

    #[test]
    fn head_node_builds_head_patch() {
        let logits = Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let mut clean = HookCache::new(logits.clone());
        let result = Tensor::ones((2, 3, 2, 5), DType::F32, &Device::Cpu).unwrap();
        clean.store(HookPoint::AttnResult(0), result.clone());
        let mut corrupted = HookCache::new(logits);
        corrupted.store(HookPoint::AttnResult(0), result);
        let caches = ActivationCaches { clean, corrupted };

        let node = CircuitNode::new("blocks.0.attn.hook_result", Some(1));
        let patch = caches.intervention(&node, AblationType::Zero, Some((1, 1))).unwrap();
        match patch {
            Intervention::ReplaceHead { head, value } => {
                assert_eq!(head, 1);
                assert_eq!(value.dims(), &[1, 3, 2, 5]);
            }
            other => panic!("unexpected patch {other:?}"),
        }

        let missing = CircuitNode::new("blocks.3.hook_mlp_out", None);
        assert!(caches.intervention(&missing, AblationType::Mean, None).is_err());

        let embed = Tensor::ones((2, 3, 5), DType::F32, &Device::Cpu).unwrap();
        let mut caches = caches;
        caches.clean.store(HookPoint::Embed, embed);
        let headed = CircuitNode::new("hook_embed", Some(0));
        let err = caches.intervention(&headed, AblationType::Zero, None).unwrap_err();
        assert!(matches!(err, IiaError::Intervention(_)));
    }
}
