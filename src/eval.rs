// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interchange intervention evaluation.
//!
//! For every eligible location and ablation type, both networks are run on
//! the clean batch with the same named location patched (each from its own
//! caches), and the intervened outputs are compared:
//!
//! - categorical outputs: exact-sequence agreement (`accuracy`), KL
//!   divergence of the intervened distributions, per-network label-change
//!   rate (`effect`), and for resample ablations agreement restricted to
//!   examples whose ground truth changed (`effective_accuracy`);
//! - continuous outputs: fraction of entries within `accuracy_atol`, and
//!   mean absolute change as the effect.
//!
//! Position 0 (beginning of sequence) is dropped before any comparison.

use std::collections::BTreeMap;

use candle_core::{D, DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::ablation::{ActivationCaches, AblationType, PatchPair};
use crate::address::CircuitNode;
use crate::backend::{IiaBackend, check_comparable};
use crate::circuit::{eligible_nodes, ll_circuit};
use crate::config::EvalConfig;
use crate::correspondence::Correspondence;
use crate::data::CaseDataset;
use crate::error::{IiaError, Result};
use crate::report::ResultsTable;
use crate::sampler::{CombinatorialSampler, eligible_hooks};

// ---------------------------------------------------------------------------
// NodeMetrics
// ---------------------------------------------------------------------------

/// Comparison metrics for one location under one ablation type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    /// Agreement between the intervened networks, in `[0, 1]`.
    pub accuracy: f64,
    /// KL divergence of intervened distributions (categorical only), `>= 0`.
    pub kl_div: Option<f64>,
    /// How much the intervention changed the base network's output.
    pub base_model_effect: f64,
    /// How much the intervention changed the hypothesis network's output.
    pub hypothesis_model_effect: f64,
    /// Agreement restricted to examples whose ground truth changed; `None`
    /// when not computed or when no example changed.
    pub effective_accuracy: Option<f64>,
}

/// Outputs of one location's four forward passes, position 0 removed.
struct OutputQuad {
    base_original: Tensor,
    hypothesis_original: Tensor,
    base_intervened: Tensor,
    hypothesis_intervened: Tensor,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Drop the beginning-of-sequence position and promote to F32.
///
/// # Shapes
/// - `logits`: `[batch, seq, d_out]`, any float dtype
/// - returns: `[batch, seq - 1, d_out]`, F32
fn drop_bos(logits: &Tensor) -> Result<Tensor> {
    let seq = logits.dim(1)?;
    if seq < 2 {
        return Err(IiaError::DataMismatch(format!(
            "sequence length {seq} leaves nothing after the first position"
        )));
    }
    // PROMOTE: metrics read values back as f32
    Ok(logits.narrow(1, 1, seq - 1)?.to_dtype(DType::F32)?)
}

/// Mean of `values` over entries where `mask` is set, `None` if none are.
fn masked_mean(values: &[f64], mask: &[bool]) -> Option<f64> {
    let (sum, count) = values
        .iter()
        .zip(mask)
        .filter(|(_, keep)| **keep)
        .fold((0.0_f64, 0_usize), |(s, n), (v, _)| (s + v, n + 1));
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    let count = count as f64;
    (count > 0.0).then(|| sum / count)
}

fn mean(values: &[f64]) -> f64 {
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    let n = values.len().max(1) as f64;
    values.iter().sum::<f64>() / n
}

/// Metrics for categorical outputs.
///
/// `differ[i]` marks examples whose ground truth changed; when given,
/// effective accuracy is computed over those examples.
fn categorical_metrics(quad: &OutputQuad, differ: Option<&[bool]>) -> Result<NodeMetrics> {
    let log_probs = |t: &Tensor| candle_nn::ops::log_softmax(t, D::Minus1);
    let base_orig = log_probs(&quad.base_original)?;
    let hyp_orig = log_probs(&quad.hypothesis_original)?;
    let base_int = log_probs(&quad.base_intervened)?;
    let hyp_int = log_probs(&quad.hypothesis_intervened)?;

    let labels = |t: &Tensor| -> Result<Vec<Vec<u32>>> { Ok(t.argmax(D::Minus1)?.to_vec2::<u32>()?) };
    let base_orig_labels = labels(&base_orig)?;
    let hyp_orig_labels = labels(&hyp_orig)?;
    let base_int_labels = labels(&base_int)?;
    let hyp_int_labels = labels(&hyp_int)?;

    // KL(base || hypothesis) summed over the vocabulary, averaged over batch and position.
    let kl = (base_int.exp()? * (&base_int - &hyp_int)?)?
        .sum(D::Minus1)?
        .mean_all()?
        .to_scalar::<f32>()?;
    let kl_div = f64::from(kl).max(0.0);

    let same: Vec<f64> = base_int_labels
        .iter()
        .zip(&hyp_int_labels)
        .map(|(b, h)| if b == h { 1.0 } else { 0.0 })
        .collect();

    let change_rate = |orig: &[Vec<u32>], int: &[Vec<u32>]| {
        let (changed, total) = orig
            .iter()
            .zip(int)
            .flat_map(|(o, i)| o.iter().zip(i))
            .fold((0_usize, 0_usize), |(c, n), (o, i)| (c + usize::from(o != i), n + 1));
        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let rate = changed as f64 / total.max(1) as f64;
        rate
    };

    Ok(NodeMetrics {
        accuracy: mean(&same),
        kl_div: Some(kl_div),
        base_model_effect: change_rate(&base_orig_labels, &base_int_labels),
        hypothesis_model_effect: change_rate(&hyp_orig_labels, &hyp_int_labels),
        effective_accuracy: differ.and_then(|mask| masked_mean(&same, mask)),
    })
}

/// Metrics for continuous outputs.
fn continuous_metrics(quad: &OutputQuad, atol: f64, differ: Option<&[bool]>) -> Result<NodeMetrics> {
    let flat = |t: &Tensor| -> Result<Vec<Vec<f32>>> { Ok(t.flatten_from(1)?.to_vec2::<f32>()?) };
    let base_int = flat(&quad.base_intervened)?;
    let hyp_int = flat(&quad.hypothesis_intervened)?;

    // Fraction of close entries, per example.
    let close: Vec<Vec<f64>> = base_int
        .iter()
        .zip(&hyp_int)
        .map(|(b, h)| {
            b.iter()
                .zip(h)
                .map(|(x, y)| if f64::from((x - y).abs()) <= atol { 1.0 } else { 0.0 })
                .collect()
        })
        .collect();
    let all_entries: Vec<f64> = close.iter().flatten().copied().collect();
    let effective_accuracy = differ.and_then(|mask| {
        let kept: Vec<f64> = close
            .iter()
            .zip(mask)
            .filter(|(_, keep)| **keep)
            .flat_map(|(row, _)| row.iter().copied())
            .collect();
        (!kept.is_empty()).then(|| mean(&kept))
    });

    let effect = |orig: &Tensor, int: &Tensor| -> Result<f64> {
        Ok(f64::from((orig - int)?.abs()?.mean_all()?.to_scalar::<f32>()?))
    };

    Ok(NodeMetrics {
        accuracy: mean(&all_entries),
        kl_div: None,
        base_model_effect: effect(&quad.base_original, &quad.base_intervened)?,
        hypothesis_model_effect: effect(&quad.hypothesis_original, &quad.hypothesis_intervened)?,
        effective_accuracy,
    })
}

// ---------------------------------------------------------------------------
// IiaSession
// ---------------------------------------------------------------------------

/// Caches and unpatched outputs shared by every location of a sweep.
///
/// Clean and corrupted caches of both networks are captured once and held
/// for the whole sweep.
pub struct IiaSession<'a> {
    base: &'a dyn IiaBackend,
    hypothesis: &'a dyn IiaBackend,
    clean: &'a CaseDataset,
    corrupted: &'a CaseDataset,
    base_caches: ActivationCaches,
    hypothesis_caches: ActivationCaches,
    config: &'a EvalConfig,
}

impl<'a> IiaSession<'a> {
    /// Check preconditions and capture every cache.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::ArchitectureMismatch`] if the networks are not
    /// comparable, [`IiaError::DataMismatch`] if the batches cannot be paired
    /// (identical batches are rejected when resample ablation is requested),
    /// and forward-pass errors.
    pub fn new(
        base: &'a dyn IiaBackend,
        hypothesis: &'a dyn IiaBackend,
        clean: &'a CaseDataset,
        corrupted: &'a CaseDataset,
        config: &'a EvalConfig,
    ) -> Result<Self> {
        check_comparable(base, hypothesis)?;
        let needs_distinct = config.ablation_types.contains(&AblationType::Resample);
        CaseDataset::check_pair(clean, corrupted, needs_distinct)?;

        let base_caches = ActivationCaches::capture(base, clean.inputs(), corrupted.inputs())?;
        let hypothesis_caches =
            ActivationCaches::capture(hypothesis, clean.inputs(), corrupted.inputs())?;

        Ok(Self {
            base,
            hypothesis,
            clean,
            corrupted,
            base_caches,
            hypothesis_caches,
            config,
        })
    }

    /// Evaluate one location under one ablation type.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Hook`] if the location was not captured, plus
    /// forward-pass and tensor errors.
    pub fn evaluate_node(&self, node: &CircuitNode, ty: AblationType) -> Result<NodeMetrics> {
        let targets = [(node.clone(), ty)];
        let patches = PatchPair::build(&targets, &self.base_caches, &self.hypothesis_caches, None)?;
        let inputs = self.clean.inputs();

        let quad = OutputQuad {
            base_original: drop_bos(self.base_caches.clean.output())?,
            hypothesis_original: drop_bos(self.hypothesis_caches.clean.output())?,
            base_intervened: drop_bos(&self.base.forward(inputs, &patches.base)?.into_output())?,
            hypothesis_intervened: drop_bos(
                &self.hypothesis.forward(inputs, &patches.hypothesis)?.into_output(),
            )?,
        };

        let differ = if ty == AblationType::Resample {
            Some(CaseDataset::outputs_differ(
                self.clean,
                self.corrupted,
                self.base.is_categorical(),
                self.config.effective_accuracy_atol,
            )?)
        } else {
            None
        };

        if self.base.is_categorical() {
            categorical_metrics(&quad, differ.as_deref())
        } else {
            continuous_metrics(&quad, self.config.accuracy_atol, differ.as_deref())
        }
    }

    /// Evaluate every eligible location under one ablation type.
    ///
    /// # Errors
    ///
    /// Propagates [`evaluate_node`](Self::evaluate_node) errors.
    pub fn evaluate_iia(&self, ty: AblationType) -> Result<BTreeMap<CircuitNode, NodeMetrics>> {
        let nodes = eligible_nodes(
            self.base.num_layers(),
            self.base.num_heads(),
            self.config.granularity,
        );
        tracing::info!(ablation = %ty, locations = nodes.len(), "running IIA evaluation");

        let mut results = BTreeMap::new();
        for node in nodes {
            let metrics = self.evaluate_node(&node, ty)?;
            tracing::debug!(
                node = %node,
                accuracy = metrics.accuracy,
                base_effect = metrics.base_model_effect,
                hypothesis_effect = metrics.hypothesis_model_effect,
                "evaluated location"
            );
            results.insert(node, metrics);
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Sweeps
// ---------------------------------------------------------------------------

/// Run [`IiaSession::evaluate_iia`] for one ablation type.
///
/// # Errors
///
/// Propagates [`IiaSession::new`] and evaluation errors.
pub fn evaluate_iia(
    base: &dyn IiaBackend,
    hypothesis: &dyn IiaBackend,
    clean: &CaseDataset,
    corrupted: &CaseDataset,
    ty: AblationType,
    config: &EvalConfig,
) -> Result<BTreeMap<CircuitNode, NodeMetrics>> {
    IiaSession::new(base, hypothesis, clean, corrupted, config)?.evaluate_iia(ty)
}

/// Evaluate every configured ablation type and merge the results into one
/// row per location, marking the locations the ground-truth
/// correspondence claims.
///
/// # Errors
///
/// Propagates [`IiaSession::new`] and evaluation errors.
pub fn evaluate_iia_on_all_ablation_types(
    base: &dyn IiaBackend,
    hypothesis: &dyn IiaBackend,
    clean: &CaseDataset,
    corrupted: &CaseDataset,
    ground_truth: &Correspondence,
    config: &EvalConfig,
) -> Result<ResultsTable> {
    let session = IiaSession::new(base, hypothesis, clean, corrupted, config)?;
    let circuit = ll_circuit(ground_truth, base.num_layers(), base.num_heads());

    let mut table = ResultsTable::new();
    for node in eligible_nodes(base.num_layers(), base.num_heads(), config.granularity) {
        let in_circuit = circuit.contains(&node);
        table.add_node(&node, in_circuit);
    }
    for &ty in &config.ablation_types {
        for (node, metrics) in session.evaluate_iia(ty)? {
            table.record(&node, ty, &metrics);
        }
    }
    Ok(table)
}

/// Mean squared error between base and hypothesis outputs under joint
/// interventions.
///
/// Every assignment drawn by a [`CombinatorialSampler`] patches all joint
/// intervention points at once (one ablation type per point) in both
/// networks. The clean batch runs in mini-batches of `config.batch_size`;
/// losses are averaged per assignment, then across assignments.
///
/// # Errors
///
/// Returns [`IiaError::Config`] if `max_interventions` is zero, no ablation
/// type is configured, or a joint intervention point is missing from the
/// hypothesis; plus [`IiaSession::new`] precondition errors.
pub fn resampling_ablation_loss(
    base: &dyn IiaBackend,
    hypothesis: &dyn IiaBackend,
    clean: &CaseDataset,
    corrupted: &CaseDataset,
    config: &EvalConfig,
) -> Result<f64> {
    if config.max_interventions == 0 {
        return Err(IiaError::Config("max_interventions must be greater than 0".into()));
    }
    if config.ablation_types.is_empty() || config.batch_size == 0 {
        return Err(IiaError::Config(
            "resampling loss needs at least one ablation type and a non-zero batch size".into(),
        ));
    }
    check_comparable(base, hypothesis)?;
    CaseDataset::check_pair(clean, corrupted, true)?;

    let names: Vec<String> = base.hook_points().iter().map(ToString::to_string).collect();
    let hooks = eligible_hooks(&names, config.granularity, config.hook_filters.as_deref());
    let hypothesis_names: Vec<String> =
        hypothesis.hook_points().iter().map(ToString::to_string).collect();
    if let Some(missing) = hooks.iter().find(|h| !hypothesis_names.contains(h)) {
        return Err(IiaError::Config(format!(
            "intervention point {missing} is missing from the hypothesis"
        )));
    }

    let base_caches = ActivationCaches::capture(base, clean.inputs(), corrupted.inputs())?;
    let hypothesis_caches = ActivationCaches::capture(hypothesis, clean.inputs(), corrupted.inputs())?;

    let sampler = CombinatorialSampler::new(
        hooks.len(),
        config.ablation_types.len(),
        config.max_interventions,
        config.seed,
    );
    let assignments = sampler.assignments()?;
    tracing::info!(
        points = hooks.len(),
        interventions = assignments.len(),
        exhaustive = sampler.is_exhaustive(),
        "computing resampling ablation loss"
    );

    let n = clean.len();
    let mut losses = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let targets: Vec<(CircuitNode, AblationType)> = hooks
            .iter()
            .zip(&assignment)
            .filter_map(|(hook, &choice)| {
                config
                    .ablation_types
                    .get(choice)
                    .map(|&ty| (CircuitNode::new(hook.clone(), None), ty))
            })
            .collect();

        let mut batch_losses = Vec::new();
        for start in (0..n).step_by(config.batch_size) {
            let len = config.batch_size.min(n - start);
            let rows = Some((start, len));
            let patches = PatchPair::build(&targets, &base_caches, &hypothesis_caches, rows)?;
            let inputs = clean.inputs().narrow(0, start, len)?;
            let base_out = base
                .forward(&inputs, &patches.base)?
                .into_output()
                .to_dtype(DType::F32)?;
            let hyp_out = hypothesis
                .forward(&inputs, &patches.hypothesis)?
                .into_output()
                .to_dtype(DType::F32)?;
            let mse = (base_out - hyp_out)?.sqr()?.mean_all()?.to_scalar::<f32>()?;
            batch_losses.push(f64::from(mse));
        }
        losses.push(mean(&batch_losses));
    }

    let loss = mean(&losses);
    tracing::info!(loss, "resampling ablation loss");
    Ok(loss)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn t(data: &[f32], shape: (usize, usize, usize)) -> Tensor {
        Tensor::from_slice(data, shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn identical_outputs_agree_fully() {
        // batch 2, seq 2 (BOS + 1), vocab 2
        let logits = t(&[0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 0.0, 2.0], (2, 2, 2));
        let quad = OutputQuad {
            base_original: drop_bos(&logits).unwrap(),
            hypothesis_original: drop_bos(&logits).unwrap(),
            base_intervened: drop_bos(&logits).unwrap(),
            hypothesis_intervened: drop_bos(&logits).unwrap(),
        };
        let m = categorical_metrics(&quad, Some(&[true, false][..])).unwrap();
        assert!((m.accuracy - 1.0).abs() < 1e-12);
        assert!(m.kl_div.unwrap().abs() < 1e-6);
        assert_eq!(m.base_model_effect, 0.0);
        assert_eq!(m.effective_accuracy, Some(1.0));
    }

    #[test]
    fn label_flip_is_counted() {
        let orig = t(&[0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 2.0, 0.0], (2, 2, 2));
        let flipped = t(&[0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 2.0, 0.0], (2, 2, 2));
        let quad = OutputQuad {
            base_original: drop_bos(&orig).unwrap(),
            hypothesis_original: drop_bos(&orig).unwrap(),
            base_intervened: drop_bos(&flipped).unwrap(),
            hypothesis_intervened: drop_bos(&orig).unwrap(),
        };
        let m = categorical_metrics(&quad, Some(&[false, false][..])).unwrap();
        assert!((m.accuracy - 0.5).abs() < 1e-12);
        assert!((m.base_model_effect - 0.5).abs() < 1e-12);
        assert_eq!(m.hypothesis_model_effect, 0.0);
        assert!(m.kl_div.unwrap() > 0.0);
        assert_eq!(m.effective_accuracy, None);
        assert!((0.0..=1.0).contains(&m.accuracy));
    }

    #[test]
    fn continuous_tolerance_and_effect() {
        let base = t(&[9.0, 1.0, 9.0, 2.0], (2, 2, 1));
        let hyp = t(&[9.0, 1.005, 9.0, 2.5], (2, 2, 1));
        let quad = OutputQuad {
            base_original: drop_bos(&base).unwrap(),
            hypothesis_original: drop_bos(&base).unwrap(),
            base_intervened: drop_bos(&base).unwrap(),
            hypothesis_intervened: drop_bos(&hyp).unwrap(),
        };
        let m = continuous_metrics(&quad, 1e-2, Some(&[false, true][..])).unwrap();
        assert!((m.accuracy - 0.5).abs() < 1e-12);
        assert_eq!(m.kl_div, None);
        assert_eq!(m.base_model_effect, 0.0);
        // (|1.0 - 1.005| + |2.0 - 2.5|) / 2
        assert!((m.hypothesis_model_effect - 0.2525).abs() < 1e-5);
        assert_eq!(m.effective_accuracy, Some(0.0));
    }

    #[test]
    fn wide_float_outputs_are_promoted() {
        let logits = t(&[0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 0.0, 2.0], (2, 2, 2))
            .to_dtype(DType::F64)
            .unwrap();
        let trimmed = drop_bos(&logits).unwrap();
        assert_eq!(trimmed.dtype(), DType::F32);
        let quad = OutputQuad {
            base_original: trimmed.clone(),
            hypothesis_original: trimmed.clone(),
            base_intervened: trimmed.clone(),
            hypothesis_intervened: trimmed,
        };
        let m = categorical_metrics(&quad, None).unwrap();
        assert!((m.accuracy - 1.0).abs() < 1e-12);
    }

    #[test]
    fn bos_only_sequences_are_rejected() {
        let logits = t(&[0.0, 1.0], (1, 1, 2));
        assert!(matches!(drop_bos(&logits), Err(IiaError::DataMismatch(_))));
    }
}
