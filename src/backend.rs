// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core backend trait for hooked networks.
//!
//! [`IiaBackend`] is what the intervention engine needs from a network:
//! architecture metadata, an enumerable hook registry, and a hook-aware
//! forward pass. Both the compiled reference model and the trained
//! candidate implement it.

use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::config::ArchitectureConfig;
use crate::error::{IiaError, Result};
use crate::hooks::{HookCache, HookPoint, HookSpec};

// ---------------------------------------------------------------------------
// IiaBackend trait
// ---------------------------------------------------------------------------

/// Unified interface for networks taking part in an intervention sweep.
///
/// A single [`forward`](Self::forward) method covers plain, capturing, and
/// patched passes: the caller describes captures and patches in a
/// [`HookSpec`], and the backend returns a [`HookCache`] with the output
/// plus the requested activations. Patches apply to that call only.
pub trait IiaBackend: Send + Sync {
    // --- Metadata --------------------------------------------------------

    /// Architecture metadata.
    fn config(&self) -> &ArchitectureConfig;

    /// Number of layers.
    fn num_layers(&self) -> usize {
        self.config().n_layers
    }

    /// Number of attention heads per layer.
    fn num_heads(&self) -> usize {
        self.config().n_heads
    }

    /// Input vocabulary size.
    fn vocab_size(&self) -> usize {
        self.config().d_vocab
    }

    /// Context length.
    fn context_len(&self) -> usize {
        self.config().n_ctx
    }

    /// Whether outputs are categorical logits.
    fn is_categorical(&self) -> bool {
        self.config().categorical
    }

    // --- Hook registry ---------------------------------------------------

    /// Every hook point with the activation shape it has for a
    /// `[batch, seq]` input.
    fn hook_registry(&self, batch: usize, seq: usize) -> BTreeMap<HookPoint, Vec<usize>>;

    /// Every hook point this network exposes.
    fn hook_points(&self) -> Vec<HookPoint> {
        self.hook_registry(1, 1).into_keys().collect()
    }

    // --- Forward passes --------------------------------------------------

    /// Forward pass with optional captures and patches.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]` -- token IDs
    /// - returns: [`HookCache`] with output `[batch, seq, d_vocab_out]`
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Model`] on tensor failures and
    /// [`IiaError::Intervention`] if a patch does not fit its activation.
    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache>;

    /// Plain forward pass returning only the output.
    ///
    /// # Errors
    ///
    /// Propagates [`forward`](Self::forward) errors.
    fn run(&self, input_ids: &Tensor) -> Result<Tensor> {
        Ok(self.forward(input_ids, &HookSpec::new())?.into_output())
    }

    /// Forward pass capturing every registered hook.
    ///
    /// # Errors
    ///
    /// Propagates [`forward`](Self::forward) errors.
    fn run_with_cache(&self, input_ids: &Tensor) -> Result<HookCache> {
        let mut hooks = HookSpec::new();
        hooks.capture_all(self.hook_points());
        self.forward(input_ids, &hooks)
    }
}

/// Check that two networks can be compared location by location.
///
/// Layer count, head count, vocabulary size, context length, and output
/// kind must match.
///
/// # Errors
///
/// Returns [`IiaError::ArchitectureMismatch`] naming the first differing
/// field. The `categorical` field is reported as `1` (categorical) or `0`
/// (continuous).
pub fn check_comparable(base: &dyn IiaBackend, hypothesis: &dyn IiaBackend) -> Result<()> {
    let pairs = [
        ("n_layers", base.num_layers(), hypothesis.num_layers()),
        ("n_heads", base.num_heads(), hypothesis.num_heads()),
        ("d_vocab", base.vocab_size(), hypothesis.vocab_size()),
        ("n_ctx", base.context_len(), hypothesis.context_len()),
    ];
    for (field, b, h) in pairs {
        if b != h {
            return Err(IiaError::ArchitectureMismatch {
                field,
                base: b,
                hypothesis: h,
            });
        }
    }
    if base.is_categorical() != hypothesis.is_categorical() {
        return Err(IiaError::ArchitectureMismatch {
            field: "categorical",
            base: usize::from(base.is_categorical()),
            hypothesis: usize::from(hypothesis.is_categorical()),
        });
    }
    Ok(())
}
