// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook system for activation capture and patching.
//!
//! Provides [`HookPoint`] (named tap points in a forward pass),
//! [`HookSpec`] (what to capture and what to patch), and [`HookCache`]
//! (captured tensors from a forward pass).
//!
//! Patches live only inside the [`HookSpec`] handed to a single forward
//! call. Nothing is registered on the model, so a patch cannot outlive the
//! pass it was meant for, whichever way that pass exits.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use candle_core::Tensor;

use crate::error::{IiaError, Result};

// ---------------------------------------------------------------------------
// HookPoint
// ---------------------------------------------------------------------------

/// Named location in a forward pass where activations can be captured
/// or replaced.
///
/// Follows the `TransformerLens` naming convention used by compiled
/// (normalization-free) transformers via [`Display`](std::fmt::Display)
/// and [`FromStr`].
///
/// ```
/// use candle_iia::HookPoint;
///
/// let hook = HookPoint::AttnResult(1);
/// assert_eq!(hook.to_string(), "blocks.1.attn.hook_result");
///
/// let parsed: HookPoint = "blocks.1.attn.hook_result".parse().unwrap();
/// assert_eq!(parsed, hook);
/// ```
///
/// Unknown strings parse as [`HookPoint::Custom`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookPoint {
    // -- Embedding --
    /// Token embedding (`hook_embed`).
    Embed,
    /// Positional embedding (`hook_pos_embed`).
    PosEmbed,

    // -- Per-layer --
    /// Residual stream before layer `i` (`blocks.{i}.hook_resid_pre`).
    ResidPre(usize),
    /// Per-head query input in layer `i` (`blocks.{i}.hook_q_input`).
    ///
    /// Shape: `[batch, seq, heads, d_model]`.
    QInput(usize),
    /// Per-head key input in layer `i` (`blocks.{i}.hook_k_input`).
    KInput(usize),
    /// Per-head value input in layer `i` (`blocks.{i}.hook_v_input`).
    VInput(usize),
    /// Query vectors in layer `i` (`blocks.{i}.attn.hook_q`).
    ///
    /// Shape: `[batch, seq, heads, d_head]`.
    AttnQ(usize),
    /// Key vectors in layer `i` (`blocks.{i}.attn.hook_k`).
    AttnK(usize),
    /// Value vectors in layer `i` (`blocks.{i}.attn.hook_v`).
    AttnV(usize),
    /// Pre-softmax attention scores (`blocks.{i}.attn.hook_attn_scores`).
    AttnScores(usize),
    /// Post-softmax attention pattern (`blocks.{i}.attn.hook_pattern`).
    AttnPattern(usize),
    /// Per-head attention output (`blocks.{i}.attn.hook_result`).
    ///
    /// Shape: `[batch, seq, heads, d_model]`.
    AttnResult(usize),
    /// Summed attention output (`blocks.{i}.hook_attn_out`).
    AttnOut(usize),
    /// Residual stream between attention and MLP (`blocks.{i}.hook_resid_mid`).
    ResidMid(usize),
    /// MLP input (`blocks.{i}.hook_mlp_in`).
    MlpIn(usize),
    /// MLP pre-activation (`blocks.{i}.mlp.hook_pre`).
    MlpPre(usize),
    /// MLP post-activation (`blocks.{i}.mlp.hook_post`).
    MlpPost(usize),
    /// MLP output (`blocks.{i}.hook_mlp_out`).
    MlpOut(usize),
    /// Residual stream after layer `i` (`blocks.{i}.hook_resid_post`).
    ResidPost(usize),

    // -- Escape hatch --
    /// Backend-specific hook point not covered by the standard enum.
    Custom(String),
}

impl HookPoint {
    /// Layer index of a per-layer hook point, `None` for embeddings and
    /// custom hooks.
    #[must_use]
    pub const fn layer(&self) -> Option<usize> {
        match self {
            Self::ResidPre(i)
            | Self::QInput(i)
            | Self::KInput(i)
            | Self::VInput(i)
            | Self::AttnQ(i)
            | Self::AttnK(i)
            | Self::AttnV(i)
            | Self::AttnScores(i)
            | Self::AttnPattern(i)
            | Self::AttnResult(i)
            | Self::AttnOut(i)
            | Self::ResidMid(i)
            | Self::MlpIn(i)
            | Self::MlpPre(i)
            | Self::MlpPost(i)
            | Self::MlpOut(i)
            | Self::ResidPost(i) => Some(*i),
            Self::Embed | Self::PosEmbed | Self::Custom(_) => None,
        }
    }

    /// Whether activations at this hook carry a head axis at dimension 2.
    #[must_use]
    pub const fn has_head_axis(&self) -> bool {
        matches!(
            self,
            Self::QInput(_)
                | Self::KInput(_)
                | Self::VInput(_)
                | Self::AttnQ(_)
                | Self::AttnK(_)
                | Self::AttnV(_)
                | Self::AttnResult(_)
        )
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed => write!(f, "hook_embed"),
            Self::PosEmbed => write!(f, "hook_pos_embed"),
            Self::ResidPre(i) => write!(f, "blocks.{i}.hook_resid_pre"),
            Self::QInput(i) => write!(f, "blocks.{i}.hook_q_input"),
            Self::KInput(i) => write!(f, "blocks.{i}.hook_k_input"),
            Self::VInput(i) => write!(f, "blocks.{i}.hook_v_input"),
            Self::AttnQ(i) => write!(f, "blocks.{i}.attn.hook_q"),
            Self::AttnK(i) => write!(f, "blocks.{i}.attn.hook_k"),
            Self::AttnV(i) => write!(f, "blocks.{i}.attn.hook_v"),
            Self::AttnScores(i) => write!(f, "blocks.{i}.attn.hook_attn_scores"),
            Self::AttnPattern(i) => write!(f, "blocks.{i}.attn.hook_pattern"),
            Self::AttnResult(i) => write!(f, "blocks.{i}.attn.hook_result"),
            Self::AttnOut(i) => write!(f, "blocks.{i}.hook_attn_out"),
            Self::ResidMid(i) => write!(f, "blocks.{i}.hook_resid_mid"),
            Self::MlpIn(i) => write!(f, "blocks.{i}.hook_mlp_in"),
            Self::MlpPre(i) => write!(f, "blocks.{i}.mlp.hook_pre"),
            Self::MlpPost(i) => write!(f, "blocks.{i}.mlp.hook_post"),
            Self::MlpOut(i) => write!(f, "blocks.{i}.hook_mlp_out"),
            Self::ResidPost(i) => write!(f, "blocks.{i}.hook_resid_post"),
            Self::Custom(s) => write!(f, "{s}"),
        }
    }
}

/// Parse a `TransformerLens`-style string into a [`HookPoint`].
///
/// Unknown strings produce [`HookPoint::Custom`] rather than an error.
impl FromStr for HookPoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(parse_hook_string(s))
    }
}

impl From<&str> for HookPoint {
    fn from(s: &str) -> Self {
        parse_hook_string(s)
    }
}

/// Parse a hook string, falling back to [`HookPoint::Custom`] for unknown patterns.
fn parse_hook_string(s: &str) -> HookPoint {
    match s {
        "hook_embed" => return HookPoint::Embed,
        "hook_pos_embed" => return HookPoint::PosEmbed,
        _ => {}
    }

    if let Some(rest) = s.strip_prefix("blocks.") {
        if let Some((layer_str, suffix)) = rest.split_once('.') {
            if let Ok(layer) = layer_str.parse::<usize>() {
                return match suffix {
                    "hook_resid_pre" => HookPoint::ResidPre(layer),
                    "hook_q_input" => HookPoint::QInput(layer),
                    "hook_k_input" => HookPoint::KInput(layer),
                    "hook_v_input" => HookPoint::VInput(layer),
                    "attn.hook_q" => HookPoint::AttnQ(layer),
                    "attn.hook_k" => HookPoint::AttnK(layer),
                    "attn.hook_v" => HookPoint::AttnV(layer),
                    "attn.hook_attn_scores" => HookPoint::AttnScores(layer),
                    "attn.hook_pattern" => HookPoint::AttnPattern(layer),
                    "attn.hook_result" => HookPoint::AttnResult(layer),
                    "hook_attn_out" => HookPoint::AttnOut(layer),
                    "hook_resid_mid" => HookPoint::ResidMid(layer),
                    "hook_mlp_in" => HookPoint::MlpIn(layer),
                    "mlp.hook_pre" => HookPoint::MlpPre(layer),
                    "mlp.hook_post" => HookPoint::MlpPost(layer),
                    "hook_mlp_out" => HookPoint::MlpOut(layer),
                    "hook_resid_post" => HookPoint::ResidPost(layer),
                    _ => HookPoint::Custom(s.to_string()),
                };
            }
        }
    }

    HookPoint::Custom(s.to_string())
}

// ---------------------------------------------------------------------------
// Intervention
// ---------------------------------------------------------------------------

/// A patch to apply at a hook point during one forward pass.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Intervention {
    /// Replace the whole activation with the provided tensor.
    ///
    /// The replacement must have exactly the activation's shape.
    Replace(Tensor),

    /// Replace a single head slice `[:, :, head, ...]` of the activation
    /// with the same slice of `value`, leaving other heads untouched.
    ///
    /// `value` must have exactly the activation's shape.
    ReplaceHead {
        /// Head index along dimension 2.
        head: usize,
        /// Full-shape tensor the head slice is taken from.
        value: Tensor,
    },
}

/// Apply a single [`Intervention`] to a tensor.
///
/// # Shapes
/// - `tensor`: any shape (rank >= 3 for [`Intervention::ReplaceHead`])
/// - returns: same shape as `tensor`
///
/// # Errors
///
/// Returns [`IiaError::Intervention`] if the replacement shape differs from
/// the activation shape or the head index is out of range. Shapes are never
/// broadcast.
pub fn apply_intervention(tensor: &Tensor, intervention: &Intervention) -> Result<Tensor> {
    match intervention {
        Intervention::Replace(replacement) => {
            check_same_shape(tensor, replacement)?;
            Ok(replacement.clone())
        }
        Intervention::ReplaceHead { head, value } => {
            check_same_shape(tensor, value)?;
            let dims = tensor.dims();
            let n_heads = dims.get(2).copied().ok_or_else(|| {
                IiaError::Intervention(format!(
                    "head patch needs a rank >= 3 activation, got shape {:?}",
                    dims
                ))
            })?;
            if *head >= n_heads {
                return Err(IiaError::Intervention(format!(
                    "head {head} out of range (activation has {n_heads} heads)"
                )));
            }
            let ranges: Vec<Range<usize>> = dims
                .iter()
                .enumerate()
                .map(|(axis, &len)| if axis == 2 { *head..*head + 1 } else { 0..len })
                .collect();
            // CONTIGUOUS: narrow produces a strided view
            let slice = value.narrow(2, *head, 1)?.contiguous()?;
            Ok(tensor.slice_assign(&ranges, &slice)?)
        }
    }
}

/// Fail loudly when a replacement does not match the activation shape.
fn check_same_shape(activation: &Tensor, replacement: &Tensor) -> Result<()> {
    if activation.dims() != replacement.dims() {
        return Err(IiaError::Intervention(format!(
            "replacement shape {:?} does not match activation shape {:?}",
            replacement.dims(),
            activation.dims()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// HookSpec
// ---------------------------------------------------------------------------

/// Declares which activations to capture and which patches to apply.
///
/// ```
/// use candle_iia::{HookPoint, HookSpec};
///
/// let mut hooks = HookSpec::new();
/// hooks.capture(HookPoint::AttnResult(0))
///      .capture("blocks.0.hook_mlp_out");
/// assert_eq!(hooks.num_captures(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    /// Hook points to capture during the forward pass.
    captures: HashSet<HookPoint>,
    /// Patches to apply, stored as (`hook_point`, intervention) pairs.
    interventions: Vec<(HookPoint, Intervention)>,
}

impl HookSpec {
    /// Create an empty hook specification (no captures, no patches).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request capture of the activation at the given hook point.
    pub fn capture<H: Into<HookPoint>>(&mut self, hook: H) -> &mut Self {
        self.captures.insert(hook.into());
        self
    }

    /// Request capture of every hook point in `hooks`.
    pub fn capture_all<I>(&mut self, hooks: I) -> &mut Self
    where
        I: IntoIterator<Item = HookPoint>,
    {
        self.captures.extend(hooks);
        self
    }

    /// Register a patch at the given hook point.
    pub fn intervene<H: Into<HookPoint>>(
        &mut self,
        hook: H,
        intervention: Intervention,
    ) -> &mut Self {
        self.interventions.push((hook.into(), intervention));
        self
    }

    /// Check whether a specific hook point should be captured.
    #[must_use]
    pub fn is_captured(&self, hook: &HookPoint) -> bool {
        self.captures.contains(hook)
    }

    /// Check whether this spec has no captures and no patches.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.captures.is_empty() && self.interventions.is_empty()
    }

    /// Number of requested captures.
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }

    /// Iterate over patches registered at a specific hook point.
    pub fn interventions_at(&self, hook: &HookPoint) -> impl Iterator<Item = &Intervention> {
        self.interventions
            .iter()
            .filter(move |(h, _)| h == hook)
            .map(|(_, intervention)| intervention)
    }

    /// Capture and/or patch `tensor` at `hook`.
    ///
    /// Backends call this once per hook point: the clean activation is
    /// stored first (if requested), then every registered patch is applied
    /// in registration order.
    ///
    /// # Errors
    ///
    /// Propagates [`apply_intervention`] errors.
    pub fn tap(&self, hook: &HookPoint, tensor: Tensor, cache: &mut HookCache) -> Result<Tensor> {
        if self.is_captured(hook) {
            cache.store(hook.clone(), tensor.clone());
        }
        let mut tensor = tensor;
        for intervention in self.interventions_at(hook) {
            tensor = apply_intervention(&tensor, intervention)?;
        }
        Ok(tensor)
    }
}

// ---------------------------------------------------------------------------
// HookCache
// ---------------------------------------------------------------------------

/// Tensors captured during a forward pass, plus the output logits.
///
/// ```
/// use candle_iia::{HookCache, HookPoint};
/// use candle_core::{DType, Device, Tensor};
///
/// let logits = Tensor::zeros((1, 5, 4), DType::F32, &Device::Cpu).unwrap();
/// let mut cache = HookCache::new(logits);
///
/// let result = Tensor::zeros((1, 5, 2, 8), DType::F32, &Device::Cpu).unwrap();
/// cache.store(HookPoint::AttnResult(0), result);
///
/// assert!(cache.get(&HookPoint::AttnResult(0)).is_some());
/// ```
#[derive(Debug)]
pub struct HookCache {
    /// Output tensor from the forward pass (logits).
    output: Tensor,
    /// Captured activations keyed by hook point.
    captures: HashMap<HookPoint, Tensor>,
}

impl HookCache {
    /// Create a new cache with the given output tensor and no captures.
    #[must_use]
    pub fn new(output: Tensor) -> Self {
        Self {
            output,
            captures: HashMap::new(),
        }
    }

    /// The output tensor from the forward pass.
    #[must_use]
    pub const fn output(&self) -> &Tensor {
        &self.output
    }

    /// Consume the cache and return the output tensor.
    #[must_use]
    pub fn into_output(self) -> Tensor {
        self.output
    }

    /// Retrieve a captured tensor by hook point.
    #[must_use]
    pub fn get(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.captures.get(hook)
    }

    /// Retrieve a captured tensor, returning an error if not found.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Hook`] if the hook point was not captured.
    pub fn require(&self, hook: &HookPoint) -> Result<&Tensor> {
        self.captures
            .get(hook)
            .ok_or_else(|| IiaError::Hook(format!("hook point `{hook}` was not captured")))
    }

    /// Store a captured activation. Called by backend implementations.
    pub fn store(&mut self, hook: HookPoint, tensor: Tensor) {
        self.captures.insert(hook, tensor);
    }

    /// Replace the output tensor (e.g., after computing final logits).
    pub fn set_output(&mut self, output: Tensor) {
        self.output = output;
    }

    /// Number of captured tensors (excludes the output).
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }

    /// Captured hook points, in no particular order.
    pub fn hook_points(&self) -> impl Iterator<Item = &HookPoint> {
        self.captures.keys()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
