// SPDX-License-Identifier: MIT OR Apache-2.0

//! Multi-head attention with per-head hooks.
//!
//! Weights are stored per head (`W_Q: [heads, d_model, d_head]`,
//! `W_O: [heads, d_head, d_model]`) so every head's input, query, key,
//! value, and output can be captured or patched on its own slice of the
//! head axis.

use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;

use crate::config::ArchitectureConfig;
use crate::error::Result;
use crate::hooks::{HookCache, HookPoint, HookSpec};

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

/// One per-head projection (`W` plus bias).
struct HeadProj {
    /// Weight: `[heads, d_in, d_out]`.
    weight: Tensor,
    /// Bias: `[heads, d_out]`.
    bias: Tensor,
}

impl HeadProj {
    /// Load `W_{name}` and `b_{name}`.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    fn load(name: &str, heads: usize, d_in: usize, d_out: usize, vb: VarBuilder<'_>) -> Result<Self> {
        let weight = vb.get((heads, d_in, d_out), &format!("W_{name}"))?;
        let bias = vb.get((heads, d_out), &format!("b_{name}"))?;
        Ok(Self { weight, bias })
    }

    /// Project a per-head input.
    ///
    /// # Shapes
    /// - `x`: `[batch, seq, heads, d_in]`
    /// - returns: `[batch, seq, heads, d_out]`
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // CONTIGUOUS: transpose produces non-unit strides; matmul requires contiguous layout
        let x = x.transpose(1, 2)?.contiguous()?;
        // [batch, heads, seq, d_in] @ [heads, d_in, d_out] -> [batch, heads, seq, d_out]
        let projected = x.broadcast_matmul(&self.weight)?;
        let projected = projected.broadcast_add(&self.bias.unsqueeze(1)?)?;
        Ok(projected.transpose(1, 2)?.contiguous()?)
    }
}

// ---------------------------------------------------------------------------
// Attention
// ---------------------------------------------------------------------------

/// Multi-head attention layer with hook points.
pub struct Attention {
    /// Query projection.
    q: HeadProj,
    /// Key projection.
    k: HeadProj,
    /// Value projection.
    v: HeadProj,
    /// Output weight: `[heads, d_head, d_model]`.
    w_o: Tensor,
    /// Output bias: `[d_model]`.
    b_o: Tensor,
    /// Number of heads.
    num_heads: usize,
    /// Attention scale factor `1/sqrt(d_head)`.
    scale: f64,
}

impl Attention {
    /// Load attention weights from a [`VarBuilder`].
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Model`](crate::IiaError::Model) if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: &ArchitectureConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let (h, d, dh) = (config.n_heads, config.d_model, config.d_head);
        let q = HeadProj::load("Q", h, d, dh, vb.clone())?;
        let k = HeadProj::load("K", h, d, dh, vb.clone())?;
        let v = HeadProj::load("V", h, d, dh, vb.clone())?;
        let w_o = vb.get((h, dh, d), "W_O")?;
        let b_o = vb.get(d, "b_O")?;

        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let scale = 1.0 / (dh as f64).sqrt();

        Ok(Self {
            q,
            k,
            v,
            w_o,
            b_o,
            num_heads: h,
            scale,
        })
    }

    /// Run the attention forward pass with hook capture and intervention.
    ///
    /// # Shapes
    /// - `x`: `[batch, seq, d_model]` -- residual stream
    /// - `mask`: `[1, 1, seq, seq]` or `None` for bidirectional attention
    /// - returns: `[batch, seq, d_model]` -- summed head outputs plus `b_O`
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Model`](crate::IiaError::Model) on tensor failures
    /// and [`IiaError::Intervention`](crate::IiaError::Intervention) if a patch
    /// does not fit.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        layer: usize,
        hooks: &HookSpec,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        let (batch, seq_len, d_model) = x.dims3()?;

        // --- Per-head inputs ---
        let per_head = x
            .unsqueeze(2)?
            .broadcast_as((batch, seq_len, self.num_heads, d_model))?
            .contiguous()?;
        let q_in = hooks.tap(&HookPoint::QInput(layer), per_head.clone(), cache)?;
        let k_in = hooks.tap(&HookPoint::KInput(layer), per_head.clone(), cache)?;
        let v_in = hooks.tap(&HookPoint::VInput(layer), per_head, cache)?;

        // --- Q, K, V: [batch, seq, heads, d_head] ---
        let q = hooks.tap(&HookPoint::AttnQ(layer), self.q.forward(&q_in)?, cache)?;
        let k = hooks.tap(&HookPoint::AttnK(layer), self.k.forward(&k_in)?, cache)?;
        let v = hooks.tap(&HookPoint::AttnV(layer), self.v.forward(&v_in)?, cache)?;

        // --- Attention scores: [batch, heads, seq, seq] ---
        let q = q.transpose(1, 2)?.contiguous()?;
        let k_t = k.transpose(1, 2)?.transpose(2, 3)?.contiguous()?;
        let scores = (q.matmul(&k_t)? * self.scale)?;
        let mut scores = hooks.tap(&HookPoint::AttnScores(layer), scores, cache)?;
        if let Some(mask) = mask {
            scores = scores.broadcast_add(mask)?;
        }

        // PROMOTE: softmax over F16/BF16 can produce NaN; compute in F32
        let original_dtype = scores.dtype();
        let mut pattern = candle_nn::ops::softmax_last_dim(&scores.to_dtype(DType::F32)?)?;
        if original_dtype != DType::F32 {
            pattern = pattern.to_dtype(original_dtype)?;
        }
        let pattern = hooks.tap(&HookPoint::AttnPattern(layer), pattern, cache)?;

        // --- Per-head result: [batch, seq, heads, d_model] ---
        let v = v.transpose(1, 2)?.contiguous()?;
        let z = pattern.matmul(&v)?;
        let result = z
            .broadcast_matmul(&self.w_o)?
            .transpose(1, 2)?
            .contiguous()?;
        let result = hooks.tap(&HookPoint::AttnResult(layer), result, cache)?;

        Ok(result.sum(2)?.broadcast_add(&self.b_o)?)
    }
}
