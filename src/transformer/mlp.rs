// SPDX-License-Identifier: MIT OR Apache-2.0

//! Plain two-layer MLP: `W_out(act(W_in x + b_in)) + b_out`.

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::config::{Activation, ArchitectureConfig};
use crate::error::Result;
use crate::hooks::{HookCache, HookPoint, HookSpec};

/// MLP (feed-forward network) layer.
pub struct Mlp {
    /// Input weight: `[d_model, d_mlp]`.
    w_in: Tensor,
    /// Input bias: `[d_mlp]`.
    b_in: Tensor,
    /// Output weight: `[d_mlp, d_model]`.
    w_out: Tensor,
    /// Output bias: `[d_model]`.
    b_out: Tensor,
    /// Activation function.
    activation: Activation,
}

impl Mlp {
    /// Load `W_in`, `b_in`, `W_out`, `b_out` from a [`VarBuilder`].
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Model`](crate::IiaError::Model) if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: &ArchitectureConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let (d, m) = (config.d_model, config.d_mlp);
        Ok(Self {
            w_in: vb.get((d, m), "W_in")?,
            b_in: vb.get(m, "b_in")?,
            w_out: vb.get((m, d), "W_out")?,
            b_out: vb.get(d, "b_out")?,
            activation: config.act_fn,
        })
    }

    /// Run the MLP forward pass, tapping the pre- and post-activation hooks.
    ///
    /// # Shapes
    /// - `x`: `[batch, seq, d_model]`
    /// - returns: `[batch, seq, d_model]`
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Model`](crate::IiaError::Model) on tensor failures.
    pub fn forward(
        &self,
        x: &Tensor,
        layer: usize,
        hooks: &HookSpec,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        let pre = x.broadcast_matmul(&self.w_in)?.broadcast_add(&self.b_in)?;
        let pre = hooks.tap(&HookPoint::MlpPre(layer), pre, cache)?;
        let post = apply_activation(&pre, self.activation)?;
        let post = hooks.tap(&HookPoint::MlpPost(layer), post, cache)?;
        Ok(post.broadcast_matmul(&self.w_out)?.broadcast_add(&self.b_out)?)
    }
}

/// Apply the selected activation function.
fn apply_activation(x: &Tensor, activation: Activation) -> Result<Tensor> {
    match activation {
        Activation::Relu => Ok(x.relu()?),
        Activation::Gelu => Ok(x.gelu_erf()?),
    }
}
