// SPDX-License-Identifier: MIT OR Apache-2.0

//! Normalization-free hooked transformer.
//!
//! The architecture compiled symbolic programs produce: token and positional
//! embeddings, `n_layers` blocks of attention followed by an MLP (both added
//! to the residual stream), and an unembedding. There is no layer norm, so
//! every hook sees exactly the quantity the compiler wrote into the residual
//! stream.
//!
//! Weight names follow the hooked-transformer convention:
//!
//! | Tensor | Shape |
//! |---|---|
//! | `embed.W_E` | `[d_vocab, d_model]` |
//! | `pos_embed.W_pos` | `[n_ctx, d_model]` |
//! | `blocks.{i}.attn.W_{Q,K,V}` | `[n_heads, d_model, d_head]` |
//! | `blocks.{i}.attn.b_{Q,K,V}` | `[n_heads, d_head]` |
//! | `blocks.{i}.attn.W_O` / `b_O` | `[n_heads, d_head, d_model]` / `[d_model]` |
//! | `blocks.{i}.mlp.W_in` / `b_in` | `[d_model, d_mlp]` / `[d_mlp]` |
//! | `blocks.{i}.mlp.W_out` / `b_out` | `[d_mlp, d_model]` / `[d_model]` |
//! | `unembed.W_U` / `b_U` | `[d_model, d_vocab_out]` / `[d_vocab_out]` |

pub(crate) mod attention;
pub(crate) mod mlp;

use std::collections::BTreeMap;

use candle_core::{DType, Module, Tensor};
use candle_nn::{Embedding, VarBuilder};

use crate::backend::IiaBackend;
use crate::config::ArchitectureConfig;
use crate::error::{IiaError, Result};
use crate::hooks::{HookCache, HookPoint, HookSpec};
use crate::util::masks;

use self::attention::Attention;
use self::mlp::Mlp;

// ---------------------------------------------------------------------------
// TransformerBlock
// ---------------------------------------------------------------------------

/// A single attention + MLP block.
struct TransformerBlock {
    /// Self-attention.
    attention: Attention,
    /// Feed-forward network.
    mlp: Mlp,
}

impl TransformerBlock {
    /// Load a single block from weights.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    fn load(config: &ArchitectureConfig, vb: VarBuilder<'_>) -> Result<Self> {
        Ok(Self {
            attention: Attention::load(config, vb.pp("attn"))?,
            mlp: Mlp::load(config, vb.pp("mlp"))?,
        })
    }
}

// ---------------------------------------------------------------------------
// HookedTransformer
// ---------------------------------------------------------------------------

/// Hooked attention + MLP transformer without normalization.
pub struct HookedTransformer {
    /// Token embedding.
    embed: Embedding,
    /// Positional embedding: `[n_ctx, d_model]`.
    pos_embed: Tensor,
    /// Transformer blocks.
    blocks: Vec<TransformerBlock>,
    /// Unembedding weight: `[d_model, d_vocab_out]`.
    w_u: Tensor,
    /// Unembedding bias: `[d_vocab_out]`.
    b_u: Tensor,
    /// Model configuration.
    config: ArchitectureConfig,
}

impl HookedTransformer {
    /// Load a hooked transformer from a [`VarBuilder`].
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Config`] if a dimension is zero and
    /// [`IiaError::Model`] if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: ArchitectureConfig, vb: VarBuilder<'_>) -> Result<Self> {
        config.validate()?;

        let w_e = vb
            .pp("embed")
            .get((config.d_vocab, config.d_model), "W_E")?;
        let embed = Embedding::new(w_e, config.d_model);
        let pos_embed = vb
            .pp("pos_embed")
            .get((config.n_ctx, config.d_model), "W_pos")?;

        let mut blocks = Vec::with_capacity(config.n_layers);
        for i in 0..config.n_layers {
            blocks.push(TransformerBlock::load(&config, vb.pp(format!("blocks.{i}")))?);
        }

        let vb_u = vb.pp("unembed");
        let w_u = vb_u.get((config.d_model, config.d_vocab_out), "W_U")?;
        let b_u = vb_u.get(config.d_vocab_out, "b_U")?;

        Ok(Self {
            embed,
            pos_embed,
            blocks,
            w_u,
            b_u,
            config,
        })
    }
}

// ---------------------------------------------------------------------------
// IiaBackend implementation
// ---------------------------------------------------------------------------

impl IiaBackend for HookedTransformer {
    fn config(&self) -> &ArchitectureConfig {
        &self.config
    }

    fn hook_registry(&self, batch: usize, seq: usize) -> BTreeMap<HookPoint, Vec<usize>> {
        let c = &self.config;
        let (h, d) = (c.n_heads, c.d_model);
        let mut registry = BTreeMap::new();
        registry.insert(HookPoint::Embed, vec![batch, seq, d]);
        registry.insert(HookPoint::PosEmbed, vec![batch, seq, d]);
        for i in 0..c.n_layers {
            registry.insert(HookPoint::ResidPre(i), vec![batch, seq, d]);
            registry.insert(HookPoint::QInput(i), vec![batch, seq, h, d]);
            registry.insert(HookPoint::KInput(i), vec![batch, seq, h, d]);
            registry.insert(HookPoint::VInput(i), vec![batch, seq, h, d]);
            registry.insert(HookPoint::AttnQ(i), vec![batch, seq, h, c.d_head]);
            registry.insert(HookPoint::AttnK(i), vec![batch, seq, h, c.d_head]);
            registry.insert(HookPoint::AttnV(i), vec![batch, seq, h, c.d_head]);
            registry.insert(HookPoint::AttnScores(i), vec![batch, h, seq, seq]);
            registry.insert(HookPoint::AttnPattern(i), vec![batch, h, seq, seq]);
            registry.insert(HookPoint::AttnResult(i), vec![batch, seq, h, d]);
            registry.insert(HookPoint::AttnOut(i), vec![batch, seq, d]);
            registry.insert(HookPoint::ResidMid(i), vec![batch, seq, d]);
            registry.insert(HookPoint::MlpIn(i), vec![batch, seq, d]);
            registry.insert(HookPoint::MlpPre(i), vec![batch, seq, c.d_mlp]);
            registry.insert(HookPoint::MlpPost(i), vec![batch, seq, c.d_mlp]);
            registry.insert(HookPoint::MlpOut(i), vec![batch, seq, d]);
            registry.insert(HookPoint::ResidPost(i), vec![batch, seq, d]);
        }
        registry
    }

    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        let device = input_ids.device();
        let (batch, seq_len) = input_ids.dims2()?;
        if seq_len > self.config.n_ctx {
            return Err(IiaError::DataMismatch(format!(
                "sequence length {seq_len} exceeds context length {}",
                self.config.n_ctx
            )));
        }

        // Capture cache; output set at the end.
        let mut cache = HookCache::new(Tensor::zeros(1, DType::F32, device)?);

        // --- Embeddings ---
        let embed = self.embed.forward(input_ids)?;
        let embed = hooks.tap(&HookPoint::Embed, embed, &mut cache)?;
        let pos = self
            .pos_embed
            .narrow(0, 0, seq_len)?
            .unsqueeze(0)?
            .broadcast_as((batch, seq_len, self.config.d_model))?
            .contiguous()?;
        let pos = hooks.tap(&HookPoint::PosEmbed, pos, &mut cache)?;
        let mut resid = (embed + pos)?;

        let mask = if self.config.causal {
            Some(masks::create_causal_mask(seq_len, device, resid.dtype())?)
        } else {
            None
        };

        // --- Block loop ---
        for (i, block) in self.blocks.iter().enumerate() {
            resid = hooks.tap(&HookPoint::ResidPre(i), resid, &mut cache)?;

            let attn_out = block
                .attention
                .forward(&resid, mask.as_ref(), i, hooks, &mut cache)?;
            let attn_out = hooks.tap(&HookPoint::AttnOut(i), attn_out, &mut cache)?;
            let resid_mid = hooks.tap(&HookPoint::ResidMid(i), (resid + attn_out)?, &mut cache)?;

            let mlp_in = hooks.tap(&HookPoint::MlpIn(i), resid_mid.clone(), &mut cache)?;
            let mlp_out = block.mlp.forward(&mlp_in, i, hooks, &mut cache)?;
            let mlp_out = hooks.tap(&HookPoint::MlpOut(i), mlp_out, &mut cache)?;

            resid = hooks.tap(&HookPoint::ResidPost(i), (resid_mid + mlp_out)?, &mut cache)?;
        }

        // --- Unembed ---
        let logits = resid.broadcast_matmul(&self.w_u)?.broadcast_add(&self.b_u)?;
        cache.set_output(logits);

        Ok(cache)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashMap;

    use candle_core::Device;

    use super::*;
    use crate::hooks::Intervention;

    fn tiny_config() -> ArchitectureConfig {
        ArchitectureConfig {
            n_layers: 2,
            n_heads: 2,
            d_model: 6,
            d_head: 3,
            d_mlp: 4,
            d_vocab: 5,
            d_vocab_out: 5,
            n_ctx: 4,
            categorical: true,
            causal: true,
            act_fn: crate::config::Activation::Relu,
        }
    }

    /// Deterministic non-trivial weights: `sin` of a running counter.
    fn tiny_model() -> HookedTransformer {
        let config = tiny_config();
        let device = Device::Cpu;
        let (h, d, dh, m) = (config.n_heads, config.d_model, config.d_head, config.d_mlp);
        let mut counter = 0.0_f32;
        let mut make = |shape: &[usize]| {
            let n: usize = shape.iter().product();
            let data: Vec<f32> = (0..n)
                .map(|_| {
                    counter += 1.0;
                    (counter * 0.37).sin() * 0.5
                })
                .collect();
            Tensor::from_vec(data, shape, &device).unwrap()
        };
        let mut tensors = HashMap::new();
        tensors.insert("embed.W_E".to_string(), make(&[config.d_vocab, d]));
        tensors.insert("pos_embed.W_pos".to_string(), make(&[config.n_ctx, d]));
        for i in 0..config.n_layers {
            for p in ["Q", "K", "V"] {
                tensors.insert(format!("blocks.{i}.attn.W_{p}"), make(&[h, d, dh]));
                tensors.insert(format!("blocks.{i}.attn.b_{p}"), make(&[h, dh]));
            }
            tensors.insert(format!("blocks.{i}.attn.W_O"), make(&[h, dh, d]));
            tensors.insert(format!("blocks.{i}.attn.b_O"), make(&[d]));
            tensors.insert(format!("blocks.{i}.mlp.W_in"), make(&[d, m]));
            tensors.insert(format!("blocks.{i}.mlp.b_in"), make(&[m]));
            tensors.insert(format!("blocks.{i}.mlp.W_out"), make(&[m, d]));
            tensors.insert(format!("blocks.{i}.mlp.b_out"), make(&[d]));
        }
        tensors.insert("unembed.W_U".to_string(), make(&[d, config.d_vocab_out]));
        tensors.insert("unembed.b_U".to_string(), make(&[config.d_vocab_out]));
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        HookedTransformer::load(config, vb).unwrap()
    }

    fn input() -> Tensor {
        Tensor::new(&[[0_u32, 1, 2, 3], [0, 3, 2, 1]], &Device::Cpu).unwrap()
    }

    #[test]
    fn output_shape() {
        let model = tiny_model();
        let logits = model.run(&input()).unwrap();
        assert_eq!(logits.dims(), &[2, 4, 5]);
    }

    #[test]
    fn captured_shapes_match_registry() {
        let model = tiny_model();
        let cache = model.run_with_cache(&input()).unwrap();
        for (hook, shape) in model.hook_registry(2, 4) {
            let tensor = cache.require(&hook).unwrap();
            assert_eq!(tensor.dims(), shape.as_slice(), "shape of {hook}");
        }
    }

    #[test]
    fn head_outputs_sum_to_attn_out() {
        let model = tiny_model();
        let cache = model.run_with_cache(&input()).unwrap();
        let result = cache.require(&HookPoint::AttnResult(0)).unwrap();
        let attn_out = cache.require(&HookPoint::AttnOut(0)).unwrap();
        let b_o = attn_out.sub(&result.sum(2).unwrap()).unwrap();
        // The difference is b_O broadcast over batch and position.
        let rows = b_o.flatten_to(1).unwrap().to_vec2::<f32>().unwrap();
        for row in &rows[1..] {
            for (a, b) in row.iter().zip(&rows[0]) {
                assert!((a - b).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn patch_is_scoped_to_one_call() {
        let model = tiny_model();
        let ids = input();
        let clean = model.run(&ids).unwrap();

        let cache = model.run_with_cache(&ids).unwrap();
        let embed = cache.require(&HookPoint::Embed).unwrap();
        let mut hooks = HookSpec::new();
        hooks.intervene(HookPoint::Embed, Intervention::Replace(embed.zeros_like().unwrap()));
        let patched = model.forward(&ids, &hooks).unwrap().into_output();
        let diff = (patched - &clean).unwrap().abs().unwrap().sum_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() > 0.0);

        let again = model.run(&ids).unwrap();
        let diff = (again - &clean).unwrap().abs().unwrap().sum_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-6);
    }

    #[test]
    fn sequence_longer_than_context_is_rejected() {
        let model = tiny_model();
        let ids = Tensor::zeros((1, 5), DType::U32, &Device::Cpu).unwrap();
        assert!(matches!(model.run(&ids), Err(IiaError::DataMismatch(_))));
    }
}
