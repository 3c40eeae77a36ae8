// SPDX-License-Identifier: MIT OR Apache-2.0

//! Architecture metadata and evaluation settings.
//!
//! [`ArchitectureConfig`] describes a compiled (normalization-free)
//! transformer and is parsed from the compiler's JSON config.
//! [`EvalConfig`] carries the knobs of an intervention sweep.
//!
//! ```
//! use candle_iia::ArchitectureConfig;
//!
//! let json: serde_json::Value = serde_json::from_str(r#"{
//!     "n_layers": 2, "n_heads": 1, "d_model": 16, "d_head": 4,
//!     "d_mlp": 8, "d_vocab": 5, "n_ctx": 6, "categorical": true
//! }"#).unwrap();
//! let config = ArchitectureConfig::from_json(&json).unwrap();
//! assert_eq!(config.d_vocab_out, 5);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ablation::AblationType;
use crate::error::{IiaError, Result};

// ---------------------------------------------------------------------------
// ArchitectureConfig
// ---------------------------------------------------------------------------

/// Dimensions of a hooked transformer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchitectureConfig {
    /// Number of layers.
    pub n_layers: usize,
    /// Attention heads per layer.
    pub n_heads: usize,
    /// Residual stream width.
    pub d_model: usize,
    /// Dimension per head.
    pub d_head: usize,
    /// MLP hidden width.
    pub d_mlp: usize,
    /// Input vocabulary size.
    pub d_vocab: usize,
    /// Output vocabulary size (number of classes, or 1 for continuous outputs).
    pub d_vocab_out: usize,
    /// Context length, including the beginning-of-sequence position.
    pub n_ctx: usize,
    /// Whether outputs are categorical logits.
    pub categorical: bool,
    /// Whether attention is causally masked.
    pub causal: bool,
    /// MLP activation function.
    pub act_fn: Activation,
}

/// MLP activation function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// Rectified linear unit (compiled programs).
    #[default]
    Relu,
    /// GELU with exact erf.
    Gelu,
}

impl Activation {
    /// Parse an activation name as written in model configs.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Config`] for unknown names.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "relu" => Ok(Self::Relu),
            "gelu" | "gelu_new" => Ok(Self::Gelu),
            other => Err(IiaError::Config(format!("unsupported act_fn '{other}'"))),
        }
    }
}

impl ArchitectureConfig {
    /// Parse from the compiler's JSON config.
    ///
    /// `d_vocab_out` defaults to `d_vocab` for categorical models and `1`
    /// otherwise; `d_head` defaults to `d_model / n_heads`; `causal`
    /// defaults to `true` and `act_fn` to `"relu"`.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Config`] if a required field is missing or a
    /// dimension is zero.
    pub fn from_json(config: &Value) -> Result<Self> {
        let n_heads = get_usize(config, "n_heads")?;
        let d_model = get_usize(config, "d_model")?;
        let d_vocab = get_usize(config, "d_vocab")?;
        let categorical = get_bool_or(config, "categorical", true);
        if n_heads == 0 {
            return Err(IiaError::Config("n_heads is 0".into()));
        }

        let parsed = Self {
            n_layers: get_usize(config, "n_layers")?,
            n_heads,
            d_model,
            d_head: get_usize_or(config, "d_head", d_model / n_heads),
            d_mlp: get_usize(config, "d_mlp")?,
            d_vocab,
            d_vocab_out: get_usize_or(config, "d_vocab_out", if categorical { d_vocab } else { 1 }),
            n_ctx: get_usize(config, "n_ctx")?,
            categorical,
            causal: get_bool_or(config, "causal", true),
            act_fn: match config.get("act_fn").and_then(Value::as_str) {
                Some(name) => Activation::from_name(name)?,
                None => Activation::default(),
            },
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Check that no dimension is zero.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Config`] naming the first zero dimension.
    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("n_layers", self.n_layers),
            ("n_heads", self.n_heads),
            ("d_model", self.d_model),
            ("d_head", self.d_head),
            ("d_mlp", self.d_mlp),
            ("d_vocab", self.d_vocab),
            ("d_vocab_out", self.d_vocab_out),
            ("n_ctx", self.n_ctx),
        ];
        for (name, value) in dims {
            if value == 0 {
                return Err(IiaError::Config(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EvalConfig
// ---------------------------------------------------------------------------

/// Which attention locations a sweep visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// Head outputs only; query/key/value locations are skipped.
    #[default]
    Head,
    /// Also visit query/key/value locations.
    Qkv,
}

/// Settings for an intervention sweep.
///
/// ```
/// use candle_iia::EvalConfig;
///
/// let config: EvalConfig = serde_json::from_str(r#"{"accuracy_atol": 0.05}"#).unwrap();
/// assert_eq!(config.ablation_types.len(), 3);
/// assert!((config.accuracy_atol - 0.05).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// Location granularity.
    pub granularity: Granularity,
    /// Ablation types to sweep, in order.
    pub ablation_types: Vec<AblationType>,
    /// Tolerance for continuous-output agreement.
    pub accuracy_atol: f64,
    /// Tolerance when deciding whether clean and corrupted ground truths differ.
    pub effective_accuracy_atol: f64,
    /// Number of clean (and corrupted) examples.
    pub data_size: usize,
    /// Budget of joint assignments for combinatorial sampling.
    pub max_interventions: usize,
    /// Mini-batch size for joint-intervention loss.
    pub batch_size: usize,
    /// Seed for every randomized step.
    pub seed: u64,
    /// Substrings selecting joint intervention points; `None` uses the defaults.
    pub hook_filters: Option<Vec<String>>,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            granularity: Granularity::Head,
            ablation_types: AblationType::ALL.to_vec(),
            accuracy_atol: 1e-2,
            effective_accuracy_atol: 1e-6,
            data_size: 1_000,
            max_interventions: 100,
            batch_size: 2048,
            seed: 0,
            hook_filters: None,
        }
    }
}

impl EvalConfig {
    /// Parse from a JSON object; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::UnsupportedAblationType`] for an ablation type
    /// outside `zero`, `mean`, `resample`, and [`IiaError::Json`] for any
    /// other malformed field.
    pub fn from_json(config: &Value) -> Result<Self> {
        if let Some(types) = config.get("ablation_types").and_then(Value::as_array) {
            for name in types.iter().filter_map(Value::as_str) {
                name.parse::<AblationType>()?;
            }
        }
        Ok(Self::deserialize(config)?)
    }
}

// ---------------------------------------------------------------------------
// JSON helpers
// ---------------------------------------------------------------------------

/// Extract a required `usize` field.
fn get_usize(config: &Value, key: &str) -> Result<usize> {
    let val = config
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| IiaError::Config(format!("missing or invalid field '{key}'")))?;
    usize::try_from(val)
        .map_err(|_| IiaError::Config(format!("field '{key}' value {val} overflows usize")))
}

/// Extract an optional `usize` field, returning a default if absent.
fn get_usize_or(config: &Value, key: &str, default: usize) -> usize {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
        .unwrap_or(default)
}

/// Extract a `bool` field, returning a default if absent.
fn get_bool_or(config: &Value, key: &str, default: bool) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
