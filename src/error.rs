// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-iia.

/// Errors that can occur while building correspondences or running
/// intervention sweeps.
#[derive(Debug, thiserror::Error)]
pub enum IiaError {
    /// Forward pass or tensor operation error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Hook capture or lookup error.
    #[error("hook error: {0}")]
    Hook(String),

    /// Patch construction or application error (including shape mismatches).
    #[error("intervention error: {0}")]
    Intervention(String),

    /// Configuration parsing error.
    #[error("config error: {0}")]
    Config(String),

    /// Requested ablation type is not one of `zero`, `mean`, `resample`.
    #[error("unsupported ablation type: '{0}'")]
    UnsupportedAblationType(String),

    /// A high-level node has no entry in the low-level realization map.
    #[error("no low-level realization for ({label}, {value})")]
    MissingRealization {
        /// Label of the high-level node.
        label: String,
        /// Value of the high-level node's basis direction (`None` rendered as `-`).
        value: String,
    },

    /// The two networks under comparison are not architecturally comparable.
    #[error("architecture mismatch on `{field}`: base={base}, hypothesis={hypothesis}")]
    ArchitectureMismatch {
        /// Name of the differing metadata field.
        field: &'static str,
        /// Value in the base network.
        base: usize,
        /// Value in the hypothesis network.
        hypothesis: usize,
    },

    /// Clean and corrupted data violate a precondition.
    #[error("data mismatch: {0}")]
    DataMismatch(String),

    /// Component kind is neither `attn` nor `mlp`.
    #[error("invalid component kind: '{0}' (expected 'attn' or 'mlp')")]
    InvalidComponentKind(String),

    /// Binary (CBOR) serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_cbor::Error),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for candle-iia operations.
pub type Result<T> = std::result::Result<T, IiaError>;
