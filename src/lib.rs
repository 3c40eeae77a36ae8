// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-iia
//!
//! Interchange intervention accuracy (IIA) between a compiled reference
//! program and a trained transformer, built on
//! [candle](https://github.com/huggingface/candle).
//!
//! A [`Correspondence`] maps each high-level program node to the low-level
//! network locations realizing it. The evaluator then ablates every
//! eligible location (zero, mean, or resample) in both networks at once and
//! measures whether they still agree, producing a [`ResultsTable`] keyed by
//! location with an in-circuit flag from the correspondence.
//!
//! Networks implement [`IiaBackend`]: a hook registry plus a forward pass
//! that takes a per-call [`HookSpec`] of captures and patches. Patches live
//! only for that call, so nothing has to be reverted between locations.
//!
//! ## Backends
//!
//! - **Hooked transformer**: attention + MLP without normalization, the
//!   shape compiled programs take (feature: `transformer`).
//!
//! ## Quick start
//!
//! ```ignore
//! use candle_iia::{EvalConfig, evaluate_iia_on_all_ablation_types};
//!
//! let table = evaluate_iia_on_all_ablation_types(
//!     &base, &hypothesis, &clean, &corrupted, &ground_truth, &EvalConfig::default(),
//! )?;
//! table.save_csv("iia.csv")?;
//! ```

#![warn(missing_docs)]

pub mod ablation;
pub mod address;
pub mod backend;
pub mod circuit;
pub mod config;
pub mod correspondence;
pub mod data;
pub mod error;
pub mod eval;
pub mod hooks;
pub mod report;
pub mod sampler;
#[cfg(feature = "transformer")]
pub mod transformer;
#[cfg(feature = "transformer")]
pub(crate) mod util;

pub use ablation::{AblationType, ActivationCaches, PatchPair, replacement_value};
pub use address::{
    CircuitNode, ComponentKind, HlNode, HookNameStyle, LlNode, Location, TensorIndex, Unit,
    hook_name_for, index_for,
};
pub use backend::{IiaBackend, check_comparable};
pub use config::{Activation, ArchitectureConfig, EvalConfig, Granularity};
pub use correspondence::{
    BasisDirection, BuildOptions, Correspondence, EdgeCorr, MissingPolicy, ProgramGraph,
    ProgramNode, Realization, RealizationMap, derive_edges,
};
pub use data::{CaseDataset, Example, InputGenerator, total_input_space, unique_data};
pub use error::{IiaError, Result};
pub use eval::{
    IiaSession, NodeMetrics, evaluate_iia, evaluate_iia_on_all_ablation_types,
    resampling_ablation_loss,
};
pub use hooks::{HookCache, HookPoint, HookSpec, Intervention, apply_intervention};
pub use report::{ResultRow, ResultsTable};
pub use sampler::{CombinatorialSampler, assignment_for_index};
#[cfg(feature = "transformer")]
pub use transformer::HookedTransformer;
