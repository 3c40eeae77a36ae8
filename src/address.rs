// SPDX-License-Identifier: MIT OR Apache-2.0

//! Addressing for high-level program units and low-level network locations.
//!
//! - [`HlNode`]: a unit of the compiled reference program.
//! - [`LlNode`]: a tap point (plus optional slice) in a network.
//! - [`CircuitNode`]: a location in the *full* network, independent of any
//!   correspondence.
//! - [`TensorIndex`]: a closed sub-selector for a tap point's tensor.
//!
//! High-level and low-level nodes are disjoint value types; a
//! [`Correspondence`](crate::Correspondence) relates them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{IiaError, Result};

// ---------------------------------------------------------------------------
// TensorIndex
// ---------------------------------------------------------------------------

/// Structured sub-selector into a tap point's activation tensor.
///
/// A closed variant rather than raw slice objects, so equality and hashing
/// survive serialization unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TensorIndex {
    /// No sub-selector was given.
    Unspecified,
    /// Every batch element and position: no restriction.
    Full,
    /// A single attention head: `[:, :, head, :]`.
    Head(usize),
}

impl TensorIndex {
    /// The head selected by this index, if any.
    #[must_use]
    pub const fn head(self) -> Option<usize> {
        match self {
            Self::Head(h) => Some(h),
            Self::Full | Self::Unspecified => None,
        }
    }
}

impl fmt::Display for TensorIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unspecified => write!(f, "[]"),
            Self::Full => write!(f, "[:]"),
            Self::Head(h) => write!(f, "[:, :, {h}]"),
        }
    }
}

// ---------------------------------------------------------------------------
// ComponentKind, Location
// ---------------------------------------------------------------------------

/// Which block of a layer a location lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ComponentKind {
    /// Attention block.
    Attn,
    /// MLP block.
    Mlp,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attn => write!(f, "attn"),
            Self::Mlp => write!(f, "mlp"),
        }
    }
}

impl FromStr for ComponentKind {
    type Err = IiaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "attn" => Ok(Self::Attn),
            "mlp" => Ok(Self::Mlp),
            other => Err(IiaError::InvalidComponentKind(other.to_string())),
        }
    }
}

/// Sub-unit of a [`Location`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Unit {
    /// An attention head number.
    Head(usize),
    /// An explicit structured index, passed through unchanged.
    Index(TensorIndex),
}

/// A `(layer, component, unit)` address, as emitted by the compiler for both
/// the high-level program and the low-level realizations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    /// Layer number.
    pub layer: usize,
    /// Attention or MLP.
    pub kind: ComponentKind,
    /// Optional head or explicit index.
    pub unit: Option<Unit>,
}

impl Location {
    /// Attention location, optionally restricted to one head.
    #[must_use]
    pub const fn attn(layer: usize, head: Option<usize>) -> Self {
        let unit = match head {
            Some(h) => Some(Unit::Head(h)),
            None => None,
        };
        Self {
            layer,
            kind: ComponentKind::Attn,
            unit,
        }
    }

    /// MLP location.
    #[must_use]
    pub const fn mlp(layer: usize) -> Self {
        Self {
            layer,
            kind: ComponentKind::Mlp,
            unit: None,
        }
    }

    /// Build a location from an untyped component-kind string.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::InvalidComponentKind`] unless `kind` is `attn` or `mlp`.
    pub fn parse(layer: usize, kind: &str, unit: Option<Unit>) -> Result<Self> {
        Ok(Self {
            layer,
            kind: kind.parse()?,
            unit,
        })
    }
}

// ---------------------------------------------------------------------------
// Hook naming
// ---------------------------------------------------------------------------

/// Naming convention for the produced low-level hook name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HookNameStyle {
    /// `blocks.{layer}.attn.hook_result` / `blocks.{layer}.mlp.hook_post`.
    #[default]
    HookName,
    /// `mod.blocks.{layer}.mod.{attn|mlp}.hook_point`.
    WrapperPath,
}

impl FromStr for HookNameStyle {
    type Err = IiaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hookname" => Ok(Self::HookName),
            "wrapper-path" => Ok(Self::WrapperPath),
            other => Err(IiaError::Config(format!("unknown hook name style: '{other}'"))),
        }
    }
}

/// Canonical low-level hook name for a location.
///
/// ```
/// use candle_iia::{HookNameStyle, Location, hook_name_for};
///
/// let loc = Location::attn(2, Some(1));
/// assert_eq!(hook_name_for(&loc, HookNameStyle::HookName), "blocks.2.attn.hook_result");
/// assert_eq!(hook_name_for(&loc, HookNameStyle::WrapperPath), "mod.blocks.2.mod.attn.hook_point");
/// ```
#[must_use]
pub fn hook_name_for(location: &Location, style: HookNameStyle) -> String {
    let layer = location.layer;
    match (style, location.kind) {
        (HookNameStyle::HookName, ComponentKind::Attn) => format!("blocks.{layer}.attn.hook_result"),
        (HookNameStyle::HookName, ComponentKind::Mlp) => format!("blocks.{layer}.mlp.hook_post"),
        (HookNameStyle::WrapperPath, kind) => format!("mod.blocks.{layer}.mod.{kind}.hook_point"),
    }
}

/// Structured index for a location.
///
/// Attention with a head selects `[:, :, head, :]`; MLP or an unspecified
/// unit selects every position and batch element. Explicit indices are
/// returned unchanged.
///
/// # Errors
///
/// Returns [`IiaError::Config`] if an MLP location names a head.
pub fn index_for(location: &Location) -> Result<TensorIndex> {
    match (location.kind, location.unit) {
        (_, Some(Unit::Index(index))) => Ok(index),
        (ComponentKind::Attn, Some(Unit::Head(h))) => Ok(TensorIndex::Head(h)),
        (ComponentKind::Mlp, Some(Unit::Head(h))) => Err(IiaError::Config(format!(
            "mlp location in layer {} cannot select head {h}",
            location.layer
        ))),
        (_, None) => Ok(TensorIndex::Full),
    }
}

// ---------------------------------------------------------------------------
// HlNode, LlNode
// ---------------------------------------------------------------------------

/// A high-level computational unit of the reference program.
///
/// Identity is the full `(name, label, num_classes, index)` tuple: two nodes
/// with the same name but different labels are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HlNode {
    name: String,
    label: String,
    num_classes: usize,
    index: TensorIndex,
}

impl HlNode {
    /// Create a node. `num_classes` is `0` for continuous outputs.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        label: impl Into<String>,
        num_classes: usize,
        index: TensorIndex,
    ) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            num_classes,
            index,
        }
    }

    /// Unique id within the high-level graph.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable tag used to resolve program edges.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Output cardinality, `0` if continuous.
    #[must_use]
    pub const fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Tensor sub-selector.
    #[must_use]
    pub const fn index(&self) -> TensorIndex {
        self.index
    }
}

impl fmt::Display for HlNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{} ({})", self.name, self.index, self.label)
    }
}

/// A low-level location: tap point, slice, and optional submodule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LlNode {
    hook_name: String,
    index: TensorIndex,
    submodule: Option<String>,
}

impl LlNode {
    /// Create a node without a submodule reference.
    #[must_use]
    pub fn new(hook_name: impl Into<String>, index: TensorIndex) -> Self {
        Self {
            hook_name: hook_name.into(),
            index,
            submodule: None,
        }
    }

    /// Attach a submodule reference for finer addressing.
    #[must_use]
    pub fn with_submodule(mut self, submodule: impl Into<String>) -> Self {
        self.submodule = Some(submodule.into());
        self
    }

    /// Tap point name.
    #[must_use]
    pub fn hook_name(&self) -> &str {
        &self.hook_name
    }

    /// Tensor sub-selector.
    #[must_use]
    pub const fn index(&self) -> TensorIndex {
        self.index
    }

    /// Optional submodule reference.
    #[must_use]
    pub fn submodule(&self) -> Option<&str> {
        self.submodule.as_deref()
    }

    /// The full-model location this node occupies.
    #[must_use]
    pub fn circuit_node(&self) -> CircuitNode {
        CircuitNode::new(self.hook_name.clone(), self.index.head())
    }
}

impl fmt::Display for LlNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.hook_name, self.index)
    }
}

// ---------------------------------------------------------------------------
// CircuitNode
// ---------------------------------------------------------------------------

/// A location in the full low-level model: `(hook_name, head)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CircuitNode {
    /// Tap point name.
    pub hook_name: String,
    /// Head index, `None` for whole-hook locations.
    pub head: Option<usize>,
}

impl CircuitNode {
    /// Create a circuit node.
    #[must_use]
    pub fn new(hook_name: impl Into<String>, head: Option<usize>) -> Self {
        Self {
            hook_name: hook_name.into(),
            head,
        }
    }
}

/// Rendered as `hook_name` or `hook_name[head]`; used as the results-table key.
impl fmt::Display for CircuitNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.head {
            Some(h) => write!(f, "{}[{h}]", self.hook_name),
            None => write!(f, "{}", self.hook_name),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
