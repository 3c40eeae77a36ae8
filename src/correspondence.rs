// SPDX-License-Identifier: MIT OR Apache-2.0

//! High-level ↔ low-level correspondence.
//!
//! A [`Correspondence`] maps every [`HlNode`] of a compiled program to the
//! set of [`LlNode`]s realizing it in a network, or to the explicit
//! [`Realization::Unmapped`] sentinel. It is built once per
//! (program, network) pair, read-only afterwards, and persisted as CBOR.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::address::{HlNode, HookNameStyle, LlNode, Location, TensorIndex, hook_name_for, index_for};
use crate::backend::IiaBackend;
use crate::error::{IiaError, Result};

// ---------------------------------------------------------------------------
// Program graph (compiler output)
// ---------------------------------------------------------------------------

/// A `(label, value)` pair naming one direction of the program's residual basis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BasisDirection {
    /// Label of the program variable.
    pub name: String,
    /// Value for categorical directions, `None` for the whole variable.
    pub value: Option<String>,
}

impl BasisDirection {
    /// Direction covering a whole variable.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    /// Direction for one value of a categorical variable.
    #[must_use]
    pub fn with_value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }
}

/// One unit of the compiled program and where it lives in the reference model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramNode {
    /// Basis direction written by this unit.
    pub basis: BasisDirection,
    /// Location in the reference (high-level) model.
    pub location: Location,
    /// Output cardinality, `0` if continuous.
    pub num_classes: usize,
}

/// The high-level program graph produced by the compiler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramGraph {
    /// Program units.
    pub nodes: Vec<ProgramNode>,
    /// Directed edges between labels.
    pub edges: Vec<(String, String)>,
}

/// Low-level realizations keyed by `(label, value)`.
pub type RealizationMap = HashMap<BasisDirection, Vec<Location>>;

// ---------------------------------------------------------------------------
// Correspondence
// ---------------------------------------------------------------------------

/// What a high-level node maps to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Realization {
    /// Non-empty set of realizing low-level locations.
    Mapped(BTreeSet<LlNode>),
    /// Explicitly recorded as having no low-level realization.
    Unmapped,
}

/// How [`Correspondence::from_realizations`] treats a node with no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingPolicy {
    /// Fail with [`IiaError::MissingRealization`].
    #[default]
    Fail,
    /// Record [`Realization::Unmapped`] and continue.
    MarkUnmapped,
}

/// Options for [`Correspondence::build`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Naming style for high-level node names (and identity low-level nodes).
    pub style: HookNameStyle,
    /// Behavior when a node has no realization.
    pub on_missing: MissingPolicy,
}

/// Mapping from high-level nodes to their low-level realizations.
///
/// Equality is set equality: insertion order never matters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correspondence {
    entries: BTreeMap<HlNode, Realization>,
}

impl Correspondence {
    /// Create an empty correspondence.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a correspondence for `graph` realized in `network`.
    ///
    /// Without a realization map, falls back to the identity correspondence
    /// (with a warning). With one, every realizing hook must exist in the
    /// network's hook registry.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::MissingRealization`] per `options.on_missing`,
    /// [`IiaError::Hook`] if a realization names a hook the network lacks,
    /// and address errors from [`index_for`].
    pub fn build(
        graph: &ProgramGraph,
        network: &dyn IiaBackend,
        realizations: Option<&RealizationMap>,
        options: BuildOptions,
    ) -> Result<Self> {
        let Some(realizations) = realizations else {
            tracing::warn!(
                "no low-level realizations given; using the identity correspondence of the high-level model"
            );
            return Self::identity(graph, options.style);
        };

        let corr = Self::from_realizations(graph, realizations, options)?;
        let registry: BTreeSet<String> = network
            .hook_points()
            .iter()
            .map(ToString::to_string)
            .collect();
        for ll in corr.ll_nodes() {
            if !registry.contains(ll.hook_name()) {
                return Err(IiaError::Hook(format!(
                    "realization `{ll}` names a hook the network does not expose"
                )));
            }
        }
        Ok(corr)
    }

    /// Identity correspondence: each high-level node maps to exactly one
    /// low-level node at its own address.
    ///
    /// For ground-truth-only debugging; never evidence of alignment.
    ///
    /// # Errors
    ///
    /// Returns address errors from [`index_for`].
    pub fn identity(graph: &ProgramGraph, style: HookNameStyle) -> Result<Self> {
        let mut corr = Self::new();
        for node in &graph.nodes {
            let hook_name = hook_name_for(&node.location, style);
            let index = index_for(&node.location)?;
            let hl = HlNode::new(hook_name.clone(), node.basis.name.clone(), node.num_classes, index);
            corr.insert(hl, [LlNode::new(hook_name, index)])?;
        }
        Ok(corr)
    }

    /// Resolve every program node against `realizations`.
    ///
    /// Low-level hook names always use [`HookNameStyle::HookName`].
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::MissingRealization`] under [`MissingPolicy::Fail`].
    pub fn from_realizations(
        graph: &ProgramGraph,
        realizations: &RealizationMap,
        options: BuildOptions,
    ) -> Result<Self> {
        let mut corr = Self::new();
        for node in &graph.nodes {
            let hl = HlNode::new(
                hook_name_for(&node.location, options.style),
                node.basis.name.clone(),
                node.num_classes,
                index_for(&node.location)?,
            );

            match realizations.get(&node.basis).filter(|locs| !locs.is_empty()) {
                Some(locations) => {
                    let lls = locations
                        .iter()
                        .map(|loc| -> Result<LlNode> {
                            Ok(LlNode::new(
                                hook_name_for(loc, HookNameStyle::HookName),
                                index_for(loc)?,
                            ))
                        })
                        .collect::<Result<Vec<_>>>()?;
                    corr.insert(hl, lls)?;
                }
                None => match options.on_missing {
                    MissingPolicy::Fail => {
                        return Err(IiaError::MissingRealization {
                            label: node.basis.name.clone(),
                            value: node.basis.value.clone().unwrap_or_else(|| "-".into()),
                        });
                    }
                    MissingPolicy::MarkUnmapped => corr.mark_unmapped(hl),
                },
            }
        }
        Ok(corr)
    }

    /// Add realizations for `hl`, merging with any already present.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Config`] if `lls` is empty; use
    /// [`mark_unmapped`](Self::mark_unmapped) for the sentinel.
    pub fn insert<I>(&mut self, hl: HlNode, lls: I) -> Result<()>
    where
        I: IntoIterator<Item = LlNode>,
    {
        let lls: BTreeSet<LlNode> = lls.into_iter().collect();
        if lls.is_empty() {
            return Err(IiaError::Config(format!(
                "empty realization set for `{hl}`"
            )));
        }
        match self.entries.get_mut(&hl) {
            Some(Realization::Mapped(existing)) => existing.extend(lls),
            _ => {
                self.entries.insert(hl, Realization::Mapped(lls));
            }
        }
        Ok(())
    }

    /// Record `hl` as having no low-level realization, unless it already has one.
    pub fn mark_unmapped(&mut self, hl: HlNode) {
        self.entries.entry(hl).or_insert(Realization::Unmapped);
    }

    /// What `hl` maps to.
    #[must_use]
    pub fn get(&self, hl: &HlNode) -> Option<&Realization> {
        self.entries.get(hl)
    }

    /// Realizing low-level nodes of `hl`, `None` if absent or unmapped.
    #[must_use]
    pub fn realizations(&self, hl: &HlNode) -> Option<&BTreeSet<LlNode>> {
        match self.entries.get(hl) {
            Some(Realization::Mapped(lls)) => Some(lls),
            Some(Realization::Unmapped) | None => None,
        }
    }

    /// Whether `hl` is recorded with the unmapped sentinel.
    #[must_use]
    pub fn is_unmapped(&self, hl: &HlNode) -> bool {
        matches!(self.entries.get(hl), Some(Realization::Unmapped))
    }

    /// Number of high-level nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no high-level nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(node, realization)` pairs in node order.
    pub fn iter(&self) -> impl Iterator<Item = (&HlNode, &Realization)> {
        self.entries.iter()
    }

    /// High-level nodes whose label is `label`.
    pub fn nodes_with_label<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a HlNode> {
        self.entries.keys().filter(move |hl| hl.label() == label)
    }

    /// Every low-level node appearing in some realization.
    #[must_use]
    pub fn ll_nodes(&self) -> BTreeSet<&LlNode> {
        self.entries
            .values()
            .filter_map(|r| match r {
                Realization::Mapped(lls) => Some(lls.iter()),
                Realization::Unmapped => None,
            })
            .flatten()
            .collect()
    }

    // --- Persistence -----------------------------------------------------

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Serialization`] on encoder failure.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_cbor::to_vec(self)?)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Serialization`] on malformed input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_cbor::from_slice(bytes)?)
    }

    /// Write to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Io`] or [`IiaError::Serialization`].
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// Read from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Io`] or [`IiaError::Serialization`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_bytes(&fs::read(path)?)
    }
}

// ---------------------------------------------------------------------------
// Edge correspondence
// ---------------------------------------------------------------------------

/// Low-level realization of one high-level edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeCorr {
    /// Source tap point.
    pub hookpoint_from: String,
    /// Source slice.
    pub index_from: TensorIndex,
    /// Destination tap point.
    pub hookpoint_to: String,
    /// Destination slice.
    pub index_to: TensorIndex,
}

/// Realize high-level edges `(from_label, to_label)` in the low-level network.
///
/// Endpoints are matched by label, not name. An edge with an endpoint that
/// has no matching (mapped) node is skipped: not every abstract edge has a
/// low-level realization. Self-loops are skipped as well. Matched edges
/// yield the cross product of both endpoints' realizations.
#[must_use]
pub fn derive_edges(edges: &[(String, String)], corr: &Correspondence) -> Vec<EdgeCorr> {
    let mut out = Vec::new();
    for (from_label, to_label) in edges {
        if from_label == to_label {
            continue;
        }
        let froms: BTreeSet<&LlNode> = corr
            .nodes_with_label(from_label)
            .filter_map(|hl| corr.realizations(hl))
            .flatten()
            .collect();
        let tos: BTreeSet<&LlNode> = corr
            .nodes_with_label(to_label)
            .filter_map(|hl| corr.realizations(hl))
            .flatten()
            .collect();

        for ll_from in &froms {
            for ll_to in &tos {
                out.push(EdgeCorr {
                    hookpoint_from: ll_from.hook_name().to_string(),
                    index_from: ll_from.index(),
                    hookpoint_to: ll_to.hook_name().to_string(),
                    index_to: ll_to.index(),
                });
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn graph() -> ProgramGraph {
        ProgramGraph {
            nodes: vec![
                ProgramNode {
                    basis: BasisDirection::new("map_x"),
                    location: Location::mlp(0),
                    num_classes: 0,
                },
                ProgramNode {
                    basis: BasisDirection::new("select_prev"),
                    location: Location::attn(1, Some(0)),
                    num_classes: 5,
                },
            ],
            edges: vec![
                ("tokens".into(), "map_x".into()),
                ("map_x".into(), "select_prev".into()),
            ],
        }
    }

    #[test]
    fn identity_maps_one_to_one() {
        let corr = Correspondence::identity(&graph(), HookNameStyle::HookName).unwrap();
        assert_eq!(corr.len(), 2);
        for (hl, realization) in corr.iter() {
            let Realization::Mapped(lls) = realization else {
                panic!("identity entries are always mapped");
            };
            assert_eq!(lls.len(), 1);
            let ll = lls.iter().next().unwrap();
            assert_eq!(ll.hook_name(), hl.name());
            assert_eq!(ll.index(), hl.index());
        }
    }

    #[test]
    fn missing_realization_fails_or_marks() {
        let mut realizations = RealizationMap::new();
        realizations.insert(BasisDirection::new("map_x"), vec![Location::mlp(0)]);

        let err = Correspondence::from_realizations(&graph(), &realizations, BuildOptions::default())
            .unwrap_err();
        assert!(matches!(err, IiaError::MissingRealization { ref label, .. } if label == "select_prev"));

        let corr = Correspondence::from_realizations(
            &graph(),
            &realizations,
            BuildOptions {
                on_missing: MissingPolicy::MarkUnmapped,
                ..BuildOptions::default()
            },
        )
        .unwrap();
        let unmapped = corr.nodes_with_label("select_prev").next().unwrap().clone();
        assert!(corr.is_unmapped(&unmapped));
        assert!(corr.realizations(&unmapped).is_none());
    }

    #[test]
    fn realizations_use_hook_name_style() {
        let mut realizations = RealizationMap::new();
        realizations.insert(
            BasisDirection::new("map_x"),
            vec![Location::mlp(0), Location::attn(0, Some(1))],
        );
        realizations.insert(BasisDirection::new("select_prev"), vec![Location::attn(1, Some(0))]);

        let corr = Correspondence::from_realizations(
            &graph(),
            &realizations,
            BuildOptions {
                style: HookNameStyle::WrapperPath,
                ..BuildOptions::default()
            },
        )
        .unwrap();
        let hl = corr.nodes_with_label("map_x").next().unwrap();
        assert_eq!(hl.name(), "mod.blocks.0.mod.mlp.hook_point");
        let names: Vec<_> = corr.realizations(hl).unwrap().iter().map(LlNode::to_string).collect();
        assert_eq!(
            names,
            vec!["blocks.0.attn.hook_result[:, :, 1]", "blocks.0.mlp.hook_post[:]"]
        );
    }

    #[test]
    fn categorical_direction_needs_matching_value() {
        let graph = ProgramGraph {
            nodes: vec![ProgramNode {
                basis: BasisDirection::with_value("select_prev", "3"),
                location: Location::attn(1, Some(0)),
                num_classes: 5,
            }],
            edges: Vec::new(),
        };
        let mut realizations = RealizationMap::new();
        realizations.insert(BasisDirection::new("select_prev"), vec![Location::attn(0, Some(1))]);
        let err = Correspondence::from_realizations(&graph, &realizations, BuildOptions::default())
            .unwrap_err();
        assert!(matches!(err, IiaError::MissingRealization { ref value, .. } if value == "3"));

        realizations.insert(
            BasisDirection::with_value("select_prev", "3"),
            vec![Location::attn(0, Some(1))],
        );
        let corr =
            Correspondence::from_realizations(&graph, &realizations, BuildOptions::default()).unwrap();
        assert_eq!(corr.len(), 1);
    }

    #[test]
    fn equality_ignores_insertion_order() {
        let a_hl = HlNode::new("a", "a", 0, TensorIndex::Full);
        let b_hl = HlNode::new("b", "b", 0, TensorIndex::Full);
        let x = LlNode::new("x", TensorIndex::Full);
        let y = LlNode::new("y", TensorIndex::Head(0));

        let mut first = Correspondence::new();
        first.insert(a_hl.clone(), [x.clone(), y.clone()]).unwrap();
        first.insert(b_hl.clone(), [x.clone()]).unwrap();

        let mut second = Correspondence::new();
        second.insert(b_hl, [x.clone()]).unwrap();
        second.insert(a_hl, [y, x]).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn empty_insert_rejected() {
        let mut corr = Correspondence::new();
        let err = corr
            .insert(HlNode::new("a", "a", 0, TensorIndex::Full), Vec::new())
            .unwrap_err();
        assert!(matches!(err, IiaError::Config(_)));
    }

    #[test]
    fn bytes_roundtrip_preserves_sentinel() {
        let mut corr = Correspondence::new();
        corr.insert(
            HlNode::new("a", "a", 3, TensorIndex::Head(1)),
            [LlNode::new("blocks.0.attn.hook_result", TensorIndex::Head(1)).with_submodule("W_O")],
        )
        .unwrap();
        corr.mark_unmapped(HlNode::new("b", "b", 0, TensorIndex::Unspecified));

        let bytes = corr.to_bytes().unwrap();
        let back = Correspondence::from_bytes(&bytes).unwrap();
        assert_eq!(back, corr);
        assert_eq!(back.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn edges_cross_product() {
        let a = LlNode::new("A", TensorIndex::Full);
        let b = LlNode::new("B", TensorIndex::Head(0));
        let c = LlNode::new("C", TensorIndex::Full);

        let mut corr = Correspondence::new();
        corr.insert(HlNode::new("n_u", "u", 0, TensorIndex::Full), [a, b]).unwrap();
        corr.insert(HlNode::new("n_v", "v", 0, TensorIndex::Full), [c]).unwrap();

        let edges = derive_edges(
            &[
                ("u".into(), "v".into()),
                ("u".into(), "missing".into()),
                ("n_u".into(), "n_v".into()),
            ],
            &corr,
        );
        let got: BTreeSet<(String, String)> = edges
            .iter()
            .map(|e| (e.hookpoint_from.clone(), e.hookpoint_to.clone()))
            .collect();
        let want: BTreeSet<(String, String)> = [("A", "C"), ("B", "C")]
            .iter()
            .map(|(f, t)| ((*f).to_string(), (*t).to_string()))
            .collect();
        assert_eq!(edges.len(), 2);
        assert_eq!(got, want);
    }

    #[test]
    fn self_loops_yield_no_edges() {
        let mut corr = Correspondence::new();
        corr.insert(
            HlNode::new("n_u", "u", 0, TensorIndex::Full),
            [LlNode::new("A", TensorIndex::Full), LlNode::new("B", TensorIndex::Full)],
        )
        .unwrap();
        corr.insert(
            HlNode::new("n_v", "v", 0, TensorIndex::Full),
            [LlNode::new("C", TensorIndex::Full)],
        )
        .unwrap();

        assert!(derive_edges(&[("u".into(), "u".into())], &corr).is_empty());
        let edges = derive_edges(&[("u".into(), "u".into()), ("v".into(), "u".into())], &corr);
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().all(|e| e.hookpoint_from == "C"));
    }
}
