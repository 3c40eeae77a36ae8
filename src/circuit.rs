// SPDX-License-Identifier: MIT OR Apache-2.0

//! Full low-level circuit enumeration and in-circuit classification.
//!
//! The full circuit of an `L`-layer, `H`-head network is the finite set of
//! [`CircuitNode`]s an intervention sweep may visit:
//!
//! - `hook_embed`, `hook_pos_embed`
//! - per layer and head: `hook_{q,k,v}_input`, `attn.hook_{q,k,v}`,
//!   `attn.hook_result`
//! - per layer: `hook_mlp_in`, `hook_mlp_out`
//! - `blocks.{L-1}.hook_resid_post`
//!
//! A correspondence names locations at component granularity
//! (`attn.hook_result`, `mlp.hook_post`, or wrapper paths);
//! [`ll_circuit`] maps those onto circuit nodes.

use std::collections::BTreeSet;

use crate::address::{CircuitNode, LlNode};
use crate::config::Granularity;
use crate::correspondence::Correspondence;
use crate::hooks::HookPoint;

/// Every circuit node of an `n_layers` x `n_heads` network, in order.
///
/// ```
/// use candle_iia::circuit::full_circuit_nodes;
///
/// let nodes = full_circuit_nodes(2, 3);
/// // 2 embeddings + 2 layers x (7 per-head hooks x 3 heads + 2 mlp hooks) + 1
/// assert_eq!(nodes.len(), 2 + 2 * (7 * 3 + 2) + 1);
/// ```
#[must_use]
pub fn full_circuit_nodes(n_layers: usize, n_heads: usize) -> BTreeSet<CircuitNode> {
    let mut nodes = BTreeSet::new();
    nodes.insert(node(HookPoint::Embed, None));
    nodes.insert(node(HookPoint::PosEmbed, None));
    for layer in 0..n_layers {
        for head in 0..n_heads {
            for hook in head_hooks(layer) {
                nodes.insert(node(hook, Some(head)));
            }
        }
        nodes.insert(node(HookPoint::MlpIn(layer), None));
        nodes.insert(node(HookPoint::MlpOut(layer), None));
    }
    if let Some(last) = n_layers.checked_sub(1) {
        nodes.insert(node(HookPoint::ResidPost(last), None));
    }
    nodes
}

/// Whether a hook sits below head-output granularity (query, key, or value).
///
/// ```
/// use candle_iia::circuit::is_qkv_granularity_hook;
///
/// assert!(is_qkv_granularity_hook("blocks.0.hook_q_input"));
/// assert!(is_qkv_granularity_hook("blocks.0.attn.hook_v"));
/// assert!(!is_qkv_granularity_hook("blocks.0.attn.hook_result"));
/// ```
#[must_use]
pub fn is_qkv_granularity_hook(hook_name: &str) -> bool {
    hook_name.rsplit('.').next().is_some_and(|last| {
        ["hook_q", "hook_k", "hook_v"]
            .iter()
            .any(|prefix| last.starts_with(prefix))
    })
}

/// Whether a single-location sweep visits `node`.
///
/// MLP inputs are never intervened on: they are fully determined by
/// upstream outputs. Query/key/value hooks are visited only at
/// [`Granularity::Qkv`].
#[must_use]
pub fn is_eligible(node: &CircuitNode, granularity: Granularity) -> bool {
    if node.hook_name.contains("mlp_in") {
        return false;
    }
    granularity == Granularity::Qkv || !is_qkv_granularity_hook(&node.hook_name)
}

/// Circuit nodes a sweep visits, in order.
#[must_use]
pub fn eligible_nodes(n_layers: usize, n_heads: usize, granularity: Granularity) -> Vec<CircuitNode> {
    full_circuit_nodes(n_layers, n_heads)
        .into_iter()
        .filter(|n| is_eligible(n, granularity))
        .collect()
}

/// Circuit nodes realized by one low-level node.
///
/// Attention locations cover the head's output plus its query, key, and
/// value hooks (every head when no head is selected). MLP locations map to
/// the layer's `hook_mlp_out`. Names already in circuit form pass through.
#[must_use]
pub fn circuit_nodes_for(ll: &LlNode, n_heads: usize) -> Vec<CircuitNode> {
    let Some((layer, kind)) = component_of(ll.hook_name()) else {
        return vec![ll.circuit_node()];
    };
    match kind {
        "attn" => {
            let heads: Vec<usize> = ll.index().head().map_or_else(|| (0..n_heads).collect(), |h| vec![h]);
            heads
                .into_iter()
                .flat_map(|h| head_hooks(layer).into_iter().map(move |hook| node(hook, Some(h))))
                .collect()
        }
        _ => vec![node(HookPoint::MlpOut(layer), None)],
    }
}

/// The low-level circuit claimed by a correspondence.
///
/// Embeddings and the final residual stream bound every compiled program,
/// so they are always part of it.
#[must_use]
pub fn ll_circuit(corr: &Correspondence, n_layers: usize, n_heads: usize) -> BTreeSet<CircuitNode> {
    let mut circuit: BTreeSet<CircuitNode> = corr
        .ll_nodes()
        .into_iter()
        .flat_map(|ll| circuit_nodes_for(ll, n_heads))
        .collect();
    circuit.insert(node(HookPoint::Embed, None));
    circuit.insert(node(HookPoint::PosEmbed, None));
    if let Some(last) = n_layers.checked_sub(1) {
        circuit.insert(node(HookPoint::ResidPost(last), None));
    }
    circuit
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn node(hook: HookPoint, head: Option<usize>) -> CircuitNode {
    CircuitNode::new(hook.to_string(), head)
}

/// Per-head hooks of one layer, inputs first.
fn head_hooks(layer: usize) -> [HookPoint; 7] {
    [
        HookPoint::QInput(layer),
        HookPoint::KInput(layer),
        HookPoint::VInput(layer),
        HookPoint::AttnQ(layer),
        HookPoint::AttnK(layer),
        HookPoint::AttnV(layer),
        HookPoint::AttnResult(layer),
    ]
}

/// `(layer, "attn" | "mlp")` of a component-level hook name in either style.
fn component_of(hook_name: &str) -> Option<(usize, &str)> {
    let parts: Vec<&str> = hook_name.split('.').collect();
    match parts.as_slice() {
        ["blocks", layer, "attn", "hook_result"] => Some((layer.parse().ok()?, "attn")),
        ["blocks", layer, "mlp", "hook_post"] => Some((layer.parse().ok()?, "mlp")),
        ["mod", "blocks", layer, "mod", kind @ ("attn" | "mlp"), "hook_point"] => {
            Some((layer.parse().ok()?, *kind))
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::address::{HlNode, TensorIndex};

    #[test]
    fn mlp_in_is_never_eligible() {
        for granularity in [Granularity::Head, Granularity::Qkv] {
            let nodes = eligible_nodes(3, 2, granularity);
            assert!(nodes.iter().all(|n| !n.hook_name.contains("mlp_in")));
        }
    }

    #[test]
    fn head_granularity_skips_qkv() {
        let nodes = eligible_nodes(1, 2, Granularity::Head);
        let names: BTreeSet<String> = nodes.iter().map(ToString::to_string).collect();
        let expected: BTreeSet<String> = [
            "hook_embed",
            "hook_pos_embed",
            "blocks.0.attn.hook_result[0]",
            "blocks.0.attn.hook_result[1]",
            "blocks.0.hook_mlp_out",
            "blocks.0.hook_resid_post",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn qkv_granularity_adds_inputs() {
        let head = eligible_nodes(2, 2, Granularity::Head).len();
        let qkv = eligible_nodes(2, 2, Granularity::Qkv).len();
        assert_eq!(qkv - head, 2 * 2 * 6);
    }

    #[test]
    fn attention_head_realization_covers_its_hooks() {
        let ll = LlNode::new("blocks.1.attn.hook_result", TensorIndex::Head(0));
        let nodes = circuit_nodes_for(&ll, 4);
        assert_eq!(nodes.len(), 7);
        assert!(nodes.iter().all(|n| n.head == Some(0)));
        assert!(nodes.contains(&CircuitNode::new("blocks.1.hook_k_input", Some(0))));
    }

    #[test]
    fn wrapper_path_mlp_maps_to_mlp_out() {
        let ll = LlNode::new("mod.blocks.0.mod.mlp.hook_point", TensorIndex::Full);
        assert_eq!(
            circuit_nodes_for(&ll, 2),
            vec![CircuitNode::new("blocks.0.hook_mlp_out", None)]
        );
    }

    #[test]
    fn ll_circuit_marks_realized_nodes() {
        let mut corr = Correspondence::new();
        corr.insert(
            HlNode::new("frac", "frac", 0, TensorIndex::Unspecified),
            [LlNode::new("blocks.0.mlp.hook_post", TensorIndex::Full)],
        )
        .unwrap();
        let circuit = ll_circuit(&corr, 2, 1);
        assert!(circuit.contains(&CircuitNode::new("blocks.0.hook_mlp_out", None)));
        assert!(!circuit.contains(&CircuitNode::new("blocks.1.hook_mlp_out", None)));
        assert!(circuit.contains(&CircuitNode::new("blocks.1.hook_resid_post", None)));
    }
}
