// SPDX-License-Identifier: MIT OR Apache-2.0

//! Results table keyed by location.
//!
//! One [`ResultRow`] per circuit node, with one metric column per
//! `(metric, ablation type)` pair named `"{metric}_{ablation}_ablation"`.
//! Exported as JSON or CSV.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ablation::AblationType;
use crate::address::CircuitNode;
use crate::error::Result;
use crate::eval::NodeMetrics;

// ---------------------------------------------------------------------------
// ResultRow
// ---------------------------------------------------------------------------

/// Results for one location across ablation types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    /// Location key, `hook_name` or `hook_name[head]`.
    pub node: String,
    /// Tap point name.
    pub hook_name: String,
    /// Head index for per-head locations.
    pub head_index: Option<usize>,
    /// Whether the location realizes some high-level node.
    pub in_circuit: bool,
    /// Metric columns; `None` marks a metric that is undefined for this row.
    pub metrics: BTreeMap<String, Option<f64>>,
}

impl ResultRow {
    /// Value of a metric column, `None` if absent or undefined.
    #[must_use]
    pub fn metric(&self, column: &str) -> Option<f64> {
        self.metrics.get(column).copied().flatten()
    }
}

// ---------------------------------------------------------------------------
// ResultsTable
// ---------------------------------------------------------------------------

/// Per-location results merged across ablation types.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultsTable {
    rows: BTreeMap<String, ResultRow>,
}

/// Column name for a metric under an ablation type.
///
/// ```
/// use candle_iia::AblationType;
/// use candle_iia::report::metric_column;
///
/// assert_eq!(metric_column("accuracy", AblationType::Mean), "accuracy_mean_ablation");
/// ```
#[must_use]
pub fn metric_column(metric: &str, ty: AblationType) -> String {
    format!("{metric}_{ty}_ablation")
}

impl ResultsTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a row for `node` without metrics; existing rows are kept.
    pub fn add_node(&mut self, node: &CircuitNode, in_circuit: bool) {
        self.rows.entry(node.to_string()).or_insert_with(|| ResultRow {
            node: node.to_string(),
            hook_name: node.hook_name.clone(),
            head_index: node.head,
            in_circuit,
            metrics: BTreeMap::new(),
        });
    }

    /// Record the metrics of one location under one ablation type.
    ///
    /// KL divergence is recorded only when computed. Effective accuracy is
    /// recorded for resample ablations, as `None` when no example's ground
    /// truth changed.
    pub fn record(&mut self, node: &CircuitNode, ty: AblationType, metrics: &NodeMetrics) {
        self.add_node(node, false);
        let Some(row) = self.rows.get_mut(&node.to_string()) else {
            return;
        };
        let mut put = |name: &str, value: Option<f64>| {
            row.metrics.insert(metric_column(name, ty), value);
        };
        put("accuracy", Some(metrics.accuracy));
        put("base_model_effect", Some(metrics.base_model_effect));
        put("hypothesis_model_effect", Some(metrics.hypothesis_model_effect));
        if metrics.kl_div.is_some() {
            put("kl_div", metrics.kl_div);
        }
        if ty == AblationType::Resample {
            put("effective_accuracy", metrics.effective_accuracy);
        }
    }

    /// Row for a location key.
    #[must_use]
    pub fn get(&self, node: &str) -> Option<&ResultRow> {
        self.rows.get(node)
    }

    /// Rows in key order.
    pub fn rows(&self) -> impl Iterator<Item = &ResultRow> {
        self.rows.values()
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Union of metric column names, sorted.
    #[must_use]
    pub fn metric_columns(&self) -> BTreeSet<String> {
        self.rows
            .values()
            .flat_map(|row| row.metrics.keys().cloned())
            .collect()
    }

    // --- Export ----------------------------------------------------------

    /// Pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Json`](crate::IiaError::Json) on serialization failure.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write CSV: `node, hook_name, head_index, in_circuit`, then sorted
    /// metric columns. Missing and undefined values are empty cells.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Io`](crate::IiaError::Io) on write failure.
    pub fn write_csv<W: Write>(&self, mut out: W) -> Result<()> {
        let columns = self.metric_columns();
        let mut header = vec![
            "node".to_string(),
            "hook_name".to_string(),
            "head_index".to_string(),
            "in_circuit".to_string(),
        ];
        header.extend(columns.iter().cloned());
        writeln!(out, "{}", join_fields(&header))?;

        for row in self.rows.values() {
            let mut fields = vec![
                row.node.clone(),
                row.hook_name.clone(),
                row.head_index.map(|h| h.to_string()).unwrap_or_default(),
                row.in_circuit.to_string(),
            ];
            fields.extend(
                columns
                    .iter()
                    .map(|c| row.metric(c).map(|v| v.to_string()).unwrap_or_default()),
            );
            writeln!(out, "{}", join_fields(&fields))?;
        }
        out.flush()?;
        Ok(())
    }

    /// Write CSV to a file.
    ///
    /// # Errors
    ///
    /// Returns [`IiaError::Io`](crate::IiaError::Io) on failure.
    pub fn save_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.write_csv(BufWriter::new(File::create(path)?))
    }
}

/// Join CSV fields, quoting those containing separators or quotes.
fn join_fields(fields: &[String]) -> String {
    fields
        .iter()
        .map(|f| {
            if f.contains([',', '"', '\n']) {
                format!("\"{}\"", f.replace('"', "\"\""))
            } else {
                f.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn metrics(accuracy: f64) -> NodeMetrics {
        NodeMetrics {
            accuracy,
            kl_div: Some(0.25),
            base_model_effect: 0.5,
            hypothesis_model_effect: 0.5,
            effective_accuracy: None,
        }
    }

    #[test]
    fn merges_ablation_types_into_one_row() {
        let node = CircuitNode::new("blocks.0.attn.hook_result", Some(1));
        let mut table = ResultsTable::new();
        table.add_node(&node, true);
        table.record(&node, AblationType::Zero, &metrics(1.0));
        table.record(&node, AblationType::Resample, &metrics(0.5));

        assert_eq!(table.len(), 1);
        let row = table.get("blocks.0.attn.hook_result[1]").unwrap();
        assert!(row.in_circuit);
        assert_eq!(row.metric("accuracy_zero_ablation"), Some(1.0));
        assert_eq!(row.metric("accuracy_resample_ablation"), Some(0.5));
        assert!(row.metrics.contains_key("effective_accuracy_resample_ablation"));
        assert!(!row.metrics.contains_key("effective_accuracy_zero_ablation"));
    }

    #[test]
    fn csv_has_fixed_then_sorted_columns() {
        let node = CircuitNode::new("hook_embed", None);
        let mut table = ResultsTable::new();
        table.record(&node, AblationType::Mean, &metrics(0.75));
        let mut buf = Vec::new();
        table.write_csv(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "node,hook_name,head_index,in_circuit,accuracy_mean_ablation,\
             base_model_effect_mean_ablation,hypothesis_model_effect_mean_ablation,kl_div_mean_ablation"
        );
        assert_eq!(lines.next().unwrap(), "hook_embed,hook_embed,,false,0.75,0.5,0.5,0.25");
    }

    #[test]
    fn json_roundtrip() {
        let node = CircuitNode::new("hook_pos_embed", None);
        let mut table = ResultsTable::new();
        table.record(&node, AblationType::Resample, &metrics(0.0));
        let json = table.to_json().unwrap();
        let back: ResultsTable = serde_json::from_str(&json).unwrap();
        assert_eq!(back, table);
    }
}
