//! Structured validation errors and the error tree
//!
//! Every failed rule produces a [`ValidationError`]. Errors are collected
//! into an [`ErrorTree`] that mirrors the schema: one node per field, with
//! child nodes for errors captured from nested subschema evaluation
//! (compatibility clauses, temporal rules, `anyof` branches). The tree is
//! owned by a single `validate_record` call and returned to the caller.

use crate::types::Value;
use indexmap::IndexMap;
use serde::Serialize;

/// A single rule violation on a field.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationError {
    /// Field the error is attached to
    pub field: String,
    /// Name of the rule that failed (e.g. "allowed", "temporalrules")
    pub rule: String,
    /// Rendered form of the constraint that was violated
    pub constraint: String,
    /// Value the field held when the rule failed
    pub value: Value,
    /// Human-readable message
    pub message: String,
    /// Constraint number for list-valued rules (compatibility, temporal)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_index: Option<usize>,
}

/// Errors for one field, plus captured subschema errors underneath it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorNode {
    pub errors: Vec<ValidationError>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub children: IndexMap<String, ErrorNode>,
}

impl ErrorNode {
    /// Total number of errors in this node and all descendants.
    pub fn error_count(&self) -> usize {
        self.errors.len()
            + self
                .children
                .values()
                .map(ErrorNode::error_count)
                .sum::<usize>()
    }
}

/// Hierarchical error collection mirroring the schema path.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorTree {
    pub children: IndexMap<String, ErrorNode>,
}

impl ErrorTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no errors exist anywhere in the tree.
    pub fn is_empty(&self) -> bool {
        self.children.values().all(|n| n.error_count() == 0)
    }

    /// Total number of errors in the tree.
    pub fn error_count(&self) -> usize {
        self.children.values().map(ErrorNode::error_count).sum()
    }

    /// Node for a field, if any errors were recorded for it.
    pub fn get(&self, field: &str) -> Option<&ErrorNode> {
        self.children.get(field)
    }

    /// Record an error under its field's node.
    pub fn push(&mut self, error: ValidationError) {
        self.children
            .entry(error.field.clone())
            .or_default()
            .errors
            .push(error);
    }

    /// Attach a captured subschema tree under `field`, labelled with the
    /// clause it came from (e.g. "temporal rule 1"). Preserves the
    /// parent-child path for programmatic consumers.
    pub fn attach(&mut self, field: &str, label: impl Into<String>, inner: ErrorTree) {
        if inner.is_empty() {
            return;
        }
        let node = self.children.entry(field.to_string()).or_default();
        let slot = node.children.entry(label.into()).or_default();
        for (inner_field, inner_node) in inner.children {
            slot.children.insert(inner_field, inner_node);
        }
    }

    /// Merge another tree's top-level nodes into this one.
    pub fn merge(&mut self, other: ErrorTree) {
        for (field, node) in other.children {
            let target = self.children.entry(field).or_default();
            target.errors.extend(node.errors);
            target.children.extend(node.children);
        }
    }

    /// Flat field-to-messages view of the top-level errors.
    pub fn flat_messages(&self) -> IndexMap<String, Vec<String>> {
        let mut flat = IndexMap::new();
        for (field, node) in &self.children {
            if node.errors.is_empty() {
                continue;
            }
            let messages: Vec<String> = node.errors.iter().map(|e| e.message.clone()).collect();
            flat.insert(field.clone(), messages);
        }
        flat
    }

    /// Compact rendering of the tree's errors, used when a nested
    /// validator's findings are folded into one outer message:
    /// `('field', ["message", ...])`, comma-joined across fields.
    pub fn summary(&self) -> String {
        self.children
            .iter()
            .filter(|(_, node)| !node.errors.is_empty())
            .map(|(field, node)| {
                let messages: Vec<&str> =
                    node.errors.iter().map(|e| e.message.as_str()).collect();
                format!("('{}', {:?})", field, messages)
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_error(field: &str, message: &str) -> ValidationError {
        ValidationError {
            field: field.to_string(),
            rule: "allowed".to_string(),
            constraint: "[0]".to_string(),
            value: Value::Int(8),
            message: message.to_string(),
            rule_index: None,
        }
    }

    #[test]
    fn test_push_and_get() {
        let mut tree = ErrorTree::new();
        assert!(tree.is_empty());

        tree.push(make_error("taxes", "unallowed value 8"));
        assert!(!tree.is_empty());
        assert_eq!(tree.error_count(), 1);
        assert_eq!(tree.get("taxes").unwrap().errors.len(), 1);
        assert!(tree.get("other").is_none());
    }

    #[test]
    fn test_flat_messages_mirror_tree() {
        let mut tree = ErrorTree::new();
        tree.push(make_error("taxes", "unallowed value 8"));
        tree.push(make_error("taxes", "max value is 5"));
        tree.push(make_error("income", "null value not allowed"));

        let flat = tree.flat_messages();
        assert_eq!(flat.len(), 2);
        assert_eq!(
            flat.get("taxes").unwrap(),
            &vec!["unallowed value 8".to_string(), "max value is 5".to_string()]
        );
        // every flat entry has a node in the tree
        for field in flat.keys() {
            assert!(tree.get(field).is_some());
        }
    }

    #[test]
    fn test_attach_preserves_path() {
        let mut inner = ErrorTree::new();
        inner.push(make_error("taxes", "unallowed value 8"));

        let mut tree = ErrorTree::new();
        tree.push(make_error("taxes", "outer message"));
        tree.attach("taxes", "temporal rule 1", inner);

        let node = tree.get("taxes").unwrap();
        let child = node.children.get("temporal rule 1").unwrap();
        assert_eq!(child.children.get("taxes").unwrap().errors.len(), 1);
        assert_eq!(tree.error_count(), 2);
    }

    #[test]
    fn test_attach_empty_tree_is_noop() {
        let mut tree = ErrorTree::new();
        tree.attach("taxes", "temporal rule 1", ErrorTree::new());
        assert!(tree.is_empty());
        assert!(tree.get("taxes").is_none());
    }

    #[test]
    fn test_summary_format() {
        let mut tree = ErrorTree::new();
        tree.push(make_error("taxes", "unallowed value 8"));
        assert_eq!(tree.summary(), "('taxes', [\"unallowed value 8\"])");
    }
}
