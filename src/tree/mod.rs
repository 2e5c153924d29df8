// src/tree/mod.rs

//! Concrete data-tree model backing the engine.
//!
//! A forest (`Vec<DataNode>`) holds top-level subtrees, at most one tree per
//! module for conventional data. Diff trees reuse the same node type with a
//! per-node operation annotation. The schema-aware concerns (validation,
//! defaults, config/state classification of schema nodes) live behind the
//! provider seam in `crate::schema`; everything here is pure data algebra.

pub mod diff;
pub mod edit;
pub mod xpath;

use serde::{Deserialize, Serialize};

/// Kind of a data node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Container; presence containers carry meaning even when empty.
    Container { presence: bool },
    Leaf,
    LeafList,
    /// List instance; `keys` are the key leaf names in schema order.
    List { keys: Vec<String> },
}

/// Operation annotation on a diff node. Absent operation means the node is an
/// unchanged ancestor kept for context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffOp {
    Create,
    Delete,
    Replace,
}

/// Position anchor for user-ordered list/leaf-list moves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InsertAnchor {
    First,
    Last,
    /// Before the instance with the given key predicate/value.
    Before(String),
    /// After the instance with the given key predicate/value.
    After(String),
}

/// One node of a data or diff tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataNode {
    pub name: String,
    pub module: String,
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Config-true node; state nodes are config-false.
    #[serde(default = "default_true")]
    pub config: bool,
    /// Set when the value is the schema default, not explicitly configured.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dflt: bool,
    /// Effective origin URI; inherited from the nearest annotated ancestor
    /// when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Diff operation, present only in diff trees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<DiffOp>,
    /// Edit operation, present only in edit trees; inherited from the
    /// nearest annotated ancestor during application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_op: Option<edit::EditOp>,
    /// Previous value of a replaced leaf, kept in diff trees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orig_value: Option<String>,
    /// Move anchor for user-ordered instances, kept in diff trees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert: Option<InsertAnchor>,
    /// Connection that stored this node in an operational overlay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_cid: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DataNode>,
}

fn default_true() -> bool {
    true
}

/// A forest of top-level subtrees.
pub type Forest = Vec<DataNode>;

impl DataNode {
    pub fn container(module: &str, name: &str) -> Self {
        Self::new(module, name, NodeKind::Container { presence: false }, None)
    }

    pub fn leaf(module: &str, name: &str, value: &str) -> Self {
        Self::new(module, name, NodeKind::Leaf, Some(value.to_string()))
    }

    pub fn new(module: &str, name: &str, kind: NodeKind, value: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            module: module.to_string(),
            kind,
            value,
            config: true,
            dflt: false,
            origin: None,
            operation: None,
            edit_op: None,
            orig_value: None,
            insert: None,
            owner_cid: None,
            children: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: bool) -> Self {
        self.config = config;
        self
    }

    pub fn with_child(mut self, child: DataNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn is_list(&self) -> bool {
        matches!(self.kind, NodeKind::List { .. })
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf | NodeKind::LeafList)
    }

    /// Non-presence container.
    pub fn is_np_container(&self) -> bool {
        matches!(self.kind, NodeKind::Container { presence: false })
    }

    /// Key values of a list instance, in key order.
    pub fn key_values(&self) -> Vec<(String, String)> {
        match &self.kind {
            NodeKind::List { keys } => keys
                .iter()
                .filter_map(|k| {
                    self.children
                        .iter()
                        .find(|c| &c.name == k)
                        .and_then(|c| c.value.clone().map(|v| (k.clone(), v)))
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Whether `other` denotes the same data instance as `self`.
    pub fn same_instance(&self, other: &DataNode) -> bool {
        if self.module != other.module || self.name != other.name {
            return false;
        }
        match (&self.kind, &other.kind) {
            (NodeKind::List { .. }, NodeKind::List { .. }) => {
                self.key_values() == other.key_values()
            }
            (NodeKind::LeafList, NodeKind::LeafList) => self.value == other.value,
            _ => true,
        }
    }

    /// Path segment of this node, `module:name[key='v']...` form.
    pub fn path_segment(&self) -> String {
        let mut seg = format!("{}:{}", self.module, self.name);
        for (k, v) in self.key_values() {
            seg.push_str(&format!("[{k}='{v}']"));
        }
        if matches!(self.kind, NodeKind::LeafList) {
            if let Some(v) = &self.value {
                seg.push_str(&format!("[.='{v}']"));
            }
        }
        seg
    }

    /// Find a child denoting the same instance as `node`.
    pub fn find_child(&self, node: &DataNode) -> Option<usize> {
        self.children.iter().position(|c| c.same_instance(node))
    }

    /// Deep copy without diff/operation metadata.
    pub fn dup_data(&self) -> DataNode {
        let mut copy = self.clone();
        copy.strip_diff_meta();
        copy
    }

    fn strip_diff_meta(&mut self) {
        self.operation = None;
        self.edit_op = None;
        self.orig_value = None;
        self.insert = None;
        for child in &mut self.children {
            child.strip_diff_meta();
        }
    }

    /// Shallow copy: same node, no children.
    pub fn dup_shallow(&self) -> DataNode {
        let mut copy = self.clone();
        copy.children = match &self.kind {
            // List keys always travel with the instance.
            NodeKind::List { keys } => self
                .children
                .iter()
                .filter(|c| keys.contains(&c.name))
                .cloned()
                .collect(),
            _ => Vec::new(),
        };
        copy
    }

    /// Effective origin: own annotation or the inherited one.
    pub fn effective_origin<'a>(&'a self, inherited: Option<&'a str>) -> Option<&'a str> {
        self.origin.as_deref().or(inherited)
    }

    /// Strip every origin annotation in the subtree.
    pub fn strip_origin(&mut self) {
        self.origin = None;
        for child in &mut self.children {
            child.strip_origin();
        }
    }

    /// Depth-first traversal calling `f` on every node with its path.
    pub fn walk<F: FnMut(&DataNode, &str)>(&self, prefix: &str, f: &mut F) {
        let path = format!("{}/{}", prefix, self.path_segment());
        f(self, &path);
        for child in &self.children {
            child.walk(&path, f);
        }
    }
}

/// Find the top-level trees of `module` within a forest.
pub fn module_roots<'a>(forest: &'a [DataNode], module: &str) -> Vec<&'a DataNode> {
    forest.iter().filter(|n| n.module == module).collect()
}

/// Detach and return the top-level trees of `module`.
pub fn take_module(forest: &mut Forest, module: &str) -> Forest {
    let mut taken = Vec::new();
    let mut i = 0;
    while i < forest.len() {
        if forest[i].module == module {
            taken.push(forest.remove(i));
        } else {
            i += 1;
        }
    }
    taken
}

/// Merge `src` into `dst`, combining nodes that denote the same instance.
/// `src` is consumed. Explicit (non-default) leaves in `src` override `dst`.
pub fn merge_forest(dst: &mut Forest, src: Forest) {
    for node in src {
        merge_node(dst, node);
    }
}

fn merge_node(siblings: &mut Vec<DataNode>, mut node: DataNode) {
    if let Some(pos) = siblings.iter().position(|c| c.same_instance(&node)) {
        let target = &mut siblings[pos];
        if node.is_leaf() {
            // Default values never override explicit ones.
            if !node.dflt || target.dflt {
                target.value = node.value.take();
                target.dflt = node.dflt;
                if node.origin.is_some() {
                    target.origin = node.origin.take();
                }
                if node.owner_cid.is_some() {
                    target.owner_cid = node.owner_cid.take();
                }
            }
        } else {
            if node.origin.is_some() {
                target.origin = node.origin.take();
            }
            let children = std::mem::take(&mut node.children);
            for child in children {
                merge_node(&mut target.children, child);
            }
        }
    } else {
        siblings.push(node);
    }
}

/// Whether any node in the subtree is config-false.
pub fn has_state_nodes(node: &DataNode) -> bool {
    !node.config || node.children.iter().any(has_state_nodes)
}

/// Remove state subtrees and/or childless config leaves, depth-first.
/// `keep_state` and `keep_config` mirror the composer's trim options.
pub fn trim_forest(forest: &mut Forest, keep_state: bool, keep_config: bool) {
    forest.retain_mut(|n| trim_node(n, keep_state, keep_config));
}

fn trim_node(node: &mut DataNode, keep_state: bool, keep_config: bool) -> bool {
    if !node.config {
        return keep_state;
    }
    node.children
        .retain_mut(|c| trim_node(c, keep_state, keep_config));
    if !keep_config {
        // Config leaves go; config containers stay only while they still
        // shelter state descendants.
        if node.is_leaf() {
            return false;
        }
        return !node.children.is_empty();
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(module: &str, name: &str, key: &str, keyval: &str) -> DataNode {
        DataNode::new(
            module,
            name,
            NodeKind::List {
                keys: vec![key.to_string()],
            },
            None,
        )
        .with_child(DataNode::leaf(module, key, keyval))
    }

    #[test]
    fn test_same_instance_lists_by_key() {
        let a = list("m", "l", "k", "x");
        let b = list("m", "l", "k", "x");
        let c = list("m", "l", "k", "y");
        assert!(a.same_instance(&b));
        assert!(!a.same_instance(&c));
    }

    #[test]
    fn test_path_segment_keys() {
        let a = list("m", "l", "k", "x");
        assert_eq!(a.path_segment(), "m:l[k='x']");
    }

    #[test]
    fn test_merge_overrides_leaf() {
        let mut dst = vec![DataNode::container("m", "root").with_child(DataNode::leaf("m", "a", "1"))];
        let src = vec![DataNode::container("m", "root").with_child(DataNode::leaf("m", "a", "2"))];
        merge_forest(&mut dst, src);
        assert_eq!(dst[0].children[0].value.as_deref(), Some("2"));
    }

    #[test]
    fn test_merge_default_does_not_override() {
        let mut dst = vec![DataNode::leaf("m", "a", "explicit")];
        let mut dleaf = DataNode::leaf("m", "a", "default");
        dleaf.dflt = true;
        merge_forest(&mut dst, vec![dleaf]);
        assert_eq!(dst[0].value.as_deref(), Some("explicit"));
    }

    #[test]
    fn test_trim_state() {
        let mut forest = vec![DataNode::container("m", "root")
            .with_child(DataNode::leaf("m", "cfg", "1"))
            .with_child(DataNode::leaf("m", "st", "2").with_config(false))];
        trim_forest(&mut forest, false, true);
        assert_eq!(forest[0].children.len(), 1);
        assert_eq!(forest[0].children[0].name, "cfg");
    }

    #[test]
    fn test_trim_config_keeps_state_shelter() {
        let mut forest = vec![DataNode::container("m", "root")
            .with_child(DataNode::leaf("m", "cfg", "1"))
            .with_child(DataNode::leaf("m", "st", "2").with_config(false))];
        trim_forest(&mut forest, true, false);
        // Container stays because of the state leaf under it.
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].children.len(), 1);
        assert_eq!(forest[0].children[0].name, "st");
    }

    #[test]
    fn test_take_module() {
        let mut forest = vec![
            DataNode::container("a", "x"),
            DataNode::container("b", "y"),
            DataNode::container("a", "z"),
        ];
        let taken = take_module(&mut forest, "a");
        assert_eq!(taken.len(), 2);
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].module, "b");
    }
}
