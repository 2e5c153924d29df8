// src/tree/diff.rs

//! Diff computation, application, and merge.
//!
//! A diff is a tree whose nodes carry an operation; unannotated nodes are
//! context ancestors. Created/deleted subtrees annotate the subtree root
//! only, descendants inherit. Merging two diffs composes their operations;
//! an injected merge policy decides origin and ownership retention when
//! operational overlays are combined.

use crate::tree::{DataNode, DiffOp, Forest};

/// Outcome of the injected policy for one node pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    UseIncoming,
    KeepTarget,
}

/// Context passed to the merge policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeCtx {
    /// Connection storing the incoming overlay, if any.
    pub cid: Option<u32>,
}

/// Merge policy for diff merging.
pub enum MergePolicy {
    /// Incoming nodes always win.
    Plain,
    /// Origin-aware rules for operational overlays: an incoming node without
    /// an explicit origin keeps the target's; an explicit incoming origin
    /// wins; ownership follows the context connection.
    OriginAware(MergeCtx),
}

impl MergePolicy {
    fn decide(&self, src: &DataNode, _tgt: &DataNode) -> MergeDecision {
        match self {
            MergePolicy::Plain => MergeDecision::UseIncoming,
            MergePolicy::OriginAware(_) => {
                // Value updates always land; only the annotation rules below
                // differ. The decision hook stays so callers can narrow it.
                let _ = src;
                MergeDecision::UseIncoming
            }
        }
    }

    fn stamp(&self, src: &DataNode, tgt: &mut DataNode) {
        match self {
            MergePolicy::Plain => {
                tgt.origin = src.origin.clone();
                tgt.owner_cid = src.owner_cid;
            }
            MergePolicy::OriginAware(ctx) => {
                if src.origin.is_some() {
                    tgt.origin = src.origin.clone();
                }
                tgt.owner_cid = ctx.cid.or(src.owner_cid).or(tgt.owner_cid);
            }
        }
    }
}

/// Compute the diff turning `old` into `new`. Ancestors of changes are kept
/// as context; whole created/deleted subtrees annotate their root.
pub fn diff_compute(old: &[DataNode], new: &[DataNode]) -> Forest {
    let mut diff = Vec::new();

    for old_node in old {
        match new.iter().find(|n| n.same_instance(old_node)) {
            None => {
                let mut entry = old_node.clone();
                entry.operation = Some(DiffOp::Delete);
                diff.push(entry);
            }
            Some(new_node) => {
                let mut value_changed = false;
                if old_node.is_leaf() && old_node.value != new_node.value {
                    value_changed = true;
                }
                let children = diff_compute(&old_node.children, &new_node.children);
                if value_changed || !children.is_empty() {
                    let mut entry = new_node.dup_shallow();
                    entry.children = children;
                    if value_changed {
                        entry.operation = Some(DiffOp::Replace);
                        entry.orig_value = old_node.value.clone();
                    }
                    diff.push(entry);
                }
            }
        }
    }

    for new_node in new {
        if !old.iter().any(|n| n.same_instance(new_node)) {
            let mut entry = new_node.clone();
            entry.operation = Some(DiffOp::Create);
            diff.push(entry);
        }
    }

    diff
}

/// Apply a diff onto data. `with_origin` keeps origin annotations carried by
/// the diff; otherwise they are dropped on the way in.
pub fn diff_apply(data: &mut Forest, diff: &[DataNode], with_origin: bool) {
    for entry in diff {
        apply_entry(data, entry, with_origin, None);
    }
}

fn apply_entry(
    siblings: &mut Vec<DataNode>,
    entry: &DataNode,
    with_origin: bool,
    inherited: Option<DiffOp>,
) {
    let op = entry.operation.or(inherited);
    let pos = siblings.iter().position(|c| c.same_instance(entry));

    match op {
        Some(DiffOp::Delete) => {
            if let Some(pos) = pos {
                siblings.remove(pos);
            }
        }
        Some(DiffOp::Create) => {
            let mut node = entry.dup_data();
            if !with_origin {
                node.strip_origin();
            } else {
                node.origin = entry.origin.clone();
            }
            node.owner_cid = entry.owner_cid;
            match pos {
                // Created node already present: value and children win.
                Some(pos) => siblings[pos] = node,
                None => siblings.push(node),
            }
        }
        Some(DiffOp::Replace) | None => {
            match pos {
                Some(pos) => {
                    let target = &mut siblings[pos];
                    if op == Some(DiffOp::Replace) && entry.is_leaf() {
                        target.value = entry.value.clone();
                        target.dflt = entry.dflt;
                        if with_origin && entry.origin.is_some() {
                            target.origin = entry.origin.clone();
                        }
                        if entry.owner_cid.is_some() {
                            target.owner_cid = entry.owner_cid;
                        }
                    }
                    for child in &entry.children {
                        apply_entry(&mut target.children, child, with_origin, None);
                    }
                }
                None if !entry.children.is_empty() || op.is_some() => {
                    // Context ancestor missing: materialize the chain.
                    let mut node = entry.dup_shallow();
                    node.operation = None;
                    if !with_origin {
                        node.origin = None;
                    }
                    siblings.push(node);
                    let last = siblings.len() - 1;
                    for child in &entry.children {
                        apply_entry(&mut siblings[last].children, child, with_origin, None);
                    }
                }
                None => {}
            }
        }
    }
}

/// Merge diff `src` into `target`, composing operations node-wise.
pub fn diff_merge(target: &mut Forest, src: Forest, policy: &MergePolicy) {
    for node in src {
        merge_entry(target, node, policy, None);
    }
}

fn merge_entry(
    siblings: &mut Vec<DataNode>,
    mut node: DataNode,
    policy: &MergePolicy,
    inherited: Option<DiffOp>,
) {
    let node_op = node.operation.or(inherited);
    let Some(pos) = siblings.iter().position(|c| c.same_instance(&node)) else {
        if let MergePolicy::OriginAware(ctx) = policy {
            if node.owner_cid.is_none() {
                node.owner_cid = ctx.cid;
            }
        }
        siblings.push(node);
        return;
    };

    let target_op = siblings[pos].operation;
    match (target_op, node_op) {
        // A created node deleted again leaves no trace.
        (Some(DiffOp::Create), Some(DiffOp::Delete)) => {
            siblings.remove(pos);
        }
        // Deletion followed by creation is a value change.
        (Some(DiffOp::Delete), Some(DiffOp::Create)) => {
            let target = &mut siblings[pos];
            if target.is_leaf() && target.value == node.value {
                // Recreated identical instance: no effective change.
                siblings.remove(pos);
            } else {
                let orig = target.value.clone();
                if policy.decide(&node, target) == MergeDecision::UseIncoming {
                    target.value = node.value.clone();
                }
                target.operation = Some(DiffOp::Replace);
                target.orig_value = orig;
                policy.stamp(&node, target);
                target.children = node.children;
            }
        }
        // Later operations override, original value is preserved from the
        // earliest replace.
        (prev, Some(op)) => {
            let target = &mut siblings[pos];
            let earliest_orig = target.orig_value.clone().or_else(|| {
                if prev == Some(DiffOp::Replace) {
                    target.value.clone()
                } else {
                    None
                }
            });
            if policy.decide(&node, target) == MergeDecision::UseIncoming {
                target.value = node.value.clone();
            }
            target.operation = Some(match (prev, op) {
                (Some(DiffOp::Create), _) => DiffOp::Create,
                (_, o) => o,
            });
            if node.insert.is_some() {
                target.insert = node.insert.clone();
            }
            policy.stamp(&node, target);
            if target.operation == Some(DiffOp::Replace) {
                target.orig_value = earliest_orig.or(node.orig_value);
            }
            let children = std::mem::take(&mut node.children);
            for child in children {
                merge_entry(&mut siblings[pos].children, child, policy, node_op);
            }
        }
        // Context node: recurse.
        (_, None) => {
            if node.origin.is_some() || node.owner_cid.is_some() {
                let target = &mut siblings[pos];
                policy.stamp(&node, target);
            }
            let children = std::mem::take(&mut node.children);
            for child in children {
                merge_entry(&mut siblings[pos].children, child, policy, None);
            }
        }
    }
}

/// Whether the diff contains any effective operation.
pub fn diff_has_changes(diff: &[DataNode]) -> bool {
    diff.iter()
        .any(|n| n.operation.is_some() || diff_has_changes(&n.children))
}

/// Drop diff entries that became unapplicable against `data`: deletions and
/// replaces of instances that no longer exist. Used to repair a stored
/// operational overlay after its running base changed.
pub fn diff_mod_update(diff: &mut Forest, data: &[DataNode]) {
    diff.retain_mut(|entry| update_entry(entry, data));
}

fn update_entry(entry: &mut DataNode, siblings: &[DataNode]) -> bool {
    match entry.operation {
        Some(DiffOp::Create) => true,
        Some(DiffOp::Delete) | Some(DiffOp::Replace) => siblings
            .iter()
            .any(|c| c.same_instance(entry)),
        None => {
            let Some(base) = siblings.iter().find(|c| c.same_instance(entry)) else {
                // Context chain broken: only created subtrees below survive,
                // and they need their ancestor, so keep iff one exists.
                return subtree_all_creates(entry);
            };
            entry
                .children
                .retain_mut(|child| update_entry(child, &base.children));
            !entry.children.is_empty()
        }
    }
}

fn subtree_all_creates(entry: &DataNode) -> bool {
    if entry.operation == Some(DiffOp::Create) {
        return true;
    }
    if entry.operation.is_some() {
        return false;
    }
    !entry.children.is_empty() && entry.children.iter().all(subtree_all_creates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::DataNode;

    fn root(value: &str) -> DataNode {
        DataNode::container("m", "root").with_child(DataNode::leaf("m", "a", value))
    }

    #[test]
    fn test_compute_replace() {
        let old = vec![root("1")];
        let new = vec![root("2")];
        let diff = diff_compute(&old, &new);
        assert_eq!(diff.len(), 1);
        let leaf = &diff[0].children[0];
        assert_eq!(leaf.operation, Some(DiffOp::Replace));
        assert_eq!(leaf.orig_value.as_deref(), Some("1"));
        assert_eq!(leaf.value.as_deref(), Some("2"));
    }

    #[test]
    fn test_compute_identical_empty() {
        let old = vec![root("1")];
        assert!(diff_compute(&old, &old).is_empty());
    }

    #[test]
    fn test_roundtrip_apply() {
        // apply(D, E) = D' with diff Δ  =>  merge Δ into D yields D'.
        let old = vec![root("1")];
        let new = vec![root("2").with_child(DataNode::leaf("m", "b", "x"))];
        let diff = diff_compute(&old, &new);
        let mut replay = old.clone();
        diff_apply(&mut replay, &diff, false);
        assert_eq!(replay, new);
    }

    #[test]
    fn test_apply_delete_and_create() {
        let old = vec![root("1")];
        let new: Forest = Vec::new();
        let diff = diff_compute(&old, &new);
        assert_eq!(diff[0].operation, Some(DiffOp::Delete));
        let mut replay = old.clone();
        diff_apply(&mut replay, &diff, false);
        assert!(replay.is_empty());
    }

    #[test]
    fn test_merge_create_then_delete_cancels() {
        let mut target = vec![{
            let mut n = DataNode::leaf("m", "a", "1");
            n.operation = Some(DiffOp::Create);
            n
        }];
        let src = vec![{
            let mut n = DataNode::leaf("m", "a", "1");
            n.operation = Some(DiffOp::Delete);
            n
        }];
        diff_merge(&mut target, src, &MergePolicy::Plain);
        assert!(target.is_empty());
    }

    #[test]
    fn test_merge_replace_keeps_earliest_orig() {
        let mut target = vec![{
            let mut n = DataNode::leaf("m", "a", "2");
            n.operation = Some(DiffOp::Replace);
            n.orig_value = Some("1".into());
            n
        }];
        let src = vec![{
            let mut n = DataNode::leaf("m", "a", "3");
            n.operation = Some(DiffOp::Replace);
            n.orig_value = Some("2".into());
            n
        }];
        diff_merge(&mut target, src, &MergePolicy::Plain);
        assert_eq!(target[0].value.as_deref(), Some("3"));
        assert_eq!(target[0].orig_value.as_deref(), Some("1"));
    }

    #[test]
    fn origin_incoming_wins() {
        // An edit changing value and origin in one step: incoming origin wins.
        let mut target = vec![{
            let mut n = DataNode::leaf("m", "a", "1");
            n.operation = Some(DiffOp::Replace);
            n.origin = Some("ietf-origin:intended".into());
            n
        }];
        let src = vec![{
            let mut n = DataNode::leaf("m", "a", "2");
            n.operation = Some(DiffOp::Replace);
            n.origin = Some("ietf-origin:learned".into());
            n
        }];
        diff_merge(&mut target, src, &MergePolicy::OriginAware(MergeCtx { cid: Some(7) }));
        assert_eq!(target[0].value.as_deref(), Some("2"));
        assert_eq!(target[0].origin.as_deref(), Some("ietf-origin:learned"));
        assert_eq!(target[0].owner_cid, Some(7));
    }

    #[test]
    fn test_origin_kept_when_incoming_unset() {
        let mut target = vec![{
            let mut n = DataNode::leaf("m", "a", "1");
            n.operation = Some(DiffOp::Replace);
            n.origin = Some("ietf-origin:intended".into());
            n
        }];
        let src = vec![{
            let mut n = DataNode::leaf("m", "a", "2");
            n.operation = Some(DiffOp::Replace);
            n
        }];
        diff_merge(&mut target, src, &MergePolicy::OriginAware(MergeCtx { cid: None }));
        assert_eq!(target[0].origin.as_deref(), Some("ietf-origin:intended"));
    }

    #[test]
    fn test_diff_mod_update_drops_stale_delete() {
        let mut diff = vec![{
            let mut n = DataNode::leaf("m", "gone", "x");
            n.operation = Some(DiffOp::Delete);
            n
        }];
        diff_mod_update(&mut diff, &[]);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_diff_mod_update_keeps_creates_without_base() {
        let mut diff = vec![DataNode::container("m", "root").with_child({
            let mut n = DataNode::leaf("m", "fresh", "y");
            n.operation = Some(DiffOp::Create);
            n
        })];
        diff_mod_update(&mut diff, &[]);
        assert_eq!(diff.len(), 1);
    }
}
