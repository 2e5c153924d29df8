// src/tree/edit.rs

//! Application of caller edits onto module data.
//!
//! An edit is a data tree whose nodes may carry an operation; unannotated
//! nodes inherit the nearest ancestor's operation, `merge` at the top. Moves
//! of user-ordered instances inside a created subtree are applied in
//! depth-first order of that subtree.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tree::{DataNode, DiffOp, Forest, InsertAnchor};

/// NETCONF-style edit operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditOp {
    Merge,
    Replace,
    Create,
    Delete,
    Remove,
}

/// Apply the parts of `edit` owned by `module` onto that module's subtrees in
/// `data`. Returns the per-module diff when `make_diff` is set and anything
/// changed.
pub fn apply_edit(
    data: &mut Forest,
    edit: &[DataNode],
    module: &str,
    make_diff: bool,
) -> Result<Option<Forest>> {
    let mut diff: Forest = Vec::new();

    for edit_node in edit.iter().filter(|n| n.module == module) {
        let d = if make_diff { Some(&mut diff) } else { None };
        apply_node(data, edit_node, EditOp::Merge, d, "")?;
    }

    Ok(if make_diff && !diff.is_empty() {
        Some(diff)
    } else {
        None
    })
}

fn apply_node(
    siblings: &mut Vec<DataNode>,
    edit_node: &DataNode,
    inherited: EditOp,
    mut diff: Option<&mut Forest>,
    path: &str,
) -> Result<()> {
    let op = edit_node.edit_op.unwrap_or(inherited);
    let node_path = format!("{}/{}", path, edit_node.path_segment());
    let existing = siblings.iter().position(|c| c.same_instance(edit_node));

    match op {
        EditOp::Create if existing.is_some() => {
            return Err(Error::exists("data instance already exists").with_path(node_path));
        }
        EditOp::Delete if existing.is_none() => {
            return Err(Error::not_found("data instance does not exist").with_path(node_path));
        }
        _ => {}
    }

    match op {
        EditOp::Delete | EditOp::Remove => {
            if let Some(pos) = existing {
                let removed = siblings.remove(pos);
                if let Some(d) = diff.as_mut() {
                    let mut entry = removed;
                    entry.operation = Some(DiffOp::Delete);
                    d.push(entry);
                }
            }
        }
        EditOp::Replace => {
            let mut new_node = edit_node.dup_data();
            match existing {
                Some(pos) => {
                    let old = siblings[pos].clone();
                    if let Some(d) = diff.as_mut() {
                        let sub = super::diff::diff_compute(
                            std::slice::from_ref(&old),
                            std::slice::from_ref(&new_node),
                        );
                        d.extend(sub);
                    }
                    siblings[pos] = new_node;
                }
                None => {
                    insert_positioned(siblings, new_node.clone(), edit_node.insert.as_ref())?;
                    if let Some(d) = diff.as_mut() {
                        new_node.operation = Some(DiffOp::Create);
                        new_node.insert = edit_node.insert.clone();
                        d.push(new_node);
                    }
                }
            }
        }
        EditOp::Create | EditOp::Merge => match existing {
            None => {
                let mut new_node = edit_node.dup_data();
                insert_positioned(siblings, new_node.clone(), edit_node.insert.as_ref())?;
                if let Some(d) = diff.as_mut() {
                    new_node.operation = Some(DiffOp::Create);
                    new_node.insert = edit_node.insert.clone();
                    d.push(new_node);
                }
            }
            Some(pos) => {
                // Leaf value update, then recursion into children.
                let mut diff_children: Forest = Vec::new();
                let mut value_changed = false;
                let mut orig_value = None;
                {
                    let target = &mut siblings[pos];
                    if edit_node.is_leaf() && edit_node.value != target.value {
                        orig_value = target.value.clone();
                        target.value = edit_node.value.clone();
                        target.dflt = false;
                        value_changed = true;
                    }
                    for child in &edit_node.children {
                        let child_diff = if diff.is_some() {
                            Some(&mut diff_children)
                        } else {
                            None
                        };
                        apply_node(&mut target.children, child, op, child_diff, &node_path)?;
                    }
                }
                if let Some(anchor) = &edit_node.insert {
                    // Move of an existing user-ordered instance.
                    value_changed = move_instance(siblings, pos, anchor)? || value_changed;
                }
                if let Some(d) = diff.as_mut() {
                    if value_changed || !diff_children.is_empty() {
                        let mut entry = siblings
                            .iter()
                            .find(|c| c.same_instance(edit_node))
                            .map(|c| c.dup_shallow())
                            .unwrap_or_else(|| edit_node.dup_shallow());
                        entry.children = diff_children;
                        if value_changed {
                            entry.operation = Some(DiffOp::Replace);
                            entry.orig_value = orig_value;
                            entry.insert = edit_node.insert.clone();
                        }
                        d.push(entry);
                    }
                }
            }
        },
    }

    Ok(())
}

/// Insert a new instance honoring a user-order anchor; unanchored instances
/// append.
fn insert_positioned(
    siblings: &mut Vec<DataNode>,
    node: DataNode,
    anchor: Option<&InsertAnchor>,
) -> Result<()> {
    let pos = match anchor {
        None | Some(InsertAnchor::Last) => siblings.len(),
        Some(InsertAnchor::First) => 0,
        Some(InsertAnchor::Before(target)) => {
            anchor_position(siblings, &node, target)?
        }
        Some(InsertAnchor::After(target)) => anchor_position(siblings, &node, target)? + 1,
    };
    siblings.insert(pos.min(siblings.len()), node);
    Ok(())
}

/// Reposition an existing instance; returns true when the position changed.
fn move_instance(siblings: &mut Vec<DataNode>, pos: usize, anchor: &InsertAnchor) -> Result<bool> {
    let node = siblings.remove(pos);
    let new_pos = match anchor {
        InsertAnchor::First => 0,
        InsertAnchor::Last => siblings.len(),
        InsertAnchor::Before(target) => anchor_position(siblings, &node, target)?,
        InsertAnchor::After(target) => anchor_position(siblings, &node, target)? + 1,
    };
    let new_pos = new_pos.min(siblings.len());
    siblings.insert(new_pos, node);
    Ok(new_pos != pos)
}

fn anchor_position(siblings: &[DataNode], node: &DataNode, target: &str) -> Result<usize> {
    siblings
        .iter()
        .position(|c| {
            c.module == node.module
                && c.name == node.name
                && (c.key_values().first().map(|(_, v)| v.as_str()) == Some(target)
                    || c.value.as_deref() == Some(target))
        })
        .ok_or_else(|| Error::not_found(format!("move anchor instance '{target}' not found")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::NodeKind;

    fn data() -> Forest {
        vec![DataNode::container("m1", "root").with_child(DataNode::leaf("m1", "a", "1"))]
    }

    fn edit_set(value: &str) -> DataNode {
        DataNode::container("m1", "root").with_child(DataNode::leaf("m1", "a", value))
    }

    #[test]
    fn test_merge_updates_leaf_with_diff() {
        let mut forest = data();
        let edit = vec![edit_set("2")];
        let diff = apply_edit(&mut forest, &edit, "m1", true).unwrap().unwrap();
        assert_eq!(forest[0].children[0].value.as_deref(), Some("2"));
        assert_eq!(diff[0].children[0].operation, Some(DiffOp::Replace));
        assert_eq!(diff[0].children[0].orig_value.as_deref(), Some("1"));
    }

    #[test]
    fn test_merge_same_value_no_diff() {
        let mut forest = data();
        let edit = vec![edit_set("1")];
        let diff = apply_edit(&mut forest, &edit, "m1", true).unwrap();
        assert!(diff.is_none());
    }

    #[test]
    fn test_create_existing_fails() {
        let mut forest = data();
        let mut edit = edit_set("2");
        edit.children[0].edit_op = Some(EditOp::Create);
        let err = apply_edit(&mut forest, &[edit], "m1", true).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::Exists);
        // Nothing changed.
        assert_eq!(forest[0].children[0].value.as_deref(), Some("1"));
    }

    #[test]
    fn test_delete_missing_fails_remove_does_not() {
        let mut forest = data();
        let mut edit = DataNode::container("m1", "root")
            .with_child(DataNode::leaf("m1", "missing", "x"));
        edit.children[0].edit_op = Some(EditOp::Delete);
        assert!(apply_edit(&mut forest, &[edit], "m1", false).is_err());

        let mut edit = DataNode::container("m1", "root")
            .with_child(DataNode::leaf("m1", "missing", "x"));
        edit.children[0].edit_op = Some(EditOp::Remove);
        assert!(apply_edit(&mut forest, &[edit], "m1", false).unwrap().is_none());
    }

    #[test]
    fn test_delete_subtree_recorded() {
        let mut forest = data();
        let mut edit = DataNode::container("m1", "root");
        edit.edit_op = Some(EditOp::Delete);
        let diff = apply_edit(&mut forest, &[edit], "m1", true).unwrap().unwrap();
        assert!(forest.is_empty());
        assert_eq!(diff[0].operation, Some(DiffOp::Delete));
        assert_eq!(diff[0].children.len(), 1);
    }

    #[test]
    fn test_move_user_ordered() {
        let mk = |v: &str| {
            DataNode::new("m1", "item", NodeKind::LeafList, Some(v.to_string()))
        };
        let mut forest = vec![DataNode::container("m1", "root")
            .with_child(mk("a"))
            .with_child(mk("b"))
            .with_child(mk("c"))];
        let mut moved = mk("c");
        moved.insert = Some(InsertAnchor::First);
        let edit = vec![DataNode::container("m1", "root").with_child(moved)];
        apply_edit(&mut forest, &edit, "m1", false).unwrap();
        let order: Vec<_> = forest[0]
            .children
            .iter()
            .map(|c| c.value.clone().unwrap())
            .collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_other_module_untouched() {
        let mut forest = data();
        let edit = vec![DataNode::container("m2", "other").with_child(DataNode::leaf("m2", "x", "9"))];
        let diff = apply_edit(&mut forest, &edit, "m1", true).unwrap();
        assert!(diff.is_none());
        assert_eq!(forest.len(), 1);
    }
}
