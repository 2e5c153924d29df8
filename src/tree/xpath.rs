// src/tree/xpath.rs

//! XPath utilities over the supported location-path subset.
//!
//! Supported form: absolute paths of `module:name` steps, each with any
//! number of `[key='value']` predicates, `*` wildcards, and `//` descendant
//! separators (the latter only tolerated by the step lexer; evaluation
//! requires concrete steps). Anything richer belongs to the schema/data
//! library behind the provider seam.

use crate::error::{Error, Result};
use crate::tree::DataNode;

/// One lexed location step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step<'a> {
    /// Step was preceded by `//`.
    pub dslash: bool,
    pub module: Option<&'a str>,
    pub name: &'a str,
    /// Raw predicate bodies, brackets stripped.
    pub predicates: Vec<&'a str>,
}

/// Lex an XPath into steps. Fails on malformed bracketing.
pub fn steps(xpath: &str) -> Result<Vec<Step<'_>>> {
    let mut out = Vec::new();
    let mut rest = xpath;

    while !rest.is_empty() {
        let dslash = if let Some(r) = rest.strip_prefix("//") {
            rest = r;
            true
        } else if let Some(r) = rest.strip_prefix('/') {
            rest = r;
            false
        } else if out.is_empty() {
            // Relative paths keep their first step as-is.
            false
        } else {
            return Err(Error::inval_arg(format!("malformed xpath '{xpath}'")));
        };

        let name_end = rest
            .find(|c| c == '/' || c == '[')
            .unwrap_or(rest.len());
        let qname = &rest[..name_end];
        if qname.is_empty() {
            return Err(Error::inval_arg(format!("malformed xpath '{xpath}'")));
        }
        rest = &rest[name_end..];

        let (module, name) = match qname.split_once(':') {
            Some((m, n)) => (Some(m), n),
            None => (None, qname),
        };

        let mut predicates = Vec::new();
        while let Some(r) = rest.strip_prefix('[') {
            let end = r
                .find(']')
                .ok_or_else(|| Error::inval_arg(format!("unterminated predicate in '{xpath}'")))?;
            predicates.push(&r[..end]);
            rest = &r[end + 1..];
        }

        out.push(Step {
            dslash,
            module,
            name,
            predicates,
        });
    }

    if out.is_empty() {
        return Err(Error::inval_arg("empty xpath"));
    }
    Ok(out)
}

/// Parse a `key='value'` equality predicate; returns None for anything else
/// (positional, functions, unfinished expressions).
pub fn key_equality(pred: &str) -> Option<(&str, &str)> {
    let (key, val) = pred.split_once('=')?;
    let val = val.trim();
    let quote = val.chars().next()?;
    if quote != '\'' && quote != '"' {
        return None;
    }
    let inner = &val[1..];
    let end = inner.find(quote)?;
    if end + 2 != val.len() {
        return None;
    }
    Some((key.trim(), &inner[..end]))
}

/// Drop the trailing step, producing the data-parent path. Returns None when
/// the path is top-level.
pub fn trim_last_node(xpath: &str) -> Result<Option<String>> {
    let all = steps(xpath)?;
    if all.len() <= 1 {
        return Ok(None);
    }
    let mut out = String::new();
    for step in &all[..all.len() - 1] {
        out.push_str(if step.dslash { "//" } else { "/" });
        if let Some(m) = step.module {
            out.push_str(m);
            out.push(':');
        }
        out.push_str(step.name);
        for p in &step.predicates {
            out.push('[');
            out.push_str(p);
            out.push(']');
        }
    }
    Ok(Some(out))
}

fn step_matches(step: &Step<'_>, node: &DataNode, inherited_module: Option<&str>) -> bool {
    if step.name != "*" && step.name != node.name {
        return false;
    }
    let want_module = step.module.or(inherited_module);
    if let Some(m) = want_module {
        if step.name != "*" && m != node.module {
            return false;
        }
    }
    for pred in &step.predicates {
        match key_equality(pred) {
            Some((key, value)) => {
                if key == "." {
                    if node.value.as_deref() != Some(value) {
                        return false;
                    }
                } else {
                    let found = node
                        .children
                        .iter()
                        .any(|c| c.name == key && c.value.as_deref() == Some(value));
                    if !found {
                        return false;
                    }
                }
            }
            // Unsupported predicate forms match conservatively.
            None => continue,
        }
    }
    true
}

/// Evaluate an absolute path over a forest, returning matching node refs.
pub fn eval<'a>(forest: &'a [DataNode], xpath: &str) -> Result<Vec<&'a DataNode>> {
    eval_roots(forest.iter(), xpath)
}

/// `eval` over any set of top-level trees (owned forest or cache aliases).
pub fn eval_roots<'a>(
    roots: impl Iterator<Item = &'a DataNode>,
    xpath: &str,
) -> Result<Vec<&'a DataNode>> {
    let all = steps(xpath)?;
    let first = &all[0];
    if first.dslash {
        return Err(Error::unsupported("descendant steps are not evaluable"));
    }

    let mut current: Vec<&DataNode> = roots.filter(|n| step_matches(first, n, None)).collect();
    let mut module = first.module;

    for step in &all[1..] {
        if current.is_empty() {
            break;
        }
        if step.dslash {
            return Err(Error::unsupported("descendant steps are not evaluable"));
        }
        let mut next = Vec::new();
        for node in &current {
            for child in &node.children {
                if step_matches(step, child, module) {
                    next.push(child);
                }
            }
        }
        current = next;
        if step.module.is_some() {
            module = step.module;
        }
    }
    Ok(current)
}

/// `eval` that also yields each match's concrete path (with key predicates),
/// usable to re-select or duplicate the exact instance later.
pub fn eval_paths<'a>(
    forest: &'a [DataNode],
    xpath: &str,
) -> Result<Vec<(String, &'a DataNode)>> {
    let all = steps(xpath)?;
    let first = &all[0];
    if first.dslash {
        return Err(Error::unsupported("descendant steps are not evaluable"));
    }

    let mut current: Vec<(String, &DataNode)> = forest
        .iter()
        .filter(|n| step_matches(first, n, None))
        .map(|n| (format!("/{}", n.path_segment()), n))
        .collect();

    for step in &all[1..] {
        if current.is_empty() {
            break;
        }
        if step.dslash {
            return Err(Error::unsupported("descendant steps are not evaluable"));
        }
        let mut next = Vec::new();
        for (path, node) in &current {
            for child in &node.children {
                if step_matches(step, child, Some(&node.module)) {
                    next.push((format!("{}/{}", path, child.path_segment()), child));
                }
            }
        }
        current = next;
    }
    Ok(current)
}

/// Duplicate every match of `xpath` together with its parent chain, merged
/// into one result forest.
pub fn filter(forest: &[DataNode], xpath: &str) -> Result<Vec<DataNode>> {
    filter_roots(forest.iter(), xpath)
}

/// `filter` over any set of top-level trees.
pub fn filter_roots<'a>(
    roots: impl Iterator<Item = &'a DataNode>,
    xpath: &str,
) -> Result<Vec<DataNode>> {
    let all = steps(xpath)?;
    let mut out: Vec<DataNode> = Vec::new();
    for root in roots {
        if step_matches(&all[0], root, None) {
            if let Some(tree) = filter_node(root, &all, 0) {
                crate::tree::merge_forest(&mut out, vec![tree]);
            }
        }
    }
    Ok(out)
}

fn filter_node(node: &DataNode, all: &[Step<'_>], idx: usize) -> Option<DataNode> {
    if idx + 1 == all.len() {
        // Final step: take the whole subtree.
        return Some(node.dup_data());
    }
    let next = &all[idx + 1];
    let mut dup = node.dup_shallow();
    for child in &node.children {
        if step_matches(next, child, Some(&node.module)) {
            if let Some(sub) = filter_node(child, all, idx + 1) {
                dup.children.push(sub);
            }
        }
    }
    if dup.children.is_empty() && !node.children.is_empty() {
        return None;
    }
    Some(dup)
}

/// Remove every node matching `xpath` from the forest, pruning emptied
/// non-presence ancestors on the way out.
pub fn complement(forest: &mut Vec<DataNode>, xpath: &str) -> Result<()> {
    let all = steps(xpath)?;
    complement_level(forest, &all, 0, None);
    Ok(())
}

fn complement_level(
    siblings: &mut Vec<DataNode>,
    all: &[Step<'_>],
    idx: usize,
    inherited_module: Option<&str>,
) {
    let step = &all[idx];
    let last = idx + 1 == all.len();
    siblings.retain_mut(|node| {
        if !step_matches(step, node, inherited_module) {
            return true;
        }
        if last {
            return false;
        }
        let module = node.module.clone();
        complement_level(&mut node.children, all, idx + 1, Some(&module));
        // Emptied non-presence containers carry no information.
        !(node.children.is_empty() && node.is_np_container())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::NodeKind;

    fn sample() -> Vec<DataNode> {
        let eth0 = DataNode::new(
            "if",
            "interface",
            NodeKind::List {
                keys: vec!["name".into()],
            },
            None,
        )
        .with_child(DataNode::leaf("if", "name", "eth0"))
        .with_child(DataNode::leaf("if", "oper-state", "down").with_config(false));
        let eth1 = DataNode::new(
            "if",
            "interface",
            NodeKind::List {
                keys: vec!["name".into()],
            },
            None,
        )
        .with_child(DataNode::leaf("if", "name", "eth1"))
        .with_child(DataNode::leaf("if", "oper-state", "up").with_config(false));
        vec![DataNode::container("if", "interfaces")
            .with_child(eth0)
            .with_child(eth1)]
    }

    #[test]
    fn test_steps_lexing() {
        let s = steps("/if:interfaces/if:interface[name='eth0']/oper-state").unwrap();
        assert_eq!(s.len(), 3);
        assert_eq!(s[0].module, Some("if"));
        assert_eq!(s[1].predicates, vec!["name='eth0'"]);
        assert_eq!(s[2].module, None);
        assert_eq!(s[2].name, "oper-state");
    }

    #[test]
    fn test_key_equality() {
        assert_eq!(key_equality("name='eth0'"), Some(("name", "eth0")));
        assert_eq!(key_equality("name=\"e\""), Some(("name", "e")));
        assert_eq!(key_equality("position()=1"), None);
        assert_eq!(key_equality("name='unfinished"), None);
    }

    #[test]
    fn test_eval_with_predicate() {
        let forest = sample();
        let hits = eval(&forest, "/if:interfaces/if:interface[name='eth0']/if:oper-state").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].value.as_deref(), Some("down"));
    }

    #[test]
    fn test_eval_wildcard() {
        let forest = sample();
        let hits = eval(&forest, "/if:interfaces/*").unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_trim_last_node() {
        assert_eq!(
            trim_last_node("/if:interfaces/if:interface/if:oper-state").unwrap(),
            Some("/if:interfaces/if:interface".to_string())
        );
        assert_eq!(trim_last_node("/if:interfaces").unwrap(), None);
    }

    #[test]
    fn test_filter_keeps_parent_chain() {
        let forest = sample();
        let result = filter(&forest, "/if:interfaces/if:interface[name='eth1']").unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].name, "interfaces");
        assert_eq!(result[0].children.len(), 1);
        assert_eq!(result[0].children[0].key_values()[0].1, "eth1");
    }

    #[test]
    fn test_complement_removes_subtree() {
        let mut forest = sample();
        complement(&mut forest, "/if:interfaces/if:interface[name='eth0']/if:oper-state").unwrap();
        let hits = eval(&forest, "/if:interfaces/if:interface[name='eth0']/if:oper-state").unwrap();
        assert!(hits.is_empty());
        // eth1 untouched.
        let hits = eval(&forest, "/if:interfaces/if:interface[name='eth1']/if:oper-state").unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_complement_prunes_empty_np_containers() {
        let mut forest = sample();
        complement(&mut forest, "/if:interfaces/if:interface").unwrap();
        assert!(forest.is_empty());
    }
}
