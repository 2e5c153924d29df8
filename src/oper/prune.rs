// src/oper/prune.rs

//! Static request/subscription XPath pruning.
//!
//! Before invoking a provider, the composer proves the request and
//! subscription paths disjoint when it can: walking both step by step,
//! comparing module qualifier, node name (wildcards match anything) and each
//! predicate pair. A predicate pair only separates the paths when both are
//! key equalities on the same key with different literal values. `//` is
//! conservatively treated as required, as is any predicate form the
//! comparison does not understand. A `false` verdict is a safety guarantee:
//! no data instance under the subscription can match the request.

use crate::tree::xpath::{key_equality, steps, Step};

/// Whether one predicate pair can keep the paths overlapping.
fn predicate_required(pred1: &str, pred2: &str) -> bool {
    let (Some((key1, val1)), Some((key2, val2))) = (key_equality(pred1), key_equality(pred2))
    else {
        // Not an equality expression; cannot prove disjointness.
        return true;
    };
    if key1 != key2 {
        return true;
    }
    // Same key with equal literals keeps the data; different literals filter
    // it out.
    val1 == val2
}

fn is_wildcard(step: &Step<'_>) -> bool {
    step.name == "*"
}

/// Whether operational data under `sub_xpath` can be required by a request.
/// An absent request XPath means everything is required.
pub fn oper_data_required(request_xpath: Option<&str>, sub_xpath: &str) -> bool {
    let Some(request_xpath) = request_xpath else {
        return true;
    };
    let (Ok(req), Ok(sub)) = (steps(request_xpath), steps(sub_xpath)) else {
        // Unparseable paths cannot be proven disjoint.
        return true;
    };

    for (step1, step2) in req.iter().zip(sub.iter()) {
        // Only one path descends arbitrarily: unable to check further.
        if step1.dslash != step2.dslash {
            return true;
        }
        if step1.dslash && step2.dslash && (step1.name == "." || step2.name == ".") {
            return true;
        }

        let wildc1 = is_wildcard(step1);
        let wildc2 = is_wildcard(step2);

        if let (Some(mod1), Some(mod2)) = (step1.module, step2.module) {
            if mod1 != mod2 {
                return false;
            }
        }

        if !wildc1 && !wildc2 && step1.name != step2.name {
            return false;
        }

        for (pred1, pred2) in step1.predicates.iter().zip(step2.predicates.iter()) {
            if !predicate_required(pred1, pred2) {
                return false;
            }
        }
        // Leftover predicates on one side constrain only that side.
    }

    // One path is a prefix of the other (or they are equal): overlapping.
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_request_is_required() {
        assert!(oper_data_required(None, "/a:b/c"));
    }

    #[test]
    fn test_equal_paths_required() {
        assert!(oper_data_required(
            Some("/if:interfaces/if:interface"),
            "/if:interfaces/if:interface"
        ));
    }

    #[test]
    fn test_prefix_required_both_directions() {
        assert!(oper_data_required(
            Some("/if:interfaces"),
            "/if:interfaces/if:interface/if:oper-state"
        ));
        assert!(oper_data_required(
            Some("/if:interfaces/if:interface/if:oper-state"),
            "/if:interfaces"
        ));
    }

    #[test]
    fn test_different_modules_disjoint() {
        assert!(!oper_data_required(Some("/a:root/x"), "/b:root/x"));
    }

    #[test]
    fn test_different_names_disjoint() {
        assert!(!oper_data_required(Some("/a:root/x"), "/a:root/y"));
    }

    #[test]
    fn test_wildcard_matches_any_name() {
        assert!(oper_data_required(Some("/a:root/*"), "/a:root/y"));
        assert!(oper_data_required(Some("/a:*"), "/a:root/y"));
    }

    #[test]
    fn test_key_literal_mismatch_disjoint() {
        assert!(!oper_data_required(
            Some("/a:list[key='x']/leaf"),
            "/a:list[key='y']/leaf"
        ));
    }

    #[test]
    fn test_key_literal_match_required() {
        assert!(oper_data_required(
            Some("/a:list[key='x']/leaf"),
            "/a:list[key='x']/leaf"
        ));
    }

    #[test]
    fn test_non_equality_predicate_required() {
        assert!(oper_data_required(
            Some("/a:list[position()=1]"),
            "/a:list[key='y']"
        ));
    }

    #[test]
    fn test_different_keys_required() {
        assert!(oper_data_required(
            Some("/a:list[k1='x']"),
            "/a:list[k2='y']"
        ));
    }

    #[test]
    fn test_descendant_conservative() {
        assert!(oper_data_required(Some("/a:root//leaf"), "/a:root/x/leaf"));
    }
}
