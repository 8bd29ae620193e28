//! Node affinity evaluation.
//!
//! Terms are ORed, expressions inside a term are ANDed. A term without any
//! expression or field selector matches no node.

use corral_core::k8s_openapi::api::core::v1::{
    NodeAffinity, NodeSelectorRequirement, NodeSelectorTerm, PreferredSchedulingTerm,
};
use corral_core::{Node, NodeExt, Pod};

const FIELD_NODE_NAME: &str = "metadata.name";

fn node_affinity(pod: &Pod) -> Option<&NodeAffinity> {
    pod.spec
        .as_ref()
        .and_then(|s| s.affinity.as_ref())
        .and_then(|a| a.node_affinity.as_ref())
}

/// Required terms, `None` when the pod declares no required affinity
pub fn required_terms(pod: &Pod) -> Option<&[NodeSelectorTerm]> {
    node_affinity(pod)
        .and_then(|a| a.required_during_scheduling_ignored_during_execution.as_ref())
        .map(|s| s.node_selector_terms.as_slice())
}

/// Preferred (weighted) terms
pub fn preferred_terms(pod: &Pod) -> &[PreferredSchedulingTerm] {
    node_affinity(pod)
        .and_then(|a| a.preferred_during_scheduling_ignored_during_execution.as_deref())
        .unwrap_or(&[])
}

/// Check operators and values of every affinity expression
pub fn validate(pod: &Pod) -> Result<(), String> {
    let required = required_terms(pod).unwrap_or(&[]);
    let preferred = preferred_terms(pod);

    for term in required.iter().chain(preferred.iter().map(|p| &p.preference)) {
        for requirement in term_requirements(term) {
            validate_requirement(requirement)?;
        }
    }

    for term in preferred {
        if !(1..=100).contains(&term.weight) {
            return Err(format!(
                "preferred node affinity weight {} outside 1-100",
                term.weight
            ));
        }
    }

    Ok(())
}

fn validate_requirement(req: &NodeSelectorRequirement) -> Result<(), String> {
    let values = req.values.as_deref().unwrap_or(&[]);

    match req.operator.as_str() {
        "In" | "NotIn" if values.is_empty() => Err(format!(
            "operator {} on key {} needs at least one value",
            req.operator, req.key
        )),
        "In" | "NotIn" => Ok(()),
        "Exists" | "DoesNotExist" if !values.is_empty() => Err(format!(
            "operator {} on key {} takes no values",
            req.operator, req.key
        )),
        "Exists" | "DoesNotExist" => Ok(()),
        "Gt" | "Lt" => match values {
            [value] if value.parse::<i64>().is_ok() => Ok(()),
            _ => Err(format!(
                "operator {} on key {} needs exactly one integer value",
                req.operator, req.key
            )),
        },
        other => Err(format!("unknown node affinity operator: {}", other)),
    }
}

fn term_requirements(term: &NodeSelectorTerm) -> impl Iterator<Item = &NodeSelectorRequirement> {
    term.match_expressions
        .iter()
        .flatten()
        .chain(term.match_fields.iter().flatten())
}

/// Whether a single term selects the node
pub fn term_matches(term: &NodeSelectorTerm, node: &Node) -> bool {
    let expressions = term.match_expressions.as_deref().unwrap_or(&[]);
    let fields = term.match_fields.as_deref().unwrap_or(&[]);

    if expressions.is_empty() && fields.is_empty() {
        return false;
    }

    expressions
        .iter()
        .all(|req| requirement_matches(req, node.label(&req.key)))
        && fields.iter().all(|req| {
            let value = (req.key == FIELD_NODE_NAME).then(|| node.name());
            requirement_matches(req, value)
        })
}

fn requirement_matches(req: &NodeSelectorRequirement, value: Option<&str>) -> bool {
    let values = req.values.as_deref().unwrap_or(&[]);

    match req.operator.as_str() {
        "In" => value.is_some_and(|v| values.iter().any(|x| x == v)),
        "NotIn" => value.map_or(true, |v| values.iter().all(|x| x != v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        "Gt" | "Lt" => {
            let (Some(actual), Some(bound)) = (
                value.and_then(|v| v.parse::<i64>().ok()),
                values.first().and_then(|v| v.parse::<i64>().ok()),
            ) else {
                return false;
            };
            if req.operator == "Gt" {
                actual > bound
            } else {
                actual < bound
            }
        }
        _ => false,
    }
}

/// Whether the node satisfies the pod's required affinity. No requirement
/// always matches.
pub fn required_matches(pod: &Pod, node: &Node) -> bool {
    match required_terms(pod) {
        Some(terms) => terms.iter().any(|t| term_matches(t, node)),
        None => true,
    }
}

/// Matched preferred weight over total preferred weight, `None` when the pod
/// prefers nothing
pub fn preferred_match_fraction(pod: &Pod, node: &Node) -> Option<f64> {
    let preferred = preferred_terms(pod);
    let total: i64 = preferred.iter().map(|p| i64::from(p.weight.max(0))).sum();
    if total == 0 {
        return None;
    }

    let matched: i64 = preferred
        .iter()
        .filter(|p| term_matches(&p.preference, node))
        .map(|p| i64::from(p.weight.max(0)))
        .sum();

    Some(matched as f64 / total as f64)
}
