//! Coverage checks: which requested scopes and clause references are
//! actually represented in the retrieved top-k.

use serde_json::Value;

use crate::codes::RETRIEVAL_GRAPH_FALLBACK;
use crate::model::EvidenceItem;

/// Whether a detected standard satisfies a requested scope label.
///
/// Inclusion either way tolerates variants like "ISO 9001:2015".
fn scope_matches(requested: &str, present: &str) -> bool {
    !requested.is_empty() && (present.contains(requested) || requested.contains(present))
}

/// Requested scopes absent from the items' standards.
///
/// With `enforce` false (single-scope or relaxed modes) coverage is not
/// demanded and nothing is reported missing.
pub fn find_missing_scopes(
    items: &[EvidenceItem],
    requested_standards: &[String],
    enforce: bool,
) -> Vec<String> {
    if !enforce {
        return Vec::new();
    }
    let present: Vec<String> = items
        .iter()
        .filter_map(EvidenceItem::row_standard)
        .collect();
    requested_standards
        .iter()
        .map(|scope| scope.trim().to_uppercase())
        .filter(|scope| !scope.is_empty())
        .filter(|scope| !present.iter().any(|std| scope_matches(scope, std)))
        .collect()
}

/// Clause references from the query that no item anchors.
///
/// `min_required == 0` disables the check entirely.
pub fn find_missing_clause_refs(
    items: &[EvidenceItem],
    clause_refs: &[String],
    min_required: usize,
) -> Vec<String> {
    if min_required == 0 || clause_refs.is_empty() {
        return Vec::new();
    }
    clause_refs
        .iter()
        .filter(|clause| !items.iter().any(|item| item.mentions_clause(clause)))
        .cloned()
        .collect()
}

/// Decision on switching from hybrid to multi-query.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageDecision {
    pub needs_fallback: bool,
    pub reason: String,
    pub code: String,
}

impl CoverageDecision {
    fn ok() -> Self {
        Self {
            needs_fallback: false,
            reason: "coverage_ok".to_string(),
            code: String::new(),
        }
    }
}

/// Decide whether the multihop fallback should rerun retrieval as
/// multi-query for better balanced evidence.
///
/// A hybrid trace that already reports planner-side multihop suppresses the
/// fallback: missing standards can persist even after multihop, and a
/// redundant rerun would not improve them.
pub fn decide_multihop_fallback(
    clause_refs: &[String],
    requested_standards: &[String],
    items: &[EvidenceItem],
    hybrid_trace: Option<&Value>,
    top_k: usize,
) -> CoverageDecision {
    let top = &items[..items.len().min(top_k.max(1))];
    let planner_multihop = hybrid_trace
        .and_then(|trace| trace.get("planner_multihop"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let requested: Vec<String> = requested_standards
        .iter()
        .map(|scope| scope.trim().to_uppercase())
        .filter(|scope| !scope.is_empty())
        .collect();
    if requested.len() >= 2 {
        let present: Vec<String> = top.iter().filter_map(EvidenceItem::row_standard).collect();
        let missing: Vec<&String> = requested
            .iter()
            .filter(|scope| !present.iter().any(|std| scope_matches(scope, std)))
            .collect();
        if !missing.is_empty() && !planner_multihop {
            let preview = missing
                .iter()
                .take(3)
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return CoverageDecision {
                needs_fallback: true,
                reason: format!("missing_standards_in_topk: {preview}"),
                code: RETRIEVAL_GRAPH_FALLBACK.to_string(),
            };
        }
    }

    if !clause_refs.is_empty() {
        let missing: Vec<&String> = clause_refs
            .iter()
            .filter(|clause| !top.iter().any(|item| item.mentions_clause(clause)))
            .collect();
        if !missing.is_empty() && !planner_multihop {
            let preview = missing
                .iter()
                .take(3)
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return CoverageDecision {
                needs_fallback: true,
                reason: format!("missing_clause_refs_in_topk: {preview}"),
                code: RETRIEVAL_GRAPH_FALLBACK.to_string(),
            };
        }
    }

    CoverageDecision::ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn scoped_item(source: &str, standard: &str, clause: &str) -> EvidenceItem {
        EvidenceItem::new(source, format!("{clause} requisito"), 0.9).with_metadata(json!({
            "row": {"metadata": {"source_standard": standard, "clause_id": clause}}
        }))
    }

    #[test]
    fn test_missing_scopes_respects_enforce() {
        let items = vec![scoped_item("C1", "ISO 45001", "5.3")];
        let requested = vec!["ISO 9001".to_string(), "ISO 45001".to_string()];
        assert_eq!(
            find_missing_scopes(&items, &requested, true),
            vec!["ISO 9001".to_string()]
        );
        assert!(find_missing_scopes(&items, &requested, false).is_empty());
    }

    #[test]
    fn test_missing_scopes_tolerates_year_suffix() {
        let items = vec![scoped_item("C1", "ISO 9001:2015", "9.1")];
        let requested = vec!["ISO 9001".to_string()];
        assert!(find_missing_scopes(&items, &requested, true).is_empty());
    }

    #[test]
    fn test_missing_clause_refs_gated_by_min_required() {
        let items = vec![scoped_item("C1", "ISO 9001", "9.1")];
        let refs = vec!["9.1".to_string(), "9.1.2".to_string()];
        assert_eq!(
            find_missing_clause_refs(&items, &refs, 1),
            vec!["9.1.2".to_string()]
        );
        assert!(find_missing_clause_refs(&items, &refs, 0).is_empty());
    }

    #[test]
    fn test_fallback_fires_on_missing_standard() {
        let items = vec![scoped_item("C1", "ISO 45001", "5.3")];
        let requested = vec![
            "ISO 9001".to_string(),
            "ISO 14001".to_string(),
            "ISO 45001".to_string(),
        ];
        let decision = decide_multihop_fallback(&[], &requested, &items, None, 12);
        assert!(decision.needs_fallback);
        assert!(decision.reason.contains("missing_standards_in_topk"));
    }

    #[test]
    fn test_fallback_suppressed_when_planner_did_multihop() {
        let items = vec![scoped_item("C1", "ISO 45001", "5.3")];
        let requested = vec!["ISO 9001".to_string(), "ISO 45001".to_string()];
        let trace = json!({"planner_multihop": true});
        let decision = decide_multihop_fallback(&[], &requested, &items, Some(&trace), 12);
        assert!(!decision.needs_fallback);
        assert_eq!(decision.reason, "coverage_ok");
    }

    #[test]
    fn test_fallback_on_missing_clause() {
        let items = vec![scoped_item("C1", "ISO 9001", "9.1")];
        let refs = vec!["7.5".to_string()];
        let decision =
            decide_multihop_fallback(&refs, &["ISO 9001".to_string()], &items, None, 12);
        assert!(decision.needs_fallback);
        assert!(decision.reason.contains("missing_clause_refs_in_topk"));
    }
}
