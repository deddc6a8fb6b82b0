//! Citation validation: pure, deterministic checks over the answer draft.
//!
//! Issues come from a closed set of human-readable strings; the reflect
//! loop never treats validation failures as retryable.

use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;

use crate::model::{clip_text, AnswerDraft, EvidenceItem, RetrievalPlan, ValidationResult};
use crate::profile::AgentProfile;
use crate::router::extract_clause_refs;

fn marker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b[CR]\d+\b").unwrap()
    })
}

fn iso_mention_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\bISO\s*[-:]?\s*(\d{4,5})\b").unwrap()
    })
}

fn scope_matches(requested: &str, detected: &str) -> bool {
    !requested.is_empty() && (detected.contains(requested) || requested.contains(detected))
}

/// Deterministic citation validator.
#[derive(Debug, Default)]
pub struct CitationValidator;

impl CitationValidator {
    /// Validate a draft against the plan contract.
    pub fn validate(
        &self,
        draft: &AnswerDraft,
        plan: &RetrievalPlan,
        query: &str,
        profile: &AgentProfile,
    ) -> ValidationResult {
        let mut issues: Vec<String> = Vec::new();
        let requested: Vec<String> = plan
            .requested_standards
            .iter()
            .map(|scope| scope.trim().to_uppercase())
            .filter(|scope| !scope.is_empty())
            .collect();

        if draft.evidence.is_empty() {
            issues.push("no retrieval evidence available to ground the answer".to_string());
        }

        if profile.validation.require_citations
            && !draft.evidence.is_empty()
            && !marker_pattern().is_match(&draft.text)
        {
            issues.push("answer lacks explicit source markers (C#/R#)".to_string());
        }

        if !requested.is_empty() {
            for captures in iso_mention_pattern().captures_iter(&draft.text) {
                let Some(digits) = captures.get(1) else { continue };
                let mentioned = format!("ISO {}", digits.as_str());
                if !requested.iter().any(|scope| scope_matches(scope, &mentioned)) {
                    issues.push(format!(
                        "answer mentions {mentioned} outside the requested standards"
                    ));
                }
            }
            for item in &draft.evidence {
                let Some(standard) = item.row_standard() else { continue };
                if !requested.iter().any(|scope| scope_matches(scope, &standard)) {
                    issues.push(format!(
                        "evidence includes {standard} outside the requested scope"
                    ));
                }
            }
        }

        if plan.require_literal_evidence {
            let clause_refs = extract_clause_refs(query, profile);
            for clause in &clause_refs {
                let anchored = draft
                    .evidence
                    .iter()
                    .any(|item| item.mentions_clause(clause));
                if !anchored {
                    issues.push(format!(
                        "literal clause mismatch: clause {clause} not anchored in evidence"
                    ));
                }
            }
        }

        let lowered_answer = draft.text.to_lowercase();
        for concept in &profile.validation.forbidden_concepts {
            let needle = concept.trim().to_lowercase();
            if !needle.is_empty() && lowered_answer.contains(&needle) {
                issues.push(format!("forbidden concept present: {}", concept.trim()));
            }
        }

        if plan.response_contract.as_deref() == Some("grounded_inference") {
            let citations = inference_section_citations(&draft.text);
            if citations < 2 {
                issues.push(format!(
                    "grounded inference requires at least 2 citations in the Inferencias section, found {citations}"
                ));
            }
        }

        issues.sort();
        issues.dedup();
        if issues.is_empty() {
            ValidationResult::accepted()
        } else {
            ValidationResult::rejected(issues)
        }
    }
}

/// Count citation markers inside the "Inferencias" section.
///
/// The section runs from its heading to the next heading-looking line.
fn inference_section_citations(text: &str) -> usize {
    let lowered = text.to_lowercase();
    let Some(start) = lowered.find("inferencias") else {
        return 0;
    };
    let section = text.get(start..).unwrap_or(text);
    let mut collected = String::new();
    for (index, line) in section.lines().enumerate() {
        if index > 0 {
            let trimmed = line.trim();
            let heading = !trimmed.is_empty()
                && (trimmed.starts_with('#')
                    || (trimmed.ends_with(':') && trimmed.len() < 60 && !trimmed.contains('[')));
            if heading {
                break;
            }
        }
        collected.push_str(line);
        collected.push('\n');
    }
    marker_pattern().find_iter(&collected).count()
}

/// One rendered citation with its quality flags.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CitationDetail {
    pub id: String,
    pub standard: String,
    pub clause: String,
    pub score: f64,
    pub snippet: String,
    pub used_in_answer: bool,
    pub missing_fields: Vec<String>,
    pub noise: bool,
    pub rendered: String,
}

/// Citation list, per-item detail, and the quality payload for the
/// response.
pub fn build_citation_bundle(
    answer_text: &str,
    evidence: &[EvidenceItem],
    profile: &AgentProfile,
    requested_scopes: &[String],
) -> (Vec<String>, Vec<CitationDetail>, Value) {
    let synthesis = &profile.synthesis;
    let used_markers: Vec<String> = marker_pattern()
        .find_iter(answer_text)
        .map(|found| found.as_str().to_uppercase())
        .collect();

    let mut details: Vec<CitationDetail> = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    let mut structured_count = 0usize;
    let mut discarded_noise = 0usize;

    for item in evidence {
        let source = item.source.trim().to_string();
        if source.is_empty() {
            continue;
        }
        let key = source.to_uppercase();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key.clone());

        let standard = item.row_standard().unwrap_or_default();
        let clause = item
            .row_metadata()
            .and_then(|meta| {
                for field in ["clause_id", "clause_ref", "clause"] {
                    if let Some(value) = meta.get(field).and_then(Value::as_str) {
                        if !value.trim().is_empty() {
                            return Some(value.trim().to_string());
                        }
                    }
                }
                None
            })
            .unwrap_or_default();
        let snippet = clip_text(&item.content, 220);
        let lowered = item.content.to_lowercase();
        let noise = synthesis
            .citation_noise_filters
            .iter()
            .any(|token| !token.trim().is_empty() && lowered.contains(&token.trim().to_lowercase()));

        let mut missing_fields = Vec::new();
        for field in &synthesis.citation_required_fields {
            let present = match field.as_str() {
                "id" => !source.is_empty(),
                "standard" => !standard.is_empty(),
                "clause_id" => !clause.is_empty(),
                "quote" | "snippet" => !snippet.is_empty(),
                _ => true,
            };
            if !present {
                missing_fields.push(field.clone());
            }
        }

        if missing_fields.is_empty() && !noise {
            structured_count += 1;
        }
        if noise {
            discarded_noise += 1;
        }

        let rendered = synthesis
            .citation_render_template
            .replace("{id}", &source)
            .replace("{standard}", if standard.is_empty() { "N/A" } else { &standard })
            .replace("{clause_id}", if clause.is_empty() { "N/A" } else { &clause })
            .replace("{snippet}", &snippet)
            .replace("{quote}", &snippet);

        details.push(CitationDetail {
            used_in_answer: used_markers.contains(&key),
            id: source,
            standard,
            clause,
            score: item.score,
            snippet,
            missing_fields,
            noise,
            rendered,
        });
    }

    // Usable citations first: clean, used, complete, high score.
    details.sort_by(|a, b| {
        a.noise
            .cmp(&b.noise)
            .then_with(|| b.used_in_answer.cmp(&a.used_in_answer))
            .then_with(|| a.missing_fields.len().cmp(&b.missing_fields.len()))
            .then_with(|| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.id.cmp(&b.id))
    });

    let citations: Vec<String> = details
        .iter()
        .filter(|detail| !detail.noise)
        .map(|detail| detail.id.clone())
        .collect();

    let requested_upper: Vec<String> = requested_scopes
        .iter()
        .map(|scope| scope.trim().to_uppercase())
        .filter(|scope| !scope.is_empty())
        .collect();
    let mut citations_per_scope: serde_json::Map<String, Value> = requested_upper
        .iter()
        .map(|scope| (scope.clone(), json!(0)))
        .collect();
    for detail in &details {
        if detail.noise || detail.standard.is_empty() {
            continue;
        }
        for scope in &requested_upper {
            if scope_matches(scope, &detail.standard) {
                let count = citations_per_scope
                    .get(scope)
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                citations_per_scope.insert(scope.clone(), json!(count + 1));
                break;
            }
        }
    }
    let missing_scope_citations: Vec<String> = requested_upper
        .iter()
        .filter(|scope| {
            citations_per_scope
                .get(scope.as_str())
                .and_then(Value::as_u64)
                .unwrap_or(0)
                == 0
        })
        .cloned()
        .collect();

    let total = details.len().max(1);
    let quality = json!({
        "schema_version": synthesis.citation_schema_version,
        "total": details.len(),
        "structured_count": structured_count,
        "structured_ratio": (structured_count as f64 / total as f64 * 10_000.0).round() / 10_000.0,
        "discarded_noise": discarded_noise,
        "min_structured_citation_ratio": synthesis.min_structured_citation_ratio,
        "citations_per_scope": citations_per_scope,
        "missing_scope_citations": missing_scope_citations,
    });
    (citations, details, quality)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn scoped_item(source: &str, standard: &str, clause: &str) -> EvidenceItem {
        EvidenceItem::new(source, format!("{clause} texto normativo"), 0.9).with_metadata(json!({
            "row": {"metadata": {"source_standard": standard, "clause_id": clause}}
        }))
    }

    fn plan(standards: &[&str], literal: bool) -> RetrievalPlan {
        RetrievalPlan {
            require_literal_evidence: literal,
            requested_standards: standards.iter().map(|s| s.to_string()).collect(),
            ..RetrievalPlan::generic("literal_normativa", vec![])
        }
    }

    #[test]
    fn test_accepts_grounded_answer() {
        let draft = AnswerDraft {
            text: "Segun [C1], la clausula 9.1 exige seguimiento.".to_string(),
            mode: "literal_normativa".to_string(),
            evidence: vec![scoped_item("C1", "ISO 9001", "9.1")],
        };
        let result = CitationValidator.validate(
            &draft,
            &plan(&["ISO 9001"], true),
            "Que exige la cláusula 9.1 de ISO 9001?",
            &AgentProfile::default(),
        );
        assert!(result.accepted, "issues: {:?}", result.issues);
    }

    #[test]
    fn test_missing_markers_rejected() {
        let draft = AnswerDraft {
            text: "La norma exige seguimiento.".to_string(),
            mode: "explicativa".to_string(),
            evidence: vec![scoped_item("C1", "ISO 9001", "9.1")],
        };
        let result = CitationValidator.validate(
            &draft,
            &plan(&["ISO 9001"], false),
            "que exige",
            &AgentProfile::default(),
        );
        assert!(!result.accepted);
        assert!(result.issues.iter().any(|i| i.contains("source markers")));
    }

    #[test]
    fn test_scope_fidelity_on_answer_and_evidence() {
        let draft = AnswerDraft {
            text: "Segun [C1], ISO 27001 tambien aplica.".to_string(),
            mode: "explicativa".to_string(),
            evidence: vec![
                scoped_item("C1", "ISO 9001", "9.1"),
                scoped_item("C2", "ISO 14001", "6.1"),
            ],
        };
        let result = CitationValidator.validate(
            &draft,
            &plan(&["ISO 9001"], false),
            "que exige ISO 9001",
            &AgentProfile::default(),
        );
        assert!(!result.accepted);
        assert!(result
            .issues
            .iter()
            .any(|i| i.contains("answer mentions ISO 27001")));
        assert!(result
            .issues
            .iter()
            .any(|i| i.contains("evidence includes ISO 14001")));
    }

    #[test]
    fn test_literal_clause_mismatch() {
        let draft = AnswerDraft {
            text: "Segun [C1], hay requisitos.".to_string(),
            mode: "literal_normativa".to_string(),
            evidence: vec![scoped_item("C1", "ISO 9001", "4.4")],
        };
        let result = CitationValidator.validate(
            &draft,
            &plan(&["ISO 9001"], true),
            "que exige la clausula 9.1.2",
            &AgentProfile::default(),
        );
        assert!(!result.accepted);
        assert!(result
            .issues
            .iter()
            .any(|i| i.contains("literal clause mismatch")));
    }

    #[test]
    fn test_forbidden_concepts() {
        let mut profile = AgentProfile::default();
        profile.validation.forbidden_concepts = vec!["asesoria legal".to_string()];
        let draft = AnswerDraft {
            text: "Segun [C1], esto constituye asesoria legal.".to_string(),
            mode: "explicativa".to_string(),
            evidence: vec![scoped_item("C1", "ISO 9001", "9.1")],
        };
        let result =
            CitationValidator.validate(&draft, &plan(&["ISO 9001"], false), "q", &profile);
        assert!(!result.accepted);
        assert!(result.issues.iter().any(|i| i.contains("forbidden concept")));
    }

    #[test]
    fn test_grounded_inference_needs_two_citations() {
        let plan = RetrievalPlan {
            response_contract: Some("grounded_inference".to_string()),
            requested_standards: vec!["ISO 9001".to_string()],
            ..RetrievalPlan::generic("explicativa", vec![])
        };
        let draft = AnswerDraft {
            text: "Hechos citados:\n[C1] hecho.\n\nInferencias:\nSolo una cita [C1].".to_string(),
            mode: "explicativa".to_string(),
            evidence: vec![scoped_item("C1", "ISO 9001", "9.1")],
        };
        let result =
            CitationValidator.validate(&draft, &plan, "q", &AgentProfile::default());
        assert!(!result.accepted);
        assert!(result
            .issues
            .iter()
            .any(|i| i.contains("grounded inference")));

        let draft_ok = AnswerDraft {
            text: "Inferencias:\nSe infiere de [C1] y [C1] que...".to_string(),
            mode: "explicativa".to_string(),
            evidence: vec![scoped_item("C1", "ISO 9001", "9.1")],
        };
        let result = CitationValidator.validate(&draft_ok, &plan, "q", &AgentProfile::default());
        assert!(result.accepted, "issues: {:?}", result.issues);
    }

    #[test]
    fn test_citation_bundle_orders_and_counts() {
        let profile = AgentProfile::default();
        let evidence = vec![
            scoped_item("C2", "ISO 14001", "6.1"),
            scoped_item("C1", "ISO 9001", "9.1"),
            EvidenceItem::new("C3", "Índice de la traducción oficial", 0.95),
        ];
        let (citations, details, quality) = build_citation_bundle(
            "Segun [C1] el requisito aplica.",
            &evidence,
            &profile,
            &["ISO 9001".to_string(), "ISO 14001".to_string()],
        );
        assert_eq!(details[0].id, "C1");
        assert!(details[0].used_in_answer);
        assert!(!citations.contains(&"C3".to_string()));
        assert_eq!(quality["discarded_noise"], json!(1));
        assert_eq!(quality["citations_per_scope"]["ISO 9001"], json!(1));
        assert_eq!(
            quality["missing_scope_citations"],
            json!([] as [&str; 0])
        );
    }
}
