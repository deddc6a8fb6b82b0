//! Query routing: intent classification and scope/clause extraction.
//!
//! Classification is profile-driven. Ordered intent rules are matched
//! against the query (keywords, regex patterns, virtual markers); the first
//! fully matching rule wins. Without a match the profile default mode is
//! selected at reduced confidence.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::model::QueryIntent;
use crate::profile::AgentProfile;

/// Default confidence when a rule matches.
const RULE_CONFIDENCE: f64 = 0.85;
/// Confidence for profile-default classification.
const DEFAULT_MODE_CONFIDENCE: f64 = 0.55;
/// Confidence when not even a default mode exists.
const GENERIC_CONFIDENCE: f64 = 0.4;

fn clause_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b\d+(?:\.\d+)+\b").unwrap())
}

fn iso_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\biso\s*[-:]?\s*(\d{4,5})\b").unwrap()
    })
}

fn mode_override_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)__(?:clarified_)?mode__\s*=\s*(\w+)")
            .unwrap()
    })
}

/// Built-in analytical-connector tokens marking complex queries; profiles
/// can replace them through `router.complexity_hints`.
const DEFAULT_COMPLEXITY_HINTS: [&str; 8] = [
    "impacto",
    "relacion",
    "relación",
    "difer",
    "versus",
    "vs",
    "interaccion",
    "por que",
];

/// Classification trace payload for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationTrace {
    pub version: String,
    pub mode: String,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub requested_scopes_count: usize,
}

fn compile(pattern: &str) -> Option<Regex> {
    let trimmed = pattern.trim();
    if trimmed.is_empty() {
        return None;
    }
    Regex::new(&format!("(?i){trimmed}")).ok()
}

fn has_any_keyword(haystack: &str, values: &[String]) -> bool {
    values
        .iter()
        .map(|value| value.trim().to_lowercase())
        .filter(|value| !value.is_empty())
        .any(|value| haystack.contains(&value))
}

fn has_all_keywords(haystack: &str, values: &[String]) -> bool {
    values
        .iter()
        .map(|value| value.trim().to_lowercase())
        .filter(|value| !value.is_empty())
        .all(|value| haystack.contains(&value))
}

fn has_any_pattern(text: &str, values: &[String]) -> bool {
    values
        .iter()
        .filter_map(|value| compile(value))
        .any(|pattern| pattern.is_match(text))
}

fn has_all_patterns(text: &str, values: &[String]) -> bool {
    values
        .iter()
        .filter(|value| !value.trim().is_empty())
        .all(|value| compile(value).map(|p| p.is_match(text)).unwrap_or(false))
}

/// Parse an explicit `__mode__=<m>` / `__clarified_mode__=<m>` override.
pub fn explicit_mode_override(query: &str, profile: &AgentProfile) -> Option<String> {
    let captures = mode_override_pattern().captures(query)?;
    let mode = captures.get(1)?.as_str().trim().to_string();
    profile.query_modes.modes.contains_key(&mode).then_some(mode)
}

/// Classify a query against the profile's ordered intent rules.
pub fn classify_intent(query: &str, profile: &AgentProfile) -> (QueryIntent, ClassificationTrace) {
    let lowered = query.to_lowercase();
    let requested = extract_requested_scopes(query, profile);

    if let Some(mode) = explicit_mode_override(query, profile) {
        return (
            QueryIntent::new(&mode, "explicit_mode_override"),
            ClassificationTrace {
                version: "profile_rules_v1".to_string(),
                mode,
                confidence: 0.95,
                reasons: vec!["explicit_override".to_string()],
                requested_scopes_count: requested.len(),
            },
        );
    }

    for rule in &profile.query_modes.intent_rules {
        let mode = rule.mode.trim();
        if mode.is_empty() || !profile.query_modes.modes.contains_key(mode) {
            continue;
        }
        if !has_all_keywords(&lowered, &rule.all_keywords) {
            continue;
        }
        if !rule.any_keywords.is_empty() && !has_any_keyword(&lowered, &rule.any_keywords) {
            continue;
        }
        if !has_all_patterns(query, &rule.all_patterns) {
            continue;
        }
        if !rule.any_patterns.is_empty() && !has_any_pattern(query, &rule.any_patterns) {
            continue;
        }
        if !has_all_keywords(&lowered, &rule.all_markers) {
            continue;
        }
        if !rule.any_markers.is_empty() && !has_any_keyword(&lowered, &rule.any_markers) {
            continue;
        }
        return (
            QueryIntent::new(mode, format!("profile_rule:{}", rule.id)),
            ClassificationTrace {
                version: "profile_rules_v1".to_string(),
                mode: mode.to_string(),
                confidence: RULE_CONFIDENCE,
                reasons: vec![format!("rule:{}", rule.id)],
                requested_scopes_count: requested.len(),
            },
        );
    }

    let default_mode = profile.query_modes.default_mode.trim();
    if !default_mode.is_empty() {
        return (
            QueryIntent::new(default_mode, "profile_default_mode"),
            ClassificationTrace {
                version: "profile_rules_v1".to_string(),
                mode: default_mode.to_string(),
                confidence: DEFAULT_MODE_CONFIDENCE,
                reasons: vec!["default_mode".to_string()],
                requested_scopes_count: requested.len(),
            },
        );
    }

    (
        QueryIntent::new("default", "generic_default_mode"),
        ClassificationTrace {
            version: "generic".to_string(),
            mode: "default".to_string(),
            confidence: GENERIC_CONFIDENCE,
            reasons: vec!["generic_default".to_string()],
            requested_scopes_count: requested.len(),
        },
    )
}

fn looks_like_scope_label(value: &str) -> bool {
    let text = value.trim();
    if text.is_empty() {
        return false;
    }
    static DIGITS: OnceLock<Regex> = OnceLock::new();
    static BODIES: OnceLock<Regex> = OnceLock::new();
    let digits = DIGITS.get_or_init(|| Regex::new(r"\d{2,}").unwrap());
    let bodies = BODIES.get_or_init(|| {
        Regex::new(r"(?i)\b(?:ISO|IEC|NOM|NMX|ASTM|NFPA|OSHA|UNE|EN|IRAM|BS|DIN)\b")
            .unwrap()
    });
    if digits.is_match(text) || bodies.is_match(text) {
        return true;
    }
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    compact.len() <= 12 && compact.chars().all(|c| !c.is_alphabetic() || c.is_uppercase())
}

/// Extract requested scope labels in detection order.
///
/// Profile scope patterns run first (labeled patterns emit their label),
/// then scope hints, then the generic ISO-reference fallback.
pub fn extract_requested_scopes(query: &str, profile: &AgentProfile) -> Vec<String> {
    let lowered = query.to_lowercase();
    let mut ordered: Vec<String> = Vec::new();
    let mut add = |candidate: String, ordered: &mut Vec<String>| {
        let value = candidate.trim().to_string();
        if !value.is_empty() && !ordered.contains(&value) {
            ordered.push(value);
        }
    };

    for pattern in &profile.router.scope_patterns {
        let Some(regex) = compile(&pattern.regex) else {
            continue;
        };
        if !regex.is_match(query) {
            continue;
        }
        match &pattern.label {
            Some(label) => add(label.clone(), &mut ordered),
            None => {
                for found in regex.find_iter(query) {
                    let candidate = found.as_str().trim().to_uppercase();
                    if looks_like_scope_label(&candidate) {
                        add(candidate, &mut ordered);
                    }
                }
            }
        }
    }

    for (scope_label, hints) in &profile.router.scope_hints {
        if hints
            .iter()
            .any(|hint| lowered.contains(&hint.to_lowercase()))
        {
            add(scope_label.clone(), &mut ordered);
        }
    }

    for captures in iso_pattern().captures_iter(query) {
        if let Some(digits) = captures.get(1) {
            add(format!("ISO {}", digits.as_str()), &mut ordered);
        }
    }

    ordered
}

/// Extract clause references from a query using profile reference patterns,
/// falling back to the dotted-number pattern.
pub fn extract_clause_refs(text: &str, profile: &AgentProfile) -> Vec<String> {
    let compiled: Vec<Regex> = profile
        .router
        .reference_patterns
        .iter()
        .filter_map(|pattern| compile(pattern))
        .collect();

    let mut ordered: Vec<String> = Vec::new();
    let mut push_matches = |regex: &Regex| {
        for found in regex.find_iter(text) {
            let value = found.as_str().to_string();
            if !ordered.contains(&value) {
                ordered.push(value);
            }
        }
    };

    if compiled.is_empty() {
        push_matches(clause_pattern());
    } else {
        for regex in &compiled {
            push_matches(regex);
        }
    }
    ordered
}

/// Scope candidates: requested scopes plus any hinted scope the query
/// brushes against, for clarification options.
pub fn detect_scope_candidates(query: &str, profile: &AgentProfile) -> Vec<String> {
    let mut candidates = extract_requested_scopes(query, profile);
    let lowered = query.to_lowercase();
    for (scope_label, hints) in &profile.router.scope_hints {
        if candidates.contains(scope_label) {
            continue;
        }
        if hints
            .iter()
            .any(|hint| lowered.contains(&hint.to_lowercase()))
        {
            candidates.push(scope_label.clone());
        }
    }
    candidates
}

/// Whether the query reads as complex: multiple scopes, multiple clause
/// references, or analytical-connector tokens.
pub fn is_complex_query(query: &str, profile: &AgentProfile) -> bool {
    if extract_requested_scopes(query, profile).len() >= 2 {
        return true;
    }
    if extract_clause_refs(query, profile).len() >= 2 {
        return true;
    }
    let lowered = query.to_lowercase();
    if profile.router.complexity_hints.is_empty() {
        DEFAULT_COMPLEXITY_HINTS
            .iter()
            .any(|token| lowered.contains(token))
    } else {
        has_any_keyword(&lowered, &profile.router.complexity_hints)
    }
}

/// Whether the query matches any of the given profile patterns.
pub fn matches_profile_patterns(query: &str, patterns: &[String]) -> bool {
    has_any_pattern(query, patterns)
}

/// Vague-goal phrasings that raise ambiguity.
pub fn vague_goal_signal(query: &str) -> bool {
    let lowered = query.to_lowercase();
    [
        "que dice",
        "qué dice",
        "explica",
        "hablame",
        "háblame",
        "cuentame",
        "cuéntame",
        "dime",
    ]
    .iter()
    .any(|token| lowered.contains(token))
}

/// Whether free text reads as a bare scope label rather than an objective.
pub fn looks_like_scope_phrase(text: &str) -> bool {
    let compact = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if compact.is_empty() {
        return false;
    }
    static STANDARD: OnceLock<Regex> = OnceLock::new();
    static SHORT_CODE: OnceLock<Regex> = OnceLock::new();
    static BARE_DIGITS: OnceLock<Regex> = OnceLock::new();
    let standard = STANDARD.get_or_init(|| {
        Regex::new(
            r"(?i)^(?:iso|iec|nom|nmx|nfpa|osha|en|une|iram|bs|din)\s*[-:_]?\s*\d{2,6}(?:[:\-]\d{4})?$",
        )
        .unwrap()
    });
    let short_code = SHORT_CODE.get_or_init(|| {
        Regex::new(r"^[A-Za-z]{2,12}[-_ ]?\d{2,6}$").unwrap()
    });
    let bare_digits = BARE_DIGITS
        .get_or_init(|| Regex::new(r"^\d{3,6}$").unwrap());
    standard.is_match(&compact) || short_code.is_match(&compact) || bare_digits.is_match(&compact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{IntentRule, ScopePattern};
    use pretty_assertions::assert_eq;

    fn profile_with_rules() -> AgentProfile {
        let mut profile = AgentProfile::default();
        profile.query_modes.default_mode = "explicativa".to_string();
        profile
            .query_modes
            .modes
            .insert("literal_normativa".to_string(), Default::default());
        profile
            .query_modes
            .modes
            .insert("comparativa".to_string(), Default::default());
        profile
            .query_modes
            .modes
            .insert("explicativa".to_string(), Default::default());
        profile.query_modes.intent_rules = vec![
            IntentRule {
                id: "literal".to_string(),
                mode: "literal_normativa".to_string(),
                any_keywords: vec!["que exige".to_string(), "texto exacto".to_string()],
                all_patterns: vec![r"\d+(?:\.\d+)+".to_string()],
                ..Default::default()
            },
            IntentRule {
                id: "comparative".to_string(),
                mode: "comparativa".to_string(),
                any_keywords: vec!["compar".to_string(), "difer".to_string()],
                ..Default::default()
            },
        ];
        profile
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let profile = profile_with_rules();
        let (intent, trace) =
            classify_intent("Que exige la cláusula 9.1 de ISO 9001?", &profile);
        assert_eq!(intent.mode, "literal_normativa");
        assert_eq!(trace.confidence, RULE_CONFIDENCE);
        assert_eq!(intent.rationale, "profile_rule:literal");
    }

    #[test]
    fn test_classification_is_stable() {
        let profile = profile_with_rules();
        let query = "Compara ISO 9001 con ISO 14001";
        let (first, _) = classify_intent(query, &profile);
        let (second, _) = classify_intent(query, &profile);
        assert_eq!(first.mode, second.mode);
        assert_eq!(first.mode, "comparativa");
    }

    #[test]
    fn test_default_mode_for_low_signal_query() {
        let profile = profile_with_rules();
        let (intent, trace) = classify_intent("qué dice eso", &profile);
        assert_eq!(intent.mode, "explicativa");
        assert!(trace.confidence < RULE_CONFIDENCE);
    }

    #[test]
    fn test_explicit_mode_override_marker() {
        let profile = profile_with_rules();
        let (intent, _) = classify_intent("lo de siempre __mode__=comparativa", &profile);
        assert_eq!(intent.mode, "comparativa");
        assert_eq!(intent.rationale, "explicit_mode_override");
    }

    #[test]
    fn test_extract_scopes_generic_iso_fallback() {
        let profile = AgentProfile::default();
        let scopes = extract_requested_scopes(
            "Compara ISO 9001 9.1.2 con ISO 14001 9.1.1 e ISO 45001 5.3",
            &profile,
        );
        assert_eq!(scopes, vec!["ISO 9001", "ISO 14001", "ISO 45001"]);
    }

    #[test]
    fn test_extract_scopes_labeled_pattern() {
        let mut profile = AgentProfile::default();
        profile.router.scope_patterns = vec![ScopePattern {
            label: Some("NOM-035".to_string()),
            regex: r"nom\s*-?\s*035".to_string(),
        }];
        let scopes = extract_requested_scopes("aplica la NOM 035?", &profile);
        assert_eq!(scopes, vec!["NOM-035"]);
    }

    #[test]
    fn test_extract_clause_refs_ordered_dedup() {
        let profile = AgentProfile::default();
        let refs = extract_clause_refs("revisa 9.1.2 y 9.1.2 junto a 5.3", &profile);
        assert_eq!(refs, vec!["9.1.2", "5.3"]);
    }

    #[test]
    fn test_complexity_signals() {
        let profile = AgentProfile::default();
        assert!(is_complex_query("ISO 9001 vs ISO 14001", &profile));
        assert!(is_complex_query("impacto de 9.1 en los registros", &profile));
        assert!(!is_complex_query("lista los requisitos de 9.1", &profile));
    }

    #[test]
    fn test_scope_phrase_detection() {
        assert!(looks_like_scope_phrase("ISO 9001"));
        assert!(looks_like_scope_phrase("45001"));
        assert!(!looks_like_scope_phrase("los riesgos del proceso"));
    }
}
