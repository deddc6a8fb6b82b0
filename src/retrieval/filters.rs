//! Score and noise policies applied to retrieved items.

use serde_json::Value;
use tracing::debug;

use crate::codes::{merge_error_codes, RETRIEVAL_LOW_SCORE};
use crate::model::{EvidenceItem, MinScoreFilterTrace, RetrievalTrace};

/// Backstop policy for the min-score filter.
#[derive(Debug, Clone, Copy)]
pub struct BackstopPolicy {
    pub enabled: bool,
    pub top_n: usize,
}

/// Drop items below the score threshold.
///
/// When everything would be dropped and the backstop is enabled, the best
/// `top_n` dropped items are kept and the degradation is flagged in the
/// trace. A fully dropped result records `low_score` in the error codes.
pub fn filter_by_min_score(
    items: Vec<EvidenceItem>,
    threshold: Option<f64>,
    backstop: BackstopPolicy,
    trace: &mut RetrievalTrace,
) -> Vec<EvidenceItem> {
    let Some(threshold) = threshold else {
        return items;
    };

    let mut kept: Vec<EvidenceItem> = Vec::new();
    let mut dropped: Vec<EvidenceItem> = Vec::new();
    for item in items {
        if item.score >= threshold {
            kept.push(item);
        } else {
            dropped.push(item);
        }
    }

    debug!(
        threshold,
        kept = kept.len(),
        dropped = dropped.len(),
        "retrieval_min_score_filter"
    );

    let mut backstop_applied = false;
    if kept.is_empty() && !dropped.is_empty() && backstop.enabled {
        dropped.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        kept = dropped.iter().take(backstop.top_n.max(1)).cloned().collect();
        backstop_applied = !kept.is_empty();
    }

    trace.min_score_filter = Some(MinScoreFilterTrace {
        threshold,
        kept: kept.len(),
        dropped: dropped.len(),
        backstop_applied,
        backstop_top_n: if backstop_applied { backstop.top_n } else { 0 },
    });
    if !dropped.is_empty() && (kept.is_empty() || backstop_applied) {
        trace.error_codes = merge_error_codes([
            std::mem::take(&mut trace.error_codes),
            vec![RETRIEVAL_LOW_SCORE.to_string()],
        ]);
    }
    kept
}

const NOISE_SECTION_TYPES: [&str; 4] = ["index", "toc", "frontmatter", "translation_frontmatter"];
const NOISE_CONTENT_MARKERS: [&str; 4] = [
    "indice",
    "índice",
    "traducción oficial",
    "official translation",
];
const NOISE_QUERY_TARGETS: [&str; 5] = [
    "indice",
    "índice",
    "tabla de contenido",
    "prólogo",
    "traducción",
];

fn is_structural_noise(item: &EvidenceItem) -> bool {
    if let Some(meta) = item.row_metadata() {
        if let Some(section) = meta.get("section_type").and_then(Value::as_str) {
            if NOISE_SECTION_TYPES.contains(&section.trim().to_lowercase().as_str()) {
                return true;
            }
        }
        for flag in ["is_index", "is_toc"] {
            if meta.get(flag).and_then(Value::as_bool) == Some(true) {
                return true;
            }
        }
    }
    let head: String = item.content.chars().take(80).collect::<String>().to_lowercase();
    NOISE_CONTENT_MARKERS
        .iter()
        .any(|marker| head.contains(marker))
}

/// Drop index/TOC/translation-frontmatter items unless the query targets
/// such sections.
pub fn reduce_structural_noise(items: Vec<EvidenceItem>, query: &str) -> Vec<EvidenceItem> {
    let lowered = query.to_lowercase();
    if NOISE_QUERY_TARGETS
        .iter()
        .any(|target| lowered.contains(target))
    {
        return items;
    }
    items
        .into_iter()
        .filter(|item| !is_structural_noise(item))
        .collect()
}

/// Record per-layer item counts into the trace.
pub fn record_layer_counts(items: &[EvidenceItem], trace: &mut RetrievalTrace) {
    trace.layer_counts.clear();
    for item in items {
        let layer = item
            .row_metadata()
            .and_then(|meta| meta.get("fusion_source"))
            .and_then(Value::as_str)
            .map(|value| value.trim().to_lowercase())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| {
                if item.is_summary() {
                    "raptor".to_string()
                } else {
                    "chunks".to_string()
                }
            });
        *trace.layer_counts.entry(layer).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn item(source: &str, score: f64) -> EvidenceItem {
        EvidenceItem::new(source, format!("requisito {source}"), score)
    }

    fn noise_item(source: &str, section: &str) -> EvidenceItem {
        EvidenceItem::new(source, "Índice de contenidos", 0.9).with_metadata(json!({
            "row": {"metadata": {"section_type": section}}
        }))
    }

    #[test]
    fn test_min_score_keeps_above_threshold() {
        let mut trace = RetrievalTrace::default();
        let kept = filter_by_min_score(
            vec![item("C1", 0.9), item("C2", 0.5)],
            Some(0.75),
            BackstopPolicy {
                enabled: false,
                top_n: 6,
            },
            &mut trace,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].source, "C1");
        let filter_trace = trace.min_score_filter.unwrap();
        assert_eq!(filter_trace.dropped, 1);
        assert!(!filter_trace.backstop_applied);
    }

    #[test]
    fn test_backstop_keeps_best_dropped_when_all_fall_below() {
        let mut trace = RetrievalTrace::default();
        let kept = filter_by_min_score(
            vec![item("C1", 0.2), item("C2", 0.6), item("C3", 0.4)],
            Some(0.75),
            BackstopPolicy {
                enabled: true,
                top_n: 2,
            },
            &mut trace,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].source, "C2");
        let filter_trace = trace.min_score_filter.unwrap();
        assert!(filter_trace.backstop_applied);
        assert!(trace.error_codes.contains(&RETRIEVAL_LOW_SCORE.to_string()));
    }

    #[test]
    fn test_no_backstop_records_low_score_code() {
        let mut trace = RetrievalTrace::default();
        let kept = filter_by_min_score(
            vec![item("C1", 0.1)],
            Some(0.75),
            BackstopPolicy {
                enabled: false,
                top_n: 6,
            },
            &mut trace,
        );
        assert!(kept.is_empty());
        assert_eq!(trace.error_codes, vec![RETRIEVAL_LOW_SCORE.to_string()]);
    }

    #[test]
    fn test_noise_reducer_drops_toc_unless_targeted() {
        let items = vec![noise_item("C1", "toc"), item("C2", 0.8)];
        let reduced = reduce_structural_noise(items.clone(), "que exige 9.1");
        assert_eq!(reduced.len(), 1);
        assert_eq!(reduced[0].source, "C2");

        let kept = reduce_structural_noise(items, "muestra el índice de la norma");
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_layer_counts() {
        let mut trace = RetrievalTrace::default();
        let summary = EvidenceItem::new("R1", "resumen", 0.8).with_metadata(json!({
            "row": {"metadata": {"fusion_source": "raptor"}}
        }));
        record_layer_counts(&[item("C1", 0.9), summary], &mut trace);
        assert_eq!(trace.layer_counts.get("chunks"), Some(&1));
        assert_eq!(trace.layer_counts.get("raptor"), Some(&1));
    }
}
