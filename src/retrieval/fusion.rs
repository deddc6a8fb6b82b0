//! Deterministic reciprocal-rank fusion.
//!
//! Subquery result lists are merged by summing `1/(rrf_k + rank)` per
//! occurrence. Items keep their original retrieval score; fusion scores
//! only order the merge. Ties break on item id so the merge is independent
//! of input list order.

use std::collections::BTreeMap;

use crate::model::EvidenceItem;

/// Stable dedup key for an item: its marker, or its content when the
/// marker is blank.
fn item_key(item: &EvidenceItem) -> String {
    let source = item.source.trim();
    if !source.is_empty() {
        return source.to_uppercase();
    }
    item.content.clone()
}

/// Merge ranked lists with reciprocal-rank fusion.
///
/// Returns at most `top_k` items ordered by fusion score descending, then
/// key ascending. Duplicate items accumulate contributions from every list
/// they appear in; the retained copy is the highest-scored occurrence.
pub fn reciprocal_rank_fusion(
    lists: &[Vec<EvidenceItem>],
    rrf_k: u32,
    top_k: usize,
) -> Vec<EvidenceItem> {
    let mut fused: BTreeMap<String, (f64, EvidenceItem)> = BTreeMap::new();

    for list in lists {
        for (rank, item) in list.iter().enumerate() {
            let contribution = 1.0 / (f64::from(rrf_k) + rank as f64 + 1.0);
            let key = item_key(item);
            match fused.get_mut(&key) {
                Some((score, kept)) => {
                    *score += contribution;
                    if item.score > kept.score {
                        *kept = item.clone();
                    }
                }
                None => {
                    fused.insert(key, (contribution, item.clone()));
                }
            }
        }
    }

    let mut ranked: Vec<(String, f64, EvidenceItem)> = fused
        .into_iter()
        .map(|(key, (score, item))| (key, score, item))
        .collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    ranked
        .into_iter()
        .take(top_k)
        .map(|(_, _, item)| item)
        .collect()
}
