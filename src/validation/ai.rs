//! Stage 3: turning an AI verdict into per-item results.

use std::collections::{HashMap, HashSet};

use crate::llm::{AiVerdict, NO_DECISION_REASON};
use crate::models::{CatalogListing, StageVerdict};

/// One verdict row per submitted listing. Items the model passed pass;
/// items it rejected carry the model's reason; items it never mentioned
/// are rejected with "no decision" — silence is not consent.
pub fn ai_stage_verdicts(listings: &[CatalogListing], verdict: &AiVerdict) -> Vec<StageVerdict> {
    let passed: HashSet<&str> = verdict.passed.iter().map(String::as_str).collect();
    let rejected: HashMap<&str, &str> = verdict
        .rejected
        .iter()
        .map(|r| (r.id.as_str(), r.reason.as_str()))
        .collect();

    listings
        .iter()
        .map(|l| {
            let id = l.avito_item_id.as_str();
            if passed.contains(id) {
                StageVerdict::pass(id)
            } else if let Some(reason) = rejected.get(id) {
                StageVerdict::reject(id, *reason)
            } else {
                StageVerdict::reject(id, NO_DECISION_REASON)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::RejectedItem;
    use crate::validation::listing;

    #[test]
    fn unmentioned_items_are_rejected_as_no_decision() {
        let listings = vec![
            listing("1", "a", Some(100.0)),
            listing("2", "b", Some(100.0)),
            listing("3", "c", Some(100.0)),
        ];
        let verdict = AiVerdict {
            passed: vec!["1".to_string()],
            rejected: vec![RejectedItem {
                id: "2".to_string(),
                reason: "analog part".to_string(),
            }],
        };

        let results = ai_stage_verdicts(&listings, &verdict);
        assert!(results[0].passed);
        assert!(!results[1].passed);
        assert_eq!(results[1].rejection_reason.as_deref(), Some("analog part"));
        assert!(!results[2].passed);
        assert_eq!(
            results[2].rejection_reason.as_deref(),
            Some(NO_DECISION_REASON)
        );
    }

    #[test]
    fn ids_unknown_to_us_are_ignored() {
        let listings = vec![listing("1", "a", Some(100.0))];
        let verdict = AiVerdict {
            passed: vec!["1".to_string(), "999".to_string()],
            rejected: vec![],
        };
        let results = ai_stage_verdicts(&listings, &verdict);
        assert_eq!(results.len(), 1);
        assert!(results[0].passed);
    }
}
