//! Multi-stage listing validation.
//!
//! Three stages run in order — price filter, mechanical checks, optional
//! AI review — each writing one result row per item. An item is fully
//! validated iff it passes every enabled stage. The stage logic here is
//! pure; the validation worker owns claiming, persistence and state
//! transitions.

mod ai;
mod mechanical;
mod price;

pub use ai::ai_stage_verdicts;
pub use mechanical::{MechanicalConfig, StopwordMatcher};
pub use price::price_filter;

pub use mechanical::mechanical_filter;

use crate::models::{CatalogListing, StageVerdict};

/// Keep only the listings a stage passed.
pub fn apply_verdicts(
    listings: Vec<CatalogListing>,
    verdicts: &[StageVerdict],
) -> Vec<CatalogListing> {
    use std::collections::HashSet;

    let passed: HashSet<&str> = verdicts
        .iter()
        .filter(|v| v.passed)
        .map(|v| v.avito_item_id.as_str())
        .collect();
    listings
        .into_iter()
        .filter(|l| passed.contains(l.avito_item_id.as_str()))
        .collect()
}

#[cfg(test)]
pub(crate) fn listing(item_id: &str, title: &str, price: Option<f64>) -> CatalogListing {
    CatalogListing {
        articulum_id: 1,
        avito_item_id: item_id.to_string(),
        title: title.to_string(),
        price,
        snippet_text: None,
        seller_name: None,
        seller_id: None,
        seller_rating: None,
        seller_reviews: None,
        image_urls: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_verdicts_keeps_passing_items_only() {
        let listings = vec![
            listing("1", "a", Some(10.0)),
            listing("2", "b", Some(20.0)),
            listing("3", "c", Some(30.0)),
        ];
        let verdicts = vec![
            StageVerdict::pass("1"),
            StageVerdict::reject("2", "nope"),
            StageVerdict::pass("3"),
        ];
        let survivors = apply_verdicts(listings, &verdicts);
        let ids: Vec<_> = survivors.iter().map(|l| l.avito_item_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }
}
