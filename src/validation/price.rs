//! Stage 1: the minimum-price floor.

use crate::models::{CatalogListing, StageVerdict};

/// Deterministic, no external dependency: an item fails when its price
/// is missing or below the floor.
pub fn price_filter(listings: &[CatalogListing], min_price: f64) -> Vec<StageVerdict> {
    listings
        .iter()
        .map(|l| match l.price {
            Some(price) if price >= min_price => StageVerdict::pass(&l.avito_item_id),
            Some(price) => StageVerdict::reject(
                &l.avito_item_id,
                format!("price {price} below minimum {min_price}"),
            ),
            None => StageVerdict::reject(&l.avito_item_id, "price missing"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::listing;

    #[test]
    fn rejects_missing_and_cheap_prices() {
        let listings = vec![
            listing("1", "ok", Some(1500.0)),
            listing("2", "cheap", Some(999.0)),
            listing("3", "no price", None),
            listing("4", "boundary", Some(1000.0)),
        ];
        let verdicts = price_filter(&listings, 1000.0);

        assert!(verdicts[0].passed);
        assert!(!verdicts[1].passed);
        assert!(!verdicts[2].passed);
        assert_eq!(verdicts[2].rejection_reason.as_deref(), Some("price missing"));
        // the floor itself passes
        assert!(verdicts[3].passed);
    }
}
