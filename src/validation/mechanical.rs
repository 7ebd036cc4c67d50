//! Stage 2: mechanical checks.
//!
//! Sequential sub-checks, first failure wins: articulum presence in the
//! listing text, stop-words, seller review count, and an IQR-based
//! price-sanity screen against suspiciously cheap outliers.

use regex::Regex;
use tracing::debug;

use crate::models::{CatalogListing, StageVerdict};

/// Fraction of the top-40% median below which a price is suspicious.
const SUSPICIOUS_PRICE_RATIO: f64 = 0.5;

/// Fewer prices than this and the quartile screen is skipped.
const MIN_PRICES_FOR_IQR: usize = 4;

/// Knobs for the mechanical stage.
pub struct MechanicalConfig {
    pub require_articulum_in_text: bool,
    pub min_seller_reviews: i32,
    pub enable_price_validation: bool,
}

/// Pre-compiled word-boundary matchers for the stop-word list.
pub struct StopwordMatcher {
    patterns: Vec<(String, Regex)>,
}

impl StopwordMatcher {
    pub fn new(stopwords: &[String]) -> Self {
        let patterns = stopwords
            .iter()
            .filter_map(|word| {
                let pattern = format!(r"\b{}\b", regex::escape(&word.to_lowercase()));
                Regex::new(&pattern).ok().map(|re| (word.clone(), re))
            })
            .collect();
        Self { patterns }
    }

    /// First stop-word occurring in the (already case-folded) text.
    pub fn find(&self, text: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map(|(word, _)| word.as_str())
    }
}

/// Fold text for articulum matching: lowercase, map visually-equivalent
/// Cyrillic letters onto their Latin homoglyphs, drop everything that is
/// not alphanumeric. Sellers often type part numbers with Cyrillic
/// lookalikes, which a byte-wise search would miss.
pub fn normalize_for_match(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| match c {
            'а' => 'a',
            'в' => 'b',
            'е' => 'e',
            'к' => 'k',
            'м' => 'm',
            'н' => 'h',
            'о' => 'o',
            'р' => 'p',
            'с' => 'c',
            'т' => 't',
            'у' => 'y',
            'х' => 'x',
            other => other,
        })
        .filter(|c| c.is_alphanumeric())
        .collect()
}

fn articulum_present(articulum: &str, listing: &CatalogListing) -> bool {
    let needle = normalize_for_match(articulum);
    if needle.is_empty() {
        return true;
    }
    if normalize_for_match(&listing.title).contains(&needle) {
        return true;
    }
    listing
        .snippet_text
        .as_deref()
        .is_some_and(|s| normalize_for_match(s).contains(&needle))
}

/// Exclusive-method quartile (matches the classic (n+1)·k/4 positional
/// interpolation) over an ascending-sorted slice.
fn quartile_exclusive(sorted: &[f64], k: usize) -> f64 {
    let n = sorted.len();
    let pos = ((n + 1) as f64 * k as f64 / 4.0).clamp(1.0, n as f64);
    let lo = pos.floor();
    let frac = pos - lo;
    let lo_idx = (lo as usize) - 1;
    let hi_idx = (lo_idx + 1).min(n - 1);
    sorted[lo_idx] + frac * (sorted[hi_idx] - sorted[lo_idx])
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Threshold below which a price counts as suspiciously low, or `None`
/// when there is not enough data for the screen.
///
/// Quartiles over the non-null prices define the sane range
/// `[Q1 - IQR, Q3 + IQR]`; within it, the median of the top 40% of
/// prices anchors the threshold.
pub(super) fn suspicious_price_threshold(prices: &[f64]) -> Option<f64> {
    if prices.len() < MIN_PRICES_FOR_IQR {
        return None;
    }
    let mut sorted = prices.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let q1 = quartile_exclusive(&sorted, 1);
    let q3 = quartile_exclusive(&sorted, 3);
    let iqr = q3 - q1;
    let lower = q1 - iqr;
    let upper = q3 + iqr;

    let mut retained: Vec<f64> = sorted
        .iter()
        .copied()
        .filter(|p| (lower..=upper).contains(p))
        .collect();
    if retained.is_empty() {
        return None;
    }

    retained.sort_by(|a, b| b.total_cmp(a));
    let top_count = (retained.len() * 2 / 5).max(1);
    let mut top: Vec<f64> = retained[..top_count].to_vec();
    top.sort_by(|a, b| a.total_cmp(b));
    let median_top40 = median(&top);

    debug!(
        q1,
        q3, iqr, lower, upper, median_top40, "price sanity statistics"
    );
    Some(median_top40 * SUSPICIOUS_PRICE_RATIO)
}

/// Run the mechanical sub-checks over all listings of one articulum.
pub fn mechanical_filter(
    articulum: &str,
    listings: &[CatalogListing],
    stopwords: &StopwordMatcher,
    config: &MechanicalConfig,
) -> Vec<StageVerdict> {
    let threshold = if config.enable_price_validation {
        let prices: Vec<f64> = listings.iter().filter_map(|l| l.price).collect();
        suspicious_price_threshold(&prices)
    } else {
        None
    };

    listings
        .iter()
        .map(|l| {
            if config.require_articulum_in_text && !articulum_present(articulum, l) {
                return StageVerdict::reject(
                    &l.avito_item_id,
                    format!("articulum {articulum} not found in listing text"),
                );
            }

            if let Some(word) = stopwords.find(&l.combined_text()) {
                return StageVerdict::reject(&l.avito_item_id, format!("stop-word: \"{word}\""));
            }

            if config.min_seller_reviews > 0 {
                match l.seller_reviews {
                    Some(reviews) if reviews >= config.min_seller_reviews => {}
                    other => {
                        return StageVerdict::reject(
                            &l.avito_item_id,
                            format!(
                                "seller reviews {} below minimum {}",
                                other.map_or_else(|| "n/a".to_string(), |r| r.to_string()),
                                config.min_seller_reviews
                            ),
                        );
                    }
                }
            }

            if let (Some(threshold), Some(price)) = (threshold, l.price) {
                if price < threshold {
                    return StageVerdict::reject(
                        &l.avito_item_id,
                        format!("suspiciously low price: {price} < {threshold:.2}"),
                    );
                }
            }

            StageVerdict::pass(&l.avito_item_id)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::listing;

    fn config() -> MechanicalConfig {
        MechanicalConfig {
            require_articulum_in_text: false,
            min_seller_reviews: 0,
            enable_price_validation: true,
        }
    }

    fn matcher() -> StopwordMatcher {
        StopwordMatcher::new(&crate::config::DEFAULT_STOPWORDS
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>())
    }

    #[test]
    fn normalization_maps_cyrillic_homoglyphs() {
        // Cyrillic "LR081595" typed with Russian letters; р folds to
        // Latin p, л has no homoglyph and stays Cyrillic
        assert_eq!(normalize_for_match("LR081595"), "lr081595");
        assert_eq!(normalize_for_match("ЛР-081595"), "лp081595");
        assert_eq!(normalize_for_match("lr 081-595"), "lr081595");
        // homoglyphs: с->c, а->a, е->e, р->p
        assert_eq!(normalize_for_match("САЕ-Р"), "caep");
    }

    #[test]
    fn articulum_found_through_homoglyphs_and_punctuation() {
        let mut l = listing("1", "Фара LR 081-595 оригинал", Some(5000.0));
        assert!(articulum_present("LR081595", &l));

        // part number typed entirely with Cyrillic lookalikes
        l.title = "Фильтр САТ500 новый".to_string();
        assert!(articulum_present("CAT500", &l));

        l.title = "Совсем другая деталь".to_string();
        l.snippet_text = Some("подходит вместо lr081595".to_string());
        assert!(articulum_present("LR081595", &l));

        l.snippet_text = None;
        assert!(!articulum_present("LR081595", &l));
    }

    #[test]
    fn stopwords_match_on_word_boundaries() {
        let m = matcher();
        assert_eq!(m.find("новая копия фары"), Some("копия"));
        assert_eq!(m.find("состояние б/у, торг"), Some("б/у"));
        // "бумага" contains "бу" but not on a word boundary
        assert_eq!(m.find("бумага для принтера"), None);
    }

    #[test]
    fn rejects_stopworded_listing_with_reason() {
        let listings = vec![
            listing("1", "Фара оригинал", Some(5000.0)),
            listing("2", "Фара реплика дешево", Some(5200.0)),
        ];
        let verdicts = mechanical_filter("LR1", &listings, &matcher(), &config());
        assert!(verdicts[0].passed);
        assert!(!verdicts[1].passed);
        assert!(verdicts[1]
            .rejection_reason
            .as_deref()
            .unwrap()
            .contains("реплика"));
    }

    #[test]
    fn seller_review_floor_applies_when_configured() {
        let mut cheap_reviews = listing("1", "Фара", Some(5000.0));
        cheap_reviews.seller_reviews = Some(2);
        let mut no_reviews = listing("2", "Фара", Some(5000.0));
        no_reviews.seller_reviews = None;
        let mut enough = listing("3", "Фара", Some(5000.0));
        enough.seller_reviews = Some(25);

        let cfg = MechanicalConfig {
            min_seller_reviews: 10,
            ..config()
        };
        let verdicts =
            mechanical_filter("LR1", &[cheap_reviews, no_reviews, enough], &matcher(), &cfg);
        assert!(!verdicts[0].passed);
        assert!(!verdicts[1].passed);
        assert!(verdicts[2].passed);
    }

    #[test]
    fn iqr_screen_rejects_the_suspicious_outlier() {
        // prices 100/110/105/115 plus a 20 outlier
        let listings = vec![
            listing("1", "a", Some(100.0)),
            listing("2", "b", Some(110.0)),
            listing("3", "c", Some(105.0)),
            listing("4", "d", Some(115.0)),
            listing("5", "e", Some(20.0)),
        ];
        let verdicts = mechanical_filter("LR1", &listings, &matcher(), &config());
        assert!(verdicts[0].passed);
        assert!(verdicts[1].passed);
        assert!(verdicts[2].passed);
        assert!(verdicts[3].passed);
        assert!(!verdicts[4].passed);
        assert!(verdicts[4]
            .rejection_reason
            .as_deref()
            .unwrap()
            .contains("suspiciously low"));
    }

    #[test]
    fn iqr_screen_needs_at_least_four_prices() {
        assert_eq!(suspicious_price_threshold(&[100.0, 20.0]), None);
        assert_eq!(suspicious_price_threshold(&[]), None);
    }

    #[test]
    fn quartiles_use_exclusive_interpolation() {
        let sorted = [20.0, 100.0, 105.0, 110.0, 115.0];
        assert_eq!(quartile_exclusive(&sorted, 1), 60.0);
        assert_eq!(quartile_exclusive(&sorted, 3), 112.5);
    }

    #[test]
    fn price_screen_skipped_when_disabled() {
        let listings = vec![
            listing("1", "a", Some(100.0)),
            listing("2", "b", Some(110.0)),
            listing("3", "c", Some(105.0)),
            listing("4", "d", Some(115.0)),
            listing("5", "e", Some(20.0)),
        ];
        let cfg = MechanicalConfig {
            enable_price_validation: false,
            ..config()
        };
        let verdicts = mechanical_filter("LR1", &listings, &matcher(), &cfg);
        assert!(verdicts.iter().all(|v| v.passed));
    }
}
