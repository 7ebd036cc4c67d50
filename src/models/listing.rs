//! Listing rows: catalog search results and detail-page snapshots.

use chrono::{DateTime, Utc};

/// One search-result card stored for an articulum.
#[derive(Debug, Clone)]
pub struct CatalogListing {
    pub articulum_id: i64,
    pub avito_item_id: String,
    pub title: String,
    pub price: Option<f64>,
    pub snippet_text: Option<String>,
    pub seller_name: Option<String>,
    pub seller_id: Option<String>,
    pub seller_rating: Option<f64>,
    pub seller_reviews: Option<i32>,
    pub image_urls: Option<Vec<String>>,
}

impl CatalogListing {
    /// Title, snippet and seller name folded into one lowercase string
    /// for text checks.
    pub fn combined_text(&self) -> String {
        let mut text = self.title.to_lowercase();
        if let Some(snippet) = &self.snippet_text {
            text.push(' ');
            text.push_str(&snippet.to_lowercase());
        }
        if let Some(seller) = &self.seller_name {
            text.push(' ');
            text.push_str(&seller.to_lowercase());
        }
        text
    }
}

/// One detail-page parse. Append-only: every successful parse of the same
/// listing adds a row, so view-count deltas stay analyzable.
#[derive(Debug, Clone)]
pub struct ObjectDataRecord {
    pub articulum_id: i64,
    pub avito_item_id: String,
    pub title: Option<String>,
    pub price: Option<f64>,
    pub seller_name: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub location_name: Option<String>,
    pub characteristics: Option<serde_json::Value>,
    pub views_total: Option<i32>,
    pub raw_html: Option<String>,
}
