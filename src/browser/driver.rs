//! Typed contract between browser workers and the marketplace driver.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::session::BrowserSession;

/// Outcome class of a catalog parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogStatus {
    /// Pages parsed; `listings` holds whatever was found (possibly none).
    Success,
    /// The search answered with an explicit empty result.
    Empty,
    /// The marketplace blocked the proxy's address.
    ProxyBlocked,
    /// The proxy demanded authentication mid-session.
    ProxyAuthRequired,
    /// An anti-bot challenge appeared and was not passed.
    CaptchaFailed,
    /// Page load exceeded the navigation timeout.
    LoadTimeout,
    /// The page rendered but matched no known layout.
    PageNotDetected,
    /// A recognizable page, but not a search-results page.
    WrongPage,
    /// 5xx from the marketplace.
    ServerUnavailable,
}

/// Outcome class of a detail-page parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardStatus {
    Success,
    ProxyBlocked,
    CaptchaFailed,
    /// The listing is gone (removed or expired).
    NotFound,
    PageNotDetected,
    WrongPage,
    ServerUnavailable,
}

/// One search-result card.
#[derive(Debug, Clone, Default)]
pub struct ParsedListing {
    pub item_id: String,
    pub title: String,
    pub price: Option<f64>,
    pub snippet: Option<String>,
    pub seller_name: Option<String>,
    pub seller_id: Option<String>,
    pub seller_rating: Option<f64>,
    pub seller_reviews: Option<i32>,
    pub image_urls: Vec<String>,
}

/// Parameters of one catalog pass.
#[derive(Debug, Clone)]
pub struct CatalogRequest {
    /// The articulum, sent as the search query.
    pub query: String,
    /// First page to parse (the task checkpoint).
    pub start_page: i32,
    /// Upper bound on pages for this pass.
    pub max_pages: i32,
}

/// Result of a catalog pass.
#[derive(Debug, Clone)]
pub struct CatalogOutcome {
    pub status: CatalogStatus,
    pub listings: Vec<ParsedListing>,
    /// First page still to parse; persisting this lets a rotated or
    /// requeued task resume instead of starting over.
    pub resume_page: i32,
    pub pages_processed: i32,
}

/// Detail-page payload.
#[derive(Debug, Clone, Default)]
pub struct CardDetails {
    pub title: Option<String>,
    pub price: Option<f64>,
    pub seller_name: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub location_name: Option<String>,
    pub characteristics: BTreeMap<String, String>,
    pub views_total: Option<i32>,
    pub raw_html: Option<String>,
}

/// Result of a detail-page parse.
#[derive(Debug, Clone)]
pub struct CardOutcome {
    pub status: CardStatus,
    pub data: Option<CardDetails>,
}

impl CardOutcome {
    pub fn status_only(status: CardStatus) -> Self {
        Self { status, data: None }
    }
}

/// Driver-level failures, i.e. errors raised below the status taxonomy.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Transient network fault; the proxy earns a strike.
    #[error("transient network error: {0}")]
    Transient(String),
    /// Permanent proxy fault; the proxy is blocked outright.
    #[error("permanent proxy fault: {0}")]
    ProxyFault(String),
    #[error("driver error: {0}")]
    Other(String),
}

impl DriverError {
    /// Classify a raw CDP/network error message.
    ///
    /// Tunnel and proxy-auth failures will not heal on retry; connection
    /// resets, closed sockets and TCP timeouts may.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        const PERMANENT: &[&str] = &[
            "err_proxy_connection_failed",
            "err_tunnel_connection_failed",
            "proxy authentication required",
            "err_proxy_auth",
            "407 proxy authentication",
        ];
        const TRANSIENT: &[&str] = &[
            "err_connection_closed",
            "err_connection_reset",
            "err_network_changed",
            "err_connection_timed_out",
            "err_timed_out",
            "err_empty_response",
            "err_aborted",
            "connection closed",
            "connection reset",
            "timeout",
        ];

        if PERMANENT.iter().any(|p| lower.contains(p)) {
            DriverError::ProxyFault(message)
        } else if TRANSIENT.iter().any(|p| lower.contains(p)) {
            DriverError::Transient(message)
        } else {
            DriverError::Other(message)
        }
    }
}

/// Build a search URL: `{base}?q={query}&s=104[&p={page}]`.
///
/// `s=104` is the marketplace's newest-first sort; validation depends on
/// fresh listings coming ahead of stale ones.
pub fn build_search_url(base: &str, query: &str, page: i32) -> String {
    match url::Url::parse(base) {
        Ok(mut url) => {
            {
                let mut pairs = url.query_pairs_mut();
                pairs.append_pair("q", query);
                pairs.append_pair("s", "104");
                if page > 1 {
                    pairs.append_pair("p", &page.to_string());
                }
            }
            url.to_string()
        }
        Err(_) => base.to_string(),
    }
}

/// The marketplace driver as consumed by browser workers.
///
/// Implementations own navigation and extraction; the worker owns the
/// proxy, the session and all queue/state bookkeeping. Rotation after a
/// proxy block is expressed by calling `parse_catalog` again with the
/// persisted checkpoint as `start_page` on a fresh session.
#[async_trait]
pub trait ListingDriver: Send + Sync {
    async fn parse_catalog(
        &self,
        session: &BrowserSession,
        request: &CatalogRequest,
    ) -> Result<CatalogOutcome, DriverError>;

    async fn parse_card(
        &self,
        session: &BrowserSession,
        item_id: &str,
    ) -> Result<CardOutcome, DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_url_carries_query_sort_and_page() {
        let url = build_search_url("https://www.avito.ru/rossiya", "LR081595", 1);
        assert_eq!(url, "https://www.avito.ru/rossiya?q=LR081595&s=104");

        let url = build_search_url("https://www.avito.ru/rossiya", "LR081595", 3);
        assert!(url.ends_with("&p=3"));
    }

    #[test]
    fn search_url_percent_encodes_the_query() {
        let url = build_search_url("https://www.avito.ru/rossiya", "болт м8 / 10", 1);
        assert!(!url.contains(' '));
        assert!(url.contains("q=%D0%B1%D0%BE%D0%BB%D1%82"));
    }

    #[test]
    fn classify_splits_transient_from_permanent() {
        assert!(matches!(
            DriverError::classify("net::ERR_TUNNEL_CONNECTION_FAILED"),
            DriverError::ProxyFault(_)
        ));
        assert!(matches!(
            DriverError::classify("407 Proxy Authentication Required"),
            DriverError::ProxyFault(_)
        ));
        assert!(matches!(
            DriverError::classify("net::ERR_CONNECTION_RESET"),
            DriverError::Transient(_)
        ));
        assert!(matches!(
            DriverError::classify("Timeout waiting for response"),
            DriverError::Transient(_)
        ));
        assert!(matches!(
            DriverError::classify("something else entirely"),
            DriverError::Other(_)
        ));
    }
}
