//! CDP-backed marketplace driver.
//!
//! Navigation plus DOM extraction for search-result and detail pages.
//! Page-state detection is marker-based: the same markers the
//! marketplace renders for its block/captcha/error interstitials. All
//! HTML work happens in sync helpers so no parser state crosses an await
//! point.

use async_trait::async_trait;
use chrono::DateTime;
use scraper::{Html, Selector};
use tracing::{debug, warn};

use super::driver::{
    build_search_url, CardDetails, CardOutcome, CardStatus, CatalogOutcome, CatalogRequest,
    CatalogStatus, DriverError, ListingDriver, ParsedListing,
};
use super::session::BrowserSession;

/// Coarse classification of a rendered page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageState {
    Catalog,
    EmptyCatalog,
    Card,
    Removed,
    Captcha,
    ProxyBlocked,
    ServerError,
    Unknown,
}

fn detect_page_state(html: &str) -> PageState {
    let doc = Html::parse_document(html);

    let has = |css: &str| {
        Selector::parse(css)
            .ok()
            .map(|sel| doc.select(&sel).next().is_some())
            .unwrap_or(false)
    };

    if has("[data-marker=\"firewall-container\"]")
        || html.contains("Доступ ограничен")
        || html.contains("h-captcha")
        || html.contains("geetest")
    {
        return PageState::Captcha;
    }
    if html.contains("403 Forbidden") || html.contains("Access denied") {
        return PageState::ProxyBlocked;
    }
    if html.contains("502 Bad Gateway")
        || html.contains("503 Service")
        || html.contains("504 Gateway")
    {
        return PageState::ServerError;
    }
    if has("[data-marker=\"item-view/closed-warning\"]")
        || html.contains("Объявление снято с публикации")
        || html.contains("Такой страницы не существует")
    {
        return PageState::Removed;
    }
    if has("[data-marker=\"item-view/title-info\"]") {
        return PageState::Card;
    }
    if has("[data-marker=\"no-results-title\"]") || html.contains("ничего не нашлось") {
        return PageState::EmptyCatalog;
    }
    if has("[data-marker=\"catalog-serp\"]") {
        return PageState::Catalog;
    }
    PageState::Unknown
}

fn select_text(doc: &Html, css: &str) -> Option<String> {
    let sel = Selector::parse(css).ok()?;
    let text: String = doc
        .select(&sel)
        .next()?
        .text()
        .collect::<String>()
        .trim()
        .to_string();
    (!text.is_empty()).then_some(text)
}

fn parse_number(text: &str) -> Option<f64> {
    let digits: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    digits.parse().ok()
}

fn extract_catalog_cards(html: &str) -> Vec<ParsedListing> {
    let doc = Html::parse_document(html);
    let Ok(card_sel) = Selector::parse("div[data-marker=\"item\"]") else {
        return Vec::new();
    };
    let title_sel = Selector::parse("[itemprop=\"name\"]").ok();
    let price_sel = Selector::parse("meta[itemprop=\"price\"]").ok();
    let snippet_sel = Selector::parse("[data-marker=\"item-specific-params\"]").ok();
    let seller_sel = Selector::parse("[data-marker=\"seller-info\"] a").ok();
    let reviews_sel = Selector::parse("[data-marker=\"seller-rating/summary\"]").ok();
    let rating_sel = Selector::parse("[data-marker=\"seller-rating/score\"]").ok();
    let image_sel = Selector::parse("img[itemprop=\"image\"]").ok();

    let mut cards = Vec::new();
    for element in doc.select(&card_sel) {
        let Some(item_id) = element.value().attr("data-item-id") else {
            continue;
        };

        let inner = |sel: &Option<Selector>| {
            sel.as_ref().and_then(|s| {
                let text: String = element.select(s).next()?.text().collect();
                let text = text.trim().to_string();
                (!text.is_empty()).then_some(text)
            })
        };

        let price = price_sel.as_ref().and_then(|s| {
            element
                .select(s)
                .next()
                .and_then(|m| m.value().attr("content"))
                .and_then(parse_number)
        });

        let seller_id = seller_sel.as_ref().and_then(|s| {
            element
                .select(s)
                .next()
                .and_then(|a| a.value().attr("href"))
                .and_then(|href| href.rsplit('/').next())
                .map(|id| id.to_string())
        });

        let image_urls = image_sel
            .as_ref()
            .map(|s| {
                element
                    .select(s)
                    .filter_map(|img| img.value().attr("src"))
                    .map(|src| src.to_string())
                    .collect()
            })
            .unwrap_or_default();

        cards.push(ParsedListing {
            item_id: item_id.to_string(),
            title: inner(&title_sel).unwrap_or_default(),
            price,
            snippet: inner(&snippet_sel),
            seller_name: inner(&seller_sel),
            seller_id,
            seller_rating: inner(&rating_sel).as_deref().and_then(parse_number),
            seller_reviews: inner(&reviews_sel)
                .as_deref()
                .and_then(parse_number)
                .map(|n| n as i32),
            image_urls,
        });
    }
    cards
}

fn has_next_page(html: &str) -> bool {
    let doc = Html::parse_document(html);
    Selector::parse("[data-marker=\"pagination-button/nextPage\"]")
        .ok()
        .map(|sel| doc.select(&sel).next().is_some())
        .unwrap_or(false)
}

fn extract_card(html: &str, include_html: bool) -> CardDetails {
    let doc = Html::parse_document(html);

    let characteristics = Selector::parse("[data-marker=\"item-view/item-params\"] li")
        .ok()
        .map(|sel| {
            doc.select(&sel)
                .filter_map(|li| {
                    let text: String = li.text().collect();
                    let (key, value) = text.split_once(':')?;
                    Some((key.trim().to_string(), value.trim().to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    let published_at = select_text(&doc, "[data-marker=\"item-view/item-date\"]")
        .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
        .map(|dt| dt.to_utc());

    CardDetails {
        title: select_text(&doc, "h1[data-marker=\"item-view/title-info\"]"),
        price: Selector::parse("meta[itemprop=\"price\"]")
            .ok()
            .and_then(|sel| {
                doc.select(&sel)
                    .next()
                    .and_then(|m| m.value().attr("content"))
                    .and_then(parse_number)
            }),
        seller_name: select_text(&doc, "[data-marker=\"seller-info/name\"]"),
        published_at,
        description: select_text(&doc, "[data-marker=\"item-view/item-description\"]"),
        location_name: select_text(&doc, "[data-marker=\"item-view/item-address\"]"),
        characteristics,
        views_total: select_text(&doc, "[data-marker=\"item-view/total-views\"]")
            .as_deref()
            .and_then(parse_number)
            .map(|n| n as i32),
        raw_html: include_html.then(|| html.to_string()),
    }
}

/// Marketplace driver over a CDP session.
pub struct MarketplaceDriver {
    base_url: String,
    item_url_origin: String,
    include_html: bool,
}

impl MarketplaceDriver {
    pub fn new(base_url: &str, include_html: bool) -> Self {
        let item_url_origin = url::Url::parse(base_url)
            .ok()
            .and_then(|u| {
                u.host_str()
                    .map(|h| format!("{}://{}", u.scheme(), h))
            })
            .unwrap_or_else(|| base_url.trim_end_matches('/').to_string());
        Self {
            base_url: base_url.to_string(),
            item_url_origin,
            include_html,
        }
    }

    async fn fetch(&self, session: &BrowserSession, url: &str) -> Result<String, DriverError> {
        let page = session.page();
        page.goto(url)
            .await
            .map_err(|e| DriverError::classify(e.to_string()))?;
        page.wait_for_navigation()
            .await
            .map_err(|e| DriverError::classify(e.to_string()))?;
        page.content()
            .await
            .map_err(|e| DriverError::classify(e.to_string()))
    }
}

#[async_trait]
impl ListingDriver for MarketplaceDriver {
    async fn parse_catalog(
        &self,
        session: &BrowserSession,
        request: &CatalogRequest,
    ) -> Result<CatalogOutcome, DriverError> {
        let mut listings = Vec::new();
        let mut page_no = request.start_page;
        let mut pages_processed = 0;

        while pages_processed < request.max_pages {
            let url = build_search_url(&self.base_url, &request.query, page_no);
            debug!(%url, "loading catalog page");

            let html = match self.fetch(session, &url).await {
                Ok(html) => html,
                Err(DriverError::Transient(msg)) if msg.to_lowercase().contains("timeout") => {
                    return Ok(CatalogOutcome {
                        status: CatalogStatus::LoadTimeout,
                        listings,
                        resume_page: page_no,
                        pages_processed,
                    });
                }
                Err(e) => return Err(e),
            };

            match detect_page_state(&html) {
                PageState::Catalog => {
                    let mut cards = extract_catalog_cards(&html);
                    debug!(page = page_no, cards = cards.len(), "catalog page parsed");
                    listings.append(&mut cards);
                    pages_processed += 1;
                    page_no += 1;
                    if !has_next_page(&html) {
                        break;
                    }
                }
                PageState::EmptyCatalog => {
                    // Only an empty first page means an empty catalog;
                    // later pages just end the pass.
                    let status = if pages_processed == 0 && listings.is_empty() {
                        CatalogStatus::Empty
                    } else {
                        CatalogStatus::Success
                    };
                    return Ok(CatalogOutcome {
                        status,
                        listings,
                        resume_page: page_no,
                        pages_processed,
                    });
                }
                PageState::Captcha => {
                    warn!(page = page_no, "captcha challenge, giving up this pass");
                    return Ok(CatalogOutcome {
                        status: CatalogStatus::CaptchaFailed,
                        listings,
                        resume_page: page_no,
                        pages_processed,
                    });
                }
                PageState::ProxyBlocked => {
                    return Ok(CatalogOutcome {
                        status: CatalogStatus::ProxyBlocked,
                        listings,
                        resume_page: page_no,
                        pages_processed,
                    });
                }
                PageState::ServerError => {
                    return Ok(CatalogOutcome {
                        status: CatalogStatus::ServerUnavailable,
                        listings,
                        resume_page: page_no,
                        pages_processed,
                    });
                }
                PageState::Card | PageState::Removed => {
                    return Ok(CatalogOutcome {
                        status: CatalogStatus::WrongPage,
                        listings,
                        resume_page: page_no,
                        pages_processed,
                    });
                }
                PageState::Unknown => {
                    return Ok(CatalogOutcome {
                        status: CatalogStatus::PageNotDetected,
                        listings,
                        resume_page: page_no,
                        pages_processed,
                    });
                }
            }
        }

        Ok(CatalogOutcome {
            status: CatalogStatus::Success,
            listings,
            resume_page: page_no,
            pages_processed,
        })
    }

    async fn parse_card(
        &self,
        session: &BrowserSession,
        item_id: &str,
    ) -> Result<CardOutcome, DriverError> {
        let url = format!("{}/{}", self.item_url_origin, item_id);
        debug!(%url, "loading detail page");
        let html = self.fetch(session, &url).await?;

        let status = match detect_page_state(&html) {
            PageState::Card => CardStatus::Success,
            PageState::Removed => CardStatus::NotFound,
            PageState::Captcha => CardStatus::CaptchaFailed,
            PageState::ProxyBlocked => CardStatus::ProxyBlocked,
            PageState::ServerError => CardStatus::ServerUnavailable,
            PageState::Catalog | PageState::EmptyCatalog => CardStatus::WrongPage,
            PageState::Unknown => CardStatus::PageNotDetected,
        };

        if status != CardStatus::Success {
            return Ok(CardOutcome::status_only(status));
        }

        Ok(CardOutcome {
            status,
            data: Some(extract_card(&html, self.include_html)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_captcha_and_block_pages() {
        assert_eq!(
            detect_page_state("<html><body>Доступ ограничен</body></html>"),
            PageState::Captcha
        );
        assert_eq!(
            detect_page_state("<html><body><h1>403 Forbidden</h1></body></html>"),
            PageState::ProxyBlocked
        );
        assert_eq!(
            detect_page_state("<html><body>502 Bad Gateway</body></html>"),
            PageState::ServerError
        );
        assert_eq!(detect_page_state("<html><body>hi</body></html>"), PageState::Unknown);
    }

    #[test]
    fn detects_catalog_card_and_removed_pages() {
        assert_eq!(
            detect_page_state(r#"<div data-marker="catalog-serp"></div>"#),
            PageState::Catalog
        );
        assert_eq!(
            detect_page_state(r#"<h1 data-marker="item-view/title-info">t</h1>"#),
            PageState::Card
        );
        assert_eq!(
            detect_page_state("<p>Объявление снято с публикации</p>"),
            PageState::Removed
        );
        assert_eq!(
            detect_page_state("<p>По вашему запросу ничего не нашлось</p>"),
            PageState::EmptyCatalog
        );
    }

    #[test]
    fn extracts_cards_with_ids_prices_and_titles() {
        let html = r#"
            <div data-marker="catalog-serp">
              <div data-marker="item" data-item-id="123">
                <h3 itemprop="name">Фара LR081595 новая</h3>
                <meta itemprop="price" content="5500">
                <div data-marker="item-specific-params">оригинал, в наличии</div>
              </div>
              <div data-marker="item" data-item-id="456">
                <h3 itemprop="name">Фара правая</h3>
              </div>
              <div data-marker="item"></div>
            </div>"#;

        let cards = extract_catalog_cards(html);
        assert_eq!(cards.len(), 2);
        assert_eq!(cards[0].item_id, "123");
        assert_eq!(cards[0].title, "Фара LR081595 новая");
        assert_eq!(cards[0].price, Some(5500.0));
        assert_eq!(cards[0].snippet.as_deref(), Some("оригинал, в наличии"));
        assert_eq!(cards[1].item_id, "456");
        assert_eq!(cards[1].price, None);
    }

    #[test]
    fn extracts_card_characteristics() {
        let html = r#"
            <h1 data-marker="item-view/title-info">Фара LR081595</h1>
            <meta itemprop="price" content="7200">
            <ul data-marker="item-view/item-params">
              <li>Состояние: Новое</li>
              <li>Тип запчасти: Оптика</li>
            </ul>
            <div data-marker="item-view/total-views">154 просмотра</div>"#;

        let card = extract_card(html, false);
        assert_eq!(card.title.as_deref(), Some("Фара LR081595"));
        assert_eq!(card.price, Some(7200.0));
        assert_eq!(
            card.characteristics.get("Состояние").map(String::as_str),
            Some("Новое")
        );
        assert_eq!(card.views_total, Some(154));
        assert!(card.raw_html.is_none());
    }

    #[test]
    fn parse_number_strips_non_digits() {
        assert_eq!(parse_number("5 500 ₽"), Some(5500.0));
        assert_eq!(parse_number("154 просмотра"), Some(154.0));
        assert_eq!(parse_number("нет цифр"), None);
    }
}
