//! Browser glue and the marketplace driver contract.
//!
//! `session` owns Chromium lifecycle (one browser + one page per worker,
//! proxied through the worker's claimed proxy). `driver` is the typed
//! contract the workers consume; `market` is the CDP-backed
//! implementation for the marketplace.

mod driver;
mod market;
mod session;

pub use driver::{
    build_search_url, CardDetails, CardOutcome, CardStatus, CatalogOutcome, CatalogRequest,
    CatalogStatus, DriverError, ListingDriver, ParsedListing,
};
pub use market::MarketplaceDriver;
pub use session::BrowserSession;
