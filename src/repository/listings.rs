//! Catalog listings and detail-page snapshots.

use std::collections::HashSet;

use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use tracing::debug;

use crate::models::{CatalogListing, ObjectDataRecord};
use crate::schema::{catalog_listings, object_data};

use super::pool::{DbError, PgPool};

#[derive(Clone)]
pub struct ListingRepository {
    pool: PgPool,
}

impl ListingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Store search-result cards for an articulum.
    ///
    /// Exact repeats of the same card text (title + snippet) within the
    /// batch are collapsed first; the unique constraint on
    /// `avito_item_id` absorbs the rest (`ON CONFLICT DO NOTHING`), so
    /// re-parsing a catalog is idempotent. Returns the number of rows
    /// offered to the insert.
    pub async fn upsert_catalog_listings(
        &self,
        listings: &[CatalogListing],
    ) -> Result<usize, DbError> {
        if listings.is_empty() {
            return Ok(0);
        }

        let mut seen: HashSet<(&str, Option<&str>)> = HashSet::new();
        let unique: Vec<&CatalogListing> = listings
            .iter()
            .filter(|l| seen.insert((l.title.as_str(), l.snippet_text.as_deref())))
            .collect();
        if unique.len() < listings.len() {
            debug!(
                dropped = listings.len() - unique.len(),
                "dropped duplicate cards (same title + snippet)"
            );
        }

        let rows: Vec<_> = unique
            .iter()
            .map(|l| {
                (
                    catalog_listings::articulum_id.eq(l.articulum_id),
                    catalog_listings::avito_item_id.eq(l.avito_item_id.as_str()),
                    catalog_listings::title.eq(l.title.as_str()),
                    catalog_listings::price.eq(l.price),
                    catalog_listings::snippet_text.eq(l.snippet_text.as_deref()),
                    catalog_listings::seller_name.eq(l.seller_name.as_deref()),
                    catalog_listings::seller_id.eq(l.seller_id.as_deref()),
                    catalog_listings::seller_rating.eq(l.seller_rating),
                    catalog_listings::seller_reviews.eq(l.seller_reviews),
                    catalog_listings::image_urls.eq(l.image_urls.clone()),
                )
            })
            .collect();

        let mut conn = self.pool.get().await?;
        diesel::insert_into(catalog_listings::table)
            .values(&rows)
            .on_conflict(catalog_listings::avito_item_id)
            .do_nothing()
            .execute(&mut conn)
            .await
    }

    /// All stored cards for an articulum, for the validation pipeline.
    pub async fn listings_for_articulum(
        &self,
        articulum_id: i64,
    ) -> Result<Vec<CatalogListing>, DbError> {
        let mut conn = self.pool.get().await?;
        let rows: Vec<(
            i64,
            String,
            String,
            Option<f64>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<f64>,
            Option<i32>,
            Option<Vec<String>>,
        )> = catalog_listings::table
            .filter(catalog_listings::articulum_id.eq(articulum_id))
            .select((
                catalog_listings::articulum_id,
                catalog_listings::avito_item_id,
                catalog_listings::title,
                catalog_listings::price,
                catalog_listings::snippet_text,
                catalog_listings::seller_name,
                catalog_listings::seller_id,
                catalog_listings::seller_rating,
                catalog_listings::seller_reviews,
                catalog_listings::image_urls,
            ))
            .load(&mut conn)
            .await?;

        Ok(rows
            .into_iter()
            .map(
                |(
                    articulum_id,
                    avito_item_id,
                    title,
                    price,
                    snippet_text,
                    seller_name,
                    seller_id,
                    seller_rating,
                    seller_reviews,
                    image_urls,
                )| CatalogListing {
                    articulum_id,
                    avito_item_id,
                    title,
                    price,
                    snippet_text,
                    seller_name,
                    seller_id,
                    seller_rating,
                    seller_reviews,
                    image_urls,
                },
            )
            .collect())
    }

    /// Append one detail-page snapshot. Every successful parse creates a
    /// new row so view-count history stays queryable.
    pub async fn insert_object_data(&self, record: &ObjectDataRecord) -> Result<i64, DbError> {
        let mut conn = self.pool.get().await?;
        diesel::insert_into(object_data::table)
            .values((
                object_data::articulum_id.eq(record.articulum_id),
                object_data::avito_item_id.eq(record.avito_item_id.as_str()),
                object_data::title.eq(record.title.as_deref()),
                object_data::price.eq(record.price),
                object_data::seller_name.eq(record.seller_name.as_deref()),
                object_data::published_at.eq(record.published_at),
                object_data::description.eq(record.description.as_deref()),
                object_data::location_name.eq(record.location_name.as_deref()),
                object_data::characteristics.eq(record.characteristics.clone()),
                object_data::views_total.eq(record.views_total),
                object_data::raw_html.eq(record.raw_html.as_deref()),
            ))
            .returning(object_data::id)
            .get_result(&mut conn)
            .await
    }
}
