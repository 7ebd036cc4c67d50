//! Database context: one pool, one accessor per repository.

use diesel_async::SimpleAsyncConnection;
use tracing::info;

use super::articulums::ArticulumRepository;
use super::catalog_tasks::CatalogTaskRepository;
use super::listings::ListingRepository;
use super::object_tasks::ObjectTaskRepository;
use super::pool::{DbError, PgPool};
use super::proxies::ProxyRepository;
use super::recovery::RecoveryRepository;
use super::util::redact_url_password;
use super::validation::ValidationRepository;

/// Entry point for all database operations. Create one per process and
/// clone it into workers; clones share the pool.
#[derive(Clone)]
pub struct DbContext {
    pool: PgPool,
}

impl DbContext {
    /// Create a context from a PostgreSQL URL.
    pub fn from_url(database_url: &str) -> Result<Self, DbError> {
        info!("connecting to {}", redact_url_password(database_url));
        Ok(Self {
            pool: PgPool::new(database_url)?,
        })
    }

    /// Create a context with a pool sized for a known worker fleet.
    pub fn from_url_with_size(database_url: &str, pool_size: usize) -> Result<Self, DbError> {
        info!(
            pool_size,
            "connecting to {}",
            redact_url_password(database_url)
        );
        Ok(Self {
            pool: PgPool::with_size(database_url, pool_size)?,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn articulums(&self) -> ArticulumRepository {
        ArticulumRepository::new(self.pool.clone())
    }

    pub fn catalog_tasks(&self) -> CatalogTaskRepository {
        CatalogTaskRepository::new(self.pool.clone())
    }

    pub fn object_tasks(&self) -> ObjectTaskRepository {
        ObjectTaskRepository::new(self.pool.clone())
    }

    pub fn listings(&self) -> ListingRepository {
        ListingRepository::new(self.pool.clone())
    }

    pub fn proxies(&self) -> ProxyRepository {
        ProxyRepository::new(self.pool.clone())
    }

    pub fn validation(&self) -> ValidationRepository {
        ValidationRepository::new(self.pool.clone())
    }

    pub fn recovery(&self) -> RecoveryRepository {
        RecoveryRepository::new(self.pool.clone())
    }

    /// Verify the database is reachable. Useful for failing fast at
    /// startup before workers are spawned.
    pub async fn test_connection(&self) -> Result<(), DbError> {
        let mut conn = self.pool.get().await?;
        conn.batch_execute("SELECT 1").await
    }

    /// Create all tables and indexes if they do not exist.
    pub async fn init_schema(&self) -> Result<(), DbError> {
        let mut conn = self.pool.get().await?;

        conn.batch_execute(
            r#"
            -- Part numbers flowing through the pipeline
            CREATE TABLE IF NOT EXISTS articulums (
                id BIGSERIAL PRIMARY KEY,
                articulum TEXT NOT NULL UNIQUE,
                state TEXT NOT NULL DEFAULT 'NEW',
                state_updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            -- Fixed pool of upstream proxies
            CREATE TABLE IF NOT EXISTS proxies (
                id BIGSERIAL PRIMARY KEY,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                username TEXT,
                password TEXT,
                is_blocked BOOLEAN NOT NULL DEFAULT FALSE,
                is_in_use BOOLEAN NOT NULL DEFAULT FALSE,
                worker_id TEXT,
                consecutive_errors INTEGER NOT NULL DEFAULT 0,
                last_error_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (host, port)
            );

            -- Search-result parsing queue, one task per articulum pass
            CREATE TABLE IF NOT EXISTS catalog_tasks (
                id BIGSERIAL PRIMARY KEY,
                articulum_id BIGINT NOT NULL REFERENCES articulums(id),
                status TEXT NOT NULL DEFAULT 'pending',
                checkpoint_page INTEGER NOT NULL DEFAULT 1,
                worker_id TEXT,
                heartbeat_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            -- Detail-page parsing queue, one task per listing
            CREATE TABLE IF NOT EXISTS object_tasks (
                id BIGSERIAL PRIMARY KEY,
                articulum_id BIGINT NOT NULL REFERENCES articulums(id),
                avito_item_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                worker_id TEXT,
                heartbeat_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            -- Search-result cards
            CREATE TABLE IF NOT EXISTS catalog_listings (
                id BIGSERIAL PRIMARY KEY,
                articulum_id BIGINT NOT NULL REFERENCES articulums(id),
                avito_item_id TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                price DOUBLE PRECISION,
                snippet_text TEXT,
                seller_name TEXT,
                seller_id TEXT,
                seller_rating DOUBLE PRECISION,
                seller_reviews INTEGER,
                image_urls TEXT[],
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            -- Detail-page snapshots, append-only
            CREATE TABLE IF NOT EXISTS object_data (
                id BIGSERIAL PRIMARY KEY,
                articulum_id BIGINT NOT NULL REFERENCES articulums(id),
                avito_item_id TEXT NOT NULL,
                title TEXT,
                price DOUBLE PRECISION,
                seller_name TEXT,
                published_at TIMESTAMPTZ,
                description TEXT,
                location_name TEXT,
                characteristics JSONB,
                views_total INTEGER,
                raw_html TEXT,
                parsed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            -- Per-(articulum, item, stage) filter outcomes
            CREATE TABLE IF NOT EXISTS validation_results (
                id BIGSERIAL PRIMARY KEY,
                articulum_id BIGINT NOT NULL REFERENCES articulums(id),
                avito_item_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                passed BOOLEAN NOT NULL,
                rejection_reason TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            -- Reparse scope filters; empty tables mean "everything"
            CREATE TABLE IF NOT EXISTS reparse_filter_items (
                avito_item_id TEXT PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS reparse_filter_articulums (
                articulum TEXT PRIMARY KEY
            );

            -- Indexes backing conditional transitions and queue scans
            CREATE INDEX IF NOT EXISTS idx_articulums_state
                ON articulums(state);
            CREATE INDEX IF NOT EXISTS idx_articulums_state_updated
                ON articulums(state, state_updated_at);
            CREATE INDEX IF NOT EXISTS idx_catalog_tasks_status_heartbeat
                ON catalog_tasks(status, heartbeat_at);
            CREATE INDEX IF NOT EXISTS idx_catalog_tasks_articulum
                ON catalog_tasks(articulum_id);
            CREATE INDEX IF NOT EXISTS idx_object_tasks_status_heartbeat
                ON object_tasks(status, heartbeat_at);
            CREATE INDEX IF NOT EXISTS idx_object_tasks_articulum
                ON object_tasks(articulum_id);
            -- At most one live task per listing
            CREATE UNIQUE INDEX IF NOT EXISTS idx_object_tasks_live_item
                ON object_tasks(avito_item_id)
                WHERE status IN ('pending', 'processing');
            CREATE INDEX IF NOT EXISTS idx_catalog_listings_articulum
                ON catalog_listings(articulum_id);
            CREATE INDEX IF NOT EXISTS idx_object_data_item
                ON object_data(avito_item_id);
            CREATE INDEX IF NOT EXISTS idx_validation_results_articulum
                ON validation_results(articulum_id);
            "#,
        )
        .await
    }
}
