use crate::delivery::{Delivery, DeliveryTarget};
use crate::error::WatchError;
use crate::models::ListingRecord;
use crate::watcher::cycle::CycleSummary;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use duckdb::{Connection, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

// ── Schema ────────────────────────────────────────────────────────────────────

const DDL: &str = r#"
CREATE SEQUENCE IF NOT EXISTS cycle_runs_id START 1;

CREATE TABLE IF NOT EXISTS listings (
    scope           VARCHAR   NOT NULL,
    listing_key     VARCHAR   NOT NULL,
    external_id     VARCHAR   NOT NULL,
    watcher         VARCHAR   NOT NULL,
    url             VARCHAR   NOT NULL,
    title           VARCHAR   NOT NULL DEFAULT '',
    price_czk       BIGINT,
    area_m2         DOUBLE,
    dispo           VARCHAR,
    locality        VARCHAR,
    price_per_m2    BIGINT,
    description     VARCHAR,
    -- JSON array of image URLs
    images          VARCHAR,
    first_seen_at   TIMESTAMP NOT NULL,
    PRIMARY KEY (scope, listing_key)
);

CREATE TABLE IF NOT EXISTS cycle_runs (
    id                  BIGINT PRIMARY KEY DEFAULT nextval('cycle_runs_id'),
    scope               VARCHAR   NOT NULL,
    watcher             VARCHAR   NOT NULL,
    finished_at         TIMESTAMP NOT NULL,
    total_found         INTEGER   DEFAULT 0,
    emitted             INTEGER   DEFAULT 0,
    skipped             INTEGER   DEFAULT 0,
    deferred            INTEGER   DEFAULT 0,
    delivery_failures   INTEGER   DEFAULT 0,
    seen_size           INTEGER   DEFAULT 0
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_listings_watcher ON listings (watcher);
CREATE INDEX IF NOT EXISTS idx_listings_seen    ON listings (first_seen_at);
CREATE INDEX IF NOT EXISTS idx_runs_scope       ON cycle_runs (scope);
"#;

/// Row shape returned by `recent_listings`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredListing {
    pub scope: String,
    pub watcher: String,
    pub external_id: String,
    pub url: String,
    pub title: String,
    pub price_czk: Option<i64>,
    pub first_seen_at: NaiveDateTime,
}

// ── Repository ────────────────────────────────────────────────────────────────

/// DuckDB listing store. Doubles as a delivery sink for the web dashboard.
pub struct Repository {
    conn: Mutex<Connection>,
}

impl Repository {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DuckDB at {:?}", path))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn run_migrations(&self) -> Result<()> {
        info!("Running migrations…");
        let conn = self.conn();
        conn.execute_batch(DDL).context("DDL failed")?;
        conn.execute_batch(INDEXES).context("Index creation failed")?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
            params![Utc::now().naive_utc()],
        )?;
        info!("Migrations done.");
        Ok(())
    }

    // ── Listings ──────────────────────────────────────────────────────────────

    /// Insert unless `(scope, listing_key)` is already stored. Returns whether a row was added.
    pub fn insert_listing(&self, target: &DeliveryTarget, record: &ListingRecord) -> Result<bool> {
        let images = serde_json::to_string(&record.images)?;
        let key = record.identity.key();
        let conn = self.conn();

        let existing: i64 = conn.query_row(
            "SELECT COUNT(*) FROM listings WHERE scope = ? AND listing_key = ?",
            params![target.scope.as_str(), key],
            |r| r.get(0),
        )?;
        if existing > 0 {
            return Ok(false);
        }

        conn.execute(
            r#"INSERT INTO listings
                   (scope, listing_key, external_id, watcher, url, title, price_czk, area_m2,
                    dispo, locality, price_per_m2, description, images, first_seen_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            params![
                target.scope.as_str(),
                key,
                record.id(),
                target.watcher,
                record.url,
                record.title,
                record.price_czk,
                record.area_m2,
                record.dispo,
                record.locality,
                record.price_per_m2,
                record.description,
                images,
                record.scraped_at,
            ],
        )
        .with_context(|| format!("insert listing {}", record.identity))?;
        Ok(true)
    }

    pub fn listing_count(&self) -> Result<i64> {
        let conn = self.conn();
        let mut s = conn.prepare("SELECT COUNT(*) FROM listings")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn counts_by_watcher(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT watcher, COUNT(*) FROM listings GROUP BY watcher ORDER BY watcher",
        )?;
        let rows: Vec<(String, i64)> = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn recent_listings(&self, limit: usize) -> Result<Vec<StoredListing>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"SELECT scope, watcher, external_id, url, title, price_czk, first_seen_at
               FROM listings
               ORDER BY first_seen_at DESC, listing_key
               LIMIT ?"#,
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |r| {
                Ok(StoredListing {
                    scope: r.get(0)?,
                    watcher: r.get(1)?,
                    external_id: r.get(2)?,
                    url: r.get(3)?,
                    title: r.get(4)?,
                    price_czk: r.get(5)?,
                    first_seen_at: r.get(6)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // ── Cycle log ─────────────────────────────────────────────────────────────

    pub fn record_cycle(&self, target: &DeliveryTarget, summary: &CycleSummary) -> Result<()> {
        self.conn().execute(
            r#"INSERT INTO cycle_runs
                   (scope, watcher, finished_at, total_found, emitted, skipped, deferred,
                    delivery_failures, seen_size)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            params![
                target.scope.as_str(),
                target.watcher,
                Utc::now().naive_utc(),
                summary.total_found as i64,
                summary.emitted as i64,
                summary.skipped as i64,
                summary.deferred as i64,
                summary.delivery_failures as i64,
                summary.seen_size as i64,
            ],
        )?;
        Ok(())
    }

    pub fn cycle_run_count(&self) -> Result<i64> {
        let conn = self.conn();
        let mut s = conn.prepare("SELECT COUNT(*) FROM cycle_runs")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }
}

#[async_trait]
impl Delivery for Repository {
    async fn deliver(
        &self,
        target: &DeliveryTarget,
        record: &ListingRecord,
    ) -> Result<(), WatchError> {
        let inserted = self
            .insert_listing(target, record)
            .map_err(|e| WatchError::Delivery(format!("{:#}", e)))?;
        if !inserted {
            debug!("[{}] {} already stored", target.watcher, record.identity);
        }
        Ok(())
    }

    async fn deliver_summary(
        &self,
        target: &DeliveryTarget,
        summary: &CycleSummary,
    ) -> Result<(), WatchError> {
        self.record_cycle(target, summary)
            .map_err(|e| WatchError::Delivery(format!("{:#}", e)))
    }
}
