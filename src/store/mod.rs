// src/store/mod.rs

mod catalog;
mod inventory;
mod receipts;

pub use catalog::{OTHER_CATEGORY, name_key};

use crate::error::{StoreError, StoreResult};
use crate::normalizer::rules::CATEGORIES;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info};

/// SQLite-backed persistence for receipts, the shared product catalog,
/// per-user inventory and price history.
///
/// Each unit of work opens its own `Store`; concurrent writers on the same
/// file serialise on SQLite's write lock (see `BUSY_TIMEOUT`).
pub struct Store {
    conn: Connection,
}

/// A cached description normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedNormalization {
    pub canonical_name: String,
    pub category: String,
    /// Recorded by the degraded fallback; the category may still be settled later.
    pub provisional: bool,
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

impl Store {
    pub fn open<P: AsRef<Path>>(db_path: P) -> StoreResult<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(journal_mode = %mode, "Opened database");
        Self::init(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS receipts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                document_ref TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                awaiting_confirmation INTEGER NOT NULL DEFAULT 0,
                payload TEXT,
                purchase_key TEXT,
                establishment_name TEXT,
                establishment_tax_id TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                error_reason TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS products (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                canonical_name TEXT NOT NULL,
                name_key TEXT NOT NULL UNIQUE,
                category_id INTEGER NOT NULL REFERENCES categories(id),
                unit TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS receipt_items (
                receipt_id INTEGER NOT NULL REFERENCES receipts(id) ON DELETE CASCADE,
                line_index INTEGER NOT NULL,
                raw_description TEXT NOT NULL,
                canonical_name TEXT NOT NULL,
                category TEXT NOT NULL,
                unit TEXT NOT NULL,
                quantity REAL NOT NULL,
                unit_price REAL NOT NULL,
                total_price REAL NOT NULL,
                product_id INTEGER NOT NULL REFERENCES products(id),
                failure_reason TEXT,
                PRIMARY KEY (receipt_id, line_index)
            );

            CREATE TABLE IF NOT EXISTS inventory (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                product_id INTEGER REFERENCES products(id),
                product_name TEXT NOT NULL,
                quantity REAL NOT NULL DEFAULT 0,
                unit_price REAL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS price_observations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                product_id INTEGER NOT NULL REFERENCES products(id),
                receipt_id INTEGER REFERENCES receipts(id) ON DELETE SET NULL,
                establishment_name TEXT,
                establishment_tax_id TEXT,
                unit_price REAL NOT NULL,
                observed_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS merge_applications (
                receipt_id INTEGER NOT NULL REFERENCES receipts(id) ON DELETE CASCADE,
                line_index INTEGER NOT NULL,
                applied_at INTEGER NOT NULL,
                PRIMARY KEY (receipt_id, line_index)
            );

            CREATE TABLE IF NOT EXISTS normalization_cache (
                description_key TEXT PRIMARY KEY,
                canonical_name TEXT NOT NULL,
                category TEXT NOT NULL,
                provisional INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_receipts_user ON receipts(user_id);
            CREATE INDEX IF NOT EXISTS idx_receipts_status ON receipts(status, updated_at);
            CREATE INDEX IF NOT EXISTS idx_receipts_purchase ON receipts(user_id, purchase_key);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_inventory_user_product
                ON inventory(user_id, product_id);
            CREATE INDEX IF NOT EXISTS idx_inventory_user ON inventory(user_id);
            CREATE INDEX IF NOT EXISTS idx_price_observations_product
                ON price_observations(product_id, observed_at);",
        )?;

        for name in CATEGORIES.iter().chain(std::iter::once(&OTHER_CATEGORY)) {
            conn.execute(
                "INSERT OR IGNORE INTO categories (name) VALUES (?1)",
                params![name],
            )?;
        }

        info!("Database initialized successfully");
        Ok(Self { conn })
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Look up a previously cached normalization for a description key.
    pub fn cached_normalization(&self, description_key: &str) -> StoreResult<Option<CachedNormalization>> {
        Ok(self
            .conn
            .query_row(
                "SELECT canonical_name, category, provisional
                 FROM normalization_cache WHERE description_key = ?1",
                params![description_key],
                |row| {
                    Ok(CachedNormalization {
                        canonical_name: row.get(0)?,
                        category: row.get(1)?,
                        provisional: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    /// First writer wins so repeated runs keep the same canonical name.
    ///
    /// Returns the entry actually stored, which is a concurrent writer's when it got there first.
    pub fn cache_normalization(
        &self,
        description_key: &str,
        canonical_name: &str,
        category: &str,
        provisional: bool,
    ) -> StoreResult<CachedNormalization> {
        self.conn.execute(
            "INSERT INTO normalization_cache
                (description_key, canonical_name, category, provisional, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(description_key) DO NOTHING",
            params![description_key, canonical_name, category, provisional, now_unix()],
        )?;
        self.cached_normalization(description_key)?
            .ok_or(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
    }

    /// Settle a provisional cache entry on `category`.
    ///
    /// The canonical name is kept, and the catalog entry it resolved to moves out of
    /// the fallback category. Returns `false` when the entry was no longer provisional.
    pub fn confirm_provisional_normalization(&self, description_key: &str, category: &str) -> StoreResult<bool> {
        let tx = rusqlite::Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let canonical_name: Option<String> = tx
            .query_row(
                "UPDATE normalization_cache SET category = ?1, provisional = 0
                 WHERE description_key = ?2 AND provisional = 1
                 RETURNING canonical_name",
                params![category, description_key],
                |row| row.get(0),
            )
            .optional()?;
        let Some(canonical_name) = canonical_name else {
            return Ok(false);
        };
        catalog::recategorize_fallback_product(&tx, &canonical_name, category)?;
        tx.commit()?;
        info!(description = %description_key, category = %category, "Provisional normalization confirmed");
        Ok(true)
    }

    /// Counts of receipts by status, for the CLI summary.
    pub fn receipt_counts(&self) -> StoreResult<Vec<(String, usize)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM receipts GROUP BY status ORDER BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}
