// src/store/catalog.rs

use super::{Store, now_unix};
use crate::error::{StoreError, StoreResult};
use crate::models::{CanonicalProduct, Unit};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, warn};

/// Sentinel category every unmatched product falls back to.
pub const OTHER_CATEGORY: &str = "OTHER";

/// Uniqueness key for canonical names: Unicode uppercase with whitespace collapsed.
pub fn name_key(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

fn category_id(conn: &Connection, name: &str) -> StoreResult<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT id FROM categories WHERE name = ?1",
            params![name.trim().to_uppercase()],
            |row| row.get(0),
        )
        .optional()?)
}

fn product_id_by_key(conn: &Connection, key: &str) -> StoreResult<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT id FROM products WHERE name_key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

/// Find the catalog entry for `canonical_name`, creating it when absent.
///
/// Safe under concurrent callers on separate connections: the insert is
/// conditional on the unique `name_key`, and a loser of the race reads the
/// winner's row instead of failing.
pub(crate) fn resolve_or_create(
    conn: &Connection,
    canonical_name: &str,
    category: &str,
    unit: Unit,
) -> StoreResult<i64> {
    let key = name_key(canonical_name);
    if key.is_empty() {
        return Err(StoreError::InvalidProductName(canonical_name.to_string()));
    }

    if let Some(id) = product_id_by_key(conn, &key)? {
        return Ok(id);
    }

    let category_id = match category_id(conn, category)? {
        Some(id) => id,
        None => {
            warn!(category = %category, product = %key, "Unknown category, using {OTHER_CATEGORY}");
            category_id(conn, OTHER_CATEGORY)?
                .ok_or_else(|| StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows))?
        }
    };

    let inserted = conn.execute(
        "INSERT INTO products (canonical_name, name_key, category_id, unit, active, created_at)
         VALUES (?1, ?2, ?3, ?4, 1, ?5)
         ON CONFLICT(name_key) DO NOTHING",
        params![key, key, category_id, unit.as_str(), now_unix()],
    )?;

    if inserted == 1 {
        let id = conn.last_insert_rowid();
        info!(product_id = id, product = %key, "Catalog entry created");
        return Ok(id);
    }

    debug!(product = %key, "Catalog conflict, reading concurrent insert");
    product_id_by_key(conn, &key)?
        .ok_or_else(|| StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
}

/// Move a catalog entry out of the fallback category. Entries already categorized are left alone.
pub(crate) fn recategorize_fallback_product(
    conn: &Connection,
    canonical_name: &str,
    category: &str,
) -> StoreResult<bool> {
    let Some(category_id) = category_id(conn, category)? else {
        warn!(category = %category, "Unknown category, product left as {OTHER_CATEGORY}");
        return Ok(false);
    };
    let changed = conn.execute(
        "UPDATE products SET category_id = ?1
         WHERE name_key = ?2
           AND category_id = (SELECT id FROM categories WHERE name = ?3)",
        params![category_id, name_key(canonical_name), OTHER_CATEGORY],
    )?;
    if changed > 0 {
        info!(product = %name_key(canonical_name), category = %category, "Catalog entry recategorized");
    }
    Ok(changed > 0)
}

pub(crate) fn product(conn: &Connection, id: i64) -> StoreResult<Option<CanonicalProduct>> {
    Ok(conn
        .query_row(
            "SELECT p.id, p.canonical_name, c.name, p.unit, p.active
             FROM products p JOIN categories c ON c.id = p.category_id
             WHERE p.id = ?1",
            params![id],
            row_to_product,
        )
        .optional()?)
}

fn row_to_product(row: &rusqlite::Row<'_>) -> rusqlite::Result<CanonicalProduct> {
    let unit: String = row.get(3)?;
    Ok(CanonicalProduct {
        id: row.get(0)?,
        canonical_name: row.get(1)?,
        category: row.get(2)?,
        unit: Unit::parse(&unit).unwrap_or(Unit::Each),
        active: row.get(4)?,
    })
}

impl Store {
    pub fn resolve_or_create(
        &self,
        canonical_name: &str,
        category: &str,
        unit: Unit,
    ) -> StoreResult<i64> {
        resolve_or_create(self.conn(), canonical_name, category, unit)
    }

    pub fn product(&self, id: i64) -> StoreResult<Option<CanonicalProduct>> {
        product(self.conn(), id)
    }

    /// Case-insensitive exact lookup by canonical name.
    pub fn find_product_by_name(&self, name: &str) -> StoreResult<Option<CanonicalProduct>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT p.id, p.canonical_name, c.name, p.unit, p.active
                 FROM products p JOIN categories c ON c.id = p.category_id
                 WHERE p.name_key = ?1",
                params![name_key(name)],
                row_to_product,
            )
            .optional()?)
    }

    /// Retire a catalog entry. Receipts still referencing it fail that item on merge.
    pub fn deactivate_product(&self, id: i64) -> StoreResult<bool> {
        let changed = self
            .conn()
            .execute("UPDATE products SET active = 0 WHERE id = ?1", params![id])?;
        if changed > 0 {
            info!(product_id = id, "Catalog entry deactivated");
        }
        Ok(changed > 0)
    }

    pub fn product_count(&self) -> StoreResult<usize> {
        Ok(self
            .conn()
            .query_row("SELECT COUNT(*) FROM products", [], |row| row.get(0))?)
    }
}
