use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;

use crate::error::StoreError;
use crate::model::*;

pub fn connect(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS marketplaces (
            id         INTEGER PRIMARY KEY,
            name       TEXT NOT NULL,
            base_url   TEXT NOT NULL,
            active     BOOLEAN NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS products (
            id         INTEGER PRIMARY KEY,
            name       TEXT NOT NULL,
            sku        TEXT UNIQUE NOT NULL,
            min_price  TEXT NOT NULL CHECK(CAST(min_price AS REAL) > 0),
            active     BOOLEAN NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS listings (
            id             INTEGER PRIMARY KEY,
            url            TEXT NOT NULL,
            code           TEXT,
            product_id     INTEGER NOT NULL REFERENCES products(id),
            marketplace_id INTEGER NOT NULL REFERENCES marketplaces(id),
            client_id      INTEGER,
            detected_price TEXT NOT NULL,
            min_price      TEXT NOT NULL,
            status         TEXT NOT NULL CHECK(status IN ('compliant','below-minimum')),
            origin         TEXT NOT NULL CHECK(origin IN ('complaint-converted','manual')),
            updated_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_listings_code ON listings(code);

        CREATE TABLE IF NOT EXISTS complaints (
            id             INTEGER PRIMARY KEY,
            client_id      INTEGER NOT NULL,
            product_id     INTEGER NOT NULL REFERENCES products(id),
            marketplace_id INTEGER NOT NULL REFERENCES marketplaces(id),
            url            TEXT NOT NULL,
            reported_price TEXT NOT NULL,
            notes          TEXT,
            status         TEXT NOT NULL DEFAULT 'requested'
                           CHECK(status IN ('requested','in-progress','resolved')),
            admin_comment  TEXT,
            created_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_complaints_url ON complaints(url);
        ",
    )
}

/// Shared handle over a single connection. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = connect(path)?;
        init_schema(&conn)?;
        Ok(Self::from_connection(conn))
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        init_schema(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&conn)?)
    }
}

// ── Column helpers ──

fn decimal_at(row: &Row, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parsed_at<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

// ── Marketplaces ──

pub fn insert_marketplace(conn: &Connection, name: &str, base_url: &str) -> rusqlite::Result<Id> {
    conn.execute(
        "INSERT INTO marketplaces (name, base_url) VALUES (?1, ?2)",
        params![name, base_url],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn set_marketplace_active(conn: &Connection, id: Id, active: bool) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "UPDATE marketplaces SET active = ?2 WHERE id = ?1",
        params![id, active],
    )?;
    Ok(n > 0)
}

pub fn list_marketplaces(conn: &Connection, active_only: bool) -> rusqlite::Result<Vec<Marketplace>> {
    let sql = if active_only {
        "SELECT id, name, base_url, active FROM marketplaces WHERE active = 1 ORDER BY id"
    } else {
        "SELECT id, name, base_url, active FROM marketplaces ORDER BY id"
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(Marketplace {
                id: row.get(0)?,
                name: row.get(1)?,
                base_url: row.get(2)?,
                active: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_marketplace(conn: &Connection, id: Id) -> rusqlite::Result<Option<Marketplace>> {
    conn.query_row(
        "SELECT id, name, base_url, active FROM marketplaces WHERE id = ?1",
        params![id],
        |row| {
            Ok(Marketplace {
                id: row.get(0)?,
                name: row.get(1)?,
                base_url: row.get(2)?,
                active: row.get(3)?,
            })
        },
    )
    .optional()
}

// ── Products ──

fn product_from_row(row: &Row) -> rusqlite::Result<Product> {
    Ok(Product {
        id: row.get(0)?,
        name: row.get(1)?,
        sku: row.get(2)?,
        min_price: decimal_at(row, 3)?,
        active: row.get(4)?,
    })
}

pub fn insert_product(
    conn: &Connection,
    name: &str,
    sku: &str,
    min_price: Decimal,
) -> rusqlite::Result<Id> {
    conn.execute(
        "INSERT INTO products (name, sku, min_price) VALUES (?1, ?2, ?3)",
        params![name, sku, min_price.to_string()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn list_products(conn: &Connection, active_only: bool) -> rusqlite::Result<Vec<Product>> {
    let sql = if active_only {
        "SELECT id, name, sku, min_price, active FROM products WHERE active = 1 ORDER BY id"
    } else {
        "SELECT id, name, sku, min_price, active FROM products ORDER BY id"
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([], product_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_product(conn: &Connection, id: Id) -> rusqlite::Result<Option<Product>> {
    conn.query_row(
        "SELECT id, name, sku, min_price, active FROM products WHERE id = ?1",
        params![id],
        product_from_row,
    )
    .optional()
}

// ── Listings ──

const LISTING_COLUMNS: &str = "id, url, code, product_id, marketplace_id, client_id,
     detected_price, min_price, status, origin, updated_at";

fn listing_from_row(row: &Row) -> rusqlite::Result<MonitoredListing> {
    Ok(MonitoredListing {
        id: row.get(0)?,
        url: row.get(1)?,
        code: row.get(2)?,
        product_id: row.get(3)?,
        marketplace_id: row.get(4)?,
        client_id: row.get(5)?,
        detected_price: decimal_at(row, 6)?,
        min_price: decimal_at(row, 7)?,
        status: parsed_at(row, 8)?,
        origin: parsed_at(row, 9)?,
        updated_at: row.get(10)?,
    })
}

pub fn insert_listing(conn: &Connection, listing: &NewListing, now: DateTime<Utc>) -> rusqlite::Result<Id> {
    conn.execute(
        "INSERT INTO listings (url, code, product_id, marketplace_id, client_id,
             detected_price, min_price, status, origin, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            listing.url,
            listing.code,
            listing.product_id,
            listing.marketplace_id,
            listing.client_id,
            listing.detected_price.to_string(),
            listing.min_price.to_string(),
            listing.status.as_str(),
            listing.origin.as_str(),
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Write a new price together with the status derived from it.
pub fn update_listing_price(
    conn: &Connection,
    id: Id,
    price: Decimal,
    status: ComplianceStatus,
    now: DateTime<Utc>,
) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "UPDATE listings SET detected_price = ?2, status = ?3, updated_at = ?4 WHERE id = ?1",
        params![id, price.to_string(), status.as_str(), now],
    )?;
    Ok(n > 0)
}

pub fn get_listing(conn: &Connection, id: Id) -> rusqlite::Result<Option<MonitoredListing>> {
    let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = ?1");
    conn.query_row(&sql, params![id], listing_from_row).optional()
}

pub fn find_listings_by_code(conn: &Connection, code: &str) -> rusqlite::Result<Vec<MonitoredListing>> {
    let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE code = ?1 ORDER BY id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![code], listing_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_listings(
    conn: &Connection,
    status: Option<ComplianceStatus>,
    limit: Option<usize>,
) -> rusqlite::Result<Vec<MonitoredListing>> {
    let mut sql = format!("SELECT {LISTING_COLUMNS} FROM listings");
    if status.is_some() {
        sql.push_str(" WHERE status = ?1");
    }
    sql.push_str(" ORDER BY id");
    if let Some(n) = limit {
        sql.push_str(&format!(" LIMIT {}", n));
    }
    let mut stmt = conn.prepare(&sql)?;
    let rows = match status {
        Some(s) => stmt.query_map(params![s.as_str()], listing_from_row)?,
        None => stmt.query_map([], listing_from_row)?,
    }
    .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn listing_code_exists(conn: &Connection, code: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM listings WHERE code = ?1)",
        params![code],
        |row| row.get(0),
    )
}

// ── Complaints ──

const COMPLAINT_COLUMNS: &str = "id, client_id, product_id, marketplace_id, url,
     reported_price, notes, status, admin_comment, created_at";

fn complaint_from_row(row: &Row) -> rusqlite::Result<Complaint> {
    Ok(Complaint {
        id: row.get(0)?,
        client_id: row.get(1)?,
        product_id: row.get(2)?,
        marketplace_id: row.get(3)?,
        url: row.get(4)?,
        reported_price: decimal_at(row, 5)?,
        notes: row.get(6)?,
        status: parsed_at(row, 7)?,
        admin_comment: row.get(8)?,
        created_at: row.get(9)?,
    })
}

pub fn insert_complaint(
    conn: &Connection,
    complaint: &NewComplaint,
    now: DateTime<Utc>,
) -> rusqlite::Result<Id> {
    conn.execute(
        "INSERT INTO complaints (client_id, product_id, marketplace_id, url,
             reported_price, notes, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            complaint.client_id,
            complaint.product_id,
            complaint.marketplace_id,
            complaint.url,
            complaint.reported_price.to_string(),
            complaint.notes,
            ComplaintStatus::Requested.as_str(),
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_complaint(conn: &Connection, id: Id) -> rusqlite::Result<Option<Complaint>> {
    let sql = format!("SELECT {COMPLAINT_COLUMNS} FROM complaints WHERE id = ?1");
    conn.query_row(&sql, params![id], complaint_from_row).optional()
}

pub fn list_complaints(conn: &Connection, open_only: bool) -> rusqlite::Result<Vec<Complaint>> {
    let sql = if open_only {
        format!(
            "SELECT {COMPLAINT_COLUMNS} FROM complaints
             WHERE status IN ('requested','in-progress') ORDER BY id"
        )
    } else {
        format!("SELECT {COMPLAINT_COLUMNS} FROM complaints ORDER BY id")
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], complaint_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Admin mutation. A `None` comment leaves the stored comment untouched.
pub fn update_complaint(
    conn: &Connection,
    id: Id,
    status: ComplaintStatus,
    comment: Option<&str>,
) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "UPDATE complaints SET status = ?2, admin_comment = COALESCE(?3, admin_comment)
         WHERE id = ?1",
        params![id, status.as_str(), comment],
    )?;
    Ok(n > 0)
}

/// Whether a complaint for exactly this URL exists, optionally restricted
/// to open lifecycle states.
pub fn complaint_url_exists(conn: &Connection, url: &str, open_only: bool) -> rusqlite::Result<bool> {
    let sql = if open_only {
        "SELECT EXISTS(SELECT 1 FROM complaints
             WHERE url = ?1 AND status IN ('requested','in-progress'))"
    } else {
        "SELECT EXISTS(SELECT 1 FROM complaints WHERE url = ?1)"
    };
    conn.query_row(sql, params![url], |row| row.get(0))
}

// ── Stats ──

pub struct Stats {
    pub marketplaces: i64,
    pub products: i64,
    pub listings: i64,
    pub below_minimum: i64,
    pub open_complaints: i64,
    pub complaints: i64,
}

pub fn get_stats(conn: &Connection) -> rusqlite::Result<Stats> {
    let count = |sql: &str| -> rusqlite::Result<i64> { conn.query_row(sql, [], |r| r.get(0)) };
    Ok(Stats {
        marketplaces: count("SELECT COUNT(*) FROM marketplaces WHERE active = 1")?,
        products: count("SELECT COUNT(*) FROM products WHERE active = 1")?,
        listings: count("SELECT COUNT(*) FROM listings")?,
        below_minimum: count("SELECT COUNT(*) FROM listings WHERE status = 'below-minimum'")?,
        open_complaints: count(
            "SELECT COUNT(*) FROM complaints WHERE status IN ('requested','in-progress')",
        )?,
        complaints: count("SELECT COUNT(*) FROM complaints")?,
    })
}
