use bigdecimal::BigDecimal;
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::str::FromStr;
use time::OffsetDateTime;
use tracing::info;

use crate::error::StoreError;
use crate::model::{Currency, DiscountType, InvoiceStatus, InvoiceSummary};
use crate::serialization::{InvoiceRecord, ItemRecord, format_timestamp};

pub struct InvoiceStore {
    conn: Connection,
}

/// What gets appended to the version history alongside a write.
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub source_prompt: String,
    pub snapshot: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VersionRecord {
    pub invoice_id: String,
    pub version: u32,
    pub source_prompt: String,
    pub snapshot: Value,
    /// Hex SHA-256 of the stored snapshot JSON
    pub digest: String,
    pub created_at: OffsetDateTime,
}

const INVOICE_COLUMNS: &str = "id, owner_id, title, status, prompt, source_text, invoice_number, currency,
     issue_date, due_date, from_name, from_email, from_address,
     bill_to_name, bill_to_email, bill_to_address, notes, subtotal,
     discount_type, discount_rate, discount_amount, tax_rate, tax_amount, total,
     raw_json, created_at, updated_at";

impl InvoiceStore {
    /// Open (or create) the invoice database at `db_path`
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    /// Create missing tables and migrate older layouts on an open connection.
    pub fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS invoices (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                title TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'DRAFT',
                prompt TEXT,
                source_text TEXT,
                invoice_number TEXT NOT NULL,
                currency TEXT NOT NULL DEFAULT 'USD',
                issue_date TEXT NOT NULL,
                due_date TEXT NOT NULL,
                from_name TEXT NOT NULL,
                from_email TEXT NOT NULL,
                from_address TEXT NOT NULL,
                bill_to_name TEXT NOT NULL,
                bill_to_email TEXT NOT NULL,
                bill_to_address TEXT NOT NULL,
                notes TEXT,
                subtotal TEXT NOT NULL,
                discount_type TEXT,
                discount_rate TEXT,
                discount_amount TEXT,
                tax_rate TEXT NOT NULL,
                tax_amount TEXT NOT NULL,
                total TEXT NOT NULL,
                raw_json TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS invoice_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                invoice_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                quantity INTEGER NOT NULL,
                unit_price TEXT NOT NULL,
                line_total TEXT NOT NULL,
                FOREIGN KEY (invoice_id) REFERENCES invoices(id) ON DELETE CASCADE
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS invoice_versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                invoice_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                source_prompt TEXT NOT NULL,
                snapshot TEXT NOT NULL,
                snapshot_digest TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (invoice_id, version),
                FOREIGN KEY (invoice_id) REFERENCES invoices(id) ON DELETE CASCADE
            )",
            [],
        )?;

        // Migrate: databases written before discounts existed lack these columns
        let has_discount: bool = conn
            .prepare("SELECT discount_type FROM invoices LIMIT 0")
            .is_ok();
        if !has_discount {
            conn.execute_batch(
                "ALTER TABLE invoices ADD COLUMN discount_type TEXT;
                 ALTER TABLE invoices ADD COLUMN discount_rate TEXT;
                 ALTER TABLE invoices ADD COLUMN discount_amount TEXT;",
            )?;
            info!("Migrated invoices table: added discount_type, discount_rate, discount_amount");
        }

        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_invoices_number ON invoices(invoice_number)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_invoices_owner ON invoices(owner_id)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_items_invoice ON invoice_items(invoice_id)",
            [],
        )?;

        info!("Invoice database initialized");
        Ok(Self { conn })
    }

    /// Derive an invoice id from its owner, invoice number and creation instant
    pub fn generate_id(owner_id: &str, invoice_number: &str, created_at: OffsetDateTime) -> String {
        let mut hasher = Sha256::new();
        hasher.update(owner_id.as_bytes());
        hasher.update(invoice_number.as_bytes());
        hasher.update(created_at.unix_timestamp_nanos().to_be_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Owner-scoped lookup; another owner's invoice is indistinguishable from a missing one.
    pub fn find_invoice(&self, id: &str, owner_id: &str) -> Result<Option<InvoiceRecord>, StoreError> {
        let sql = format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = ?1 AND owner_id = ?2");
        let record = self
            .conn
            .query_row(&sql, params![id, owner_id], row_to_record)
            .optional()?;

        match record {
            Some(mut record) => {
                record.items = load_items(&self.conn, &record.id)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Insert a new invoice with its items and version 1, atomically.
    pub fn create_invoice_with_version(
        &mut self,
        record: &InvoiceRecord,
        version: &NewVersion,
    ) -> Result<u32, StoreError> {
        let tx = self.conn.transaction()?;

        let raw_json = record.raw_json.as_ref().map(Value::to_string);
        tx.execute(
            &format!(
                "INSERT INTO invoices ({INVOICE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                         ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27)"
            ),
            params![
                record.id,
                record.owner_id,
                record.title,
                record.status.as_str(),
                record.prompt,
                record.source_text,
                record.invoice_number,
                record.currency,
                record.issue_date,
                record.due_date,
                record.from_name,
                record.from_email,
                record.from_address,
                record.bill_to_name,
                record.bill_to_email,
                record.bill_to_address,
                record.notes,
                record.subtotal.to_string(),
                record.discount_type.map(|t| t.as_str()),
                record.discount_rate.as_ref().map(BigDecimal::to_string),
                record.discount_amount.as_ref().map(BigDecimal::to_string),
                record.tax_rate.to_string(),
                record.tax_amount.to_string(),
                record.total.to_string(),
                raw_json,
                record.created_at,
                record.updated_at,
            ],
        )
        .map_err(classify)?;

        insert_items(&tx, &record.id, &record.items)?;
        insert_version(&tx, &record.id, 1, version, record.updated_at)?;
        tx.commit()?;

        info!(invoice_id = %record.id, invoice_number = %record.invoice_number, "Invoice created");
        Ok(1)
    }

    /// Overwrite the current invoice state, replace its items and append the
    /// next version number, all in one transaction. Returns the new version.
    pub fn update_invoice_with_new_version(
        &mut self,
        record: &InvoiceRecord,
        version: &NewVersion,
    ) -> Result<u32, StoreError> {
        let tx = self.conn.transaction()?;

        let raw_json = record.raw_json.as_ref().map(Value::to_string);
        let changed = tx
            .execute(
                "UPDATE invoices SET
                    title = ?3, status = ?4, prompt = ?5, source_text = ?6,
                    invoice_number = ?7, currency = ?8, issue_date = ?9, due_date = ?10,
                    from_name = ?11, from_email = ?12, from_address = ?13,
                    bill_to_name = ?14, bill_to_email = ?15, bill_to_address = ?16,
                    notes = ?17, subtotal = ?18, discount_type = ?19, discount_rate = ?20,
                    discount_amount = ?21, tax_rate = ?22, tax_amount = ?23, total = ?24,
                    raw_json = ?25, updated_at = ?26
                 WHERE id = ?1 AND owner_id = ?2",
                params![
                    record.id,
                    record.owner_id,
                    record.title,
                    record.status.as_str(),
                    record.prompt,
                    record.source_text,
                    record.invoice_number,
                    record.currency,
                    record.issue_date,
                    record.due_date,
                    record.from_name,
                    record.from_email,
                    record.from_address,
                    record.bill_to_name,
                    record.bill_to_email,
                    record.bill_to_address,
                    record.notes,
                    record.subtotal.to_string(),
                    record.discount_type.map(|t| t.as_str()),
                    record.discount_rate.as_ref().map(BigDecimal::to_string),
                    record.discount_amount.as_ref().map(BigDecimal::to_string),
                    record.tax_rate.to_string(),
                    record.tax_amount.to_string(),
                    record.total.to_string(),
                    raw_json,
                    record.updated_at,
                ],
            )
            .map_err(classify)?;
        if changed == 0 {
            return Err(StoreError::NotFound(record.id.clone()));
        }

        tx.execute(
            "DELETE FROM invoice_items WHERE invoice_id = ?1",
            params![record.id],
        )?;
        insert_items(&tx, &record.id, &record.items)?;

        let latest: u32 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM invoice_versions WHERE invoice_id = ?1",
            params![record.id],
            |row| row.get(0),
        )?;
        let next = latest + 1;
        insert_version(&tx, &record.id, next, version, record.updated_at)?;
        tx.commit()?;

        info!(invoice_id = %record.id, version = next, "Invoice version stored");
        Ok(next)
    }

    /// Latest stored version number, 0 when the invoice has no history.
    pub fn latest_version(&self, invoice_id: &str) -> Result<u32, StoreError> {
        Ok(self.conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM invoice_versions WHERE invoice_id = ?1",
            params![invoice_id],
            |row| row.get(0),
        )?)
    }

    /// Summaries of every invoice the owner has, most recently updated first
    pub fn list_invoices(&self, owner_id: &str) -> Result<Vec<InvoiceSummary>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, bill_to_name, status, invoice_number, currency, total, created_at, updated_at
             FROM invoices
             WHERE owner_id = ?1
             ORDER BY updated_at DESC",
        )?;

        let summaries = stmt.query_map(params![owner_id], |row| {
            let status: String = row.get(3)?;
            let currency: String = row.get(5)?;
            let total = decimal_column(row, 6)?;
            Ok(InvoiceSummary {
                id: row.get(0)?,
                title: row.get(1)?,
                client_name: row.get(2)?,
                status: InvoiceStatus::from_code(&status).unwrap_or_default(),
                invoice_number: row.get(4)?,
                currency: Currency::from_code(&currency).unwrap_or_default(),
                total: total.to_string().parse().unwrap_or(0.0),
                created_at: timestamp_column(row, 7)?,
                updated_at: timestamp_column(row, 8)?,
            })
        })?;

        Ok(summaries.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Full version history of an invoice, oldest first.
    pub fn list_versions(&self, invoice_id: &str) -> Result<Vec<VersionRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT invoice_id, version, source_prompt, snapshot, snapshot_digest, created_at
             FROM invoice_versions
             WHERE invoice_id = ?1
             ORDER BY version",
        )?;

        let versions = stmt.query_map(params![invoice_id], |row| {
            let snapshot: String = row.get(3)?;
            Ok(VersionRecord {
                invoice_id: row.get(0)?,
                version: row.get(1)?,
                source_prompt: row.get(2)?,
                snapshot: serde_json::from_str(&snapshot).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e))
                })?,
                digest: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;

        Ok(versions.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn set_status(
        &self,
        invoice_id: &str,
        owner_id: &str,
        status: InvoiceStatus,
    ) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE invoices SET status = ?1 WHERE id = ?2 AND owner_id = ?3",
            params![status.as_str(), invoice_id, owner_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(invoice_id.to_string()));
        }
        info!(invoice_id = %invoice_id, status = status.as_str(), "Invoice status updated");
        Ok(())
    }
}

/// Constraint violations become `Conflict`; everything else stays a database error.
fn classify(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            StoreError::Conflict(message.clone().unwrap_or_else(|| failure.to_string()))
        }
        _ => StoreError::Sqlite(err),
    }
}

fn snapshot_digest(snapshot: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(snapshot.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn insert_items(conn: &Connection, invoice_id: &str, items: &[ItemRecord]) -> Result<(), StoreError> {
    let mut stmt = conn.prepare(
        "INSERT INTO invoice_items
            (invoice_id, position, name, description, quantity, unit_price, line_total)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for (position, item) in items.iter().enumerate() {
        stmt.execute(params![
            invoice_id,
            position as i64,
            item.name,
            item.description,
            item.quantity,
            item.unit_price.to_string(),
            item.line_total.to_string(),
        ])?;
    }
    Ok(())
}

fn insert_version(
    conn: &Connection,
    invoice_id: &str,
    version: u32,
    meta: &NewVersion,
    created_at: OffsetDateTime,
) -> Result<(), StoreError> {
    let snapshot = meta.snapshot.to_string();
    conn.execute(
        "INSERT INTO invoice_versions
            (invoice_id, version, source_prompt, snapshot, snapshot_digest, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            invoice_id,
            version,
            meta.source_prompt,
            snapshot,
            snapshot_digest(&snapshot),
            created_at,
        ],
    )
    .map_err(classify)?;
    Ok(())
}

fn load_items(conn: &Connection, invoice_id: &str) -> Result<Vec<ItemRecord>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT name, description, quantity, unit_price, line_total
         FROM invoice_items
         WHERE invoice_id = ?1
         ORDER BY position",
    )?;
    let items = stmt.query_map(params![invoice_id], |row| {
        Ok(ItemRecord {
            name: row.get(0)?,
            description: row.get(1)?,
            quantity: row.get(2)?,
            unit_price: decimal_column(row, 3)?,
            line_total: decimal_column(row, 4)?,
        })
    })?;
    Ok(items.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn decimal_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<BigDecimal> {
    let text: String = row.get(idx)?;
    BigDecimal::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn optional_decimal_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<BigDecimal>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        BigDecimal::from_str(&t)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<String> {
    let value: OffsetDateTime = row.get(idx)?;
    format_timestamp(value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Map the `INVOICE_COLUMNS` projection; items are loaded separately.
fn row_to_record(row: &Row<'_>) -> rusqlite::Result<InvoiceRecord> {
    let status: String = row.get(3)?;
    let discount_type: Option<String> = row.get(18)?;
    let raw_json: Option<String> = row.get(24)?;
    Ok(InvoiceRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        title: row.get(2)?,
        status: InvoiceStatus::from_code(&status).unwrap_or_default(),
        prompt: row.get(4)?,
        source_text: row.get(5)?,
        invoice_number: row.get(6)?,
        currency: row.get(7)?,
        issue_date: row.get(8)?,
        due_date: row.get(9)?,
        from_name: row.get(10)?,
        from_email: row.get(11)?,
        from_address: row.get(12)?,
        bill_to_name: row.get(13)?,
        bill_to_email: row.get(14)?,
        bill_to_address: row.get(15)?,
        notes: row.get(16)?,
        subtotal: decimal_column(row, 17)?,
        discount_type: discount_type.as_deref().and_then(DiscountType::from_code),
        discount_rate: optional_decimal_column(row, 19)?,
        discount_amount: optional_decimal_column(row, 20)?,
        tax_rate: decimal_column(row, 21)?,
        tax_amount: decimal_column(row, 22)?,
        total: decimal_column(row, 23)?,
        // An unreadable blob only loses legacy discount recovery
        raw_json: raw_json.and_then(|text| serde_json::from_str(&text).ok()),
        items: Vec::new(),
        created_at: row.get(25)?,
        updated_at: row.get(26)?,
    })
}
