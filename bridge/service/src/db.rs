// Copyright (c) 2024 The Botho Foundation

//! SQLite database for bridge transfer tracking.

use chrono::{DateTime, TimeZone, Utc};
use hub_bridge_core::{BridgeError, LegState, TransferRecord, TransferStatus};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Result as SqliteResult, Row};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use uuid::Uuid;

const TRANSFER_COLUMNS: &str = r#"
    id, direction, asset, amount, fee, sender, recipient,
    source_tx_hash, source_confirmations, source_block_height, source_nonce, source_submitted_at,
    relay_tx_hash, relay_confirmations, relay_block_height, relay_nonce, relay_submitted_at,
    dest_tx_hash, dest_confirmations, dest_block_height, dest_nonce, dest_submitted_at,
    status, failure_reason, degraded, created_at, updated_at, last_progress_at
"#;

/// An audit log row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub action: String,
    pub details: String,
    pub created_at: DateTime<Utc>,
}

/// Database wrapper for thread-safe access.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database.
    pub fn open(path: &str) -> Result<Self, BridgeError> {
        let conn = Connection::open(path)
            .map_err(|e| BridgeError::Store(format!("Failed to open database: {}", e)))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| BridgeError::Store(format!("Failed to set busy timeout: {}", e)))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, BridgeError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            BridgeError::Store(format!("Failed to open in-memory database: {}", e))
        })?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, BridgeError> {
        self.conn
            .lock()
            .map_err(|e| BridgeError::Store(format!("Lock error: {}", e)))
    }

    /// Run database migrations.
    pub fn migrate(&self) -> Result<(), BridgeError> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS bridge_transfers (
                id TEXT PRIMARY KEY,
                direction TEXT NOT NULL,
                asset TEXT NOT NULL,
                amount TEXT NOT NULL,
                fee TEXT NOT NULL,
                sender TEXT NOT NULL,
                recipient TEXT NOT NULL,
                source_tx_hash TEXT,
                source_confirmations INTEGER NOT NULL DEFAULT 0,
                source_block_height INTEGER,
                source_nonce INTEGER,
                source_submitted_at INTEGER,
                relay_tx_hash TEXT,
                relay_confirmations INTEGER NOT NULL DEFAULT 0,
                relay_block_height INTEGER,
                relay_nonce INTEGER,
                relay_submitted_at INTEGER,
                dest_tx_hash TEXT,
                dest_confirmations INTEGER NOT NULL DEFAULT 0,
                dest_block_height INTEGER,
                dest_nonce INTEGER,
                dest_submitted_at INTEGER,
                status TEXT NOT NULL,
                failure_reason TEXT,
                degraded INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                last_progress_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_transfers_status ON bridge_transfers(status);
            CREATE INDEX IF NOT EXISTS idx_transfers_sender ON bridge_transfers(sender);
            CREATE INDEX IF NOT EXISTS idx_transfers_created ON bridge_transfers(created_at);

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                transfer_id TEXT REFERENCES bridge_transfers(id),
                action TEXT NOT NULL,
                details TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_transfer ON audit_log(transfer_id);
            CREATE INDEX IF NOT EXISTS idx_audit_created ON audit_log(created_at);
            "#,
        )
        .map_err(|e| BridgeError::Store(format!("Migration failed: {}", e)))?;

        Ok(())
    }

    /// Insert a new transfer.
    pub fn insert_transfer(&self, record: &TransferRecord) -> Result<(), BridgeError> {
        let conn = self.lock()?;

        let failure_reason = encode_failure_reason(record)?;
        conn.execute(
            &format!(
                "INSERT INTO bridge_transfers ({}) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7,
                    ?8, ?9, ?10, ?11, ?12,
                    ?13, ?14, ?15, ?16, ?17,
                    ?18, ?19, ?20, ?21, ?22,
                    ?23, ?24, ?25, ?26, ?27, ?28
                )",
                TRANSFER_COLUMNS
            ),
            params![
                record.id.to_string(),
                record.direction.to_string(),
                record.asset,
                record.amount.to_string(),
                record.fee.to_string(),
                record.sender,
                record.recipient,
                record.source.tx_hash,
                record.source.confirmations as i64,
                record.source.block_height.map(|h| h as i64),
                record.source.nonce.map(|n| n as i64),
                record.source.submitted_at.as_ref().map(to_nanos),
                record.relay.tx_hash,
                record.relay.confirmations as i64,
                record.relay.block_height.map(|h| h as i64),
                record.relay.nonce.map(|n| n as i64),
                record.relay.submitted_at.as_ref().map(to_nanos),
                record.dest.tx_hash,
                record.dest.confirmations as i64,
                record.dest.block_height.map(|h| h as i64),
                record.dest.nonce.map(|n| n as i64),
                record.dest.submitted_at.as_ref().map(to_nanos),
                record.status.to_string(),
                failure_reason,
                record.degraded,
                to_nanos(&record.created_at),
                to_nanos(&record.updated_at),
                to_nanos(&record.last_progress_at),
            ],
        )
        .map_err(|e| BridgeError::Store(format!("Insert failed: {}", e)))?;

        Ok(())
    }

    /// Get a transfer by ID.
    pub fn get_transfer(&self, id: &Uuid) -> Result<Option<TransferRecord>, BridgeError> {
        let conn = self.lock()?;
        select_transfer(&conn, id)
    }

    /// Get transfers by status, oldest first.
    pub fn get_transfers_by_status(
        &self,
        status: TransferStatus,
    ) -> Result<Vec<TransferRecord>, BridgeError> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM bridge_transfers WHERE status = ?1 ORDER BY created_at ASC",
                TRANSFER_COLUMNS
            ))
            .map_err(|e| BridgeError::Store(format!("Prepare failed: {}", e)))?;

        let transfers = stmt
            .query_map(params![status.to_string()], row_to_transfer)
            .map_err(|e| BridgeError::Store(format!("Query failed: {}", e)))?
            .collect::<SqliteResult<Vec<_>>>()
            .map_err(|e| BridgeError::Store(format!("Collect failed: {}", e)))?;

        Ok(transfers)
    }

    /// All transfers that have not reached a terminal status, oldest first.
    pub fn list_non_terminal(&self) -> Result<Vec<TransferRecord>, BridgeError> {
        let conn = self.lock()?;

        let statuses = TransferStatus::NON_TERMINAL
            .iter()
            .map(|s| format!("'{}'", s))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM bridge_transfers WHERE status IN ({}) ORDER BY created_at ASC",
                TRANSFER_COLUMNS, statuses
            ))
            .map_err(|e| BridgeError::Store(format!("Prepare failed: {}", e)))?;

        let transfers = stmt
            .query_map([], row_to_transfer)
            .map_err(|e| BridgeError::Store(format!("Query failed: {}", e)))?
            .collect::<SqliteResult<Vec<_>>>()
            .map_err(|e| BridgeError::Store(format!("Collect failed: {}", e)))?;

        Ok(transfers)
    }

    /// Read-modify-write a transfer under the monotonic rules.
    ///
    /// The mutator works on a copy of the stored record. Its result is
    /// reconciled against the stored record (max for confirmations, write-once
    /// hashes, forward-only status) before being written. If nothing changed
    /// the stored record is returned and no write happens.
    pub fn update_monotonic<F>(&self, id: &Uuid, mutator: F) -> Result<TransferRecord, BridgeError>
    where
        F: FnOnce(&mut TransferRecord) -> Result<(), BridgeError>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| BridgeError::Store(format!("Transaction failed: {}", e)))?;

        let current = select_transfer(&tx, id)?.ok_or(BridgeError::NotFound(*id))?;
        let mut proposed = current.clone();
        mutator(&mut proposed)?;

        let mut merged = current.reconcile(&proposed)?;
        if merged.same_state(&current) {
            return Ok(current);
        }
        merged.updated_at = Utc::now().max(current.updated_at);

        let failure_reason = encode_failure_reason(&merged)?;
        let changed = tx
            .execute(
                r#"
                UPDATE bridge_transfers SET
                    source_tx_hash = ?1, source_confirmations = ?2, source_block_height = ?3,
                    source_nonce = ?4, source_submitted_at = ?5,
                    relay_tx_hash = ?6, relay_confirmations = ?7, relay_block_height = ?8,
                    relay_nonce = ?9, relay_submitted_at = ?10,
                    dest_tx_hash = ?11, dest_confirmations = ?12, dest_block_height = ?13,
                    dest_nonce = ?14, dest_submitted_at = ?15,
                    status = ?16, failure_reason = ?17, degraded = ?18,
                    updated_at = ?19, last_progress_at = ?20
                WHERE id = ?21 AND updated_at = ?22
                "#,
                params![
                    merged.source.tx_hash,
                    merged.source.confirmations as i64,
                    merged.source.block_height.map(|h| h as i64),
                    merged.source.nonce.map(|n| n as i64),
                    merged.source.submitted_at.as_ref().map(to_nanos),
                    merged.relay.tx_hash,
                    merged.relay.confirmations as i64,
                    merged.relay.block_height.map(|h| h as i64),
                    merged.relay.nonce.map(|n| n as i64),
                    merged.relay.submitted_at.as_ref().map(to_nanos),
                    merged.dest.tx_hash,
                    merged.dest.confirmations as i64,
                    merged.dest.block_height.map(|h| h as i64),
                    merged.dest.nonce.map(|n| n as i64),
                    merged.dest.submitted_at.as_ref().map(to_nanos),
                    merged.status.to_string(),
                    failure_reason,
                    merged.degraded,
                    to_nanos(&merged.updated_at),
                    to_nanos(&merged.last_progress_at),
                    id.to_string(),
                    to_nanos(&current.updated_at),
                ],
            )
            .map_err(|e| BridgeError::Store(format!("Update failed: {}", e)))?;

        if changed != 1 {
            return Err(BridgeError::Store(format!(
                "Transfer {} was modified concurrently",
                id
            )));
        }

        if merged.status != current.status {
            insert_audit(
                &tx,
                Some(id),
                "status",
                &format!("{} -> {}", current.status, merged.status),
            )?;
        }

        tx.commit()
            .map_err(|e| BridgeError::Store(format!("Commit failed: {}", e)))?;

        Ok(merged)
    }

    /// Log an audit event.
    pub fn log_audit(
        &self,
        transfer_id: Option<&Uuid>,
        action: &str,
        details: &str,
    ) -> Result<(), BridgeError> {
        let conn = self.lock()?;
        insert_audit(&conn, transfer_id, action, details)
    }

    /// Audit entries for a transfer, oldest first.
    pub fn audit_entries(&self, transfer_id: &Uuid) -> Result<Vec<AuditEntry>, BridgeError> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(
                r#"
                SELECT action, details, created_at FROM audit_log
                WHERE transfer_id = ?1 ORDER BY id ASC
                "#,
            )
            .map_err(|e| BridgeError::Store(format!("Prepare failed: {}", e)))?;

        let entries = stmt
            .query_map(params![transfer_id.to_string()], |row| {
                Ok(AuditEntry {
                    action: row.get(0)?,
                    details: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    created_at: from_nanos(row.get(2)?),
                })
            })
            .map_err(|e| BridgeError::Store(format!("Query failed: {}", e)))?
            .collect::<SqliteResult<Vec<_>>>()
            .map_err(|e| BridgeError::Store(format!("Collect failed: {}", e)))?;

        Ok(entries)
    }
}

fn select_transfer(conn: &Connection, id: &Uuid) -> Result<Option<TransferRecord>, BridgeError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM bridge_transfers WHERE id = ?1",
            TRANSFER_COLUMNS
        ))
        .map_err(|e| BridgeError::Store(format!("Prepare failed: {}", e)))?;

    stmt.query_row(params![id.to_string()], row_to_transfer)
        .optional()
        .map_err(|e| BridgeError::Store(format!("Query failed: {}", e)))
}

fn insert_audit(
    conn: &Connection,
    transfer_id: Option<&Uuid>,
    action: &str,
    details: &str,
) -> Result<(), BridgeError> {
    conn.execute(
        r#"
        INSERT INTO audit_log (transfer_id, action, details, created_at)
        VALUES (?1, ?2, ?3, ?4)
        "#,
        params![
            transfer_id.map(|id| id.to_string()),
            action,
            details,
            to_nanos(&Utc::now())
        ],
    )
    .map_err(|e| BridgeError::Store(format!("Insert failed: {}", e)))?;

    Ok(())
}

fn encode_failure_reason(record: &TransferRecord) -> Result<Option<String>, BridgeError> {
    record
        .failure_reason
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| BridgeError::Store(format!("Failed to encode failure reason: {}", e)))
}

fn to_nanos(t: &DateTime<Utc>) -> i64 {
    t.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn from_nanos(nanos: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> SqliteResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| conversion_error(idx, format!("{}: {}", raw, e)))
}

fn row_to_leg(row: &Row<'_>, first: usize) -> SqliteResult<LegState> {
    Ok(LegState {
        tx_hash: row.get(first)?,
        confirmations: row.get::<_, i64>(first + 1)? as u64,
        block_height: row.get::<_, Option<i64>>(first + 2)?.map(|h| h as u64),
        nonce: row.get::<_, Option<i64>>(first + 3)?.map(|n| n as u64),
        submitted_at: row.get::<_, Option<i64>>(first + 4)?.map(from_nanos),
    })
}

/// Convert a database row to a TransferRecord.
fn row_to_transfer(row: &Row<'_>) -> SqliteResult<TransferRecord> {
    let failure_reason = row
        .get::<_, Option<String>>(23)?
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| conversion_error(23, e.to_string()))?;

    Ok(TransferRecord {
        id: parse_column(row, 0)?,
        direction: parse_column(row, 1)?,
        asset: row.get(2)?,
        amount: parse_column(row, 3)?,
        fee: parse_column(row, 4)?,
        sender: row.get(5)?,
        recipient: row.get(6)?,
        source: row_to_leg(row, 7)?,
        relay: row_to_leg(row, 12)?,
        dest: row_to_leg(row, 17)?,
        status: parse_column(row, 22)?,
        failure_reason,
        degraded: row.get(24)?,
        created_at: from_nanos(row.get(25)?),
        updated_at: from_nanos(row.get(26)?),
        last_progress_at: from_nanos(row.get(27)?),
    })
}
