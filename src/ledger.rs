//! Local append-only ledger.
//!
//! One row per emitted or superseding [`PlateRecord`]. Rows are never updated
//! or deleted; the current view of a plate is its last row. Each row is chained
//! to its predecessor with SHA-256 over `prev_hash || payload_json`.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, NaiveTime, Timelike};
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::frame::{DefectClass, PlateShape};
use crate::record::{defects_text, parse_lot_id, PlateRecord};

pub const NOTE_UPDATED: &str = "updated";

/// Hashes a ledger payload with the previous chain hash.
pub fn hash_entry(prev_hash: &[u8; 32], payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    hasher.update(payload);
    hasher.finalize().into()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRow {
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub sequence_no: u32,
    pub lot_id: String,
    pub shape: PlateShape,
    pub defects: BTreeSet<DefectClass>,
    pub note: String,
}

impl LedgerRow {
    pub fn from_record(record: &PlateRecord, note: &str) -> Self {
        let ts = record.timestamp();
        let time = ts.time();
        Self {
            date: ts.date_naive(),
            time: time.with_nanosecond(0).unwrap_or(time),
            sequence_no: record.sequence_no(),
            lot_id: record.lot_id().to_string(),
            shape: record.shape(),
            defects: record.defects().clone(),
            note: note.to_string(),
        }
    }

    pub fn defects_text(&self) -> String {
        defects_text(&self.defects)
    }
}

pub trait LedgerStore {
    fn append(&mut self, row: &LedgerRow) -> Result<()>;

    /// Highest plate sequence number recorded on `date`.
    fn max_sequence_on(&self, date: NaiveDate) -> Result<Option<u32>>;

    /// Highest lot sequence (the `_NN` suffix) recorded on `date`.
    fn max_lot_seq_on(&self, date: NaiveDate) -> Result<Option<u32>>;

    /// All rows on `date`, in append order.
    fn rows_on(&self, date: NaiveDate) -> Result<Vec<LedgerRow>>;

    /// All rows of one lot, in append order.
    fn rows_for_lot(&self, lot_id: &str) -> Result<Vec<LedgerRow>>;

    /// Recomputes the hash chain; returns the number of rows checked.
    fn verify_chain(&self) -> Result<usize>;
}

/// Last row per sequence number, in sequence order.
pub fn current_rows(rows: &[LedgerRow]) -> Vec<LedgerRow> {
    let mut latest: BTreeMap<u32, LedgerRow> = BTreeMap::new();
    for row in rows {
        latest.insert(row.sequence_no, row.clone());
    }
    latest.into_values().collect()
}

fn lot_seq_for_date(lot_id: &str, date: NaiveDate) -> Option<u32> {
    match parse_lot_id(lot_id) {
        Some((lot_date, seq)) if lot_date == date => Some(seq),
        _ => None,
    }
}

fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

// -------------------- SQLite --------------------

pub struct SqliteLedgerStore {
    conn: Connection,
}

impl SqliteLedgerStore {
    /// Opens (or creates) the ledger. Accepts plain paths, `:memory:` and
    /// `file:` URIs.
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)
            .with_context(|| format!("open ledger database {}", db_path))?;
        let store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS plate_rows (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              date TEXT NOT NULL,
              time TEXT NOT NULL,
              sequence_no INTEGER NOT NULL,
              lot_id TEXT NOT NULL,
              shape TEXT NOT NULL,
              defects TEXT NOT NULL,
              note TEXT NOT NULL,
              payload_json TEXT NOT NULL,
              prev_hash BLOB NOT NULL,
              entry_hash BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_rows_date ON plate_rows(date);
            CREATE INDEX IF NOT EXISTS idx_rows_lot ON plate_rows(lot_id);
            "#,
        )?;
        Ok(())
    }

    fn last_entry_hash(&self) -> Result<[u8; 32]> {
        let mut stmt = self
            .conn
            .prepare("SELECT entry_hash FROM plate_rows ORDER BY id DESC LIMIT 1")?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => blob32(row.get(0)?, "entry_hash"),
            None => Ok([0u8; 32]),
        }
    }

    fn query_payloads(&self, sql: &str, key: &str) -> Result<Vec<LedgerRow>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params![key])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let payload: String = row.get(0)?;
            out.push(serde_json::from_str(&payload).context("corrupt ledger payload")?);
        }
        Ok(out)
    }
}

impl LedgerStore for SqliteLedgerStore {
    fn append(&mut self, row: &LedgerRow) -> Result<()> {
        let prev_hash = self.last_entry_hash()?;
        let payload_json = serde_json::to_string(row)?;
        let entry_hash = hash_entry(&prev_hash, payload_json.as_bytes());

        self.conn.execute(
            r#"
            INSERT INTO plate_rows(date, time, sequence_no, lot_id, shape, defects, note,
                                   payload_json, prev_hash, entry_hash)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                date_key(row.date),
                row.time.format("%H:%M:%S").to_string(),
                row.sequence_no,
                row.lot_id,
                row.shape.as_str(),
                row.defects_text(),
                row.note,
                payload_json,
                prev_hash.to_vec(),
                entry_hash.to_vec()
            ],
        )?;
        Ok(())
    }

    fn max_sequence_on(&self, date: NaiveDate) -> Result<Option<u32>> {
        let max: Option<u32> = self.conn.query_row(
            "SELECT MAX(sequence_no) FROM plate_rows WHERE date = ?1",
            params![date_key(date)],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    fn max_lot_seq_on(&self, date: NaiveDate) -> Result<Option<u32>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT lot_id FROM plate_rows WHERE date = ?1")?;
        let mut rows = stmt.query(params![date_key(date)])?;
        let mut max = None;
        while let Some(row) = rows.next()? {
            let lot_id: String = row.get(0)?;
            if let Some(seq) = lot_seq_for_date(&lot_id, date) {
                max = Some(max.map_or(seq, |m: u32| m.max(seq)));
            }
        }
        Ok(max)
    }

    fn rows_on(&self, date: NaiveDate) -> Result<Vec<LedgerRow>> {
        self.query_payloads(
            "SELECT payload_json FROM plate_rows WHERE date = ?1 ORDER BY id ASC",
            &date_key(date),
        )
    }

    fn rows_for_lot(&self, lot_id: &str) -> Result<Vec<LedgerRow>> {
        self.query_payloads(
            "SELECT payload_json FROM plate_rows WHERE lot_id = ?1 ORDER BY id ASC",
            lot_id,
        )
    }

    fn verify_chain(&self) -> Result<usize> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, payload_json, prev_hash, entry_hash FROM plate_rows ORDER BY id ASC")?;
        let mut rows = stmt.query([])?;
        let mut expected_prev = [0u8; 32];
        let mut checked = 0usize;
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let payload: String = row.get(1)?;
            let prev_hash = blob32(row.get(2)?, "prev_hash")?;
            let entry_hash = blob32(row.get(3)?, "entry_hash")?;
            if prev_hash != expected_prev {
                return Err(anyhow!("ledger chain broken at row {}: prev_hash mismatch", id));
            }
            if hash_entry(&prev_hash, payload.as_bytes()) != entry_hash {
                return Err(anyhow!("ledger chain broken at row {}: entry_hash mismatch", id));
            }
            expected_prev = entry_hash;
            checked += 1;
        }
        Ok(checked)
    }
}

fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

fn blob32(bytes: Vec<u8>, column: &str) -> Result<[u8; 32]> {
    if bytes.len() != 32 {
        return Err(anyhow!("corrupt ledger: {} size", column));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

// -------------------- In-memory --------------------

#[derive(Clone, Debug)]
struct InMemoryLedgerEntry {
    row: LedgerRow,
    payload_json: String,
    prev_hash: [u8; 32],
    entry_hash: [u8; 32],
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryLedgerStore {
    entries: Vec<InMemoryLedgerEntry>,
}

impl InMemoryLedgerStore {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn rows(&self) -> Vec<LedgerRow> {
        self.entries.iter().map(|e| e.row.clone()).collect()
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn append(&mut self, row: &LedgerRow) -> Result<()> {
        let prev_hash = self
            .entries
            .last()
            .map(|e| e.entry_hash)
            .unwrap_or([0u8; 32]);
        let payload_json = serde_json::to_string(row)?;
        let entry_hash = hash_entry(&prev_hash, payload_json.as_bytes());
        self.entries.push(InMemoryLedgerEntry {
            row: row.clone(),
            payload_json,
            prev_hash,
            entry_hash,
        });
        Ok(())
    }

    fn max_sequence_on(&self, date: NaiveDate) -> Result<Option<u32>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.row.date == date)
            .map(|e| e.row.sequence_no)
            .max())
    }

    fn max_lot_seq_on(&self, date: NaiveDate) -> Result<Option<u32>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.row.date == date)
            .filter_map(|e| lot_seq_for_date(&e.row.lot_id, date))
            .max())
    }

    fn rows_on(&self, date: NaiveDate) -> Result<Vec<LedgerRow>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.row.date == date)
            .map(|e| e.row.clone())
            .collect())
    }

    fn rows_for_lot(&self, lot_id: &str) -> Result<Vec<LedgerRow>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.row.lot_id == lot_id)
            .map(|e| e.row.clone())
            .collect())
    }

    fn verify_chain(&self) -> Result<usize> {
        let mut expected_prev = [0u8; 32];
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.prev_hash != expected_prev
                || hash_entry(&entry.prev_hash, entry.payload_json.as_bytes()) != entry.entry_hash
            {
                return Err(anyhow!("ledger chain broken at entry {}", index));
            }
            expected_prev = entry.entry_hash;
        }
        Ok(self.entries.len())
    }
}
