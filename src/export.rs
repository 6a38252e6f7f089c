//! Structured JSON export mirror.
//!
//! One document per lot under `save_root`, rewritten in full on every commit
//! so the file always holds the current view of the lot.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;

use crate::ledger::LedgerRow;
use crate::record::{Lot, PlateRecord};

const REPORT_TITLE: &str = "Leaf plate inspection report";

#[derive(Debug, Serialize)]
struct ExportSession<'a> {
    start_time: &'a str,
    end_time: String,
}

#[derive(Debug, Serialize)]
struct ExportDocument<'a> {
    report_title: String,
    lot_id: &'a str,
    session: ExportSession<'a>,
    records: Vec<&'a LedgerRow>,
}

#[derive(Debug)]
pub struct ExportMirror {
    path: PathBuf,
    lot_id: String,
    start_time: String,
    rows: BTreeMap<u32, LedgerRow>,
}

impl ExportMirror {
    /// Prepares `Report_{session_key}.json` for `lot`. Nothing is written
    /// until the first [`ExportMirror::write`].
    pub fn create(save_root: &Path, lot: &Lot) -> Result<Self> {
        fs::create_dir_all(save_root)
            .with_context(|| format!("create export directory {}", save_root.display()))?;
        Ok(Self {
            path: save_root.join(format!("Report_{}.json", lot.session_key())),
            lot_id: lot.lot_id().to_string(),
            start_time: lot.started_at().format("%H:%M:%S").to_string(),
            rows: BTreeMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Inserts or replaces the row for the record's sequence number.
    pub fn upsert(&mut self, record: &PlateRecord, note: &str) {
        self.rows
            .insert(record.sequence_no(), LedgerRow::from_record(record, note));
    }

    /// Rewrites the document, stamping `now` as the session end time.
    pub fn write(&self, now: DateTime<Local>) -> Result<()> {
        let doc = ExportDocument {
            report_title: format!("{} {}", REPORT_TITLE, now.format("%d/%m/%y")),
            lot_id: &self.lot_id,
            session: ExportSession {
                start_time: &self.start_time,
                end_time: now.format("%H:%M:%S").to_string(),
            },
            records: self.rows.values().collect(),
        };
        let json = serde_json::to_vec_pretty(&doc)?;
        write_atomic(&self.path, &json)
            .with_context(|| format!("write export {}", self.path.display()))
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{DefectClass, PlateShape};
    use crate::ledger::InMemoryLedgerStore;
    use chrono::TimeZone;
    use serde_json::Value;

    #[test]
    fn rewrites_current_view_of_lot() {
        let dir = tempfile::tempdir().unwrap();
        let start = Local
            .with_ymd_and_hms(2026, 10, 18, 8, 15, 0)
            .single()
            .unwrap();
        let lot = Lot::start(&InMemoryLedgerStore::default(), start).unwrap();
        let mut export = ExportMirror::create(dir.path(), &lot).unwrap();
        assert_eq!(
            export.path().file_name().and_then(|n| n.to_str()),
            Some("Report_PTP261018_01_20261018_081500.json")
        );

        let first = PlateRecord::new(
            1,
            start,
            lot.lot_id(),
            PlateShape::Heart,
            [DefectClass::Crack].into_iter().collect(),
        );
        export.upsert(&first, "");
        let updated = PlateRecord::new(
            1,
            start,
            lot.lot_id(),
            PlateShape::Heart,
            [DefectClass::Crack, DefectClass::Burn].into_iter().collect(),
        );
        export.upsert(&updated, "updated");
        export
            .write(start + chrono::Duration::minutes(5))
            .unwrap();

        let doc: Value =
            serde_json::from_slice(&fs::read(export.path()).unwrap()).unwrap();
        assert_eq!(doc["lot_id"], "PTP261018_01");
        assert_eq!(doc["session"]["start_time"], "08:15:00");
        assert_eq!(doc["session"]["end_time"], "08:20:00");
        let records = doc["records"].as_array().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["sequence_no"], 1);
        assert_eq!(records[0]["note"], "updated");
        assert_eq!(records[0]["defects"], serde_json::json!(["crack", "burn"]));
        assert!(!dir.path().join("Report_PTP261018_01_20261018_081500.json.tmp").exists());
    }
}
