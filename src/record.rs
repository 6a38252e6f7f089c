//! Committed output types.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::frame::{DefectClass, PlateShape};
use crate::ledger::LedgerStore;

pub const LOT_PREFIX: &str = "PTP";

/// Immutable record of one physical plate.
///
/// A later record with the same `sequence_no` may supersede this one (with a
/// strictly larger defect set) while the plate is still in view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlateRecord {
    sequence_no: u32,
    timestamp: DateTime<Local>,
    lot_id: String,
    shape: PlateShape,
    defects: BTreeSet<DefectClass>,
}

impl PlateRecord {
    pub fn new(
        sequence_no: u32,
        timestamp: DateTime<Local>,
        lot_id: &str,
        shape: PlateShape,
        defects: BTreeSet<DefectClass>,
    ) -> Self {
        Self {
            sequence_no,
            timestamp,
            lot_id: lot_id.to_string(),
            shape,
            defects,
        }
    }

    pub fn sequence_no(&self) -> u32 {
        self.sequence_no
    }

    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    pub fn lot_id(&self) -> &str {
        &self.lot_id
    }

    pub fn shape(&self) -> PlateShape {
        self.shape
    }

    pub fn defects(&self) -> &BTreeSet<DefectClass> {
        &self.defects
    }

    pub fn is_defective(&self) -> bool {
        !self.defects.is_empty()
    }

    /// Defects as a `" / "`-joined list, or `"-"` when none.
    pub fn defects_text(&self) -> String {
        defects_text(&self.defects)
    }
}

pub fn defects_text(defects: &BTreeSet<DefectClass>) -> String {
    if defects.is_empty() {
        return "-".to_string();
    }
    defects
        .iter()
        .map(|d| d.as_str())
        .collect::<Vec<_>>()
        .join(" / ")
}

/// User-visible status of the plate in view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PlateStatus {
    Pending,
    Pass,
    Defect { count: u32 },
}

/// Running totals for the current lot.
///
/// Counted by the aggregator when a plate is first committed, not when its
/// ledger write succeeds: during a ledger outage the totals include plates
/// still waiting in the inspector's pending queue.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub lot_id: String,
    pub total: u32,
    pub shapes: BTreeMap<PlateShape, u32>,
    pub defective: u32,
    pub passed: u32,
}

impl SessionStats {
    pub fn new(lot_id: &str) -> Self {
        Self {
            lot_id: lot_id.to_string(),
            ..Self::default()
        }
    }

    /// Counts a record the first time its sequence number is committed.
    pub fn count(&mut self, record: &PlateRecord) {
        self.total += 1;
        *self.shapes.entry(record.shape()).or_insert(0) += 1;
        if record.is_defective() {
            self.defective += 1;
        } else {
            self.passed += 1;
        }
    }
}

// -------------------- Lots --------------------

/// Operator batch. Plate numbering continues across lots and process
/// restarts within the same calendar day.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lot {
    lot_id: String,
    date: NaiveDate,
    seq: u32,
    next_sequence_no: u32,
    started_at: DateTime<Local>,
}

impl Lot {
    /// Opens the next lot for `now`'s date, continuing from what the ledger
    /// already holds for that date.
    pub fn start(ledger: &dyn LedgerStore, now: DateTime<Local>) -> Result<Self> {
        let date = now.date_naive();
        let seq = ledger.max_lot_seq_on(date)?.unwrap_or(0) + 1;
        let next_sequence_no = ledger.max_sequence_on(date)?.unwrap_or(0) + 1;
        Self::with_numbers(date, seq, next_sequence_no, now)
    }

    /// Lot following this one. Same date: lot seq + 1 and plate numbering
    /// continues; new date: numbering restarts from the ledger.
    pub fn next(&self, ledger: &dyn LedgerStore, now: DateTime<Local>) -> Result<Self> {
        let date = now.date_naive();
        let from_ledger = Self::start(ledger, now)?;
        if date != self.date {
            return Ok(from_ledger);
        }
        Self::with_numbers(
            date,
            from_ledger.seq.max(self.seq + 1),
            from_ledger.next_sequence_no.max(self.next_sequence_no),
            now,
        )
    }

    fn with_numbers(
        date: NaiveDate,
        seq: u32,
        next_sequence_no: u32,
        started_at: DateTime<Local>,
    ) -> Result<Self> {
        if seq > 99 {
            log::warn!("lot sequence {} exceeds two digits for {}", seq, date);
        }
        if next_sequence_no == 0 {
            return Err(anyhow!("plate sequence numbers start at 1"));
        }
        Ok(Self {
            lot_id: format_lot_id(date, seq),
            date,
            seq,
            next_sequence_no,
            started_at,
        })
    }

    pub fn lot_id(&self) -> &str {
        &self.lot_id
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn next_sequence_no(&self) -> u32 {
        self.next_sequence_no
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Key used for export file names and the remote session path.
    /// Unique per lot even when two lots start within the same second.
    pub fn session_key(&self) -> String {
        format!("{}_{}", self.lot_id, self.started_at.format("%Y%m%d_%H%M%S"))
    }

    /// Hands out the next plate sequence number. Never reuses one.
    pub fn allocate_sequence(&mut self) -> u32 {
        let seq = self.next_sequence_no;
        self.next_sequence_no += 1;
        seq
    }
}

/// `PTP{yymmdd}_{seq:02}`
pub fn format_lot_id(date: NaiveDate, seq: u32) -> String {
    format!("{}{}_{:02}", LOT_PREFIX, date.format("%y%m%d"), seq)
}

/// Inverse of [`format_lot_id`].
pub fn parse_lot_id(lot_id: &str) -> Option<(NaiveDate, u32)> {
    let rest = lot_id.strip_prefix(LOT_PREFIX)?;
    let (date_part, seq_part) = rest.split_once('_')?;
    if date_part.len() != 6 || !date_part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let date = NaiveDate::parse_from_str(date_part, "%y%m%d").ok()?;
    let seq = seq_part.parse().ok()?;
    Some((date, seq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{InMemoryLedgerStore, LedgerRow};
    use chrono::TimeZone;

    fn noon(y: i32, m: u32, d: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(y, m, d, 12, 0, 0)
            .single()
            .expect("unambiguous local time")
    }

    #[test]
    fn lot_id_format_round_trips() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        assert_eq!(format_lot_id(date, 3), "PTP261018_03");
        assert_eq!(parse_lot_id("PTP261018_03"), Some((date, 3)));
        assert_eq!(parse_lot_id("PTP261018_117"), Some((date, 117)));
        assert_eq!(parse_lot_id("XYZ261018_03"), None);
        assert_eq!(parse_lot_id("PTP2610_03"), None);
        assert_eq!(parse_lot_id("PTP261018-03"), None);
    }

    #[test]
    fn defects_text_uses_dash_when_clean() {
        assert_eq!(defects_text(&BTreeSet::new()), "-");
        let defects: BTreeSet<_> = [DefectClass::Burn, DefectClass::Crack].into_iter().collect();
        assert_eq!(defects_text(&defects), "crack / burn");
    }

    #[test]
    fn fresh_ledger_starts_at_one() {
        let ledger = InMemoryLedgerStore::default();
        let lot = Lot::start(&ledger, noon(2026, 10, 18)).unwrap();
        assert_eq!(lot.lot_id(), "PTP261018_01");
        assert_eq!(lot.next_sequence_no(), 1);
    }

    #[test]
    fn start_continues_from_ledger_for_same_date() {
        let mut ledger = InMemoryLedgerStore::default();
        let now = noon(2026, 10, 18);
        for seq in 1..=5 {
            let record = PlateRecord::new(
                seq,
                now,
                "PTP261018_02",
                PlateShape::Heart,
                BTreeSet::new(),
            );
            ledger.append(&LedgerRow::from_record(&record, "")).unwrap();
        }
        let lot = Lot::start(&ledger, now).unwrap();
        assert_eq!(lot.lot_id(), "PTP261018_03");
        assert_eq!(lot.next_sequence_no(), 6);

        let tomorrow = Lot::start(&ledger, noon(2026, 10, 19)).unwrap();
        assert_eq!(tomorrow.lot_id(), "PTP261019_01");
        assert_eq!(tomorrow.next_sequence_no(), 1);
    }

    #[test]
    fn next_lot_keeps_numbering_within_day() {
        let ledger = InMemoryLedgerStore::default();
        let now = noon(2026, 10, 18);
        let mut lot = Lot::start(&ledger, now).unwrap();
        assert_eq!(lot.allocate_sequence(), 1);
        assert_eq!(lot.allocate_sequence(), 2);

        let next = lot.next(&ledger, now).unwrap();
        assert_eq!(next.lot_id(), "PTP261018_02");
        assert_eq!(next.next_sequence_no(), 3);

        let next_day = next.next(&ledger, noon(2026, 10, 19)).unwrap();
        assert_eq!(next_day.lot_id(), "PTP261019_01");
        assert_eq!(next_day.next_sequence_no(), 1);
    }

    #[test]
    fn stats_count_first_commits() {
        let now = noon(2026, 10, 18);
        let mut stats = SessionStats::new("PTP261018_01");
        stats.count(&PlateRecord::new(
            1,
            now,
            "PTP261018_01",
            PlateShape::Heart,
            BTreeSet::new(),
        ));
        stats.count(&PlateRecord::new(
            2,
            now,
            "PTP261018_01",
            PlateShape::Unknown,
            [DefectClass::Hole].into_iter().collect(),
        ));
        assert_eq!(stats.total, 2);
        assert_eq!(stats.passed, 1);
        assert_eq!(stats.defective, 1);
        assert_eq!(stats.shapes.get(&PlateShape::Heart), Some(&1));
        assert_eq!(stats.shapes.get(&PlateShape::Unknown), Some(&1));
    }
}
