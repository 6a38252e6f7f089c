//! Weekly roll-up over the ledger.
//!
//! A week runs Monday to Sunday. Each (date, lot) pair gets plate totals and
//! its most frequent defect, computed from the current view of each plate.

use anyhow::Result;
use chrono::{Datelike, Duration, NaiveDate};
use serde::Serialize;

use crate::frame::DefectClass;
use crate::ledger::{current_rows, LedgerRow, LedgerStore};

/// Monday and Sunday of the week containing `date`.
pub fn week_bounds(date: NaiveDate) -> (NaiveDate, NaiveDate) {
    let monday = date - Duration::days(i64::from(date.weekday().num_days_from_monday()));
    (monday, monday + Duration::days(6))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LotSummary {
    pub date: NaiveDate,
    pub lot_id: String,
    pub total: u32,
    pub passed: u32,
    pub defective: u32,
    pub most_common_defect: Option<DefectClass>,
    #[serde(skip)]
    defect_counts: Vec<(DefectClass, u32)>,
}

impl LotSummary {
    fn new(date: NaiveDate, lot_id: &str) -> Self {
        Self {
            date,
            lot_id: lot_id.to_string(),
            total: 0,
            passed: 0,
            defective: 0,
            most_common_defect: None,
            defect_counts: Vec::new(),
        }
    }

    fn count(&mut self, row: &LedgerRow) {
        self.total += 1;
        if row.defects.is_empty() {
            self.passed += 1;
            return;
        }
        self.defective += 1;
        for defect in &row.defects {
            match self.defect_counts.iter_mut().find(|(d, _)| d == defect) {
                Some((_, n)) => *n += 1,
                None => self.defect_counts.push((*defect, 1)),
            }
        }
        // Ties go to the defect seen first.
        let mut best: Option<(DefectClass, u32)> = None;
        for &(defect, n) in &self.defect_counts {
            if best.map_or(true, |(_, top)| n > top) {
                best = Some((defect, n));
            }
        }
        self.most_common_defect = best.map(|(d, _)| d);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WeeklySummary {
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Ordered by date, then lot id.
    pub lots: Vec<LotSummary>,
    pub total: u32,
    pub passed: u32,
    pub defective: u32,
}

/// Rolls up the Monday-to-Sunday week containing `date`.
pub fn weekly_summary(store: &dyn LedgerStore, date: NaiveDate) -> Result<WeeklySummary> {
    let (start, end) = week_bounds(date);
    let mut summary = WeeklySummary {
        start,
        end,
        lots: Vec::new(),
        total: 0,
        passed: 0,
        defective: 0,
    };

    let mut day = start;
    while day <= end {
        let mut lots: Vec<LotSummary> = Vec::new();
        for row in current_rows(&store.rows_on(day)?) {
            let idx = match lots.iter().position(|l| l.lot_id == row.lot_id) {
                Some(idx) => idx,
                None => {
                    lots.push(LotSummary::new(day, &row.lot_id));
                    lots.len() - 1
                }
            };
            lots[idx].count(&row);
        }
        lots.sort_by(|a, b| a.lot_id.cmp(&b.lot_id));
        for lot in &lots {
            summary.total += lot.total;
            summary.passed += lot.passed;
            summary.defective += lot.defective;
        }
        summary.lots.extend(lots);
        day += Duration::days(1);
    }
    Ok(summary)
}
