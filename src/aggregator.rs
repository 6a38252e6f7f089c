//! Per-tick aggregation core.
//!
//! [`PlateAggregator::process_frame`] combines the presence debouncer, the
//! identity tracker, the attribute aggregator and the commit policy. It does no
//! I/O: everything it decides is returned as [`Effect`] values for an outer
//! shell to interpret.
//!
//! Commit policy:
//!
//! - The first tick a session sees a defect commits a record immediately.
//! - A committed session whose latched defect set grows re-emits a record with
//!   the same sequence number (`supersedes = true`). Defects are never removed.
//! - A session reaching the absence gate uncommitted emits one clean record.
//! - A replacement detected by the identity tracker closes the committed
//!   session; the new plate must cross the presence gate before it is counted.

use chrono::{DateTime, Local};

use crate::config::{GateSettings, IdentitySettings};
use crate::frame::Frame;
use crate::identity::IdentityTracker;
use crate::presence::{PresenceDebouncer, PresenceState, Transition};
use crate::record::{Lot, PlateRecord, PlateStatus, SessionStats};
use crate::session::PlateSession;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepartureReason {
    /// Absence gate reached.
    Absent,
    /// Identity tracker saw a different plate in the slot.
    Replaced,
    /// Lot stopped or process shutting down.
    Shutdown,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    Arrived {
        sequence_no: u32,
        tick_id: u64,
    },
    Status {
        sequence_no: u32,
        status: PlateStatus,
    },
    /// Persist `record`. With `supersedes`, an earlier record with the same
    /// sequence number was already emitted and this one replaces it.
    Commit {
        record: PlateRecord,
        supersedes: bool,
    },
    Stats(SessionStats),
    Departed {
        sequence_no: u32,
        reason: DepartureReason,
    },
}

pub struct PlateAggregator {
    debouncer: PresenceDebouncer,
    tracker: IdentityTracker,
    session: Option<PlateSession>,
    lot: Lot,
    stats: SessionStats,
}

impl PlateAggregator {
    pub fn new(gate: GateSettings, identity: IdentitySettings, lot: Lot) -> Self {
        let stats = SessionStats::new(lot.lot_id());
        Self {
            debouncer: PresenceDebouncer::new(gate),
            tracker: IdentityTracker::new(identity),
            session: None,
            lot,
            stats,
        }
    }

    pub fn lot(&self) -> &Lot {
        &self.lot
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn session(&self) -> Option<&PlateSession> {
        self.session.as_ref()
    }

    pub fn presence(&self) -> PresenceState {
        self.debouncer.state()
    }

    /// Processes one tick.
    pub fn process_frame(&mut self, frame: &Frame) -> Vec<Effect> {
        let mut effects = Vec::new();
        let at = frame.captured_at;

        if let Some(session) = self.session.as_mut() {
            let dominant = frame.dominant_shape().map(|d| d.bbox);
            if self.tracker.observe(session, dominant, frame.dominant_roi()) {
                log::info!(
                    "tick {}: plate #{} replaced in slot",
                    frame.tick_id,
                    session.sequence_no()
                );
                self.close_session(at, DepartureReason::Replaced, &mut effects);
                self.debouncer.reset();
            }
        }

        match self.debouncer.observe(frame.plate_detected()) {
            Transition::Arrived => self.open_session(frame, &mut effects),
            Transition::Departed => self.close_session(at, DepartureReason::Absent, &mut effects),
            Transition::Steady => {}
        }

        if let Some(mut session) = self.session.take() {
            self.absorb(&mut session, frame, &mut effects);
            self.session = Some(session);
        }
        effects
    }

    /// Closes the open session at shutdown. A defect-flagged plate that was
    /// never committed is flushed; an unflagged one is discarded.
    pub fn close(&mut self, at: DateTime<Local>) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.close_session(at, DepartureReason::Shutdown, &mut effects);
        self.debouncer.reset();
        effects
    }

    /// Switches to a new lot. Any open session is closed first.
    pub fn start_lot(&mut self, lot: Lot) -> Vec<Effect> {
        let mut effects = self.close(lot.started_at());
        self.stats = SessionStats::new(lot.lot_id());
        self.lot = lot;
        effects.push(Effect::Stats(self.stats.clone()));
        effects
    }

    fn open_session(&mut self, frame: &Frame, effects: &mut Vec<Effect>) {
        assert!(
            self.session.is_none(),
            "plate session already open; presence gate out of sync"
        );
        let sequence_no = self.lot.allocate_sequence();
        let mut session = PlateSession::open(sequence_no, frame.captured_at);
        // Seed the tracker with the arrival tick.
        self.tracker.reset();
        let dominant = frame.dominant_shape().map(|d| d.bbox);
        self.tracker
            .observe(&mut session, dominant, frame.dominant_roi());

        log::info!(
            "tick {}: plate #{} arrived ({})",
            frame.tick_id,
            sequence_no,
            self.lot.lot_id()
        );
        effects.push(Effect::Arrived {
            sequence_no,
            tick_id: frame.tick_id,
        });
        effects.push(Effect::Status {
            sequence_no,
            status: PlateStatus::Pending,
        });
        self.session = Some(session);
    }

    fn absorb(&mut self, session: &mut PlateSession, frame: &Frame, effects: &mut Vec<Effect>) {
        let outcome = session.absorb(frame);

        if outcome.defect_flag_raised && !session.committed {
            self.commit(session, frame.captured_at, effects);
        } else if session.committed && session.latched_defects() != session.emitted_defects {
            self.commit(session, frame.captured_at, effects);
        }

        if outcome.defect_total_grew {
            effects.push(Effect::Status {
                sequence_no: session.sequence_no(),
                status: PlateStatus::Defect {
                    count: session.defect_total(),
                },
            });
        }
    }

    fn close_session(
        &mut self,
        at: DateTime<Local>,
        reason: DepartureReason,
        effects: &mut Vec<Effect>,
    ) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        self.tracker.reset();
        let sequence_no = session.sequence_no();

        match reason {
            DepartureReason::Absent if !session.committed => {
                self.commit(&mut session, at, effects);
                effects.push(Effect::Status {
                    sequence_no,
                    status: PlateStatus::Pass,
                });
            }
            DepartureReason::Replaced if !session.committed => {
                log::info!("plate #{} discarded on replacement (not committed)", sequence_no);
            }
            DepartureReason::Shutdown if !session.committed => {
                if session.defect_seen() {
                    self.commit(&mut session, at, effects);
                } else {
                    log::info!(
                        "plate #{} discarded at shutdown (no defect, not committed)",
                        sequence_no
                    );
                }
            }
            _ => {}
        }

        log::info!("plate #{} departed ({:?})", sequence_no, reason);
        effects.push(Effect::Departed {
            sequence_no,
            reason,
        });
    }

    fn commit(&mut self, session: &mut PlateSession, at: DateTime<Local>, effects: &mut Vec<Effect>) {
        let supersedes = session.committed;
        let defects = session.latched_defects();
        let record = PlateRecord::new(
            session.sequence_no(),
            at,
            self.lot.lot_id(),
            session.shape(),
            defects.clone(),
        );
        session.committed = true;
        session.emitted_defects = defects;

        if supersedes {
            log::info!(
                "plate #{} updated: {} {}",
                record.sequence_no(),
                record.shape().as_str(),
                record.defects_text()
            );
        } else {
            log::info!(
                "plate #{} committed: {} {}",
                record.sequence_no(),
                record.shape().as_str(),
                record.defects_text()
            );
            self.stats.count(&record);
        }
        effects.push(Effect::Commit { record, supersedes });
        if !supersedes {
            effects.push(Effect::Stats(self.stats.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorSettings;
    use crate::frame::{DefectClass, FrameAdapter, PlateShape, RawDetection};
    use crate::ledger::InMemoryLedgerStore;
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeSet;

    fn t0() -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2026, 10, 18, 10, 0, 0)
            .single()
            .expect("local time")
    }

    fn aggregator(present: u32, absent: u32) -> PlateAggregator {
        aggregator_with(present, absent, IdentitySettings::default())
    }

    fn aggregator_with(present: u32, absent: u32, identity: IdentitySettings) -> PlateAggregator {
        let lot = Lot::start(&InMemoryLedgerStore::default(), t0()).unwrap();
        PlateAggregator::new(
            GateSettings {
                present_frames: present,
                absent_frames: absent,
            },
            identity,
            lot,
        )
    }

    /// Detections with a shared box; `x` moves the box.
    fn frame_at(tick: u64, x: f32, labels: &[&str]) -> Frame {
        let raw: Vec<RawDetection> = labels
            .iter()
            .map(|label| RawDetection::new(label, 0.9, [x, 10.0, x + 100.0, 110.0]))
            .collect();
        FrameAdapter::new(DetectorSettings::default()).build(
            tick,
            t0() + Duration::milliseconds(30 * tick as i64),
            &raw,
            None,
        )
    }

    fn frame(tick: u64, labels: &[&str]) -> Frame {
        frame_at(tick, 0.0, labels)
    }

    fn run(agg: &mut PlateAggregator, ticks: &[&[&str]]) -> Vec<Vec<Effect>> {
        ticks
            .iter()
            .enumerate()
            .map(|(i, labels)| agg.process_frame(&frame(i as u64, labels)))
            .collect()
    }

    fn commits(effects: &[Effect]) -> Vec<(PlateRecord, bool)> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Commit { record, supersedes } => Some((record.clone(), *supersedes)),
                _ => None,
            })
            .collect()
    }

    fn set(defects: &[DefectClass]) -> BTreeSet<DefectClass> {
        defects.iter().copied().collect()
    }

    #[test]
    fn clean_plate_commits_once_at_departure() {
        let mut agg = aggregator(2, 3);
        let per_tick = run(
            &mut agg,
            &[&[], &["heart"], &["heart"], &[], &["heart"], &[], &[], &[], &[], &[]],
        );
        let all: Vec<Effect> = per_tick.iter().flatten().cloned().collect();
        let committed = commits(&all);
        assert_eq!(committed.len(), 1);
        let (record, supersedes) = &committed[0];
        assert!(!supersedes);
        assert_eq!(record.sequence_no(), 1);
        assert_eq!(record.shape(), PlateShape::Heart);
        assert!(record.defects().is_empty());
        // Commit happens on the tick the absence gate closes.
        assert_eq!(commits(&per_tick[7]).len(), 1);
        assert!(per_tick[7].contains(&Effect::Status {
            sequence_no: 1,
            status: PlateStatus::Pass
        }));
        assert_eq!(agg.stats().passed, 1);
    }

    #[test]
    fn short_streak_never_commits() {
        let mut agg = aggregator(3, 2);
        let all: Vec<Effect> = run(&mut agg, &[&["heart"], &["heart"], &[], &[], &[], &[]])
            .into_iter()
            .flatten()
            .collect();
        assert!(all.is_empty());
        assert_eq!(agg.lot().next_sequence_no(), 1);
    }

    #[test]
    fn crack_scenario_commits_on_detection_tick() {
        let mut agg = aggregator(2, 3);
        let per_tick = run(
            &mut agg,
            &[
                &[],
                &["heart"],
                &["heart", "crack"],
                &["heart"],
                &[],
                &[],
                &[],
            ],
        );
        let all: Vec<Effect> = per_tick.iter().flatten().cloned().collect();
        let committed = commits(&all);
        assert_eq!(committed.len(), 1);
        assert_eq!(commits(&per_tick[2]).len(), 1);
        let (record, _) = &committed[0];
        assert_eq!(record.defects(), &set(&[DefectClass::Crack]));
        assert_eq!(record.shape(), PlateShape::Heart);
        assert!(per_tick[6].contains(&Effect::Departed {
            sequence_no: 1,
            reason: DepartureReason::Absent
        }));
        assert!(agg.session().is_none());
        assert_eq!(agg.stats().defective, 1);
        assert_eq!(agg.stats().total, 1);
    }

    #[test]
    fn growing_defects_supersede_with_same_sequence() {
        let mut agg = aggregator(1, 3);
        let per_tick = run(
            &mut agg,
            &[
                &["circle", "crack"],
                &["circle", "crack", "hole"],
                &["circle", "crack"],
                &["circle"],
                &[],
                &[],
                &[],
            ],
        );
        let all: Vec<Effect> = per_tick.iter().flatten().cloned().collect();
        let committed = commits(&all);
        assert_eq!(committed.len(), 2);
        assert!(!committed[0].1);
        assert!(committed[1].1);
        assert_eq!(committed[0].0.sequence_no(), committed[1].0.sequence_no());
        assert_eq!(
            committed[1].0.defects(),
            &set(&[DefectClass::Crack, DefectClass::Hole])
        );
        // Superseding records are not counted twice.
        assert_eq!(agg.stats().total, 1);
    }

    #[test]
    fn defect_status_never_returns_to_pass() {
        let mut agg = aggregator(1, 2);
        let all: Vec<Effect> = run(
            &mut agg,
            &[&["heart", "burn"], &["heart"], &["heart"], &[], &[]],
        )
        .into_iter()
        .flatten()
        .collect();
        let statuses: Vec<PlateStatus> = all
            .iter()
            .filter_map(|e| match e {
                Effect::Status { status, .. } => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![PlateStatus::Pending, PlateStatus::Defect { count: 1 }]
        );
    }

    #[test]
    fn defect_counts_never_decrease_within_session() {
        let mut agg = aggregator(1, 5);
        let ticks: &[&[&str]] = &[
            &["heart", "crack", "crack"],
            &["heart"],
            &["heart", "crack"],
            &[],
            &["heart", "hole"],
        ];
        let mut previous = 0;
        for (i, labels) in ticks.iter().enumerate() {
            agg.process_frame(&frame(i as u64, labels));
            let session = agg.session().expect("session open");
            let crack = session
                .defect_counts()
                .get(&DefectClass::Crack)
                .copied()
                .unwrap_or(0);
            assert!(crack >= previous);
            previous = crack;
            assert!(session.defect_seen());
        }
        assert_eq!(previous, 2);
    }

    #[test]
    fn majority_shape_is_committed() {
        let mut agg = aggregator(1, 1);
        let all: Vec<Effect> = run(&mut agg, &[&["heart"], &["heart"], &["circle"], &[]])
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(commits(&all)[0].0.shape(), PlateShape::Heart);

        let mut agg = aggregator(1, 1);
        let all: Vec<Effect> = run(&mut agg, &[&["heart"], &["circle"], &[]])
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(commits(&all)[0].0.shape(), PlateShape::Heart);
    }

    #[test]
    fn defect_only_plate_has_unknown_shape() {
        let mut agg = aggregator(1, 1);
        let all: Vec<Effect> = run(&mut agg, &[&["bulge"], &[]])
            .into_iter()
            .flatten()
            .collect();
        let committed = commits(&all);
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].0.shape(), PlateShape::Unknown);
    }

    #[test]
    fn back_to_back_plates_get_consecutive_sequence_numbers() {
        let mut agg = aggregator(1, 2);
        let all: Vec<Effect> = run(
            &mut agg,
            &[&["heart"], &[], &[], &["rectangle"], &[], &[]],
        )
        .into_iter()
        .flatten()
        .collect();
        let seqs: Vec<u32> = commits(&all).iter().map(|(r, _)| r.sequence_no()).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn replacement_closes_committed_plate_and_counts_new_one() {
        let identity = IdentitySettings {
            shape_change_iou: 0.15,
            shape_change_frames: 1,
            shape_move_dist_px: 50.0,
            shape_move_frames: 1,
            roi_change_mae: 10.0,
            roi_change_frames: 3,
        };
        let mut agg = aggregator_with(1, 2, identity);

        let first = agg.process_frame(&frame_at(0, 0.0, &["heart", "crack"]));
        assert_eq!(commits(&first).len(), 1);

        let swapped = agg.process_frame(&frame_at(1, 400.0, &["circle"]));
        assert!(swapped.contains(&Effect::Departed {
            sequence_no: 1,
            reason: DepartureReason::Replaced
        }));
        assert!(swapped.contains(&Effect::Arrived {
            sequence_no: 2,
            tick_id: 1
        }));
        assert!(commits(&swapped).is_empty());

        agg.process_frame(&frame_at(2, 400.0, &["circle"]));
        let mut rest = agg.process_frame(&frame_at(3, 400.0, &[]));
        rest.extend(agg.process_frame(&frame_at(4, 400.0, &[])));
        let committed = commits(&rest);
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].0.sequence_no(), 2);
        assert_eq!(committed[0].0.shape(), PlateShape::Circle);
        assert!(committed[0].0.defects().is_empty());
    }

    #[test]
    fn uncommitted_plate_is_never_replaced() {
        let identity = IdentitySettings {
            shape_change_iou: 0.15,
            shape_change_frames: 1,
            shape_move_dist_px: 50.0,
            shape_move_frames: 1,
            roi_change_mae: 10.0,
            roi_change_frames: 1,
        };
        let mut agg = aggregator_with(1, 2, identity);
        for tick in 0..5 {
            let effects = agg.process_frame(&frame_at(tick, tick as f32 * 400.0, &["heart"]));
            assert!(!effects
                .iter()
                .any(|e| matches!(e, Effect::Departed { .. })));
        }
        assert_eq!(agg.session().map(|s| s.sequence_no()), Some(1));
    }

    #[test]
    fn replaced_uncommitted_session_is_discarded() {
        let mut agg = aggregator(1, 5);
        agg.process_frame(&frame(0, &["heart"]));
        let mut effects = Vec::new();
        agg.close_session(t0(), DepartureReason::Replaced, &mut effects);
        assert!(commits(&effects).is_empty());
        assert_eq!(
            effects,
            vec![Effect::Departed {
                sequence_no: 1,
                reason: DepartureReason::Replaced
            }]
        );
        assert_eq!(agg.stats().total, 0);
    }

    #[test]
    fn close_discards_clean_uncommitted_plate() {
        let mut agg = aggregator(1, 5);
        agg.process_frame(&frame(0, &["heart"]));
        let effects = agg.close(t0());
        assert!(commits(&effects).is_empty());
        assert_eq!(
            effects,
            vec![Effect::Departed {
                sequence_no: 1,
                reason: DepartureReason::Shutdown
            }]
        );
        assert_eq!(agg.presence(), PresenceState::Idle);
    }

    #[test]
    fn start_lot_resets_stats_and_keeps_numbering() {
        let mut agg = aggregator(1, 1);
        run(&mut agg, &[&["heart"], &[]]);
        let next = agg
            .lot()
            .next(&InMemoryLedgerStore::default(), t0())
            .unwrap();
        let effects = agg.start_lot(next);
        assert_eq!(agg.lot().lot_id(), "PTP261018_02");
        assert_eq!(agg.stats().total, 0);
        assert!(matches!(effects.last(), Some(Effect::Stats(s)) if s.lot_id == "PTP261018_02"));

        let all: Vec<Effect> = run(&mut agg, &[&["heart"], &[]])
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(commits(&all)[0].0.sequence_no(), 2);
    }
}
