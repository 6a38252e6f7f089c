//! In-flight plate state and the attribute aggregator.
//!
//! A [`PlateSession`] exists only while the debouncer reports the lane as
//! present. It latches what has been seen on the plate:
//!
//! - per-defect running maximum of boxes seen in a single tick (never decreases)
//! - a sticky `defect_seen` flag driving the pass/defect status
//! - per-shape tick votes, with ties resolved by the first class to reach the max

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Local};

use crate::frame::{DefectClass, Frame, GrayPatch, PlateShape, Rect, ShapeClass};

#[derive(Clone, Debug)]
pub struct PlateSession {
    sequence_no: u32,
    opened_at: DateTime<Local>,
    present_frames: u32,
    absent_frames: u32,
    defect_counts: BTreeMap<DefectClass, u32>,
    shape_votes: BTreeMap<ShapeClass, u32>,
    shape_leader: Option<(ShapeClass, u32)>,
    defect_seen: bool,
    pub(crate) last_bbox: Option<Rect>,
    pub(crate) prev_roi_texture: Option<GrayPatch>,
    pub(crate) committed: bool,
    /// Defect set carried by the last emitted record.
    pub(crate) emitted_defects: BTreeSet<DefectClass>,
}

/// What a single tick changed in the session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AbsorbOutcome {
    /// `defect_seen` went from false to true on this tick.
    pub defect_flag_raised: bool,
    /// The latched defect total increased on this tick.
    pub defect_total_grew: bool,
}

impl PlateSession {
    pub fn open(sequence_no: u32, opened_at: DateTime<Local>) -> Self {
        Self {
            sequence_no,
            opened_at,
            present_frames: 0,
            absent_frames: 0,
            defect_counts: BTreeMap::new(),
            shape_votes: BTreeMap::new(),
            shape_leader: None,
            defect_seen: false,
            last_bbox: None,
            prev_roi_texture: None,
            committed: false,
            emitted_defects: BTreeSet::new(),
        }
    }

    pub fn sequence_no(&self) -> u32 {
        self.sequence_no
    }

    pub fn opened_at(&self) -> DateTime<Local> {
        self.opened_at
    }

    /// Ticks with a detection since the session opened.
    pub fn present_frames(&self) -> u32 {
        self.present_frames
    }

    /// Current run of ticks without a detection.
    pub fn absent_frames(&self) -> u32 {
        self.absent_frames
    }

    pub fn defect_counts(&self) -> &BTreeMap<DefectClass, u32> {
        &self.defect_counts
    }

    pub fn shape_votes(&self) -> &BTreeMap<ShapeClass, u32> {
        &self.shape_votes
    }

    pub fn last_bbox(&self) -> Option<Rect> {
        self.last_bbox
    }

    pub fn defect_seen(&self) -> bool {
        self.defect_seen
    }

    pub fn committed(&self) -> bool {
        self.committed
    }

    /// Voted shape, `Unknown` when no shape was ever observed.
    pub fn shape(&self) -> PlateShape {
        PlateShape::from(self.shape_leader.map(|(shape, _)| shape))
    }

    /// Defect classes latched so far.
    pub fn latched_defects(&self) -> BTreeSet<DefectClass> {
        self.defect_counts
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(defect, _)| *defect)
            .collect()
    }

    /// Sum of latched per-class counts.
    pub fn defect_total(&self) -> u32 {
        self.defect_counts.values().sum()
    }

    /// Records a tick without detections.
    pub fn note_absent(&mut self) {
        self.absent_frames += 1;
    }

    /// Folds one tick's detections into the session.
    pub fn absorb(&mut self, frame: &Frame) -> AbsorbOutcome {
        let mut outcome = AbsorbOutcome::default();
        if !frame.plate_detected() {
            self.note_absent();
            return outcome;
        }
        self.present_frames += 1;
        self.absent_frames = 0;

        let total_before = self.defect_total();
        for (defect, observed) in frame.defect_counts() {
            let latched = self.defect_counts.entry(defect).or_insert(0);
            *latched = (*latched).max(observed);
        }
        outcome.defect_total_grew = self.defect_total() > total_before;

        if !self.defect_seen && self.defect_total() > 0 {
            self.defect_seen = true;
            outcome.defect_flag_raised = true;
        }

        for shape in frame.shape_classes() {
            self.vote(shape);
        }
        outcome
    }

    fn vote(&mut self, shape: ShapeClass) {
        let votes = self.shape_votes.entry(shape).or_insert(0);
        *votes += 1;
        let votes = *votes;
        match self.shape_leader {
            Some((_, best)) if votes <= best => {}
            _ => self.shape_leader = Some((shape, votes)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorSettings;
    use crate::frame::{FrameAdapter, RawDetection};

    fn frame(tick: u64, labels: &[&str]) -> Frame {
        let raw: Vec<RawDetection> = labels
            .iter()
            .enumerate()
            .map(|(i, label)| {
                let x = i as f32 * 200.0;
                RawDetection::new(label, 0.9, [x, 0.0, x + 100.0, 100.0])
            })
            .collect();
        FrameAdapter::new(DetectorSettings::default()).build(tick, Local::now(), &raw, None)
    }

    #[test]
    fn majority_shape_wins() {
        let mut session = PlateSession::open(1, Local::now());
        session.absorb(&frame(1, &["heart"]));
        session.absorb(&frame(2, &["heart"]));
        session.absorb(&frame(3, &["circle"]));
        assert_eq!(session.shape(), PlateShape::Heart);
    }

    #[test]
    fn tie_goes_to_first_class_to_reach_max() {
        let mut session = PlateSession::open(1, Local::now());
        session.absorb(&frame(1, &["heart"]));
        session.absorb(&frame(2, &["circle"]));
        assert_eq!(session.shape(), PlateShape::Heart);

        session.absorb(&frame(3, &["circle"]));
        assert_eq!(session.shape(), PlateShape::Circle);
        session.absorb(&frame(4, &["heart"]));
        assert_eq!(session.shape(), PlateShape::Circle);
    }

    #[test]
    fn defect_only_plate_has_unknown_shape() {
        let mut session = PlateSession::open(1, Local::now());
        session.absorb(&frame(1, &["crack"]));
        assert_eq!(session.shape(), PlateShape::Unknown);
    }

    #[test]
    fn defect_counts_are_running_maximum() {
        let mut session = PlateSession::open(1, Local::now());
        session.absorb(&frame(1, &["crack", "crack"]));
        session.absorb(&frame(2, &["crack"]));
        session.absorb(&frame(3, &["heart"]));
        assert_eq!(session.defect_counts().get(&DefectClass::Crack), Some(&2));

        let grew = session.absorb(&frame(4, &["crack", "crack", "crack"]));
        assert!(grew.defect_total_grew);
        assert_eq!(session.defect_counts().get(&DefectClass::Crack), Some(&3));
    }

    #[test]
    fn defect_flag_is_sticky() {
        let mut session = PlateSession::open(1, Local::now());
        assert!(!session.absorb(&frame(1, &["heart"])).defect_flag_raised);
        assert!(session.absorb(&frame(2, &["hole"])).defect_flag_raised);
        assert!(!session.absorb(&frame(3, &["hole"])).defect_flag_raised);
        session.absorb(&frame(4, &["heart"]));
        session.absorb(&frame(5, &[]));
        assert!(session.defect_seen());
        assert_eq!(
            session.latched_defects().into_iter().collect::<Vec<_>>(),
            vec![DefectClass::Hole]
        );
    }

    #[test]
    fn absent_ticks_are_counted() {
        let mut session = PlateSession::open(1, Local::now());
        session.absorb(&frame(1, &["heart"]));
        session.absorb(&frame(2, &[]));
        session.absorb(&frame(3, &[]));
        assert_eq!(session.present_frames(), 1);
        assert_eq!(session.absent_frames(), 2);
        session.absorb(&frame(4, &["heart"]));
        assert_eq!(session.absent_frames(), 0);
    }
}
