//! Identity tracker.
//!
//! Detects a plate being swapped for another one while the detector never
//! reported a clean absence (fast hand-offs). Three consecutive-tick streaks
//! are kept against the dominant shape box:
//!
//! - IoU with the previous box below `shape_change_iou`
//! - centroid displacement above `shape_move_dist_px`
//! - ROI texture MAE above `roi_change_mae`
//!
//! Any streak reaching its threshold signals a replacement, but only for a
//! session that has already committed its record. An uncommitted plate is
//! still being evaluated and its accumulation must not be discarded.

use crate::change::{centroid_distance, iou, texture_delta, texture_signature};
use crate::config::IdentitySettings;
use crate::frame::{GrayPatch, Rect};
use crate::session::PlateSession;

#[derive(Clone, Debug)]
pub struct IdentityTracker {
    settings: IdentitySettings,
    shape_change_frames: u32,
    shape_move_frames: u32,
    roi_change_frames: u32,
}

impl IdentityTracker {
    pub fn new(settings: IdentitySettings) -> Self {
        Self {
            settings,
            shape_change_frames: 0,
            shape_move_frames: 0,
            roi_change_frames: 0,
        }
    }

    pub fn streaks(&self) -> (u32, u32, u32) {
        (
            self.shape_change_frames,
            self.shape_move_frames,
            self.roi_change_frames,
        )
    }

    pub fn reset(&mut self) {
        self.shape_change_frames = 0;
        self.shape_move_frames = 0;
        self.roi_change_frames = 0;
    }

    /// Updates the streaks for one tick. Returns true when a new object has
    /// replaced the committed one.
    pub fn observe(
        &mut self,
        session: &mut PlateSession,
        dominant: Option<Rect>,
        roi: Option<GrayPatch>,
    ) -> bool {
        let Some(bbox) = dominant else {
            self.reset();
            return false;
        };

        if let Some(last) = session.last_bbox {
            bump(
                &mut self.shape_change_frames,
                iou(bbox, last) < self.settings.shape_change_iou,
            );
            bump(
                &mut self.shape_move_frames,
                centroid_distance(bbox, last) > self.settings.shape_move_dist_px,
            );
        }
        session.last_bbox = Some(bbox);

        match roi.as_ref().and_then(texture_signature) {
            Some(texture) => {
                if let Some(prev) = &session.prev_roi_texture {
                    bump(
                        &mut self.roi_change_frames,
                        texture_delta(&texture, prev) > self.settings.roi_change_mae,
                    );
                }
                session.prev_roi_texture = Some(texture);
            }
            None => self.roi_change_frames = 0,
        }

        session.committed && self.triggered()
    }

    fn triggered(&self) -> bool {
        self.shape_change_frames >= self.settings.shape_change_frames
            || self.shape_move_frames >= self.settings.shape_move_frames
            || self.roi_change_frames >= self.settings.roi_change_frames
    }
}

fn bump(streak: &mut u32, changed: bool) {
    if changed {
        *streak += 1;
    } else {
        *streak = 0;
    }
}
