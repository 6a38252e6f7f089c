//! Presence debouncer.
//!
//! Two-counter hysteresis turning per-tick "plate detected" booleans into
//! stable arrival/departure transitions. The exit gate is normally longer
//! than the entry gate: momentary detector dropouts are more common than
//! phantom detections, and a short exit gate would split one plate into
//! several records.

use crate::config::GateSettings;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresenceState {
    Idle,
    Present,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Steady,
    Arrived,
    Departed,
}

#[derive(Clone, Debug)]
pub struct PresenceDebouncer {
    settings: GateSettings,
    state: PresenceState,
    present_frames: u32,
    absent_frames: u32,
}

impl PresenceDebouncer {
    pub fn new(settings: GateSettings) -> Self {
        Self {
            settings,
            state: PresenceState::Idle,
            present_frames: 0,
            absent_frames: 0,
        }
    }

    pub fn state(&self) -> PresenceState {
        self.state
    }

    /// Current consecutive-detection streak while idle.
    pub fn present_frames(&self) -> u32 {
        self.present_frames
    }

    /// Current consecutive-miss streak while present.
    pub fn absent_frames(&self) -> u32 {
        self.absent_frames
    }

    /// Feeds one tick.
    pub fn observe(&mut self, detected: bool) -> Transition {
        match self.state {
            PresenceState::Idle => {
                if detected {
                    self.present_frames += 1;
                    self.absent_frames = 0;
                } else {
                    self.present_frames = 0;
                }
                if self.present_frames >= self.settings.present_frames {
                    self.state = PresenceState::Present;
                    self.present_frames = 0;
                    self.absent_frames = 0;
                    return Transition::Arrived;
                }
            }
            PresenceState::Present => {
                if detected {
                    self.absent_frames = 0;
                } else {
                    self.absent_frames += 1;
                }
                if self.absent_frames >= self.settings.absent_frames {
                    self.state = PresenceState::Idle;
                    self.present_frames = 0;
                    self.absent_frames = 0;
                    return Transition::Departed;
                }
            }
        }
        Transition::Steady
    }

    /// Back to `Idle` with cleared streaks, without reporting a departure.
    pub fn reset(&mut self) {
        self.state = PresenceState::Idle;
        self.present_frames = 0;
        self.absent_frames = 0;
    }
}
