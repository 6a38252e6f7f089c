//! Frame sources for the tick loop.
//!
//! A source hands the loop one [`Frame`] per tick until it is exhausted.
//! Sources:
//! - JSON-lines detector feed (file or stdin)
//! - Scripted in-memory frames (testing, replays)
//!
//! Tick ids handed out by a source are strictly increasing. [`FrameFeed`]
//! moves any source onto a reader thread.

pub mod feed;
pub mod jsonl;

use std::collections::VecDeque;

use anyhow::Result;

use crate::frame::Frame;

pub use feed::{FeedPoll, FrameFeed};
pub use jsonl::{DetectorLine, GrayLine, JsonlSource};

pub trait FrameSource {
    /// Next frame, or `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Replays a fixed list of frames.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    frames: VecDeque<Frame>,
}

impl ScriptedSource {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames: frames.into(),
        }
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push_back(frame);
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for ScriptedSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        Ok(self.frames.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;

    #[test]
    fn scripted_source_drains_in_order() {
        let now = Local::now();
        let mut source = ScriptedSource::new(vec![Frame::empty(1, now), Frame::empty(2, now)]);
        source.push(Frame::empty(3, now));
        let mut ticks = Vec::new();
        while let Some(frame) = source.next_frame().unwrap() {
            ticks.push(frame.tick_id);
        }
        assert_eq!(ticks, vec![1, 2, 3]);
        assert_eq!(source.remaining(), 0);
    }
}
