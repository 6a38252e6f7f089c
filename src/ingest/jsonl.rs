//! JSON-lines detector feed.
//!
//! One object per line:
//!
//! ```json
//! {"tick_id": 12, "captured_at": "2026-10-18T09:30:15+07:00",
//!  "detections": [{"class_label": "crack", "confidence": 0.41, "bbox": [10, 12, 80, 90]}],
//!  "gray": {"width": 4, "height": 1, "hex": "00ff00ff"}}
//! ```
//!
//! `tick_id`, `captured_at` and `gray` are optional. Lines that fail to parse
//! are skipped with a warning; they never stop the feed.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use serde::Deserialize;

use super::FrameSource;
use crate::frame::{Frame, FrameAdapter, GrayPatch, RawDetection};

#[derive(Debug, Deserialize)]
pub struct DetectorLine {
    #[serde(default)]
    pub tick_id: Option<u64>,
    #[serde(default)]
    pub captured_at: Option<DateTime<Local>>,
    #[serde(default)]
    pub detections: Vec<RawDetection>,
    /// Grayscale pixels for ROI texture comparison.
    #[serde(default)]
    pub gray: Option<GrayLine>,
}

#[derive(Debug, Deserialize)]
pub struct GrayLine {
    pub width: u32,
    pub height: u32,
    /// Row-major 8-bit pixels, hex encoded.
    pub hex: String,
}

impl GrayLine {
    fn decode(&self) -> Result<GrayPatch> {
        let pixels = hex::decode(self.hex.trim()).context("gray pixels not hex")?;
        GrayPatch::from_raw(self.width, self.height, pixels).ok_or_else(|| {
            anyhow!(
                "gray pixel count does not match {}x{}",
                self.width,
                self.height
            )
        })
    }
}

pub struct JsonlSource<R> {
    reader: R,
    adapter: FrameAdapter,
    last_tick: Option<u64>,
    line_no: u64,
    skipped: u64,
}

impl JsonlSource<BufReader<File>> {
    pub fn from_path(path: &Path, adapter: FrameAdapter) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("open detector feed {}", path.display()))?;
        Ok(Self::new(BufReader::new(file), adapter))
    }
}

impl<R: BufRead> JsonlSource<R> {
    pub fn new(reader: R, adapter: FrameAdapter) -> Self {
        Self {
            reader,
            adapter,
            last_tick: None,
            line_no: 0,
            skipped: 0,
        }
    }

    /// Lines dropped as unparseable.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn tick_for(&mut self, requested: Option<u64>) -> u64 {
        let next = self.last_tick.map(|t| t + 1).unwrap_or(0);
        let tick = match requested {
            Some(t) if self.last_tick.map_or(true, |last| t > last) => t,
            Some(t) => {
                log::warn!(
                    "line {}: tick {} not after {}, using {}",
                    self.line_no,
                    t,
                    self.last_tick.unwrap_or_default(),
                    next
                );
                next
            }
            None => next,
        };
        self.last_tick = Some(tick);
        tick
    }
}

impl<R: BufRead> FrameSource for JsonlSource<R> {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self
                .reader
                .read_line(&mut line)
                .context("read detector feed")?;
            if read == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }

            let parsed: DetectorLine = match serde_json::from_str(line.trim()) {
                Ok(parsed) => parsed,
                Err(err) => {
                    self.skipped += 1;
                    log::warn!("line {}: skipping detector line: {}", self.line_no, err);
                    continue;
                }
            };
            let gray = match parsed.gray.as_ref().map(GrayLine::decode).transpose() {
                Ok(gray) => gray,
                Err(err) => {
                    log::warn!("line {}: ignoring gray frame: {:#}", self.line_no, err);
                    None
                }
            };
            let tick_id = self.tick_for(parsed.tick_id);
            let captured_at = parsed.captured_at.unwrap_or_else(Local::now);
            return Ok(Some(self.adapter.build(
                tick_id,
                captured_at,
                &parsed.detections,
                gray,
            )));
        }
    }
}
