//! Detection frames.
//!
//! The detector is an external collaborator. Once per tick it hands over an
//! unordered list of `(class_label, confidence, bbox)` tuples; this module is
//! the boundary where that loosely-typed output becomes a [`Frame`]:
//!
//! - Labels are mapped once, totally, into [`DetectionKind`].
//! - Per-family confidence thresholds are applied (shape vs. defect).
//! - Overlapping shape boxes are reduced with class-agnostic NMS.
//! - Malformed detections are dropped here and never propagate as errors.
//!
//! Everything downstream matches on the typed kinds and never string-compares.

use std::collections::BTreeMap;

use chrono::{DateTime, Local};
use image::imageops::{self, FilterType};
use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::change::iou;
use crate::config::DetectorSettings;

// -------------------- Geometry --------------------

/// Axis-aligned box in pixel coordinates, `(x1, y1)` top-left, `(x2, y2)` bottom-right.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Rect {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn is_finite(&self) -> bool {
        self.x1.is_finite() && self.y1.is_finite() && self.x2.is_finite() && self.y2.is_finite()
    }

    /// Finite coordinates and strictly positive area.
    pub fn is_well_formed(&self) -> bool {
        self.is_finite() && self.x2 > self.x1 && self.y2 > self.y1
    }
}

/// Grayscale pixel patch (a whole frame or a region of interest).
#[derive(Clone, Debug, PartialEq)]
pub struct GrayPatch {
    image: GrayImage,
}

impl GrayPatch {
    /// Wraps row-major 8-bit luma pixels. Returns `None` when the buffer size
    /// does not match the dimensions.
    pub fn from_raw(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        GrayImage::from_raw(width, height, pixels).map(|image| Self { image })
    }

    pub fn from_image(image: GrayImage) -> Self {
        Self { image }
    }

    /// Uniform patch, mostly useful for tests and synthetic feeds.
    pub fn filled(width: u32, height: u32, value: u8) -> Self {
        Self {
            image: GrayImage::from_pixel(width, height, image::Luma([value])),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }

    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    /// Crops the region under `rect`, clamped to the patch bounds.
    pub fn crop(&self, rect: Rect) -> Option<GrayPatch> {
        if !rect.is_finite() || self.is_empty() {
            return None;
        }
        let max_x = self.width() as f32;
        let max_y = self.height() as f32;
        let x1 = rect.x1.clamp(0.0, max_x) as u32;
        let y1 = rect.y1.clamp(0.0, max_y) as u32;
        let x2 = rect.x2.clamp(0.0, max_x) as u32;
        let y2 = rect.y2.clamp(0.0, max_y) as u32;
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        let view = imageops::crop_imm(&self.image, x1, y1, x2 - x1, y2 - y1);
        Some(GrayPatch {
            image: view.to_image(),
        })
    }

    /// Bilinear resize; returns a clone when the size already matches.
    pub fn resized(&self, width: u32, height: u32) -> GrayPatch {
        if self.width() == width && self.height() == height {
            return self.clone();
        }
        GrayPatch {
            image: imageops::resize(&self.image, width, height, FilterType::Triangle),
        }
    }
}

// -------------------- Classes --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeClass {
    Heart,
    Rectangle,
    Circle,
}

impl ShapeClass {
    pub const ALL: [ShapeClass; 3] = [ShapeClass::Heart, ShapeClass::Rectangle, ShapeClass::Circle];

    pub fn as_str(self) -> &'static str {
        match self {
            ShapeClass::Heart => "heart",
            ShapeClass::Rectangle => "rectangle",
            ShapeClass::Circle => "circle",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefectClass {
    Crack,
    Hole,
    Bulge,
    Burn,
}

impl DefectClass {
    pub const ALL: [DefectClass; 4] = [
        DefectClass::Crack,
        DefectClass::Hole,
        DefectClass::Bulge,
        DefectClass::Burn,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DefectClass::Crack => "crack",
            DefectClass::Hole => "hole",
            DefectClass::Bulge => "bulge",
            DefectClass::Burn => "burn",
        }
    }
}

/// Shape carried by a committed record; `Unknown` when a plate was counted
/// from defect detections alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlateShape {
    Heart,
    Rectangle,
    Circle,
    Unknown,
}

impl PlateShape {
    pub fn as_str(self) -> &'static str {
        match self {
            PlateShape::Heart => "heart",
            PlateShape::Rectangle => "rectangle",
            PlateShape::Circle => "circle",
            PlateShape::Unknown => "unknown",
        }
    }
}

impl From<ShapeClass> for PlateShape {
    fn from(shape: ShapeClass) -> Self {
        match shape {
            ShapeClass::Heart => PlateShape::Heart,
            ShapeClass::Rectangle => PlateShape::Rectangle,
            ShapeClass::Circle => PlateShape::Circle,
        }
    }
}

impl From<Option<ShapeClass>> for PlateShape {
    fn from(shape: Option<ShapeClass>) -> Self {
        shape.map(PlateShape::from).unwrap_or(PlateShape::Unknown)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DetectionKind {
    Shape(ShapeClass),
    Defect(DefectClass),
    Unknown,
}

impl DetectionKind {
    /// Total mapping from detector label strings.
    ///
    /// Accepts both the training-set class names and their short forms.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "heart_shaped_leaf_plate" | "heart" => DetectionKind::Shape(ShapeClass::Heart),
            "rectangular_leaf_plate" | "rectangle" => DetectionKind::Shape(ShapeClass::Rectangle),
            "circle_leaf_plate" | "circle" => DetectionKind::Shape(ShapeClass::Circle),
            "crack" => DetectionKind::Defect(DefectClass::Crack),
            "hole" => DetectionKind::Defect(DefectClass::Hole),
            "bulge" => DetectionKind::Defect(DefectClass::Bulge),
            "burn" => DetectionKind::Defect(DefectClass::Burn),
            _ => DetectionKind::Unknown,
        }
    }
}

// -------------------- Detections & frames --------------------

/// Detection as it arrives from the detector boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub class_label: String,
    pub confidence: f32,
    /// `(x1, y1, x2, y2)`
    pub bbox: [f32; 4],
}

impl RawDetection {
    pub fn new(class_label: &str, confidence: f32, bbox: [f32; 4]) -> Self {
        Self {
            class_label: class_label.to_string(),
            confidence,
            bbox,
        }
    }
}

/// Typed detection. Ephemeral: produced fresh every tick, never stored.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub kind: DetectionKind,
    pub confidence: f32,
    pub bbox: Rect,
}

/// All detections for one tick.
#[derive(Clone, Debug)]
pub struct Frame {
    pub tick_id: u64,
    pub captured_at: DateTime<Local>,
    pub detections: Vec<Detection>,
    /// Grayscale camera frame, when the feed provides pixels. Used only for
    /// ROI texture comparison.
    pub gray: Option<GrayPatch>,
}

impl Frame {
    /// Frame with no detections (a transient input gap).
    pub fn empty(tick_id: u64, captured_at: DateTime<Local>) -> Self {
        Self {
            tick_id,
            captured_at,
            detections: Vec::new(),
            gray: None,
        }
    }

    /// True when at least one shape or defect survived the adapter.
    pub fn plate_detected(&self) -> bool {
        self.detections
            .iter()
            .any(|d| !matches!(d.kind, DetectionKind::Unknown))
    }

    /// Highest-confidence shape box.
    pub fn dominant_shape(&self) -> Option<&Detection> {
        self.detections
            .iter()
            .filter(|d| matches!(d.kind, DetectionKind::Shape(_)))
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }

    /// Distinct shape classes seen this tick, strongest first.
    pub fn shape_classes(&self) -> Vec<ShapeClass> {
        let mut shapes: Vec<&Detection> = self
            .detections
            .iter()
            .filter(|d| matches!(d.kind, DetectionKind::Shape(_)))
            .collect();
        shapes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let mut out = Vec::new();
        for det in shapes {
            if let DetectionKind::Shape(shape) = det.kind {
                if !out.contains(&shape) {
                    out.push(shape);
                }
            }
        }
        out
    }

    /// Number of boxes per defect class this tick.
    pub fn defect_counts(&self) -> BTreeMap<DefectClass, u32> {
        let mut counts = BTreeMap::new();
        for det in &self.detections {
            if let DetectionKind::Defect(defect) = det.kind {
                *counts.entry(defect).or_insert(0) += 1;
            }
        }
        counts
    }

    /// ROI under the dominant shape box, if pixels are available.
    pub fn dominant_roi(&self) -> Option<GrayPatch> {
        let bbox = self.dominant_shape()?.bbox;
        self.gray.as_ref()?.crop(bbox)
    }
}

// -------------------- Adapter --------------------

/// Turns raw detector output into a [`Frame`].
#[derive(Clone, Debug)]
pub struct FrameAdapter {
    settings: DetectorSettings,
}

impl FrameAdapter {
    pub fn new(settings: DetectorSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &DetectorSettings {
        &self.settings
    }

    pub fn build(
        &self,
        tick_id: u64,
        captured_at: DateTime<Local>,
        raw: &[RawDetection],
        gray: Option<GrayPatch>,
    ) -> Frame {
        let mut shapes = Vec::new();
        let mut defects = Vec::new();

        for det in raw {
            let Some(det) = self.accept(tick_id, det) else {
                continue;
            };
            match det.kind {
                DetectionKind::Shape(_) => shapes.push(det),
                DetectionKind::Defect(_) => defects.push(det),
                DetectionKind::Unknown => {}
            }
        }

        let mut detections = suppress_overlapping(shapes, self.settings.shape_nms_iou);
        detections.extend(defects);

        Frame {
            tick_id,
            captured_at,
            detections,
            gray: gray.filter(|g| !g.is_empty()),
        }
    }

    fn accept(&self, tick_id: u64, raw: &RawDetection) -> Option<Detection> {
        let kind = DetectionKind::from_label(&raw.class_label);
        if kind == DetectionKind::Unknown {
            log::debug!(
                "tick {}: dropping detection with unknown label '{}'",
                tick_id,
                raw.class_label
            );
            return None;
        }
        if !raw.confidence.is_finite() || !(0.0..=1.0).contains(&raw.confidence) {
            log::debug!(
                "tick {}: dropping '{}' with out-of-range confidence {}",
                tick_id,
                raw.class_label,
                raw.confidence
            );
            return None;
        }
        let [x1, y1, x2, y2] = raw.bbox;
        let bbox = Rect::new(x1, y1, x2, y2);
        if !bbox.is_well_formed() {
            log::debug!(
                "tick {}: dropping '{}' with malformed bbox {:?}",
                tick_id,
                raw.class_label,
                raw.bbox
            );
            return None;
        }
        let floor = match kind {
            DetectionKind::Shape(_) => self.settings.shape_confidence,
            DetectionKind::Defect(_) => self.settings.defect_confidence,
            DetectionKind::Unknown => return None,
        };
        if raw.confidence < floor {
            return None;
        }
        Some(Detection {
            kind,
            confidence: raw.confidence,
            bbox,
        })
    }
}

/// Greedy class-agnostic NMS: keeps the strongest box of every overlapping group.
fn suppress_overlapping(mut dets: Vec<Detection>, iou_thresh: f32) -> Vec<Detection> {
    dets.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(dets.len());
    for det in dets {
        if kept.iter().all(|k| iou(det.bbox, k.bbox) < iou_thresh) {
            kept.push(det);
        }
    }
    kept
}
