use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DB_PATH: &str = "plate_ledger.db";
const DEFAULT_SAVE_ROOT: &str = "savefile";
const DEFAULT_GATE_PRESENT_FRAMES: u32 = 1;
const DEFAULT_GATE_ABSENT_FRAMES: u32 = 2;
const DEFAULT_SHAPE_CHANGE_IOU: f32 = 0.15;
const DEFAULT_SHAPE_CHANGE_FRAMES: u32 = 5;
const DEFAULT_SHAPE_MOVE_DIST_PX: f32 = 20.0;
const DEFAULT_SHAPE_MOVE_FRAMES: u32 = 3;
const DEFAULT_ROI_CHANGE_MAE: f32 = 10.0;
const DEFAULT_ROI_CHANGE_FRAMES: u32 = 3;
const DEFAULT_SHAPE_CONFIDENCE: f32 = 0.58;
const DEFAULT_DEFECT_CONFIDENCE: f32 = 0.27;
const DEFAULT_SHAPE_NMS_IOU: f32 = 0.60;
const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_REMOTE_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_REMOTE_DRAIN_SECS: u64 = 10;
const DEFAULT_REMOTE_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Deserialize, Default)]
struct InspectorConfigFile {
    db_path: Option<String>,
    save_root: Option<PathBuf>,
    gate: Option<GateConfigFile>,
    identity: Option<IdentityConfigFile>,
    detector: Option<DetectorConfigFile>,
    remote: Option<RemoteConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct GateConfigFile {
    present_frames: Option<u32>,
    absent_frames: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct IdentityConfigFile {
    shape_change_iou: Option<f32>,
    shape_change_frames: Option<u32>,
    shape_move_dist_px: Option<f32>,
    shape_move_frames: Option<u32>,
    roi_change_mae: Option<f32>,
    roi_change_frames: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    shape_confidence: Option<f32>,
    defect_confidence: Option<f32>,
    shape_nms_iou: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct RemoteConfigFile {
    base_url: Option<String>,
    auth_token: Option<String>,
    timeout_secs: Option<u64>,
    max_attempts: Option<u32>,
    queue_capacity: Option<usize>,
    drain_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct InspectorConfig {
    pub db_path: String,
    pub save_root: PathBuf,
    pub gate: GateSettings,
    pub identity: IdentitySettings,
    pub detector: DetectorSettings,
    /// `None` disables the remote mirror.
    pub remote: Option<RemoteSettings>,
}

/// Presence debouncer thresholds, in ticks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateSettings {
    pub present_frames: u32,
    pub absent_frames: u32,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            present_frames: DEFAULT_GATE_PRESENT_FRAMES,
            absent_frames: DEFAULT_GATE_ABSENT_FRAMES,
        }
    }
}

/// Identity tracker thresholds. Streak thresholds are in ticks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdentitySettings {
    pub shape_change_iou: f32,
    pub shape_change_frames: u32,
    pub shape_move_dist_px: f32,
    pub shape_move_frames: u32,
    pub roi_change_mae: f32,
    pub roi_change_frames: u32,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            shape_change_iou: DEFAULT_SHAPE_CHANGE_IOU,
            shape_change_frames: DEFAULT_SHAPE_CHANGE_FRAMES,
            shape_move_dist_px: DEFAULT_SHAPE_MOVE_DIST_PX,
            shape_move_frames: DEFAULT_SHAPE_MOVE_FRAMES,
            roi_change_mae: DEFAULT_ROI_CHANGE_MAE,
            roi_change_frames: DEFAULT_ROI_CHANGE_FRAMES,
        }
    }
}

/// Detector-boundary filtering applied when building frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorSettings {
    pub shape_confidence: f32,
    pub defect_confidence: f32,
    pub shape_nms_iou: f32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            shape_confidence: DEFAULT_SHAPE_CONFIDENCE,
            defect_confidence: DEFAULT_DEFECT_CONFIDENCE,
            shape_nms_iou: DEFAULT_SHAPE_NMS_IOU,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSettings {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub queue_capacity: usize,
    /// How long shutdown keeps delivering queued jobs before dropping the rest.
    pub drain_timeout: Duration,
}

impl RemoteSettings {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: None,
            timeout: Duration::from_secs(DEFAULT_REMOTE_TIMEOUT_SECS),
            max_attempts: DEFAULT_REMOTE_MAX_ATTEMPTS,
            queue_capacity: DEFAULT_REMOTE_QUEUE_CAPACITY,
            drain_timeout: Duration::from_secs(DEFAULT_REMOTE_DRAIN_SECS),
        }
    }
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            save_root: PathBuf::from(DEFAULT_SAVE_ROOT),
            gate: GateSettings::default(),
            identity: IdentitySettings::default(),
            detector: DetectorSettings::default(),
            remote: None,
        }
    }
}

impl InspectorConfig {
    /// Loads from the file named by `PLATE_CONFIG` (if set), then applies env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PLATE_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: InspectorConfigFile) -> Self {
        let gate_file = file.gate.unwrap_or_default();
        let identity_file = file.identity.unwrap_or_default();
        let detector_file = file.detector.unwrap_or_default();

        let gate = GateSettings {
            present_frames: gate_file
                .present_frames
                .unwrap_or(DEFAULT_GATE_PRESENT_FRAMES),
            absent_frames: gate_file
                .absent_frames
                .unwrap_or(DEFAULT_GATE_ABSENT_FRAMES),
        };
        let identity = IdentitySettings {
            shape_change_iou: identity_file
                .shape_change_iou
                .unwrap_or(DEFAULT_SHAPE_CHANGE_IOU),
            shape_change_frames: identity_file
                .shape_change_frames
                .unwrap_or(DEFAULT_SHAPE_CHANGE_FRAMES),
            shape_move_dist_px: identity_file
                .shape_move_dist_px
                .unwrap_or(DEFAULT_SHAPE_MOVE_DIST_PX),
            shape_move_frames: identity_file
                .shape_move_frames
                .unwrap_or(DEFAULT_SHAPE_MOVE_FRAMES),
            roi_change_mae: identity_file
                .roi_change_mae
                .unwrap_or(DEFAULT_ROI_CHANGE_MAE),
            roi_change_frames: identity_file
                .roi_change_frames
                .unwrap_or(DEFAULT_ROI_CHANGE_FRAMES),
        };
        let detector = DetectorSettings {
            shape_confidence: detector_file
                .shape_confidence
                .unwrap_or(DEFAULT_SHAPE_CONFIDENCE),
            defect_confidence: detector_file
                .defect_confidence
                .unwrap_or(DEFAULT_DEFECT_CONFIDENCE),
            shape_nms_iou: detector_file
                .shape_nms_iou
                .unwrap_or(DEFAULT_SHAPE_NMS_IOU),
        };
        let remote = file.remote.and_then(|remote| {
            let base_url = remote.base_url?;
            let mut settings = RemoteSettings::new(&base_url);
            settings.auth_token = remote.auth_token;
            if let Some(secs) = remote.timeout_secs {
                settings.timeout = Duration::from_secs(secs);
            }
            if let Some(attempts) = remote.max_attempts {
                settings.max_attempts = attempts;
            }
            if let Some(capacity) = remote.queue_capacity {
                settings.queue_capacity = capacity;
            }
            if let Some(secs) = remote.drain_secs {
                settings.drain_timeout = Duration::from_secs(secs);
            }
            Some(settings)
        });

        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            save_root: file
                .save_root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SAVE_ROOT)),
            gate,
            identity,
            detector,
            remote,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("PLATE_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(root) = std::env::var("PLATE_SAVE_ROOT") {
            if !root.trim().is_empty() {
                self.save_root = PathBuf::from(root);
            }
        }
        if let Ok(frames) = std::env::var("PLATE_GATE_PRESENT") {
            self.gate.present_frames = frames
                .trim()
                .parse()
                .map_err(|_| anyhow!("PLATE_GATE_PRESENT must be an integer number of ticks"))?;
        }
        if let Ok(frames) = std::env::var("PLATE_GATE_ABSENT") {
            self.gate.absent_frames = frames
                .trim()
                .parse()
                .map_err(|_| anyhow!("PLATE_GATE_ABSENT must be an integer number of ticks"))?;
        }
        if let Ok(url) = std::env::var("PLATE_REMOTE_URL") {
            if !url.trim().is_empty() {
                let base_url = url.trim().trim_end_matches('/').to_string();
                match self.remote.as_mut() {
                    Some(existing) => existing.base_url = base_url,
                    None => self.remote = Some(RemoteSettings::new(&base_url)),
                }
            }
        }
        if let Ok(token) = std::env::var("PLATE_REMOTE_TOKEN") {
            if !token.trim().is_empty() {
                if let Some(remote) = self.remote.as_mut() {
                    remote.auth_token = Some(token.trim().to_string());
                }
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.gate.present_frames == 0 {
            return Err(anyhow!("gate.present_frames must be at least 1"));
        }
        if self.gate.absent_frames == 0 {
            return Err(anyhow!("gate.absent_frames must be at least 1"));
        }
        if self.gate.absent_frames < self.gate.present_frames {
            log::warn!(
                "gate.absent_frames ({}) is shorter than gate.present_frames ({}); brief dropouts will split plates",
                self.gate.absent_frames,
                self.gate.present_frames
            );
        }
        let id = &self.identity;
        if id.shape_change_frames == 0 || id.shape_move_frames == 0 || id.roi_change_frames == 0 {
            return Err(anyhow!("identity streak thresholds must be at least 1"));
        }
        check_unit("identity.shape_change_iou", id.shape_change_iou)?;
        if !id.shape_move_dist_px.is_finite() || id.shape_move_dist_px < 0.0 {
            return Err(anyhow!("identity.shape_move_dist_px must be a non-negative number"));
        }
        if !id.roi_change_mae.is_finite() || !(0.0..=255.0).contains(&id.roi_change_mae) {
            return Err(anyhow!("identity.roi_change_mae must be within 0..=255"));
        }
        check_unit("detector.shape_confidence", self.detector.shape_confidence)?;
        check_unit("detector.defect_confidence", self.detector.defect_confidence)?;
        check_unit("detector.shape_nms_iou", self.detector.shape_nms_iou)?;
        if let Some(remote) = &self.remote {
            if !(remote.base_url.starts_with("http://") || remote.base_url.starts_with("https://"))
            {
                return Err(anyhow!(
                    "remote.base_url must be an http(s) URL, got '{}'",
                    remote.base_url
                ));
            }
            if remote.timeout.is_zero() {
                return Err(anyhow!("remote.timeout_secs must be greater than zero"));
            }
            if remote.max_attempts == 0 {
                return Err(anyhow!("remote.max_attempts must be at least 1"));
            }
            if remote.queue_capacity == 0 {
                return Err(anyhow!("remote.queue_capacity must be at least 1"));
            }
        }
        Ok(())
    }
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(anyhow!("{} must be within 0..=1, got {}", name, value));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<InspectorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
