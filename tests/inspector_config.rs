use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use plate_inspector::config::InspectorConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PLATE_CONFIG",
        "PLATE_DB_PATH",
        "PLATE_SAVE_ROOT",
        "PLATE_GATE_PRESENT",
        "PLATE_GATE_ABSENT",
        "PLATE_REMOTE_URL",
        "PLATE_REMOTE_TOKEN",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = InspectorConfig::load().expect("load defaults");
    assert_eq!(cfg.db_path, "plate_ledger.db");
    assert_eq!(cfg.save_root.to_str(), Some("savefile"));
    assert_eq!(cfg.gate.present_frames, 1);
    assert_eq!(cfg.gate.absent_frames, 2);
    assert_eq!(cfg.identity.shape_change_frames, 5);
    assert_eq!(cfg.identity.shape_move_frames, 3);
    assert_eq!(cfg.identity.roi_change_frames, 3);
    assert!((cfg.detector.shape_confidence - 0.58).abs() < f32::EPSILON);
    assert!((cfg.detector.defect_confidence - 0.27).abs() < f32::EPSILON);
    assert!(cfg.remote.is_none());
}

#[test]
fn loads_json_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "db_path": "lane1.db",
        "save_root": "/var/lib/plates",
        "gate": { "present_frames": 2, "absent_frames": 6 },
        "identity": { "shape_move_dist_px": 35.0, "roi_change_frames": 4 },
        "detector": { "defect_confidence": 0.4 },
        "remote": {
            "base_url": "https://plates.example.test/",
            "timeout_secs": 2,
            "max_attempts": 5,
            "drain_secs": 1
        }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("PLATE_CONFIG", file.path());
    std::env::set_var("PLATE_GATE_ABSENT", "8");
    std::env::set_var("PLATE_REMOTE_TOKEN", "s3cret");

    let cfg = InspectorConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "lane1.db");
    assert_eq!(cfg.save_root.to_str(), Some("/var/lib/plates"));
    assert_eq!(cfg.gate.present_frames, 2);
    assert_eq!(cfg.gate.absent_frames, 8);
    assert!((cfg.identity.shape_move_dist_px - 35.0).abs() < f32::EPSILON);
    assert_eq!(cfg.identity.roi_change_frames, 4);
    assert_eq!(cfg.identity.shape_change_frames, 5);
    assert!((cfg.detector.defect_confidence - 0.4).abs() < f32::EPSILON);
    let remote = cfg.remote.expect("remote configured");
    assert_eq!(remote.base_url, "https://plates.example.test");
    assert_eq!(remote.auth_token.as_deref(), Some("s3cret"));
    assert_eq!(remote.timeout, Duration::from_secs(2));
    assert_eq!(remote.max_attempts, 5);
    assert_eq!(remote.queue_capacity, 256);
    assert_eq!(remote.drain_timeout, Duration::from_secs(1));

    clear_env();
}

#[test]
fn loads_toml_config_and_remote_from_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
db_path = "lane2.db"

[gate]
present_frames = 3
absent_frames = 3

[detector]
shape_nms_iou = 0.5
"#;
    file.write_all(toml.as_bytes()).expect("write config");

    std::env::set_var("PLATE_CONFIG", file.path());
    std::env::set_var("PLATE_DB_PATH", "override.db");
    std::env::set_var("PLATE_REMOTE_URL", "http://127.0.0.1:9000");

    let cfg = InspectorConfig::load().expect("load config");
    assert_eq!(cfg.db_path, "override.db");
    assert_eq!(cfg.gate.present_frames, 3);
    assert!((cfg.detector.shape_nms_iou - 0.5).abs() < f32::EPSILON);
    let remote = cfg.remote.expect("remote from env");
    assert_eq!(remote.base_url, "http://127.0.0.1:9000");
    assert_eq!(remote.timeout, Duration::from_secs(5));
    assert_eq!(remote.max_attempts, 3);
    assert_eq!(remote.drain_timeout, Duration::from_secs(10));

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PLATE_GATE_PRESENT", "0");
    let err = InspectorConfig::load().unwrap_err();
    assert!(err.to_string().contains("present_frames"));

    std::env::set_var("PLATE_GATE_PRESENT", "many");
    assert!(InspectorConfig::load().is_err());
    std::env::remove_var("PLATE_GATE_PRESENT");

    std::env::set_var("PLATE_REMOTE_URL", "ftp://plates");
    let err = InspectorConfig::load().unwrap_err();
    assert!(err.to_string().contains("http"));
    std::env::remove_var("PLATE_REMOTE_URL");

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{"detector": {"shape_confidence": 1.5}}"#)
        .expect("write config");
    std::env::set_var("PLATE_CONFIG", file.path());
    let err = InspectorConfig::load().unwrap_err();
    assert!(err.to_string().contains("shape_confidence"));

    clear_env();
}
