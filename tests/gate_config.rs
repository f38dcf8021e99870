use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use age_gate::capture::Facing;
use age_gate::config::GateConfig;
use age_gate::estimate::RequestFormat;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "AGE_GATE_CONFIG",
        "AGE_GATE_CAPTURE_URL",
        "AGE_GATE_ESTIMATOR_URL",
        "AGE_GATE_ESTIMATOR_FORMAT",
        "AGE_GATE_ESTIMATOR_TIMEOUT_MS",
        "AGE_GATE_CATALOG",
        "AGE_GATE_TEST_MODE",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_defaults_without_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = GateConfig::load().expect("load config");
    assert_eq!(cfg.capture.url, "stub://front_camera");
    assert_eq!(cfg.estimator.url, "http://localhost:8000/predict-age/");
    assert_eq!(cfg.estimator.timeout, Duration::from_secs(10));
    assert!(!cfg.test_mode);
    assert!(cfg.catalog_path.is_none());
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "capture": {
                "url": "file:///var/lib/age-gate/still.jpg",
                "width": 1280,
                "height": 720,
                "facing": "environment",
                "frame_wait_ms": 500
            },
            "estimator": {
                "url": "http://estimator.local/predict-age/",
                "format": "json",
                "timeout_ms": 3000
            },
            "catalog_path": "/etc/age-gate/catalog.json",
            "default_required_age": 16
        }"#,
    );

    std::env::set_var("AGE_GATE_CONFIG", file.path());
    std::env::set_var("AGE_GATE_ESTIMATOR_URL", "https://ages.example.com/v1/predict");
    std::env::set_var("AGE_GATE_ESTIMATOR_TIMEOUT_MS", "1500");

    let cfg = GateConfig::load().expect("load config");
    assert_eq!(cfg.capture.url, "file:///var/lib/age-gate/still.jpg");
    assert_eq!(cfg.capture.width, 1280);
    assert_eq!(cfg.capture.facing, Facing::Environment);
    assert_eq!(cfg.capture.frame_wait, Duration::from_millis(500));
    assert_eq!(cfg.estimator.url, "https://ages.example.com/v1/predict");
    assert_eq!(cfg.estimator.format, RequestFormat::Json);
    assert_eq!(cfg.estimator.timeout, Duration::from_millis(1500));
    assert_eq!(
        cfg.catalog_path.as_deref(),
        Some(std::path::Path::new("/etc/age-gate/catalog.json"))
    );
    assert_eq!(cfg.default_required_age, 16);

    let options = cfg.machine_options();
    assert_eq!(options.estimate_timeout, Duration::from_millis(1500));
    assert_eq!(options.constraints.ideal_height, 720);

    clear_env();
}

#[test]
fn stub_estimator_requires_test_mode() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("AGE_GATE_ESTIMATOR_URL", "stub://30");
    let err = GateConfig::load().unwrap_err();
    assert!(err.to_string().contains("test_mode"));

    std::env::set_var("AGE_GATE_TEST_MODE", "1");
    let cfg = GateConfig::load().expect("load config");
    assert!(cfg.test_mode);
    assert_eq!(cfg.estimator.url, "stub://30");

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("AGE_GATE_ESTIMATOR_TIMEOUT_MS", "soon");
    assert!(GateConfig::load().is_err());

    std::env::set_var("AGE_GATE_ESTIMATOR_TIMEOUT_MS", "0");
    assert!(GateConfig::load().is_err());
    clear_env();

    std::env::set_var("AGE_GATE_ESTIMATOR_FORMAT", "xml");
    assert!(GateConfig::load().is_err());
    clear_env();

    let file = write_config(r#"{"capture": {"width": 0}}"#);
    std::env::set_var("AGE_GATE_CONFIG", file.path());
    assert!(GateConfig::load().is_err());

    let file = write_config("{ not json");
    std::env::set_var("AGE_GATE_CONFIG", file.path());
    let err = GateConfig::load().unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    clear_env();
}
