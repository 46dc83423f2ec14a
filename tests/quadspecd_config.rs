use std::sync::Mutex;

use tempfile::NamedTempFile;

use quadspec::{QuadspecConfig, ResolutionKey};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "QUADSPEC_CONFIG",
        "QUADSPEC_BIND_IP",
        "QUADSPEC_RESOLUTION",
        "QUADSPEC_OUTPUT_DIR",
        "QUADSPEC_BLACK_REF",
        "QUADSPEC_WHITE_REF",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = QuadspecConfig::load().expect("load config");

    assert_eq!(cfg.bind_ip, "0.0.0.0");
    assert_eq!(cfg.resolution, ResolutionKey::Medium);
    assert_eq!(cfg.network.image_port, 32233);
    assert_eq!(cfg.network.command_port, 32211);
    assert_eq!(cfg.network.config_port, 32121);
    assert!(!cfg.output.save);
    assert!(cfg.calibration.black.is_none());

    clear_env();
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
            "bind_ip": "192.168.1.10",
            "resolution": "HIGH",
            "network": {
                "image_port": 42233,
                "command_port": 42211,
                "config_port": 42121
            },
            "output": {
                "dir": "/data/captures",
                "save": true
            },
            "calibration": {
                "black": "/data/cal/black.raw",
                "white": "/data/cal/white.raw"
            }
        }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("QUADSPEC_CONFIG", file.path());
    std::env::set_var("QUADSPEC_RESOLUTION", "low");
    std::env::set_var("QUADSPEC_OUTPUT_DIR", "/mnt/field");

    let cfg = QuadspecConfig::load().expect("load config");

    assert_eq!(cfg.bind_ip, "192.168.1.10");
    assert_eq!(cfg.resolution, ResolutionKey::Low);
    assert_eq!(cfg.network.image_port, 42233);
    assert_eq!(cfg.network.command_port, 42211);
    assert_eq!(cfg.network.config_port, 42121);
    assert_eq!(cfg.output.dir, std::path::Path::new("/mnt/field"));
    assert!(cfg.output.save);
    assert_eq!(
        cfg.calibration.black.as_deref(),
        Some(std::path::Path::new("/data/cal/black.raw"))
    );

    clear_env();
}

#[test]
fn rejects_duplicate_ports() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{ "network": { "image_port": 9000, "command_port": 9000 } }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    std::env::set_var("QUADSPEC_CONFIG", file.path());

    assert!(QuadspecConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_half_a_calibration_pair() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("QUADSPEC_BLACK_REF", "/data/cal/black.raw");
    assert!(QuadspecConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_bad_bind_ip() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("QUADSPEC_BIND_IP", "not-an-address");
    assert!(QuadspecConfig::load().is_err());

    clear_env();
}
