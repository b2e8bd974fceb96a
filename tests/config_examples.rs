use std::{fs, path::PathBuf};

use pgrr::config::{Config, LogFormat};

fn demos_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos")
}

#[test]
fn bundled_demo_configs_parse() {
    let entries = fs::read_dir(demos_dir()).expect("demos directory should exist");

    let mut parsed_count = 0usize;
    for entry in entries {
        let entry = entry.expect("directory entry should be readable");
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("toml") {
            continue;
        }

        Config::from_path(&path)
            .unwrap_or_else(|err| panic!("demo config {} should parse: {err:#}", path.display()));
        parsed_count += 1;
    }

    assert!(parsed_count >= 2, "expected the bundled demo configs");
}

#[test]
fn default_demo_config_matches_built_in_defaults() {
    let config = Config::from_path(demos_dir().join("pgrr.toml")).expect("demo should parse");
    let defaults = Config::default();

    assert_eq!(config.capture.listen, defaults.capture.listen);
    assert_eq!(config.capture.backend, defaults.capture.backend);
    assert_eq!(config.capture.log_path, defaults.capture.log_path);
    assert_eq!(config.capture.chunk_size, defaults.capture.chunk_size);
    assert_eq!(config.replay.target_port, defaults.replay.target_port);
    assert_eq!(config.replay.speed, defaults.replay.speed);
    assert_eq!(config.replay.sync_timeout_ms, defaults.replay.sync_timeout_ms);
    assert_eq!(config.replay.peer_port, None);
}

#[test]
fn fast_replay_demo_filters_one_connection() {
    let config = Config::from_path(demos_dir().join("pgrr.fast-replay.toml"))
        .expect("demo should parse");

    assert_eq!(config.replay.speed, 10.0);
    assert_eq!(config.replay.peer_port, Some(50280));
    assert_eq!(config.replay.target_host, "staging-db.internal");
    let logging = config.logging.expect("demo configures logging");
    assert_eq!(logging.format, Some(LogFormat::Json));
}
