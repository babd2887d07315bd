use std::fs;

use tempfile::TempDir;
use vrconfig::{ConfigError, Pattern, SinkConfig};
use vrsink::MultiviewMode;

#[test]
fn loads_a_config_file_from_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vrplay.toml");
    fs::write(
        &path,
        "version = 1\n\n[sink]\noutput-multiview-mode = \"mono\"\n\n[source]\npattern = \"checkers\"\nmultiview-mode = \"fbf\"\n",
    )
    .unwrap();

    let config = SinkConfig::load(&path).unwrap();
    let source = config.source_settings().unwrap();
    assert_eq!(source.pattern, Pattern::Checkers);
    assert_eq!(source.multiview_mode, MultiviewMode::FrameByFrame);
    assert_eq!(
        config.to_settings().unwrap().output_multiview_mode,
        MultiviewMode::Mono
    );
}

#[test]
fn missing_file_reports_its_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.toml");
    let err = SinkConfig::load(&path).unwrap_err();
    assert!(matches!(&err, ConfigError::Io { path: reported, .. } if reported == &path));
    assert!(err.to_string().contains("absent.toml"));
}
