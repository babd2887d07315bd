use std::fs;
use std::process::Command;

use serde_json::Value;
use tempfile::TempDir;

fn vrplay(args: &[&str]) -> Value {
    let output = Command::new(env!("CARGO_BIN_EXE_vrplay"))
        .env("RUST_LOG", "warn")
        .env_remove("VRPLAY_CONFIG")
        .args(args)
        .arg("--json")
        .output()
        .expect("failed to run vrplay");
    assert!(
        output.status.success(),
        "vrplay failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("summary is JSON")
}

#[test]
fn plays_a_mono_pattern_without_leaks() {
    let summary = vrplay(&["--pattern", "smpte", "--size", "64x36", "--frames", "5"]);
    assert_eq!(summary["frames_rendered"], 5);
    assert_eq!(summary["closed_by_user"], false);
    assert_eq!(summary["leaked_objects"], 0);
    assert_eq!(summary["video_size"], serde_json::json!([64, 36]));
    assert!(summary["draws"].as_u64().unwrap() >= 1);
}

#[test]
fn downmixes_side_by_side_to_an_anaglyph() {
    let summary = vrplay(&[
        "--pattern",
        "stereo-pair",
        "--size",
        "64x16",
        "--frames",
        "3",
        "--input-mode",
        "side-by-side",
        "--output-mode",
        "mono",
        "--downmix",
        "red-cyan-dubois",
    ]);
    assert_eq!(summary["input_mode"], "side-by-side");
    assert_eq!(summary["output_mode"], "mono");
    assert!(summary["conversions"].as_u64().unwrap() >= 3);
    assert_eq!(summary["leaked_objects"], 0);
}

#[test]
fn frame_by_frame_input_renders_both_views() {
    let summary = vrplay(&[
        "--pattern",
        "checkers",
        "--size",
        "32x32",
        "--frames",
        "4",
        "--input-mode",
        "fbf",
        "--output-mode",
        "side-by-side",
    ]);
    assert_eq!(summary["frames_produced"], 8);
    assert_eq!(summary["frames_rendered"], 8);
    assert_eq!(summary["output_mode"], "side-by-side");
}

#[test]
fn closing_the_window_stops_playback_cleanly() {
    let summary = vrplay(&["--size", "32x18", "--frames", "50", "--close-after", "3"]);
    assert_eq!(summary["closed_by_user"], true);
    assert_eq!(summary["frames_rendered"], 3);
    assert_eq!(summary["leaked_objects"], 0);
}

#[test]
fn resizes_letterbox_the_video() {
    let summary = vrplay(&[
        "--size",
        "160x90",
        "--frames",
        "4",
        "--resize-at",
        "2:800x600",
    ]);
    assert_eq!(summary["window_size"], serde_json::json!([800, 600]));
    assert_eq!(summary["display_rect"], "0,75,800x450");

    let stretched = vrplay(&[
        "--size",
        "160x90",
        "--frames",
        "4",
        "--resize-at",
        "2:800x600",
        "--stretch",
    ]);
    assert_eq!(stretched["display_rect"], "0,0,800x600");
}

#[test]
fn config_file_values_apply_and_flags_override_them() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vrplay.toml");
    fs::write(
        &path,
        "version = 1\n\n[source]\nsize = \"48x48\"\nframes = 2\nmultiview-mode = \"top-bottom\"\n",
    )
    .unwrap();
    let path = path.to_str().unwrap();

    let summary = vrplay(&["--config", path]);
    assert_eq!(summary["frames_rendered"], 2);
    assert_eq!(summary["input_mode"], "top-bottom");

    let summary = vrplay(&["--config", path, "--frames", "6"]);
    assert_eq!(summary["frames_rendered"], 6);
}

#[test]
fn invalid_config_is_reported() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.toml");
    fs::write(&path, "version = 1\n[sink]\noutput-multiview-mode = \"sideways\"\n").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_vrplay"))
        .arg("--config")
        .arg(&path)
        .output()
        .expect("failed to run vrplay");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("sideways"));
}

#[test]
fn print_config_emits_the_effective_toml() {
    let output = Command::new(env!("CARGO_BIN_EXE_vrplay"))
        .env_remove("VRPLAY_CONFIG")
        .args(["--output-mode", "top-bottom", "--stretch", "--print-config"])
        .output()
        .expect("failed to run vrplay");
    assert!(output.status.success());
    let text = String::from_utf8(output.stdout).unwrap();
    assert!(text.contains("output-multiview-mode = \"top-bottom\""));
    assert!(text.contains("force-aspect-ratio = false"));
}
