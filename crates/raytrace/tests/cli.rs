use std::fs;
use std::process::{Command, Output};

use tempfile::TempDir;

fn raytrace(config_dir: &std::path::Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_raytrace"))
        .env("RAYTRACE_CONFIG_DIR", config_dir)
        .env("RUST_LOG", "warn")
        .args(args)
        .output()
        .expect("failed to run raytrace")
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn help_lists_the_main_flags() {
    let root = TempDir::new().unwrap();
    let output = raytrace(root.path(), &["--help"]);
    assert!(output.status.success());
    let help = String::from_utf8_lossy(&output.stdout);
    for flag in ["--shader", "--size", "--frames", "--output", "--window", "--rounding"] {
        assert!(help.contains(flag), "help is missing {flag}");
    }
}

#[test]
fn malformed_size_is_rejected() {
    let root = TempDir::new().unwrap();
    let output = raytrace(root.path(), &["--size", "1280by720"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("WIDTHxHEIGHT"));
}

#[test]
fn invalid_scene_config_fails_before_touching_the_gpu() {
    let root = TempDir::new().unwrap();
    fs::write(root.path().join("scene.toml"), "version = 2\n").unwrap();

    let output = raytrace(root.path(), &[]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("unsupported config version 2"));
}

#[test]
fn unsupported_output_format_is_rejected() {
    let root = TempDir::new().unwrap();
    let target = root.path().join("frame.bmp");
    let output = raytrace(root.path(), &["--output", target.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("unsupported output format"));
    assert!(!target.exists());
}

#[test]
fn headless_run_writes_the_last_frame() {
    let root = TempDir::new().unwrap();
    let target = root.path().join("out/frame.png");

    let output = raytrace(
        root.path(),
        &[
            "--size",
            "32x16",
            "--frames",
            "3",
            "--output",
            target.to_str().unwrap(),
        ],
    );

    if !output.status.success() {
        let message = stderr(&output);
        if message.contains("failed to initialise the GPU") {
            eprintln!("skipping headless run: {message}");
            return;
        }
        panic!("raytrace failed: {message}");
    }
    let dimensions = image_dimensions(&target);
    assert_eq!(dimensions, (32, 16));
}

fn image_dimensions(path: &std::path::Path) -> (u32, u32) {
    let bytes = fs::read(path).expect("output image was written");
    // PNG IHDR: width and height are the first two big-endian words after the
    // 8-byte signature and the 8-byte chunk header.
    assert_eq!(&bytes[1..4], b"PNG");
    let word = |offset: usize| {
        u32::from_be_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ])
    };
    (word(16), word(20))
}
