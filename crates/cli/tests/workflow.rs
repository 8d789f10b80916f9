//! End-to-end runs against fake external tools (shell scripts).
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::{tempdir, TempDir};

const SCAN: &str = r#"
DECIMAL       HEXADECIMAL     DESCRIPTION
--------------------------------------------------------------------------------
586164        0x8F1B4         Device tree blob (DTB), version: 17, CPU ID: 0, total size: 4096
590260        0x901B4         gzip compressed data, maximum compression, has original file name: "u-boot.bin", from Unix
1037748       0xFD5B4         gzip compressed data, maximum compression, has original file name: "tee.bin", from Unix
"#;

/// A project directory with `fwprobe.toml`, a firmware file and a fake
/// `binwalk` that prints a canned signature table.
fn project() -> TempDir {
    let dir = tempdir().expect("tempdir");
    let tools = dir.path().join("tools");
    fs::create_dir_all(&tools).expect("tools dir");
    let scan_file = tools.join("scan.txt");
    fs::write(&scan_file, SCAN).expect("scan fixture");
    let binwalk = executable(&tools, "binwalk", &format!("cat '{}'\n", scan_file.display()));

    fs::write(
        dir.path().join("fwprobe.toml"),
        format!(
            "work_dir = \"work\"\nscripts_dir = \"scripts\"\n\n[tools]\nbinwalk = {:?}\n",
            binwalk.display().to_string()
        ),
    )
    .expect("config");
    fs::write(dir.path().join("fw.img"), vec![0u8; 4096]).expect("firmware");
    dir
}

fn executable(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
    path
}

fn fwprobe(dir: &Path) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("fwprobe");
    cmd.current_dir(dir).env_remove("FWPROBE_CONFIG");
    cmd
}

#[test]
fn binwalk_report_writes_the_offsets_file() {
    let dir = project();
    let output = fwprobe(dir.path()).args(["binwalk", "fw.img"]).output().expect("run binwalk");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let report: toml::Table =
        String::from_utf8_lossy(&output.stdout).parse().expect("report is TOML");
    assert_eq!(report["component_count"].as_integer(), Some(3));
    assert_eq!(report["uboot_gz_offset"].as_str(), Some("0x901B4"));
    assert_eq!(report["components"].as_array().map(Vec::len), Some(3));

    let offsets = fs::read_to_string(dir.path().join("output/binwalk-offsets.sh"))
        .expect("offsets file written");
    assert!(offsets.starts_with("#!/bin/sh\n"));
    assert!(offsets.contains("UBOOT_GZ_OFFSET=0x901B4\nUBOOT_GZ_OFFSET_DEC=590260\n"));
    assert!(offsets.contains("OPTEE_GZ_OFFSET=0xFD5B4\n"));
}

#[test]
fn later_reports_read_the_offsets_file() {
    let dir = project();
    fwprobe(dir.path()).args(["binwalk", "fw.img"]).assert().success();

    let output = fwprobe(dir.path())
        .args(["partitions", "fw.img", "--format", "json"])
        .output()
        .expect("run partitions");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let report: Value = serde_json::from_slice(&output.stdout).expect("report is JSON");
    let partitions = report["partitions"].as_array().expect("partitions");
    assert_eq!(partitions.len(), 1);
    assert_eq!(partitions[0]["region"], "Bootloader FIT");
    assert_eq!(partitions[0]["offset"], "0x8F1B4");
    // The image is smaller than the offset, so the region has no size.
    assert_eq!(partitions[0]["size_mb"], 0);
    let source = report["partitions_source"].as_str().expect("partitions source");
    assert!(source.ends_with("output/binwalk-offsets.sh"), "source: {source}");
}

#[test]
fn out_flag_writes_the_report_file() {
    let dir = project();
    fwprobe(dir.path())
        .args(["binwalk", "fw.img", "--out", "reports/binwalk.toml"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Wrote reports/binwalk.toml"));
    let body = fs::read_to_string(dir.path().join("reports/binwalk.toml")).expect("report file");
    assert!(body.starts_with("# Binwalk Firmware Analysis\n"));
}

#[test]
fn output_dir_flag_moves_the_offsets_file() {
    let dir = project();
    fwprobe(dir.path())
        .args(["--output-dir", "elsewhere", "binwalk", "fw.img"])
        .assert()
        .success();
    assert!(dir.path().join("elsewhere/binwalk-offsets.sh").is_file());
    assert!(!dir.path().join("output/binwalk-offsets.sh").exists());
}

#[test]
fn analyze_serves_repeat_runs_from_the_cache() {
    let dir = project();
    let scripts = dir.path().join("scripts");
    fs::create_dir_all(&scripts).expect("scripts dir");
    fs::write(
        scripts.join("uboot.sh"),
        "echo run >> \"$(dirname \"$0\")/runs.log\"\n\
         echo '{\"version\": \"2023.07\", \"version_source\": \"u-boot.bin\", \"version_method\": \"strings\"}'\n",
    )
    .expect("analysis script");

    for _ in 0..2 {
        let output =
            fwprobe(dir.path()).args(["analyze", "uboot", "fw.img"]).output().expect("analyze");
        assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
        let results: Value = serde_json::from_slice(&output.stdout).expect("JSON results");
        assert_eq!(results["version"], "2023.07");
    }

    let runs = fs::read_to_string(scripts.join("runs.log")).expect("run log");
    assert_eq!(runs.lines().count(), 1);
    assert!(dir.path().join("results/uboot.toml").is_file());
    let manifest = fs::read_to_string(dir.path().join("results/.manifest.toml")).expect("manifest");
    assert!(manifest.contains("[uboot]"));

    fs::write(dir.path().join("fw.img"), vec![1u8; 4096]).expect("new firmware");
    fwprobe(dir.path()).args(["analyze", "uboot", "fw.img"]).assert().success();
    let runs = fs::read_to_string(scripts.join("runs.log")).expect("run log");
    assert_eq!(runs.lines().count(), 2);
}

#[test]
fn render_fills_template_with_footnotes() {
    let dir = project();
    let scripts = dir.path().join("scripts");
    fs::create_dir_all(&scripts).expect("scripts dir");
    fs::write(
        scripts.join("uboot.sh"),
        "echo '{\"version\": \"2023.07\", \"version_source\": \"u-boot.bin\", \"version_method\": \"strings\"}'\n",
    )
    .expect("analysis script");
    fs::write(dir.path().join("report.md"), "# Firmware\n\nU-Boot {{ uboot.version | src }}\n")
        .expect("template");

    fwprobe(dir.path())
        .args(["render", "report.md", "fw.img"])
        .assert()
        .success()
        .stdout("# Firmware\n\nU-Boot 2023.07[^1]\n\n[^1]: u-boot.bin (strings)\n");
}
