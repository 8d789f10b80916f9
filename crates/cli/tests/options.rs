use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;

use fwprobe::commands::{analyzer_infos, render_report, OutputFormat};
use fwprobe::GlobalOptions;
use fwprobe_core::offsets::OffsetManager;
use fwprobe_core::services::analyzers::partitions::{analyze_partitions, PartitionAnalysis};
use tempfile::tempdir;

#[test]
fn global_options_round_trip_as_arguments() {
    let opts = GlobalOptions {
        config: Some(PathBuf::from("site.toml")),
        output_dir: None,
        work_dir: Some(PathBuf::from("/scratch")),
    };
    let args: Vec<OsString> = opts.to_args();
    let expected: Vec<OsString> =
        ["--config", "site.toml", "--work-dir", "/scratch"].iter().map(OsString::from).collect();
    assert_eq!(args, expected);
    assert!(GlobalOptions::default().to_args().is_empty());
}

#[test]
fn flags_override_config_file_values() {
    let dir = tempdir().expect("tempdir");
    let config = dir.path().join("site.toml");
    fs::write(&config, "output_dir = \"from-file\"\nwork_dir = \"work-from-file\"\n")
        .expect("config");
    let opts = GlobalOptions {
        config: Some(config),
        output_dir: Some(PathBuf::from("from-flag")),
        work_dir: None,
    };
    let loaded = opts.load_config().expect("load config");
    assert_eq!(loaded.output_dir, PathBuf::from("from-flag"));
    assert_eq!(loaded.work_dir, PathBuf::from("work-from-file"));
}

#[test]
fn session_resolves_relative_dirs_against_the_current_directory() {
    let dir = tempdir().expect("tempdir");
    let config = dir.path().join("site.toml");
    fs::write(&config, "output_dir = \"reports\"\nresults_dir = \"/var/cache/fwprobe\"\n")
        .expect("config");
    let opts = GlobalOptions { config: Some(config), ..GlobalOptions::default() };

    let session = opts.session().expect("session");
    let cwd = std::env::current_dir().expect("cwd");
    assert_eq!(session.layout.output_dir, cwd.join("reports"));
    assert_eq!(session.layout.offsets_path, cwd.join("reports/binwalk-offsets.sh"));
    assert_eq!(session.layout.results_dir, PathBuf::from("/var/cache/fwprobe"));
}

#[test]
fn analyzer_infos_are_sorted_by_name() {
    let names: Vec<String> = analyzer_infos().into_iter().map(|i| i.name).collect();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
    assert!(names.contains(&"network-services".to_string()));
}

#[test]
fn reports_render_in_both_formats() {
    let offsets = OffsetManager::parse("SQUASHFS_OFFSET=0x2000000\nSQUASHFS_SIZE=52428800\n")
        .expect("offsets");
    let mut analysis = PartitionAnalysis::new("fw.img", 1024);
    analyze_partitions(&mut analysis, &offsets);

    let toml_body = render_report(&analysis, OutputFormat::Toml).expect("toml");
    assert!(toml_body.starts_with("# Firmware Partition Layout\n"));
    let parsed: toml::Table = toml_body.parse().expect("valid TOML");
    assert_eq!(parsed["partitions"][0]["region"].as_str(), Some("Root FS"));

    let json_body = render_report(&analysis, OutputFormat::Json).expect("json");
    let value: serde_json::Value = serde_json::from_str(&json_body).expect("valid JSON");
    assert_eq!(value["partitions"][0]["size_mb"], 50);
    assert_eq!(value["partitions_source"], "binwalk-offsets.sh");
}
