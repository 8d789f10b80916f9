use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};

use fwprobe_core::cache::{
    hash_file, track_fields, AnalysisCache, AnalysisRunner, CacheError, FootnoteRegistry, Manifest,
    Script, ScriptKind, ScriptLocator, TemplateRenderer,
};
use fwprobe_core::config::AnalysisConfig;
use fwprobe_core::layout::ArtifactLayout;
use serde_json::{json, Value};
use tempfile::TempDir;

/// Counts invocations instead of spawning anything.
#[derive(Default)]
struct CountingRunner {
    calls: Cell<usize>,
}

impl AnalysisRunner for CountingRunner {
    fn run(&self, analysis_type: &str, script: &Script, _firmware: &Path) -> Result<Value, CacheError> {
        self.calls.set(self.calls.get() + 1);
        Ok(json!({
            "analysis": analysis_type,
            "script": script.path.file_name().map(|n| n.to_string_lossy().to_string()),
            "version": "2023.07",
            "version_source": "u-boot.bin",
            "version_method": "strings",
            "run": self.calls.get(),
            "missing": null,
        }))
    }
}

struct Workspace {
    _temp: TempDir,
    layout: ArtifactLayout,
    scripts: PathBuf,
    firmware: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = ArtifactLayout::new(&AnalysisConfig::default(), temp.path());
        let scripts = temp.path().join("scripts");
        fs::create_dir_all(&scripts).expect("scripts dir");
        fs::write(scripts.join("uboot.sh"), "echo '{}'\n").expect("script");
        fs::write(scripts.join("boot_process.sh"), "echo '{}'\n").expect("script");
        let firmware = temp.path().join("fw.img");
        fs::write(&firmware, "firmware-v1").expect("firmware");
        Self { _temp: temp, layout, scripts, firmware }
    }

    fn cache(&self) -> AnalysisCache {
        AnalysisCache::new(self.layout.clone(), ScriptLocator::new(Some(self.scripts.clone())))
    }
}

#[test]
fn unchanged_inputs_run_the_analysis_once() {
    let ws = Workspace::new();
    let runner = CountingRunner::default();

    let mut cache = ws.cache();
    let first = cache.analyze("uboot", &ws.firmware, &runner).expect("first run");
    let second = cache.analyze("uboot", &ws.firmware, &runner).expect("memo hit");
    assert_eq!(runner.calls.get(), 1);
    assert_eq!(first, second);

    // A fresh cache has no memo and must be served from disk.
    let mut reopened = ws.cache();
    let from_disk = reopened.analyze("uboot", &ws.firmware, &runner).expect("disk hit");
    assert_eq!(runner.calls.get(), 1);
    assert_eq!(from_disk["version"], "2023.07");
    assert_eq!(from_disk["version_source"], "u-boot.bin");
    assert_eq!(from_disk["run"], 1);
    assert!(from_disk.get("missing").is_none());
}

#[test]
fn changed_firmware_or_script_invalidates() {
    let ws = Workspace::new();
    let runner = CountingRunner::default();
    let mut cache = ws.cache();
    let script = ws.scripts.join("uboot.sh");

    cache.analyze("uboot", &ws.firmware, &runner).expect("first run");
    assert!(cache.is_cache_valid("uboot", &ws.firmware, &script));

    fs::write(&ws.firmware, "firmware-v2").expect("rewrite firmware");
    assert!(!cache.is_cache_valid("uboot", &ws.firmware, &script));
    let rerun = cache.analyze("uboot", &ws.firmware, &runner).expect("rerun");
    assert_eq!(runner.calls.get(), 2);
    assert_eq!(rerun["run"], 2);

    fs::write(&script, "echo '{\"changed\": true}'\n").expect("rewrite script");
    cache.analyze("uboot", &ws.firmware, &runner).expect("rerun after script change");
    assert_eq!(runner.calls.get(), 3);

    let manifest = Manifest::load(&ws.layout.manifest_path).expect("manifest");
    let entry = manifest.entry("uboot").expect("manifest entry");
    assert_eq!(entry.firmware_hash, hash_file(&ws.firmware).expect("hash firmware"));
    assert_eq!(entry.script_hash, hash_file(&script).expect("hash script"));
}

/// Returns values TOML cannot hold as-is.
struct WideRunner;

impl AnalysisRunner for WideRunner {
    fn run(&self, _analysis_type: &str, _script: &Script, _firmware: &Path) -> Result<Value, CacheError> {
        Ok(json!({ "offsets": [1, null, 2], "size": u64::MAX, "gap": null }))
    }
}

#[test]
fn disk_reload_drops_nulls_and_stringifies_huge_integers() {
    let ws = Workspace::new();

    let mut cache = ws.cache();
    let fresh = cache.analyze("uboot", &ws.firmware, &WideRunner).expect("run");
    assert_eq!(fresh["offsets"], json!([1, null, 2]));
    assert_eq!(fresh["size"], json!(u64::MAX));

    let reloaded = ws.cache().load_results("uboot").expect("reload");
    assert_eq!(reloaded["offsets"], json!([1, 2]));
    assert_eq!(reloaded["size"], "18446744073709551615");
    assert!(reloaded.get("gap").is_none());
}

#[test]
fn validity_needs_results_and_manifest() {
    let ws = Workspace::new();
    let cache = ws.cache();
    let script = ws.scripts.join("uboot.sh");
    let fw_hash = hash_file(&ws.firmware).expect("hash firmware");
    let script_hash = hash_file(&script).expect("hash script");

    assert!(!cache.is_cache_valid("uboot", &ws.firmware, &script));

    // A manifest entry alone is not enough without a results file.
    cache.update_manifest("uboot", &fw_hash, &script_hash).expect("update manifest");
    assert!(!cache.is_cache_valid("uboot", &ws.firmware, &script));

    fs::create_dir_all(&ws.layout.results_dir).expect("results dir");
    fs::write(ws.layout.results_path("uboot"), "version = \"2023.07\"\n").expect("results");
    assert!(cache.is_cache_valid("uboot", &ws.firmware, &script));
    assert!(!cache.is_cache_valid("uboot", &ws.firmware, &ws.scripts.join("missing.sh")));

    fs::write(&ws.layout.manifest_path, "this is = = not toml").expect("corrupt manifest");
    assert!(!cache.is_cache_valid("uboot", &ws.firmware, &script));
}

#[test]
fn underscored_types_share_the_hyphenated_cache_entry() {
    let ws = Workspace::new();
    let runner = CountingRunner::default();
    let mut cache = ws.cache();

    let results = cache.analyze("boot_process", &ws.firmware, &runner).expect("run");
    assert_eq!(results["analysis"], "boot-process");
    assert_eq!(results["script"], "boot_process.sh");
    assert!(ws.layout.results_path("boot-process").is_file());

    cache.analyze("boot-process", &ws.firmware, &runner).expect("memo hit");
    assert_eq!(runner.calls.get(), 1);
}

#[test]
fn fallback_script_is_the_executable() {
    let ws = Workspace::new();
    let exe = ws.scripts.join("fwprobe-bin");
    fs::write(&exe, "binary").expect("exe");
    let locator = ScriptLocator::new(Some(ws.scripts.clone())).with_executable(&exe);
    let script = locator.locate("rootfs").expect("locate");
    assert_eq!(script, Script { path: exe.clone(), kind: ScriptKind::Executable });

    let runner = CountingRunner::default();
    let mut cache = AnalysisCache::new(ws.layout.clone(), locator);
    let results = cache.analyze("rootfs", &ws.firmware, &runner).expect("run");
    assert_eq!(results["script"], "fwprobe-bin");
}

#[test]
fn template_placeholders_and_footnotes() {
    let mut renderer = TemplateRenderer::new();
    renderer
        .add_results(
            "uboot",
            &json!({
                "version": "2023.07",
                "version_source": "u-boot.bin",
                "version_method": "strings",
                "env_count": 12,
                "env_count_source": "u-boot.bin",
                "env_count_method": "strings",
            }),
        )
        .add_results("boot-process", &json!({ "loader": "FIT", "loader_source": "binwalk" }));

    let template = "U-Boot {{ uboot.version | src }} (env: {{uboot.env_count|src}}), \
                    loader {{ boot_process.loader | src }}; plain {{ uboot.version }}; \
                    missing [{{ uboot.nope }}]\n";
    assert_eq!(TemplateRenderer::referenced_types(template), vec!["uboot", "boot-process"]);

    let rendered = renderer.render(template).expect("template renders");
    assert_eq!(
        rendered,
        "U-Boot 2023.07[^1] (env: 12[^1]), loader FIT[^2]; plain 2023.07; missing []\n\
         \n\
         [^1]: u-boot.bin (strings)\n\
         [^2]: binwalk\n"
    );
}

#[test]
fn template_without_citations_has_no_footnote_block() {
    let mut renderer = TemplateRenderer::new();
    renderer.add_results("rootfs", &json!({ "os_name": "OpenWrt", "os_name_source": "etc/os-release" }));
    assert_eq!(renderer.render("OS: {{ rootfs.os_name }}").expect("renders"), "OS: OpenWrt");
    assert_eq!(
        renderer.value("rootfs", "os_name").and_then(|v| v.source.as_deref()),
        Some("etc/os-release")
    );
}

#[test]
fn template_loops_and_conditionals_over_results() {
    let mut renderer = TemplateRenderer::new();
    renderer.add_results(
        "network-services",
        &json!({
            "daemons": [{ "name": "dropbear" }, { "name": "nginx" }],
            "ports": [80, 443],
            "ports_source": "etc/config",
            "telnet": false,
            "root_hash_type": "sha512",
        }),
    );
    let template = "{% for d in network_services.daemons %}- {{ d.name }}\n{% endfor %}\
                    {% if network_services.telnet %}telnet{% else %}no telnet{% endif %}\n\
                    {% if network_services.root_hash_type | string == \"sha512\" %}strong{% endif %} \
                    {{ network_services.ports | length }} ports {{ network_services.ports | src }}\n";
    assert_eq!(
        TemplateRenderer::referenced_types(template),
        vec!["network-services", "d"]
    );
    assert_eq!(
        renderer.render(template).expect("template renders"),
        "- dropbear\n- nginx\nno telnet\nstrong 2 ports [80,443][^1]\n\n[^1]: etc/config\n"
    );
}

#[test]
fn template_syntax_errors_are_reported() {
    let renderer = TemplateRenderer::new();
    let err = renderer.render("{% if uboot.version %}unterminated").unwrap_err();
    assert!(matches!(err, CacheError::Template(_)));
    assert!(err.to_string().starts_with("Failed to render template"));
}

#[test]
fn sidecars_fold_onto_existing_keys_only() {
    let map = json!({
        "size": 4096,
        "size_source": "stat",
        "size_method": "metadata",
        "orphan_method": "kept as a value",
    });
    let fields = track_fields(map.as_object().expect("object"));
    let keys: Vec<&str> = fields.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["orphan_method", "size"]);
    assert_eq!(fields["size"].source.as_deref(), Some("stat"));
    assert_eq!(fields["size"].method.as_deref(), Some("metadata"));
    assert_eq!(fields["size"].display(), "4096");
    assert_eq!(fields["orphan_method"].display(), "kept as a value");
}

#[test]
fn footnotes_are_numbered_per_distinct_pair() {
    let mut notes = FootnoteRegistry::new();
    assert_eq!(notes.add("u-boot.bin", Some("strings")), 1);
    assert_eq!(notes.add("binwalk", None), 2);
    assert_eq!(notes.add("u-boot.bin", Some("strings")), 1);
    assert_eq!(notes.add("u-boot.bin", None), 3);
    assert_eq!(notes.len(), 3);
    assert_eq!(
        notes.render(),
        "[^1]: u-boot.bin (strings)\n[^2]: binwalk\n[^3]: u-boot.bin\n"
    );
}

#[cfg(unix)]
mod subprocess {
    use std::os::unix::fs::PermissionsExt;

    use fwprobe_core::cache::SubprocessRunner;

    use super::*;

    #[test]
    fn shell_scripts_print_json_results() {
        let ws = Workspace::new();
        fs::write(ws.scripts.join("rootfs.sh"), "printf '{\"os_name\": \"OpenWrt\", \"firmware\": \"%s\"}' \"$(basename \"$1\")\"\n")
            .expect("script");
        let mut cache = ws.cache();
        let results =
            cache.analyze("rootfs", &ws.firmware, &SubprocessRunner::new()).expect("script runs");
        assert_eq!(results, json!({ "os_name": "OpenWrt", "firmware": "fw.img" }));
        assert!(ws.layout.results_path("rootfs").is_file());
    }

    #[test]
    fn failing_and_garbled_scripts_are_errors() {
        let ws = Workspace::new();
        fs::write(ws.scripts.join("rootfs.sh"), "echo boom >&2\nexit 3\n").expect("script");
        fs::write(ws.scripts.join("partitions.sh"), "echo 'not json'\n").expect("script");
        let mut cache = ws.cache();
        let runner = SubprocessRunner::new();

        let err = cache.analyze("rootfs", &ws.firmware, &runner).unwrap_err();
        match err {
            CacheError::ScriptFailed { status, stderr, .. } => {
                assert_eq!(status, "status 3");
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = cache.analyze("partitions", &ws.firmware, &runner).unwrap_err();
        assert!(matches!(err, CacheError::InvalidOutput { .. }), "unexpected error: {err}");
        assert!(!ws.layout.results_path("partitions").exists());
    }

    #[test]
    fn executable_receives_global_args_before_the_subcommand() {
        let ws = Workspace::new();
        let exe = ws.scripts.join("fake-fwprobe");
        fs::write(&exe, "#!/bin/sh\nprintf '{\"argv\": \"%s\"}' \"$*\"\n").expect("exe");
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).expect("chmod");

        let locator = ScriptLocator::new(None).with_executable(&exe);
        let runner = SubprocessRunner::new().with_global_args(["--config", "site.toml"]);
        let mut cache = AnalysisCache::new(ws.layout.clone(), locator);
        let results = cache.analyze("secure-boot", &ws.firmware, &runner).expect("exe runs");
        let expected = format!("--config site.toml secure-boot --format json {}", ws.firmware.display());
        assert_eq!(results["argv"], expected.as_str());
    }
}
