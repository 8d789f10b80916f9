use fwprobe_core::report::{output_json, output_toml, Provenance, Report, ReportError, MAX_METHOD_LEN};
use serde::Serialize;
use serde_json::Value;

#[derive(Serialize)]
struct Entry {
    name: String,
    size: u64,
}

#[derive(Serialize)]
struct SampleReport {
    firmware_file: String,
    firmware_size: u64,
    version: Option<String>,
    empty: Vec<String>,
    commands: Vec<String>,
    entries: Vec<Entry>,
    #[serde(skip)]
    meta: Provenance,
}

impl Report for SampleReport {
    fn title(&self) -> &str {
        "Sample Analysis"
    }

    fn provenance(&self) -> &Provenance {
        &self.meta
    }

    fn to_value(&self) -> Result<Value, ReportError> {
        Ok(serde_json::to_value(self)?)
    }
}

fn sample() -> SampleReport {
    let mut report = SampleReport {
        firmware_file: "glkvm-rm1.img".to_string(),
        firmware_size: 1024,
        version: None,
        empty: Vec::new(),
        commands: vec!["bootm".to_string(), "fdt".to_string()],
        entries: vec![
            Entry { name: "a".to_string(), size: 1 },
            Entry { name: "b".to_string(), size: 2 },
        ],
        meta: Provenance::new(),
    };
    report.meta.add_metadata("firmware_size", "/tmp/fw/glkvm-rm1.img", "stat(2)");
    report.meta.add_metadata("commands", "u-boot.bin", "x".repeat(120));
    report.meta.add_metadata("version", "u-boot.bin", "never found");
    report
}

#[test]
fn to_map_omits_none_and_empty_lists() {
    let map = sample().to_map(false).unwrap();
    let keys: Vec<&str> = map.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["firmware_file", "firmware_size", "commands", "entries"]);
}

#[test]
fn sidecars_follow_their_field() {
    let map = sample().to_map(true).unwrap();
    let keys: Vec<&str> = map.keys().map(String::as_str).collect();
    assert_eq!(
        keys,
        vec![
            "firmware_file",
            "firmware_size",
            "firmware_size_source",
            "firmware_size_method",
            "commands",
            "commands_source",
            "commands_method",
            "entries",
        ]
    );
}

#[test]
fn toml_output_parses_and_documents_fields() {
    let report = sample();
    let body = output_toml(&report, report.title(), None, None).unwrap();

    assert!(body.starts_with("# Sample Analysis\n# Generated: "));
    assert!(body.contains("# Source: /tmp/fw/glkvm-rm1.img\n# Method: stat(2)\nfirmware_size = 1024\n"));

    let truncated = format!("# Method: {}...\n", "x".repeat(MAX_METHOD_LEN - 3));
    assert!(body.contains(&truncated), "method comment not truncated:\n{body}");

    let parsed: toml::Table = body.parse().unwrap();
    assert_eq!(parsed["firmware_file"].as_str(), Some("glkvm-rm1.img"));
    assert_eq!(parsed["commands"].as_array().unwrap().len(), 2);
    assert_eq!(parsed["entries"].as_array().unwrap().len(), 2);
    assert!(!parsed.contains_key("version"));
}

#[test]
fn inline_arrays_precede_tables_even_when_listed_later() {
    let report = sample();
    let body =
        output_toml(&report, "Ordered", None, Some(&["entries", "commands"][..])).unwrap();
    let commands = body.find("commands = ").unwrap();
    let entries = body.find("[[entries]]").unwrap();
    assert!(commands < entries);
    body.parse::<toml::Table>().unwrap();
}

#[test]
fn json_output_carries_sidecars() {
    let body = output_json(&sample()).unwrap();
    let value: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["firmware_size"], 1024);
    assert_eq!(value["firmware_size_source"], "/tmp/fw/glkvm-rm1.img");
    assert_eq!(value["commands_method"].as_str().unwrap().len(), 120);
    assert!(value.get("version").is_none());
    assert!(value.get("version_source").is_none());
}
