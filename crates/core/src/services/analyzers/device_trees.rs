use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::relative_display;
use crate::devicetree::{self, DtsNode};
use crate::extraction::scan_printable_strings;
use crate::finders::{device_tree_dirs, device_tree_files};
use crate::offsets::{format_hex, parse_hex, OffsetManager, OFFSET_NAMES};
use crate::report::{Provenance, Report, ReportError};
use crate::services::analysis::{
    AnalysisContext, AnalysisError, AnalysisOutput, Requirements, TopicAnalyzer,
};

static VENDOR_COMPATIBLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9-]*,[a-z0-9][a-z0-9.,_-]*$").expect("static regex"));

const MIB: u64 = 1024 * 1024;

/// Category keywords matched against a node's compatible strings and name.
const CATEGORIES: [(&str, &[&str]); 12] = [
    ("serial", &["uart", "serial"]),
    ("i2c", &["i2c"]),
    ("spi", &["spi"]),
    ("storage", &["mmc", "sdhci", "dwmmc", "nand", "sfc"]),
    ("network", &["ethernet", "gmac", "stmmac", "mdio"]),
    ("usb", &["usb", "dwc3", "ehci", "ohci"]),
    ("gpio", &["gpio", "pinctrl"]),
    ("display", &["hdmi", "vop", "dsi", "lcdc"]),
    ("camera", &["isp", "vicap", "csi", "cif"]),
    ("multimedia", &["vpu", "rkvenc", "rkvdec", "mpp", "rga", "npu"]),
    ("audio", &["i2s", "codec", "sound"]),
    ("power", &["pmic", "regulator", "pwm", "tsadc", "thermal"]),
];

/// An enabled device-tree node that describes a piece of hardware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HardwareComponent {
    pub name: String,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub compatible: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceTree {
    pub path: String,
    /// `dts` for decompiled source, `dtb-strings` for the printable-string fallback.
    pub format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootargs: Option<String>,
    pub node_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub compatible: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hardware: Vec<HardwareComponent>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceTreeAnalysis {
    pub firmware_file: String,
    pub firmware_size: u64,
    pub device_tree_count: usize,
    pub board_model: Option<String>,
    pub soc: Option<String>,
    pub device_trees: Vec<DeviceTree>,
    #[serde(skip)]
    meta: Provenance,
}

impl Report for DeviceTreeAnalysis {
    fn title(&self) -> &str {
        "Device Tree Analysis"
    }

    fn provenance(&self) -> &Provenance {
        &self.meta
    }

    fn to_value(&self) -> Result<Value, ReportError> {
        Ok(serde_json::to_value(self)?)
    }
}

fn categorize(node: &DtsNode, compatible: &[String]) -> Option<&'static str> {
    let haystack = format!("{} {}", node.name, compatible.join(" ")).to_lowercase();
    CATEGORIES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| haystack.contains(k)))
        .map(|(category, _)| *category)
}

/// Enabled nodes with a `compatible` that fall into a known category.
pub fn hardware_components(nodes: &[DtsNode]) -> Vec<HardwareComponent> {
    nodes
        .iter()
        .filter(|n| n.path != "/" && n.is_enabled())
        .filter_map(|n| {
            let compatible = n.compatible();
            if compatible.is_empty() {
                return None;
            }
            let category = categorize(n, &compatible)?;
            Some(HardwareComponent {
                name: n.name.clone(),
                category: category.to_string(),
                address: n.unit_address.as_ref().map(|a| format!("0x{a}")),
                label: n.label.clone(),
                compatible,
            })
        })
        .collect()
}

/// Describe one DTS source text.
pub fn describe_dts(path: String, text: &str) -> DeviceTree {
    let nodes = devicetree::nodes(text);
    DeviceTree {
        path,
        format: "dts".to_string(),
        offset: None,
        role: None,
        model: devicetree::model(text),
        memory_mb: devicetree::memory_size(text).map(|b| b / MIB),
        bootargs: devicetree::chosen_bootargs(text),
        node_count: nodes.len(),
        compatible: devicetree::compatible(text),
        hardware: hardware_components(&nodes),
    }
}

/// Fallback for a DTB without decompiled source: vendor,device strings only.
pub fn describe_dtb(path: String, data: &[u8], min_len: usize) -> DeviceTree {
    let mut compatible: Vec<String> = Vec::new();
    for s in scan_printable_strings(data, min_len) {
        if VENDOR_COMPATIBLE.is_match(&s) && !compatible.contains(&s) {
            compatible.push(s);
        }
    }
    DeviceTree {
        path,
        format: "dtb-strings".to_string(),
        offset: None,
        role: None,
        model: None,
        memory_mb: None,
        bootargs: None,
        node_count: 0,
        compatible,
        hardware: Vec::new(),
    }
}

/// Which offset name (if any) points at the directory named `dir_name`.
fn role_for(dir_name: &str, offsets: Option<&OffsetManager>) -> Option<String> {
    let offset = parse_hex(dir_name)?;
    let offsets = offsets?;
    OFFSET_NAMES
        .iter()
        .find(|name| offsets.offset(name) == Some(offset))
        .map(|name| name.to_lowercase())
}

fn load_tree(path: &Path, label: String, min_len: usize) -> Option<DeviceTree> {
    if path.extension().is_some_and(|e| e == "dts") {
        return match fs::read_to_string(path) {
            Ok(text) => Some(describe_dts(label, &text)),
            Err(err) => {
                debug!(path = %path.display(), %err, "unreadable DTS");
                None
            }
        };
    }
    match fs::read(path) {
        Ok(data) => Some(describe_dtb(label, &data, min_len)),
        Err(err) => {
            debug!(path = %path.display(), %err, "unreadable DTB");
            None
        }
    }
}

pub struct DeviceTreesAnalyzer;

impl TopicAnalyzer for DeviceTreesAnalyzer {
    fn name(&self) -> &'static str {
        "device-trees"
    }

    fn description(&self) -> &'static str {
        "Every extracted device tree: model, memory, bootargs and enabled hardware"
    }

    fn requirements(&self) -> Requirements {
        Requirements { extraction: true, offsets: false }
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Result<AnalysisOutput, AnalysisError> {
        let extraction = ctx.extraction(self.name())?;
        let mut report = DeviceTreeAnalysis {
            firmware_file: ctx.firmware.file_name.clone(),
            firmware_size: ctx.firmware.size,
            ..DeviceTreeAnalysis::default()
        };

        for dir in device_tree_dirs(extraction) {
            let dir_name =
                dir.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
            for file in device_tree_files(&dir) {
                let label = relative_display(&file, extraction);
                let Some(mut tree) = load_tree(&file, label, ctx.config.min_string_length) else {
                    continue;
                };
                tree.offset = parse_hex(&dir_name).map(format_hex);
                tree.role = role_for(&dir_name, ctx.offsets.as_ref());
                report.device_trees.push(tree);
            }
        }
        report.device_tree_count = report.device_trees.len();

        let primary = report
            .device_trees
            .iter()
            .find(|t| t.role.as_deref() == Some("kernel_fit") && t.model.is_some())
            .or_else(|| report.device_trees.iter().find(|t| t.model.is_some()));
        report.board_model = primary.and_then(|t| t.model.clone());
        report.soc = report
            .device_trees
            .iter()
            .flat_map(|t| t.compatible.iter())
            .find(|c| c.starts_with("rockchip,"))
            .map(|c| c.trim_start_matches("rockchip,").to_uppercase());

        let source = extraction.display().to_string();
        report.meta.add_metadata(
            "device_trees",
            &source,
            "Hex-named extraction dirs holding .dts (or .dtb string fallback)",
        );
        report.meta.add_metadata("board_model", &source, "Root model of the kernel device tree");
        report.meta.add_metadata("soc", &source, "First rockchip,<soc> compatible string");
        Ok(AnalysisOutput::new(report))
    }
}
