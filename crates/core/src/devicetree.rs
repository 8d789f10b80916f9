//! Line-oriented regex scanning of device-tree *source* text.
//!
//! This does not decode DTB binaries: it reads the `.dts` text binwalk (via
//! dtc) leaves in the extraction tree. Each node header and property is
//! expected on its own line, which is how dtc prints them.

use std::sync::LazyLock;

use regex::Regex;

static NODE_OPEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:([A-Za-z_][\w-]*)\s*:\s*)?(/|&?[A-Za-z0-9_,.+-]+)(?:@([0-9A-Fa-f,]+))?\s*\{\s*$")
        .expect("static regex")
});
static NODE_CLOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\}\s*;\s*$").expect("static regex"));
static PROPERTY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z0-9_,.#+?-]+)\s*(?:=\s*(.*?))?\s*;\s*$").expect("static regex")
});
static QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""((?:[^"\\]|\\.)*)""#).expect("static regex"));
static CELL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"0x[0-9A-Fa-f]+|\b\d+\b").expect("static regex"));

/// One node of a device tree, with its raw property text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DtsNode {
    /// Full path, e.g. `/images/kernel` or `/serial@ff570000`.
    pub path: String,
    pub name: String,
    pub unit_address: Option<String>,
    pub label: Option<String>,
    /// Properties in source order; value is the raw text between `=` and `;`.
    pub properties: Vec<(String, Option<String>)>,
}

impl DtsNode {
    pub fn raw(&self, name: &str) -> Option<&str> {
        self.properties.iter().find(|(k, _)| k == name).and_then(|(_, v)| v.as_deref())
    }

    pub fn has(&self, name: &str) -> bool {
        self.properties.iter().any(|(k, _)| k == name)
    }

    /// First quoted string of a property.
    pub fn string(&self, name: &str) -> Option<String> {
        self.raw(name).and_then(|v| quoted_strings(v).into_iter().next())
    }

    /// Every quoted string of a property (`compatible = "a", "b";`).
    pub fn strings(&self, name: &str) -> Vec<String> {
        self.raw(name).map(quoted_strings).unwrap_or_default()
    }

    pub fn compatible(&self) -> Vec<String> {
        self.strings("compatible")
    }

    /// `status`, treating an absent property as enabled.
    pub fn is_enabled(&self) -> bool {
        match self.string("status") {
            Some(status) => status == "okay" || status == "ok",
            None => true,
        }
    }

    /// Integer cells of a `<...>` property.
    pub fn cells(&self, name: &str) -> Vec<u64> {
        self.raw(name).map(parse_cells).unwrap_or_default()
    }

    pub fn parent_path(&self) -> &str {
        match self.path.rfind('/') {
            Some(0) | None => "/",
            Some(idx) => &self.path[..idx],
        }
    }
}

/// Parse every node (and its properties) out of DTS text.
pub fn nodes(text: &str) -> Vec<DtsNode> {
    let mut nodes: Vec<DtsNode> = Vec::new();
    let mut stack: Vec<usize> = Vec::new();

    for line in text.lines() {
        if let Some(caps) = NODE_OPEN.captures(line) {
            let name = caps[2].to_string();
            let unit_address = caps.get(3).map(|m| m.as_str().to_string());
            let full_name = match &unit_address {
                Some(addr) => format!("{name}@{addr}"),
                None => name.clone(),
            };
            let path = match stack.last() {
                _ if name == "/" => "/".to_string(),
                Some(&parent) if nodes[parent].path == "/" => format!("/{full_name}"),
                Some(&parent) => format!("{}/{full_name}", nodes[parent].path),
                None => full_name.clone(),
            };
            nodes.push(DtsNode {
                path,
                name,
                unit_address,
                label: caps.get(1).map(|m| m.as_str().to_string()),
                properties: Vec::new(),
            });
            stack.push(nodes.len() - 1);
            continue;
        }
        if NODE_CLOSE.is_match(line) {
            stack.pop();
            continue;
        }
        if let (Some(caps), Some(&current)) = (PROPERTY.captures(line), stack.last()) {
            let key = caps[1].to_string();
            let value = caps.get(2).map(|m| m.as_str().trim().to_string());
            nodes[current].properties.push((key, value));
        }
    }
    nodes
}

/// First node with exactly this path.
pub fn node_at<'a>(nodes: &'a [DtsNode], path: &str) -> Option<&'a DtsNode> {
    nodes.iter().find(|n| n.path == path)
}

/// Direct children of `parent`.
pub fn children<'a>(nodes: &'a [DtsNode], parent: &'a str) -> impl Iterator<Item = &'a DtsNode> {
    nodes.iter().filter(move |n| n.path != "/" && n.parent_path() == parent)
}

/// First `name = "..."` string anywhere in the text.
pub fn property(text: &str, name: &str) -> Option<String> {
    let re = Regex::new(&format!(r#"(?m)^\s*{}\s*=\s*"([^"]*)""#, regex::escape(name))).ok()?;
    re.captures(text).map(|c| c[1].to_string())
}

/// Every quoted string of the first `name = ...;` property in the text.
pub fn string_list(text: &str, name: &str) -> Vec<String> {
    let Ok(re) = Regex::new(&format!(r"(?m)^\s*{}\s*=\s*(.*?);\s*$", regex::escape(name))) else {
        return Vec::new();
    };
    re.captures(text).map(|c| quoted_strings(&c[1])).unwrap_or_default()
}

/// Root `model` string.
pub fn model(text: &str) -> Option<String> {
    property(text, "model")
}

/// Root `compatible` list (the first `compatible` in the text).
pub fn compatible(text: &str) -> Vec<String> {
    let nodes = nodes(text);
    node_at(&nodes, "/").map(DtsNode::compatible).filter(|c| !c.is_empty()).unwrap_or_else(|| {
        string_list(text, "compatible")
    })
}

/// `/chosen` `bootargs`.
pub fn chosen_bootargs(text: &str) -> Option<String> {
    let nodes = nodes(text);
    node_at(&nodes, "/chosen").and_then(|n| n.string("bootargs"))
}

/// Total size of every `/memory` node's `reg`, decoded with the root node's
/// `#address-cells` / `#size-cells` (2 and 1 when absent).
pub fn memory_size(text: &str) -> Option<u64> {
    let nodes = nodes(text);
    let root = node_at(&nodes, "/");
    let root_cells = |name: &str, default: usize| {
        root.and_then(|n| n.cells(name).first().copied())
            .and_then(|c| usize::try_from(c).ok())
            .unwrap_or(default)
    };
    let address_cells = root_cells("#address-cells", 2);
    let size_cells = root_cells("#size-cells", 1);
    if size_cells == 0 {
        return None;
    }
    let stride = address_cells + size_cells;

    let mut total = 0u64;
    let mut found = false;
    for node in nodes.iter().filter(|n| n.name == "memory" && n.parent_path() == "/") {
        let cells = node.cells("reg");
        if cells.is_empty() || cells.len() % stride != 0 {
            continue;
        }
        let size = cells
            .chunks(stride)
            .map(|entry| join_cells(&entry[address_cells..]))
            .fold(0u64, u64::saturating_add);
        total = total.saturating_add(size);
        found = true;
    }
    found.then_some(total)
}

/// Big-endian concatenation of 32-bit cells, saturating at `u64::MAX`.
fn join_cells(cells: &[u64]) -> u64 {
    let wide = cells.iter().fold(0u128, |acc, &c| (acc << 32) | u128::from(c & 0xffff_ffff));
    u64::try_from(wide).unwrap_or(u64::MAX)
}

/// A `signature*` node of a FIT configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureNode {
    pub path: String,
    pub algo: Option<String>,
    pub key_name_hint: Option<String>,
    pub sign_images: Vec<String>,
    pub has_value: bool,
}

/// Every `signature*` node in the tree.
pub fn signature_nodes(text: &str) -> Vec<SignatureNode> {
    nodes(text)
        .iter()
        .filter(|n| n.name.starts_with("signature") && n.path != "/signature")
        .map(signature_node)
        .collect()
}

fn signature_node(n: &DtsNode) -> SignatureNode {
    SignatureNode {
        path: n.path.clone(),
        algo: n.string("algo"),
        key_name_hint: n.string("key-name-hint"),
        sign_images: n.strings("sign-images"),
        has_value: n.has("value"),
    }
}

/// An entry under `/images` of a FIT description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FitImage {
    pub name: String,
    pub description: Option<String>,
    pub kind: Option<String>,
    pub arch: Option<String>,
    pub compression: Option<String>,
    pub load: Option<String>,
    pub hash_algos: Vec<String>,
}

pub fn fit_images(text: &str) -> Vec<FitImage> {
    let nodes = nodes(text);
    children(&nodes, "/images")
        .map(|img| {
            let prefix = format!("{}/", img.path);
            let hash_algos = nodes
                .iter()
                .filter(|n| n.path.starts_with(&prefix) && n.name.starts_with("hash"))
                .filter_map(|n| n.string("algo"))
                .collect();
            FitImage {
                name: img.name.clone(),
                description: img.string("description"),
                kind: img.string("type"),
                arch: img.string("arch"),
                compression: img.string("compression"),
                load: img.raw("load").map(str::to_string),
                hash_algos,
            }
        })
        .collect()
}

/// An entry under `/configurations` of a FIT description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FitConfiguration {
    pub name: String,
    pub description: Option<String>,
    pub kernel: Option<String>,
    pub firmware: Option<String>,
    pub fdt: Option<String>,
    pub loadables: Vec<String>,
    pub signatures: Vec<SignatureNode>,
}

pub fn fit_configurations(text: &str) -> Vec<FitConfiguration> {
    let nodes = nodes(text);
    children(&nodes, "/configurations")
        .map(|conf| {
            let prefix = format!("{}/", conf.path);
            let signatures = nodes
                .iter()
                .filter(|n| n.path.starts_with(&prefix) && n.name.starts_with("signature"))
                .map(signature_node)
                .collect();
            FitConfiguration {
                name: conf.name.clone(),
                description: conf.string("description"),
                kernel: conf.string("kernel"),
                firmware: conf.string("firmware"),
                fdt: conf.string("fdt"),
                loadables: conf.strings("loadables"),
                signatures,
            }
        })
        .collect()
}

/// Public-key nodes (`/signature/key-*`) embedded in a U-Boot control DTB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNode {
    pub name: String,
    pub algo: Option<String>,
    pub required: Option<String>,
    pub has_modulus: bool,
}

pub fn signature_keys(text: &str) -> Vec<KeyNode> {
    let nodes = nodes(text);
    children(&nodes, "/signature")
        .map(|n| KeyNode {
            name: n.name.clone(),
            algo: n.string("algo"),
            required: n.string("required"),
            has_modulus: n.has("rsa,modulus"),
        })
        .collect()
}

fn quoted_strings(raw: &str) -> Vec<String> {
    QUOTED.captures_iter(raw).map(|c| c[1].to_string()).collect()
}

fn parse_cells(raw: &str) -> Vec<u64> {
    let Some(start) = raw.find('<') else { return Vec::new() };
    let end = raw[start..].find('>').map(|e| start + e).unwrap_or(raw.len());
    CELL.find_iter(&raw[start + 1..end])
        .filter_map(|m| {
            let s = m.as_str();
            match s.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16).ok(),
                None => s.parse().ok(),
            }
        })
        .collect()
}
