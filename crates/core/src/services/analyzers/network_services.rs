//! Services, listening ports and local accounts of the root filesystem.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use super::relative_display;
use crate::finders::{EntryKind, FileQuery};
use crate::report::{Provenance, Report, ReportError};
use crate::services::analysis::{
    AnalysisContext, AnalysisError, AnalysisOutput, Requirements, TopicAnalyzer,
};

/// Config files larger than this are not scanned for ports.
const MAX_CONFIG_BYTES: u64 = 256 * 1024;

static PORT_DIRECTIVES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^\s*listen\s+(?:[\w.\-]+:|\[[0-9a-fA-F:]+\]:)?(\d{1,5})\b",
        r"^\s*Port\s+(\d{1,5})\s*$",
        r"^\s*server\.port\s*=\s*(\d{1,5})\b",
        r"^\s*option\s+(?:listen_https?|port)\s+'?(?:[\d.]+:)?(\d{1,5})'?",
        r"^\s*(?:http_)?port\s*=\s*(\d{1,5})\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

/// Daemons recognised by binary name: (name, description, default ports).
const KNOWN_DAEMONS: [(&str, &str, &[u16]); 16] = [
    ("dropbear", "Dropbear SSH server", &[22]),
    ("sshd", "OpenSSH server", &[22]),
    ("telnetd", "Telnet server", &[23]),
    ("nginx", "nginx web server", &[80, 443]),
    ("lighttpd", "lighttpd web server", &[80, 443]),
    ("uhttpd", "OpenWrt uHTTPd web server", &[80, 443]),
    ("dnsmasq", "DNS/DHCP server", &[53, 67]),
    ("avahi-daemon", "mDNS/DNS-SD responder", &[5353]),
    ("ttyd", "Web terminal", &[7681]),
    ("mosquitto", "MQTT broker", &[1883]),
    ("vsftpd", "FTP server", &[21]),
    ("smbd", "Samba file server", &[445]),
    ("tailscaled", "Tailscale VPN daemon", &[41641]),
    ("zerotier-one", "ZeroTier VPN daemon", &[9993]),
    ("frpc", "frp reverse proxy client", &[]),
    ("janus", "Janus WebRTC gateway", &[8088]),
];

const BIN_DIRS: [&str; 5] = ["usr/sbin", "usr/bin", "sbin", "bin", "usr/local/bin"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Service {
    pub name: String,
    pub path: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Daemon {
    pub name: String,
    pub path: String,
    pub description: String,
    pub default_ports: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListeningPort {
    pub port: u16,
    pub file: String,
    pub directive: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserAccount {
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    pub shell: String,
    pub login_shell: bool,
    pub hash_type: String,
    pub hash_status: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkServicesAnalysis {
    pub firmware_file: String,
    pub firmware_size: u64,
    pub init_script_count: usize,
    pub daemon_count: usize,
    pub account_count: usize,
    pub root_hash_type: Option<String>,
    pub services: Vec<Service>,
    pub daemons: Vec<Daemon>,
    pub listening_ports: Vec<ListeningPort>,
    pub accounts: Vec<UserAccount>,
    #[serde(skip)]
    meta: Provenance,
}

impl Report for NetworkServicesAnalysis {
    fn title(&self) -> &str {
        "Network Services Analysis"
    }

    fn provenance(&self) -> &Provenance {
        &self.meta
    }

    fn to_value(&self) -> Result<Value, ReportError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Classify a passwd/shadow hash field: `(kind, description)`.
///
/// Checked in order: locked markers, the shadow placeholder, anything shorter
/// than `weak_len`, then the `$id$` prefix.
pub fn classify_password_hash(hash: &str, weak_len: usize) -> (&'static str, String) {
    match hash {
        "" | "*" | "!" => return ("locked", "No password / locked".to_string()),
        "x" => return ("shadow", "Password in shadow file".to_string()),
        _ => {}
    }
    if hash.len() < weak_len {
        return ("weak", "Weak/short hash (potential issue)".to_string());
    }
    let prefix: String = hash.chars().take(3).collect();
    match prefix.as_str() {
        "$1$" => ("md5", "MD5 hash (weak)".to_string()),
        "$5$" => ("sha256", "SHA-256 hash".to_string()),
        "$6$" => ("sha512", "SHA-512 hash (strong)".to_string()),
        "$y$" => ("yescrypt", "yescrypt hash (strong)".to_string()),
        _ => ("unknown", format!("Unknown hash type {prefix}")),
    }
}

/// Join `/etc/passwd` with `/etc/shadow` (when the passwd field is `x`).
pub fn parse_accounts(passwd: &str, shadow: Option<&str>, weak_len: usize) -> Vec<UserAccount> {
    let shadow_hashes: BTreeMap<&str, &str> = shadow
        .unwrap_or_default()
        .lines()
        .filter_map(|l| {
            let mut parts = l.split(':');
            Some((parts.next()?, parts.next()?))
        })
        .collect();

    passwd
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 7 {
                return None;
            }
            let username = fields[0];
            let hash = match (fields[1], shadow_hashes.get(username)) {
                ("x", Some(shadow_hash)) => *shadow_hash,
                (field, _) => field,
            };
            let (hash_type, hash_status) = classify_password_hash(hash, weak_len);
            let shell = fields[6].to_string();
            Some(UserAccount {
                username: username.to_string(),
                uid: fields[2].parse().ok()?,
                gid: fields[3].parse().ok()?,
                home: fields[5].to_string(),
                login_shell: !(shell.ends_with("nologin") || shell.ends_with("false")),
                shell,
                hash_type: hash_type.to_string(),
                hash_status,
            })
        })
        .collect()
}

/// Port directives found in one config file's text.
pub fn scan_ports(text: &str, file: &str) -> Vec<ListeningPort> {
    let mut found = Vec::new();
    for line in text.lines() {
        for re in PORT_DIRECTIVES.iter() {
            let Some(port) = re.captures(line).and_then(|c| c[1].parse::<u16>().ok()) else {
                continue;
            };
            if port != 0 && !found.iter().any(|p: &ListeningPort| p.port == port) {
                found.push(ListeningPort {
                    port,
                    file: file.to_string(),
                    directive: line.trim().to_string(),
                });
            }
            break;
        }
    }
    found
}

fn init_services(root: &Path) -> Vec<Service> {
    let init_dir = root.join("etc/init.d");
    let rc_dir = root.join("etc/rc.d");
    FileQuery::new()
        .kind(EntryKind::File)
        .max_depth(1)
        .find(&init_dir)
        .into_iter()
        .filter_map(|path| {
            let name = path.file_name()?.to_string_lossy().to_string();
            // Buildroot scripts are S??name and always run; OpenWrt links rc.d/S??name.
            let buildroot = name.len() > 3 && name.starts_with('S');
            let openwrt = !FileQuery::new()
                .include(&format!("S??{name}"))
                .max_depth(1)
                .find(&rc_dir)
                .is_empty();
            Some(Service { path: relative_display(&path, root), enabled: buildroot || openwrt, name })
        })
        .collect()
}

fn known_daemons(root: &Path) -> Vec<Daemon> {
    KNOWN_DAEMONS
        .iter()
        .filter_map(|(name, description, ports)| {
            let path = BIN_DIRS.iter().map(|d| root.join(d).join(name)).find(|p| {
                fs::symlink_metadata(p).is_ok()
            })?;
            Some(Daemon {
                name: name.to_string(),
                path: relative_display(&path, root),
                description: description.to_string(),
                default_ports: ports.to_vec(),
            })
        })
        .collect()
}

fn config_ports(root: &Path) -> Vec<ListeningPort> {
    let etc = root.join("etc");
    let mut ports = Vec::new();
    for path in FileQuery::new().kind(EntryKind::File).find(&etc) {
        let small = fs::metadata(&path).map(|m| m.len() <= MAX_CONFIG_BYTES).unwrap_or(false);
        if !small {
            continue;
        }
        let Ok(text) = fs::read_to_string(&path) else { continue };
        ports.extend(scan_ports(&text, &relative_display(&path, root)));
    }
    ports.sort_by(|a, b| a.port.cmp(&b.port).then_with(|| a.file.cmp(&b.file)));
    ports
}

pub struct NetworkServicesAnalyzer;

impl TopicAnalyzer for NetworkServicesAnalyzer {
    fn name(&self) -> &'static str {
        "network-services"
    }

    fn description(&self) -> &'static str {
        "Init scripts, network daemons, configured ports and user accounts"
    }

    fn requirements(&self) -> Requirements {
        Requirements { extraction: true, offsets: false }
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Result<AnalysisOutput, AnalysisError> {
        let root = ctx.squashfs_root(self.name())?;
        let mut report = NetworkServicesAnalysis {
            firmware_file: ctx.firmware.file_name.clone(),
            firmware_size: ctx.firmware.size,
            ..NetworkServicesAnalysis::default()
        };

        report.services = init_services(&root);
        report.init_script_count = report.services.len();
        report.meta.add_metadata("services", "squashfs-root/etc/init.d", "Init scripts; rc.d links");

        report.daemons = known_daemons(&root);
        report.daemon_count = report.daemons.len();
        report.meta.add_metadata(
            "daemons",
            "squashfs-root/{usr/,}{s,}bin",
            "Known daemon binary names present in the rootfs",
        );

        report.listening_ports = config_ports(&root);
        report.meta.add_metadata(
            "listening_ports",
            "squashfs-root/etc",
            "listen/Port/server.port/option port directives in config files",
        );

        let passwd_path = root.join("etc/passwd");
        if let Ok(passwd) = fs::read_to_string(&passwd_path) {
            let shadow = fs::read_to_string(root.join("etc/shadow")).ok();
            report.accounts =
                parse_accounts(&passwd, shadow.as_deref(), ctx.config.weak_hash_length);
            report.account_count = report.accounts.len();
            report.root_hash_type = report
                .accounts
                .iter()
                .find(|a| a.username == "root")
                .map(|a| a.hash_type.clone());
            report.meta.add_metadata(
                "accounts",
                "squashfs-root/etc/passwd + etc/shadow",
                "passwd fields; hash from shadow when passwd has x",
            );
            report.meta.add_metadata(
                "root_hash_type",
                "squashfs-root/etc/shadow",
                "Prefix classification of the root password hash",
            );
        }

        Ok(AnalysisOutput::new(report))
    }
}
