use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{gzip_payload_strings, relative_display};
use crate::devicetree::{fit_configurations, fit_images, signature_keys};
use crate::finders::{device_tree_dirs, device_tree_files, find_device_tree_dir};
use crate::report::{Provenance, Report, ReportError};
use crate::services::analysis::{
    AnalysisContext, AnalysisError, AnalysisOutput, Requirements, TopicAnalyzer,
};

static VERIFICATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)(verifying hash|signature check|sig-required|required-node",
        r"|rsa\d{4}|sha256,rsa|bad hash|verification failed)"
    ))
    .expect("static regex")
});

/// Longest list of matching U-Boot strings kept in the report.
const MAX_VERIFICATION_STRINGS: usize = 20;

/// FITs inspected for signatures: (offset name, label).
const FITS: [(&str, &str); 2] = [("BOOTLOADER_FIT", "bootloader"), ("KERNEL_FIT", "kernel")];

/// A `signature` node inside a FIT configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FITSignature {
    pub fit: String,
    pub configuration: String,
    pub algo: Option<String>,
    pub key_name_hint: Option<String>,
    pub sign_images: Vec<String>,
    /// The node carries a `value`, i.e. the image was actually signed.
    pub signed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageHash {
    pub fit: String,
    pub image: String,
    pub algos: Vec<String>,
}

/// A public key embedded in a control DTB (`/signature/key-*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublicKey {
    pub source: String,
    pub name: String,
    pub algo: Option<String>,
    pub required: Option<String>,
    pub has_modulus: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SecureBootAnalysis {
    pub firmware_file: String,
    pub firmware_size: u64,
    pub secure_boot_status: String,
    pub verdict_reason: String,
    pub unsigned_configurations: Vec<String>,
    pub uboot_verification_strings: Vec<String>,
    pub verity_references: Vec<String>,
    pub fit_signatures: Vec<FITSignature>,
    pub image_hashes: Vec<ImageHash>,
    pub public_keys: Vec<PublicKey>,
    #[serde(skip)]
    meta: Provenance,
}

impl Report for SecureBootAnalysis {
    fn title(&self) -> &str {
        "Secure Boot Analysis"
    }

    fn provenance(&self) -> &Provenance {
        &self.meta
    }

    fn to_value(&self) -> Result<Value, ReportError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Overall status and the reason for it.
pub fn verdict(
    signatures: &[FITSignature],
    keys: &[PublicKey],
    hashes: &[ImageHash],
) -> (&'static str, &'static str) {
    let signed = signatures.iter().any(|s| s.signed);
    let required = keys.iter().any(|k| k.required.is_some());
    if signed && required {
        ("enforced", "FIT configurations are signed and U-Boot holds a required public key")
    } else if signed {
        ("signed-not-enforced", "FIT signatures present but no U-Boot key is marked required")
    } else if !signatures.is_empty() {
        ("unsigned-signature-nodes", "Signature nodes present without signature values")
    } else if !hashes.is_empty() {
        ("hash-only", "FIT images carry hashes only (integrity, not authenticity)")
    } else {
        ("none", "No FIT signatures, image hashes or public keys found")
    }
}

/// Signatures, hashes and unsigned configurations of one FIT's DTS text.
pub fn inspect_fit(label: &str, dts: &str) -> (Vec<FITSignature>, Vec<ImageHash>, Vec<String>) {
    let mut signatures = Vec::new();
    let mut unsigned = Vec::new();
    for conf in fit_configurations(dts) {
        if conf.signatures.is_empty() {
            unsigned.push(format!("{label}:{}", conf.name));
        }
        signatures.extend(conf.signatures.into_iter().map(|sig| FITSignature {
            fit: label.to_string(),
            configuration: conf.name.clone(),
            algo: sig.algo,
            key_name_hint: sig.key_name_hint,
            sign_images: sig.sign_images,
            signed: sig.has_value,
        }));
    }
    let hashes = fit_images(dts)
        .into_iter()
        .filter(|img| !img.hash_algos.is_empty())
        .map(|img| ImageHash { fit: label.to_string(), image: img.name, algos: img.hash_algos })
        .collect();
    (signatures, hashes, unsigned)
}

/// First readable `.dts` in `dir`.
fn read_dts(dir: &Path) -> Option<(PathBuf, String)> {
    device_tree_files(dir)
        .into_iter()
        .filter(|p| p.extension().is_some_and(|e| e == "dts"))
        .find_map(|p| fs::read_to_string(&p).ok().map(|text| (p, text)))
}

pub struct SecureBootAnalyzer;

impl TopicAnalyzer for SecureBootAnalyzer {
    fn name(&self) -> &'static str {
        "secure-boot"
    }

    fn description(&self) -> &'static str {
        "FIT signatures, embedded public keys, U-Boot verification and dm-verity hints"
    }

    fn requirements(&self) -> Requirements {
        Requirements { extraction: true, offsets: true }
    }

    fn analyze(&self, ctx: &AnalysisContext) -> Result<AnalysisOutput, AnalysisError> {
        let extraction = ctx.extraction(self.name())?;
        let offsets = ctx.offsets(self.name())?;
        let mut report = SecureBootAnalysis {
            firmware_file: ctx.firmware.file_name.clone(),
            firmware_size: ctx.firmware.size,
            ..SecureBootAnalysis::default()
        };

        let mut fit_sources = Vec::new();
        for (name, label) in FITS {
            let Some(offset) = offsets.offset(name) else { continue };
            let Some(dir) = find_device_tree_dir(extraction, offset) else {
                debug!(fit = label, offset, "no extracted device tree for FIT");
                continue;
            };
            let Some((path, dts)) = read_dts(&dir) else { continue };
            let (signatures, hashes, unsigned) = inspect_fit(label, &dts);
            report.fit_signatures.extend(signatures);
            report.image_hashes.extend(hashes);
            report.unsigned_configurations.extend(unsigned);
            fit_sources.push(relative_display(&path, extraction));
        }
        let fit_source = fit_sources.join(", ");
        report.meta.add_metadata("fit_signatures", &fit_source, "configurations/*/signature* nodes");
        report.meta.add_metadata("image_hashes", &fit_source, "/images/*/hash* algo properties");
        report.meta.add_metadata(
            "unsigned_configurations",
            &fit_source,
            "Configurations without a signature node",
        );

        for dir in device_tree_dirs(extraction) {
            let Some((path, dts)) = read_dts(&dir) else { continue };
            let source = relative_display(&path, extraction);
            report.public_keys.extend(signature_keys(&dts).into_iter().map(|k| PublicKey {
                source: source.clone(),
                name: k.name,
                algo: k.algo,
                required: k.required,
                has_modulus: k.has_modulus,
            }));
        }
        report.meta.add_metadata(
            "public_keys",
            extraction.display().to_string(),
            "/signature/key-* nodes in every extracted DTS",
        );

        let mut verification: Vec<String> = Vec::new();
        for line in gzip_payload_strings(ctx, "UBOOT_GZ") {
            if VERIFICATION.is_match(&line) && !verification.contains(&line) {
                verification.push(line);
            }
            if verification.len() >= MAX_VERIFICATION_STRINGS {
                break;
            }
        }
        report.uboot_verification_strings = verification;
        report.meta.add_metadata(
            "uboot_verification_strings",
            "U-Boot gzip payload at UBOOT_GZ",
            "Printable strings mentioning hash/signature verification",
        );

        match ctx.squashfs_root(self.name()) {
            Ok(root) => {
                let files = ctx.tools.grep_files("dm-verity|veritysetup|verity_", &root)?;
                report.verity_references =
                    files.iter().map(|f| relative_display(f, &root)).collect();
                report.meta.add_metadata(
                    "verity_references",
                    root.display().to_string(),
                    "grep -rlIE 'dm-verity|veritysetup|verity_'",
                );
            }
            Err(err) => debug!(%err, "skipping dm-verity scan"),
        }

        let (status, reason) =
            verdict(&report.fit_signatures, &report.public_keys, &report.image_hashes);
        report.secure_boot_status = status.to_string();
        report.verdict_reason = reason.to_string();
        report.meta.add_metadata(
            "secure_boot_status",
            "fit_signatures, public_keys, image_hashes",
            "Signed and required key: enforced; signed only: not enforced; hashes only: hash-only",
        );

        Ok(AnalysisOutput::new(report))
    }
}
