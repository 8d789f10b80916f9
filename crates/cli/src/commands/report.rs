use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use clap::ValueEnum;
use fwprobe_core::report::{output_json, output_toml, Report};
use fwprobe_core::services::analysis::default_registry;

use crate::console::success;
use crate::GlobalOptions;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Toml,
    Json,
}

/// Render a report in `format`.
pub fn render_report(report: &dyn Report, format: OutputFormat) -> Result<String> {
    let body = match format {
        OutputFormat::Toml => output_toml(report, report.title(), None, None)
            .context("Failed to render TOML report")?,
        OutputFormat::Json => output_json(report).context("Failed to render JSON report")?,
    };
    Ok(body)
}

/// Write `body` to `out`, or to stdout when no file is given.
pub fn write_output(body: &str, out: Option<&Path>) -> Result<()> {
    match out {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            fs::write(path, body)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            success(&format!("Wrote {}", path.display()));
        }
        None => {
            print!("{body}");
            if !body.ends_with('\n') {
                println!();
            }
        }
    }
    Ok(())
}

/// Run one topic analyzer and emit its report.
pub fn report_command(
    opts: &GlobalOptions,
    analyzer: &str,
    firmware: Option<&Path>,
    format: OutputFormat,
    out: Option<&Path>,
) -> Result<()> {
    let registry = default_registry();
    let analyzer = registry.require(analyzer)?;
    let session = opts.session()?;
    let output = session
        .run(analyzer, firmware)
        .with_context(|| format!("{} analysis failed", analyzer.name()))?;
    let body = render_report(output.report.as_ref(), format)?;
    write_output(&body, out)
}
