use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use fwprobe_core::cache::TemplateRenderer;
use fwprobe_core::services::analysis::default_registry;
use tracing::info;

use crate::commands::{cached_results, write_output};
use crate::GlobalOptions;

/// Fill a Jinja Markdown template from cached analysis results.
pub fn render_command(
    opts: &GlobalOptions,
    template: &Path,
    firmware: Option<&Path>,
    out: Option<&Path>,
) -> Result<()> {
    let text = fs::read_to_string(template)
        .with_context(|| format!("Failed to read template {}", template.display()))?;
    let registry = default_registry();
    // Loop variables (`{% for p in ... %}{{ p.name }}`) are not analysis types.
    let types: Vec<String> = TemplateRenderer::referenced_types(&text)
        .into_iter()
        .filter(|t| registry.get(t).is_some())
        .collect();
    info!(template = %template.display(), types = ?types, "rendering template");

    let mut renderer = TemplateRenderer::new();
    if !types.is_empty() {
        for (analysis_type, value) in cached_results(opts, &types, firmware)? {
            renderer.add_results(&analysis_type, &value);
        }
    }
    let body = renderer
        .render(&text)
        .with_context(|| format!("Failed to render {}", template.display()))?;
    write_output(&body, out)
}
