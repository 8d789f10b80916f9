use anyhow::Result;
use serde::Serialize;

use fwprobe_core::services::analysis::default_registry;

#[derive(Debug, Serialize)]
pub struct AnalyzerInfo {
    pub name: String,
    pub description: String,
    pub needs_extraction: bool,
    pub needs_offsets: bool,
}

pub fn analyzer_infos() -> Vec<AnalyzerInfo> {
    let registry = default_registry();
    registry
        .names()
        .into_iter()
        .filter_map(|name| {
            let analyzer = registry.get(&name)?;
            let requirements = analyzer.requirements();
            Some(AnalyzerInfo {
                description: analyzer.description().to_string(),
                needs_extraction: requirements.extraction,
                needs_offsets: requirements.offsets,
                name,
            })
        })
        .collect()
}

/// List the built-in analyzers.
pub fn list_analyzers_command(json: bool) -> Result<()> {
    let entries = analyzer_infos();

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!("Analyzers:");
    for entry in entries {
        let mut needs = Vec::new();
        if entry.needs_extraction {
            needs.push("extraction");
        }
        if entry.needs_offsets {
            needs.push("offsets");
        }
        if needs.is_empty() {
            println!("- {}: {}", entry.name, entry.description);
        } else {
            println!("- {}: {} (needs {})", entry.name, entry.description, needs.join(", "));
        }
    }

    Ok(())
}
