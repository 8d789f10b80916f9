use std::path::Path;

use anyhow::{Context, Result};
use fwprobe_core::cache::{normalize_type, AnalysisCache, ScriptLocator, SubprocessRunner};
use fwprobe_core::firmware::FirmwareImage;
use fwprobe_core::services::analysis::{default_registry, Session};
use serde_json::Value;

use crate::GlobalOptions;

/// Cache and runner wired from the session config.
pub fn open_cache(opts: &GlobalOptions, session: &Session) -> (AnalysisCache, SubprocessRunner) {
    let locator = ScriptLocator::new(session.config.scripts_dir.clone());
    let cache = AnalysisCache::new(session.layout.clone(), locator);
    let runner = SubprocessRunner::new().with_global_args(opts.to_args());
    (cache, runner)
}

/// Results of each analysis type for `firmware`, served from the cache when
/// the firmware and script hashes are unchanged.
pub fn cached_results(
    opts: &GlobalOptions,
    types: &[String],
    firmware: Option<&Path>,
) -> Result<Vec<(String, Value)>> {
    let registry = default_registry();
    let types: Vec<String> = types.iter().map(|t| normalize_type(t)).collect();
    for analysis_type in &types {
        registry.require(analysis_type)?;
    }

    let session = opts.session()?;
    let firmware =
        FirmwareImage::resolve(&session.config, &session.layout.work_dir, &session.tools, firmware)
            .context("Failed to resolve firmware")?;
    let (mut cache, runner) = open_cache(opts, &session);

    let mut results = Vec::with_capacity(types.len());
    for analysis_type in types {
        let value = cache
            .analyze(&analysis_type, &firmware.path, &runner)
            .with_context(|| format!("Cached analysis '{analysis_type}' failed"))?;
        results.push((analysis_type, value));
    }
    Ok(results)
}

/// Run one analysis through the cache and print its results as JSON.
pub fn analyze_command(
    opts: &GlobalOptions,
    analysis_type: &str,
    firmware: Option<&Path>,
) -> Result<()> {
    let results = cached_results(opts, &[analysis_type.to_string()], firmware)?;
    for (_, value) in results {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}
