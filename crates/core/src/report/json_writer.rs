use serde_json::Value;

use super::{Report, ReportError};

/// Render a report (with provenance sidecars) as pretty JSON.
///
/// The output is parsed back before it is returned.
pub fn output_json(report: &dyn Report) -> Result<String, ReportError> {
    let map = report.to_map(true)?;
    let body = serde_json::to_string_pretty(&Value::Object(map))?;
    serde_json::from_str::<Value>(&body).map_err(|e| ReportError::InvalidJson(e.to_string()))?;
    Ok(body)
}
