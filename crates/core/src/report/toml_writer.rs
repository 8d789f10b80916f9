use chrono::Utc;
use serde_json::{Map, Value};

use super::{is_complex, Report, ReportError};

/// Method comments longer than this are truncated with an ellipsis.
pub const MAX_METHOD_LEN: usize = 80;

/// Render a report as a commented TOML document.
///
/// Simple fields come first, each preceded by `# Source:` / `# Method:`
/// comments; complex fields follow under a header comment. The document is
/// parsed back before it is returned.
pub fn output_toml(
    report: &dyn Report,
    title: &str,
    simple_fields: Option<&[&str]>,
    complex_fields: Option<&[&str]>,
) -> Result<String, ReportError> {
    let map = report.to_map(false)?;
    let simple_fields = simple_fields.or_else(|| report.simple_fields());
    let complex_fields = complex_fields.or_else(|| report.complex_fields());
    let (simple, complex) = field_order(&map, simple_fields, complex_fields);
    let provenance = report.provenance();

    let mut out = String::new();
    out.push_str(&format!("# {}\n", single_line(title)));
    out.push_str(&format!("# Generated: {}\n", Utc::now().to_rfc3339()));

    if !simple.is_empty() {
        out.push('\n');
    }
    for key in &simple {
        let Some(value) = map.get(key.as_str()) else { continue };
        if let Some(source) = provenance.source(key) {
            out.push_str(&format!("# Source: {}\n", single_line(source)));
        }
        if let Some(method) = provenance.method(key) {
            out.push_str(&format!("# Method: {}\n", truncate_method(&single_line(method))));
        }
        out.push_str(&render_entry(key, value)?);
    }

    for key in &complex {
        let Some(value) = map.get(key.as_str()) else { continue };
        out.push('\n');
        out.push_str(&format!("# {}\n", heading(key)));
        if let Some(source) = provenance.source(key) {
            out.push_str(&format!("# Source: {}\n", single_line(source)));
        }
        if let Some(method) = provenance.method(key) {
            out.push_str(&format!("# Method: {}\n", truncate_method(&single_line(method))));
        }
        out.push_str(&render_entry(key, value)?);
    }

    out.parse::<toml::Table>().map_err(|e| ReportError::InvalidToml(e.to_string()))?;
    Ok(out)
}

/// Truncate to [`MAX_METHOD_LEN`] characters, ending in `...` when cut.
pub fn truncate_method(method: &str) -> String {
    if method.chars().count() <= MAX_METHOD_LEN {
        return method.to_string();
    }
    let kept: String = method.chars().take(MAX_METHOD_LEN - 3).collect();
    format!("{kept}...")
}

/// Convert a JSON value into TOML; `null` has no TOML form and maps to `None`.
pub fn json_to_toml(value: &Value) -> Option<toml::Value> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(toml::Value::Boolean(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(toml::Value::Integer(i))
            } else if let Some(u) = n.as_u64() {
                // TOML integers are i64; larger values survive as strings.
                Some(toml::Value::String(u.to_string()))
            } else {
                n.as_f64().map(toml::Value::Float)
            }
        }
        Value::String(s) => Some(toml::Value::String(s.clone())),
        Value::Array(items) => {
            Some(toml::Value::Array(items.iter().filter_map(json_to_toml).collect()))
        }
        Value::Object(map) => {
            let table: toml::Table =
                map.iter().filter_map(|(k, v)| json_to_toml(v).map(|v| (k.clone(), v))).collect();
            Some(toml::Value::Table(table))
        }
    }
}

fn render_entry(key: &str, value: &Value) -> Result<String, ReportError> {
    let converted = json_to_toml(value).ok_or_else(|| ReportError::TomlValue {
        field: key.to_string(),
        reason: "null has no TOML representation".to_string(),
    })?;
    let mut table = toml::Table::new();
    table.insert(key.to_string(), converted);
    toml::to_string(&table)
        .map_err(|e| ReportError::TomlValue { field: key.to_string(), reason: e.to_string() })
}

/// Split keys into (simple, complex) emission order.
///
/// Caller-supplied lists win; unlisted keys are appended in declaration order.
/// Within the complex group, inline arrays go before anything that renders as
/// a table header so no bare key ends up inside a table.
fn field_order(
    map: &Map<String, Value>,
    simple_fields: Option<&[&str]>,
    complex_fields: Option<&[&str]>,
) -> (Vec<String>, Vec<String>) {
    let mut simple: Vec<String> = Vec::new();
    let mut complex: Vec<String> = Vec::new();

    let listed = simple_fields.into_iter().flatten().chain(complex_fields.into_iter().flatten());
    for key in listed {
        if let Some(value) = map.get(*key) {
            let bucket = if is_complex(value) { &mut complex } else { &mut simple };
            if !bucket.iter().any(|k| k.as_str() == *key) {
                bucket.push((*key).to_string());
            }
        }
    }
    for (key, value) in map {
        let bucket = if is_complex(value) { &mut complex } else { &mut simple };
        if !bucket.contains(key) {
            bucket.push(key.clone());
        }
    }

    let (inline, tables): (Vec<String>, Vec<String>) =
        complex.into_iter().partition(|k| map.get(k).map(renders_inline).unwrap_or(false));
    (simple, inline.into_iter().chain(tables).collect())
}

fn renders_inline(value: &Value) -> bool {
    match value {
        Value::Array(items) => !items.iter().any(Value::is_object),
        Value::Object(_) => false,
        _ => true,
    }
}

fn heading(key: &str) -> String {
    key.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}
