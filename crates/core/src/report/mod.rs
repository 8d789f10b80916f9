//! Uniform "record -> documented report" rendering.
//!
//! Every analyzer produces one report struct that derives `Serialize` and
//! carries a [`Provenance`] side table. The [`Report`] trait supplies the shared
//! flattening contract (`to_map`) and the TOML/JSON writers build on it.

mod json_writer;
mod toml_writer;

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;

pub use self::json_writer::output_json;
pub use self::toml_writer::{json_to_toml, output_toml, truncate_method, MAX_METHOD_LEN};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Report did not serialize to a table")]
    NotATable,
    #[error("Failed to convert field '{field}' to TOML: {reason}")]
    TomlValue { field: String, reason: String },
    #[error("Generated TOML failed validation: {0}")]
    InvalidToml(String),
    #[error("Generated JSON failed validation: {0}")]
    InvalidJson(String),
}

/// Where a field's value came from and how it was derived.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provenance {
    source: BTreeMap<String, String>,
    method: BTreeMap<String, String>,
}

impl Provenance {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record provenance for `field`; a second call for the same field wins.
    pub fn add_metadata(
        &mut self,
        field: impl Into<String>,
        source: impl Into<String>,
        method: impl Into<String>,
    ) {
        let field = field.into();
        self.source.insert(field.clone(), source.into());
        self.method.insert(field, method.into());
    }

    pub fn source(&self, field: &str) -> Option<&str> {
        self.source.get(field).map(String::as_str)
    }

    pub fn method(&self, field: &str) -> Option<&str> {
        self.method.get(field).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty() && self.method.is_empty()
    }
}

/// A serializable analysis report.
///
/// Implementors provide the raw serde value and their provenance; nested
/// records are converted by their own `Serialize` impls.
pub trait Report {
    /// Human-readable report title, used as the TOML header comment.
    fn title(&self) -> &str;

    fn provenance(&self) -> &Provenance;

    /// Serialize the record in declaration order.
    fn to_value(&self) -> Result<Value, ReportError>;

    /// Preferred order of scalar fields; `None` means auto-detect.
    fn simple_fields(&self) -> Option<&'static [&'static str]> {
        None
    }

    /// Preferred order of list/table fields; `None` means auto-detect.
    fn complex_fields(&self) -> Option<&'static [&'static str]> {
        None
    }

    /// Flatten into the report map.
    ///
    /// Keys starting with `_`, `null` values and empty lists are dropped.
    /// With `with_sidecars`, `<key>_source` / `<key>_method` follow any key
    /// that has provenance.
    fn to_map(&self, with_sidecars: bool) -> Result<Map<String, Value>, ReportError> {
        let Value::Object(raw) = self.to_value()? else {
            return Err(ReportError::NotATable);
        };
        let provenance = self.provenance();
        let mut out = Map::new();
        for (key, value) in raw {
            if key.starts_with('_') || is_empty_value(&value) {
                continue;
            }
            let source = provenance.source(&key).map(str::to_string);
            let method = provenance.method(&key).map(str::to_string);
            out.insert(key.clone(), value);
            if with_sidecars {
                if let Some(source) = source {
                    out.insert(format!("{key}_source"), Value::String(source));
                }
                if let Some(method) = method {
                    out.insert(format!("{key}_method"), Value::String(method));
                }
            }
        }
        Ok(out)
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Lists and maps are "complex"; everything else is a simple scalar.
pub fn is_complex(value: &Value) -> bool {
    matches!(value, Value::Array(_) | Value::Object(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Sample {
        name: String,
        missing: Option<String>,
        items: Vec<u32>,
        #[serde(rename = "_internal")]
        internal: u32,
        #[serde(skip)]
        meta: Provenance,
    }

    impl Report for Sample {
        fn title(&self) -> &str {
            "Sample"
        }
        fn provenance(&self) -> &Provenance {
            &self.meta
        }
        fn to_value(&self) -> Result<Value, ReportError> {
            Ok(serde_json::to_value(self)?)
        }
    }

    #[test]
    fn to_map_drops_nulls_empties_and_private_keys() {
        let mut sample = Sample {
            name: "fw.img".into(),
            missing: None,
            items: vec![],
            internal: 7,
            meta: Provenance::new(),
        };
        sample.meta.add_metadata("name", "cli", "argument");
        sample.meta.add_metadata("missing", "nowhere", "never");

        let map = sample.to_map(true).unwrap();
        let keys: Vec<&str> = map.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["name", "name_source", "name_method"]);
    }

    #[test]
    fn add_metadata_overwrites() {
        let mut p = Provenance::new();
        p.add_metadata("x", "a", "b");
        p.add_metadata("x", "c", "d");
        assert_eq!(p.source("x"), Some("c"));
        assert_eq!(p.method("x"), Some("d"));
    }
}
