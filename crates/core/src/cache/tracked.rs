use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// A result value together with its provenance sidecars.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedValue {
    pub value: Value,
    pub source: Option<String>,
    pub method: Option<String>,
}

impl TrackedValue {
    pub fn plain(value: Value) -> Self {
        Self { value, source: None, method: None }
    }

    /// Text for substitution into a document: strings verbatim, everything
    /// else as compact JSON.
    pub fn display(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Fold `<key>_source` / `<key>_method` entries back onto `<key>`.
///
/// A sidecar-looking key whose base key is absent stays an ordinary value.
pub fn track_fields(map: &Map<String, Value>) -> BTreeMap<String, TrackedValue> {
    let sidecar_base = |key: &str| {
        key.strip_suffix("_source")
            .or_else(|| key.strip_suffix("_method"))
            .filter(|base| map.contains_key(*base))
            .map(str::to_string)
    };

    let mut fields: BTreeMap<String, TrackedValue> = BTreeMap::new();
    for (key, value) in map {
        if sidecar_base(key).is_none() {
            fields.insert(key.clone(), TrackedValue::plain(value.clone()));
        }
    }
    for (key, value) in map {
        let Some(base) = sidecar_base(key) else { continue };
        let Some(tracked) = fields.get_mut(&base) else { continue };
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if key.ends_with("_source") {
            tracked.source = Some(text);
        } else {
            tracked.method = Some(text);
        }
    }
    fields
}

/// Numbered footnotes, one per distinct `(source, method)` pair.
#[derive(Debug, Clone, Default)]
pub struct FootnoteRegistry {
    notes: Vec<(String, Option<String>)>,
}

impl FootnoteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Footnote number for this pair; the first time a pair is seen it gets
    /// the next number, afterwards the same one.
    pub fn add(&mut self, source: &str, method: Option<&str>) -> usize {
        if let Some(pos) =
            self.notes.iter().position(|(s, m)| s == source && m.as_deref() == method)
        {
            return pos + 1;
        }
        self.notes.push((source.to_string(), method.map(str::to_string)));
        self.notes.len()
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    /// `[^n]: source (method)` lines in number order.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, (source, method)) in self.notes.iter().enumerate() {
            match method {
                Some(method) => out.push_str(&format!("[^{}]: {source} ({method})\n", i + 1)),
                None => out.push_str(&format!("[^{}]: {source}\n", i + 1)),
            }
        }
        out
    }
}
