use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use minijinja::value::{Enumerator, Object, ObjectRepr, Value as JinjaValue, ValueKind};
use minijinja::{Environment, UndefinedBehavior};
use regex::Regex;
use serde_json::Value;

use super::tracked::{track_fields, FootnoteRegistry, TrackedValue};
use super::CacheError;

static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{[{%](.*?)[}%]\}").expect("static regex"));
static TYPE_ACCESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^\w.])([A-Za-z_][A-Za-z0-9_]*)\.[A-Za-z_]").expect("static regex")
});

/// Analysis types are written with hyphens; templates may use underscores.
pub fn normalize_type(analysis_type: &str) -> String {
    analysis_type.trim().replace('_', "-")
}

/// Name of an analysis type inside a template (`boot-process` -> `boot_process`).
fn template_name(analysis_type: &str) -> String {
    analysis_type.replace('-', "_")
}

/// One top-level result value inside the template context.
///
/// Renders as [`TrackedValue::display`], iterates and indexes like the wrapped
/// value, and carries the provenance the `src` filter cites.
#[derive(Debug)]
struct TrackedCell {
    tracked: TrackedValue,
    inner: JinjaValue,
}

impl TrackedCell {
    fn new(tracked: &TrackedValue) -> Self {
        Self { tracked: tracked.clone(), inner: JinjaValue::from_serialize(&tracked.value) }
    }
}

impl Object for TrackedCell {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        match self.inner.kind() {
            ValueKind::Seq => ObjectRepr::Seq,
            ValueKind::Map => ObjectRepr::Map,
            _ => ObjectRepr::Plain,
        }
    }

    fn get_value(self: &Arc<Self>, key: &JinjaValue) -> Option<JinjaValue> {
        self.inner.get_item(key).ok().filter(|v| !v.is_undefined())
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        match self.inner.kind() {
            ValueKind::Seq => Enumerator::Seq(self.inner.len().unwrap_or(0)),
            ValueKind::Map => match self.inner.try_iter() {
                Ok(keys) => Enumerator::Values(keys.collect()),
                Err(_) => Enumerator::Empty,
            },
            _ => Enumerator::NonEnumerable,
        }
    }

    fn is_true(self: &Arc<Self>) -> bool {
        self.inner.is_true()
    }

    fn render(self: &Arc<Self>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tracked.display())
    }
}

/// Renders Jinja Markdown templates from analysis results.
///
/// Each analysis type is a top-level variable (`uboot`, `boot_process`, ...)
/// whose keys are the result fields. The `src` filter appends a `[^n]`
/// reference to a field's provenance; the footnote block is appended to the
/// document. Loops and conditionals work over the result values; compare a
/// scalar field through `| string` (`{% if uboot.bootdelay | string == "0" %}`).
#[derive(Debug, Clone, Default)]
pub struct TemplateRenderer {
    results: BTreeMap<String, BTreeMap<String, TrackedValue>>,
}

impl TemplateRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names used as `<name>.<field>` inside template tags, normalized and
    /// deduplicated, in order of first use. Loop variables show up too; the
    /// caller filters against the known analysis types.
    pub fn referenced_types(template: &str) -> Vec<String> {
        let mut types: Vec<String> = Vec::new();
        for tag in TAG.captures_iter(template) {
            for caps in TYPE_ACCESS.captures_iter(&tag[1]) {
                let analysis_type = normalize_type(&caps[1]);
                if !types.contains(&analysis_type) {
                    types.push(analysis_type);
                }
            }
        }
        types
    }

    /// Register the results of one analysis. Non-object results are ignored.
    pub fn add_results(&mut self, analysis_type: &str, results: &Value) -> &mut Self {
        if let Value::Object(map) = results {
            self.results.insert(normalize_type(analysis_type), track_fields(map));
        }
        self
    }

    pub fn value(&self, analysis_type: &str, key: &str) -> Option<&TrackedValue> {
        self.results.get(&normalize_type(analysis_type))?.get(key)
    }

    fn context(&self) -> JinjaValue {
        let types: BTreeMap<String, JinjaValue> = self
            .results
            .iter()
            .map(|(analysis_type, fields)| {
                let fields: BTreeMap<String, JinjaValue> = fields
                    .iter()
                    .map(|(key, tracked)| {
                        (key.clone(), JinjaValue::from_object(TrackedCell::new(tracked)))
                    })
                    .collect();
                (template_name(analysis_type), JinjaValue::from(fields))
            })
            .collect();
        JinjaValue::from(types)
    }

    /// Render `template`. Unknown types and keys render as empty text; syntax
    /// errors and failing expressions are [`CacheError::Template`].
    pub fn render(&self, template: &str) -> Result<String, CacheError> {
        let footnotes = Arc::new(Mutex::new(FootnoteRegistry::new()));

        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        env.set_keep_trailing_newline(true);
        let notes = Arc::clone(&footnotes);
        env.add_filter("src", move |value: JinjaValue| -> String {
            let Some(cell) = value.downcast_object_ref::<TrackedCell>() else {
                return value.to_string();
            };
            let mut text = cell.tracked.display();
            if let Some(source) = &cell.tracked.source {
                let mut registry = notes.lock().unwrap_or_else(PoisonError::into_inner);
                let n = registry.add(source, cell.tracked.method.as_deref());
                text.push_str(&format!("[^{n}]"));
            }
            text
        });

        let mut out = env.render_str(template, self.context())?;
        let registry = footnotes.lock().unwrap_or_else(PoisonError::into_inner);
        if !registry.is_empty() {
            if !out.ends_with('\n') {
                out.push('\n');
            }
            out.push('\n');
            out.push_str(&registry.render());
        }
        Ok(out)
    }
}
