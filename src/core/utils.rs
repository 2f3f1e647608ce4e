//! Brace-placeholder templates: `{name}` and `{0}` fields, `{{`/`}}` escapes.

use crate::api::error::FlowError;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

static FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{|\}\}|\{(\w*)\}").expect("field pattern is valid"));

/// Walks `template`, copying literal text and asking `field` for each
/// replacement. `field` receives `None` for an auto-numbered `{}`.
fn render(
    template: &str,
    mut field: impl FnMut(Option<&str>) -> Result<String, FlowError>,
) -> Result<String, FlowError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in FIELD.captures_iter(template) {
        let Some(m) = caps.get(0) else { continue };
        out.push_str(&template[last..m.start()]);
        match m.as_str() {
            "{{" => out.push('{'),
            "}}" => out.push('}'),
            _ => {
                let name = caps.get(1).map(|n| n.as_str()).filter(|n| !n.is_empty());
                out.push_str(&field(name)?);
            }
        }
        last = m.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Names of all `{name}` fields in `template`, escapes excluded.
pub fn placeholder_names(template: &str) -> BTreeSet<String> {
    FIELD
        .captures_iter(template)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Fills `{name}` fields from `values`.
pub fn render_named(
    template: &str,
    values: &HashMap<String, String>,
) -> Result<String, FlowError> {
    render(template, |name| {
        let name = name.unwrap_or("{}");
        values
            .get(name)
            .cloned()
            .ok_or_else(|| FlowError::key_not_found(name, "template values"))
    })
}

/// Fills `{0}`, `{1}`, ... (or auto-numbered `{}`) fields from `values`.
pub fn render_positional(template: &str, values: &[&str]) -> Result<String, FlowError> {
    let mut next_auto = 0;
    render(template, |name| {
        let index = match name {
            Some(n) => n
                .parse::<usize>()
                .map_err(|_| FlowError::key_not_found(n, "template arguments"))?,
            None => {
                next_auto += 1;
                next_auto - 1
            }
        };
        values
            .get(index)
            .map(|v| v.to_string())
            .ok_or_else(|| FlowError::key_not_found(index.to_string(), "template arguments"))
    })
}
