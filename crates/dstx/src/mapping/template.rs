//! 🧵 `@template` rendering on top of Handlebars.
//!
//! Mustache people write `{{traits.name}}` and `{{{context.page.url}}}`, and they expect those
//! paths to mean exactly what `@path` means: `$.` prefixes, `[0]` indexes, keys with spaces in
//! them. Handlebars has its own opinions about paths (and about how to print an array), so every
//! placeholder is looked up here first and handed to Handlebars as a flat `slotN` variable.
//! Handlebars then does the part it is good at: escaping and stitching the text back together.
//!
//! ```text
//!   "Hi {{ traits.name }} {{{bio}}}"  ──▶  "Hi {{slot0}} {{{slot1}}}"  +  {slot0: "Ann", slot1: "<b>"}
//! ```

use std::sync::LazyLock;

use handlebars::{Handlebars, RenderError, no_escape};
use regex::{Captures, Regex};
use serde_json::{Map, Value};

use super::path;

/// `{{{raw}}}` first, so the triple form never gets eaten as a double with a stray brace.
static PLACEHOLDER: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"\{\{\{\s*(?P<raw>[^{}]*?)\s*\}\}\}|\{\{\s*(?P<escaped>[^{}]*?)\s*\}\}").ok()
});

static ESCAPING: LazyLock<Handlebars<'static>> = LazyLock::new(|| registry(true));
static VERBATIM: LazyLock<Handlebars<'static>> = LazyLock::new(|| registry(false));

fn registry(escape_html: bool) -> Handlebars<'static> {
    let mut handlebars = Handlebars::new();
    // 🫥 missing values render as nothing, they do not blow up the whole event
    handlebars.set_strict_mode(false);
    if escape_html {
        handlebars.register_escape_fn(escape);
    } else {
        handlebars.register_escape_fn(no_escape);
    }
    handlebars
}

/// Renders `template` against `payload`.
///
/// `{{a.b}}` is HTML-escaped unless `escape_html` is off, `{{{a.b}}}` never is. Placeholders
/// that resolve to nothing (or `null`) render as an empty string, anything that is not a string
/// renders as its JSON text. 💀 A `{{` that never closes is a template error.
pub fn render(template: &str, payload: &Value, escape_html: bool) -> Result<String, RenderError> {
    let mut slots = Map::new();
    let normalized = match PLACEHOLDER.as_ref() {
        Some(placeholder) => placeholder
            .replace_all(template, |caps: &Captures| {
                let slot = format!("slot{}", slots.len());
                let (raw, at) = match caps.name("raw") {
                    Some(at) => (true, at.as_str()),
                    None => (false, caps.name("escaped").map_or("", |at| at.as_str())),
                };
                slots.insert(slot.clone(), Value::String(stringify(path::get(payload, at))));
                if raw {
                    format!("{{{{{{{slot}}}}}}}")
                } else {
                    format!("{{{{{slot}}}}}")
                }
            })
            .into_owned(),
        None => template.to_string(),
    };

    let handlebars = if escape_html { &*ESCAPING } else { &*VERBATIM };
    handlebars.render_template(&normalized, &Value::Object(slots))
}

fn stringify(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Same table mustache uses. Handlebars' own table leaves `/` alone, mustache does not.
pub fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            '/' => escaped.push_str("&#x2F;"),
            '`' => escaped.push_str("&#x60;"),
            '=' => escaped.push_str("&#x3D;"),
            other => escaped.push(other),
        }
    }
    escaped
}
