//! 📚 The directive registry. The one list of `@names` both the resolver and the validator read.
//!
//! Built once per process, never mutated after. Adding a directive means adding a
//! [`DirectiveKind`] variant, which forces both the resolver and the validator to handle it.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::error;

use crate::errors::MappingError;

/// Reserved sibling key allowed next to a directive.
pub const METADATA_KEY: &str = "_metadata";

static DIRECTIVE_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-zA-Z0-9]+$").ok());

pub static REGISTRY: LazyLock<DirectiveRegistry> = LazyLock::new(DirectiveRegistry::builtin);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectiveKind {
    Path,
    Template,
    If,
    Literal,
    ArrayPath,
}

impl DirectiveKind {
    pub const ALL: [DirectiveKind; 5] = [
        DirectiveKind::Path,
        DirectiveKind::Template,
        DirectiveKind::If,
        DirectiveKind::Literal,
        DirectiveKind::ArrayPath,
    ];

    /// Name without the `@`.
    pub fn name(self) -> &'static str {
        match self {
            DirectiveKind::Path => "path",
            DirectiveKind::Template => "template",
            DirectiveKind::If => "if",
            DirectiveKind::Literal => "literal",
            DirectiveKind::ArrayPath => "arrayPath",
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            DirectiveKind::Path => "@path",
            DirectiveKind::Template => "@template",
            DirectiveKind::If => "@if",
            DirectiveKind::Literal => "@literal",
            DirectiveKind::ArrayPath => "@arrayPath",
        }
    }
}

pub fn is_valid_directive_name(name: &str) -> bool {
    DIRECTIVE_NAME
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(name))
}

#[derive(Debug, Default)]
pub struct DirectiveRegistry {
    by_key: BTreeMap<String, DirectiveKind>,
}

impl DirectiveRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        for kind in DirectiveKind::ALL {
            if let Err(err) = registry.register(kind) {
                error!("💀 built-in directive refused registration: {err}");
            }
        }
        registry
    }

    fn register(&mut self, kind: DirectiveKind) -> Result<(), MappingError> {
        if !is_valid_directive_name(kind.name()) {
            return Err(MappingError::UnknownDirective(kind.key().to_string()));
        }
        self.by_key.insert(kind.key().to_string(), kind);
        Ok(())
    }

    pub fn lookup(&self, key: &str) -> Option<DirectiveKind> {
        self.by_key.get(key).copied()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.by_key.keys().map(String::as_str)
    }
}

/// True when the object carries at least one `@` key, i.e. it is meant as a directive.
pub fn is_directive(map: &Map<String, Value>) -> bool {
    map.keys().any(|k| k.starts_with('@'))
}

/// The first `@` key and its operand.
pub fn directive_entry(map: &Map<String, Value>) -> Option<(&str, &Value)> {
    map.iter()
        .find(|(k, _)| k.starts_with('@'))
        .map(|(k, v)| (k.as_str(), v))
}
