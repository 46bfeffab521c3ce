//! 🧭 Path lookup into a JSON payload.
//!
//! `$.a.b[0].c`, `a.b.0.c` and `a[b][0][c]` all walk the same keys. Tokens are the runs of
//! characters between `.`, `[` and `]`, which means keys with spaces work in dot form
//! (`$.integrations.Actions Amplitude.session_id`) while quoted bracket keys do not.

use serde_json::Value;

/// Strips the `$.` (or bare `$`) root marker.
fn strip_root(path: &str) -> &str {
    if let Some(rest) = path.strip_prefix("$.") {
        rest
    } else if path == "$" {
        ""
    } else {
        path
    }
}

/// Looks `path` up in `payload`. An empty path is the payload itself.
///
/// Missing keys, out-of-range indices and stepping into a scalar all give `None`.
pub fn get<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    strip_root(path)
        .split(['[', '.', ']'])
        .filter(|token| !token.is_empty())
        .try_fold(payload, |current, token| match current {
            Value::Object(map) => map.get(token),
            Value::Array(items) => token.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}
