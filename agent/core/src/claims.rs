//! Dot-path access into token claims.

use serde_json::Value;

/// Looks up a nested claim by dot-path, e.g. `user.email`.
///
/// A path segment never matches across arrays; claims are expected to be
/// nested objects the whole way down.
pub fn pluck<'v>(claims: &'v Value, path: &str) -> Option<&'v Value> {
    let mut current = claims;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Renders a claim value for use as a forwarded header value.
///
/// Strings pass through unquoted; scalars use their JSON rendering; arrays
/// are comma-joined; objects keep their JSON form.
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(render)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}
