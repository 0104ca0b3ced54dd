use serde::de::DeserializeOwned;
use serde_json::Value;

/// Finds the record array inside an upstream body.
///
/// Accepted shapes: a bare array, `{data: [...]}`, `{data: {<any>: [...]}}`, `{error, data}`,
/// and any of those double-encoded as a JSON string. Returns `None` when no array is present.
pub fn locate_array(text: &str) -> Option<Vec<Value>> {
    let v = match serde_json::from_str::<Value>(text.trim()).ok()? {
        Value::String(inner) => serde_json::from_str::<Value>(inner.trim()).ok()?,
        other => other,
    };

    match v {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => {
            if map.contains_key("error") {
                if map.contains_key("data") {
                    tracing::warn!(error = %map["error"], "upstream body has an error field next to data; using data");
                } else {
                    tracing::warn!(error = %map["error"], "upstream body only has an error field");
                    return None;
                }
            }
            match map.remove("data")? {
                Value::Array(items) => Some(items),
                Value::Object(inner) => inner.into_iter().find_map(|(_, v)| match v {
                    Value::Array(items) => Some(items),
                    _ => None,
                }),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Decodes every record of the located array, skipping the ones that do not fit `T`.
pub fn parse_records<T: DeserializeOwned>(text: &str, what: &'static str) -> Vec<T> {
    let Some(items) = locate_array(text) else {
        let preview: String = text.chars().take(200).collect();
        tracing::warn!(what, body = %preview, "no record array found in upstream body");
        return Vec::new();
    };

    let total = items.len();
    let out: Vec<T> = items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<T>(item).ok())
        .collect();
    if out.len() < total {
        tracing::warn!(what, total, skipped = total - out.len(), "skipped undecodable records");
    }
    out
}

/// Tag names of a contact body: `{data: {tags: [...]}}` or `{tags: [...]}`, where each tag is
/// either `{name}` or a bare string.
pub fn tag_names(text: &str) -> Vec<String> {
    let v = match serde_json::from_str::<Value>(text.trim()) {
        Ok(Value::String(inner)) => serde_json::from_str::<Value>(inner.trim()).unwrap_or(Value::Null),
        Ok(other) => other,
        Err(_) => return Vec::new(),
    };

    let node = match v.get("data") {
        Some(data) if data.is_object() => data,
        _ => &v,
    };
    let Some(Value::Array(tags)) = node.get("tags") else {
        return Vec::new();
    };

    tags.iter()
        .filter_map(|t| match t {
            Value::String(s) => Some(s.trim()),
            Value::Object(o) => o.get("name").and_then(Value::as_str).map(str::trim),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
