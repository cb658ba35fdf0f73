use serde_json::Value;

/// Expand CEF `*Label` pairs in place: `cs1Label = "Config Type"`,
/// `cs1 = "ipchange"` adds `ConfigType = "ipchange"`. Spaces in the label are
/// removed so the result is addressable as a rule field name.
pub fn expand_cef_labels(ext: &mut serde_json::Map<String, Value>) {
    let pairs: Vec<(String, String)> = ext
        .iter()
        .filter_map(|(k, v)| {
            let label = v.as_str()?;
            if !k.ends_with("Label") || label.is_empty() {
                return None;
            }
            let value_key = k.trim_end_matches("Label");
            let value = ext.get(value_key)?.as_str()?;
            if value.is_empty() {
                return None;
            }
            Some((label.replace(' ', ""), value.to_string()))
        })
        .collect();

    for (key, value) in pairs {
        ext.insert(key, Value::String(value));
    }
}
