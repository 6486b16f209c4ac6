//! Field-by-field merge of a stored document with a default template.
//!
//! Used both at document-creation time and at migration time to bring a stale
//! document toward the current default shape without clobbering user edits.
//! Arrays are opaque: an existing array is kept as-is, otherwise the default
//! array is taken wholesale.

use serde_json::Value;

/// Returns `true` for a JSON object (maps only, not arrays).
pub fn is_plain_object(value: &Value) -> bool {
    value.is_object()
}

/// Merge `current` with `defaults`, filling keys that are missing or null and
/// recursing into object-typed defaults.
///
/// Keys present in `current` but absent from `defaults` are never removed.
/// Idempotent: merging the result with the same defaults is a no-op.
pub fn merge_defaults(current: &Value, defaults: &Value) -> Value {
    if defaults.is_array() {
        return if current.is_array() {
            current.clone()
        } else {
            defaults.clone()
        };
    }

    let Some(default_map) = defaults.as_object() else {
        return if current.is_null() {
            defaults.clone()
        } else {
            current.clone()
        };
    };

    let mut output = match current.as_object() {
        Some(map) => map.clone(),
        None => serde_json::Map::new(),
    };

    for (key, default_value) in default_map {
        match output.get(key) {
            None | Some(Value::Null) => {
                output.insert(key.clone(), default_value.clone());
            }
            Some(existing) if is_plain_object(default_value) => {
                let merged = merge_defaults(existing, default_value);
                output.insert(key.clone(), merged);
            }
            Some(_) => {}
        }
    }

    Value::Object(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fills_missing_keys() {
        let current = json!({ "a": 1 });
        let defaults = json!({ "a": 0, "b": 2 });

        let merged = merge_defaults(&current, &defaults);

        assert_eq!(merged, json!({ "a": 1, "b": 2 }));
    }

    #[test]
    fn test_fills_null_keys() {
        let current = json!({ "a": null });
        let defaults = json!({ "a": 5 });

        assert_eq!(merge_defaults(&current, &defaults), json!({ "a": 5 }));
    }

    #[test]
    fn test_recurses_into_object_defaults() {
        let current = json!({ "editor": { "gridDivisions": 64 } });
        let defaults = json!({ "editor": { "gridDivisions": 32, "snapIncrement": 1 } });

        let merged = merge_defaults(&current, &defaults);

        assert_eq!(
            merged,
            json!({ "editor": { "gridDivisions": 64, "snapIncrement": 1 } })
        );
    }

    #[test]
    fn test_never_drops_extra_keys() {
        let current = json!({ "custom": true, "nested": { "keep": "me" } });
        let defaults = json!({ "nested": { "added": 1 } });

        let merged = merge_defaults(&current, &defaults);

        assert_eq!(merged["custom"], json!(true));
        assert_eq!(merged["nested"]["keep"], json!("me"));
        assert_eq!(merged["nested"]["added"], json!(1));
    }

    #[test]
    fn test_existing_arrays_are_kept_verbatim() {
        let current = json!({ "scripts": [1, 2, 3] });
        let defaults = json!({ "scripts": [] });

        assert_eq!(merge_defaults(&current, &defaults)["scripts"], json!([1, 2, 3]));
    }

    #[test]
    fn test_missing_arrays_take_the_default_wholesale() {
        let current = json!({});
        let defaults = json!({ "gravity": [0, -9.8, 0] });

        assert_eq!(
            merge_defaults(&current, &defaults)["gravity"],
            json!([0, -9.8, 0])
        );
    }

    #[test]
    fn test_scalar_defaults_do_not_overwrite() {
        let current = json!({ "fog": "linear" });
        let defaults = json!({ "fog": "none" });

        assert_eq!(merge_defaults(&current, &defaults)["fog"], json!("linear"));
    }

    #[test]
    fn test_non_object_current_is_replaced_by_object_defaults() {
        let current = json!(42);
        let defaults = json!({ "a": 1 });

        assert_eq!(merge_defaults(&current, &defaults), json!({ "a": 1 }));
    }

    #[test]
    fn test_idempotent() {
        let current = json!({
            "render": { "fog": "linear", "custom": [9] },
            "extra": "field"
        });
        let defaults = json!({
            "render": { "fog": "none", "exposure": 1.2 },
            "physics": { "gravity": [0, -9.8, 0] }
        });

        let once = merge_defaults(&current, &defaults);
        let twice = merge_defaults(&once, &defaults);

        assert_eq!(once, twice);
    }
}
