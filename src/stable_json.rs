//! Canonical ("stable") JSON encoding used for field-storage argument
//! suffixes and canonical connection keys.
//!
//! Object keys are sorted lexicographically, arrays are preserved in order,
//! and `null` is preserved rather than dropped. This must be bit-identical
//! regardless of which JSON library produced the input, so it deliberately
//! does not delegate to `serde_json`'s own (insertion-order) `to_string`.

use serde_json::{Map, Value};

/// Encodes a JSON value using the stable form described above.
pub fn stable_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

/// Convenience used by the compiler: stringifies an args map the way a
/// connection's storage-key suffix expects it, i.e. `({...})`.
pub fn stable_args_suffix(args: &Map<String, Value>) -> String {
    if args.is_empty() {
        return String::new();
    }
    let mut out = String::from("(");
    write_object(args, &mut out);
    out.push(')');
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => write_object(map, out),
    }
}

fn write_object(map: &Map<String, Value>, out: &mut String) {
    out.push('{');
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(key, out);
        out.push(':');
        write_value(&map[*key], out);
    }
    out.push('}');
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_object_keys() {
        let value = json!({"b": 1, "a": 2});
        assert_eq!(stable_json(&value), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn preserves_array_order_and_null() {
        let value = json!({"tags": ["b", "a"], "category": null});
        assert_eq!(stable_json(&value), r#"{"category":null,"tags":["b","a"]}"#);
    }

    #[test]
    fn nested_objects_sort_recursively() {
        let value = json!({"z": {"y": 1, "x": 2}, "a": 1});
        assert_eq!(stable_json(&value), r#"{"a":1,"z":{"x":2,"y":1}}"#);
    }

    #[test]
    fn args_suffix_is_empty_for_no_args() {
        let map = Map::new();
        assert_eq!(stable_args_suffix(&map), "");
    }

    #[test]
    fn args_suffix_wraps_in_parens() {
        let mut map = Map::new();
        map.insert("first".to_string(), json!(2));
        map.insert("after".to_string(), Value::Null);
        assert_eq!(stable_args_suffix(&map), r#"({"after":null,"first":2})"#);
    }
}
