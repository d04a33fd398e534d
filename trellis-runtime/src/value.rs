//! Value semantics shared by the executor and the helpers.

use std::borrow::Cow;

use serde_json::Value;

/// Null-safe property access. Missing keys, null bases and scalars all give
/// null; numeric keys index arrays.
pub fn lookup(base: &Value, key: &Value) -> Value {
    match (base, key) {
        (Value::Object(map), Value::String(k)) => map.get(k).cloned().unwrap_or(Value::Null),
        (Value::Object(map), Value::Number(n)) => {
            map.get(&n.to_string()).cloned().unwrap_or(Value::Null)
        }
        (Value::Array(items), Value::Number(n)) => n
            .as_u64()
            .and_then(|i| items.get(i as usize))
            .cloned()
            .unwrap_or(Value::Null),
        (Value::Array(items), Value::String(k)) => k
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get(i))
            .cloned()
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Text form used when a value is printed. Null prints as nothing.
pub fn stringify(value: &Value) -> Cow<'_, str> {
    match value {
        Value::Null => Cow::Borrowed(""),
        Value::String(s) => Cow::Borrowed(s),
        Value::Bool(b) => Cow::Borrowed(if *b { "true" } else { "false" }),
        Value::Number(n) => Cow::Owned(n.to_string()),
        other => Cow::Owned(other.to_string()),
    }
}

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Equality with numbers compared by value, so `1 == 1.0`.
pub fn equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Key/value pairs a `for` statement walks, in the collection's own order.
pub fn entries(value: &Value) -> Result<Vec<(Value, Value)>, &'static str> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items
            .iter()
            .enumerate()
            .map(|(i, v)| (Value::from(i), v.clone()))
            .collect()),
        Value::Object(map) => Ok(map
            .iter()
            .map(|(k, v)| (Value::String(k.clone()), v.clone()))
            .collect()),
        other => Err(type_name(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_is_null_safe() {
        let data = json!({"user": {"profile": {"bio": "hello"}}, "tags": ["a", "b"]});
        let user = lookup(&data, &json!("user"));
        let bio = lookup(&lookup(&user, &json!("profile")), &json!("bio"));
        assert_eq!(bio, json!("hello"));

        let missing = lookup(&lookup(&data, &json!("nobody")), &json!("profile"));
        assert_eq!(missing, Value::Null);
        assert_eq!(lookup(&json!("scalar"), &json!("x")), Value::Null);
        assert_eq!(lookup(&lookup(&data, &json!("tags")), &json!("1")), json!("b"));
    }

    #[test]
    fn truthiness() {
        for falsy in [json!(null), json!(false), json!(0), json!(""), json!([]), json!({})] {
            assert!(!truthy(&falsy), "{falsy} should be falsy");
        }
        for t in [json!(true), json!(1), json!("0"), json!([0]), json!({"a": null})] {
            assert!(truthy(&t), "{t} should be truthy");
        }
    }

    #[test]
    fn stringify_forms() {
        assert_eq!(stringify(&json!(null)), "");
        assert_eq!(stringify(&json!("x")), "x");
        assert_eq!(stringify(&json!(2.5)), "2.5");
        assert_eq!(stringify(&json!([1, "a"])), r#"[1,"a"]"#);
    }

    #[test]
    fn numeric_equality() {
        assert!(equals(&json!(1), &json!(1.0)));
        assert!(!equals(&json!("1"), &json!(1)));
    }

    #[test]
    fn object_entries_keep_insertion_order() {
        let v: Value = serde_json::from_str(r#"{"b": 1, "a": 2}"#).unwrap();
        let keys: Vec<_> = entries(&v).unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![json!("b"), json!("a")]);
        assert_eq!(entries(&json!(3)), Err("number"));
    }
}
