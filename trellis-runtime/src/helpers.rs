//! Helper functions callable from compiled programs.
//!
//! Each [`Runtime`](crate::Runtime) owns a registry, so two runtimes never
//! share helper state. Core helpers are un-namespaced and must be imported by
//! the prelude; everything else is a namespaced static helper and forms the
//! allow-list the expression compiler checks calls against.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde_json::Value;

use crate::prelude::CORE_HELPERS;
use crate::value::{escape_html, lookup, stringify, truthy, type_name};

pub type HelperFn = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

static NULL: Value = Value::Null;

fn arg(args: &[Value], i: usize) -> &Value {
    args.get(i).unwrap_or(&NULL)
}

fn string_arg<'a>(args: &'a [Value], i: usize, what: &str) -> Result<std::borrow::Cow<'a, str>, String> {
    match arg(args, i) {
        Value::Array(_) | Value::Object(_) => Err(format!(
            "{what} must be a scalar, got {}",
            type_name(arg(args, i))
        )),
        other => Ok(stringify(other)),
    }
}

fn usize_arg(args: &[Value], i: usize, default: usize) -> usize {
    arg(args, i).as_u64().map(|n| n as usize).unwrap_or(default)
}

#[derive(Clone)]
pub struct HelperRegistry {
    helpers: BTreeMap<String, HelperFn>,
}

impl fmt::Debug for HelperRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelperRegistry")
            .field("helpers", &self.helpers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for HelperRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl HelperRegistry {
    /// Core helpers only.
    pub fn core() -> Self {
        let mut r = Self {
            helpers: BTreeMap::new(),
        };
        r.insert("lookup", |a| Ok(lookup(arg(a, 0), arg(a, 1))));
        r.insert("escape", |a| Ok(Value::String(escape_html(&stringify(arg(a, 0))))));
        r.insert("truthy", |a| Ok(Value::Bool(truthy(arg(a, 0)))));
        r.insert("concat", |a| {
            Ok(Value::String(a.iter().map(|v| stringify(v)).collect()))
        });
        r.insert("attr", |a| {
            let name = string_arg(a, 0, "attribute name")?;
            Ok(Value::String(match arg(a, 1) {
                Value::Null => String::new(),
                v => format!(" {}=\"{}\"", name, escape_html(&stringify(v))),
            }))
        });
        r.insert("classes", |a| classes(a));
        debug_assert!(CORE_HELPERS.iter().all(|n| r.helpers.contains_key(*n)));
        r
    }

    /// Core helpers plus the standard static helper namespaces.
    pub fn standard() -> Self {
        let mut r = Self::core();

        r.insert("str.upper", |a| Ok(Value::String(string_arg(a, 0, "value")?.to_uppercase())));
        r.insert("str.lower", |a| Ok(Value::String(string_arg(a, 0, "value")?.to_lowercase())));
        r.insert("str.trim", |a| Ok(Value::String(string_arg(a, 0, "value")?.trim().to_string())));
        r.insert("str.length", |a| Ok(Value::from(string_arg(a, 0, "value")?.chars().count())));
        r.insert("str.truncate", |a| {
            let s = string_arg(a, 0, "value")?;
            let limit = usize_arg(a, 1, 80);
            if s.chars().count() <= limit {
                return Ok(Value::String(s.into_owned()));
            }
            let suffix = match arg(a, 2) {
                Value::Null => "...".into(),
                v => stringify(v),
            };
            let mut out: String = s.chars().take(limit).collect();
            out.push_str(&suffix);
            Ok(Value::String(out))
        });
        r.insert("str.replace", |a| {
            let s = string_arg(a, 0, "value")?;
            let from = string_arg(a, 1, "pattern")?;
            let to = string_arg(a, 2, "replacement")?;
            if from.is_empty() {
                return Ok(Value::String(s.into_owned()));
            }
            Ok(Value::String(s.replace(&*from, &to)))
        });
        r.insert("str.default", |a| {
            let v = arg(a, 0);
            Ok(if truthy(v) { v.clone() } else { arg(a, 1).clone() })
        });

        r.insert("list.count", |a| {
            Ok(Value::from(match arg(a, 0) {
                Value::Null => 0,
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::String(s) => s.chars().count(),
                other => return Err(format!("cannot count {}", type_name(other))),
            }))
        });
        r.insert("list.join", |a| {
            let sep = match arg(a, 1) {
                Value::Null => ", ".into(),
                v => stringify(v),
            };
            match arg(a, 0) {
                Value::Null => Ok(Value::String(String::new())),
                Value::Array(items) => Ok(Value::String(
                    items.iter().map(|v| stringify(v)).collect::<Vec<_>>().join(&sep),
                )),
                other => Ok(Value::String(stringify(other).into_owned())),
            }
        });
        r.insert("list.first", |a| {
            Ok(match arg(a, 0) {
                Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
                _ => Value::Null,
            })
        });
        r.insert("list.last", |a| {
            Ok(match arg(a, 0) {
                Value::Array(items) => items.last().cloned().unwrap_or(Value::Null),
                _ => Value::Null,
            })
        });
        r.insert("list.contains", |a| {
            let needle = arg(a, 1);
            Ok(Value::Bool(match arg(a, 0) {
                Value::Array(items) => items.iter().any(|v| crate::value::equals(v, needle)),
                Value::Object(map) => map.contains_key(&*stringify(needle)),
                Value::String(s) => s.contains(&*stringify(needle)),
                _ => false,
            }))
        });

        r.insert("num.format", |a| {
            let n = match arg(a, 0) {
                Value::Null => return Ok(Value::String(String::new())),
                Value::Number(n) => n.as_f64().unwrap_or_default(),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| format!("`{s}` is not a number"))?,
                other => return Err(format!("cannot format {}", type_name(other))),
            };
            Ok(Value::String(format_number(n, usize_arg(a, 1, 0))))
        });

        r.insert("url.encode", |a| Ok(Value::String(url_encode(&string_arg(a, 0, "value")?))));
        r.insert("json.encode", |a| {
            serde_json::to_string(arg(a, 0))
                .map(Value::String)
                .map_err(|e| e.to_string())
        });

        // Form helpers read well-known keys from the root bindings passed in.
        r.insert("form.csrf_token", |a| Ok(lookup(arg(a, 0), &Value::from("_csrf_token"))));
        r.insert("form.errors", |a| Ok(field_errors(arg(a, 0), arg(a, 1))));
        r.insert("form.has_errors", |a| Ok(Value::Bool(truthy(&field_errors(arg(a, 0), arg(a, 1))))));
        r.insert("form.old", |a| {
            let old = lookup(&lookup(arg(a, 0), &Value::from("_old")), arg(a, 1));
            Ok(if old.is_null() { arg(a, 2).clone() } else { old })
        });

        r
    }

    fn insert<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.helpers.insert(name.to_string(), Arc::new(f));
    }

    /// Register an extra static helper. Names must be namespaced
    /// (`ns.function`) so they can never shadow a core helper.
    pub fn register<F>(&mut self, name: &str, f: F) -> Result<(), String>
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        let valid = name.split('.').count() >= 2
            && name.split('.').all(|part| {
                !part.is_empty()
                    && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                    && !part.starts_with(|c: char| c.is_ascii_digit())
            });
        if !valid {
            return Err(format!("helper name `{name}` must look like `namespace.function`"));
        }
        self.insert(name, f);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.helpers.contains_key(name)
    }

    /// Names of the namespaced helpers, i.e. the call allow-list.
    pub fn static_names(&self) -> impl Iterator<Item = &str> {
        self.helpers.keys().map(String::as_str).filter(|n| n.contains('.'))
    }

    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, crate::RenderError> {
        let f = self
            .helpers
            .get(name)
            .ok_or_else(|| crate::RenderError::UnknownHelper(name.to_string()))?;
        f(args).map_err(|message| crate::RenderError::Helper {
            name: name.to_string(),
            message,
        })
    }
}

fn classes(args: &[Value]) -> Result<Value, String> {
    let mut names: Vec<String> = Vec::new();
    let mut push = |name: &str| {
        for part in name.split_whitespace() {
            if !names.iter().any(|n| n == part) {
                names.push(part.to_string());
            }
        }
    };

    push(&stringify(arg(args, 0)));
    let rest = args.get(1..).unwrap_or_default();
    if rest.len() == 1 {
        match &rest[0] {
            Value::Null => {}
            Value::String(s) => push(s),
            Value::Array(items) => items.iter().for_each(|v| push(&stringify(v))),
            Value::Object(map) => map
                .iter()
                .filter(|(_, on)| truthy(on))
                .for_each(|(name, _)| push(name)),
            other => return Err(format!("cannot build a class list from {}", type_name(other))),
        }
    } else {
        if rest.len() % 2 != 0 {
            return Err("class pairs must be (name, condition)".to_string());
        }
        for pair in rest.chunks(2) {
            if truthy(&pair[1]) {
                push(&stringify(&pair[0]));
            }
        }
    }

    Ok(if names.is_empty() {
        Value::Null
    } else {
        Value::String(names.join(" "))
    })
}

fn field_errors(root: &Value, field: &Value) -> Value {
    match lookup(&lookup(root, &Value::from("_errors")), field) {
        Value::Null => Value::Array(Vec::new()),
        Value::Array(items) => Value::Array(items),
        other => Value::Array(vec![other]),
    }
}

fn format_number(n: f64, decimals: usize) -> String {
    let fixed = format!("{:.*}", decimals, n.abs());
    let (int, frac) = match fixed.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (fixed.as_str(), None),
    };
    let mut grouped = String::with_capacity(int.len() + int.len() / 3);
    for (i, ch) in int.chars().enumerate() {
        if i > 0 && (int.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let sign = if n < 0.0 && fixed.chars().any(|c| c != '0' && c != '.') { "-" } else { "" };
    match frac {
        Some(f) => format!("{sign}{grouped}.{f}"),
        None => format!("{sign}{grouped}"),
    }
}

// everything but the RFC 3986 unreserved characters
const URL_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

fn url_encode(s: &str) -> String {
    utf8_percent_encode(s, URL_COMPONENT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn attr_omits_null() {
        let r = HelperRegistry::core();
        assert_eq!(r.call("attr", &[json!("id"), json!(null)]).unwrap(), json!(""));
        assert_eq!(
            r.call("attr", &[json!("title"), json!("a \"b\"")]).unwrap(),
            json!(" title=\"a &quot;b&quot;\"")
        );
    }

    #[test]
    fn classes_pairs_and_computed() {
        let r = HelperRegistry::core();
        let pairs = r
            .call("classes", &[json!("btn"), json!("active"), json!(true), json!("off"), json!(0)])
            .unwrap();
        assert_eq!(pairs, json!("btn active"));

        let map = r
            .call("classes", &[json!(null), json!({"a": true, "b": false, "c": 1})])
            .unwrap();
        assert_eq!(map, json!("a c"));

        let empty = r.call("classes", &[json!(""), json!([])]).unwrap();
        assert_eq!(empty, Value::Null);
    }

    #[test]
    fn number_formatting() {
        assert_eq!(format_number(1234567.891, 2), "1,234,567.89");
        assert_eq!(format_number(-999.0, 0), "-999");
        assert_eq!(format_number(-0.001, 1), "0.0");
    }

    #[test]
    fn url_encoding() {
        assert_eq!(url_encode("a b/c?d=é"), "a%20b%2Fc%3Fd%3D%C3%A9");
        assert_eq!(url_encode("safe-_.~Az09"), "safe-_.~Az09");
        let r = HelperRegistry::standard();
        assert_eq!(r.call("url.encode", &[json!("x&y")]).unwrap(), json!("x%26y"));
    }

    #[test]
    fn register_requires_namespace() {
        let mut r = HelperRegistry::standard();
        assert!(r.register("shout", |_| Ok(Value::Null)).is_err());
        assert!(r.register("app.shout", |a| Ok(a[0].clone())).is_ok());
        assert!(r.static_names().any(|n| n == "app.shout"));
        assert!(!r.static_names().any(|n| n == "lookup"));
    }

    #[test]
    fn form_errors_read_root_keys() {
        let r = HelperRegistry::standard();
        let root = json!({"_errors": {"email": ["required", "invalid"], "name": "too short"}});
        assert_eq!(
            r.call("form.errors", &[root.clone(), json!("email")]).unwrap(),
            json!(["required", "invalid"])
        );
        assert_eq!(r.call("form.errors", &[root.clone(), json!("name")]).unwrap(), json!(["too short"]));
        assert_eq!(r.call("form.has_errors", &[root, json!("age")]).unwrap(), json!(false));
    }
}
