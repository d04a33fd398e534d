use trellis_runtime::string_lit;

use crate::compiler::Context;
use crate::directives::{Category, Directive, DirectiveProcessor, Expansion, reject_void};
use crate::error::CompileError;
use crate::fragment::split_args;
use crate::interpolate::unbrace;
use crate::placeholder::Position;
use crate::tree::Element;

/// Replace the children with the escaped value.
pub struct Text;

impl DirectiveProcessor for Text {
    fn category(&self) -> Category {
        Category::Content
    }

    fn process(&self, el: &mut Element, d: &Directive, out: &mut Expansion, cx: &mut Context) -> Result<(), CompileError> {
        reject_void(el, d, cx)?;
        let value = cx.expr(d, &unbrace(&d.value))?;
        el.children = vec![cx.codec.node(Position::Content, format!("print escape({value});"))];
        out.children_done = true;
        Ok(())
    }
}

/// Replace the children with the value, unescaped.
pub struct Raw;

impl DirectiveProcessor for Raw {
    fn category(&self) -> Category {
        Category::Content
    }

    fn order(&self) -> u8 {
        1
    }

    fn process(&self, el: &mut Element, d: &Directive, out: &mut Expansion, cx: &mut Context) -> Result<(), CompileError> {
        reject_void(el, d, cx)?;
        let value = cx.expr(d, &unbrace(&d.value))?;
        el.children = vec![cx.codec.node(Position::Content, format!("print {value};"))];
        out.children_done = true;
        Ok(())
    }
}

/// Conditional classes, merged with any static `class`. Either
/// `name: cond, other: cond` pairs, or one expression giving a string, a
/// list or a name-to-condition map.
pub struct Class;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassSpec {
    Pairs(Vec<(String, String)>),
    Computed(String),
}

pub fn parse_classes(value: &str) -> Result<ClassSpec, String> {
    let value = unbrace(value);
    let parts = split_args(&value)?;
    let pairs: Option<Vec<(String, String)>> = parts
        .iter()
        .map(|part| {
            let (name, cond) = part.split_once(':')?;
            let name = name.trim();
            let name = name
                .strip_prefix('\'')
                .and_then(|n| n.strip_suffix('\''))
                .or_else(|| name.strip_prefix('"').and_then(|n| n.strip_suffix('"')))
                .unwrap_or(name);
            let valid = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            (valid && !cond.trim().is_empty()).then(|| (name.to_string(), cond.trim().to_string()))
        })
        .collect();
    match (pairs, parts.as_slice()) {
        (Some(pairs), _) if !pairs.is_empty() => Ok(ClassSpec::Pairs(pairs)),
        (_, [single]) => Ok(ClassSpec::Computed(single.clone())),
        _ => Err(format!("expected `name: condition, ...` or one expression, got `{value}`")),
    }
}

impl DirectiveProcessor for Class {
    fn category(&self) -> Category {
        Category::Content
    }

    fn order(&self) -> u8 {
        2
    }

    fn process(&self, el: &mut Element, d: &Directive, _out: &mut Expansion, cx: &mut Context) -> Result<(), CompileError> {
        let spec = parse_classes(&d.value).map_err(|m| cx.directive_error(d, m))?;
        let static_classes = el
            .take_attr("class")
            .and_then(|a| a.value)
            .unwrap_or_default();

        let mut args = vec![string_lit(&static_classes)];
        match spec {
            ClassSpec::Pairs(pairs) => {
                for (name, cond) in pairs {
                    args.push(string_lit(&name));
                    args.push(cx.expr(d, &cond)?);
                }
            }
            ClassSpec::Computed(source) => args.push(cx.expr(d, &source)?),
        }
        let code = format!("print attr(\"class\", classes({}));", args.join(", "));
        el.attrs.push(cx.codec.attribute(code));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_specs() {
        assert_eq!(
            parse_classes("active: item.active, 'is-off': !on").unwrap(),
            ClassSpec::Pairs(vec![
                ("active".into(), "item.active".into()),
                ("is-off".into(), "!on".into())
            ])
        );
        assert_eq!(
            parse_classes("{state ? 'on' : 'off'}").unwrap(),
            ClassSpec::Computed("state ? 'on' : 'off'".into())
        );
        assert_eq!(
            parse_classes("item.classes").unwrap(),
            ClassSpec::Computed("item.classes".into())
        );
        assert!(parse_classes("a, b").is_err());
    }
}
