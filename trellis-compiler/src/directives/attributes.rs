use trellis_runtime::string_lit;

use crate::compiler::Context;
use crate::directives::{Category, Directive, DirectiveProcessor, Expansion};
use crate::error::CompileError;
use crate::interpolate::{Interpolated, is_mixed, unbrace};
use crate::tree::{Attribute, Element};

/// Attributes with a dedicated setter directive: the value is one
/// expression, and a null result leaves the attribute out.
pub const SETTER_ATTRIBUTES: &[&str] = &[
    "id", "href", "src", "value", "title", "alt", "name", "placeholder", "action", "style", "for",
    "type", "target", "rel", "content", "width", "height", "min", "max", "step", "lang", "role",
    "tabindex", "srcset", "poster", "label",
];

/// Attributes present or absent by truthiness.
pub const BOOLEAN_ATTRIBUTES: &[&str] = &[
    "checked", "selected", "disabled", "readonly", "required", "hidden", "multiple", "autofocus",
    "open", "novalidate", "formnovalidate", "async", "defer", "autoplay", "controls", "loop",
    "muted", "playsinline", "inert", "reversed", "allowfullscreen", "ismap", "nomodule",
];

/// Any syntactically valid attribute name may be set through the universal
/// form, e.g. `directive:onclick` or `directive:hx-get`.
pub fn is_universal_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '@')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

/// `print attr("name", value);`, which omits the attribute for null.
pub fn attr_code(name: &str, value: &str) -> String {
    format!("print attr({}, {value});", string_lit(name))
}

/// A bare expression (`link`, `{link}`) or literal text with `{expr}`
/// segments (`/users/{user.id}`).
pub struct Setter;

impl DirectiveProcessor for Setter {
    fn category(&self) -> Category {
        Category::Attribute
    }

    fn process(&self, el: &mut Element, d: &Directive, _out: &mut Expansion, cx: &mut Context) -> Result<(), CompileError> {
        let value = if is_mixed(&d.value) {
            match cx.interpolate(d, &d.value)? {
                Interpolated::Single(code) | Interpolated::Concat(code) => code,
                Interpolated::Literal(text) => string_lit(&text),
            }
        } else {
            cx.expr(d, &unbrace(&d.value))?
        };
        el.take_attr(&d.name);
        el.attrs.push(cx.codec.attribute(attr_code(&d.name, &value)));
        Ok(())
    }
}

pub struct Boolean;

impl DirectiveProcessor for Boolean {
    fn category(&self) -> Category {
        Category::Attribute
    }

    fn process(&self, el: &mut Element, d: &Directive, _out: &mut Expansion, cx: &mut Context) -> Result<(), CompileError> {
        let cond = cx.expr(d, &unbrace(&d.value))?;
        el.take_attr(&d.name);
        let code = format!(
            "if ({cond}) {{\necho {};\n}}",
            string_lit(&format!(" {}", d.name))
        );
        el.attrs.push(cx.codec.attribute(code));
        Ok(())
    }
}

/// Any other attribute, with `{expr}` interpolation in its value. A value
/// that is a single `{expr}` leaves the attribute out when null.
pub struct Universal;

impl DirectiveProcessor for Universal {
    fn category(&self) -> Category {
        Category::Universal
    }

    fn process(&self, el: &mut Element, d: &Directive, _out: &mut Expansion, cx: &mut Context) -> Result<(), CompileError> {
        el.take_attr(&d.name);
        let attr = match cx.interpolate(d, &d.value)? {
            Interpolated::Literal(text) => Attribute::new(d.name.clone(), Some(text)),
            Interpolated::Single(code) | Interpolated::Concat(code) => {
                cx.codec.attribute(attr_code(&d.name, &code))
            }
        };
        el.attrs.push(attr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn universal_names() {
        for name in ["data-id", "aria-label", "onclick", "hx-get", "x-data", "bgcolor", "@click", "xlink:href"] {
            assert!(is_universal_name(name), "{name}");
        }
        assert!(!is_universal_name("9lives"));
        assert!(!is_universal_name("-x"));
        assert!(!is_universal_name(""));
    }
}
