//! Form assistance. These read a few reserved root keys at render time:
//! `_csrf_token`, `_old` (previously submitted values by dotted field name)
//! and `_errors` (messages by dotted field name).

use trellis_runtime::string_lit;

use crate::compiler::Context;
use crate::directives::attributes::attr_code;
use crate::directives::{Category, Directive, DirectiveProcessor, Expansion, reject_void};
use crate::error::CompileError;
use crate::interpolate::unbrace;
use crate::placeholder::Position;
use crate::tree::{Element, Node};

fn hidden_input(name: &str) -> Element {
    let mut input = Element::new("input");
    input.set_attr("type", Some("hidden".into()));
    input.set_attr("name", Some(name.into()));
    input
}

fn require_tag(el: &Element, d: &Directive, cx: &Context, tags: &[&str]) -> Result<(), CompileError> {
    if tags.iter().any(|t| el.tag.eq_ignore_ascii_case(t)) {
        Ok(())
    } else {
        Err(cx.directive_error(d, format!("not allowed on `<{}>`", el.tag)))
    }
}

/// Adds a hidden `_token` input carrying the CSRF token.
pub struct Csrf;

impl DirectiveProcessor for Csrf {
    fn category(&self) -> Category {
        Category::Attribute
    }

    fn order(&self) -> u8 {
        1
    }

    fn process(&self, el: &mut Element, d: &Directive, _out: &mut Expansion, cx: &mut Context) -> Result<(), CompileError> {
        require_tag(el, d, cx, &["form"])?;
        let mut input = hidden_input("_token");
        input
            .attrs
            .push(cx.codec.attribute(attr_code("value", "form.csrf_token($)")));
        el.children.insert(0, Node::Element(input));
        Ok(())
    }
}

/// `method="put"` and friends: browsers only submit GET and POST, so other
/// verbs post with a hidden `_method` override.
pub struct Method;

impl DirectiveProcessor for Method {
    fn category(&self) -> Category {
        Category::Attribute
    }

    fn order(&self) -> u8 {
        1
    }

    fn process(&self, el: &mut Element, d: &Directive, _out: &mut Expansion, cx: &mut Context) -> Result<(), CompileError> {
        require_tag(el, d, cx, &["form"])?;
        let verb = d.value.trim().to_ascii_lowercase();
        match verb.as_str() {
            "get" | "post" => el.set_attr("method", Some(verb)),
            "put" | "patch" | "delete" => {
                el.set_attr("method", Some("post".into()));
                let mut input = hidden_input("_method");
                input.set_attr("value", Some(verb.to_ascii_uppercase()));
                el.children.insert(0, Node::Element(input));
            }
            _ => return Err(cx.directive_error(d, format!("unsupported method `{}`", d.value.trim()))),
        }
        Ok(())
    }
}

/// Binds a form control to a field path: sets `name` (`user[email]`), a
/// default `id` (`user_email`) and the previously submitted value.
pub struct Field;

pub fn field_name(segments: &[String]) -> String {
    let mut name = segments.first().cloned().unwrap_or_default();
    for segment in segments.iter().skip(1) {
        name.push('[');
        name.push_str(segment);
        name.push(']');
    }
    name
}

impl DirectiveProcessor for Field {
    fn category(&self) -> Category {
        Category::Attribute
    }

    fn order(&self) -> u8 {
        1
    }

    fn process(&self, el: &mut Element, d: &Directive, out: &mut Expansion, cx: &mut Context) -> Result<(), CompileError> {
        require_tag(el, d, cx, &["input", "textarea", "select"])?;
        let (segments, path) = cx
            .exprs
            .compile_path(&unbrace(&d.value), &cx.scope)
            .map_err(|e| cx.expr_error(d, e))?;
        let key = segments.join(".");
        el.set_attr("name", Some(field_name(&segments)));
        if !el.has_attr("id") {
            el.set_attr("id", Some(segments.join("_")));
        }
        let old = format!("form.old($, {}, {path})", string_lit(&key));

        if el.tag.eq_ignore_ascii_case("textarea") {
            el.children = vec![cx.codec.node(
                Position::Content,
                format!("print escape({old});"),
            )];
            out.children_done = true;
            return Ok(());
        }
        if el.tag.eq_ignore_ascii_case("select") {
            return Ok(());
        }

        let kind = el.attr_value("type").unwrap_or("text").to_ascii_lowercase();
        let code = match kind.as_str() {
            "password" | "file" | "submit" | "button" | "reset" | "image" => return Ok(()),
            "checkbox" => {
                el.take_attr("checked");
                format!("if ({old}) {{\necho \" checked\";\n}}")
            }
            "radio" => {
                let Some(value) = el.attr_value("value").map(str::to_string) else {
                    return Err(cx.directive_error(d, "a radio field needs a static `value`"));
                };
                el.take_attr("checked");
                format!("if ({old} == {}) {{\necho \" checked\";\n}}", string_lit(&value))
            }
            _ => {
                el.take_attr("value");
                attr_code("value", &old)
            }
        };
        el.attrs.push(cx.codec.attribute(code));
        Ok(())
    }
}

/// Renders the element only when the field has errors. Inside it `errors`
/// is the list of messages; an empty element shows them joined.
pub struct Errors;

impl DirectiveProcessor for Errors {
    fn category(&self) -> Category {
        Category::Structural
    }

    fn order(&self) -> u8 {
        7
    }

    fn process(&self, el: &mut Element, d: &Directive, out: &mut Expansion, cx: &mut Context) -> Result<(), CompileError> {
        reject_void(el, d, cx)?;
        let (segments, _) = cx
            .exprs
            .compile_path(&unbrace(&d.value), &cx.scope)
            .map_err(|e| cx.expr_error(d, e))?;
        let key = string_lit(&segments.join("."));
        out.wrap(
            cx,
            format!("if (form.has_errors($, {key})) {{\nlet $errors = form.errors($, {key});"),
            "}",
        );
        out.push_scope(cx, vec!["errors".into()]);

        let empty = el.children.iter().all(|n| match n {
            Node::Text(t) => t.trim().is_empty(),
            _ => false,
        });
        if empty {
            el.children = vec![cx.codec.node(
                Position::Content,
                "print escape(list.join($errors, \", \"));",
            )];
            out.children_done = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bracketed_field_names() {
        let segments: Vec<String> = ["user", "address", "city"].map(String::from).to_vec();
        assert_eq!(field_name(&segments), "user[address][city]");
        assert_eq!(field_name(&["email".to_string()]), "email");
    }
}
