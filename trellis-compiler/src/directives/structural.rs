use std::collections::BTreeMap;

use crate::compiler::{Context, process_element};
use crate::directives::{Category, Directive, DirectiveProcessor, Expansion, reject_void};
use crate::error::CompileError;
use crate::expr::{is_identifier, path_code};
use crate::fragment::{self, Inline, Reference};
use crate::interpolate::unbrace;
use crate::placeholder::Position;
use crate::tree::{Element, Node};

/// `repeat="item items"` or `repeat="key, item items"`.
pub struct Repeat;

/// Loop variables and the collection expression of a `repeat` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopBinding {
    pub key: Option<String>,
    pub item: String,
    pub source: String,
}

pub fn parse_loop(value: &str) -> Result<LoopBinding, String> {
    let value = value.trim();
    let (first, rest) = take_ident(value);
    let (key, item, rest) = match rest.trim_start().strip_prefix(',') {
        Some(after) => {
            let (second, rest) = take_ident(after.trim_start());
            (Some(first), second, rest)
        }
        None => (None, first, rest),
    };
    for name in key.iter().chain([&item]) {
        if !is_identifier(name) {
            return Err(format!("`{value}` does not start with a loop variable"));
        }
        if name.starts_with("__") {
            return Err(format!("`{name}` is reserved"));
        }
    }
    if key.as_deref() == Some(item) {
        return Err(format!("`{item}` used for both key and item"));
    }
    if !rest.starts_with(char::is_whitespace) {
        return Err(format!("expected `<item> <collection>`, got `{value}`"));
    }
    let source = rest.trim();
    let source = source.strip_prefix("in ").unwrap_or(source);
    if source.trim().is_empty() {
        return Err("missing collection".into());
    }
    Ok(LoopBinding {
        key: key.map(str::to_string),
        item: item.to_string(),
        source: unbrace(source),
    })
}

fn take_ident(s: &str) -> (&str, &str) {
    let end = s
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(s.len());
    s.split_at(end)
}

impl DirectiveProcessor for Repeat {
    fn category(&self) -> Category {
        Category::Structural
    }

    fn process(&self, _el: &mut Element, d: &Directive, out: &mut Expansion, cx: &mut Context) -> Result<(), CompileError> {
        let binding = parse_loop(&d.value).map_err(|m| cx.directive_error(d, m))?;
        let source = cx.expr(d, &binding.source)?;
        let vars = match &binding.key {
            Some(key) => format!("${key}, ${}", binding.item),
            None => format!("${}", binding.item),
        };
        out.wrap(cx, format!("for ({vars} in {source}) {{"), "}");
        out.push_scope(cx, binding.key.into_iter().chain([binding.item]).collect());
        Ok(())
    }
}

pub struct If;

impl DirectiveProcessor for If {
    fn category(&self) -> Category {
        Category::Structural
    }

    fn order(&self) -> u8 {
        1
    }

    fn process(&self, _el: &mut Element, d: &Directive, out: &mut Expansion, cx: &mut Context) -> Result<(), CompileError> {
        let cond = cx.expr(d, &unbrace(&d.value))?;
        out.wrap(cx, format!("if ({cond}) {{"), "}");
        Ok(())
    }
}

/// A fragment declaration rendered where it stands. Its parameters are
/// read from the enclosing scope under the same names.
pub struct FragmentDecl;

impl DirectiveProcessor for FragmentDecl {
    fn category(&self) -> Category {
        Category::Structural
    }

    fn order(&self) -> u8 {
        2
    }

    fn process(&self, _el: &mut Element, d: &Directive, out: &mut Expansion, cx: &mut Context) -> Result<(), CompileError> {
        let decl = fragment::parse_declaration(&d.value).map_err(|m| cx.directive_error(d, m))?;
        let bound: Vec<(String, String)> = decl
            .params
            .iter()
            .map(|p| (p.clone(), path_code(std::slice::from_ref(p), &cx.scope)))
            .collect();
        out.wrap(cx, fragment::with_open(&bound), "}");
        out.push_isolated_scope(cx, decl.params);
        Ok(())
    }
}

fn reference(cx: &Context, d: &Directive) -> Result<Reference, CompileError> {
    fragment::parse_reference(&d.value).map_err(|m| cx.directive_error(d, m))
}

/// Replace the element with a layout, filling the layout's fragments with
/// same-named fragments declared inside the element.
pub struct Extends;

impl DirectiveProcessor for Extends {
    fn category(&self) -> Category {
        Category::Structural
    }

    fn order(&self) -> u8 {
        3
    }

    fn process(&self, el: &mut Element, d: &Directive, out: &mut Expansion, cx: &mut Context) -> Result<(), CompileError> {
        let reference = reference(cx, d)?;
        let Some(mut target) = fragment::resolve(cx, &reference)? else {
            return Err(CompileError::FragmentNotFound {
                template: cx.template().to_string(),
                reference: reference.to_string(),
            });
        };

        let prefix = cx.options.prefix.clone();
        let slots = fragment::declared_names(&target.nodes, &prefix);
        let declared = fragment::declarations(&el.children, &prefix).map_err(|m| cx.directive_error(d, m))?;

        let mut overrides = BTreeMap::new();
        for (name, slot) in declared {
            if !slots.contains(&name) {
                if cx.options.strict {
                    return Err(cx.directive_error(d, format!("`{reference}` has no fragment `{name}` to override")));
                }
                tracing::warn!(template = cx.template(), fragment = %name, "override matches no layout fragment");
                continue;
            }
            overrides.insert(name, Node::Compiled(process_element(cx, slot)?));
        }
        target.nodes = fragment::substitute(target.nodes, &prefix, &mut overrides);

        let bound = fragment::bindings(cx, d, &reference, &target.params)?;
        out.replacement = Some(fragment::expand(cx, target, &bound, Inline::Element)?);
        Ok(())
    }
}

/// Replace the element with the referenced fragment.
pub struct Replace;

impl DirectiveProcessor for Replace {
    fn category(&self) -> Category {
        Category::Structural
    }

    fn order(&self) -> u8 {
        4
    }

    fn process(&self, _el: &mut Element, d: &Directive, out: &mut Expansion, cx: &mut Context) -> Result<(), CompileError> {
        let reference = reference(cx, d)?;
        let nodes = match fragment::resolve(cx, &reference)? {
            Some(target) => {
                let bound = fragment::bindings(cx, d, &reference, &target.params)?;
                fragment::expand(cx, target, &bound, Inline::Element)?
            }
            None => {
                let embed = fragment::deferred(cx, d, &reference)?;
                vec![cx.codec.node(Position::Replace, embed)]
            }
        };
        out.replacement = Some(nodes);
        Ok(())
    }
}

/// Keep the element, taking its children from the referenced fragment. A
/// fragment that cannot be found falls back to the element's own children
/// when it has any.
pub struct Include;

impl DirectiveProcessor for Include {
    fn category(&self) -> Category {
        Category::Structural
    }

    fn order(&self) -> u8 {
        5
    }

    fn process(&self, el: &mut Element, d: &Directive, out: &mut Expansion, cx: &mut Context) -> Result<(), CompileError> {
        reject_void(el, d, cx)?;
        let reference = reference(cx, d)?;
        match fragment::resolve(cx, &reference)? {
            Some(target) => {
                let bound = fragment::bindings(cx, d, &reference, &target.params)?;
                el.children = fragment::expand(cx, target, &bound, Inline::Children)?;
                out.children_done = true;
            }
            None if has_content(&el.children) => {
                tracing::warn!(
                    template = cx.template(),
                    reference = %reference,
                    "fragment not found; rendering the element's own content"
                );
            }
            None => {
                let embed = fragment::deferred(cx, d, &reference)?;
                el.children = vec![cx.codec.node(Position::Content, embed)];
                out.children_done = true;
            }
        }
        Ok(())
    }
}

fn has_content(nodes: &[Node]) -> bool {
    nodes.iter().any(|n| match n {
        Node::Text(t) => !t.trim().is_empty(),
        Node::Comment(_) => false,
        _ => true,
    })
}

/// Render the first child whose `case` equals the subject, or the
/// `default` child. Children must all be branches.
pub struct Switch;

impl DirectiveProcessor for Switch {
    fn category(&self) -> Category {
        Category::Structural
    }

    fn order(&self) -> u8 {
        6
    }

    fn process(&self, el: &mut Element, d: &Directive, out: &mut Expansion, cx: &mut Context) -> Result<(), CompileError> {
        reject_void(el, d, cx)?;
        let subject = cx.expr(d, &unbrace(&d.value))?;
        let var = cx.fresh_local("switch");
        let case_attr = format!("{}:case", cx.options.prefix);
        let default_attr = format!("{}:default", cx.options.prefix);

        let mut children = vec![cx.codec.node(Position::Content, format!("let ${var} = {subject};"))];
        let mut branches = 0;
        let mut has_default = false;

        for child in std::mem::take(&mut el.children) {
            let mut branch = match child {
                Node::Text(t) if t.trim().is_empty() => continue,
                Node::Comment(_) => continue,
                Node::Element(branch) => branch,
                _ => return Err(cx.directive_error(d, "children of a switch must be case or default elements")),
            };
            if has_default {
                return Err(cx.directive_error(d, "`default` must be the last branch"));
            }
            let else_ = if branches == 0 { "" } else { "} else " };
            let open = if let Some(attr) = branch.take_attr(&case_attr) {
                let case = Directive {
                    name: "case".into(),
                    attribute: attr.name,
                    value: attr.value.unwrap_or_default(),
                    span: attr.span,
                };
                let value = cx.expr(&case, &unbrace(&case.value))?;
                format!("{else_}if (${var} == {value}) {{")
            } else if branch.take_attr(&default_attr).is_some() {
                has_default = true;
                if branches == 0 { "if (true) {".to_string() } else { "} else {".to_string() }
            } else {
                return Err(cx.directive_error(
                    d,
                    format!("`<{}>` inside a switch has neither `{case_attr}` nor `{default_attr}`", branch.tag),
                ));
            };
            children.push(cx.codec.node(Position::Before, open));
            children.extend(process_element(cx, branch)?);
            branches += 1;
        }
        if branches > 0 {
            children.push(cx.codec.node(Position::After, "}"));
        }

        el.children = children;
        out.children_done = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_bindings() {
        assert_eq!(
            parse_loop("item items").unwrap(),
            LoopBinding {
                key: None,
                item: "item".into(),
                source: "items".into()
            }
        );
        let keyed = parse_loop("key,item {user.roles}").unwrap();
        assert_eq!(keyed.key.as_deref(), Some("key"));
        assert_eq!(keyed.source, "user.roles");
        assert_eq!(parse_loop("k , v in map").unwrap().source, "map");

        assert!(parse_loop("items").is_err());
        assert!(parse_loop("1x items").is_err());
        assert!(parse_loop("a, a items").is_err());
        assert!(parse_loop("__x items").is_err());
    }
}
