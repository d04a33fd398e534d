//! Fragment declarations and references.
//!
//! A fragment is an element marked `<prefix>:fragment="name(params)"`. It can
//! be pulled into another spot with a reference of the form
//! `template :: name(args)`, `:: name(args)` (same template), `name(args)`
//! or just `template` (the whole template). Arguments are positional or
//! `param: expr`; parameters with no argument are null.
//!
//! Resolution happens at compile time whenever the fragment can be found.
//! The fragment's nodes are processed in an isolated scope holding only its
//! parameters and wrapped in a `with` block that binds them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use trellis_runtime::string_lit;

use crate::compiler::{Context, process_element, process_nodes};
use crate::directives::Directive;
use crate::error::CompileError;
use crate::expr::is_identifier;
use crate::placeholder::Position;
use crate::tree::{Element, Node, is_raw_text};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub name: String,
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Positional(String),
    Named(String, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// `None` for the template being compiled.
    pub template: Option<String>,
    /// `None` for the whole template.
    pub fragment: Option<String>,
    pub args: Vec<Arg>,
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.template, &self.fragment) {
            (Some(t), Some(frag)) => write!(f, "{t} :: {frag}"),
            (Some(t), None) => write!(f, "{t}"),
            (None, Some(frag)) => write!(f, ":: {frag}"),
            (None, None) => write!(f, "::"),
        }
    }
}

/// `name` or `name(a, b)`.
pub fn parse_declaration(input: &str) -> Result<Declaration, String> {
    let (name, params) = split_call(input.trim())?;
    if !is_identifier(name) {
        return Err(format!("`{name}` is not a valid fragment name"));
    }
    let mut seen = Vec::new();
    for param in params.map(split_args).transpose()?.unwrap_or_default() {
        let param = param.trim().to_string();
        if !is_identifier(&param) {
            return Err(format!("`{param}` is not a valid parameter name"));
        }
        if seen.contains(&param) {
            return Err(format!("parameter `{param}` declared twice"));
        }
        seen.push(param);
    }
    Ok(Declaration {
        name: name.to_string(),
        params: seen,
    })
}

pub fn parse_reference(input: &str) -> Result<Reference, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty fragment reference".into());
    }

    let (template, call) = match input.split_once("::") {
        Some((t, call)) => {
            let t = t.trim();
            let t = (!t.is_empty() && t != "this").then(|| t.to_string());
            (t, Some(call.trim()))
        }
        None => {
            let head = input.split('(').next().unwrap_or(input).trim();
            if is_identifier(head) {
                (None, Some(input))
            } else if input.contains('(') {
                return Err(format!("`{head}` is not a valid fragment name"));
            } else {
                (Some(input.to_string()), None)
            }
        }
    };

    let Some(call) = call else {
        return Ok(Reference {
            template,
            fragment: None,
            args: Vec::new(),
        });
    };
    let (name, args) = split_call(call)?;
    if !is_identifier(name) {
        return Err(format!("`{name}` is not a valid fragment name"));
    }
    let args = args
        .map(split_args)
        .transpose()?
        .unwrap_or_default()
        .into_iter()
        .map(|arg| classify_arg(&arg))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Reference {
        template,
        fragment: Some(name.to_string()),
        args,
    })
}

// `name(args)` into the name and the text between the parentheses.
fn split_call(input: &str) -> Result<(&str, Option<&str>), String> {
    match input.find('(') {
        None => Ok((input.trim(), None)),
        Some(open) => {
            let inner = input[open + 1..]
                .strip_suffix(')')
                .ok_or_else(|| format!("missing `)` in `{input}`"))?;
            Ok((input[..open].trim(), Some(inner)))
        }
    }
}

// Split on commas outside quotes and brackets.
pub(crate) fn split_args(input: &str) -> Result<Vec<String>, String> {
    if input.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut args = Vec::new();
    let mut depth = 0i32;
    let mut quote = None;
    let mut escaped = false;
    let mut start = 0;
    for (i, ch) in input.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => quote = Some(ch),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ',' if depth == 0 => {
                args.push(input[start..i].trim().to_string());
                start = i + 1;
            }
            _ => {}
        }
    }
    if quote.is_some() || depth != 0 {
        return Err(format!("unbalanced arguments `{input}`"));
    }
    args.push(input[start..].trim().to_string());
    if args.iter().any(String::is_empty) {
        return Err(format!("empty argument in `{input}`"));
    }
    Ok(args)
}

fn classify_arg(arg: &str) -> Result<Arg, String> {
    if let Some((name, value)) = arg.split_once(':') {
        let name = name.trim();
        if is_identifier(name) && !value.starts_with(':') {
            if value.trim().is_empty() {
                return Err(format!("argument `{name}` has no value"));
            }
            return Ok(Arg::Named(name.to_string(), value.trim().to_string()));
        }
    }
    Ok(Arg::Positional(arg.to_string()))
}

/// The fragment declared as `name` in `nodes`, with its declaration
/// attribute removed.
pub fn find(nodes: &[Node], prefix: &str, name: &str) -> Option<(Declaration, Element)> {
    let attribute = format!("{prefix}:fragment");
    let matches = |el: &Element| {
        el.attr_value(&attribute)
            .and_then(|v| parse_declaration(v).ok())
            .is_some_and(|d| d.name == name)
    };
    let mut el = crate::tree::find_element(nodes, &matches)?.clone();
    let decl = parse_declaration(&el.take_attr(&attribute)?.value?).ok()?;
    Some((decl, el))
}

/// A resolved reference, ready to expand.
#[derive(Debug, Clone)]
pub struct Target {
    pub template: String,
    pub fragment: Option<String>,
    pub params: Vec<String>,
    /// The fragment element, or the whole template's nodes.
    pub nodes: Vec<Node>,
}

pub fn resolve(cx: &mut Context, reference: &Reference) -> Result<Option<Target>, CompileError> {
    let name = reference
        .template
        .clone()
        .unwrap_or_else(|| cx.template().to_string());
    let Some((identity, doc)) = cx.document(&name)? else {
        return Ok(None);
    };
    match &reference.fragment {
        None => Ok(Some(Target {
            template: identity,
            fragment: None,
            params: Vec::new(),
            nodes: doc.children.clone(),
        })),
        Some(fragment) => Ok(find(&doc.children, &cx.options.prefix, fragment).map(|(decl, el)| Target {
            template: identity,
            fragment: Some(fragment.clone()),
            params: decl.params,
            nodes: vec![Node::Element(el)],
        })),
    }
}

/// Compile the reference's arguments in the caller's scope, paired with the
/// parameters they bind.
pub fn bindings(
    cx: &Context,
    d: &Directive,
    reference: &Reference,
    params: &[String],
) -> Result<Vec<(String, String)>, CompileError> {
    let mut bound: Vec<(String, String)> = Vec::new();
    for (i, arg) in reference.args.iter().enumerate() {
        let (param, source) = match arg {
            Arg::Positional(source) => {
                let param = params.get(i).ok_or_else(|| {
                    cx.directive_error(d, format!("too many arguments for `{reference}`"))
                })?;
                (param.clone(), source)
            }
            Arg::Named(name, source) => {
                if !params.contains(name) {
                    return Err(cx.directive_error(d, format!("`{reference}` has no parameter `{name}`")));
                }
                (name.clone(), source)
            }
        };
        if bound.iter().any(|(p, _)| *p == param) {
            return Err(cx.directive_error(d, format!("parameter `{param}` bound twice")));
        }
        bound.push((param, cx.expr(d, source)?));
    }
    for param in params {
        if !bound.iter().any(|(p, _)| p == param) {
            bound.push((param.clone(), "null".into()));
        }
    }
    Ok(bound)
}

pub fn with_open(bindings: &[(String, String)]) -> String {
    let list: Vec<String> = bindings
        .iter()
        .map(|(name, code)| format!("${name} = {code}"))
        .collect();
    format!("with ({}) {{", list.join(", "))
}

/// How much of a target to inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inline {
    /// The fragment element itself.
    Element,
    /// Only the fragment element's children.
    Children,
}

/// Process `target` in its own scope and wrap it in a `with` block binding
/// `bound`.
pub fn expand(
    cx: &mut Context,
    target: Target,
    bound: &[(String, String)],
    inline: Inline,
) -> Result<Vec<Node>, CompileError> {
    cx.enter(&target.template, target.fragment.as_deref())?;
    cx.scope.push_isolated(target.params.clone());

    let whole = target.fragment.is_none();
    let result = expand_nodes(cx, target.nodes, inline, whole);

    cx.scope.pop();
    cx.leave();
    let body = result?;

    let mut out = Vec::with_capacity(body.len() + 2);
    out.push(cx.codec.node(Position::Before, with_open(bound)));
    out.extend(body);
    out.push(cx.codec.node(Position::After, "}"));
    Ok(out)
}

fn expand_nodes(cx: &mut Context, nodes: Vec<Node>, inline: Inline, whole: bool) -> Result<Vec<Node>, CompileError> {
    let mut out = Vec::new();
    for node in nodes {
        match node {
            Node::Element(el) if inline == Inline::Children && !whole => {
                let raw = is_raw_text(&el.tag);
                out.extend(process_nodes(cx, el.children, raw)?);
            }
            Node::Element(el) => out.extend(process_element(cx, el)?),
            other => out.extend(process_nodes(cx, vec![other], false)?),
        }
    }
    Ok(out)
}

/// An `embed` statement that resolves the reference at render time.
/// Positional arguments travel as `_0`, `_1`, ...
pub fn deferred(cx: &Context, d: &Directive, reference: &Reference) -> Result<String, CompileError> {
    let template = reference
        .template
        .clone()
        .unwrap_or_else(|| cx.template().to_string());
    let mut args = Vec::new();
    for (i, arg) in reference.args.iter().enumerate() {
        let (name, source) = match arg {
            Arg::Positional(source) => (format!("_{i}"), source),
            Arg::Named(name, source) => (name.clone(), source),
        };
        args.push((name, cx.expr(d, source)?));
    }
    let list: Vec<String> = args
        .iter()
        .map(|(name, code)| format!("${name} = {code}"))
        .collect();
    tracing::warn!(
        template = cx.template(),
        reference = %reference,
        "fragment not found at compile time; resolving at render time"
    );
    Ok(format!(
        "embed {} {} ({});",
        string_lit(&template),
        string_lit(reference.fragment.as_deref().unwrap_or("")),
        list.join(", ")
    ))
}

/// Fragment declarations under `nodes`, by name, not descending into a
/// declaration. Used to collect the slot overrides of an `extends`.
pub fn declarations(nodes: &[Node], prefix: &str) -> Result<BTreeMap<String, Element>, String> {
    let attribute = format!("{prefix}:fragment");
    let mut found = BTreeMap::new();
    collect_declarations(nodes, &attribute, &mut found)?;
    Ok(found)
}

fn collect_declarations(
    nodes: &[Node],
    attribute: &str,
    found: &mut BTreeMap<String, Element>,
) -> Result<(), String> {
    for node in nodes {
        let Node::Element(el) = node else { continue };
        match el.attr_value(attribute) {
            Some(value) => {
                let decl = parse_declaration(value)?;
                if found.insert(decl.name.clone(), el.clone()).is_some() {
                    return Err(format!("fragment `{}` declared twice", decl.name));
                }
            }
            None => collect_declarations(&el.children, attribute, found)?,
        }
    }
    Ok(())
}

/// Names of every fragment declared anywhere under `nodes`.
pub fn declared_names(nodes: &[Node], prefix: &str) -> BTreeSet<String> {
    fn walk(nodes: &[Node], attribute: &str, names: &mut BTreeSet<String>) {
        for node in nodes {
            if let Node::Element(el) = node {
                if let Some(decl) = el.attr_value(attribute).and_then(|v| parse_declaration(v).ok()) {
                    names.insert(decl.name);
                }
                walk(&el.children, attribute, names);
            }
        }
    }
    let mut names = BTreeSet::new();
    walk(nodes, &format!("{prefix}:fragment"), &mut names);
    names
}

/// Swap every declaration in `nodes` named in `overrides` for the override,
/// removing each override as it is used.
pub fn substitute(nodes: Vec<Node>, prefix: &str, overrides: &mut BTreeMap<String, Node>) -> Vec<Node> {
    let attribute = format!("{prefix}:fragment");
    substitute_in(nodes, &attribute, overrides)
}

fn substitute_in(nodes: Vec<Node>, attribute: &str, overrides: &mut BTreeMap<String, Node>) -> Vec<Node> {
    nodes
        .into_iter()
        .map(|node| match node {
            Node::Element(mut el) => {
                let name = el
                    .attr_value(attribute)
                    .and_then(|v| parse_declaration(v).ok())
                    .map(|d| d.name);
                if let Some(replacement) = name.and_then(|n| overrides.remove(&n)) {
                    return replacement;
                }
                el.children = substitute_in(el.children, attribute, overrides);
                Node::Element(el)
            }
            other => other,
        })
        .collect()
}
