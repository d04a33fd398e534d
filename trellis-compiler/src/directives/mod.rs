//! Directive processors and the registry that maps attribute names to them.
//!
//! A directive is an attribute named `<prefix>:<name>`. Each element's
//! directives are removed from it and run in a fixed order: structural
//! first (`repeat` before `if` before fragment boundaries before `switch`),
//! then content, then attribute setters, then universal attributes. Within a
//! category the processor's [`DirectiveProcessor::order`] decides, then
//! source order.

pub mod attributes;
pub mod content;
pub mod form;
pub mod structural;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::compiler::Context;
use crate::error::CompileError;
use crate::placeholder::Position;
use crate::tree::{Element, Node, Span, is_void};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Category {
    Structural,
    Content,
    Attribute,
    Universal,
}

/// One directive attribute taken off its element.
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    /// Name after the prefix, e.g. `repeat`.
    pub name: String,
    /// Full attribute name, for messages.
    pub attribute: String,
    pub value: String,
    pub span: Span,
}

/// What processors contribute around, instead of, and inside their element.
#[derive(Debug, Default)]
pub struct Expansion {
    pub before: Vec<Node>,
    pub after: Vec<Node>,
    /// Set when the element is replaced; the nodes are already processed.
    pub replacement: Option<Vec<Node>>,
    /// Set when a processor produced the element's final children.
    pub children_done: bool,
    /// Scope frames pushed for this element, popped once it is done.
    pub scopes: usize,
}

impl Expansion {
    /// Open code before the element and matching close code after it. Later
    /// wraps nest inside earlier ones.
    pub fn wrap(&mut self, cx: &mut Context, open: impl Into<String>, close: impl Into<String>) {
        self.before.push(cx.codec.node(Position::Before, open));
        self.after.insert(0, cx.codec.node(Position::After, close));
    }

    pub fn push_scope(&mut self, cx: &mut Context, names: Vec<String>) {
        cx.scope.push(names);
        self.scopes += 1;
    }

    pub fn push_isolated_scope(&mut self, cx: &mut Context, names: Vec<String>) {
        cx.scope.push_isolated(names);
        self.scopes += 1;
    }
}

/// For processors that write children: void elements never serialize any.
pub fn reject_void(el: &Element, d: &Directive, cx: &Context) -> Result<(), CompileError> {
    if is_void(&el.tag) {
        return Err(cx.directive_error(d, format!("not allowed on void element `<{}>`", el.tag)));
    }
    Ok(())
}

pub trait DirectiveProcessor: Send + Sync {
    fn category(&self) -> Category;

    /// Rank within the category; lower runs first.
    fn order(&self) -> u8 {
        0
    }

    fn process(
        &self,
        el: &mut Element,
        directive: &Directive,
        out: &mut Expansion,
        cx: &mut Context,
    ) -> Result<(), CompileError>;
}

#[derive(Clone)]
pub struct Registry {
    named: BTreeMap<String, Arc<dyn DirectiveProcessor>>,
    universal: Arc<dyn DirectiveProcessor>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("named", &self.named.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::standard()
    }
}

impl Registry {
    /// Every built-in directive.
    pub fn standard() -> Self {
        let mut registry = Registry {
            named: BTreeMap::new(),
            universal: Arc::new(attributes::Universal),
        };
        registry.register("repeat", structural::Repeat);
        registry.register("if", structural::If);
        registry.register("fragment", structural::FragmentDecl);
        registry.register("extends", structural::Extends);
        registry.register("replace", structural::Replace);
        registry.register("include", structural::Include);
        registry.register("switch", structural::Switch);
        registry.register("errors", form::Errors);

        registry.register("text", content::Text);
        registry.register("raw", content::Raw);
        registry.register("class", content::Class);

        for name in attributes::SETTER_ATTRIBUTES {
            registry.register(name, attributes::Setter);
        }
        for name in attributes::BOOLEAN_ATTRIBUTES {
            registry.register(name, attributes::Boolean);
        }
        registry.register("csrf", form::Csrf);
        registry.register("method", form::Method);
        registry.register("field", form::Field);
        registry
    }

    /// Add or override a directive.
    pub fn register(&mut self, name: &str, processor: impl DirectiveProcessor + 'static) {
        self.named.insert(name.to_string(), Arc::new(processor));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn DirectiveProcessor>> {
        self.named.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.named.keys().map(String::as_str)
    }

    /// Take the directives off `el`, paired with their processors, in the
    /// order they must run.
    pub fn extract(
        &self,
        el: &mut Element,
        cx: &Context,
    ) -> Result<Vec<(Directive, Arc<dyn DirectiveProcessor>)>, CompileError> {
        let prefix = format!("{}:", cx.options.prefix);
        let mut found = Vec::new();
        let mut kept = Vec::with_capacity(el.attrs.len());

        for attr in std::mem::take(&mut el.attrs) {
            let Some(name) = attr.name.strip_prefix(&prefix) else {
                kept.push(attr);
                continue;
            };
            let directive = Directive {
                name: name.to_string(),
                attribute: attr.name.clone(),
                value: attr.value.clone().unwrap_or_default(),
                span: attr.span,
            };

            if matches!(name, "case" | "default") {
                if cx.options.strict {
                    return Err(cx.directive_error(&directive, "only allowed on direct children of a switch"));
                }
                tracing::warn!(template = cx.template(), attribute = %attr.name, "switch branch outside a switch; dropped");
                continue;
            }
            if let Some(processor) = self.named.get(name) {
                found.push((directive, processor.clone()));
            } else if attributes::is_universal_name(name) {
                found.push((directive, self.universal.clone()));
            } else if cx.options.strict {
                return Err(CompileError::UnknownAttribute {
                    template: cx.template().to_string(),
                    attribute: attr.name,
                    line: attr.span.line,
                    column: attr.span.column,
                });
            } else {
                tracing::warn!(template = cx.template(), attribute = %attr.name, "unrecognized attribute ignored");
            }
        }

        el.attrs = kept;
        found.sort_by_key(|(_, p)| (p.category(), p.order()));
        Ok(found)
    }
}
