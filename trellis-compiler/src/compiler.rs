use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use trellis_runtime::{HelperRegistry, Program};

use crate::assembler;
use crate::cache::fingerprint;
use crate::directives::{Directive, Expansion, Registry};
use crate::error::{CompileError, ExprError, LoadError};
use crate::expr::{ExprCompiler, Scope};
use crate::fragment;
use crate::interpolate::{self, Interpolated, Piece};
use crate::loader::TemplateLoader;
use crate::placeholder::{PlaceholderCodec, Position};
use crate::tree::{Document, Element, Node, Span, is_raw_text, serialize_nodes};
use crate::tree_parse::{MarkupParser, TreeBuilder};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompilerOptions {
    /// Directive attributes are named `<prefix>:<name>`.
    pub prefix: String,
    /// Reject invalid directive names and misplaced switch branches instead
    /// of dropping them with a warning.
    pub strict: bool,
    /// Compile `{expr}` in text nodes.
    pub interpolate_text: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            prefix: "directive".into(),
            strict: true,
            interpolate_text: true,
        }
    }
}

/// A compiled template together with every template it read.
#[derive(Debug, Clone, PartialEq)]
pub struct Compiled {
    pub code: String,
    /// Identity to fingerprint, the compiled template included.
    pub dependencies: BTreeMap<String, String>,
}

/// A fragment compiled on its own for render-time embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFragment {
    pub params: Vec<String>,
    pub compiled: Compiled,
}

/// Turns template source into program text. Stateless between calls;
/// every compilation gets a fresh [`Context`].
#[derive(Clone)]
pub struct Compiler {
    options: CompilerOptions,
    directives: Registry,
    exprs: ExprCompiler,
    builder: Arc<dyn TreeBuilder>,
}

impl std::fmt::Debug for Compiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiler")
            .field("options", &self.options)
            .field("directives", &self.directives)
            .finish_non_exhaustive()
    }
}

impl Compiler {
    /// Templates may call exactly the namespaced helpers in `helpers`.
    pub fn new(options: CompilerOptions, helpers: &HelperRegistry) -> Self {
        Self {
            options,
            directives: Registry::standard(),
            exprs: ExprCompiler::new(helpers.static_names()),
            builder: Arc::new(MarkupParser),
        }
    }

    pub fn with_builder(mut self, builder: Arc<dyn TreeBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    pub fn directives_mut(&mut self) -> &mut Registry {
        &mut self.directives
    }

    /// Compile `source`, known as `identity`. Fragment references are
    /// resolved through `loader`.
    pub fn compile(
        &self,
        identity: &str,
        source: &str,
        loader: &dyn TemplateLoader,
    ) -> Result<Compiled, CompileError> {
        let mut cx = self.context(loader);
        let doc = cx.parse(identity, source)?;
        cx.enter(identity, None)?;
        let nodes = process_nodes(&mut cx, doc.children.clone(), false)?;
        cx.leave();
        cx.finish(&nodes)
    }

    /// Compile one fragment of `template` for render-time embedding. An
    /// empty `fragment` means the whole template. `None` when either cannot
    /// be found.
    pub fn compile_fragment(
        &self,
        template: &str,
        fragment: &str,
        loader: &dyn TemplateLoader,
    ) -> Result<Option<CompiledFragment>, CompileError> {
        let mut cx = self.context(loader);
        let Some((identity, doc)) = cx.document(template)? else {
            return Ok(None);
        };
        if fragment.is_empty() {
            cx.enter(&identity, None)?;
            let nodes = process_nodes(&mut cx, doc.children.clone(), false)?;
            cx.leave();
            return Ok(Some(CompiledFragment {
                params: Vec::new(),
                compiled: cx.finish(&nodes)?,
            }));
        }

        let Some((decl, el)) = fragment::find(&doc.children, &self.options.prefix, fragment) else {
            return Ok(None);
        };
        cx.enter(&identity, Some(fragment))?;
        cx.scope.push_isolated(decl.params.clone());
        let nodes = process_element(&mut cx, el)?;
        cx.scope.pop();
        cx.leave();
        Ok(Some(CompiledFragment {
            params: decl.params,
            compiled: cx.finish(&nodes)?,
        }))
    }

    fn context<'a>(&'a self, loader: &'a dyn TemplateLoader) -> Context<'a> {
        Context {
            options: &self.options,
            registry: &self.directives,
            exprs: &self.exprs,
            codec: PlaceholderCodec::new(),
            scope: Scope::default(),
            loader,
            builder: self.builder.as_ref(),
            documents: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            stack: Vec::new(),
            span: Span::default(),
            counter: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StackEntry {
    template: String,
    fragment: Option<String>,
}

impl StackEntry {
    fn label(&self) -> String {
        match &self.fragment {
            Some(f) => format!("{}::{f}", self.template),
            None => self.template.clone(),
        }
    }
}

/// State of one compilation: the marker table, the names in scope, the
/// templates read so far and the fragments being expanded.
pub struct Context<'a> {
    pub options: &'a CompilerOptions,
    pub registry: &'a Registry,
    pub exprs: &'a ExprCompiler,
    pub codec: PlaceholderCodec,
    pub scope: Scope,
    loader: &'a dyn TemplateLoader,
    builder: &'a dyn TreeBuilder,
    documents: BTreeMap<String, Arc<Document>>,
    dependencies: BTreeMap<String, String>,
    stack: Vec<StackEntry>,
    span: Span,
    counter: usize,
}

impl Context<'_> {
    /// Identity of the template whose nodes are being processed.
    pub fn template(&self) -> &str {
        self.stack.last().map_or("", |e| e.template.as_str())
    }

    /// A program variable name no template can bind.
    pub fn fresh_local(&mut self, stem: &str) -> String {
        let name = format!("__{stem}{}", self.counter);
        self.counter += 1;
        name
    }

    pub fn expr(&self, d: &Directive, source: &str) -> Result<String, CompileError> {
        self.exprs
            .compile(source, &self.scope)
            .map_err(|e| self.expr_error(d, e))
    }

    pub fn interpolate(&self, d: &Directive, value: &str) -> Result<Interpolated, CompileError> {
        interpolate::compile(value, self.exprs, &self.scope).map_err(|e| self.expr_error(d, e))
    }

    pub fn expr_error(&self, d: &Directive, source: ExprError) -> CompileError {
        CompileError::Expression {
            template: self.template().to_string(),
            attribute: d.attribute.clone(),
            line: d.span.line,
            column: d.span.column,
            source,
        }
    }

    pub fn directive_error(&self, d: &Directive, message: impl Into<String>) -> CompileError {
        CompileError::Directive {
            template: self.template().to_string(),
            attribute: d.attribute.clone(),
            line: d.span.line,
            column: d.span.column,
            message: message.into(),
        }
    }

    fn parse(&mut self, identity: &str, source: &str) -> Result<Arc<Document>, CompileError> {
        let doc = self
            .builder
            .parse(source)
            .map_err(|source| CompileError::Parse {
                template: identity.to_string(),
                source,
            })?;
        let doc = Arc::new(doc);
        self.dependencies
            .insert(identity.to_string(), fingerprint(source));
        self.documents.insert(identity.to_string(), doc.clone());
        Ok(doc)
    }

    /// Parsed tree of the template `name`, loading it on first use. `None`
    /// when the loader has no such template.
    pub fn document(&mut self, name: &str) -> Result<Option<(String, Arc<Document>)>, CompileError> {
        if let Some(doc) = self.documents.get(name) {
            return Ok(Some((name.to_string(), doc.clone())));
        }
        let loaded = match self.loader.load(name) {
            Ok(loaded) => loaded,
            Err(LoadError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if let Some(doc) = self.documents.get(&loaded.identity) {
            return Ok(Some((loaded.identity, doc.clone())));
        }
        let doc = self.parse(&loaded.identity, &loaded.source)?;
        Ok(Some((loaded.identity, doc)))
    }

    /// Start expanding `template`/`fragment`, failing if it is already being
    /// expanded further up.
    pub fn enter(&mut self, template: &str, fragment: Option<&str>) -> Result<(), CompileError> {
        let entry = StackEntry {
            template: template.to_string(),
            fragment: fragment.map(str::to_string),
        };
        if self.stack.contains(&entry) {
            let mut chain: Vec<String> = self.stack.iter().map(StackEntry::label).collect();
            chain.push(entry.label());
            return Err(CompileError::Cycle { chain });
        }
        self.stack.push(entry);
        Ok(())
    }

    pub fn leave(&mut self) {
        self.stack.pop();
    }

    fn finish(self, nodes: &[Node]) -> Result<Compiled, CompileError> {
        let serialized = serialize_nodes(nodes);
        let segments = self.codec.decode(&serialized)?;
        let code = assembler::assemble(&segments);
        Program::parse(&code).map_err(CompileError::Program)?;
        tracing::debug!(
            markers = self.codec.len(),
            dependencies = self.dependencies.len(),
            bytes = code.len(),
            "compiled"
        );
        Ok(Compiled {
            code,
            dependencies: self.dependencies,
        })
    }
}

/// Process a run of sibling nodes.
pub fn process_nodes(cx: &mut Context, nodes: Vec<Node>, raw_text: bool) -> Result<Vec<Node>, CompileError> {
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node {
            Node::Element(el) => out.extend(process_element(cx, el)?),
            Node::Text(text) if cx.options.interpolate_text && !raw_text => {
                out.extend(process_text(cx, text)?);
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

fn process_text(cx: &mut Context, text: String) -> Result<Vec<Node>, CompileError> {
    let pieces = interpolate::split(&text);
    if !pieces.iter().any(|p| matches!(p, Piece::Expr(_))) {
        return Ok(pieces
            .into_iter()
            .map(|p| match p {
                Piece::Literal(s) | Piece::Expr(s) => Node::Text(s),
            })
            .collect());
    }
    let mut out = Vec::with_capacity(pieces.len());
    for piece in pieces {
        match piece {
            Piece::Literal(s) => out.push(Node::Text(s)),
            Piece::Expr(e) => {
                let code = cx.exprs.compile(&e, &cx.scope).map_err(|source| {
                    CompileError::Expression {
                        template: cx.template().to_string(),
                        attribute: format!("{{{e}}}"),
                        line: cx.span.line,
                        column: cx.span.column,
                        source,
                    }
                })?;
                out.push(cx.codec.node(Position::Content, format!("print escape({code});")));
            }
        }
    }
    Ok(out)
}

/// Run an element's directives and process what remains of it. On failure
/// every marker and scope frame the element added is discarded.
pub fn process_element(cx: &mut Context, el: Element) -> Result<Vec<Node>, CompileError> {
    let checkpoint = cx.codec.checkpoint();
    let depth = cx.scope.depth();
    let outer_span = std::mem::replace(&mut cx.span, el.span);

    let result = expand_element(cx, el);

    cx.span = outer_span;
    if result.is_err() {
        cx.codec.rollback(checkpoint);
        cx.scope.truncate(depth);
    }
    result
}

fn expand_element(cx: &mut Context, mut el: Element) -> Result<Vec<Node>, CompileError> {
    let registry = cx.registry;
    let directives = registry.extract(&mut el, cx)?;
    let mut out = Expansion::default();

    for (directive, processor) in directives {
        if out.replacement.is_some() {
            tracing::debug!(
                template = cx.template(),
                attribute = %directive.attribute,
                "element replaced; directive skipped"
            );
            continue;
        }
        processor.process(&mut el, &directive, &mut out, cx)?;
    }

    let body = match out.replacement.take() {
        Some(nodes) => nodes,
        None => {
            if !out.children_done {
                let raw = is_raw_text(&el.tag);
                let children = std::mem::take(&mut el.children);
                el.children = process_nodes(cx, children, raw)?;
            }
            vec![Node::Element(el)]
        }
    };
    for _ in 0..out.scopes {
        cx.scope.pop();
    }

    let mut nodes = out.before;
    nodes.extend(body);
    nodes.extend(out.after);
    Ok(nodes)
}
