//! Compiles markup templates carrying `directive:*` attributes into trellis
//! programs, and renders them through [`trellis_runtime`].
//!
//! The pipeline: the tree builder parses markup into a [`tree::Document`];
//! directive processors rewrite elements, parking generated code behind
//! [`placeholder`] markers; the tree is serialized, the markers decoded, and
//! the assembler emits the final program. [`Engine`] adds loading, caching
//! and render-time fragment embedding.
//!
//! ```no_run
//! use std::sync::Arc;
//! use trellis_compiler::{Engine, MemoryLoader};
//!
//! let loader = MemoryLoader::with([(
//!     "list.html",
//!     r#"<ul><li directive:repeat="item items">{item}</li></ul>"#,
//! )]);
//! let engine = Engine::new(Arc::new(loader));
//! let html = engine
//!     .render("list.html", &serde_json::json!({"items": ["a", "b"]}))
//!     .unwrap();
//! assert_eq!(html, "<ul><li>a</li><li>b</li></ul>");
//! ```

pub mod assembler;
pub mod cache;
pub mod compiler;
pub mod config;
pub mod directives;
pub mod engine;
pub mod error;
pub mod expr;
pub mod fragment;
pub mod interpolate;
pub mod loader;
pub mod placeholder;
pub mod tree;
pub mod tree_parse;

pub use cache::{CacheEntry, CacheStore, FsCacheStore, MemoryCacheStore, fingerprint};
pub use compiler::{Compiled, Compiler, CompilerOptions};
pub use config::{CONFIG_FILE, EngineConfig};
pub use engine::{Engine, WarmReport};
pub use error::{CompileError, Error, ExprError, LoadError, ParseError, PlaceholderError};
pub use loader::{FsLoader, MemoryLoader, TemplateLoader, TemplateSource};
pub use tree_parse::{MarkupParser, TreeBuilder};

/// Compile one template with default options and standard helpers.
/// Fragment references can only point into the template itself.
pub fn compile(identity: &str, source: &str) -> Result<Compiled, CompileError> {
    let loader = MemoryLoader::with([(identity, source)]);
    let helpers = trellis_runtime::HelperRegistry::standard();
    Compiler::new(CompilerOptions::default(), &helpers).compile(identity, source, &loader)
}

/// Compile and render one template with default options.
pub fn render(identity: &str, source: &str, data: &serde_json::Value) -> Result<String, Error> {
    let loader = MemoryLoader::with([(identity, source)]);
    Engine::new(std::sync::Arc::new(loader)).render_source(identity, source, data)
}
