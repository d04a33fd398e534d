use std::path::PathBuf;

use thiserror::Error;
use trellis_runtime::RenderError;

use crate::placeholder::Position;

/// Malformed template markup.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{line}:{column}: {message}")]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("empty expression")]
    Empty,
    #[error("cannot parse `{expression}`: {message}")]
    Syntax { expression: String, message: String },
    #[error("call to `{0}` is not allowed")]
    Disallowed(String),
    #[error("`{0}` is a core helper and cannot be called from a template")]
    CoreHelper(String),
    #[error("`{0}` is not a property path")]
    NotAPath(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceholderError {
    #[error("placeholder {id} ({position:?}) was lost from the serialized tree")]
    Orphaned { id: usize, position: Position },
    #[error("placeholder {0} appears more than once")]
    Duplicated(usize),
    #[error("placeholder {0} was never issued")]
    Unknown(usize),
    #[error("malformed placeholder at byte {0}")]
    Malformed(usize),
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("template `{0}` not found")]
    NotFound(String),
    #[error("template name `{0}` escapes the template root")]
    OutsideRoot(String),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache entry {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding cache entry: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{template}: parse error at {source}")]
    Parse {
        template: String,
        #[source]
        source: ParseError,
    },
    #[error("{template}:{line}:{column}: in `{attribute}`: {source}")]
    Expression {
        template: String,
        attribute: String,
        line: usize,
        column: usize,
        #[source]
        source: ExprError,
    },
    #[error("{template}:{line}:{column}: `{attribute}`: {message}")]
    Directive {
        template: String,
        attribute: String,
        line: usize,
        column: usize,
        message: String,
    },
    #[error("{template}:{line}:{column}: unrecognized attribute `{attribute}`")]
    UnknownAttribute {
        template: String,
        attribute: String,
        line: usize,
        column: usize,
    },
    #[error("{template}: fragment `{reference}` not found")]
    FragmentNotFound { template: String, reference: String },
    #[error("cyclic fragment reference: {}", .chain.join(" -> "))]
    Cycle { chain: Vec<String> },
    #[error(transparent)]
    Placeholder(#[from] PlaceholderError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("generated program is invalid: {0}")]
    Program(#[source] RenderError),
}

/// Everything the engine can fail with.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("config {path}: {message}")]
    Config { path: PathBuf, message: String },
}
