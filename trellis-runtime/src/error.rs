use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RenderError {
    #[error("program syntax error: {0}")]
    Syntax(String),

    #[error("compiled for runtime version {found}, this runtime is version {expected}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("unknown helper `{0}`")]
    UnknownHelper(String),

    #[error("helper `{0}` is called but not imported by the prelude")]
    NotImported(String),

    #[error("helper `{name}` failed: {message}")]
    Helper { name: String, message: String },

    #[error("undefined variable `${0}`")]
    UndefinedVariable(String),

    #[error("cannot iterate over {0}")]
    NotIterable(&'static str),

    #[error("fragment `{fragment}` not found in template `{template}`")]
    FragmentNotFound { template: String, fragment: String },

    #[error("embedding `{0}` exceeds the maximum fragment depth")]
    EmbedDepth(String),

    #[error("{0}")]
    Failed(String),
}
