//! Runtime for compiled trellis templates.
//!
//! The compiler emits program text; this crate parses it ([`Program`]),
//! checks it against the prelude and a [`HelperRegistry`], and executes it
//! against JSON bindings.

pub mod error;
pub mod exec;
pub mod helpers;
pub mod prelude;
pub mod program;
pub mod value;

pub use error::RenderError;
pub use exec::{Fragment, FragmentHost, NoFragments, Runtime};
pub use helpers::HelperRegistry;
pub use prelude::{CORE_HELPERS, PRELUDE, RUNTIME_VERSION};
pub use program::{Expr, Program, Stmt, string_lit};

/// Parse and run `source` in one go with the standard helpers.
pub fn render_program(source: &str, data: &serde_json::Value) -> Result<String, RenderError> {
    let runtime = Runtime::default();
    let program = runtime.load(source)?;
    runtime.execute(&program, data, &NoFragments)
}
