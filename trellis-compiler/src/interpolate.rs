//! `{expr}` interpolation inside text and attribute values.
//!
//! `\{` is a literal brace. A `{` with no closing brace, or an empty `{}`, is
//! kept as literal text.

use trellis_runtime::string_lit;

use crate::error::ExprError;
use crate::expr::{ExprCompiler, Scope};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Piece {
    Literal(String),
    Expr(String),
}

pub fn split(input: &str) -> Vec<Piece> {
    let mut pieces = Vec::new();
    let mut literal = String::new();
    let mut rest = input;

    while let Some(ch) = rest.chars().next() {
        if rest.starts_with("\\{") {
            literal.push('{');
            rest = &rest[2..];
            continue;
        }
        if ch == '{' {
            if let Some(end) = closing_brace(&rest[1..]) {
                let inner = &rest[1..1 + end];
                if !inner.trim().is_empty() {
                    if !literal.is_empty() {
                        pieces.push(Piece::Literal(std::mem::take(&mut literal)));
                    }
                    pieces.push(Piece::Expr(inner.trim().to_string()));
                    rest = &rest[end + 2..];
                    continue;
                }
            }
        }
        literal.push(ch);
        rest = &rest[ch.len_utf8()..];
    }
    if !literal.is_empty() {
        pieces.push(Piece::Literal(literal));
    }
    pieces
}

// Byte offset of the `}` closing an interpolation, skipping quoted strings.
fn closing_brace(s: &str) -> Option<usize> {
    let mut quote = None;
    let mut escaped = false;
    for (i, ch) in s.char_indices() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '\'' | '"' => quote = Some(ch),
                '}' => return Some(i),
                '{' => return None,
                _ => {}
            },
        }
    }
    None
}

/// The whole of `input` when it is exactly one `{expr}` and nothing else.
pub fn single_expression(input: &str) -> Option<String> {
    match split(input.trim()).as_slice() {
        [Piece::Expr(e)] => Some(e.clone()),
        _ => None,
    }
}

/// Literal text with at least one `{expr}` in it, as in `/users/{id}`.
pub fn is_mixed(input: &str) -> bool {
    single_expression(input).is_none() && split(input).iter().any(|p| matches!(p, Piece::Expr(_)))
}

/// Directive values may be written bare (`items`) or braced (`{items}`).
pub fn unbrace(input: &str) -> String {
    single_expression(input).unwrap_or_else(|| input.trim().to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interpolated {
    /// No expressions; the unescaped literal text.
    Literal(String),
    /// Exactly one expression and no literal text around it.
    Single(String),
    /// A `concat(...)` of literals and expressions.
    Concat(String),
}

pub fn compile(input: &str, exprs: &ExprCompiler, scope: &Scope) -> Result<Interpolated, ExprError> {
    let pieces = split(input);
    match pieces.as_slice() {
        [] => return Ok(Interpolated::Literal(String::new())),
        [Piece::Literal(text)] => return Ok(Interpolated::Literal(text.clone())),
        [Piece::Expr(e)] => return Ok(Interpolated::Single(exprs.compile(e, scope)?)),
        _ => {}
    }
    let parts = pieces
        .iter()
        .map(|p| match p {
            Piece::Literal(text) => Ok(string_lit(text)),
            Piece::Expr(e) => exprs.compile(e, scope),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Interpolated::Concat(format!("concat({})", parts.join(", "))))
}
