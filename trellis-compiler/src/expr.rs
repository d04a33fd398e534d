//! Template expressions and their translation to program expressions.
//!
//! Property paths become chains of null-safe `lookup` calls. The first
//! segment of a path reads a local (`$item`) when a directive in scope bound
//! that name, and the render-time root (`$`) otherwise.

use std::collections::BTreeSet;

use pest::Parser;
use pest::iterators::Pair;
use pest_derive::Parser;
use trellis_runtime::{CORE_HELPERS, string_lit};

use crate::error::ExprError;

#[derive(Parser)]
#[grammar = "expr.pest"]
struct ExprParser;

#[derive(Debug, Clone, PartialEq)]
pub enum Ast {
    Path(Vec<String>),
    Str(String),
    Number(String),
    Bool(bool),
    Null,
    Not(Box<Ast>),
    Binary(&'static str, Box<Ast>, Box<Ast>),
    Concat(Vec<Ast>),
    Ternary(Box<Ast>, Box<Ast>, Box<Ast>),
    Call(String, Vec<Ast>),
}

pub fn parse(source: &str) -> Result<Ast, ExprError> {
    if source.trim().is_empty() {
        return Err(ExprError::Empty);
    }
    let syntax = |message: String| ExprError::Syntax {
        expression: source.to_string(),
        message,
    };
    let mut pairs = ExprParser::parse(Rule::expression, source)
        .map_err(|e| syntax(e.variant.message().into_owned()))?;
    let expr = pairs
        .next()
        .and_then(|p| p.into_inner().next())
        .ok_or_else(|| syntax("empty parse".into()))?;
    build(expr).map_err(syntax)
}

fn build(node: Pair<Rule>) -> Result<Ast, String> {
    match node.as_rule() {
        Rule::expr | Rule::group => first(node),
        Rule::ternary => {
            let mut parts = node.into_inner();
            let cond = build(parts.next().ok_or("missing condition")?)?;
            match (parts.next(), parts.next()) {
                (Some(a), Some(b)) => Ok(Ast::Ternary(Box::new(cond), Box::new(build(a)?), Box::new(build(b)?))),
                _ => Ok(cond),
            }
        }
        Rule::or_expr => fold(node, "||"),
        Rule::and_expr => fold(node, "&&"),
        Rule::equality => {
            let mut parts = node.into_inner();
            let mut acc = build(parts.next().ok_or("missing operand")?)?;
            while let (Some(op), Some(rhs)) = (parts.next(), parts.next()) {
                let op = if op.as_str() == "==" { "==" } else { "!=" };
                acc = Ast::Binary(op, Box::new(acc), Box::new(build(rhs)?));
            }
            Ok(acc)
        }
        Rule::concat => {
            let mut parts = node
                .into_inner()
                .map(build)
                .collect::<Result<Vec<_>, _>>()?;
            if parts.len() == 1 {
                Ok(parts.remove(0))
            } else {
                Ok(Ast::Concat(parts))
            }
        }
        Rule::unary => {
            let mut nots = 0;
            let mut operand = None;
            for part in node.into_inner() {
                if part.as_rule() == Rule::not {
                    nots += 1;
                } else {
                    operand = Some(build(part)?);
                }
            }
            let mut ast = operand.ok_or("missing operand")?;
            for _ in 0..nots {
                ast = Ast::Not(Box::new(ast));
            }
            Ok(ast)
        }
        Rule::call => {
            let mut parts = node.into_inner();
            let name = parts.next().ok_or("missing callee")?.as_str().to_string();
            let args = parts.map(build).collect::<Result<_, _>>()?;
            Ok(Ast::Call(name, args))
        }
        Rule::path => Ok(Ast::Path(node.into_inner().map(|s| s.as_str().to_string()).collect())),
        Rule::string => Ok(Ast::Str(unescape(first_str(node)))),
        Rule::number => Ok(Ast::Number(node.as_str().to_string())),
        Rule::boolean => Ok(Ast::Bool(node.as_str() == "true")),
        Rule::null => Ok(Ast::Null),
        other => Err(format!("unexpected {other:?}")),
    }
}

fn first(node: Pair<Rule>) -> Result<Ast, String> {
    build(node.into_inner().next().ok_or("empty group")?)
}

fn first_str<'i>(node: Pair<'i, Rule>) -> &'i str {
    node.into_inner().next().map_or("", |p| p.as_str())
}

fn fold(node: Pair<Rule>, op: &'static str) -> Result<Ast, String> {
    let mut parts = node.into_inner();
    let mut acc = build(parts.next().ok_or("missing operand")?)?;
    for rhs in parts {
        acc = Ast::Binary(op, Box::new(acc), Box::new(build(rhs)?));
    }
    Ok(acc)
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Names bound by enclosing directives, innermost last.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    frames: Vec<ScopeFrame>,
}

#[derive(Debug, Clone, Default)]
struct ScopeFrame {
    names: Vec<String>,
    isolated: bool,
}

impl Scope {
    pub fn push<I: IntoIterator<Item = String>>(&mut self, names: I) {
        self.frames.push(ScopeFrame {
            names: names.into_iter().collect(),
            isolated: false,
        });
    }

    /// A frame that hides every outer name, matching a `with` block.
    pub fn push_isolated<I: IntoIterator<Item = String>>(&mut self, names: I) {
        self.frames.push(ScopeFrame {
            names: names.into_iter().collect(),
            isolated: true,
        });
    }

    pub fn pop(&mut self) {
        self.frames.pop();
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn truncate(&mut self, depth: usize) {
        self.frames.truncate(depth);
    }

    pub fn is_local(&self, name: &str) -> bool {
        for frame in self.frames.iter().rev() {
            if frame.names.iter().any(|n| n == name) {
                return true;
            }
            if frame.isolated {
                return false;
            }
        }
        false
    }
}

/// Compiles template expressions, allowing calls only to the namespaced
/// helpers it was built with.
#[derive(Debug, Clone, Default)]
pub struct ExprCompiler {
    allowed: BTreeSet<String>,
}

impl ExprCompiler {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, name: &str) -> bool {
        self.allowed.contains(name)
    }

    pub fn compile(&self, source: &str, scope: &Scope) -> Result<String, ExprError> {
        self.emit(&parse(source)?, scope)
    }

    /// Compile a bare property path, returning its segments too.
    pub fn compile_path(&self, source: &str, scope: &Scope) -> Result<(Vec<String>, String), ExprError> {
        match parse(source)? {
            Ast::Path(segments) => {
                let code = path_code(&segments, scope);
                Ok((segments, code))
            }
            _ => Err(ExprError::NotAPath(source.trim().to_string())),
        }
    }

    pub fn emit(&self, ast: &Ast, scope: &Scope) -> Result<String, ExprError> {
        Ok(match ast {
            Ast::Path(segments) => path_code(segments, scope),
            Ast::Str(s) => string_lit(s),
            Ast::Number(n) => n.clone(),
            Ast::Bool(b) => b.to_string(),
            Ast::Null => "null".into(),
            Ast::Not(inner) => format!("!{}", self.emit(inner, scope)?),
            Ast::Binary(op, lhs, rhs) => {
                format!("({} {op} {})", self.emit(lhs, scope)?, self.emit(rhs, scope)?)
            }
            Ast::Ternary(cond, a, b) => format!(
                "({} ? {} : {})",
                self.emit(cond, scope)?,
                self.emit(a, scope)?,
                self.emit(b, scope)?
            ),
            Ast::Concat(parts) => format!("concat({})", self.emit_all(parts, scope)?),
            Ast::Call(name, args) => {
                if !name.contains('.') {
                    return Err(if CORE_HELPERS.contains(&name.as_str()) {
                        ExprError::CoreHelper(name.clone())
                    } else {
                        ExprError::Disallowed(name.clone())
                    });
                }
                if !self.allows(name) {
                    return Err(ExprError::Disallowed(name.clone()));
                }
                format!("{name}({})", self.emit_all(args, scope)?)
            }
        })
    }

    fn emit_all(&self, asts: &[Ast], scope: &Scope) -> Result<String, ExprError> {
        Ok(asts
            .iter()
            .map(|a| self.emit(a, scope))
            .collect::<Result<Vec<_>, _>>()?
            .join(", "))
    }
}

pub fn path_code(segments: &[String], scope: &Scope) -> String {
    let mut segments = segments.iter();
    let Some(head) = segments.next() else {
        return "$".into();
    };
    let mut code = if scope.is_local(head) {
        format!("${head}")
    } else {
        format!("lookup($, {})", string_lit(head))
    };
    for segment in segments {
        code = format!("lookup({code}, {})", string_lit(segment));
    }
    code
}

/// True for names usable as loop variables and fragment parameters.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiler() -> ExprCompiler {
        ExprCompiler::new(["str.upper", "list.count"])
    }

    #[test]
    fn paths_resolve_against_scope() {
        let mut scope = Scope::default();
        let c = compiler();
        assert_eq!(
            c.compile("user.profile.bio", &scope).unwrap(),
            r#"lookup(lookup(lookup($, "user"), "profile"), "bio")"#
        );
        scope.push(["item".to_string()]);
        assert_eq!(c.compile("item.name", &scope).unwrap(), r#"lookup($item, "name")"#);
        scope.push_isolated(["title".to_string()]);
        assert_eq!(c.compile("item", &scope).unwrap(), r#"lookup($, "item")"#);
        assert_eq!(c.compile("title", &scope).unwrap(), "$title");
    }

    #[test]
    fn operators_and_literals() {
        let scope = Scope::default();
        let c = compiler();
        assert_eq!(
            c.compile("!a && b == 'x' || c != null", &scope).unwrap(),
            r#"((!lookup($, "a") && (lookup($, "b") == "x")) || (lookup($, "c") != null))"#
        );
        assert_eq!(
            c.compile(r#"ok ? "yes" : -1.5"#, &scope).unwrap(),
            r#"(lookup($, "ok") ? "yes" : -1.5)"#
        );
        assert_eq!(
            c.compile("'Hi, ' ~ name ~ '!'", &scope).unwrap(),
            r#"concat("Hi, ", lookup($, "name"), "!")"#
        );
        assert_eq!(c.compile(r"'it\'s'", &scope).unwrap(), r#""it's""#);
        assert_eq!(c.compile("!(a)", &scope).unwrap(), r#"!lookup($, "a")"#);
    }

    #[test]
    fn calls_are_checked_against_the_allow_list() {
        let scope = Scope::default();
        let c = compiler();
        assert_eq!(
            c.compile("str.upper(user.name)", &scope).unwrap(),
            r#"str.upper(lookup(lookup($, "user"), "name"))"#
        );
        assert_eq!(
            c.compile("sys.exec('rm')", &scope),
            Err(ExprError::Disallowed("sys.exec".into()))
        );
        assert_eq!(
            c.compile("escape(x)", &scope),
            Err(ExprError::CoreHelper("escape".into()))
        );
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        let scope = Scope::default();
        let c = compiler();
        assert!(matches!(c.compile("user.", &scope), Err(ExprError::Syntax { .. })));
        assert!(matches!(c.compile("a ==", &scope), Err(ExprError::Syntax { .. })));
        assert!(matches!(c.compile("'open", &scope), Err(ExprError::Syntax { .. })));
        assert_eq!(c.compile("  ", &scope), Err(ExprError::Empty));
        assert!(matches!(
            c.compile_path("a.b == 1", &scope),
            Err(ExprError::NotAPath(_))
        ));
    }

    #[test]
    fn path_segments_are_returned() {
        let (segments, code) = compiler()
            .compile_path("user.tags.0", &Scope::default())
            .unwrap();
        assert_eq!(segments, ["user", "tags", "0"]);
        assert_eq!(code, r#"lookup(lookup(lookup($, "user"), "tags"), "0")"#);
    }
}
