//! Compiled template programs.
//!
//! A program is the text the compiler hands back: a two-line prelude
//! followed by statements. Parsing it here produces the tree the
//! executor walks.

use pest::Parser;
use pest::iterators::Pair;
use serde_json::Value;

use crate::error::RenderError;
use crate::prelude::{CORE_HELPERS, RUNTIME_VERSION};

#[derive(pest_derive::Parser)]
#[grammar = "program.pest"]
struct ProgramParser;

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub version: u32,
    pub imports: Vec<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Echo(String),
    Print(Expr),
    If {
        branches: Vec<(Expr, Vec<Stmt>)>,
        otherwise: Option<Vec<Stmt>>,
    },
    For {
        key: Option<String>,
        value: String,
        source: Expr,
        body: Vec<Stmt>,
    },
    Let(String, Expr),
    With(Vec<(String, Expr)>, Vec<Stmt>),
    Block(Vec<Stmt>),
    Embed {
        template: String,
        fragment: String,
        args: Vec<(String, Expr)>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Root,
    Var(String),
    Literal(Value),
    Not(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

impl Program {
    /// Parse compiled program text. Checks the prelude version and that every
    /// core helper the body calls was imported.
    pub fn parse(source: &str) -> Result<Program, RenderError> {
        let mut pairs = ProgramParser::parse(Rule::program, source)
            .map_err(|e| RenderError::Syntax(e.to_string()))?;
        let root = pairs
            .next()
            .ok_or_else(|| RenderError::Syntax("empty program".into()))?;

        let mut version = 0;
        let mut imports = Vec::new();
        let mut body = Vec::new();

        for node in root.into_inner() {
            match node.as_rule() {
                Rule::prelude => {
                    for part in node.into_inner() {
                        match part.as_rule() {
                            Rule::header => {
                                let digits = part.into_inner().as_str();
                                version = digits.parse().map_err(|_| {
                                    RenderError::Syntax(format!("bad runtime version `{digits}`"))
                                })?;
                            }
                            Rule::imports => {
                                imports = part.into_inner().map(|p| p.as_str().to_string()).collect();
                            }
                            _ => {}
                        }
                    }
                }
                Rule::EOI => {}
                _ => body.push(build_stmt(node)?),
            }
        }

        if version != RUNTIME_VERSION {
            return Err(RenderError::VersionMismatch {
                expected: RUNTIME_VERSION,
                found: version,
            });
        }
        for name in &imports {
            if !CORE_HELPERS.contains(&name.as_str()) {
                return Err(RenderError::UnknownHelper(name.clone()));
            }
        }

        let program = Program {
            version,
            imports,
            body,
        };
        program.check_imports()?;
        Ok(program)
    }

    /// Every helper name the program calls, in first-use order.
    pub fn called_helpers(&self) -> Vec<&str> {
        let mut out = Vec::new();
        for stmt in &self.body {
            collect_stmt_calls(stmt, &mut out);
        }
        out
    }

    fn check_imports(&self) -> Result<(), RenderError> {
        for name in self.called_helpers() {
            if !name.contains('.') && !self.imports.iter().any(|i| i == name) {
                return Err(RenderError::NotImported(name.to_string()));
            }
        }
        Ok(())
    }
}

fn collect_stmt_calls<'a>(stmt: &'a Stmt, out: &mut Vec<&'a str>) {
    match stmt {
        Stmt::Echo(_) => {}
        Stmt::Print(e) | Stmt::Let(_, e) => collect_expr_calls(e, out),
        Stmt::If {
            branches,
            otherwise,
        } => {
            for (cond, body) in branches {
                collect_expr_calls(cond, out);
                body.iter().for_each(|s| collect_stmt_calls(s, out));
            }
            if let Some(body) = otherwise {
                body.iter().for_each(|s| collect_stmt_calls(s, out));
            }
        }
        Stmt::For { source, body, .. } => {
            collect_expr_calls(source, out);
            body.iter().for_each(|s| collect_stmt_calls(s, out));
        }
        Stmt::With(bindings, body) => {
            bindings.iter().for_each(|(_, e)| collect_expr_calls(e, out));
            body.iter().for_each(|s| collect_stmt_calls(s, out));
        }
        Stmt::Block(body) => body.iter().for_each(|s| collect_stmt_calls(s, out)),
        Stmt::Embed { args, .. } => args.iter().for_each(|(_, e)| collect_expr_calls(e, out)),
    }
}

fn collect_expr_calls<'a>(expr: &'a Expr, out: &mut Vec<&'a str>) {
    match expr {
        Expr::Root | Expr::Var(_) | Expr::Literal(_) => {}
        Expr::Not(inner) => collect_expr_calls(inner, out),
        Expr::Binary(_, l, r) => {
            collect_expr_calls(l, out);
            collect_expr_calls(r, out);
        }
        Expr::Ternary(c, a, b) => {
            collect_expr_calls(c, out);
            collect_expr_calls(a, out);
            collect_expr_calls(b, out);
        }
        Expr::Call(name, args) => {
            if !out.contains(&name.as_str()) {
                out.push(name);
            }
            args.iter().for_each(|a| collect_expr_calls(a, out));
        }
    }
}

fn build_stmt(node: Pair<Rule>) -> Result<Stmt, RenderError> {
    let rule = node.as_rule();
    let mut inner = node.into_inner();
    let stmt = match rule {
        Rule::echo_stmt => Stmt::Echo(unquote(next(&mut inner)?)?),
        Rule::print_stmt => Stmt::Print(build_expr(next(&mut inner)?)?),
        Rule::block => Stmt::Block(build_block(inner)?),
        Rule::let_stmt => {
            let name = var_name(next(&mut inner)?);
            Stmt::Let(name, build_expr(next(&mut inner)?)?)
        }
        Rule::with_stmt => {
            let bindings = build_bindings(next(&mut inner)?)?;
            let body = build_block(next(&mut inner)?.into_inner())?;
            Stmt::With(bindings, body)
        }
        Rule::embed_stmt => {
            let template = unquote(next(&mut inner)?)?;
            let fragment = unquote(next(&mut inner)?)?;
            let args = build_bindings(next(&mut inner)?)?;
            Stmt::Embed {
                template,
                fragment,
                args,
            }
        }
        Rule::for_stmt => {
            // for ($v in e) or for ($k, $v in e)
            let parts: Vec<Pair<Rule>> = inner.collect();
            let (key, value, rest) = match parts.as_slice() {
                [k, v, rest @ ..] if v.as_rule() == Rule::var => {
                    (Some(var_name(k.clone())), var_name(v.clone()), rest)
                }
                [v, rest @ ..] => (None, var_name(v.clone()), rest),
                [] => return Err(RenderError::Syntax("empty for statement".into())),
            };
            let [source, body] = rest else {
                return Err(RenderError::Syntax("malformed for statement".into()));
            };
            Stmt::For {
                key,
                value,
                source: build_expr(source.clone())?,
                body: build_block(body.clone().into_inner())?,
            }
        }
        Rule::if_stmt => {
            let mut branches = Vec::new();
            let mut otherwise = None;
            let cond = build_expr(next(&mut inner)?)?;
            let body = build_block(next(&mut inner)?.into_inner())?;
            branches.push((cond, body));
            if let Some(tail) = inner.next() {
                match build_stmt(tail)? {
                    Stmt::If {
                        branches: more,
                        otherwise: rest,
                    } => {
                        branches.extend(more);
                        otherwise = rest;
                    }
                    Stmt::Block(body) => otherwise = Some(body),
                    other => {
                        return Err(RenderError::Syntax(format!(
                            "unexpected else branch: {other:?}"
                        )));
                    }
                }
            }
            Stmt::If {
                branches,
                otherwise,
            }
        }
        other => return Err(RenderError::Syntax(format!("unexpected {other:?}"))),
    };
    Ok(stmt)
}

fn build_block(pairs: pest::iterators::Pairs<Rule>) -> Result<Vec<Stmt>, RenderError> {
    pairs.map(build_stmt).collect()
}

fn build_bindings(node: Pair<Rule>) -> Result<Vec<(String, Expr)>, RenderError> {
    node.into_inner()
        .map(|binding| {
            let mut parts = binding.into_inner();
            let name = var_name(next(&mut parts)?);
            Ok((name, build_expr(next(&mut parts)?)?))
        })
        .collect()
}

fn build_expr(node: Pair<Rule>) -> Result<Expr, RenderError> {
    match node.as_rule() {
        Rule::expr => build_expr(next(&mut node.into_inner())?),
        Rule::ternary => {
            let mut parts = node.into_inner();
            let cond = build_expr(next(&mut parts)?)?;
            match (parts.next(), parts.next()) {
                (Some(a), Some(b)) => Ok(Expr::Ternary(
                    Box::new(cond),
                    Box::new(build_expr(a)?),
                    Box::new(build_expr(b)?),
                )),
                _ => Ok(cond),
            }
        }
        Rule::or_expr => fold_binary(node, |_| BinaryOp::Or),
        Rule::and_expr => fold_binary(node, |_| BinaryOp::And),
        Rule::eq_expr => fold_binary(node, |op| {
            if op == "==" { BinaryOp::Eq } else { BinaryOp::Ne }
        }),
        Rule::unary => {
            let mut nots = 0;
            let mut operand = None;
            for part in node.into_inner() {
                if part.as_rule() == Rule::not {
                    nots += 1;
                } else {
                    operand = Some(build_expr(part)?);
                }
            }
            let mut expr =
                operand.ok_or_else(|| RenderError::Syntax("missing operand".into()))?;
            for _ in 0..nots {
                expr = Expr::Not(Box::new(expr));
            }
            Ok(expr)
        }
        Rule::call => {
            let mut parts = node.into_inner();
            let name = next(&mut parts)?.as_str().to_string();
            let args = parts.map(build_expr).collect::<Result<_, _>>()?;
            Ok(Expr::Call(name, args))
        }
        Rule::var => Ok(Expr::Var(var_name(node))),
        Rule::root => Ok(Expr::Root),
        Rule::string => Ok(Expr::Literal(Value::String(unquote(node)?))),
        Rule::boolean => Ok(Expr::Literal(Value::Bool(node.as_str() == "true"))),
        Rule::null => Ok(Expr::Literal(Value::Null)),
        Rule::number => {
            let text = node.as_str();
            let value = if let Ok(i) = text.parse::<i64>() {
                Value::from(i)
            } else {
                text.parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(|| RenderError::Syntax(format!("bad number `{text}`")))?
            };
            Ok(Expr::Literal(value))
        }
        other => Err(RenderError::Syntax(format!("unexpected {other:?} in expression"))),
    }
}

fn fold_binary(node: Pair<Rule>, op_of: impl Fn(&str) -> BinaryOp) -> Result<Expr, RenderError> {
    let mut parts = node.into_inner();
    let mut acc = build_expr(next(&mut parts)?)?;
    while let Some(part) = parts.next() {
        // eq_expr interleaves explicit operator pairs; and/or do not
        let (op, rhs) = if part.as_rule() == Rule::eq_op {
            (op_of(part.as_str()), next(&mut parts)?)
        } else {
            (op_of(""), part)
        };
        acc = Expr::Binary(op, Box::new(acc), Box::new(build_expr(rhs)?));
    }
    Ok(acc)
}

fn next<'a>(pairs: &mut pest::iterators::Pairs<'a, Rule>) -> Result<Pair<'a, Rule>, RenderError> {
    pairs
        .next()
        .ok_or_else(|| RenderError::Syntax("truncated program".into()))
}

fn var_name(node: Pair<Rule>) -> String {
    node.as_str().trim_start_matches('$').to_string()
}

fn unquote(node: Pair<Rule>) -> Result<String, RenderError> {
    let raw = node.into_inner().as_str();
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('u') => {
                let hex: String = chars
                    .by_ref()
                    .skip_while(|c| *c == '{')
                    .take_while(|c| *c != '}')
                    .collect();
                let decoded = u32::from_str_radix(&hex, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| RenderError::Syntax(format!("bad escape \\u{{{hex}}}")))?;
                out.push(decoded);
            }
            other => {
                return Err(RenderError::Syntax(format!("bad escape {other:?}")));
            }
        }
    }
    Ok(out)
}

/// Quote `s` as a program string literal. The inverse of the parser's
/// unescaping; the compiler uses it for every literal it emits.
pub fn string_lit(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    out.push('"');
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{{{:x}}}", c as u32)),
            _ => out.push(ch),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude::PRELUDE;

    fn parse_body(body: &str) -> Program {
        Program::parse(&format!("{PRELUDE}{body}")).unwrap()
    }

    #[test]
    fn parses_echo_and_print() {
        let p = parse_body("echo \"<p>\";\nprint escape(lookup($, \"name\"));\n");
        assert_eq!(p.version, RUNTIME_VERSION);
        assert_eq!(p.body.len(), 2);
        assert_eq!(p.body[0], Stmt::Echo("<p>".into()));
        match &p.body[1] {
            Stmt::Print(Expr::Call(name, args)) => {
                assert_eq!(name, "escape");
                assert!(matches!(&args[0], Expr::Call(n, _) if n == "lookup"));
            }
            other => panic!("expected print, got {other:?}"),
        }
    }

    #[test]
    fn else_if_chain_flattens() {
        let p = parse_body("if ($a) { echo \"a\"; } else if ($b) { echo \"b\"; } else { echo \"c\"; }");
        match &p.body[0] {
            Stmt::If {
                branches,
                otherwise,
            } => {
                assert_eq!(branches.len(), 2);
                assert_eq!(otherwise.as_ref().map(Vec::len), Some(1));
            }
            other => panic!("expected if, got {other:?}"),
        }
    }

    #[test]
    fn for_with_key_and_value() {
        let p = parse_body("for ($k, $v in $) { print $k; }");
        match &p.body[0] {
            Stmt::For { key, value, .. } => {
                assert_eq!(key.as_deref(), Some("k"));
                assert_eq!(value, "v");
            }
            other => panic!("expected for, got {other:?}"),
        }
    }

    #[test]
    fn string_lit_round_trips_through_parser() {
        let tricky = "say \"hi\"\n\\ \u{1}";
        let p = parse_body(&format!("echo {};", string_lit(tricky)));
        assert_eq!(p.body[0], Stmt::Echo(tricky.to_string()));
    }

    #[test]
    fn not_equal_is_an_operator_not_a_negation() {
        let p = parse_body("print $a != !$b;");
        match &p.body[0] {
            Stmt::Print(Expr::Binary(BinaryOp::Ne, _, rhs)) => {
                assert!(matches!(**rhs, Expr::Not(_)));
            }
            other => panic!("expected != binary, got {other:?}"),
        }
    }

    #[test]
    fn rejects_wrong_version() {
        let err = Program::parse("#!trellis 99\nuse lookup;\necho \"x\";").unwrap_err();
        assert!(matches!(err, RenderError::VersionMismatch { found: 99, .. }));
    }

    #[test]
    fn rejects_core_helper_missing_from_prelude() {
        let err = Program::parse("#!trellis 1\nuse lookup;\nprint escape($);").unwrap_err();
        assert!(matches!(err, RenderError::NotImported(ref n) if n == "escape"));
    }
}
