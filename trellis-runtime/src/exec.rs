use std::sync::Arc;

use serde_json::Value;

use crate::error::RenderError;
use crate::helpers::HelperRegistry;
use crate::program::{BinaryOp, Expr, Program, Stmt};
use crate::value::{entries, equals, stringify, truthy};

const MAX_EMBED_DEPTH: usize = 64;

/// A fragment the host compiled on demand for an `embed` statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub params: Vec<String>,
    pub program: Program,
}

/// Resolves `embed` statements at render time. Fragments the compiler could
/// not inline end up here.
pub trait FragmentHost {
    fn fragment(&self, template: &str, fragment: &str) -> Result<Option<Arc<Fragment>>, RenderError>;
}

/// Host for programs that never embed anything.
pub struct NoFragments;

impl FragmentHost for NoFragments {
    fn fragment(&self, _template: &str, _fragment: &str) -> Result<Option<Arc<Fragment>>, RenderError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Runtime {
    helpers: HelperRegistry,
}

impl Runtime {
    pub fn new(helpers: HelperRegistry) -> Self {
        Self { helpers }
    }

    pub fn helpers(&self) -> &HelperRegistry {
        &self.helpers
    }

    /// Parse a program and make sure every helper it calls exists here.
    pub fn load(&self, source: &str) -> Result<Program, RenderError> {
        let program = Program::parse(source)?;
        for name in program.called_helpers() {
            if !self.helpers.contains(name) {
                return Err(RenderError::UnknownHelper(name.to_string()));
            }
        }
        Ok(program)
    }

    pub fn execute(
        &self,
        program: &Program,
        data: &Value,
        host: &dyn FragmentHost,
    ) -> Result<String, RenderError> {
        let mut exec = Executor {
            runtime: self,
            host,
            root: data,
            frames: vec![Frame::isolated()],
            out: String::new(),
            embeds: Vec::new(),
        };
        exec.run(&program.body)?;
        Ok(exec.out)
    }
}

#[derive(Default)]
struct Frame {
    vars: Vec<(String, Value)>,
    // an isolated frame hides everything below it
    isolated: bool,
}

impl Frame {
    fn isolated() -> Self {
        Frame {
            vars: Vec::new(),
            isolated: true,
        }
    }

    fn set(&mut self, name: &str, value: Value) {
        match self.vars.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.vars.push((name.to_string(), value)),
        }
    }
}

struct Executor<'a> {
    runtime: &'a Runtime,
    host: &'a dyn FragmentHost,
    root: &'a Value,
    frames: Vec<Frame>,
    out: String,
    embeds: Vec<String>,
}

impl Executor<'_> {
    fn run(&mut self, body: &[Stmt]) -> Result<(), RenderError> {
        for stmt in body {
            self.stmt(stmt)?;
        }
        Ok(())
    }

    fn scoped(&mut self, frame: Frame, body: &[Stmt]) -> Result<(), RenderError> {
        self.frames.push(frame);
        let result = self.run(body);
        self.frames.pop();
        result
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), RenderError> {
        match stmt {
            Stmt::Echo(text) => self.out.push_str(text),
            Stmt::Print(expr) => {
                let value = self.eval(expr)?;
                self.out.push_str(&stringify(&value));
            }
            Stmt::If {
                branches,
                otherwise,
            } => {
                for (cond, body) in branches {
                    if truthy(&self.eval(cond)?) {
                        return self.scoped(Frame::default(), body);
                    }
                }
                if let Some(body) = otherwise {
                    self.scoped(Frame::default(), body)?;
                }
            }
            Stmt::For {
                key,
                value,
                source,
                body,
            } => {
                let collection = self.eval(source)?;
                let items = entries(&collection).map_err(RenderError::NotIterable)?;
                for (k, v) in items {
                    let mut frame = Frame::default();
                    if let Some(key) = key {
                        frame.set(key, k);
                    }
                    frame.set(value, v);
                    self.scoped(frame, body)?;
                }
            }
            Stmt::Let(name, expr) => {
                let value = self.eval(expr)?;
                if let Some(frame) = self.frames.last_mut() {
                    frame.set(name, value);
                }
            }
            Stmt::With(bindings, body) => {
                let frame = self.bind(bindings)?;
                self.scoped(frame, body)?;
            }
            Stmt::Block(body) => self.scoped(Frame::default(), body)?,
            Stmt::Embed {
                template,
                fragment,
                args,
            } => self.embed(template, fragment, args)?,
        }
        Ok(())
    }

    // Arguments are all evaluated in the caller's scope before any is bound.
    fn bind(&mut self, bindings: &[(String, Expr)]) -> Result<Frame, RenderError> {
        let mut frame = Frame::isolated();
        for (name, expr) in bindings {
            let value = self.eval(expr)?;
            frame.set(name, value);
        }
        Ok(frame)
    }

    fn embed(&mut self, template: &str, fragment: &str, args: &[(String, Expr)]) -> Result<(), RenderError> {
        let label = format!("{template}::{fragment}");
        if self.embeds.len() >= MAX_EMBED_DEPTH {
            return Err(RenderError::EmbedDepth(label));
        }
        let found = self.host.fragment(template, fragment)?.ok_or_else(|| {
            RenderError::FragmentNotFound {
                template: template.to_string(),
                fragment: fragment.to_string(),
            }
        })?;
        for name in found.program.called_helpers() {
            if !self.runtime.helpers.contains(name) {
                return Err(RenderError::UnknownHelper(name.to_string()));
            }
        }

        let mut frame = self.bind(args)?;
        // positional arguments arrive as `_0`, `_1`, ... and take the
        // fragment's declared parameter names
        for (name, _) in frame.vars.iter_mut() {
            let index = name.strip_prefix('_').and_then(|i| i.parse::<usize>().ok());
            if let Some(param) = index.and_then(|i| found.params.get(i)) {
                *name = param.clone();
            }
        }
        for param in &found.params {
            if !frame.vars.iter().any(|(n, _)| n == param) {
                frame.set(param, Value::Null);
            }
        }

        tracing::trace!(fragment = %label, "embedding fragment");
        self.embeds.push(label);
        let result = self.scoped(frame, &found.program.body);
        self.embeds.pop();
        result
    }

    fn var(&self, name: &str) -> Result<Value, RenderError> {
        for frame in self.frames.iter().rev() {
            if let Some((_, v)) = frame.vars.iter().find(|(n, _)| n == name) {
                return Ok(v.clone());
            }
            if frame.isolated {
                break;
            }
        }
        Err(RenderError::UndefinedVariable(name.to_string()))
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, RenderError> {
        Ok(match expr {
            Expr::Root => self.root.clone(),
            Expr::Var(name) => self.var(name)?,
            Expr::Literal(v) => v.clone(),
            Expr::Not(inner) => Value::Bool(!truthy(&self.eval(inner)?)),
            Expr::Binary(op, lhs, rhs) => {
                let left = self.eval(lhs)?;
                match op {
                    BinaryOp::And => Value::Bool(truthy(&left) && truthy(&self.eval(rhs)?)),
                    BinaryOp::Or => Value::Bool(truthy(&left) || truthy(&self.eval(rhs)?)),
                    BinaryOp::Eq => Value::Bool(equals(&left, &self.eval(rhs)?)),
                    BinaryOp::Ne => Value::Bool(!equals(&left, &self.eval(rhs)?)),
                }
            }
            Expr::Ternary(cond, a, b) => {
                if truthy(&self.eval(cond)?) {
                    self.eval(a)?
                } else {
                    self.eval(b)?
                }
            }
            Expr::Call(name, args) => {
                // lookup on the root is hot; skip cloning the whole tree
                if name == "lookup" {
                    if let [Expr::Root, key] = args.as_slice() {
                        let key = self.eval(key)?;
                        return Ok(crate::value::lookup(self.root, &key));
                    }
                }
                let values = args
                    .iter()
                    .map(|a| self.eval(a))
                    .collect::<Result<Vec<_>, _>>()?;
                self.runtime.helpers.call(name, &values)?
            }
        })
    }
}
