//! Render-time execution: the variable context handed in by the caller
//! and the interpreter that runs compiled routines against it.

use std::collections::HashMap;

use crate::compiler::{ExprIr, Op, Program, Routine, Target};
use crate::error::Error;
use crate::value::{self, Undefined, Value};
use crate::Environment;

/// The variables a template renders against. `vars` is the layer the
/// template itself could write to; `parent` holds the caller-provided
/// bindings. Lookups check `vars` first.
#[derive(Debug, Default)]
pub struct Context {
    vars: HashMap<String, Value>,
    parent: HashMap<String, Value>,
    pub name: Option<String>,
}

impl Context {
    pub fn new(parent: HashMap<String, Value>, name: Option<String>) -> Self {
        Context {
            vars: HashMap::new(),
            parent,
            name,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key) || self.parent.contains_key(key)
    }

    /// The value bound to `key`, or `None` when the name is missing.
    /// This is what register loads use; the undefined sentinel is only
    /// materialized at the point of use.
    pub fn resolve_or_missing(&self, key: &str) -> Option<Value> {
        self.vars
            .get(key)
            .or_else(|| self.parent.get(key))
            .cloned()
    }

    /// Like `resolve_or_missing` but the miss becomes a named undefined
    /// value instead of `None`.
    pub fn resolve(&self, key: &str) -> Value {
        self.resolve_or_missing(key)
            .unwrap_or_else(|| Value::undefined_named(key))
    }
}

pub(crate) struct Vm<'a> {
    program: &'a Program,
    env: &'a Environment,
    ctx: &'a Context,
}

impl<'a> Vm<'a> {
    pub(crate) fn new(program: &'a Program, env: &'a Environment, ctx: &'a Context) -> Self {
        Vm { program, env, ctx }
    }

    pub(crate) fn render(&self) -> Result<String, Error> {
        let mut out = String::new();
        self.run_routine(&self.program.root, &mut out)?;
        Ok(out)
    }

    pub(crate) fn render_block(&self, name: &str) -> Result<String, Error> {
        let routine = self
            .program
            .blocks
            .get(name)
            .ok_or_else(|| Error::Runtime(format!("template has no block '{}'", name)))?;
        let mut out = String::new();
        self.run_routine(routine, &mut out)?;
        Ok(out)
    }

    fn run_routine(&self, routine: &Routine, out: &mut String) -> Result<(), Error> {
        let mut regs: Vec<Option<Value>> = vec![None; routine.registers];
        self.run_ops(&routine.ops, &mut regs, out)
    }

    fn run_ops(
        &self,
        ops: &[Op],
        regs: &mut Vec<Option<Value>>,
        out: &mut String,
    ) -> Result<(), Error> {
        for op in ops {
            match op {
                Op::Resolve { slot, name } => {
                    regs[*slot] = self.ctx.resolve_or_missing(name);
                }
                Op::Unset { slots } => {
                    for slot in slots {
                        regs[*slot] = None;
                    }
                }
                Op::EmitText(text) => out.push_str(text),
                Op::EmitExpr { expr, escape } => {
                    let text = self.eval(expr, regs)?.to_output_string()?;
                    if *escape {
                        out.push_str(&value::escape_html(&text));
                    } else {
                        out.push_str(&text);
                    }
                }
                Op::Bind { target, value } => {
                    let value = self.eval(value, regs)?;
                    bind(target, value, regs)?;
                }
                Op::If { arms, else_ops } => {
                    let mut taken = false;
                    for (test, arm_ops) in arms {
                        if self.eval(test, regs)?.is_truthy() {
                            self.run_ops(arm_ops, regs, out)?;
                            taken = true;
                            break;
                        }
                    }
                    if !taken {
                        self.run_ops(else_ops, regs, out)?;
                    }
                }
                Op::For {
                    target,
                    iter,
                    filter_enter,
                    filter,
                    body,
                    else_ops,
                    unset,
                } => {
                    let items = iterate(&self.eval(iter, regs)?)?;
                    self.run_ops(filter_enter, regs, out)?;
                    let mut looped = false;
                    for item in items {
                        bind(target, item, regs)?;
                        if let Some(test) = filter {
                            if !self.eval(test, regs)?.is_truthy() {
                                continue;
                            }
                        }
                        self.run_ops(body, regs, out)?;
                        looped = true;
                    }
                    for slot in unset {
                        regs[*slot] = None;
                    }
                    if !looped {
                        self.run_ops(else_ops, regs, out)?;
                    }
                }
                Op::RenderBlock { name } => {
                    let routine = self.program.blocks.get(name).ok_or_else(|| {
                        Error::Runtime(format!("template has no block '{}'", name))
                    })?;
                    self.run_routine(routine, out)?;
                }
            }
        }
        Ok(())
    }

    fn eval(&self, expr: &ExprIr, regs: &[Option<Value>]) -> Result<Value, Error> {
        match expr {
            ExprIr::Const(value) => Ok(value.clone()),
            ExprIr::Param { slot } => Ok(regs[*slot]
                .clone()
                .unwrap_or_else(|| Value::Undefined(Undefined::default()))),
            ExprIr::Load { slot, name } => Ok(regs[*slot]
                .clone()
                .unwrap_or_else(|| Value::undefined_named(name))),
            ExprIr::Tuple(items) | ExprIr::List(items) => {
                let values: Result<Vec<Value>, Error> =
                    items.iter().map(|item| self.eval(item, regs)).collect();
                Ok(Value::List(values?))
            }
            ExprIr::Dict(pairs) => {
                let mut out = Vec::with_capacity(pairs.len());
                for (key, value) in pairs {
                    out.push((self.eval(key, regs)?, self.eval(value, regs)?));
                }
                Ok(Value::Map(out))
            }
            ExprIr::BinOp { op, left, right } => {
                use crate::ast::BinOpKind;
                // and/or return the deciding operand, not a bool
                match op {
                    BinOpKind::And => {
                        let left = self.eval(left, regs)?;
                        if !left.is_truthy() {
                            return Ok(left);
                        }
                        self.eval(right, regs)
                    }
                    BinOpKind::Or => {
                        let left = self.eval(left, regs)?;
                        if left.is_truthy() {
                            return Ok(left);
                        }
                        self.eval(right, regs)
                    }
                    _ => {
                        let left = self.eval(left, regs)?;
                        let right = self.eval(right, regs)?;
                        value::binop(*op, &left, &right)
                    }
                }
            }
            ExprIr::UnaryOp { op, node } => {
                use crate::ast::UnaryOpKind;
                let val = self.eval(node, regs)?;
                match op {
                    UnaryOpKind::Not => Ok(Value::Bool(!val.is_truthy())),
                    UnaryOpKind::Neg => value::neg(&val),
                    UnaryOpKind::Pos => value::pos(&val),
                }
            }
            ExprIr::Compare { expr, operands } => {
                let mut left = self.eval(expr, regs)?;
                for (op, operand) in operands {
                    let right = self.eval(operand, regs)?;
                    if !value::compare(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            ExprIr::Call {
                node,
                args,
                kwargs,
                dyn_args,
                dyn_kwargs,
            } => {
                let callee = self.eval(node, regs)?;
                // arguments are evaluated even though the call itself
                // cannot succeed, so their errors surface first
                for arg in args {
                    self.eval(arg, regs)?;
                }
                for (_, value) in kwargs {
                    self.eval(value, regs)?;
                }
                if let Some(expr) = dyn_args {
                    self.eval(expr, regs)?;
                }
                if let Some(expr) = dyn_kwargs {
                    self.eval(expr, regs)?;
                }
                match callee {
                    Value::Undefined(u) => Err(u.error()),
                    other => Err(Error::Runtime(format!(
                        "value of type {} is not callable",
                        other.type_name()
                    ))),
                }
            }
            ExprIr::Getattr { node, attr } => {
                let base = self.eval(node, regs)?;
                if let Value::Undefined(u) = &base {
                    return Err(u.error());
                }
                Ok(self
                    .env
                    .attr(&base, attr)
                    .unwrap_or_else(|| Value::undefined_access(&base, attr.clone())))
            }
            ExprIr::Getitem { node, arg } => {
                let base = self.eval(node, regs)?;
                if let Value::Undefined(u) = &base {
                    return Err(u.error());
                }
                let index = self.eval(arg, regs)?;
                if let Value::Undefined(u) = &index {
                    return Err(u.error());
                }
                Ok(self
                    .env
                    .item(&base, &index)
                    .unwrap_or_else(|| Value::undefined_access(&base, index.to_string())))
            }
            ExprIr::Slice {
                node,
                start,
                stop,
                step,
            } => {
                let base = self.eval(node, regs)?;
                let start = self.eval_opt(start.as_deref(), regs)?;
                let stop = self.eval_opt(stop.as_deref(), regs)?;
                let step = self.eval_opt(step.as_deref(), regs)?;
                value::slice(&base, start.as_ref(), stop.as_ref(), step.as_ref())
            }
        }
    }

    fn eval_opt(
        &self,
        expr: Option<&ExprIr>,
        regs: &[Option<Value>],
    ) -> Result<Option<Value>, Error> {
        match expr {
            Some(expr) => self.eval(expr, regs).map(Some),
            None => Ok(None),
        }
    }
}

fn bind(target: &Target, value: Value, regs: &mut Vec<Option<Value>>) -> Result<(), Error> {
    match target {
        Target::Slot(slot) => {
            regs[*slot] = Some(value);
            Ok(())
        }
        Target::Tuple(targets) => {
            let items = iterate(&value).map_err(|_| {
                Error::Runtime(format!(
                    "cannot unpack a value of type {}",
                    value.type_name()
                ))
            })?;
            if items.len() != targets.len() {
                return Err(Error::Runtime(format!(
                    "expected {} values to unpack, got {}",
                    targets.len(),
                    items.len()
                )));
            }
            for (target, item) in targets.iter().zip(items) {
                bind(target, item, regs)?;
            }
            Ok(())
        }
    }
}

/// What `for` can loop over: lists yield their items, strings their
/// characters, maps their keys in insertion order.
fn iterate(value: &Value) -> Result<Vec<Value>, Error> {
    match value {
        Value::List(items) => Ok(items.clone()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
        Value::Map(pairs) => Ok(pairs.iter().map(|(k, _)| k.clone()).collect()),
        Value::Undefined(u) => Err(u.error()),
        other => Err(Error::Runtime(format!(
            "value of type {} is not iterable",
            other.type_name()
        ))),
    }
}
