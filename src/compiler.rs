//! Code generation. A parsed template becomes a `Program`: one routine
//! for the template body and one per named block, each a tree of ops over
//! a flat register file. Registers hold `Option<Value>`; `None` is the
//! "missing" marker that the undefined machinery keys off.
//!
//! Constant subexpressions inside output statements are folded here, so
//! a template made of literals renders without touching the context.

use std::collections::HashMap;

use crate::ast::{BinOpKind, CmpOp, Expr, IfClause, Stmt, Template, UnaryOpKind};
use crate::error::SyntaxError;
use crate::symbols::{ForBranch, FrameId, Load, Symbols};
use crate::value::{self, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Slot(usize),
    Tuple(Vec<Target>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprIr {
    Const(Value),
    /// Register bound by a loop or with target; always set when read.
    Param { slot: usize },
    /// Register filled by a `Resolve` op; reads of a missing register
    /// produce an undefined value carrying the source name.
    Load { slot: usize, name: String },
    Tuple(Vec<ExprIr>),
    List(Vec<ExprIr>),
    Dict(Vec<(ExprIr, ExprIr)>),
    BinOp {
        op: BinOpKind,
        left: Box<ExprIr>,
        right: Box<ExprIr>,
    },
    UnaryOp {
        op: UnaryOpKind,
        node: Box<ExprIr>,
    },
    Compare {
        expr: Box<ExprIr>,
        operands: Vec<(CmpOp, ExprIr)>,
    },
    Call {
        node: Box<ExprIr>,
        args: Vec<ExprIr>,
        kwargs: Vec<(String, ExprIr)>,
        dyn_args: Option<Box<ExprIr>>,
        dyn_kwargs: Option<Box<ExprIr>>,
    },
    Getattr {
        node: Box<ExprIr>,
        attr: String,
    },
    Getitem {
        node: Box<ExprIr>,
        arg: Box<ExprIr>,
    },
    Slice {
        node: Box<ExprIr>,
        start: Option<Box<ExprIr>>,
        stop: Option<Box<ExprIr>>,
        step: Option<Box<ExprIr>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Fill a register from the render context, or mark it missing.
    Resolve { slot: usize, name: String },
    /// Clear registers when a scope ends.
    Unset { slots: Vec<usize> },
    /// Write pre-folded text to the output.
    EmitText(String),
    /// Evaluate, stringify and write; `escape` carries the autoescape
    /// decision made at compile time.
    EmitExpr { expr: ExprIr, escape: bool },
    /// Assign an evaluated value to a target, unpacking tuples.
    Bind { target: Target, value: ExprIr },
    If {
        arms: Vec<(ExprIr, Vec<Op>)>,
        else_ops: Vec<Op>,
    },
    For {
        target: Target,
        iter: ExprIr,
        /// Resolve ops for names the filter test needs, run once before
        /// iteration starts.
        filter_enter: Vec<Op>,
        /// Loop filter test; items it rejects never run the body.
        filter: Option<ExprIr>,
        /// Starts with the loop frame's resolve ops, then the body.
        body: Vec<Op>,
        /// Runs when no iteration made it through the filter. Includes
        /// its own frame's resolve and unset ops.
        else_ops: Vec<Op>,
        /// Loop frame registers to clear once the statement is done.
        unset: Vec<usize>,
    },
    /// Invoke a block routine in place.
    RenderBlock { name: String },
}

/// One compiled render function: the template root or a named block.
/// Each invocation gets a fresh register file of the given size.
#[derive(Debug, Clone, PartialEq)]
pub struct Routine {
    pub ops: Vec<Op>,
    pub registers: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub name: Option<String>,
    pub root: Routine,
    pub blocks: HashMap<String, Routine>,
}

pub fn generate(
    template: &Template,
    name: Option<&str>,
    autoescape: bool,
) -> Result<Program, SyntaxError> {
    let mut blocks_src: Vec<(String, &[Stmt])> = Vec::new();
    collect_blocks(&template.body, &mut blocks_src)?;

    let root = compile_routine(&template.body, autoescape)?;
    let mut blocks = HashMap::new();
    for (block_name, body) in blocks_src {
        blocks.insert(block_name, compile_routine(body, autoescape)?);
    }
    Ok(Program {
        name: name.map(str::to_owned),
        root,
        blocks,
    })
}

/// Block names share one template-wide namespace, whatever statement the
/// block is nested in.
fn collect_blocks<'a>(
    body: &'a [Stmt],
    out: &mut Vec<(String, &'a [Stmt])>,
) -> Result<(), SyntaxError> {
    for stmt in body {
        match stmt {
            Stmt::Block { name, body, lineno } => {
                if out.iter().any(|(existing, _)| existing == name) {
                    return Err(SyntaxError::new(
                        format!("block '{}' defined twice", name),
                        *lineno,
                    ));
                }
                out.push((name.clone(), body.as_slice()));
                collect_blocks(body, out)?;
            }
            Stmt::If {
                body,
                elifs,
                else_body,
                ..
            } => {
                collect_blocks(body, out)?;
                for clause in elifs {
                    collect_blocks(&clause.body, out)?;
                }
                collect_blocks(else_body, out)?;
            }
            Stmt::For {
                body, else_body, ..
            } => {
                collect_blocks(body, out)?;
                collect_blocks(else_body, out)?;
            }
            Stmt::With { body, .. } => collect_blocks(body, out)?,
            Stmt::Output { .. } | Stmt::Extends { .. } => {}
        }
    }
    Ok(())
}

fn compile_routine(body: &[Stmt], autoescape: bool) -> Result<Routine, SyntaxError> {
    let mut gen = CodeGenerator::new(autoescape);
    let root = gen.symbols.root();
    gen.symbols.analyze_stmts(root, body);
    let mut ops = gen.enter_frame_ops(root);
    gen.compile_stmts(root, body, &mut ops)?;
    // the routine's own scope is kept; its registers die with it
    Ok(Routine {
        ops,
        registers: gen.next_slot,
    })
}

struct CodeGenerator {
    autoescape: bool,
    symbols: Symbols,
    slots: HashMap<String, usize>,
    next_slot: usize,
}

impl CodeGenerator {
    fn new(autoescape: bool) -> Self {
        CodeGenerator {
            autoescape,
            symbols: Symbols::new(),
            slots: HashMap::new(),
            next_slot: 0,
        }
    }

    fn slot(&mut self, ident: &str) -> usize {
        if let Some(slot) = self.slots.get(ident) {
            return *slot;
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        self.slots.insert(ident.to_owned(), slot);
        slot
    }

    /// Ops that set up a frame on entry: one resolve per context-loaded
    /// name; parameters are bound by the construct itself.
    fn enter_frame_ops(&mut self, frame: FrameId) -> Vec<Op> {
        let loads: Vec<(String, Load)> = self
            .symbols
            .loads(frame)
            .map(|(ident, load)| (ident.to_owned(), load.clone()))
            .collect();
        let mut ops = Vec::new();
        for (ident, load) in loads {
            if let Load::Resolve(name) = load {
                ops.push(Op::Resolve {
                    slot: self.slot(&ident),
                    name,
                });
            }
        }
        ops
    }

    /// Registers to clear when a frame's scope is discarded.
    fn leave_frame_slots(&mut self, frame: FrameId) -> Vec<usize> {
        let idents: Vec<String> = self
            .symbols
            .loads(frame)
            .map(|(ident, _)| ident.to_owned())
            .collect();
        idents.iter().map(|ident| self.slot(ident)).collect()
    }

    fn compile_stmts(
        &mut self,
        frame: FrameId,
        body: &[Stmt],
        ops: &mut Vec<Op>,
    ) -> Result<(), SyntaxError> {
        for stmt in body {
            self.compile_stmt(frame, stmt, ops)?;
        }
        Ok(())
    }

    fn compile_stmt(
        &mut self,
        frame: FrameId,
        stmt: &Stmt,
        ops: &mut Vec<Op>,
    ) -> Result<(), SyntaxError> {
        match stmt {
            Stmt::Output { nodes, .. } => self.compile_output(frame, nodes, ops),
            Stmt::If {
                test,
                body,
                elifs,
                else_body,
                ..
            } => {
                // branches share the enclosing frame, so no enter/leave
                let mut arms = Vec::new();
                let mut arm_ops = Vec::new();
                self.compile_stmts(frame, body, &mut arm_ops)?;
                arms.push((self.compile_expr(frame, test)?, arm_ops));
                for IfClause { test, body, .. } in elifs {
                    let mut arm_ops = Vec::new();
                    self.compile_stmts(frame, body, &mut arm_ops)?;
                    arms.push((self.compile_expr(frame, test)?, arm_ops));
                }
                let mut else_ops = Vec::new();
                self.compile_stmts(frame, else_body, &mut else_ops)?;
                ops.push(Op::If { arms, else_ops });
                Ok(())
            }
            Stmt::For {
                target,
                iter,
                test,
                body,
                else_body,
                ..
            } => self.compile_for(frame, target, iter, test.as_ref(), body, else_body, ops),
            Stmt::With {
                targets,
                values,
                body,
                ..
            } => {
                let with_frame = self.symbols.derived(frame);
                self.symbols.analyze_with(with_frame, targets, body);
                ops.extend(self.enter_frame_ops(with_frame));
                for (target, value) in targets.iter().zip(values) {
                    // the value belongs to the enclosing scope; earlier
                    // targets of the same with are not visible in it
                    let value = self.compile_expr(frame, value)?;
                    let target = self.compile_target(with_frame, target)?;
                    ops.push(Op::Bind { target, value });
                }
                self.compile_stmts(with_frame, body, ops)?;
                let slots = self.leave_frame_slots(with_frame);
                if !slots.is_empty() {
                    ops.push(Op::Unset { slots });
                }
                Ok(())
            }
            Stmt::Block { name, .. } => {
                ops.push(Op::RenderBlock { name: name.clone() });
                Ok(())
            }
            // inheritance resolution is not performed; the tag parses
            // and renders nothing
            Stmt::Extends { .. } => Ok(()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn compile_for(
        &mut self,
        frame: FrameId,
        target: &Expr,
        iter: &Expr,
        test: Option<&Expr>,
        body: &[Stmt],
        else_body: &[Stmt],
        ops: &mut Vec<Op>,
    ) -> Result<(), SyntaxError> {
        let loop_frame = self.symbols.derived(frame);
        self.symbols
            .analyze_for_branch(loop_frame, target, test, body, ForBranch::Body);

        let (filter_enter, filter) = match test {
            Some(test) => {
                // the test runs in a sibling frame at the same level, so
                // the target binds to the same registers as in the body
                let test_frame = self.symbols.derived(frame);
                self.symbols
                    .analyze_for_branch(test_frame, target, Some(test), &[], ForBranch::Test);
                let enter = self.enter_frame_ops(test_frame);
                (enter, Some(self.compile_expr(test_frame, test)?))
            }
            None => (Vec::new(), None),
        };

        // the iterable is evaluated before the loop scope exists
        let iter_ir = self.compile_expr(frame, iter)?;
        let target_ir = self.compile_target(loop_frame, target)?;

        let mut body_ops = self.enter_frame_ops(loop_frame);
        self.compile_stmts(loop_frame, body, &mut body_ops)?;
        let unset = self.leave_frame_slots(loop_frame);

        let mut else_ops = Vec::new();
        if !else_body.is_empty() {
            let else_frame = self.symbols.derived(frame);
            self.symbols
                .analyze_for_branch(else_frame, target, None, else_body, ForBranch::Else);
            else_ops = self.enter_frame_ops(else_frame);
            self.compile_stmts(else_frame, else_body, &mut else_ops)?;
            let slots = self.leave_frame_slots(else_frame);
            if !slots.is_empty() {
                else_ops.push(Op::Unset { slots });
            }
        }

        ops.push(Op::For {
            target: target_ir,
            iter: iter_ir,
            filter_enter,
            filter,
            body: body_ops,
            else_ops,
            unset,
        });
        Ok(())
    }

    /// Fold what can be folded and merge adjacent constant output into
    /// single text writes. Static template data is emitted verbatim even
    /// under autoescape; folded expression constants are escaped now so
    /// the render loop does not have to.
    fn compile_output(
        &mut self,
        frame: FrameId,
        nodes: &[Expr],
        ops: &mut Vec<Op>,
    ) -> Result<(), SyntaxError> {
        let mut pending = String::new();
        for node in nodes {
            if let Expr::TemplateData { data, .. } = node {
                pending.push_str(data);
                continue;
            }
            let folded = node
                .as_const()
                .ok()
                .and_then(|value| value.to_output_string().ok());
            match folded {
                Some(text) => {
                    if self.autoescape {
                        pending.push_str(&value::escape_html(&text));
                    } else {
                        pending.push_str(&text);
                    }
                }
                None => {
                    if !pending.is_empty() {
                        ops.push(Op::EmitText(std::mem::take(&mut pending)));
                    }
                    ops.push(Op::EmitExpr {
                        expr: self.compile_expr(frame, node)?,
                        escape: self.autoescape,
                    });
                }
            }
        }
        if !pending.is_empty() {
            ops.push(Op::EmitText(pending));
        }
        Ok(())
    }

    fn compile_target(&mut self, frame: FrameId, target: &Expr) -> Result<Target, SyntaxError> {
        match target {
            Expr::Name { name, lineno, .. } => {
                let ident = self.symbols.ref_ident(frame, name, *lineno)?;
                Ok(Target::Slot(self.slot(&ident)))
            }
            Expr::Tuple { items, .. } => {
                let targets: Result<Vec<Target>, SyntaxError> = items
                    .iter()
                    .map(|item| self.compile_target(frame, item))
                    .collect();
                Ok(Target::Tuple(targets?))
            }
            other => Err(SyntaxError::new(
                "cannot assign to this expression",
                other.lineno(),
            )),
        }
    }

    fn compile_expr(&mut self, frame: FrameId, expr: &Expr) -> Result<ExprIr, SyntaxError> {
        match expr {
            Expr::TemplateData { data, .. } => Ok(ExprIr::Const(Value::Str(data.clone()))),
            Expr::Const { value, .. } => Ok(ExprIr::Const(value.clone())),
            Expr::Name { name, lineno, .. } => {
                let ident = self.symbols.ref_ident(frame, name, *lineno)?;
                let slot = self.slot(&ident);
                match self.symbols.find_load(frame, &ident) {
                    Some(Load::Param) => Ok(ExprIr::Param { slot }),
                    _ => Ok(ExprIr::Load {
                        slot,
                        name: name.clone(),
                    }),
                }
            }
            Expr::Tuple { items, .. } => {
                Ok(ExprIr::Tuple(self.compile_exprs(frame, items)?))
            }
            Expr::List { items, .. } => Ok(ExprIr::List(self.compile_exprs(frame, items)?)),
            Expr::Dict { items, .. } => {
                let mut pairs = Vec::with_capacity(items.len());
                for pair in items {
                    pairs.push((
                        self.compile_expr(frame, &pair.key)?,
                        self.compile_expr(frame, &pair.value)?,
                    ));
                }
                Ok(ExprIr::Dict(pairs))
            }
            Expr::BinOp {
                op, left, right, ..
            } => Ok(ExprIr::BinOp {
                op: *op,
                left: Box::new(self.compile_expr(frame, left)?),
                right: Box::new(self.compile_expr(frame, right)?),
            }),
            Expr::UnaryOp { op, node, .. } => Ok(ExprIr::UnaryOp {
                op: *op,
                node: Box::new(self.compile_expr(frame, node)?),
            }),
            Expr::Compare { expr, operands, .. } => {
                let mut ops = Vec::with_capacity(operands.len());
                for operand in operands {
                    ops.push((operand.op, self.compile_expr(frame, &operand.expr)?));
                }
                Ok(ExprIr::Compare {
                    expr: Box::new(self.compile_expr(frame, expr)?),
                    operands: ops,
                })
            }
            Expr::Call {
                node,
                args,
                kwargs,
                dyn_args,
                dyn_kwargs,
                ..
            } => {
                let mut kw = Vec::with_capacity(kwargs.len());
                for keyword in kwargs {
                    kw.push((
                        keyword.key.clone(),
                        self.compile_expr(frame, &keyword.value)?,
                    ));
                }
                Ok(ExprIr::Call {
                    node: Box::new(self.compile_expr(frame, node)?),
                    args: self.compile_exprs(frame, args)?,
                    kwargs: kw,
                    dyn_args: self.compile_opt(frame, dyn_args.as_deref())?,
                    dyn_kwargs: self.compile_opt(frame, dyn_kwargs.as_deref())?,
                })
            }
            Expr::Getattr { node, attr, .. } => Ok(ExprIr::Getattr {
                node: Box::new(self.compile_expr(frame, node)?),
                attr: attr.clone(),
            }),
            Expr::Getitem { node, arg, .. } => {
                if let Expr::Slice {
                    start, stop, step, ..
                } = arg.as_ref()
                {
                    return Ok(ExprIr::Slice {
                        node: Box::new(self.compile_expr(frame, node)?),
                        start: self.compile_opt(frame, start.as_deref())?,
                        stop: self.compile_opt(frame, stop.as_deref())?,
                        step: self.compile_opt(frame, step.as_deref())?,
                    });
                }
                Ok(ExprIr::Getitem {
                    node: Box::new(self.compile_expr(frame, node)?),
                    arg: Box::new(self.compile_expr(frame, arg)?),
                })
            }
            Expr::Slice { lineno, .. } => Err(SyntaxError::new(
                "slice outside of a subscript",
                *lineno,
            )),
        }
    }

    fn compile_exprs(
        &mut self,
        frame: FrameId,
        exprs: &[Expr],
    ) -> Result<Vec<ExprIr>, SyntaxError> {
        exprs
            .iter()
            .map(|expr| self.compile_expr(frame, expr))
            .collect()
    }

    fn compile_opt(
        &mut self,
        frame: FrameId,
        expr: Option<&Expr>,
    ) -> Result<Option<Box<ExprIr>>, SyntaxError> {
        match expr {
            Some(expr) => Ok(Some(Box::new(self.compile_expr(frame, expr)?))),
            None => Ok(None),
        }
    }
}
