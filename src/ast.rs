//! AST node kinds produced by the parser, plus best-effort constant
//! folding (`as_const`). Nodes are immutable after parsing; analysis and
//! code generation only read them.

use crate::value::{self, Value};

/// Signal that an expression cannot be evaluated at compile time. The
/// folder never guesses: any `Name` load, call, or failing operation
/// makes the whole expression impossible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Impossible;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameCtx {
    Load,
    Store,
    Param,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    And,
    Or,
}

impl BinOpKind {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOpKind::Add => "+",
            BinOpKind::Sub => "-",
            BinOpKind::Mul => "*",
            BinOpKind::Div => "/",
            BinOpKind::FloorDiv => "//",
            BinOpKind::Mod => "%",
            BinOpKind::Pow => "**",
            BinOpKind::And => "and",
            BinOpKind::Or => "or",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOpKind {
    Not,
    Neg,
    Pos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    GtEq,
    Lt,
    LtEq,
    In,
    NotIn,
}

/// One `(operator, operand)` link of a chained comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct Operand {
    pub op: CmpOp,
    pub expr: Expr,
}

/// A `key: value` entry of a dict literal.
#[derive(Debug, Clone, PartialEq)]
pub struct Pair {
    pub key: Expr,
    pub value: Expr,
    pub lineno: usize,
}

/// A `name=value` keyword argument of a call.
#[derive(Debug, Clone, PartialEq)]
pub struct Keyword {
    pub key: String,
    pub value: Expr,
    pub lineno: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal template text between tags.
    TemplateData {
        data: String,
        lineno: usize,
    },
    Const {
        value: Value,
        lineno: usize,
    },
    Name {
        name: String,
        ctx: NameCtx,
        lineno: usize,
    },
    Tuple {
        items: Vec<Expr>,
        ctx: NameCtx,
        lineno: usize,
    },
    List {
        items: Vec<Expr>,
        lineno: usize,
    },
    Dict {
        items: Vec<Pair>,
        lineno: usize,
    },
    BinOp {
        op: BinOpKind,
        left: Box<Expr>,
        right: Box<Expr>,
        lineno: usize,
    },
    UnaryOp {
        op: UnaryOpKind,
        node: Box<Expr>,
        lineno: usize,
    },
    Compare {
        expr: Box<Expr>,
        operands: Vec<Operand>,
        lineno: usize,
    },
    Call {
        node: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<Keyword>,
        dyn_args: Option<Box<Expr>>,
        dyn_kwargs: Option<Box<Expr>>,
        lineno: usize,
    },
    Getattr {
        node: Box<Expr>,
        attr: String,
        lineno: usize,
    },
    Getitem {
        node: Box<Expr>,
        arg: Box<Expr>,
        lineno: usize,
    },
    /// Only ever appears as the argument of a `Getitem`.
    Slice {
        start: Option<Box<Expr>>,
        stop: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
        lineno: usize,
    },
}

impl Expr {
    pub fn lineno(&self) -> usize {
        match self {
            Expr::TemplateData { lineno, .. }
            | Expr::Const { lineno, .. }
            | Expr::Name { lineno, .. }
            | Expr::Tuple { lineno, .. }
            | Expr::List { lineno, .. }
            | Expr::Dict { lineno, .. }
            | Expr::BinOp { lineno, .. }
            | Expr::UnaryOp { lineno, .. }
            | Expr::Compare { lineno, .. }
            | Expr::Call { lineno, .. }
            | Expr::Getattr { lineno, .. }
            | Expr::Getitem { lineno, .. }
            | Expr::Slice { lineno, .. } => *lineno,
        }
    }

    /// Rewrite the name context of an assignment target. Only names and
    /// tuples of names can be targets; the parser validates that before
    /// calling this.
    pub fn set_ctx(&mut self, new_ctx: NameCtx) {
        match self {
            Expr::Name { ctx, .. } => *ctx = new_ctx,
            Expr::Tuple { ctx, items, .. } => {
                *ctx = new_ctx;
                for item in items {
                    item.set_ctx(new_ctx);
                }
            }
            _ => {}
        }
    }

    pub fn can_assign(&self) -> bool {
        match self {
            Expr::Name { .. } => true,
            Expr::Tuple { items, .. } => items.iter().all(Expr::can_assign),
            _ => false,
        }
    }

    /// Evaluate this expression at compile time, or report that it is
    /// not a constant. Anything involving a name lookup, a call, or an
    /// attribute access stays dynamic.
    pub fn as_const(&self) -> Result<Value, Impossible> {
        match self {
            Expr::TemplateData { data, .. } => Ok(Value::Str(data.clone())),
            Expr::Const { value, .. } => Ok(value.clone()),
            Expr::Tuple { items, .. } | Expr::List { items, .. } => {
                let folded: Result<Vec<Value>, Impossible> =
                    items.iter().map(Expr::as_const).collect();
                Ok(Value::List(folded?))
            }
            Expr::Dict { items, .. } => {
                let mut pairs = Vec::with_capacity(items.len());
                for pair in items {
                    pairs.push((pair.key.as_const()?, pair.value.as_const()?));
                }
                Ok(Value::Map(pairs))
            }
            Expr::BinOp {
                op, left, right, ..
            } => {
                let left = left.as_const()?;
                match op {
                    // short-circuit like the runtime does
                    BinOpKind::And if !left.is_truthy() => Ok(left),
                    BinOpKind::Or if left.is_truthy() => Ok(left),
                    BinOpKind::And | BinOpKind::Or => right.as_const(),
                    _ => {
                        let right = right.as_const()?;
                        value::binop(*op, &left, &right).map_err(|_| Impossible)
                    }
                }
            }
            Expr::UnaryOp { op, node, .. } => {
                let val = node.as_const()?;
                match op {
                    UnaryOpKind::Not => Ok(Value::Bool(!val.is_truthy())),
                    UnaryOpKind::Neg => value::neg(&val).map_err(|_| Impossible),
                    UnaryOpKind::Pos => value::pos(&val).map_err(|_| Impossible),
                }
            }
            Expr::Compare { expr, operands, .. } => {
                let mut left = expr.as_const()?;
                for operand in operands {
                    let right = operand.expr.as_const()?;
                    if !value::compare(operand.op, &left, &right).map_err(|_| Impossible)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::Getitem { node, arg, .. } => {
                let base = node.as_const()?;
                if let Expr::Slice {
                    start, stop, step, ..
                } = arg.as_ref()
                {
                    let fold_part = |part: &Option<Box<Expr>>| match part {
                        Some(expr) => expr.as_const().map(Some),
                        None => Ok(None),
                    };
                    let (start, stop, step) =
                        (fold_part(start)?, fold_part(stop)?, fold_part(step)?);
                    return value::slice(&base, start.as_ref(), stop.as_ref(), step.as_ref())
                        .map_err(|_| Impossible);
                }
                let index = arg.as_const()?;
                value::getitem(&base, &index).ok_or(Impossible)
            }
            Expr::Name { .. }
            | Expr::Call { .. }
            | Expr::Getattr { .. }
            | Expr::Slice { .. } => Err(Impossible),
        }
    }
}

/// One `elif` arm of an `if` chain.
#[derive(Debug, Clone, PartialEq)]
pub struct IfClause {
    pub test: Expr,
    pub body: Vec<Stmt>,
    pub lineno: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// A run of adjacent template data and expression interpolations.
    Output { nodes: Vec<Expr>, lineno: usize },
    If {
        test: Expr,
        body: Vec<Stmt>,
        elifs: Vec<IfClause>,
        else_body: Vec<Stmt>,
        lineno: usize,
    },
    For {
        target: Expr,
        iter: Expr,
        /// Loop filter: `{% for x in xs if test %}`.
        test: Option<Expr>,
        body: Vec<Stmt>,
        else_body: Vec<Stmt>,
        lineno: usize,
    },
    With {
        targets: Vec<Expr>,
        values: Vec<Expr>,
        body: Vec<Stmt>,
        lineno: usize,
    },
    Block {
        name: String,
        body: Vec<Stmt>,
        lineno: usize,
    },
    /// Parsed and carried in the AST; inheritance resolution itself is
    /// out of scope, so code generation ignores it.
    Extends { template: Expr, lineno: usize },
}

/// Root of a parsed template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub body: Vec<Stmt>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn const_int(i: i64) -> Expr {
        Expr::Const {
            value: Value::Int(i),
            lineno: 1,
        }
    }

    #[test]
    fn folding_literal_arithmetic() {
        let expr = Expr::BinOp {
            op: BinOpKind::Add,
            left: Box::new(const_int(1)),
            right: Box::new(const_int(2)),
            lineno: 1,
        };
        assert_eq!(expr.as_const(), Ok(Value::Int(3)));
    }

    #[test]
    fn folding_list_index() {
        let expr = Expr::Getitem {
            node: Box::new(Expr::List {
                items: vec![const_int(1), const_int(2)],
                lineno: 1,
            }),
            arg: Box::new(const_int(0)),
            lineno: 1,
        };
        assert_eq!(expr.as_const(), Ok(Value::Int(1)));
    }

    #[test]
    fn name_loads_are_never_constant() {
        let expr = Expr::BinOp {
            op: BinOpKind::Add,
            left: Box::new(const_int(1)),
            right: Box::new(Expr::Name {
                name: "x".into(),
                ctx: NameCtx::Load,
                lineno: 1,
            }),
            lineno: 1,
        };
        assert_eq!(expr.as_const(), Err(Impossible));
    }

    #[test]
    fn failing_operations_are_not_constant() {
        let expr = Expr::BinOp {
            op: BinOpKind::Sub,
            left: Box::new(Expr::Const {
                value: Value::from("a"),
                lineno: 1,
            }),
            right: Box::new(const_int(1)),
            lineno: 1,
        };
        assert_eq!(expr.as_const(), Err(Impossible));
    }

    #[test]
    fn chained_comparison_folds_with_short_circuit() {
        let expr = Expr::Compare {
            expr: Box::new(const_int(1)),
            operands: vec![
                Operand {
                    op: CmpOp::Lt,
                    expr: const_int(2),
                },
                Operand {
                    op: CmpOp::Lt,
                    expr: const_int(3),
                },
            ],
            lineno: 1,
        };
        assert_eq!(expr.as_const(), Ok(Value::Bool(true)));
    }
}
