//! Recursive-descent parser: consumes a token stream, produces one
//! template AST, or fails fatally on the first malformed construct.
//! There is no error recovery and no partial AST.

use crate::ast::{
    BinOpKind, CmpOp, Expr, IfClause, Keyword, NameCtx, Operand, Pair, Stmt, Template,
    UnaryOpKind,
};
use crate::error::SyntaxError;
use crate::lexer::{TokenKind, TokenStream};
use crate::value::Value;

const STATEMENT_KEYWORDS: [&str; 5] = ["if", "for", "with", "block", "extends"];

pub fn parse(source: &str) -> Result<Template, SyntaxError> {
    Parser::new(source)?.parse()
}

pub struct Parser<'a> {
    stream: TokenStream<'a>,
}

impl<'a> Parser<'a> {
    pub fn new(source: &'a str) -> Result<Self, SyntaxError> {
        Ok(Parser {
            stream: TokenStream::new(source)?,
        })
    }

    pub fn parse(&mut self) -> Result<Template, SyntaxError> {
        let body = self.subparse(None)?;
        Ok(Template { body })
    }

    fn fail<T>(&self, message: impl Into<String>, lineno: usize) -> Result<T, SyntaxError> {
        Err(SyntaxError::new(message, lineno))
    }

    /// Parse a run of template data, expression tags, and statements
    /// until one of `end_tokens` (a statement keyword such as `endfor`)
    /// appears right after a `{%`. The end keyword itself is left in the
    /// stream for the caller.
    fn subparse(&mut self, end_tokens: Option<&[&str]>) -> Result<Vec<Stmt>, SyntaxError> {
        let mut body = Vec::new();
        let mut buffer: Vec<Expr> = Vec::new();

        fn flush(buffer: &mut Vec<Expr>, body: &mut Vec<Stmt>) {
            if buffer.is_empty() {
                return;
            }
            let lineno = buffer[0].lineno();
            body.push(Stmt::Output {
                nodes: std::mem::take(buffer),
                lineno,
            });
        }

        while !self.stream.is_closed() {
            let token = self.stream.current().clone();
            match token.kind {
                TokenKind::Data(data) => {
                    buffer.push(Expr::TemplateData {
                        data,
                        lineno: token.lineno,
                    });
                    self.stream.next()?;
                }
                TokenKind::VariableBegin => {
                    self.stream.next()?;
                    buffer.push(self.parse_tuple(false, None, false)?);
                    self.stream.expect(&TokenKind::VariableEnd)?;
                }
                TokenKind::BlockBegin => {
                    flush(&mut buffer, &mut body);
                    self.stream.next()?;
                    if let Some(ends) = end_tokens {
                        if ends.iter().any(|kw| self.stream.current().is_name(kw)) {
                            return Ok(body);
                        }
                    }
                    let stmt = self.parse_statement()?;
                    body.push(stmt);
                    self.stream.expect(&TokenKind::BlockEnd)?;
                }
                other => {
                    return self.fail(
                        format!("unexpected {}", other.describe()),
                        token.lineno,
                    )
                }
            }
        }
        flush(&mut buffer, &mut body);
        Ok(body)
    }

    fn parse_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let token = self.stream.current();
        let name = match &token.kind {
            TokenKind::Name(name) => name.clone(),
            _ => return self.fail("tag name expected", token.lineno),
        };
        if !STATEMENT_KEYWORDS.contains(&name.as_str()) {
            return self.fail(format!("unknown tag '{}'", name), token.lineno);
        }
        match name.as_str() {
            "if" => self.parse_if(),
            "for" => self.parse_for(),
            "with" => self.parse_with(),
            "block" => self.parse_block(),
            "extends" => self.parse_extends(),
            _ => unreachable!(),
        }
    }

    /// Consume the `%}` of the opening tag, parse the enclosed body up
    /// to one of `end_tokens`, and (with `drop_needle`) consume the end
    /// keyword. The end tag's own `%}` is handled by `subparse`'s caller
    /// loop.
    fn parse_statements(
        &mut self,
        end_tokens: &[&str],
        drop_needle: bool,
    ) -> Result<Vec<Stmt>, SyntaxError> {
        self.stream.expect(&TokenKind::BlockEnd)?;
        let body = self.subparse(Some(end_tokens))?;
        if self.stream.is_closed() {
            return self.fail("unexpected end of template", self.stream.lineno());
        }
        if drop_needle {
            self.stream.next()?;
        }
        Ok(body)
    }

    fn parse_if(&mut self) -> Result<Stmt, SyntaxError> {
        let lineno = self.stream.expect_keyword("if")?;
        let test = self.parse_tuple(false, None, false)?;
        let body = self.parse_statements(&["elif", "else", "endif"], false)?;
        let mut elifs = Vec::new();
        let mut else_body = Vec::new();
        loop {
            let token = self.stream.next()?;
            if token.is_name("elif") {
                let elif_lineno = token.lineno;
                let elif_test = self.parse_tuple(false, None, false)?;
                let elif_body = self.parse_statements(&["elif", "else", "endif"], false)?;
                elifs.push(IfClause {
                    test: elif_test,
                    body: elif_body,
                    lineno: elif_lineno,
                });
            } else if token.is_name("else") {
                else_body = self.parse_statements(&["endif"], true)?;
                break;
            } else {
                // endif
                break;
            }
        }
        Ok(Stmt::If {
            test,
            body,
            elifs,
            else_body,
            lineno,
        })
    }

    fn parse_for(&mut self) -> Result<Stmt, SyntaxError> {
        let lineno = self.stream.expect_keyword("for")?;
        let target = self.parse_assign_target(Some(&["in"]), NameCtx::Store)?;
        self.stream.expect_keyword("in")?;
        let iter = self.parse_tuple(false, Some(&["if"]), false)?;
        let test = if self.stream.skip_if_keyword("if")? {
            Some(self.parse_expression()?)
        } else {
            None
        };
        let body = self.parse_statements(&["endfor", "else"], false)?;
        let token = self.stream.next()?;
        let else_body = if token.is_name("else") {
            self.parse_statements(&["endfor"], true)?
        } else {
            Vec::new()
        };
        Ok(Stmt::For {
            target,
            iter,
            test,
            body,
            else_body,
            lineno,
        })
    }

    fn parse_with(&mut self) -> Result<Stmt, SyntaxError> {
        let lineno = self.stream.expect_keyword("with")?;
        let mut targets = Vec::new();
        let mut values = Vec::new();
        while self.stream.current().kind != TokenKind::BlockEnd {
            if !targets.is_empty() {
                self.stream.expect(&TokenKind::Comma)?;
            }
            // targets become parameters of the new scope; the values are
            // evaluated in the enclosing scope and never see each other
            let target = self.parse_assign_target(None, NameCtx::Param)?;
            self.stream.expect(&TokenKind::Assign)?;
            let value = self.parse_expression()?;
            targets.push(target);
            values.push(value);
        }
        if targets.is_empty() {
            return self.fail("with statement requires at least one assignment", lineno);
        }
        let body = self.parse_statements(&["endwith"], true)?;
        Ok(Stmt::With {
            targets,
            values,
            body,
            lineno,
        })
    }

    fn parse_block(&mut self) -> Result<Stmt, SyntaxError> {
        let lineno = self.stream.expect_keyword("block")?;
        let (name, _) = self.stream.expect_name()?;
        let body = self.parse_statements(&["endblock"], true)?;
        // `endblock name` may repeat the block name; it is consumed but
        // not required to match
        self.stream.skip_if_keyword(&name)?;
        Ok(Stmt::Block { name, body, lineno })
    }

    fn parse_extends(&mut self) -> Result<Stmt, SyntaxError> {
        let lineno = self.stream.expect_keyword("extends")?;
        let template = self.parse_expression()?;
        Ok(Stmt::Extends { template, lineno })
    }

    fn parse_assign_target(
        &mut self,
        extra_end_rules: Option<&[&str]>,
        ctx: NameCtx,
    ) -> Result<Expr, SyntaxError> {
        let lineno = self.stream.lineno();
        let mut target = self.parse_tuple(true, extra_end_rules, false)?;
        if !target.can_assign() {
            return self.fail("cannot assign to this expression", lineno);
        }
        target.set_ctx(ctx);
        Ok(target)
    }

    pub fn parse_expression(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, SyntaxError> {
        let mut lineno = self.stream.lineno();
        let mut left = self.parse_and()?;
        while self.stream.skip_if_keyword("or")? {
            let right = self.parse_and()?;
            left = Expr::BinOp {
                op: BinOpKind::Or,
                left: Box::new(left),
                right: Box::new(right),
                lineno,
            };
            lineno = self.stream.lineno();
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, SyntaxError> {
        let mut lineno = self.stream.lineno();
        let mut left = self.parse_not()?;
        while self.stream.skip_if_keyword("and")? {
            let right = self.parse_not()?;
            left = Expr::BinOp {
                op: BinOpKind::And,
                left: Box::new(left),
                right: Box::new(right),
                lineno,
            };
            lineno = self.stream.lineno();
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, SyntaxError> {
        let lineno = self.stream.lineno();
        if self.stream.skip_if_keyword("not")? {
            return Ok(Expr::UnaryOp {
                op: UnaryOpKind::Not,
                node: Box::new(self.parse_not()?),
                lineno,
            });
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, SyntaxError> {
        let lineno = self.stream.lineno();
        let expr = self.parse_math1()?;
        let mut operands = Vec::new();
        loop {
            let op = match &self.stream.current().kind {
                TokenKind::Eq => Some(CmpOp::Eq),
                TokenKind::Ne => Some(CmpOp::Ne),
                TokenKind::Gt => Some(CmpOp::Gt),
                TokenKind::GtEq => Some(CmpOp::GtEq),
                TokenKind::Lt => Some(CmpOp::Lt),
                TokenKind::LtEq => Some(CmpOp::LtEq),
                _ => None,
            };
            let op = if let Some(op) = op {
                self.stream.next()?;
                op
            } else if self.stream.skip_if_keyword("in")? {
                CmpOp::In
            } else if self.stream.skip_if_keyword("not")? {
                self.stream.expect_keyword("in")?;
                CmpOp::NotIn
            } else {
                break;
            };
            operands.push(Operand {
                op,
                expr: self.parse_math1()?,
            });
        }
        if operands.is_empty() {
            return Ok(expr);
        }
        Ok(Expr::Compare {
            expr: Box::new(expr),
            operands,
            lineno,
        })
    }

    fn parse_math1(&mut self) -> Result<Expr, SyntaxError> {
        let mut lineno = self.stream.lineno();
        let mut left = self.parse_math2()?;
        loop {
            let op = match self.stream.current().kind {
                TokenKind::Add => BinOpKind::Add,
                TokenKind::Sub => BinOpKind::Sub,
                _ => break,
            };
            self.stream.next()?;
            let right = self.parse_math2()?;
            left = Expr::BinOp {
                op,
                left: Box::new(left),
                right: Box::new(right),
                lineno,
            };
            lineno = self.stream.lineno();
        }
        Ok(left)
    }

    fn parse_math2(&mut self) -> Result<Expr, SyntaxError> {
        let mut lineno = self.stream.lineno();
        let mut left = self.parse_pow()?;
        loop {
            let op = match self.stream.current().kind {
                TokenKind::Mul => BinOpKind::Mul,
                TokenKind::Div => BinOpKind::Div,
                TokenKind::FloorDiv => BinOpKind::FloorDiv,
                TokenKind::Mod => BinOpKind::Mod,
                _ => break,
            };
            self.stream.next()?;
            let right = self.parse_pow()?;
            left = Expr::BinOp {
                op,
                left: Box::new(left),
                right: Box::new(right),
                lineno,
            };
            lineno = self.stream.lineno();
        }
        Ok(left)
    }

    /// `**` groups to the left here; kept that way for compatibility
    /// even though it is mathematically right-associative.
    fn parse_pow(&mut self) -> Result<Expr, SyntaxError> {
        let mut lineno = self.stream.lineno();
        let mut left = self.parse_unary()?;
        while self.stream.current().kind == TokenKind::Pow {
            self.stream.next()?;
            let right = self.parse_unary()?;
            left = Expr::BinOp {
                op: BinOpKind::Pow,
                left: Box::new(left),
                right: Box::new(right),
                lineno,
            };
            lineno = self.stream.lineno();
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, SyntaxError> {
        let lineno = self.stream.lineno();
        let op = match self.stream.current().kind {
            TokenKind::Add => Some(UnaryOpKind::Pos),
            TokenKind::Sub => Some(UnaryOpKind::Neg),
            _ => None,
        };
        if let Some(op) = op {
            self.stream.next()?;
            return Ok(Expr::UnaryOp {
                op,
                node: Box::new(self.parse_unary()?),
                lineno,
            });
        }
        let node = self.parse_primary()?;
        self.parse_postfix(node)
    }

    fn parse_primary(&mut self) -> Result<Expr, SyntaxError> {
        let token = self.stream.current().clone();
        let lineno = token.lineno;
        match token.kind {
            TokenKind::Name(name) => match name.as_str() {
                "true" | "True" => {
                    self.stream.next()?;
                    Ok(Expr::Const {
                        value: Value::Bool(true),
                        lineno,
                    })
                }
                "false" | "False" => {
                    self.stream.next()?;
                    Ok(Expr::Const {
                        value: Value::Bool(false),
                        lineno,
                    })
                }
                "none" | "None" => {
                    self.stream.next()?;
                    Ok(Expr::Const {
                        value: Value::None,
                        lineno,
                    })
                }
                _ => {
                    self.stream.next()?;
                    Ok(Expr::Name {
                        name,
                        ctx: NameCtx::Load,
                        lineno,
                    })
                }
            },
            TokenKind::Int(value) => {
                self.stream.next()?;
                Ok(Expr::Const {
                    value: Value::Int(value),
                    lineno,
                })
            }
            TokenKind::Float(value) => {
                self.stream.next()?;
                Ok(Expr::Const {
                    value: Value::Float(value),
                    lineno,
                })
            }
            TokenKind::Str(first) => {
                self.stream.next()?;
                // adjacent string literals concatenate
                let mut buffer = first;
                while let TokenKind::Str(more) = &self.stream.current().kind {
                    buffer.push_str(more);
                    self.stream.next()?;
                }
                Ok(Expr::Const {
                    value: Value::Str(buffer),
                    lineno,
                })
            }
            TokenKind::LParen => {
                self.stream.next()?;
                let node = self.parse_tuple(false, None, true)?;
                self.stream.expect(&TokenKind::RParen)?;
                Ok(node)
            }
            TokenKind::LBracket => self.parse_list(),
            TokenKind::LBrace => self.parse_dict(),
            other => self.fail(format!("unexpected {}", other.describe()), lineno),
        }
    }

    fn is_tuple_end(&self, extra_end_rules: Option<&[&str]>) -> bool {
        match self.stream.current().kind {
            TokenKind::VariableEnd | TokenKind::BlockEnd | TokenKind::RParen | TokenKind::Eof => {
                return true
            }
            _ => {}
        }
        match extra_end_rules {
            Some(rules) => rules.iter().any(|kw| self.stream.current().is_name(kw)),
            None => false,
        }
    }

    /// Parse one expression or a comma tuple. A single expression with
    /// no trailing comma is returned bare; an empty tuple is only legal
    /// inside explicit parentheses. `simplified` restricts the items to
    /// primaries and is used for assignment targets.
    fn parse_tuple(
        &mut self,
        simplified: bool,
        extra_end_rules: Option<&[&str]>,
        explicit_parens: bool,
    ) -> Result<Expr, SyntaxError> {
        let lineno = self.stream.lineno();
        let mut items = Vec::new();
        let mut is_tuple = false;
        loop {
            if !items.is_empty() {
                self.stream.expect(&TokenKind::Comma)?;
            }
            if self.is_tuple_end(extra_end_rules) {
                break;
            }
            let item = if simplified {
                self.parse_primary()?
            } else {
                self.parse_expression()?
            };
            items.push(item);
            if self.stream.current().kind == TokenKind::Comma {
                is_tuple = true;
            } else {
                break;
            }
        }

        if !is_tuple {
            if let Some(single) = items.pop() {
                return Ok(single);
            }
            if !explicit_parens {
                return self.fail(
                    format!(
                        "expected expression, got {}",
                        self.stream.current().kind.describe()
                    ),
                    self.stream.lineno(),
                );
            }
        }
        Ok(Expr::Tuple {
            items,
            ctx: NameCtx::Load,
            lineno,
        })
    }

    fn parse_list(&mut self) -> Result<Expr, SyntaxError> {
        let token = self.stream.expect(&TokenKind::LBracket)?;
        let mut items = Vec::new();
        while self.stream.current().kind != TokenKind::RBracket {
            if !items.is_empty() {
                self.stream.expect(&TokenKind::Comma)?;
            }
            if self.stream.current().kind == TokenKind::RBracket {
                break;
            }
            items.push(self.parse_expression()?);
        }
        self.stream.expect(&TokenKind::RBracket)?;
        Ok(Expr::List {
            items,
            lineno: token.lineno,
        })
    }

    fn parse_dict(&mut self) -> Result<Expr, SyntaxError> {
        let token = self.stream.expect(&TokenKind::LBrace)?;
        let mut items = Vec::new();
        while self.stream.current().kind != TokenKind::RBrace {
            if !items.is_empty() {
                self.stream.expect(&TokenKind::Comma)?;
            }
            if self.stream.current().kind == TokenKind::RBrace {
                break;
            }
            let lineno = self.stream.lineno();
            let key = self.parse_expression()?;
            self.stream.expect(&TokenKind::Colon)?;
            let value = self.parse_expression()?;
            items.push(Pair { key, value, lineno });
        }
        self.stream.expect(&TokenKind::RBrace)?;
        Ok(Expr::Dict {
            items,
            lineno: token.lineno,
        })
    }

    fn parse_postfix(&mut self, mut node: Expr) -> Result<Expr, SyntaxError> {
        loop {
            match self.stream.current().kind {
                TokenKind::LParen => node = self.parse_call(node)?,
                TokenKind::LBracket | TokenKind::Dot => node = self.parse_subscript(node)?,
                _ => break,
            }
        }
        Ok(node)
    }

    fn parse_call(&mut self, node: Expr) -> Result<Expr, SyntaxError> {
        let lineno = self.stream.expect(&TokenKind::LParen)?.lineno;
        let mut args = Vec::new();
        let mut kwargs: Vec<Keyword> = Vec::new();
        let mut dyn_args: Option<Box<Expr>> = None;
        let mut dyn_kwargs: Option<Box<Expr>> = None;
        let mut require_comma = false;

        macro_rules! ensure {
            ($cond:expr) => {
                if !($cond) {
                    return self.fail("invalid call arguments", self.stream.lineno());
                }
            };
        }

        while self.stream.current().kind != TokenKind::RParen {
            if require_comma {
                self.stream.expect(&TokenKind::Comma)?;
                if self.stream.current().kind == TokenKind::RParen {
                    break;
                }
            }
            let is_kwarg = self.stream.current().is_name_token()
                && self.stream.look()?.kind == TokenKind::Assign;
            if is_kwarg {
                ensure!(dyn_args.is_none() && dyn_kwargs.is_none());
                let (key, kw_lineno) = self.stream.expect_name()?;
                self.stream.expect(&TokenKind::Assign)?;
                let value = self.parse_expression()?;
                kwargs.push(Keyword {
                    key,
                    value,
                    lineno: kw_lineno,
                });
            } else if self.stream.skip_if(&TokenKind::Mul)? {
                ensure!(dyn_args.is_none() && dyn_kwargs.is_none());
                dyn_args = Some(Box::new(self.parse_expression()?));
            } else if self.stream.skip_if(&TokenKind::Pow)? {
                ensure!(dyn_kwargs.is_none());
                dyn_kwargs = Some(Box::new(self.parse_expression()?));
            } else {
                ensure!(dyn_args.is_none() && dyn_kwargs.is_none());
                ensure!(kwargs.is_empty());
                args.push(self.parse_expression()?);
            }
            require_comma = true;
        }
        self.stream.expect(&TokenKind::RParen)?;
        Ok(Expr::Call {
            node: Box::new(node),
            args,
            kwargs,
            dyn_args,
            dyn_kwargs,
            lineno,
        })
    }

    fn parse_subscript(&mut self, node: Expr) -> Result<Expr, SyntaxError> {
        let token = self.stream.next()?;
        match token.kind {
            TokenKind::Dot => {
                let (attr, _) = self.stream.expect_name()?;
                Ok(Expr::Getattr {
                    node: Box::new(node),
                    attr,
                    lineno: token.lineno,
                })
            }
            TokenKind::LBracket => {
                let arg = self.parse_subscribed()?;
                self.stream.expect(&TokenKind::RBracket)?;
                Ok(Expr::Getitem {
                    node: Box::new(node),
                    arg: Box::new(arg),
                    lineno: token.lineno,
                })
            }
            other => self.fail(
                format!("expected subscript, got {}", other.describe()),
                token.lineno,
            ),
        }
    }

    /// The bracketed part of a subscript: either one index expression or
    /// a slice of up to three colon-separated components where omitted
    /// components stay `None`.
    fn parse_subscribed(&mut self) -> Result<Expr, SyntaxError> {
        let lineno = self.stream.lineno();
        let mut args: Vec<Option<Expr>> = Vec::new();
        let mut pending = true;
        while self.stream.current().kind != TokenKind::RBracket {
            if self.stream.current().kind == TokenKind::Colon {
                self.stream.next()?;
                if pending {
                    args.push(None);
                }
                pending = true;
                continue;
            }
            args.push(Some(self.parse_expression()?));
            pending = false;
        }
        if pending && !args.is_empty() {
            args.push(None);
        }

        if args.is_empty() {
            return self.fail("empty subscript", lineno);
        }
        if args.len() == 1 {
            if let Some(expr) = args.pop().flatten() {
                return Ok(expr);
            }
            return self.fail("empty subscript", lineno);
        }
        if args.len() > 3 {
            return self.fail("too many slice components", lineno);
        }
        let mut parts = args.into_iter();
        let start = parts.next().flatten().map(Box::new);
        let stop = parts.next().flatten().map(Box::new);
        let step = parts.next().flatten().map(Box::new);
        Ok(Expr::Slice {
            start,
            stop,
            step,
            lineno,
        })
    }
}
