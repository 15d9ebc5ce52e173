//! Scope analysis. Before code generation every scope-introducing
//! construct gets a frame, and each frame records which names it declares
//! as parameters and which it must resolve from the render context. Names
//! are qualified by the nesting level of the frame that declared them, so
//! an inner `x` never clobbers an outer `x`.

use std::collections::BTreeMap;

use crate::ast::{Expr, IfClause, NameCtx, Stmt};
use crate::error::SyntaxError;

/// Index into the frame arena.
pub type FrameId = usize;

/// How an identifier gets its value when its frame is entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Load {
    /// Bound by the construct itself (loop target, with target); nothing
    /// to do on entry.
    Param,
    /// Looked up in the render context under the carried source name.
    Resolve(String),
}

#[derive(Debug, Default)]
struct FrameData {
    parent: Option<FrameId>,
    level: usize,
    /// source name -> level-qualified identifier
    refs: BTreeMap<String, String>,
    /// level-qualified identifier -> how it is loaded
    loads: BTreeMap<String, Load>,
}

/// Arena of scope frames for one compiled routine. Frames refer to their
/// parents by index, so derived frames can outlive the borrow that
/// created them.
#[derive(Debug, Default)]
pub struct Symbols {
    frames: Vec<FrameData>,
}

impl Symbols {
    pub fn new() -> Self {
        Symbols::default()
    }

    pub fn root(&mut self) -> FrameId {
        self.frames.push(FrameData::default());
        self.frames.len() - 1
    }

    pub fn derived(&mut self, parent: FrameId) -> FrameId {
        let level = self.frames[parent].level + 1;
        self.frames.push(FrameData {
            parent: Some(parent),
            level,
            ..FrameData::default()
        });
        self.frames.len() - 1
    }

    /// The loads declared directly on `frame`, in identifier order.
    pub fn loads(&self, frame: FrameId) -> impl Iterator<Item = (&str, &Load)> {
        self.frames[frame]
            .loads
            .iter()
            .map(|(ident, load)| (ident.as_str(), load))
    }

    pub fn find_ref(&self, frame: FrameId, name: &str) -> Option<&str> {
        let mut current = Some(frame);
        while let Some(id) = current {
            if let Some(ident) = self.frames[id].refs.get(name) {
                return Some(ident);
            }
            current = self.frames[id].parent;
        }
        None
    }

    /// The identifier a name resolves to in `frame`. Analysis has seen
    /// every name before generation asks for it, so a miss is a bug in
    /// the analyzer, reported rather than ignored.
    pub fn ref_ident(
        &self,
        frame: FrameId,
        name: &str,
        lineno: usize,
    ) -> Result<String, SyntaxError> {
        match self.find_ref(frame, name) {
            Some(ident) => Ok(ident.to_owned()),
            None => Err(SyntaxError::new(
                format!("name '{}' was not declared in any enclosing scope", name),
                lineno,
            )),
        }
    }

    pub fn find_load(&self, frame: FrameId, ident: &str) -> Option<&Load> {
        let mut current = Some(frame);
        while let Some(id) = current {
            if let Some(load) = self.frames[id].loads.get(ident) {
                return Some(load);
            }
            current = self.frames[id].parent;
        }
        None
    }

    fn define_ref(&mut self, frame: FrameId, name: &str, load: Option<Load>) -> String {
        let ident = format!("l_{}_{}", self.frames[frame].level, name);
        self.frames[frame]
            .refs
            .insert(name.to_owned(), ident.clone());
        if let Some(load) = load {
            self.frames[frame].loads.insert(ident.clone(), load);
        }
        ident
    }

    fn load(&mut self, frame: FrameId, name: &str) {
        if self.find_ref(frame, name).is_none() {
            self.define_ref(frame, name, Some(Load::Resolve(name.to_owned())));
        }
    }

    fn declare_parameter(&mut self, frame: FrameId, name: &str) {
        self.define_ref(frame, name, Some(Load::Param));
    }

    /// Analyze a statement list as the body of `frame`. Constructs that
    /// open their own frame (`for`, `with`) only contribute the parts
    /// evaluated in the enclosing scope; `block` bodies contribute
    /// nothing at all.
    pub fn analyze_stmts(&mut self, frame: FrameId, body: &[Stmt]) {
        for stmt in body {
            self.visit_stmt(frame, stmt);
        }
    }

    /// Analyze the parts of a `for` statement that run inside the frame
    /// of the given branch: the loop target binds as a parameter in the
    /// body and test branches, never in the else branch.
    pub fn analyze_for_branch(
        &mut self,
        frame: FrameId,
        target: &Expr,
        test: Option<&Expr>,
        branch_body: &[Stmt],
        branch: ForBranch,
    ) {
        match branch {
            ForBranch::Body => {
                self.declare_target(frame, target);
                self.analyze_stmts(frame, branch_body);
            }
            ForBranch::Else => {
                self.analyze_stmts(frame, branch_body);
            }
            ForBranch::Test => {
                self.declare_target(frame, target);
                if let Some(test) = test {
                    self.visit_expr(frame, test);
                }
            }
        }
    }

    /// Analyze a `with` body frame: the targets become parameters, the
    /// bound values belong to the enclosing frame and are not visited
    /// here.
    pub fn analyze_with(&mut self, frame: FrameId, targets: &[Expr], body: &[Stmt]) {
        for target in targets {
            self.declare_target(frame, target);
        }
        self.analyze_stmts(frame, body);
    }

    fn declare_target(&mut self, frame: FrameId, target: &Expr) {
        match target {
            Expr::Name { name, .. } => self.declare_parameter(frame, name),
            Expr::Tuple { items, .. } => {
                for item in items {
                    self.declare_target(frame, item);
                }
            }
            _ => {}
        }
    }

    fn visit_stmt(&mut self, frame: FrameId, stmt: &Stmt) {
        match stmt {
            Stmt::Output { nodes, .. } => {
                for node in nodes {
                    self.visit_expr(frame, node);
                }
            }
            Stmt::If {
                test,
                body,
                elifs,
                else_body,
                ..
            } => {
                // all branches share the enclosing frame
                self.visit_expr(frame, test);
                self.analyze_stmts(frame, body);
                for IfClause { test, body, .. } in elifs {
                    self.visit_expr(frame, test);
                    self.analyze_stmts(frame, body);
                }
                self.analyze_stmts(frame, else_body);
            }
            // only the iterable is evaluated out here; target, test and
            // both bodies belong to the loop's own frames
            Stmt::For { iter, .. } => self.visit_expr(frame, iter),
            // same split for with: values out here, targets and body in
            // the inner frame
            Stmt::With { values, .. } => {
                for value in values {
                    self.visit_expr(frame, value);
                }
            }
            // blocks render in a frame of their own; traversal stops
            Stmt::Block { .. } => {}
            Stmt::Extends { template, .. } => self.visit_expr(frame, template),
        }
    }

    fn visit_expr(&mut self, frame: FrameId, expr: &Expr) {
        match expr {
            Expr::Name { name, ctx, .. } => match ctx {
                NameCtx::Load => self.load(frame, name),
                NameCtx::Param => self.declare_parameter(frame, name),
                NameCtx::Store => {}
            },
            Expr::TemplateData { .. } | Expr::Const { .. } => {}
            Expr::Tuple { items, .. } | Expr::List { items, .. } => {
                for item in items {
                    self.visit_expr(frame, item);
                }
            }
            Expr::Dict { items, .. } => {
                for pair in items {
                    self.visit_expr(frame, &pair.key);
                    self.visit_expr(frame, &pair.value);
                }
            }
            Expr::BinOp { left, right, .. } => {
                self.visit_expr(frame, left);
                self.visit_expr(frame, right);
            }
            Expr::UnaryOp { node, .. } => self.visit_expr(frame, node),
            Expr::Compare { expr, operands, .. } => {
                self.visit_expr(frame, expr);
                for operand in operands {
                    self.visit_expr(frame, &operand.expr);
                }
            }
            Expr::Call {
                node,
                args,
                kwargs,
                dyn_args,
                dyn_kwargs,
                ..
            } => {
                self.visit_expr(frame, node);
                for arg in args {
                    self.visit_expr(frame, arg);
                }
                for kwarg in kwargs {
                    self.visit_expr(frame, &kwarg.value);
                }
                if let Some(expr) = dyn_args {
                    self.visit_expr(frame, expr);
                }
                if let Some(expr) = dyn_kwargs {
                    self.visit_expr(frame, expr);
                }
            }
            Expr::Getattr { node, .. } => self.visit_expr(frame, node),
            Expr::Getitem { node, arg, .. } => {
                self.visit_expr(frame, node);
                self.visit_expr(frame, arg);
            }
            Expr::Slice {
                start, stop, step, ..
            } => {
                for part in [start, stop, step].into_iter().flatten() {
                    self.visit_expr(frame, part);
                }
            }
        }
    }
}

/// Which part of a `for` statement is being analyzed into a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForBranch {
    Body,
    Else,
    Test,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    fn parsed(source: &str) -> Vec<Stmt> {
        parser::parse(source).unwrap().body
    }

    #[test]
    fn loaded_names_resolve_at_their_level() {
        let body = parsed("{{ user }}");
        let mut symbols = Symbols::new();
        let root = symbols.root();
        symbols.analyze_stmts(root, &body);

        assert_eq!(symbols.find_ref(root, "user"), Some("l_0_user"));
        assert_eq!(
            symbols.find_load(root, "l_0_user"),
            Some(&Load::Resolve("user".into()))
        );
    }

    #[test]
    fn loop_target_is_a_parameter_of_the_loop_frame() {
        let body = parsed("{% for x in items %}{{ x }}{% endfor %}");
        let mut symbols = Symbols::new();
        let root = symbols.root();
        symbols.analyze_stmts(root, &body);
        // the iterable was analyzed in the outer frame
        assert_eq!(symbols.find_ref(root, "items"), Some("l_0_items"));
        assert_eq!(symbols.find_ref(root, "x"), None);

        let (target, test, loop_body) = match &body[0] {
            Stmt::For {
                target, test, body, ..
            } => (target, test.as_ref(), body),
            other => panic!("expected for, got {:?}", other),
        };
        let loop_frame = symbols.derived(root);
        symbols.analyze_for_branch(loop_frame, target, test, loop_body, ForBranch::Body);
        assert_eq!(symbols.find_ref(loop_frame, "x"), Some("l_1_x"));
        assert_eq!(symbols.find_load(loop_frame, "l_1_x"), Some(&Load::Param));
        // outer names stay visible through the parent link
        assert_eq!(symbols.find_ref(loop_frame, "items"), Some("l_0_items"));
    }

    #[test]
    fn else_branch_does_not_bind_the_target() {
        let body = parsed("{% for x in items %}a{% else %}{{ x }}{% endfor %}");
        let (target, test, else_body) = match &body[0] {
            Stmt::For {
                target,
                test,
                else_body,
                ..
            } => (target, test.as_ref(), else_body),
            other => panic!("expected for, got {:?}", other),
        };
        let mut symbols = Symbols::new();
        let root = symbols.root();
        symbols.analyze_stmts(root, &body);
        let else_frame = symbols.derived(root);
        symbols.analyze_for_branch(else_frame, target, test, else_body, ForBranch::Else);
        // `x` in the else branch is a plain context lookup
        assert_eq!(
            symbols.find_load(else_frame, "l_1_x"),
            Some(&Load::Resolve("x".into()))
        );
    }

    #[test]
    fn with_values_analyzed_outside_targets_inside() {
        let body = parsed("{% with a = b %}{{ a }}{% endwith %}");
        let (targets, with_body) = match &body[0] {
            Stmt::With { targets, body, .. } => (targets, body),
            other => panic!("expected with, got {:?}", other),
        };
        let mut symbols = Symbols::new();
        let root = symbols.root();
        symbols.analyze_stmts(root, &body);
        assert_eq!(symbols.find_ref(root, "b"), Some("l_0_b"));
        assert_eq!(symbols.find_ref(root, "a"), None);

        let with_frame = symbols.derived(root);
        symbols.analyze_with(with_frame, targets, with_body);
        assert_eq!(symbols.find_load(with_frame, "l_1_a"), Some(&Load::Param));
    }

    #[test]
    fn block_bodies_are_opaque_to_the_enclosing_frame() {
        let body = parsed("{% block b %}{{ hidden }}{% endblock %}");
        let mut symbols = Symbols::new();
        let root = symbols.root();
        symbols.analyze_stmts(root, &body);
        assert_eq!(symbols.find_ref(root, "hidden"), None);
    }

    #[test]
    fn shadowing_gets_a_distinct_identifier_per_level() {
        let mut symbols = Symbols::new();
        let root = symbols.root();
        symbols.load(root, "x");
        let inner = symbols.derived(root);
        symbols.declare_parameter(inner, "x");
        assert_eq!(symbols.find_ref(root, "x"), Some("l_0_x"));
        assert_eq!(symbols.find_ref(inner, "x"), Some("l_1_x"));
    }
}
