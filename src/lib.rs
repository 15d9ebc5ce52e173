//! tinja: a small Jinja-style template engine.
//!
//! Templates compile through a full pipeline: tokenizer, recursive-descent
//! parser, scope analysis, and code generation into an in-memory program
//! that renders against caller-provided variables.
//!
//! Supported subset:
//! - Literals, `{{ expression }}` interpolation, `{# comments #}`.
//! - `{% if %}` / `{% elif %}` / `{% else %}`.
//! - `{% for x in xs %}` with tuple targets, an inline `if` filter, and
//!   an `{% else %}` branch for empty iterations.
//! - `{% with a = expr %}` scoped bindings.
//! - `{% block name %}` as independently renderable regions.
//! - Python-flavored expressions: arithmetic, chained comparisons,
//!   `in` / `not in`, slicing, attribute and item access.
//!
//! Not supported:
//! - Template inheritance (`{% extends %}` parses but renders nothing).
//! - Filters (`| upper`), macros, and `{% set %}`.
//! - Callable values; call syntax parses and always fails at render.
//!
//! Missing names are lazy: touching an undefined value raises only when
//! it is used in output, arithmetic, iteration, or lookup, so
//! `{% if maybe %}` and `{{ missing == other }}` are always safe.
//!
//! Output semantics:
//! - Template text between tags is reproduced byte for byte; the engine
//!   never normalizes or injects newlines.
//! - With `autoescape` enabled, interpolated values are HTML-escaped;
//!   literal template text never is.

mod ast;
mod compiler;
mod error;
mod lexer;
mod parser;
mod runtime;
mod symbols;
mod value;

use std::collections::HashMap;

use compiler::Program;
use runtime::Vm;

pub use error::{Error, SyntaxError};
pub use runtime::Context;
pub use value::{Undefined, Value};

type AttrHook = Box<dyn Fn(&Value, &str) -> Option<Value> + Send + Sync>;
type ItemHook = Box<dyn Fn(&Value, &Value) -> Option<Value> + Send + Sync>;

/// Compilation and rendering policy: the autoescape switch and the
/// pluggable attribute/item accessors every `obj.attr` and `obj[key]`
/// in a template goes through.
pub struct Environment {
    pub autoescape: bool,
    getattr: AttrHook,
    getitem: ItemHook,
}

impl Default for Environment {
    fn default() -> Self {
        Environment::new()
    }
}

impl Environment {
    pub fn new() -> Self {
        Environment {
            autoescape: false,
            getattr: Box::new(default_getattr),
            getitem: Box::new(default_getitem),
        }
    }

    pub fn with_autoescape(autoescape: bool) -> Self {
        Environment {
            autoescape,
            ..Environment::new()
        }
    }

    /// Replace the attribute accessor. Returning `None` yields an
    /// undefined value instead of an error, so a template can probe
    /// optional attributes.
    pub fn set_getattr<F>(&mut self, hook: F)
    where
        F: Fn(&Value, &str) -> Option<Value> + Send + Sync + 'static,
    {
        self.getattr = Box::new(hook);
    }

    /// Replace the item accessor; same contract as [`set_getattr`].
    ///
    /// [`set_getattr`]: Environment::set_getattr
    pub fn set_getitem<F>(&mut self, hook: F)
    where
        F: Fn(&Value, &Value) -> Option<Value> + Send + Sync + 'static,
    {
        self.getitem = Box::new(hook);
    }

    pub fn compile(&self, source: &str) -> Result<Template<'_>, Error> {
        self.compile_named(source, None)
    }

    /// Compile with a template name; the name shows up in syntax error
    /// messages and is carried into the render context.
    pub fn compile_named(
        &self,
        source: &str,
        name: Option<&str>,
    ) -> Result<Template<'_>, Error> {
        let compile = || -> Result<Program, SyntaxError> {
            let template = parser::parse(source)?;
            compiler::generate(&template, name, self.autoescape)
        };
        let program = compile().map_err(|err| err.with_name(name))?;
        Ok(Template { env: self, program })
    }

    pub(crate) fn attr(&self, base: &Value, attr: &str) -> Option<Value> {
        (self.getattr)(base, attr)
    }

    pub(crate) fn item(&self, base: &Value, key: &Value) -> Option<Value> {
        (self.getitem)(base, key)
    }
}

/// Attribute access falls back to item lookup with a string key, so map
/// entries read naturally as `user.name`.
fn default_getattr(base: &Value, attr: &str) -> Option<Value> {
    value::getitem(base, &Value::Str(attr.to_owned()))
}

fn default_getitem(base: &Value, key: &Value) -> Option<Value> {
    value::getitem(base, key)
}

/// A compiled template, tied to the environment that compiled it.
pub struct Template<'env> {
    env: &'env Environment,
    program: Program,
}

impl<'env> Template<'env> {
    pub fn name(&self) -> Option<&str> {
        self.program.name.as_deref()
    }

    /// Render the whole template against the given variables.
    pub fn render(&self, vars: HashMap<String, Value>) -> Result<String, Error> {
        let ctx = Context::new(vars, self.program.name.clone());
        Vm::new(&self.program, self.env, &ctx).render()
    }

    /// Render a single `{% block %}` in isolation. The block sees only
    /// the passed variables; enclosing scopes do not leak in.
    pub fn render_block(
        &self,
        name: &str,
        vars: HashMap<String, Value>,
    ) -> Result<String, Error> {
        let ctx = Context::new(vars, self.program.name.clone());
        Vm::new(&self.program, self.env, &ctx).render_block(name)
    }

    pub fn block_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.program.blocks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// One-shot convenience: compile with a default environment and render.
pub fn render(source: &str, vars: HashMap<String, Value>) -> Result<String, Error> {
    Environment::new().compile(source)?.render(vars)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn literal_text_is_reproduced_byte_for_byte() {
        let source = "line one\n  indented\n\ttabbed\ntrailing newline\n";
        assert_eq!(render(source, HashMap::new()).unwrap(), source);
    }

    #[test]
    fn expression_interpolation() {
        assert_eq!(render("{{ 1 + 2 }}", HashMap::new()).unwrap(), "3");
        assert_eq!(
            render("{{ greeting }}", vars(&[("greeting", Value::from("hi"))])).unwrap(),
            "hi"
        );
    }

    #[test]
    fn syntax_errors_carry_the_template_name() {
        let env = Environment::new();
        let err = env
            .compile_named("{{ x", Some("page.html"))
            .err()
            .expect("compile should fail");
        let message = err.to_string();
        assert!(message.contains("page.html"), "got: {}", message);
    }

    #[test]
    fn autoescape_applies_to_values_not_template_text() {
        let env = Environment::with_autoescape(true);
        let tpl = env.compile("<b>{{ v }}</b>").unwrap();
        let out = tpl.render(vars(&[("v", Value::from("<i>"))])).unwrap();
        assert_eq!(out, "<b>&lt;i&gt;</b>");

        let env = Environment::new();
        let tpl = env.compile("<b>{{ v }}</b>").unwrap();
        let out = tpl.render(vars(&[("v", Value::from("<i>"))])).unwrap();
        assert_eq!(out, "<b><i></b>");
    }

    #[test]
    fn custom_attribute_hook() {
        let mut env = Environment::new();
        env.set_getattr(|_base, attr| {
            if attr == "shouty" {
                Some(Value::from("LOUD"))
            } else {
                None
            }
        });
        let tpl = env.compile("{{ thing.shouty }}").unwrap();
        let out = tpl
            .render(vars(&[("thing", Value::Map(vec![]))]))
            .unwrap();
        assert_eq!(out, "LOUD");
    }

    #[test]
    fn block_rendering_in_isolation() {
        let env = Environment::new();
        let tpl = env
            .compile("header {% block body %}{{ text }}{% endblock %} footer")
            .unwrap();
        assert_eq!(tpl.block_names(), vec!["body"]);
        assert_eq!(
            tpl.render(vars(&[("text", Value::from("x"))])).unwrap(),
            "header x footer"
        );
        assert_eq!(
            tpl.render_block("body", vars(&[("text", Value::from("only"))]))
                .unwrap(),
            "only"
        );
        assert!(tpl.render_block("missing", HashMap::new()).is_err());
    }
}
