use std::fmt;

use thiserror::Error as ThisError;

/// Compile-stage failure: tokenizer or parser rejected the template.
///
/// Carries the source line the failure was detected on and, once the
/// template has been registered with an environment, the template name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub message: String,
    pub lineno: usize,
    pub name: Option<String>,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, lineno: usize) -> Self {
        SyntaxError {
            message: message.into(),
            lineno,
            name: None,
        }
    }

    pub(crate) fn with_name(mut self, name: Option<&str>) -> Self {
        if self.name.is_none() {
            self.name = name.map(str::to_owned);
        }
        self
    }
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n  ", self.message)?;
        match &self.name {
            Some(name) => write!(f, "File \"{}\", line {}", name, self.lineno),
            None => write!(f, "line {}", self.lineno),
        }
    }
}

impl std::error::Error for SyntaxError {}

/// Any failure the engine can report: one syntax error while compiling,
/// or one runtime error while rendering. There is no recovery mode; the
/// first error aborts the operation in progress.
#[derive(Debug, Clone, PartialEq, ThisError)]
pub enum Error {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    /// An operation was attempted on an undefined value.
    #[error("{0}")]
    Undefined(String),
    /// Any other render-time failure (bad operand types, division by
    /// zero, unpack mismatch, ...).
    #[error("{0}")]
    Runtime(String),
}
