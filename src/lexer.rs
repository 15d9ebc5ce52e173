//! Tokenizer and token stream.
//!
//! The tokenizer is a pull-based scanner with a mode stack: `root` mode
//! splits raw template text from tag delimiters, `block`/`variable` modes
//! share one tag grammar, and `comment` mode swallows everything up to
//! the closing delimiter. Whitespace and comments never reach the parser.

use crate::error::SyntaxError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Raw template text between tags.
    Data(String),
    BlockBegin,
    BlockEnd,
    VariableBegin,
    VariableEnd,

    Name(String),
    Str(String),
    Int(i64),
    Float(f64),

    // operators, longest match first when scanning
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Pow,
    Mod,
    Eq,
    Ne,
    Gt,
    GtEq,
    Lt,
    LtEq,
    Assign,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Colon,
    Semicolon,
    Dot,
    Tilde,
    Pipe,
    Comma,

    Eof,
}

impl TokenKind {
    /// Human-readable form for expected/actual diagnostics.
    pub fn describe(&self) -> &'static str {
        match self {
            TokenKind::Data(_) => "template data",
            TokenKind::BlockBegin => "'{%'",
            TokenKind::BlockEnd => "'%}'",
            TokenKind::VariableBegin => "'{{'",
            TokenKind::VariableEnd => "'}}'",
            TokenKind::Name(_) => "name",
            TokenKind::Str(_) => "string",
            TokenKind::Int(_) => "integer",
            TokenKind::Float(_) => "float",
            TokenKind::Add => "'+'",
            TokenKind::Sub => "'-'",
            TokenKind::Mul => "'*'",
            TokenKind::Div => "'/'",
            TokenKind::FloorDiv => "'//'",
            TokenKind::Pow => "'**'",
            TokenKind::Mod => "'%'",
            TokenKind::Eq => "'=='",
            TokenKind::Ne => "'!='",
            TokenKind::Gt => "'>'",
            TokenKind::GtEq => "'>='",
            TokenKind::Lt => "'<'",
            TokenKind::LtEq => "'<='",
            TokenKind::Assign => "'='",
            TokenKind::LParen => "'('",
            TokenKind::RParen => "')'",
            TokenKind::LBracket => "'['",
            TokenKind::RBracket => "']'",
            TokenKind::LBrace => "'{'",
            TokenKind::RBrace => "'}'",
            TokenKind::Colon => "':'",
            TokenKind::Semicolon => "';'",
            TokenKind::Dot => "'.'",
            TokenKind::Tilde => "'~'",
            TokenKind::Pipe => "'|'",
            TokenKind::Comma => "','",
            TokenKind::Eof => "end of template",
        }
    }

    fn same_kind(&self, other: &TokenKind) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub lineno: usize,
    pub kind: TokenKind,
}

impl Token {
    pub fn is_name(&self, value: &str) -> bool {
        matches!(&self.kind, TokenKind::Name(n) if n == value)
    }

    pub fn is_name_token(&self) -> bool {
        matches!(self.kind, TokenKind::Name(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Root,
    Block,
    Variable,
    Comment,
}

/// Produces one token per call. Single forward pass; restarting means
/// building a new tokenizer.
pub struct Tokenizer<'a> {
    source: &'a str,
    pos: usize,
    lineno: usize,
    modes: Vec<Mode>,
    /// Expected closing brackets for currently open `(`, `[`, `{`.
    /// While non-empty, tag-closing delimiters are re-scanned as plain
    /// operators so `}}` inside a dict literal does not end the tag.
    brackets: Vec<char>,
}

impl<'a> Tokenizer<'a> {
    pub fn new(source: &'a str) -> Self {
        Tokenizer {
            source,
            pos: 0,
            lineno: 1,
            modes: vec![Mode::Root],
            brackets: Vec::new(),
        }
    }

    fn rest(&self) -> &'a str {
        &self.source[self.pos..]
    }

    fn advance(&mut self, n: usize) {
        self.lineno += self.source[self.pos..self.pos + n].matches('\n').count();
        self.pos += n;
    }

    fn token(&self, kind: TokenKind) -> Token {
        Token {
            lineno: self.lineno,
            kind,
        }
    }

    fn err(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(message, self.lineno)
    }

    /// Next parser-visible token, or `None` at end of input.
    pub fn next_token(&mut self) -> Result<Option<Token>, SyntaxError> {
        loop {
            match self.modes.last().copied().unwrap_or(Mode::Root) {
                Mode::Root => {
                    if let Some(token) = self.tokenize_root()? {
                        return Ok(Some(token));
                    }
                    // either end of input, or a comment opener was
                    // consumed and left its mode on the stack
                    if !matches!(self.modes.last(), Some(Mode::Comment)) {
                        return Ok(None);
                    }
                }
                Mode::Comment => self.tokenize_comment()?,
                Mode::Block | Mode::Variable => return self.tokenize_tag(),
            }
        }
    }

    fn tokenize_root(&mut self) -> Result<Option<Token>, SyntaxError> {
        let rest = self.rest();
        if rest.is_empty() {
            return Ok(None);
        }
        let next_tag = [
            (rest.find("{%"), Mode::Block),
            (rest.find("{#"), Mode::Comment),
            (rest.find("{{"), Mode::Variable),
        ]
        .into_iter()
        .filter_map(|(idx, mode)| idx.map(|i| (i, mode)))
        .min_by_key(|(i, _)| *i);

        match next_tag {
            Some((0, mode)) => {
                self.modes.push(mode);
                self.advance(2);
                match mode {
                    Mode::Block => Ok(Some(self.token(TokenKind::BlockBegin))),
                    Mode::Variable => Ok(Some(self.token(TokenKind::VariableBegin))),
                    // nothing to emit; next_token() drops the comment
                    // body and comes back around
                    Mode::Comment | Mode::Root => Ok(None),
                }
            }
            Some((idx, _)) => {
                let text = rest[..idx].to_owned();
                let token = self.token(TokenKind::Data(text));
                self.advance(idx);
                Ok(Some(token))
            }
            None => {
                let token = self.token(TokenKind::Data(rest.to_owned()));
                self.advance(rest.len());
                Ok(Some(token))
            }
        }
    }

    fn tokenize_comment(&mut self) -> Result<(), SyntaxError> {
        match self.rest().find("#}") {
            Some(idx) => {
                self.advance(idx + 2);
                self.modes.pop();
                Ok(())
            }
            None => Err(self.err("unterminated comment, expected '#}'")),
        }
    }

    fn tokenize_tag(&mut self) -> Result<Option<Token>, SyntaxError> {
        let trimmed = self.rest().trim_start();
        let skipped = self.rest().len() - trimmed.len();
        self.advance(skipped);

        let rest = self.rest();
        if rest.is_empty() {
            return Ok(None);
        }

        let mode = *self.modes.last().unwrap_or(&Mode::Root);
        if self.brackets.is_empty() {
            if mode == Mode::Block && rest.starts_with("%}") {
                self.modes.pop();
                let token = self.token(TokenKind::BlockEnd);
                self.advance(2);
                return Ok(Some(token));
            }
            if mode == Mode::Variable && rest.starts_with("}}") {
                self.modes.pop();
                let token = self.token(TokenKind::VariableEnd);
                self.advance(2);
                return Ok(Some(token));
            }
        }

        let first = match rest.chars().next() {
            Some(c) => c,
            None => return Ok(None),
        };

        if first.is_ascii_alphabetic() || first == '_' {
            return self.tokenize_name().map(Some);
        }
        if first == '\'' || first == '"' {
            return self.tokenize_string(first).map(Some);
        }
        if first.is_ascii_digit() {
            return self.tokenize_number().map(Some);
        }
        self.tokenize_operator().map(Some)
    }

    fn tokenize_name(&mut self) -> Result<Token, SyntaxError> {
        let end = self
            .rest()
            .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .unwrap_or(self.rest().len());
        let token = self.token(TokenKind::Name(self.rest()[..end].to_owned()));
        self.advance(end);
        Ok(token)
    }

    fn tokenize_string(&mut self, quote: char) -> Result<Token, SyntaxError> {
        let lineno = self.lineno;
        let mut value = String::new();
        let mut consumed = 1;
        let mut chars = self.rest()[1..].chars();
        loop {
            let c = match chars.next() {
                Some(c) => c,
                None => return Err(SyntaxError::new("unterminated string", lineno)),
            };
            consumed += c.len_utf8();
            if c == quote {
                break;
            }
            if c == '\\' {
                let esc = match chars.next() {
                    Some(e) => e,
                    None => return Err(SyntaxError::new("unterminated string", lineno)),
                };
                consumed += esc.len_utf8();
                match esc {
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    'r' => value.push('\r'),
                    other => value.push(other),
                }
            } else {
                value.push(c);
            }
        }
        self.advance(consumed);
        Ok(Token {
            lineno,
            kind: TokenKind::Str(value),
        })
    }

    fn tokenize_number(&mut self) -> Result<Token, SyntaxError> {
        let rest = self.rest();
        let digits = |s: &str| s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let int_len = digits(rest);
        // float literals are digits '.' digits, unless the run directly
        // follows another '.', as in a chained subscript
        let preceded_by_dot = self.pos > 0 && self.source.as_bytes()[self.pos - 1] == b'.';
        if !preceded_by_dot && rest[int_len..].starts_with('.') {
            let frac_len = digits(&rest[int_len + 1..]);
            if frac_len > 0 {
                let text = &rest[..int_len + 1 + frac_len];
                let value: f64 = text
                    .parse()
                    .map_err(|_| self.err(format!("invalid float literal {}", text)))?;
                let token = self.token(TokenKind::Float(value));
                self.advance(text.len());
                return Ok(token);
            }
        }
        let text = &rest[..int_len];
        let value: i64 = text
            .parse()
            .map_err(|_| self.err(format!("invalid integer literal {}", text)))?;
        let token = self.token(TokenKind::Int(value));
        self.advance(int_len);
        Ok(token)
    }

    fn tokenize_operator(&mut self) -> Result<Token, SyntaxError> {
        let rest = self.rest();
        let two = rest.get(..2);
        let (kind, len) = match two {
            Some("//") => (TokenKind::FloorDiv, 2),
            Some("**") => (TokenKind::Pow, 2),
            Some("==") => (TokenKind::Eq, 2),
            Some("!=") => (TokenKind::Ne, 2),
            Some(">=") => (TokenKind::GtEq, 2),
            Some("<=") => (TokenKind::LtEq, 2),
            _ => {
                let c = rest.chars().next().unwrap_or('\0');
                let kind = match c {
                    '+' => TokenKind::Add,
                    '-' => TokenKind::Sub,
                    '*' => TokenKind::Mul,
                    '/' => TokenKind::Div,
                    '%' => TokenKind::Mod,
                    '=' => TokenKind::Assign,
                    '>' => TokenKind::Gt,
                    '<' => TokenKind::Lt,
                    '(' => TokenKind::LParen,
                    ')' => TokenKind::RParen,
                    '[' => TokenKind::LBracket,
                    ']' => TokenKind::RBracket,
                    '{' => TokenKind::LBrace,
                    '}' => TokenKind::RBrace,
                    ':' => TokenKind::Colon,
                    ';' => TokenKind::Semicolon,
                    '.' => TokenKind::Dot,
                    '~' => TokenKind::Tilde,
                    '|' => TokenKind::Pipe,
                    ',' => TokenKind::Comma,
                    other => {
                        return Err(self.err(format!("unexpected character '{}'", other)))
                    }
                };
                (kind, c.len_utf8())
            }
        };

        match kind {
            TokenKind::LParen => self.brackets.push(')'),
            TokenKind::LBracket => self.brackets.push(']'),
            TokenKind::LBrace => self.brackets.push('}'),
            TokenKind::RParen | TokenKind::RBracket | TokenKind::RBrace => {
                let ch = match kind {
                    TokenKind::RParen => ')',
                    TokenKind::RBracket => ']',
                    _ => '}',
                };
                match self.brackets.pop() {
                    None => return Err(self.err(format!("unexpected character '{}'", ch))),
                    Some(expected) if expected != ch => {
                        return Err(
                            self.err(format!("expected '{}' instead of '{}'", expected, ch))
                        )
                    }
                    Some(_) => {}
                }
            }
            _ => {}
        }

        let token = self.token(kind);
        self.advance(len);
        Ok(token)
    }
}

/// One-token-lookahead cursor over the tokenizer. `current` is always the
/// not-yet-consumed token; consuming past the last token closes the
/// stream, and a closed stream yields the end marker forever after.
pub struct TokenStream<'a> {
    tokenizer: Tokenizer<'a>,
    current: Token,
    peeked: Option<Token>,
    closed: bool,
}

impl<'a> TokenStream<'a> {
    pub fn new(source: &'a str) -> Result<Self, SyntaxError> {
        let mut tokenizer = Tokenizer::new(source);
        let (current, closed) = match tokenizer.next_token()? {
            Some(token) => (token, false),
            None => (
                Token {
                    lineno: 1,
                    kind: TokenKind::Eof,
                },
                true,
            ),
        };
        Ok(TokenStream {
            tokenizer,
            current,
            peeked: None,
            closed,
        })
    }

    pub fn current(&self) -> &Token {
        &self.current
    }

    pub fn lineno(&self) -> usize {
        self.current.lineno
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns the current token and moves on to the next one.
    pub fn next(&mut self) -> Result<Token, SyntaxError> {
        if self.closed {
            return Ok(self.current.clone());
        }
        let pulled = match self.peeked.take() {
            Some(token) => Some(token),
            None => self.tokenizer.next_token()?,
        };
        let rv = match pulled {
            Some(token) => std::mem::replace(&mut self.current, token),
            None => {
                self.closed = true;
                let lineno = self.current.lineno;
                std::mem::replace(
                    &mut self.current,
                    Token {
                        lineno,
                        kind: TokenKind::Eof,
                    },
                )
            }
        };
        Ok(rv)
    }

    /// Peek one token past `current` without consuming anything.
    pub fn look(&mut self) -> Result<&Token, SyntaxError> {
        if self.peeked.is_none() && !self.closed {
            self.peeked = match self.tokenizer.next_token()? {
                Some(token) => Some(token),
                None => Some(Token {
                    lineno: self.current.lineno,
                    kind: TokenKind::Eof,
                }),
            };
        }
        Ok(self.peeked.as_ref().unwrap_or(&self.current))
    }

    /// Asserts that the current token has the given kind (payloads are
    /// ignored), then advances past it.
    pub fn expect(&mut self, kind: &TokenKind) -> Result<Token, SyntaxError> {
        if !self.current.kind.same_kind(kind) {
            return Err(SyntaxError::new(
                format!(
                    "expected {}, got {}",
                    kind.describe(),
                    self.current.kind.describe()
                ),
                self.current.lineno,
            ));
        }
        self.next()
    }

    pub fn skip_if(&mut self, kind: &TokenKind) -> Result<bool, SyntaxError> {
        if self.current.kind.same_kind(kind) {
            self.next()?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn expect_name(&mut self) -> Result<(String, usize), SyntaxError> {
        match &self.current.kind {
            TokenKind::Name(name) => {
                let rv = (name.clone(), self.current.lineno);
                self.next()?;
                Ok(rv)
            }
            other => Err(SyntaxError::new(
                format!("expected name, got {}", other.describe()),
                self.current.lineno,
            )),
        }
    }

    pub fn expect_keyword(&mut self, keyword: &str) -> Result<usize, SyntaxError> {
        if self.current.is_name(keyword) {
            let lineno = self.current.lineno;
            self.next()?;
            return Ok(lineno);
        }
        Err(SyntaxError::new(
            format!(
                "expected '{}', got {}",
                keyword,
                self.current.kind.describe()
            ),
            self.current.lineno,
        ))
    }

    pub fn skip_if_keyword(&mut self, keyword: &str) -> Result<bool, SyntaxError> {
        if self.current.is_name(keyword) {
            self.next()?;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_tokens(source: &str) -> Vec<TokenKind> {
        let mut tokenizer = Tokenizer::new(source);
        let mut kinds = Vec::new();
        while let Some(token) = tokenizer.next_token().unwrap() {
            kinds.push(token.kind);
        }
        kinds
    }

    #[test]
    fn plain_text_is_one_data_token() {
        assert_eq!(
            all_tokens("hello\nworld"),
            vec![TokenKind::Data("hello\nworld".into())]
        );
    }

    #[test]
    fn variable_tag_with_expression() {
        assert_eq!(
            all_tokens("a{{ x + 1 }}b"),
            vec![
                TokenKind::Data("a".into()),
                TokenKind::VariableBegin,
                TokenKind::Name("x".into()),
                TokenKind::Add,
                TokenKind::Int(1),
                TokenKind::VariableEnd,
                TokenKind::Data("b".into()),
            ]
        );
    }

    #[test]
    fn comments_are_dropped_entirely() {
        assert_eq!(
            all_tokens("a{# anything {% not a tag %} #}b"),
            vec![TokenKind::Data("a".into()), TokenKind::Data("b".into())]
        );
    }

    #[test]
    fn unterminated_comment_is_an_error() {
        let mut tokenizer = Tokenizer::new("x{# oops");
        tokenizer.next_token().unwrap();
        assert!(tokenizer.next_token().is_err());
    }

    #[test]
    fn close_delimiter_inside_brackets_is_not_a_close() {
        assert_eq!(
            all_tokens("{{ {1: 2}}}"),
            vec![
                TokenKind::VariableBegin,
                TokenKind::LBrace,
                TokenKind::Int(1),
                TokenKind::Colon,
                TokenKind::Int(2),
                TokenKind::RBrace,
                TokenKind::VariableEnd,
            ]
        );
    }

    #[test]
    fn bracket_mismatch_names_expected_character() {
        let mut tokenizer = Tokenizer::new("{{ (a] }}");
        let mut err = None;
        loop {
            match tokenizer.next_token() {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(e) => {
                    err = Some(e);
                    break;
                }
            }
        }
        let err = err.expect("expected a syntax error");
        assert!(err.message.contains("expected ')'"));
    }

    #[test]
    fn float_and_integer_literals() {
        assert_eq!(
            all_tokens("{{ 1.5 + 2 }}"),
            vec![
                TokenKind::VariableBegin,
                TokenKind::Float(1.5),
                TokenKind::Add,
                TokenKind::Int(2),
                TokenKind::VariableEnd,
            ]
        );
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            all_tokens(r#"{{ 'a\n\'b' }}"#),
            vec![
                TokenKind::VariableBegin,
                TokenKind::Str("a\n'b".into()),
                TokenKind::VariableEnd,
            ]
        );
    }

    #[test]
    fn line_numbers_track_newlines() {
        let mut tokenizer = Tokenizer::new("a\nb\n{{\n x }}");
        let data = tokenizer.next_token().unwrap().unwrap();
        assert_eq!(data.lineno, 1);
        let begin = tokenizer.next_token().unwrap().unwrap();
        assert_eq!(begin.lineno, 3);
        let name = tokenizer.next_token().unwrap().unwrap();
        assert_eq!(name.lineno, 4);
        assert_eq!(name.kind, TokenKind::Name("x".into()));
    }

    #[test]
    fn stream_closes_into_persistent_eof() {
        let mut stream = TokenStream::new("x").unwrap();
        assert_eq!(stream.current().kind, TokenKind::Data("x".into()));
        stream.next().unwrap();
        assert!(stream.is_closed());
        assert_eq!(stream.current().kind, TokenKind::Eof);
        assert_eq!(stream.next().unwrap().kind, TokenKind::Eof);
        assert_eq!(stream.next().unwrap().kind, TokenKind::Eof);
    }

    #[test]
    fn stream_look_does_not_consume() {
        let mut stream = TokenStream::new("{{ a = }}").unwrap();
        stream.next().unwrap(); // variable begin
        assert!(stream.current().is_name("a"));
        assert_eq!(stream.look().unwrap().kind, TokenKind::Assign);
        assert!(stream.current().is_name("a"));
        stream.next().unwrap();
        assert_eq!(stream.current().kind, TokenKind::Assign);
    }
}
