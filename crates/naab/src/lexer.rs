use std::fmt;

/// A lexing or parsing failure, located in the source buffer.
#[derive(Debug, Clone)]
pub struct SyntaxError {
    pub message: String,
    pub line: u32,
    pub col: u32,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, line: u32, col: u32) -> Self {
        Self {
            message: message.into(),
            line,
            col,
        }
    }
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}:{}", self.message, self.line, self.col)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    // keywords
    Let,
    Fn,
    Struct,
    New,
    If,
    Else,
    While,
    For,
    In,
    Break,
    Continue,
    Return,
    Try,
    Catch,
    Finally,
    Throw,
    Use,
    As,
    Export,
    True,
    False,
    Null,
    // punctuation and operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Assign,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    AndAnd,
    OrOr,
    Not,
    Pipe,
    PipeGt,
    DotDot,
    DotDotEq,
    Dot,
    Comma,
    Colon,
    Semicolon,
    Question,
    Arrow,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Newline,
    /// A whole inline polyglot block: `<<lang[a, b] …code… >>`.
    Polyglot {
        lang: String,
        bindings: Vec<String>,
        code: String,
    },
    Eof,
}

impl Tok {
    /// Short description used in "expected X, found Y" messages.
    pub fn describe(&self) -> String {
        match self {
            Self::Int(i) => format!("integer `{i}`"),
            Self::Float(f) => format!("float `{f}`"),
            Self::Str(_) => "string literal".to_owned(),
            Self::Ident(name) => format!("`{name}`"),
            Self::Newline => "end of line".to_owned(),
            Self::Eof => "end of input".to_owned(),
            Self::Polyglot { lang, .. } => format!("inline `{lang}` block"),
            other => format!("`{}`", other.symbol()),
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Self::Let => "let",
            Self::Fn => "fn",
            Self::Struct => "struct",
            Self::New => "new",
            Self::If => "if",
            Self::Else => "else",
            Self::While => "while",
            Self::For => "for",
            Self::In => "in",
            Self::Break => "break",
            Self::Continue => "continue",
            Self::Return => "return",
            Self::Try => "try",
            Self::Catch => "catch",
            Self::Finally => "finally",
            Self::Throw => "throw",
            Self::Use => "use",
            Self::As => "as",
            Self::Export => "export",
            Self::True => "true",
            Self::False => "false",
            Self::Null => "null",
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Star => "*",
            Self::Slash => "/",
            Self::Percent => "%",
            Self::Assign => "=",
            Self::EqEq => "==",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::AndAnd => "&&",
            Self::OrOr => "||",
            Self::Not => "!",
            Self::Pipe => "|",
            Self::PipeGt => "|>",
            Self::DotDot => "..",
            Self::DotDotEq => "..=",
            Self::Dot => ".",
            Self::Comma => ",",
            Self::Colon => ":",
            Self::Semicolon => ";",
            Self::Question => "?",
            Self::Arrow => "->",
            Self::LParen => "(",
            Self::RParen => ")",
            Self::LBrace => "{",
            Self::RBrace => "}",
            Self::LBracket => "[",
            Self::RBracket => "]",
            _ => "?",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Token {
    pub tok: Tok,
    pub line: u32,
    pub col: u32,
}

fn keyword(ident: &str) -> Option<Tok> {
    Some(match ident {
        "let" => Tok::Let,
        "fn" => Tok::Fn,
        "struct" => Tok::Struct,
        "new" => Tok::New,
        "if" => Tok::If,
        "else" => Tok::Else,
        "while" => Tok::While,
        "for" => Tok::For,
        "in" => Tok::In,
        "break" => Tok::Break,
        "continue" => Tok::Continue,
        "return" => Tok::Return,
        "try" => Tok::Try,
        "catch" => Tok::Catch,
        "finally" => Tok::Finally,
        "throw" => Tok::Throw,
        "use" => Tok::Use,
        "as" => Tok::As,
        "export" => Tok::Export,
        "true" => Tok::True,
        "false" => Tok::False,
        "null" => Tok::Null,
        _ => return None,
    })
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    col: u32,
    /// Paren/bracket nesting depth; newlines inside are not significant.
    group_depth: usize,
    tokens: Vec<Token>,
}

impl Lexer {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<char> {
        self.chars.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn push(&mut self, tok: Tok, line: u32, col: u32) {
        self.tokens.push(Token { tok, line, col });
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(message, self.line, self.col)
    }

    fn lex_string(&mut self) -> Result<Tok, SyntaxError> {
        let mut out = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => {
                    return Err(self.error("unterminated string literal"));
                }
                Some('"') => return Ok(Tok::Str(out)),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('\\') => out.push('\\'),
                    Some('"') => out.push('"'),
                    Some('0') => out.push('\0'),
                    Some(other) => {
                        return Err(self.error(format!("unknown escape `\\{other}`")));
                    }
                    None => return Err(self.error("unterminated string literal")),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn lex_number(&mut self, first: char) -> Result<Tok, SyntaxError> {
        let mut text = String::from(first);
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '_' {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        // a `.` only continues the number if followed by a digit, so that
        // `1..5` lexes as a range
        let mut is_float = false;
        if self.peek() == Some('.') && self.peek2().is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            text.push('.');
            self.bump();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() || c == '_' {
                    text.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
        }
        let text = text.replace('_', "");
        if is_float {
            text.parse::<f64>()
                .map(Tok::Float)
                .map_err(|_| self.error(format!("invalid float literal `{text}`")))
        } else {
            text.parse::<i64>()
                .map(Tok::Int)
                .map_err(|_| self.error(format!("integer literal `{text}` out of range")))
        }
    }

    /// Scans `<<lang[a, b] …code… >>` after the `<<` has been consumed.
    /// The body is everything up to the first `>>`, verbatim.
    fn lex_polyglot(&mut self) -> Result<Tok, SyntaxError> {
        let mut lang = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '+' || c == '#' {
                lang.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if lang.is_empty() {
            return Err(self.error("expected a language tag after `<<`"));
        }
        let mut bindings = Vec::new();
        if self.peek() == Some('[') {
            self.bump();
            loop {
                while self.peek() == Some(' ') || self.peek() == Some(',') {
                    self.bump();
                }
                match self.peek() {
                    Some(']') => {
                        self.bump();
                        break;
                    }
                    Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                        let mut name = String::new();
                        while let Some(c) = self.peek() {
                            if c.is_ascii_alphanumeric() || c == '_' {
                                name.push(c);
                                self.bump();
                            } else {
                                break;
                            }
                        }
                        bindings.push(name);
                    }
                    _ => return Err(self.error("malformed binding list in inline block")),
                }
            }
        }
        let mut code = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated inline block (missing `>>`)")),
                Some('>') if self.peek2() == Some('>') => {
                    self.bump();
                    self.bump();
                    return Ok(Tok::Polyglot {
                        lang,
                        bindings,
                        code,
                    });
                }
                Some(c) => {
                    code.push(c);
                    self.bump();
                }
            }
        }
    }

    fn run(&mut self) -> Result<(), SyntaxError> {
        while let Some(c) = self.peek() {
            let (line, col) = (self.line, self.col);
            match c {
                ' ' | '\t' | '\r' => {
                    self.bump();
                }
                '#' => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                '\n' => {
                    self.bump();
                    if self.group_depth == 0
                        && !matches!(
                            self.tokens.last().map(|t| &t.tok),
                            None | Some(Tok::Newline)
                        )
                    {
                        self.push(Tok::Newline, line, col);
                    }
                }
                '"' => {
                    self.bump();
                    let tok = self.lex_string()?;
                    self.push(tok, line, col);
                }
                '0'..='9' => {
                    self.bump();
                    let tok = self.lex_number(c)?;
                    self.push(tok, line, col);
                }
                c if c.is_ascii_alphabetic() || c == '_' => {
                    let mut ident = String::new();
                    while let Some(c) = self.peek() {
                        if c.is_ascii_alphanumeric() || c == '_' {
                            ident.push(c);
                            self.bump();
                        } else {
                            break;
                        }
                    }
                    let tok = keyword(&ident).unwrap_or(Tok::Ident(ident));
                    self.push(tok, line, col);
                }
                _ => {
                    self.bump();
                    let tok = match c {
                        '+' => Tok::Plus,
                        '-' => {
                            if self.peek() == Some('>') {
                                self.bump();
                                Tok::Arrow
                            } else {
                                Tok::Minus
                            }
                        }
                        '*' => Tok::Star,
                        '/' => Tok::Slash,
                        '%' => Tok::Percent,
                        '=' => {
                            if self.peek() == Some('=') {
                                self.bump();
                                Tok::EqEq
                            } else {
                                Tok::Assign
                            }
                        }
                        '!' => {
                            if self.peek() == Some('=') {
                                self.bump();
                                Tok::NotEq
                            } else {
                                Tok::Not
                            }
                        }
                        '<' => {
                            if self.peek() == Some('<') {
                                self.bump();
                                let tok = self.lex_polyglot()?;
                                self.push(tok, line, col);
                                continue;
                            } else if self.peek() == Some('=') {
                                self.bump();
                                Tok::LtEq
                            } else {
                                Tok::Lt
                            }
                        }
                        '>' => {
                            if self.peek() == Some('=') {
                                self.bump();
                                Tok::GtEq
                            } else {
                                Tok::Gt
                            }
                        }
                        '&' => {
                            if self.peek() == Some('&') {
                                self.bump();
                                Tok::AndAnd
                            } else {
                                return Err(self.error("unexpected `&` (did you mean `&&`?)"));
                            }
                        }
                        '|' => {
                            if self.peek() == Some('|') {
                                self.bump();
                                Tok::OrOr
                            } else if self.peek() == Some('>') {
                                self.bump();
                                Tok::PipeGt
                            } else {
                                Tok::Pipe
                            }
                        }
                        '.' => {
                            if self.peek() == Some('.') {
                                self.bump();
                                if self.peek() == Some('=') {
                                    self.bump();
                                    Tok::DotDotEq
                                } else {
                                    Tok::DotDot
                                }
                            } else {
                                Tok::Dot
                            }
                        }
                        ',' => Tok::Comma,
                        ':' => Tok::Colon,
                        ';' => Tok::Semicolon,
                        '?' => Tok::Question,
                        '(' => {
                            self.group_depth += 1;
                            Tok::LParen
                        }
                        ')' => {
                            self.group_depth = self.group_depth.saturating_sub(1);
                            Tok::RParen
                        }
                        '[' => {
                            self.group_depth += 1;
                            Tok::LBracket
                        }
                        ']' => {
                            self.group_depth = self.group_depth.saturating_sub(1);
                            Tok::RBracket
                        }
                        '{' => Tok::LBrace,
                        '}' => Tok::RBrace,
                        other => {
                            return Err(SyntaxError::new(
                                format!("unexpected character `{other}`"),
                                line,
                                col,
                            ));
                        }
                    };
                    self.push(tok, line, col);
                }
            }
        }
        let (line, col) = (self.line, self.col);
        self.push(Tok::Eof, line, col);
        Ok(())
    }
}

/// Tokenizes a source buffer.
///
/// Newlines are significant statement separators except inside parentheses
/// and brackets; comments run from `#` to end of line.
pub fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    let mut lexer = Lexer {
        chars: source.chars().collect(),
        pos: 0,
        line: 1,
        col: 1,
        group_depth: 0,
        tokens: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(source: &str) -> Vec<Tok> {
        tokenize(source).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn numbers_and_ranges() {
        assert_eq!(
            toks("1..=5"),
            vec![Tok::Int(1), Tok::DotDotEq, Tok::Int(5), Tok::Eof]
        );
        assert_eq!(
            toks("1.5 .. 2"),
            vec![Tok::Float(1.5), Tok::DotDot, Tok::Int(2), Tok::Eof]
        );
    }

    #[test]
    fn pipeline_and_union_tokens() {
        assert_eq!(
            toks("x |> f"),
            vec![
                Tok::Ident("x".into()),
                Tok::PipeGt,
                Tok::Ident("f".into()),
                Tok::Eof
            ]
        );
        assert_eq!(
            toks("int | string"),
            vec![
                Tok::Ident("int".into()),
                Tok::Pipe,
                Tok::Ident("string".into()),
                Tok::Eof
            ]
        );
    }

    #[test]
    fn polyglot_block_single_line() {
        let tokens = toks("let r = <<bash echo hi >>");
        assert!(matches!(
            &tokens[3],
            Tok::Polyglot { lang, bindings, code }
                if lang == "bash" && bindings.is_empty() && code == " echo hi "
        ));
    }

    #[test]
    fn polyglot_block_with_bindings() {
        let tokens = toks("<<python[a, b]\nprint(a + b)\n>>");
        assert!(matches!(
            &tokens[0],
            Tok::Polyglot { lang, bindings, code }
                if lang == "python"
                    && bindings == &vec!["a".to_owned(), "b".to_owned()]
                    && code == "\nprint(a + b)\n"
        ));
    }

    #[test]
    fn newlines_suppressed_in_groups() {
        let tokens = toks("f(\n1,\n2\n)");
        assert!(!tokens.iter().any(|t| matches!(t, Tok::Newline)));
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            toks("1 # a comment\n2"),
            vec![Tok::Int(1), Tok::Newline, Tok::Int(2), Tok::Eof]
        );
    }

    #[test]
    fn unterminated_string_errors() {
        assert!(tokenize("\"oops").is_err());
        assert!(tokenize("<<python\nno close").is_err());
    }
}
