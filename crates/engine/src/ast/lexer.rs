//! Lexer: turns policy source text into a token stream.
//!
//! Newlines are emitted as tokens because they separate body literals; the
//! parser ignores them inside brackets.

use super::ParseError;

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Raw text, or the unescaped value for string literals.
    pub text: String,
    pub line: usize,
    pub col: usize,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, line: usize, col: usize) -> Self {
        Self {
            kind,
            text: text.into(),
            line,
            col,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    // Keywords
    Package,
    Import,
    As,
    Default,
    Not,
    Some,
    In,
    If,
    Contains,
    True,
    False,
    Null,

    // Identifiers and literals
    Ident,
    Str,
    Number,

    // Structural
    Dot,
    Comma,
    Semicolon,
    Colon,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    LParen,
    RParen,
    Pipe,

    // Operators
    Assign,
    Unify,
    EqEq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,

    Newline,
    Eof,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Package => "package",
            Self::Import => "import",
            Self::As => "as",
            Self::Default => "default",
            Self::Not => "not",
            Self::Some => "some",
            Self::In => "in",
            Self::If => "if",
            Self::Contains => "contains",
            Self::True => "true",
            Self::False => "false",
            Self::Null => "null",
            Self::Ident => "identifier",
            Self::Str => "string",
            Self::Number => "number",
            Self::Dot => ".",
            Self::Comma => ",",
            Self::Semicolon => ";",
            Self::Colon => ":",
            Self::LBracket => "[",
            Self::RBracket => "]",
            Self::LBrace => "{",
            Self::RBrace => "}",
            Self::LParen => "(",
            Self::RParen => ")",
            Self::Pipe => "|",
            Self::Assign => ":=",
            Self::Unify => "=",
            Self::EqEq => "==",
            Self::Neq => "!=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Star => "*",
            Self::Slash => "/",
            Self::Percent => "%",
            Self::Newline => "newline",
            Self::Eof => "end of input",
        };
        f.write_str(s)
    }
}

fn keyword(word: &str) -> Option<TokenKind> {
    let kind = match word {
        "package" => TokenKind::Package,
        "import" => TokenKind::Import,
        "as" => TokenKind::As,
        "default" => TokenKind::Default,
        "not" => TokenKind::Not,
        "some" => TokenKind::Some,
        "in" => TokenKind::In,
        "if" => TokenKind::If,
        "contains" => TokenKind::Contains,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "null" => TokenKind::Null,
        _ => return None,
    };
    Some(kind)
}

pub struct Lexer {
    file: String,
    input: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
}

impl Lexer {
    pub fn new(file: &str, input: &str) -> Self {
        Self {
            file: file.to_string(),
            input: input.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    pub fn tokenize(&mut self) -> Result<Vec<Token>, ParseError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_blanks_and_comments();
            if self.pos >= self.input.len() {
                tokens.push(Token::new(TokenKind::Eof, "", self.line, self.col));
                break;
            }
            tokens.push(self.next_token()?);
        }
        Ok(tokens)
    }

    fn error(&self, line: usize, col: usize, message: impl Into<String>) -> ParseError {
        ParseError {
            file: self.file.clone(),
            line,
            col,
            message: message.into(),
        }
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.input.get(self.pos).copied()?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    fn skip_blanks_and_comments(&mut self) {
        while let Some(ch) = self.peek_at(0) {
            match ch {
                ' ' | '\t' | '\r' => {
                    self.advance();
                }
                '#' => {
                    while let Some(c) = self.peek_at(0) {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, ParseError> {
        let line = self.line;
        let col = self.col;
        let ch = self.input[self.pos];

        let two = |kind: TokenKind, text: &str, lexer: &mut Lexer| -> Result<Token, ParseError> {
            lexer.advance();
            lexer.advance();
            Ok(Token::new(kind, text, line, col))
        };
        let one = |kind: TokenKind, lexer: &mut Lexer| -> Result<Token, ParseError> {
            let c = lexer.advance().unwrap_or_default();
            Ok(Token::new(kind, c.to_string(), line, col))
        };

        match ch {
            '\n' => one(TokenKind::Newline, self),
            '.' => one(TokenKind::Dot, self),
            ',' => one(TokenKind::Comma, self),
            ';' => one(TokenKind::Semicolon, self),
            ':' if self.peek_at(1) == Some('=') => two(TokenKind::Assign, ":=", self),
            ':' => one(TokenKind::Colon, self),
            '[' => one(TokenKind::LBracket, self),
            ']' => one(TokenKind::RBracket, self),
            '{' => one(TokenKind::LBrace, self),
            '}' => one(TokenKind::RBrace, self),
            '(' => one(TokenKind::LParen, self),
            ')' => one(TokenKind::RParen, self),
            '|' => one(TokenKind::Pipe, self),
            '=' if self.peek_at(1) == Some('=') => two(TokenKind::EqEq, "==", self),
            '=' => one(TokenKind::Unify, self),
            '!' if self.peek_at(1) == Some('=') => two(TokenKind::Neq, "!=", self),
            '<' if self.peek_at(1) == Some('=') => two(TokenKind::Lte, "<=", self),
            '<' => one(TokenKind::Lt, self),
            '>' if self.peek_at(1) == Some('=') => two(TokenKind::Gte, ">=", self),
            '>' => one(TokenKind::Gt, self),
            '+' => one(TokenKind::Plus, self),
            '-' => one(TokenKind::Minus, self),
            '*' => one(TokenKind::Star, self),
            '/' => one(TokenKind::Slash, self),
            '%' => one(TokenKind::Percent, self),
            '"' => self.read_string(line, col),
            '`' => self.read_raw_string(line, col),
            c if c.is_ascii_digit() => Ok(self.read_number(line, col)),
            c if c.is_ascii_alphabetic() || c == '_' => Ok(self.read_word(line, col)),
            other => Err(self.error(line, col, format!("unexpected character '{other}'"))),
        }
    }

    fn read_word(&mut self, line: usize, col: usize) -> Token {
        let mut word = String::new();
        while let Some(c) = self.peek_at(0) {
            if c.is_ascii_alphanumeric() || c == '_' {
                word.push(c);
                self.advance();
            } else {
                break;
            }
        }
        let kind = keyword(&word).unwrap_or(TokenKind::Ident);
        Token::new(kind, word, line, col)
    }

    fn read_number(&mut self, line: usize, col: usize) -> Token {
        let mut text = String::new();
        while let Some(c) = self.peek_at(0) {
            if c.is_ascii_digit() {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        if self.peek_at(0) == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            text.push('.');
            self.advance();
            while let Some(c) = self.peek_at(0) {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
        }
        if matches!(self.peek_at(0), Some('e') | Some('E')) {
            let sign = matches!(self.peek_at(1), Some('+') | Some('-'));
            let digit_at = if sign { 2 } else { 1 };
            if self.peek_at(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                for _ in 0..digit_at {
                    if let Some(c) = self.advance() {
                        text.push(c);
                    }
                }
                while let Some(c) = self.peek_at(0) {
                    if c.is_ascii_digit() {
                        text.push(c);
                        self.advance();
                    } else {
                        break;
                    }
                }
            }
        }
        Token::new(TokenKind::Number, text, line, col)
    }

    fn read_string(&mut self, line: usize, col: usize) -> Result<Token, ParseError> {
        self.advance();
        let mut value = String::new();
        loop {
            let Some(c) = self.advance() else {
                return Err(self.error(line, col, "unterminated string"));
            };
            match c {
                '"' => break,
                '\n' => return Err(self.error(line, col, "unterminated string")),
                '\\' => {
                    let Some(esc) = self.advance() else {
                        return Err(self.error(line, col, "unterminated string"));
                    };
                    match esc {
                        '"' => value.push('"'),
                        '\\' => value.push('\\'),
                        '/' => value.push('/'),
                        'n' => value.push('\n'),
                        't' => value.push('\t'),
                        'r' => value.push('\r'),
                        'b' => value.push('\u{8}'),
                        'f' => value.push('\u{c}'),
                        'u' => {
                            let mut hex = String::new();
                            for _ in 0..4 {
                                match self.advance() {
                                    Some(h) if h.is_ascii_hexdigit() => hex.push(h),
                                    _ => {
                                        return Err(self.error(
                                            self.line,
                                            self.col,
                                            "invalid unicode escape",
                                        ))
                                    }
                                }
                            }
                            let code = u32::from_str_radix(&hex, 16).unwrap_or(0xFFFD);
                            value.push(char::from_u32(code).unwrap_or('\u{FFFD}'));
                        }
                        other => {
                            return Err(self.error(
                                self.line,
                                self.col,
                                format!("invalid escape sequence '\\{other}'"),
                            ))
                        }
                    }
                }
                other => value.push(other),
            }
        }
        Ok(Token::new(TokenKind::Str, value, line, col))
    }

    fn read_raw_string(&mut self, line: usize, col: usize) -> Result<Token, ParseError> {
        self.advance();
        let mut value = String::new();
        loop {
            match self.advance() {
                Some('`') => break,
                Some(c) => value.push(c),
                None => return Err(self.error(line, col, "unterminated raw string")),
            }
        }
        Ok(Token::new(TokenKind::Str, value, line, col))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new("test.rego", src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn operators_and_keywords() {
        assert_eq!(
            kinds("allow := x != 1 if not y"),
            vec![
                TokenKind::Ident,
                TokenKind::Assign,
                TokenKind::Ident,
                TokenKind::Neq,
                TokenKind::Number,
                TokenKind::If,
                TokenKind::Not,
                TokenKind::Ident,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn comments_are_skipped_but_newlines_kept() {
        assert_eq!(
            kinds("a # comment\nb"),
            vec![
                TokenKind::Ident,
                TokenKind::Newline,
                TokenKind::Ident,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn string_escapes() {
        let tokens = Lexer::new("t", r#""a\"b\nA""#).tokenize().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[0].text, "a\"b\nA");
    }

    #[test]
    fn raw_strings_keep_backslashes() {
        let tokens = Lexer::new("t", r"`a\d+`").tokenize().unwrap();
        assert_eq!(tokens[0].text, r"a\d+");
    }

    #[test]
    fn numbers_with_fraction_and_exponent() {
        let tokens = Lexer::new("t", "3.25 1e3 7").tokenize().unwrap();
        assert_eq!(tokens[0].text, "3.25");
        assert_eq!(tokens[1].text, "1e3");
        assert_eq!(tokens[2].text, "7");
    }

    #[test]
    fn unterminated_string_reports_position() {
        let err = Lexer::new("p.rego", "x = \"abc").tokenize().unwrap_err();
        assert_eq!(err.line, 1);
        assert_eq!(err.col, 5);
        assert!(err.to_string().contains("unterminated string"));
    }
}
