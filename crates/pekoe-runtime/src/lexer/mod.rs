//! Lexical analysis (tokenization)
//!
//! The lexer produces tokens on demand from Pekoe source code. The compiler
//! owns one and pulls tokens as it parses; `backtrack` rewinds the lexer by
//! exactly one character so a token can be re-read after lookahead.

use crate::token::{Token, TokenKind};

/// Lexer state for tokenizing source code
pub struct Lexer {
    /// Characters of source code
    chars: Vec<char>,
    /// Current position in chars
    current: usize,
    /// Start position of the token being scanned
    start: usize,
    /// Current line number (1-indexed)
    line: u32,
}

impl Lexer {
    /// Create a new lexer for the given source code
    pub fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            current: 0,
            start: 0,
            line: 1,
        }
    }

    /// Scan the next token
    pub fn next_token(&mut self) -> Token {
        self.skip_whitespace_and_comments();

        self.start = self.current;

        if self.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let c = self.advance();

        match c {
            '(' => self.make_token(TokenKind::LeftParen),
            ')' => self.make_token(TokenKind::RightParen),
            '{' => self.make_token(TokenKind::LeftBrace),
            '}' => self.make_token(TokenKind::RightBrace),
            ';' => self.make_token(TokenKind::Semicolon),
            ',' => self.make_token(TokenKind::Comma),
            '.' => {
                if self.peek() == '.' && self.peek_next() == Some('.') {
                    self.advance();
                    self.advance();
                    self.make_token(TokenKind::DotDotDot)
                } else {
                    self.make_token(TokenKind::Dot)
                }
            }

            '+' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::PlusEqual)
                } else {
                    self.make_token(TokenKind::Plus)
                }
            }
            '-' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::MinusEqual)
                } else {
                    self.make_token(TokenKind::Minus)
                }
            }
            '*' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::StarEqual)
                } else if self.match_char('*') {
                    self.make_token(TokenKind::StarStar)
                } else {
                    self.make_token(TokenKind::Star)
                }
            }
            '/' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::SlashEqual)
                } else {
                    self.make_token(TokenKind::Slash)
                }
            }
            '%' => self.make_token(TokenKind::Percent),
            '&' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::AmpEqual)
                } else {
                    self.make_token(TokenKind::Ampersand)
                }
            }
            '^' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::CaretEqual)
                } else {
                    self.make_token(TokenKind::Caret)
                }
            }
            '|' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::PipeEqual)
                } else {
                    self.make_token(TokenKind::Pipe)
                }
            }

            '=' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::EqualEqual)
                } else {
                    self.make_token(TokenKind::Equal)
                }
            }
            '!' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::BangEqual)
                } else {
                    self.error_token("Unexpected character.")
                }
            }
            '<' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::LessEqual)
                } else {
                    self.make_token(TokenKind::Less)
                }
            }
            '>' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::GreaterEqual)
                } else {
                    self.make_token(TokenKind::Greater)
                }
            }

            '"' | '\'' => self.string(c),

            c if c.is_ascii_digit() => self.number(),

            // An `r` immediately followed by a quote introduces a raw string;
            // the string itself is scanned as the next token.
            'r' if self.peek() == '"' || self.peek() == '\'' => {
                self.make_token(TokenKind::RString)
            }

            c if c.is_ascii_alphabetic() || c == '_' => self.identifier(),

            _ => self.error_token("Unexpected character."),
        }
    }

    /// Rewind the lexer by exactly one character.
    ///
    /// Calling this `lexeme.chars().count()` times after scanning a token
    /// leaves the lexer positioned to scan that token again.
    pub fn backtrack(&mut self) {
        if self.current > 0 {
            self.current -= 1;
            if self.chars[self.current] == '\n' {
                self.line -= 1;
            }
        }
    }

    /// Skip whitespace, `//` line comments and `/* */` block comments
    fn skip_whitespace_and_comments(&mut self) {
        loop {
            if self.is_at_end() {
                return;
            }

            match self.peek() {
                ' ' | '\r' | '\t' => {
                    self.advance();
                }
                '\n' => {
                    self.advance();
                    self.line += 1;
                }
                '/' => {
                    if self.peek_next() == Some('/') {
                        while !self.is_at_end() && self.peek() != '\n' {
                            self.advance();
                        }
                    } else if self.peek_next() == Some('*') {
                        self.advance();
                        self.advance();
                        while !self.is_at_end() {
                            if self.peek() == '*' && self.peek_next() == Some('/') {
                                self.advance();
                                self.advance();
                                break;
                            }
                            if self.peek() == '\n' {
                                self.line += 1;
                            }
                            self.advance();
                        }
                    } else {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    /// Scan a string literal delimited by `quote`.
    ///
    /// Escape sequences are validated only for termination here; they are
    /// decoded by the compiler, and raw strings keep them untouched.
    fn string(&mut self, quote: char) -> Token {
        while !self.is_at_end() && self.peek() != quote {
            if self.peek() == '\n' {
                self.line += 1;
            }
            if self.peek() == '\\' && self.peek_next().is_some() {
                self.advance();
            }
            self.advance();
        }

        if self.is_at_end() {
            return self.error_token("Unterminated string.");
        }

        self.advance(); // closing quote
        self.make_token(TokenKind::String)
    }

    /// Scan a number literal; underscores are permitted as separators and
    /// stripped before parsing.
    fn number(&mut self) -> Token {
        while self.peek().is_ascii_digit() || self.peek() == '_' {
            self.advance();
        }

        // Fractional part only when a digit follows the dot.
        if self.peek() == '.' && self.peek_next().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
            while self.peek().is_ascii_digit() || self.peek() == '_' {
                self.advance();
            }
        }

        self.make_token(TokenKind::Number)
    }

    /// Scan an identifier or keyword
    fn identifier(&mut self) -> Token {
        while self.peek().is_ascii_alphanumeric() || self.peek() == '_' {
            self.advance();
        }

        let lexeme: String = self.chars[self.start..self.current].iter().collect();
        let kind = keyword_kind(&lexeme).unwrap_or(TokenKind::Identifier);
        Token::new(kind, lexeme, self.line)
    }

    // === Character navigation ===

    fn advance(&mut self) -> char {
        let c = self.chars[self.current];
        self.current += 1;
        c
    }

    fn peek(&self) -> char {
        if self.is_at_end() {
            '\0'
        } else {
            self.chars[self.current]
        }
    }

    fn peek_next(&self) -> Option<char> {
        if self.current + 1 >= self.chars.len() {
            None
        } else {
            Some(self.chars[self.current + 1])
        }
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.is_at_end() || self.chars[self.current] != expected {
            false
        } else {
            self.advance();
            true
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.chars.len()
    }

    // === Token creation ===

    fn make_token(&self, kind: TokenKind) -> Token {
        let lexeme: String = self.chars[self.start..self.current].iter().collect();
        Token::new(kind, lexeme, self.line)
    }

    /// Create an error token; the lexeme carries the message
    fn error_token(&self, message: &str) -> Token {
        Token::new(TokenKind::Error, message, self.line)
    }
}

/// Map a lexeme to its keyword kind, if it is one
fn keyword_kind(lexeme: &str) -> Option<TokenKind> {
    let kind = match lexeme {
        "and" => TokenKind::And,
        "as" => TokenKind::As,
        "break" => TokenKind::Break,
        "class" => TokenKind::Class,
        "continue" => TokenKind::Continue,
        "def" => TokenKind::Def,
        "else" => TokenKind::Else,
        "false" => TokenKind::False,
        "for" => TokenKind::For,
        "from" => TokenKind::From,
        "if" => TokenKind::If,
        "import" => TokenKind::Import,
        "nil" => TokenKind::Nil,
        "not" => TokenKind::Not,
        "or" => TokenKind::Or,
        "return" => TokenKind::Return,
        "super" => TokenKind::Super,
        "this" => TokenKind::This,
        "true" => TokenKind::True,
        "var" => TokenKind::Var,
        "while" => TokenKind::While,
        _ => return None,
    };
    Some(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(source: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(source);
        let mut tokens = Vec::new();
        loop {
            let token = lexer.next_token();
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        tokens
    }

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex_all(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_punctuation_and_operators() {
        assert_eq!(
            kinds("( ) { } , . ; ... ** %"),
            vec![
                TokenKind::LeftParen,
                TokenKind::RightParen,
                TokenKind::LeftBrace,
                TokenKind::RightBrace,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::Semicolon,
                TokenKind::DotDotDot,
                TokenKind::StarStar,
                TokenKind::Percent,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_compound_assignment_operators() {
        assert_eq!(
            kinds("+= -= *= /= &= ^= |="),
            vec![
                TokenKind::PlusEqual,
                TokenKind::MinusEqual,
                TokenKind::StarEqual,
                TokenKind::SlashEqual,
                TokenKind::AmpEqual,
                TokenKind::CaretEqual,
                TokenKind::PipeEqual,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_keywords_and_identifiers() {
        let tokens = lex_all("var radius = nil;");
        assert_eq!(tokens[0].kind, TokenKind::Var);
        assert_eq!(tokens[1].kind, TokenKind::Identifier);
        assert_eq!(tokens[1].lexeme, "radius");
        assert_eq!(tokens[2].kind, TokenKind::Equal);
        assert_eq!(tokens[3].kind, TokenKind::Nil);
    }

    #[test]
    fn test_number_with_underscores() {
        let tokens = lex_all("1_000_000.5");
        assert_eq!(tokens[0].kind, TokenKind::Number);
        assert_eq!(tokens[0].lexeme, "1_000_000.5");
    }

    #[test]
    fn test_string_keeps_quotes_in_lexeme() {
        let tokens = lex_all(r#""hi\n""#);
        assert_eq!(tokens[0].kind, TokenKind::String);
        assert_eq!(tokens[0].lexeme, r#""hi\n""#);
    }

    #[test]
    fn test_raw_string_prefix() {
        let tokens = lex_all(r#"r"hi\n""#);
        assert_eq!(tokens[0].kind, TokenKind::RString);
        assert_eq!(tokens[0].lexeme, "r");
        assert_eq!(tokens[1].kind, TokenKind::String);
    }

    #[test]
    fn test_unterminated_string() {
        let tokens = lex_all("\"oops");
        assert_eq!(tokens[0].kind, TokenKind::Error);
        assert_eq!(tokens[0].lexeme, "Unterminated string.");
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            kinds("1 // trailing\n/* block\ncomment */ 2"),
            vec![TokenKind::Number, TokenKind::Number, TokenKind::Eof]
        );
    }

    #[test]
    fn test_line_tracking() {
        let tokens = lex_all("1\n2\n3");
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[1].line, 2);
        assert_eq!(tokens[2].line, 3);
    }

    #[test]
    fn test_backtrack_rescans_same_token() {
        let mut lexer = Lexer::new("first second");
        let first = lexer.next_token();
        let second = lexer.next_token();
        for _ in 0..second.lexeme.chars().count() {
            lexer.backtrack();
        }
        let again = lexer.next_token();
        assert_eq!(first.lexeme, "first");
        assert_eq!(second, again);
    }
}
