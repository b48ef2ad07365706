//! Lexical analysis (tokenization)
//!
//! Scans UTF-8 source text into a flat token stream. Spec.md §1 treats the
//! lexer as an external collaborator of the core three subsystems, but a
//! standalone crate needs one to turn source text into the AST the compiler
//! consumes — see SPEC_FULL.md §1. Grounded on the scan loop shape of
//! `original_source/src/Preprocessing/scanner.cpp`.

use crate::diagnostic::{error_codes, Diagnostic};
use crate::span::Span;
use crate::token::{Token, TokenKind};

pub struct Lexer<'a> {
    source: &'a [u8],
    start: usize,
    current: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source: source.as_bytes(),
            start: 0,
            current: 0,
        }
    }

    /// Tokenize the whole source. On a lexical error the bad character is
    /// recorded as a diagnostic and scanning continues, so that (like the
    /// compiler) a single run can surface more than one problem.
    pub fn tokenize(&mut self) -> Result<Vec<Token>, Vec<Diagnostic>> {
        let mut tokens = Vec::new();
        let mut diagnostics = Vec::new();

        loop {
            self.skip_trivia();
            self.start = self.current;

            if self.is_at_end() {
                tokens.push(Token::new(TokenKind::Eof, Span::new(self.start, self.start)));
                break;
            }

            match self.scan_token() {
                Ok(token) => tokens.push(token),
                Err(diag) => diagnostics.push(diag),
            }
        }

        if diagnostics.is_empty() {
            Ok(tokens)
        } else {
            Err(diagnostics)
        }
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') => {
                    self.advance();
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    while self.peek().is_some() && self.peek() != Some(b'\n') {
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn scan_token(&mut self) -> Result<Token, Diagnostic> {
        let c = self.advance();
        let kind = match c {
            b'(' => TokenKind::LeftParen,
            b')' => TokenKind::RightParen,
            b'{' => TokenKind::LeftBrace,
            b'}' => TokenKind::RightBrace,
            b'[' => TokenKind::LeftBracket,
            b']' => TokenKind::RightBracket,
            b',' => TokenKind::Comma,
            b'.' => TokenKind::Dot,
            b';' => TokenKind::Semicolon,
            b'~' => TokenKind::Tilde,
            b'?' => TokenKind::Question,
            b'^' => TokenKind::Caret,
            b':' => {
                if self.matches(b':') {
                    TokenKind::ColonColon
                } else {
                    TokenKind::Colon
                }
            }
            b'+' => {
                if self.matches(b'+') {
                    TokenKind::PlusPlus
                } else {
                    TokenKind::Plus
                }
            }
            b'-' => {
                if self.matches(b'-') {
                    TokenKind::MinusMinus
                } else {
                    TokenKind::Minus
                }
            }
            b'*' => TokenKind::Star,
            b'/' => TokenKind::Slash,
            b'%' => TokenKind::Percent,
            b'&' => {
                if self.matches(b'&') {
                    TokenKind::AmpAmp
                } else {
                    TokenKind::Amp
                }
            }
            b'|' => {
                if self.matches(b'|') {
                    TokenKind::PipePipe
                } else {
                    TokenKind::Pipe
                }
            }
            b'!' => {
                if self.matches(b'=') {
                    TokenKind::BangEqual
                } else {
                    TokenKind::Bang
                }
            }
            b'=' => {
                if self.matches(b'=') {
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Equal
                }
            }
            b'<' => {
                if self.matches(b'=') {
                    TokenKind::LessEqual
                } else if self.matches(b'<') {
                    TokenKind::Shl
                } else {
                    TokenKind::Less
                }
            }
            b'>' => {
                if self.matches(b'=') {
                    TokenKind::GreaterEqual
                } else if self.matches(b'>') {
                    TokenKind::Shr
                } else {
                    TokenKind::Greater
                }
            }
            b'"' => return self.string(),
            d if d.is_ascii_digit() => return Ok(self.number()),
            a if a.is_ascii_alphabetic() || a == b'_' => return Ok(self.identifier()),
            _ => {
                return Err(Diagnostic::error_with_code(
                    error_codes::UNEXPECTED_CHARACTER,
                    format!("unexpected character '{}'", c as char),
                    self.span(),
                ))
            }
        };
        Ok(Token::new(kind, self.span()))
    }

    fn string(&mut self) -> Result<Token, Diagnostic> {
        let mut value = String::new();
        while self.peek().is_some() && self.peek() != Some(b'"') {
            let c = self.advance();
            if c == b'\\' {
                match self.advance() {
                    b'n' => value.push('\n'),
                    b't' => value.push('\t'),
                    b'"' => value.push('"'),
                    b'\\' => value.push('\\'),
                    other => value.push(other as char),
                }
            } else {
                value.push(c as char);
            }
        }
        if self.is_at_end() {
            return Err(Diagnostic::error_with_code(
                error_codes::UNTERMINATED_STRING,
                "unterminated string literal",
                self.span(),
            ));
        }
        self.advance(); // closing quote
        Ok(Token::new(TokenKind::String(value), self.span()))
    }

    fn number(&mut self) -> Token {
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }
        if self.peek() == Some(b'.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
        }
        let text = std::str::from_utf8(&self.source[self.start..self.current]).unwrap();
        let value: f64 = text.parse().unwrap_or(f64::NAN);
        Token::new(TokenKind::Number(value), self.span())
    }

    fn identifier(&mut self) -> Token {
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_')
        {
            self.advance();
        }
        let text = std::str::from_utf8(&self.source[self.start..self.current]).unwrap();
        let kind = TokenKind::keyword(text).unwrap_or_else(|| TokenKind::Ident(text.to_string()));
        Token::new(kind, self.span())
    }

    fn span(&self) -> Span {
        Span::new(self.start, self.current)
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn peek(&self) -> Option<u8> {
        self.source.get(self.current).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.source.get(self.current + offset).copied()
    }

    fn advance(&mut self) -> u8 {
        let c = self.source[self.current];
        self.current += 1;
        c
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.current += 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_punctuation_and_operators() {
        let k = kinds("+ - * / % << >> & | ^ ~ ?");
        assert_eq!(
            k,
            vec![
                TokenKind::Plus,
                TokenKind::Minus,
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::Percent,
                TokenKind::Shl,
                TokenKind::Shr,
                TokenKind::Amp,
                TokenKind::Pipe,
                TokenKind::Caret,
                TokenKind::Tilde,
                TokenKind::Question,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_keywords_vs_identifiers() {
        let k = kinds("class foo func bar");
        assert_eq!(
            k,
            vec![
                TokenKind::Class,
                TokenKind::Ident("foo".into()),
                TokenKind::Func,
                TokenKind::Ident("bar".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_number_literal() {
        let k = kinds("42 3.5");
        assert_eq!(
            k,
            vec![TokenKind::Number(42.0), TokenKind::Number(3.5), TokenKind::Eof]
        );
    }

    #[test]
    fn test_string_literal_with_escapes() {
        let k = kinds(r#""hi\n""#);
        assert_eq!(k, vec![TokenKind::String("hi\n".into()), TokenKind::Eof]);
    }

    #[test]
    fn test_unterminated_string_reports_diagnostic() {
        let result = Lexer::new("\"abc").tokenize();
        assert!(result.is_err());
    }

    #[test]
    fn test_module_qualified_name() {
        let k = kinds("alias::name");
        assert_eq!(
            k,
            vec![
                TokenKind::Ident("alias".into()),
                TokenKind::ColonColon,
                TokenKind::Ident("name".into()),
                TokenKind::Eof,
            ]
        );
    }
}
