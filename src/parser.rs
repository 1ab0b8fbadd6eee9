// SPDX-License-Identifier: SEE LICENSE IN LICENSE.md
// SPDX-FileCopyrightText: 2023 CYBERTEC PostgreSQL International GmbH
// <office@cybertec.at>

//! Token-buffer parser shared by the grammar modules.
//!
//! Grammar functions pull tokens through this struct and build [`Ast`]
//! nodes directly. Syntax errors are accumulated rather than fatal: a
//! failed statement records an [`ErrorRecord`] and the grammar
//! re-synchronizes at the next statement boundary so the user gets the
//! complete error list in one pass. An AST built with one or more
//! recorded errors is partial and must not be executed.

use crate::ast::Ast;
use crate::error::ErrorRecord;
use crate::lexer::{self, Token, TokenKind};
use text_size::TextRange;

/// Outcome of a top-level parse entry point.
#[derive(Debug)]
pub struct Parse {
    pub ast: Ast,
    pub errors: Vec<ErrorRecord>,
}

impl Parse {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

pub(crate) type ParseResult<T> = Result<T, ErrorRecord>;

#[derive(Debug)]
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    pub(crate) errors: Vec<ErrorRecord>,
    eof: Token,
}

impl Parser {
    pub fn new(input: &str) -> Self {
        Self::with_start_line(input, 1)
    }

    pub fn with_start_line(input: &str, start_line: u32) -> Self {
        let (tokens, errors) = lexer::tokenize_from(input, start_line);
        let last_line = tokens.last().map(|t| t.line).unwrap_or(start_line);
        let eof = Token {
            kind: TokenKind::Eof,
            text: String::new(),
            line: last_line,
            range: TextRange::default(),
        };
        Self {
            tokens,
            pos: 0,
            errors,
            eof,
        }
    }

    pub(crate) fn current(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&self.eof)
    }

    pub(crate) fn kind(&self) -> TokenKind {
        self.current().kind
    }

    /// Token kind `n` positions ahead of the cursor.
    pub(crate) fn nth(&self, n: usize) -> TokenKind {
        self.tokens
            .get(self.pos + n)
            .map(|t| t.kind)
            .unwrap_or(TokenKind::Eof)
    }

    pub(crate) fn at(&self, kind: TokenKind) -> bool {
        self.kind() == kind
    }

    pub(crate) fn at_eof(&self) -> bool {
        self.at(TokenKind::Eof)
    }

    /// Consumes and returns the current token.
    pub(crate) fn bump(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    /// Consumes the current token if it has the expected kind.
    pub(crate) fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.bump();
            true
        } else {
            false
        }
    }

    pub(crate) fn expect(&mut self, kind: TokenKind) -> ParseResult<Token> {
        if self.at(kind) {
            Ok(self.bump())
        } else {
            Err(self.error_here(format!("expected {kind}")))
        }
    }

    /// Builds an error record for the current token position.
    pub(crate) fn error_here(&self, detail: impl AsRef<str>) -> ErrorRecord {
        let token = self.current();
        if token.kind == TokenKind::Eof {
            ErrorRecord::new(
                token.line,
                format!("Parse error at line {}: {} (unexpected end of input)", token.line, detail.as_ref()),
                None,
            )
        } else {
            ErrorRecord::new(
                token.line,
                format!(
                    "Parse error at line {}, token {} ('{}'): {}",
                    token.line,
                    token.kind,
                    token.text,
                    detail.as_ref()
                ),
                Some(token.text.clone()),
            )
        }
    }

    pub(crate) fn record(&mut self, err: ErrorRecord) {
        self.errors.push(err);
    }

    /// Skips forward to the next token whose kind is in `sync` (or the
    /// end of input). The synchronizing token itself is not consumed.
    pub(crate) fn recover(&mut self, sync: &[TokenKind]) {
        while !self.at_eof() && !sync.contains(&self.kind()) {
            self.bump();
        }
    }

    pub(crate) fn finish(self, ast: Ast) -> Parse {
        Parse {
            ast,
            errors: self.errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_lookahead_and_bump() {
        let mut p = Parser::new("X = 5");
        assert_eq!(p.kind(), TokenKind::Word);
        assert_eq!(p.nth(1), TokenKind::Assign);
        assert_eq!(p.nth(2), TokenKind::Num);
        assert_eq!(p.nth(3), TokenKind::Eof);
        let tok = p.bump();
        assert_eq!(tok.text, "X");
        assert!(p.eat(TokenKind::Assign));
        assert!(p.expect(TokenKind::Num).is_ok());
        assert!(p.at_eof());
    }

    #[test]
    fn test_expect_failure_records_position() {
        let mut p = Parser::new(";");
        let err = p.expect(TokenKind::Num).unwrap_err();
        assert_eq!(err.line, 1);
        assert_eq!(err.token.as_deref(), Some(";"));
    }

    #[test]
    fn test_recover_stops_at_sync() {
        let mut p = Parser::new("A B C ; D");
        p.recover(&[TokenKind::Semicolon]);
        assert_eq!(p.kind(), TokenKind::Semicolon);
        p.bump();
        assert_eq!(p.bump().text, "D");
    }

    #[test]
    fn test_scan_errors_carry_over() {
        let p = Parser::new("A ` B");
        assert_eq!(p.errors.len(), 1);
    }
}
