// SPDX-License-Identifier: SEE LICENSE IN LICENSE.md
// SPDX-FileCopyrightText: 2023 CYBERTEC PostgreSQL International GmbH
// <office@cybertec.at>

//! Lexer for skeleton and OPE command text.
//!
//! Wraps the generated [`logos`] lexer and performs the token-stream
//! normalization the grammar depends on:
//!
//! * all-numeric words are re-tagged as numbers,
//! * remaining bare words fold to upper case and reserved words take
//!   their keyword kind (string payloads are never folded),
//! * quoted strings lose their quotes and backslash escapes, bracketed
//!   strings lose exactly one outer bracket pair,
//! * trivia (whitespace, newlines, continuations, comments) is dropped
//!   while line accounting stays exact,
//! * illegal characters are recorded and skipped, never fatal.

pub mod para;
mod token;

use lazy_static::lazy_static;
use logos::Logos;
use regex::Regex;
use std::ops::Range as StdRange;
use text_size::{TextRange, TextSize};

use crate::error::ErrorRecord;
pub use token::TokenKind;

lazy_static! {
    static ref NUM_RE: Regex = Regex::new(r"^[0-9]+(\.[0-9]*)?$").unwrap();
}

/// A normalized token with its source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    /// 1-based source line.
    pub line: u32,
    pub range: TextRange,
}

/// Byte offsets of line starts, for offset → line translation.
#[derive(Debug)]
pub(crate) struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    pub(crate) fn new(input: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(input.char_indices().filter(|(_, c)| *c == '\n').map(|(i, _)| i + 1));
        Self { starts }
    }

    /// 1-based line containing byte `offset`.
    pub(crate) fn line(&self, offset: usize) -> u32 {
        self.starts.partition_point(|&start| start <= offset) as u32
    }
}

/// Removes the backslash from every `\x` escape, keeping `x` verbatim.
fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[derive(Debug)]
pub struct Lexer<'a> {
    inner: logos::Lexer<'a, TokenKind>,
    lines: LineIndex,
    start_line: u32,
    pub errors: Vec<ErrorRecord>,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self::with_start_line(input, 1)
    }

    /// Lexes `input` reporting lines as though it began on `start_line`
    /// of the surrounding file (command sections do not start at the
    /// top of a skeleton file).
    pub fn with_start_line(input: &'a str, start_line: u32) -> Self {
        Self {
            inner: TokenKind::lexer(input),
            lines: LineIndex::new(input),
            start_line,
            errors: Vec::new(),
        }
    }

    fn line_at(&self, offset: usize) -> u32 {
        self.lines.line(offset) + self.start_line - 1
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Token;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let result = self.inner.next()?;
            let slice = self.inner.slice();
            let StdRange { start, end } = self.inner.span();
            let line = self.line_at(start);

            let kind = match result {
                Ok(kind) => kind,
                Err(()) => {
                    let ch = slice.chars().next().unwrap_or('?');
                    self.errors.push(ErrorRecord::new(
                        line,
                        format!("Scan error at line {line}, character ('{ch}')"),
                        Some(slice.to_owned()),
                    ));
                    continue;
                }
            };
            if kind.is_trivia() {
                continue;
            }

            let (kind, text) = match kind {
                TokenKind::Word => {
                    if NUM_RE.is_match(slice) {
                        (TokenKind::Num, slice.to_owned())
                    } else {
                        let folded = slice.to_uppercase();
                        match TokenKind::reserved(&folded) {
                            Some(kw) => (kw, folded),
                            None => (TokenKind::Word, folded),
                        }
                    }
                }
                TokenKind::QStr => (TokenKind::QStr, unescape(&slice[1..slice.len() - 1])),
                TokenKind::SqStr => (TokenKind::QStr, unescape(&slice[1..slice.len() - 1])),
                TokenKind::LStr => (TokenKind::LStr, slice[1..slice.len() - 1].to_owned()),
                other => (other, slice.to_owned()),
            };

            let range = TextRange::new(
                TextSize::try_from(start).unwrap_or_default(),
                TextSize::try_from(end).unwrap_or_default(),
            );
            return Some(Token {
                kind,
                text,
                line,
                range,
            });
        }
    }
}

/// Tokenizes a whole buffer, accumulating scan errors.
pub fn tokenize(input: &str) -> (Vec<Token>, Vec<ErrorRecord>) {
    tokenize_from(input, 1)
}

pub fn tokenize_from(input: &str, start_line: u32) -> (Vec<Token>, Vec<ErrorRecord>) {
    let mut lexer = Lexer::with_start_line(input, start_line);
    let tokens: Vec<Token> = lexer.by_ref().collect();
    (tokens, lexer.errors)
}
