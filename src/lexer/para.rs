// SPDX-License-Identifier: SEE LICENSE IN LICENSE.md
// SPDX-FileCopyrightText: 2023 CYBERTEC PostgreSQL International GmbH
// <office@cybertec.at>

//! Lexer for PARA (parameter definition) files.
//!
//! PARA files have a positional grammar: the same word must lex as an
//! identifier on the left of `=` and as a plain string on the right,
//! and the rules differ inside parentheses (`CASE` conditions). The
//! wrapper keeps two flags, *inside-parentheses* and *next-token-is-ID*,
//! and re-tags word tokens accordingly; this is the only way the parser
//! can tell LHS identifiers from identifier-shaped RHS strings.

use logos::Logos;
use std::ops::Range as StdRange;
use text_size::{TextRange, TextSize};

use super::LineIndex;
use crate::error::ErrorRecord;

#[derive(logos::Logos, Debug, Copy, Clone, PartialEq, Eq)]
pub enum ParaTokenKind {
    #[regex(r"[ \t\r]+")]
    Whitespace,

    // a comment consumes its newline and leaves the ID flag untouched
    #[regex(r"#[^\n]*\n?")]
    Comment,

    #[regex(r"\\\n")]
    LineCont,

    #[regex(r"\n+")]
    Newline,

    #[token("=")]
    Eq,

    #[token("(")]
    LParen,

    #[token(")")]
    RParen,

    #[token(",")]
    Comma,

    // printf-style numeric format, e.g. %-8.3f
    #[regex(r"%([+\-]?[0-9]*(\.[0-9]*)?)?[hlL]?[sdf]")]
    Fstr,

    #[regex(r"@[a-zA-Z0-9_][a-zA-Z0-9_]*")]
    RegRef,

    #[regex(r"![a-zA-Z0-9_][a-zA-Z0-9_.]*")]
    AliasRef,

    #[regex(r"&[a-zA-Z0-9_][a-zA-Z0-9_.]+\[[ \ta-zA-Z0-9_]+\]")]
    FuncRef,

    #[regex(r#""[^"]*""#)]
    QStr,

    #[regex(r"\[[^\]]*\]")]
    LStr,

    // word; re-tagged to Id or Str by the wrapper
    #[regex(r"[a-zA-Z0-9_.+\-^]+")]
    Word,

    Id,
    Str,

    /// Marker for an unmatched character, produced by the wrapper only.
    Error,

    Eof,
}

impl ParaTokenKind {
    pub fn is_trivia(self) -> bool {
        matches!(self, Self::Whitespace | Self::Comment | Self::LineCont)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParaToken {
    pub kind: ParaTokenKind,
    pub text: String,
    pub line: u32,
    pub range: TextRange,
}

#[derive(Debug)]
pub struct ParaLexer<'a> {
    inner: logos::Lexer<'a, ParaTokenKind>,
    lines: LineIndex,
    in_parens: bool,
    next_is_id: bool,
    pub errors: Vec<ErrorRecord>,
}

impl<'a> ParaLexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            inner: ParaTokenKind::lexer(input),
            lines: LineIndex::new(input),
            in_parens: false,
            next_is_id: true,
            errors: Vec::new(),
        }
    }
}

impl<'a> Iterator for ParaLexer<'a> {
    type Item = ParaToken;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let result = self.inner.next()?;
            let slice = self.inner.slice();
            let StdRange { start, end } = self.inner.span();
            let line = self.lines.line(start);

            let kind = match result {
                Ok(kind) => kind,
                Err(()) => {
                    let ch = slice.chars().next().unwrap_or('?');
                    self.errors.push(ErrorRecord::new(
                        line,
                        format!("Illegal character in input '{ch}'"),
                        Some(slice.to_owned()),
                    ));
                    continue;
                }
            };
            if kind.is_trivia() {
                continue;
            }

            let (kind, text) = match kind {
                ParaTokenKind::LParen => {
                    self.in_parens = true;
                    self.next_is_id = true;
                    (kind, slice.to_owned())
                }
                ParaTokenKind::RParen => {
                    self.in_parens = false;
                    self.next_is_id = false;
                    (kind, slice.to_owned())
                }
                ParaTokenKind::Comma => {
                    if self.in_parens {
                        self.next_is_id = true;
                    }
                    (kind, slice.to_owned())
                }
                ParaTokenKind::Eq => {
                    if self.in_parens {
                        self.next_is_id = false;
                    }
                    (kind, slice.to_owned())
                }
                ParaTokenKind::Newline => {
                    self.next_is_id = true;
                    (kind, slice.to_owned())
                }
                ParaTokenKind::Word => {
                    if self.next_is_id {
                        self.next_is_id = false;
                        (ParaTokenKind::Id, slice.to_owned())
                    } else {
                        (ParaTokenKind::Str, slice.to_owned())
                    }
                }
                ParaTokenKind::QStr => {
                    (ParaTokenKind::QStr, slice[1..slice.len() - 1].to_owned())
                }
                ParaTokenKind::LStr => {
                    (ParaTokenKind::LStr, slice[1..slice.len() - 1].to_owned())
                }
                other => (other, slice.to_owned()),
            };

            let range = TextRange::new(
                TextSize::try_from(start).unwrap_or_default(),
                TextSize::try_from(end).unwrap_or_default(),
            );
            return Some(ParaToken {
                kind,
                text,
                line,
                range,
            });
        }
    }
}

/// Tokenizes a whole PARA buffer, accumulating scan errors.
pub fn tokenize(input: &str) -> (Vec<ParaToken>, Vec<ErrorRecord>) {
    let mut lexer = ParaLexer::new(input);
    let tokens: Vec<ParaToken> = lexer.by_ref().collect();
    (tokens, lexer.errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kinds_and_text(input: &str) -> Vec<(ParaTokenKind, String)> {
        tokenize(input).0.into_iter().map(|t| (t.kind, t.text)).collect()
    }

    #[test]
    fn test_first_word_on_line_is_id() {
        use ParaTokenKind::*;
        let toks = kinds_and_text("EXPTIME TYPE=NUMBER DEFAULT=10");
        assert_eq!(
            toks,
            vec![
                (Id, "EXPTIME".to_owned()),
                (Str, "TYPE".to_owned()),
                (Eq, "=".to_owned()),
                (Str, "NUMBER".to_owned()),
                (Str, "DEFAULT".to_owned()),
                (Eq, "=".to_owned()),
                (Str, "10".to_owned()),
            ]
        );
    }

    #[test]
    fn test_newline_rearms_id() {
        use ParaTokenKind::*;
        let toks = kinds_and_text("A TYPE=CHAR\nB TYPE=CHAR");
        let ids: Vec<_> = toks.iter().filter(|(k, _)| *k == Id).collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0].1, "A");
        assert_eq!(ids[1].1, "B");
    }

    #[test]
    fn test_case_condition_flags() {
        use ParaTokenKind::*;
        // inside parens: LHS of '=' is Id, RHS is Str, ',' re-arms
        let toks = kinds_and_text("(MODE=IMG,FILTER=R)");
        assert_eq!(
            toks,
            vec![
                (LParen, "(".to_owned()),
                (Id, "MODE".to_owned()),
                (Eq, "=".to_owned()),
                (Str, "IMG".to_owned()),
                (Comma, ",".to_owned()),
                (Id, "FILTER".to_owned()),
                (Eq, "=".to_owned()),
                (Str, "R".to_owned()),
                (RParen, ")".to_owned()),
            ]
        );
    }

    #[test]
    fn test_special_tokens() {
        use ParaTokenKind::*;
        let toks = kinds_and_text("FMT FORMAT=%-8.3f STATUS=!TSCS.ALPHA REG=@DITH FUNC=&GET_F_NO[SPCAM A]");
        let kinds: Vec<_> = toks.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            kinds,
            vec![
                Id, Str, Eq, Fstr, Str, Eq, AliasRef, Str, Eq, RegRef, Str, Eq, FuncRef,
            ]
        );
    }

    #[test]
    fn test_qstr_and_lstr_strip() {
        use ParaTokenKind::*;
        let toks = kinds_and_text("MSG DEFAULT=\"no data\" SET=[A B]");
        assert!(toks.contains(&(QStr, "no data".to_owned())));
        assert!(toks.contains(&(LStr, "A B".to_owned())));
    }

    #[test]
    fn test_comment_line_between_defs() {
        use ParaTokenKind::*;
        let toks = kinds_and_text("A TYPE=CHAR\n# note\nB TYPE=CHAR");
        // the comment consumes its own newline without emitting a token;
        // the newline before it already re-armed the ID flag
        assert!(toks.contains(&(Id, "B".to_owned())));
        let newlines = toks.iter().filter(|(k, _)| *k == Newline).count();
        assert_eq!(newlines, 1);
    }
}
