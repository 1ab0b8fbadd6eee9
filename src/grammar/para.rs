// SPDX-License-Identifier: SEE LICENSE IN LICENSE.md
// SPDX-FileCopyrightText: 2023 CYBERTEC PostgreSQL International GmbH
// <office@cybertec.at>

//! Grammar for PARA (parameter definition) files.
//!
//! A PARA file is a flat list of definitions, one parameter per line:
//!
//! ```text
//! EXPTIME TYPE=NUMBER MIN=0 MAX=3600 DEFAULT=10 NOP=NOP
//! FILTER  TYPE=CHAR SET=(R,V,B) DEFAULT=R CASE=(MODE=IMG)
//! ```
//!
//! Repeated lines for one name accumulate into a single [`ParamDef`]
//! with a `CASE` condition table. The reserved keys (`TYPE`, `DEFAULT`,
//! `SET`, `MIN`, `MAX`, `STATUS`, `FORMAT`, `NOP`, `CASE`) are ordinary
//! words to the lexer and only treated specially here.

use crate::error::ErrorRecord;
use crate::lexer::para::{self, ParaToken, ParaTokenKind};
use crate::params::{ParaFile, ParamSpec, ParamValue};

struct ParaParser {
    tokens: Vec<ParaToken>,
    pos: usize,
    errors: Vec<ErrorRecord>,
}

impl ParaParser {
    fn kind(&self) -> ParaTokenKind {
        self.tokens
            .get(self.pos)
            .map(|t| t.kind)
            .unwrap_or(ParaTokenKind::Eof)
    }

    fn nth(&self, n: usize) -> ParaTokenKind {
        self.tokens
            .get(self.pos + n)
            .map(|t| t.kind)
            .unwrap_or(ParaTokenKind::Eof)
    }

    fn at(&self, kind: ParaTokenKind) -> bool {
        self.kind() == kind
    }

    fn at_eof(&self) -> bool {
        self.at(ParaTokenKind::Eof)
    }

    fn line(&self) -> u32 {
        self.tokens.get(self.pos).map(|t| t.line).unwrap_or_else(|| {
            self.tokens.last().map(|t| t.line).unwrap_or(1)
        })
    }

    fn bump(&mut self) -> ParaToken {
        let token = self.tokens.get(self.pos).cloned().unwrap_or(ParaToken {
            kind: ParaTokenKind::Eof,
            text: String::new(),
            line: self.line(),
            range: Default::default(),
        });
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: ParaTokenKind) -> bool {
        if self.at(kind) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: ParaTokenKind) -> Result<ParaToken, ErrorRecord> {
        if self.at(kind) {
            Ok(self.bump())
        } else {
            Err(self.error_here(format!("expected {kind:?}")))
        }
    }

    fn error_here(&self, detail: impl AsRef<str>) -> ErrorRecord {
        let token = self.tokens.get(self.pos);
        ErrorRecord::new(
            self.line(),
            format!(
                "Syntax error at '{}': {}",
                token.map(|t| t.text.as_str()).unwrap_or("<eof>"),
                detail.as_ref()
            ),
            token.map(|t| t.text.clone()),
        )
    }

    /// Skips to the start of the next definition line.
    fn recover(&mut self) {
        while !self.at_eof() && !self.at(ParaTokenKind::Newline) {
            self.bump();
        }
        while self.eat(ParaTokenKind::Newline) {}
    }

    fn parse_file(&mut self, name: &str) -> ParaFile {
        let mut file = ParaFile {
            name: name.to_owned(),
            ..Default::default()
        };

        while !self.at_eof() {
            if self.eat(ParaTokenKind::Newline) {
                continue;
            }
            match self.parse_param_def() {
                Ok((param, spec)) => file.add_spec(&param, spec),
                Err(err) => {
                    self.errors.push(err);
                    self.recover();
                }
            }
        }

        file.errors.append(&mut self.errors);
        file
    }

    /// `param_def ::= ID defs+`, terminated by a newline or end of
    /// input.
    fn parse_param_def(&mut self) -> Result<(String, ParamSpec), ErrorRecord> {
        let name = self.expect(ParaTokenKind::Id)?;
        let mut spec = ParamSpec::new();

        while self.at(ParaTokenKind::Str) && self.nth(1) == ParaTokenKind::Eq {
            let key = self.bump();
            self.bump();
            let value = self.parse_rhs(&key.text)?;
            spec.insert(key.text.to_uppercase(), value);
        }

        if spec.is_empty() {
            return Err(self.error_here(format!("parameter '{}' has no definitions", name.text)));
        }
        if !self.at_eof() && !self.eat(ParaTokenKind::Newline) {
            return Err(self.error_here("expected end of definition line"));
        }
        Ok((name.text, spec))
    }

    fn parse_rhs(&mut self, key: &str) -> Result<ParamValue, ErrorRecord> {
        match self.kind() {
            ParaTokenKind::Fstr => Ok(ParamValue::Format(self.bump().text)),
            ParaTokenKind::RegRef => {
                let tok = self.bump();
                Ok(ParamValue::RegRef(tok.text[1..].to_owned()))
            }
            ParaTokenKind::AliasRef => {
                let tok = self.bump();
                Ok(ParamValue::AliasRef(tok.text[1..].to_owned()))
            }
            ParaTokenKind::FuncRef => Ok(ParamValue::FuncRef(self.bump().text)),
            ParaTokenKind::LStr => Ok(ParamValue::Str(self.bump().text)),
            ParaTokenKind::LParen => self.parse_parenthesized(key),
            ParaTokenKind::Str | ParaTokenKind::QStr => self.parse_comma_list(key),
            _ => Err(self.error_here("expected a value")),
        }
    }

    /// `STR (',' STR)*`; a non-`SET` key collapses to its first
    /// element, a `SET` list keeps list form with the `NOP` sentinel
    /// dropped.
    fn parse_comma_list(&mut self, key: &str) -> Result<ParamValue, ErrorRecord> {
        let mut items = vec![self.bump().text];
        while self.eat(ParaTokenKind::Comma) {
            match self.kind() {
                ParaTokenKind::Str | ParaTokenKind::QStr => items.push(self.bump().text),
                _ => return Err(self.error_here("expected a list element")),
            }
        }

        if key.eq_ignore_ascii_case("SET") {
            items.retain(|i| i != "NOP");
            Ok(ParamValue::List(items))
        } else {
            Ok(ParamValue::Str(items.swap_remove(0)))
        }
    }

    /// Parenthesized right-hand sides are either a `CASE` condition
    /// (`(MODE=IMG,FILTER=R)`) or a plain value set (`(R,V,B)`).
    fn parse_parenthesized(&mut self, key: &str) -> Result<ParamValue, ErrorRecord> {
        self.expect(ParaTokenKind::LParen)?;

        if self.at(ParaTokenKind::Id) && self.nth(1) == ParaTokenKind::Eq {
            let mut pairs = Vec::new();
            loop {
                let lhs = self.expect(ParaTokenKind::Id)?;
                self.expect(ParaTokenKind::Eq)?;
                let rhs = match self.kind() {
                    ParaTokenKind::Str | ParaTokenKind::QStr => self.bump(),
                    _ => return Err(self.error_here("expected a condition value")),
                };
                pairs.push((lhs.text, rhs.text));
                if !self.eat(ParaTokenKind::Comma) {
                    break;
                }
            }
            self.expect(ParaTokenKind::RParen)?;
            return Ok(ParamValue::Cond(pairs));
        }

        let mut items = Vec::new();
        loop {
            match self.kind() {
                ParaTokenKind::Id | ParaTokenKind::Str | ParaTokenKind::QStr => {
                    items.push(self.bump().text)
                }
                _ => return Err(self.error_here("expected a set element")),
            }
            if !self.eat(ParaTokenKind::Comma) {
                break;
            }
        }
        self.expect(ParaTokenKind::RParen)?;

        if key.eq_ignore_ascii_case("SET") {
            items.retain(|i| i != "NOP");
        }
        Ok(ParamValue::List(items))
    }
}

/// Parses a PARA buffer into a [`ParaFile`], accumulating scan and
/// syntax errors rather than failing.
pub fn parse_para(input: &str, name: &str) -> ParaFile {
    let (tokens, scan_errors) = para::tokenize(input);
    let mut parser = ParaParser {
        tokens,
        pos: 0,
        errors: scan_errors,
    };
    parser.parse_file(name)
}
