// SPDX-License-Identifier: SEE LICENSE IN LICENSE.md
// SPDX-FileCopyrightText: 2023 CYBERTEC PostgreSQL International GmbH
// <office@cybertec.at>

//! Error types shared across the lexers, parsers and the interpreter.

use std::fmt;

/// A single accumulated scan or parse error.
///
/// Lexing and parsing do not abort on the first problem; they record one
/// of these per incident and keep going so the user gets the full list.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ErrorRecord {
    /// 1-based source line the error was detected on.
    pub line: u32,
    pub message: String,
    /// Text of the offending token, if there was one.
    pub token: Option<String>,
    /// Human-readable source context, filled in by [`attach_context`].
    pub verbose: Option<String>,
}

impl ErrorRecord {
    pub fn new(line: u32, message: impl Into<String>, token: Option<String>) -> Self {
        Self {
            line,
            message: message.into(),
            token,
            verbose: None,
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.token {
            Some(tok) => write!(f, "line {}: {} ('{}')", self.line, self.message, tok),
            None => write!(f, "line {}: {}", self.line, self.message),
        }
    }
}

/// Attaches a source-context window to every record in `records`.
///
/// `window` is the number of lines shown on either side of the offending
/// line; the offending line is marked with `>`.
pub fn attach_context(buf: &str, records: &mut [ErrorRecord], window: u32) {
    for rec in records.iter_mut() {
        rec.verbose = Some(error_context(buf, rec.line, window));
    }
}

pub fn error_context(buf: &str, line: u32, window: u32) -> String {
    let first = line.saturating_sub(window).max(1);
    let last = line.saturating_add(window);

    let mut out = String::new();
    for (idx, text) in buf.lines().enumerate() {
        let no = idx as u32 + 1;
        if no < first || no > last {
            continue;
        }
        let marker = if no == line { '>' } else { ' ' };
        out.push_str(&format!("{marker}{no:5}| {text}\n"));
    }
    out
}

/// Errors raised while evaluating expression trees.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("undefined name '{0}'")]
    Undefined(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("function '{name}' called with {got} argument(s)")]
    BadArity { name: String, got: usize },
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("'{0}' is not callable")]
    NotCallable(String),
    #[error("status fetch failed for '{0}'")]
    Status(String),
    #[error("frame allocation failed: {0}")]
    Frame(String),
    #[error("malformed expression node '{0}'")]
    Malformed(String),
    #[error("procedure call failed: {0}")]
    ProcFailed(String),
}

/// Errors raised by the decoder when a construct cannot be rewritten.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("*SUB command name does not decode to a literal: {0}")]
    NonLiteralName(String),
    #[error("*FOR loop spec does not decode: {0}")]
    BadLoop(String),
    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// Errors raised by the interpreter for malformed or unknown trees.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum InterpError {
    #[error("no interpretation for '{0}' node")]
    NoInterpretation(String),
    #[error("badly formed '{kind}' node: {detail}")]
    Malformed { kind: String, detail: String },
}

/// Errors raised while dispatching external commands.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ExecError {
    #[error("no task factory for command '{name}' in subsystem '{subsys}'")]
    NoFactory { name: String, subsys: String },
    #[error("command '{cmd}' failed: {detail}")]
    Failed { cmd: String, detail: String },
    #[error("required parameter '{0}' is missing")]
    MissingParam(String),
    #[error("module '{0}' is not in the import index")]
    NoModule(String),
    #[error("name '{name}' is not exported by module '{module}'")]
    NoExport { module: String, name: String },
}

/// Unified error for a running interpretation.
///
/// `Break` and `Continue` are the reserved `RAISE` messages that `WHILE`
/// consumes; `Cancel` and `Timeout` unwind through `CATCH` handlers.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Interp(#[from] InterpError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("{0} error(s) parsing skeleton file '{1}':\n{2}")]
    SkeletonParse(usize, String, String),
    #[error("{0}")]
    User(String),
    #[error("BREAK")]
    Break,
    #[error("CONTINUE")]
    Continue,
    #[error("task has been cancelled")]
    Cancel,
    #[error("timed out waiting on task")]
    Timeout,
}

impl RunError {
    /// Whether a `CATCH` handler may bind this error.
    pub fn is_catchable(&self) -> bool {
        !matches!(self, RunError::Cancel | RunError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_error_context_window() {
        let buf = "one\ntwo\nthree\nfour\nfive\n";
        let ctx = error_context(buf, 3, 1);
        assert_eq!(ctx, "     2| two\n>    3| three\n     4| four\n");
    }

    #[test]
    fn test_record_display() {
        let rec = ErrorRecord::new(7, "parse error", Some("ENDIF".into()));
        assert_eq!(rec.to_string(), "line 7: parse error ('ENDIF')");
    }

    #[test]
    fn test_catchable() {
        assert!(RunError::User("oops".into()).is_catchable());
        assert!(RunError::Break.is_catchable());
        assert!(!RunError::Cancel.is_catchable());
        assert!(!RunError::Timeout.is_catchable());
    }
}
