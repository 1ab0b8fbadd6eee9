// SPDX-License-Identifier: SEE LICENSE IN LICENSE.md
// SPDX-FileCopyrightText: 2023 CYBERTEC PostgreSQL International GmbH
// <office@cybertec.at>

//! Tagged tree nodes shared by the parsers, the decoder and the
//! interpreter.
//!
//! Every node carries a closed [`AstKind`] tag, an ordered list of
//! children (sub-trees or leaf values) and a process-unique serial
//! number. Serial numbers identify nodes in monitoring messages and are
//! assigned in construction order.

use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::InterpError;

static SERIALS: AtomicU64 = AtomicU64::new(1);

/// Draws the next node serial from the process-wide counter.
pub fn next_serial() -> u64 {
    SERIALS.fetch_add(1, Ordering::Relaxed)
}

/// Node tags. `Display` yields the canonical snake_case tag names.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AstKind {
    // expression / parameter grammar
    ParamList,
    KeyValuePair,
    Number,
    IdRef,
    AliasRef,
    RegRef,
    Str,
    QStr,
    LStr,
    FrameIdRef,
    Monad,
    Dyad,
    FuncCall,
    ProcCall,
    AsNum,
    ArgList,
    KwdParams,
    ExprList,
    // program grammar
    Skeleton,
    CommandSection,
    CmdList,
    Block,
    Sync,
    Async,
    Exec,
    AbsCmd,
    StarSub,
    IfList,
    Cond,
    StarIf,
    StarFor,
    While,
    Let,
    Set,
    StarSet,
    Proc,
    Import,
    Catch,
    Raise,
    Return,
    Nop,
    IdList,
    VarList,
}

impl fmt::Display for AstKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            AstKind::ParamList => "param_list",
            AstKind::KeyValuePair => "key_value_pair",
            AstKind::Number => "number",
            AstKind::IdRef => "id_ref",
            AstKind::AliasRef => "alias_ref",
            AstKind::RegRef => "reg_ref",
            AstKind::Str => "string",
            AstKind::QStr => "qstring",
            AstKind::LStr => "lstring",
            AstKind::FrameIdRef => "frame_id_ref",
            AstKind::Monad => "monad",
            AstKind::Dyad => "dyad",
            AstKind::FuncCall => "func_call",
            AstKind::ProcCall => "proc_call",
            AstKind::AsNum => "asnum",
            AstKind::ArgList => "arg_list",
            AstKind::KwdParams => "kwd_params",
            AstKind::ExprList => "expression_list",
            AstKind::Skeleton => "skeleton",
            AstKind::CommandSection => "command_section",
            AstKind::CmdList => "cmdlist",
            AstKind::Block => "block",
            AstKind::Sync => "sync",
            AstKind::Async => "async",
            AstKind::Exec => "exec",
            AstKind::AbsCmd => "abscmd",
            AstKind::StarSub => "star_sub",
            AstKind::IfList => "if_list",
            AstKind::Cond => "cond",
            AstKind::StarIf => "star_if",
            AstKind::StarFor => "star_for",
            AstKind::While => "while",
            AstKind::Let => "let",
            AstKind::Set => "set",
            AstKind::StarSet => "star_set",
            AstKind::Proc => "proc",
            AstKind::Import => "import",
            AstKind::Catch => "catch",
            AstKind::Raise => "raise",
            AstKind::Return => "return",
            AstKind::Nop => "nop",
            AstKind::IdList => "idlist",
            AstKind::VarList => "varlist",
        };
        f.write_str(tag)
    }
}

/// One entry in a node's ordered child list.
#[derive(Debug, Clone, PartialEq)]
pub enum AstItem {
    Node(Ast),
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Nil,
}

impl AstItem {
    pub fn as_node(&self) -> Option<&Ast> {
        match self {
            AstItem::Node(ast) => Some(ast),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AstItem::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Ast> for AstItem {
    fn from(ast: Ast) -> Self {
        AstItem::Node(ast)
    }
}

impl From<&str> for AstItem {
    fn from(s: &str) -> Self {
        AstItem::Str(s.to_owned())
    }
}

impl From<String> for AstItem {
    fn from(s: String) -> Self {
        AstItem::Str(s)
    }
}

/// A tagged tree node.
#[derive(Debug, Clone, PartialEq)]
pub struct Ast {
    pub kind: AstKind,
    pub items: Vec<AstItem>,
    pub serial: u64,
    /// Optional display name, set by callers; has no semantic effect.
    pub name: Option<String>,
}

impl Ast {
    pub fn new(kind: AstKind) -> Self {
        Self {
            kind,
            items: Vec::new(),
            serial: next_serial(),
            name: None,
        }
    }

    pub fn with_items(kind: AstKind, items: Vec<AstItem>) -> Self {
        let mut ast = Ast::new(kind);
        ast.items = items;
        ast
    }

    pub fn append(&mut self, item: impl Into<AstItem>) {
        self.items.push(item.into());
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Child nodes in order, skipping leaf items.
    pub fn children(&self) -> impl Iterator<Item = &Ast> {
        self.items.iter().filter_map(AstItem::as_node)
    }

    /// Fetches item `idx` as a sub-tree, or reports the malformation.
    pub fn node(&self, idx: usize) -> Result<&Ast, InterpError> {
        self.items
            .get(idx)
            .and_then(AstItem::as_node)
            .ok_or_else(|| self.malformed(format!("item {idx} is not a node")))
    }

    /// Fetches item `idx` as a string leaf, or reports the malformation.
    pub fn leaf_str(&self, idx: usize) -> Result<&str, InterpError> {
        self.items
            .get(idx)
            .and_then(AstItem::as_str)
            .ok_or_else(|| self.malformed(format!("item {idx} is not a string leaf")))
    }

    /// Checks the item count invariant for this node.
    pub fn expect_len(&self, len: usize) -> Result<(), InterpError> {
        if self.items.len() == len {
            Ok(())
        } else {
            Err(self.malformed(format!("expected {len} item(s), found {}", self.items.len())))
        }
    }

    pub fn malformed(&self, detail: impl Into<String>) -> InterpError {
        InterpError::Malformed {
            kind: self.kind.to_string(),
            detail: detail.into(),
        }
    }

    /// Re-assigns fresh serial numbers to this node and every node below
    /// it. Used when a captured tree is spliced into a decoded tree.
    pub fn renumber(&mut self) {
        self.serial = next_serial();
        for item in &mut self.items {
            if let AstItem::Node(child) = item {
                child.renumber();
            }
        }
    }

    /// Indented dump of the tree without serial numbers; stable across
    /// runs and used by the snapshot tests.
    pub fn tree_string(&self) -> String {
        let mut out = String::new();
        self.tree_into(&mut out, 0);
        out
    }

    fn tree_into(&self, out: &mut String, depth: usize) {
        let pad = "  ".repeat(depth);
        let _ = writeln!(out, "{pad}{}", self.kind);
        for item in &self.items {
            match item {
                AstItem::Node(child) => child.tree_into(out, depth + 1),
                AstItem::Int(v) => {
                    let _ = writeln!(out, "{pad}  {v}");
                }
                AstItem::Float(v) => {
                    let _ = writeln!(out, "{pad}  {v:?}");
                }
                AstItem::Str(v) => {
                    let _ = writeln!(out, "{pad}  {v:?}");
                }
                AstItem::Bool(v) => {
                    let _ = writeln!(out, "{pad}  {v}");
                }
                AstItem::Nil => {
                    let _ = writeln!(out, "{pad}  nil");
                }
            }
        }
    }

    /// Source-like rendering with each dispatchable command wrapped in
    /// `<div class=SERIAL>` markers, consumed by the execution monitor.
    pub fn render_marked(&self) -> String {
        let mut r = Renderer {
            out: String::new(),
            marked: true,
        };
        r.node(self, 0);
        r.out
    }
}

impl fmt::Display for Ast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut r = Renderer {
            out: String::new(),
            marked: false,
        };
        r.node(self, 0);
        f.write_str(&r.out)
    }
}

struct Renderer {
    out: String,
    marked: bool,
}

impl Renderer {
    fn pad(&mut self, depth: usize) {
        for _ in 0..depth {
            self.out.push_str("  ");
        }
    }

    fn expr(&mut self, ast: &Ast) -> String {
        let mut r = Renderer {
            out: String::new(),
            marked: false,
        };
        r.node(ast, 0);
        r.out
    }

    fn item(&mut self, item: &AstItem) -> String {
        match item {
            AstItem::Node(ast) => self.expr(ast),
            AstItem::Int(v) => v.to_string(),
            AstItem::Float(v) => format!("{v:?}"),
            AstItem::Str(v) => v.clone(),
            AstItem::Bool(v) => v.to_string().to_uppercase(),
            AstItem::Nil => String::new(),
        }
    }

    fn joined(&mut self, items: &[AstItem], sep: &str) -> String {
        items
            .iter()
            .map(|i| self.item(i))
            .collect::<Vec<_>>()
            .join(sep)
    }

    fn stmt_list(&mut self, ast: &Ast, depth: usize) {
        // cmdlist and block bodies render one statement per line
        for item in &ast.items {
            if let AstItem::Node(child) = item {
                if child.kind == AstKind::Nop {
                    continue;
                }
                self.node(child, depth);
            }
        }
    }

    fn line(&mut self, depth: usize, text: &str) {
        self.pad(depth);
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn marked_line(&mut self, ast: &Ast, depth: usize, text: &str) {
        if self.marked {
            let serial = ast.serial;
            self.line(
                depth,
                &format!("<div class={serial}>{text}</div class={serial}>"),
            );
        } else {
            self.line(depth, text);
        }
    }

    fn node(&mut self, ast: &Ast, depth: usize) {
        match ast.kind {
            AstKind::Number | AstKind::Str => {
                let text = ast.items.first().map(|i| self.item(i)).unwrap_or_default();
                self.out.push_str(&text);
            }
            AstKind::QStr => {
                let text = ast.items.first().map(|i| self.item(i)).unwrap_or_default();
                let _ = write!(self.out, "\"{text}\"");
            }
            AstKind::LStr => {
                let text = ast.items.first().map(|i| self.item(i)).unwrap_or_default();
                let _ = write!(self.out, "[{text}]");
            }
            AstKind::IdRef => {
                let text = ast.items.first().map(|i| self.item(i)).unwrap_or_default();
                let _ = write!(self.out, "${text}");
            }
            AstKind::AliasRef => {
                let text = ast.items.first().map(|i| self.item(i)).unwrap_or_default();
                let _ = write!(self.out, "!{text}");
            }
            AstKind::RegRef => {
                let text = ast.items.first().map(|i| self.item(i)).unwrap_or_default();
                let _ = write!(self.out, "@{text}");
            }
            AstKind::FrameIdRef => {
                let text = ast.items.first().map(|i| self.item(i)).unwrap_or_default();
                let _ = write!(self.out, "&GET_F_NO[{text}]");
            }
            AstKind::Monad => {
                let op = ast.items.first().map(|i| self.item(i)).unwrap_or_default();
                let arg = ast.items.get(1).map(|i| self.item(i)).unwrap_or_default();
                if op.chars().all(|c| c.is_ascii_alphabetic()) {
                    let _ = write!(self.out, "{op} {arg}");
                } else {
                    let _ = write!(self.out, "{op}{arg}");
                }
            }
            AstKind::Dyad => {
                let lhs = ast.items.first().map(|i| self.item(i)).unwrap_or_default();
                let op = ast.items.get(1).map(|i| self.item(i)).unwrap_or_default();
                let rhs = ast.items.get(2).map(|i| self.item(i)).unwrap_or_default();
                let _ = write!(self.out, "{lhs} {op} {rhs}");
            }
            AstKind::AsNum => {
                let inner = ast.items.first().map(|i| self.item(i)).unwrap_or_default();
                let _ = write!(self.out, "({inner})");
            }
            AstKind::FuncCall => {
                let name = ast.items.first().map(|i| self.item(i)).unwrap_or_default();
                let args = ast.items.get(1).map(|i| self.item(i)).unwrap_or_default();
                let _ = write!(self.out, "{name}({args})");
            }
            AstKind::ProcCall => {
                let name = ast.items.first().map(|i| self.item(i)).unwrap_or_default();
                let args = ast.items.get(1).map(|i| self.item(i)).unwrap_or_default();
                let _ = write!(self.out, "@{name}({args})");
            }
            AstKind::ArgList | AstKind::ExprList | AstKind::KwdParams => {
                let joined = self.joined(&ast.items, ", ");
                self.out.push_str(&joined);
            }
            AstKind::ParamList => {
                let joined = self.joined(&ast.items, " ");
                self.out.push_str(&joined);
            }
            AstKind::KeyValuePair => {
                let key = ast
                    .items
                    .first()
                    .and_then(AstItem::as_str)
                    .unwrap_or_default()
                    .to_uppercase();
                let val = ast.items.get(1).map(|i| self.item(i)).unwrap_or_default();
                let _ = write!(self.out, "{key}={val}");
            }
            AstKind::IdList => {
                let joined = self.joined(&ast.items, " ");
                self.out.push_str(&joined);
            }
            AstKind::VarList => {
                let joined = self.joined(&ast.items, ", ");
                self.out.push_str(&joined);
            }
            AstKind::Skeleton => {
                if let Some(AstItem::Node(params)) = ast.items.first() {
                    let text = self.expr(params);
                    if !text.is_empty() {
                        self.line(depth, &text);
                    }
                }
                if let Some(AstItem::Node(body)) = ast.items.get(1) {
                    self.node(body, depth);
                }
            }
            AstKind::CommandSection => {
                self.line(depth, ":START");
                if let Ok(pre) = ast.node(0) {
                    self.node(pre, depth);
                }
                self.line(depth, ":MAIN_START");
                if let Ok(main) = ast.node(1) {
                    self.node(main, depth);
                }
                self.line(depth, ":MAIN_END");
                if let Ok(post) = ast.node(2) {
                    self.node(post, depth);
                }
                self.line(depth, ":END");
            }
            AstKind::CmdList => self.stmt_list(ast, depth),
            AstKind::Block => {
                self.line(depth, "{");
                self.stmt_list(ast, depth + 1);
                self.line(depth, "}");
            }
            AstKind::Sync => {
                if let Ok(inner) = ast.node(0) {
                    self.node(inner, depth);
                    // move the separator onto the rendered statement
                    if self.out.ends_with('\n') {
                        self.out.pop();
                    }
                    self.out.push_str(" ;\n");
                }
            }
            AstKind::Async => {
                if let Ok(inner) = ast.node(0) {
                    self.node(inner, depth);
                    if self.out.ends_with('\n') {
                        self.out.pop();
                    }
                    self.out.push_str(" ,\n");
                }
            }
            AstKind::Exec => {
                let subsys = ast.items.first().map(|i| self.item(i)).unwrap_or_default();
                let cmd = ast.items.get(1).map(|i| self.item(i)).unwrap_or_default();
                let params = ast.items.get(2).map(|i| self.item(i)).unwrap_or_default();
                let resvar = ast.items.get(3).map(|i| self.item(i)).unwrap_or_default();
                let mut text = String::new();
                if !resvar.is_empty() {
                    let _ = write!(text, "{}=", resvar.to_uppercase());
                }
                let _ = write!(text, "EXEC {subsys} {cmd}");
                if !params.is_empty() {
                    let _ = write!(text, " {params}");
                }
                self.marked_line(ast, depth, &text);
            }
            AstKind::AbsCmd => {
                let name = ast.items.first().map(|i| self.item(i)).unwrap_or_default();
                let params = ast.items.get(1).map(|i| self.item(i)).unwrap_or_default();
                let text = if params.is_empty() {
                    name
                } else {
                    format!("{name} {params}")
                };
                self.marked_line(ast, depth, &text);
            }
            AstKind::StarSub => {
                let name = ast.items.first().map(|i| self.item(i)).unwrap_or_default();
                let params = ast.items.get(1).map(|i| self.item(i)).unwrap_or_default();
                let text = if params.is_empty() {
                    format!("*SUB {name}")
                } else {
                    format!("*SUB {name} {params}")
                };
                self.marked_line(ast, depth, &text);
            }
            AstKind::IfList | AstKind::StarIf => {
                let star = if ast.kind == AstKind::StarIf { "*" } else { "" };
                for (idx, cond) in ast.children().enumerate() {
                    let pred = cond.items.first();
                    let is_else = matches!(pred, Some(AstItem::Bool(true)));
                    if is_else {
                        self.line(depth, &format!("{star}ELSE"));
                    } else {
                        let pred = pred.map(|i| self.item(i)).unwrap_or_default();
                        let kw = if idx == 0 { "IF" } else { "ELIF" };
                        self.line(depth, &format!("{star}{kw} {pred}"));
                    }
                    if let Some(AstItem::Node(body)) = cond.items.get(1) {
                        self.node(body, depth + 1);
                    }
                }
                self.line(depth, &format!("{star}ENDIF"));
            }
            AstKind::Cond => {
                // only rendered standalone in debug contexts
                let joined = self.joined(&ast.items, " -> ");
                self.out.push_str(&joined);
            }
            AstKind::StarFor => {
                let count = ast.items.first().map(|i| self.item(i)).unwrap_or_default();
                let vars = ast.items.get(1).map(|i| self.item(i)).unwrap_or_default();
                let seq = ast.items.get(2).map(|i| self.item(i)).unwrap_or_default();
                if seq.is_empty() {
                    self.line(depth, &format!("*FOR {count} {vars} IN"));
                } else {
                    self.line(depth, &format!("*FOR {count} {vars} IN {seq}"));
                }
                if let Some(AstItem::Node(body)) = ast.items.get(3) {
                    self.node(body, depth + 1);
                }
                self.line(depth, "*ENDFOR");
            }
            AstKind::While => {
                let pred = ast.items.first().map(|i| self.item(i)).unwrap_or_default();
                self.line(depth, &format!("WHILE {pred}"));
                if let Some(AstItem::Node(body)) = ast.items.get(1) {
                    self.node(body, depth);
                }
            }
            AstKind::Let => {
                let params = ast.items.first().map(|i| self.item(i)).unwrap_or_default();
                self.line(depth, &format!("LET {params} IN"));
                if let Some(AstItem::Node(body)) = ast.items.get(1) {
                    self.node(body, depth);
                }
            }
            AstKind::Set => {
                let params = ast.items.first().map(|i| self.item(i)).unwrap_or_default();
                self.line(depth, &format!("ASN {params}"));
            }
            AstKind::StarSet => {
                let params = ast.items.first().map(|i| self.item(i)).unwrap_or_default();
                let flags = match ast.items.get(1) {
                    Some(AstItem::Node(list)) => {
                        let rendered = self.expr(list);
                        rendered
                            .split(", ")
                            .filter(|f| !f.is_empty())
                            .map(|f| format!("-{f}"))
                            .collect::<Vec<_>>()
                            .join(" ")
                    }
                    _ => String::new(),
                };
                if flags.is_empty() {
                    self.line(depth, &format!("*SET {params}"));
                } else {
                    self.line(depth, &format!("*SET {flags} {params}"));
                }
            }
            AstKind::Proc => {
                let name = ast.items.first().map(|i| self.item(i)).unwrap_or_default();
                let vars = ast.items.get(1).map(|i| self.item(i)).unwrap_or_default();
                self.line(depth, &format!("DEF {name}({vars})"));
                if let Some(AstItem::Node(body)) = ast.items.get(2) {
                    self.node(body, depth);
                }
            }
            AstKind::Import => {
                let module = ast.items.first().map(|i| self.item(i)).unwrap_or_default();
                let vars = ast.items.get(1).map(|i| self.item(i)).unwrap_or_default();
                self.line(depth, &format!("FROM \"{module}\" IMPORT {vars}"));
            }
            AstKind::Catch => {
                let var = ast.items.first().map(|i| self.item(i)).unwrap_or_default();
                self.line(depth, &format!("CATCH {var}"));
                if let Some(AstItem::Node(body)) = ast.items.get(1) {
                    self.node(body, depth);
                }
            }
            AstKind::Raise => {
                let expr = ast.items.first().map(|i| self.item(i)).unwrap_or_default();
                self.line(depth, &format!("RAISE {expr}"));
            }
            AstKind::Return => {
                if ast.items.is_empty() {
                    self.line(depth, "RETURN");
                } else {
                    let expr = ast.items.first().map(|i| self.item(i)).unwrap_or_default();
                    self.line(depth, &format!("RETURN {expr}"));
                }
            }
            AstKind::Nop => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn qstring(text: &str) -> Ast {
        Ast::with_items(AstKind::QStr, vec![text.into()])
    }

    #[test]
    fn test_serials_are_monotonic() {
        let a = Ast::new(AstKind::Nop);
        let b = Ast::new(AstKind::Nop);
        let c = Ast::new(AstKind::Nop);
        assert!(a.serial < b.serial);
        assert!(b.serial < c.serial);
    }

    #[test]
    fn test_renumber_is_deep_and_fresh() {
        let mut kv = Ast::new(AstKind::KeyValuePair);
        kv.append("mode");
        kv.append(qstring("ON"));
        let old_outer = kv.serial;
        let old_inner = kv.node(1).unwrap().serial;

        kv.renumber();
        assert_ne!(kv.serial, old_outer);
        assert_ne!(kv.node(1).unwrap().serial, old_inner);
    }

    #[test]
    fn test_render_exec() {
        let mut params = Ast::new(AstKind::ParamList);
        let mut kv = Ast::new(AstKind::KeyValuePair);
        kv.append("mode");
        kv.append(qstring("ON"));
        params.append(kv);

        let exec = Ast::with_items(
            AstKind::Exec,
            vec![
                Ast::with_items(AstKind::Str, vec!["TSCL".into()]).into(),
                Ast::with_items(AstKind::Str, vec!["AG_TRACK".into()]).into(),
                params.into(),
                AstItem::Nil,
            ],
        );
        assert_eq!(exec.to_string(), "EXEC TSCL AG_TRACK MODE=\"ON\"\n");
    }

    #[test]
    fn test_render_marked_wraps_commands() {
        let exec = Ast::with_items(
            AstKind::Exec,
            vec![
                Ast::with_items(AstKind::Str, vec!["TSCV".into()]).into(),
                Ast::with_items(AstKind::Str, vec!["SHUTTER".into()]).into(),
                Ast::new(AstKind::ParamList).into(),
                AstItem::Nil,
            ],
        );
        let serial = exec.serial;
        let marked = exec.render_marked();
        assert_eq!(
            marked,
            format!("<div class={serial}>EXEC TSCV SHUTTER</div class={serial}>\n")
        );
    }

    #[test]
    fn test_tree_string_has_no_serials() {
        let num = Ast::with_items(AstKind::Number, vec![AstItem::Int(5)]);
        assert_eq!(num.tree_string(), "number\n  5\n");
    }
}
