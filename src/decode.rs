// SPDX-License-Identifier: SEE LICENSE IN LICENSE.md
// SPDX-FileCopyrightText: 2023 CYBERTEC PostgreSQL International GmbH
// <office@cybertec.at>

//! Single-pass tree decoding before interpretation.
//!
//! The decoder rewrites a statement tree against a snapshot of the
//! evaluator's environment: closure-bound references are replaced by
//! their captured trees, preprocessor forms (`*IF`, `*FOR`, `*SET`,
//! `*SUB`) unfold into their run-time siblings, and every emitted node
//! gets a fresh serial number so monitoring can refer to the decoded
//! tree. `sync`/`async` markers pass through untouched.

use tracing::debug;

use crate::ast::{Ast, AstItem, AstKind};
use crate::error::DecodeError;
use crate::eval::{Binding, Evaluator, Value};

// closure substitution is expected to bottom out almost immediately;
// the cap only exists to turn self-referential bindings into an error
const MAX_SUBST_DEPTH: usize = 64;

pub struct Decoder<'a> {
    eval: &'a Evaluator,
}

impl<'a> Decoder<'a> {
    pub fn new(eval: &'a Evaluator) -> Self {
        Self { eval }
    }

    /// Decodes a statement tree into a fresh, fully re-serialized tree.
    pub fn decode(&self, ast: &Ast) -> Result<Ast, DecodeError> {
        self.decode_node(ast, 0)
    }

    fn decode_node(&self, ast: &Ast, depth: usize) -> Result<Ast, DecodeError> {
        if depth > MAX_SUBST_DEPTH {
            return Err(DecodeError::BadLoop(
                "parameter substitution does not terminate".into(),
            ));
        }

        match ast.kind {
            AstKind::IdRef => self.decode_ref(ast, depth, true),
            AstKind::RegRef => self.decode_ref(ast, depth, false),
            AstKind::StarIf => {
                let mut node = Ast::new(AstKind::IfList);
                for item in &ast.items {
                    node.append(self.decode_item(item, depth)?);
                }
                Ok(node)
            }
            AstKind::StarSet => {
                if let Some(AstItem::Node(flags)) = ast.items.get(1) {
                    debug!(flags = %flags, "dropping *SET flags");
                }
                let params = ast
                    .items
                    .first()
                    .and_then(AstItem::as_node)
                    .ok_or_else(|| DecodeError::BadLoop("malformed *SET".into()))?;
                let params = self.decode_node(params, depth)?;
                Ok(Ast::with_items(AstKind::Set, vec![params.into()]))
            }
            AstKind::StarSub => {
                let name_ast = ast
                    .items
                    .first()
                    .and_then(AstItem::as_node)
                    .ok_or_else(|| DecodeError::BadLoop("malformed *SUB".into()))?;
                let name = self.decode_node(name_ast, depth)?;
                if !matches!(name.kind, AstKind::Str | AstKind::QStr) {
                    return Err(DecodeError::NonLiteralName(name.to_string()));
                }
                let params = ast
                    .items
                    .get(1)
                    .and_then(AstItem::as_node)
                    .ok_or_else(|| DecodeError::BadLoop("malformed *SUB".into()))?;
                let params = self.decode_node(params, depth)?;
                Ok(Ast::with_items(
                    AstKind::AbsCmd,
                    vec![name.into(), params.into()],
                ))
            }
            AstKind::StarFor => self.unfold_star_for(ast, depth),
            AstKind::CmdList => {
                let mut node = Ast::new(AstKind::CmdList);
                for item in &ast.items {
                    let decoded = self.decode_item(item, depth)?;
                    // unfolding may leave nops behind; drop them here
                    if let AstItem::Node(child) = &decoded {
                        if child.kind == AstKind::Nop {
                            continue;
                        }
                    }
                    node.items.push(decoded);
                }
                if node.is_empty() {
                    Ok(Ast::new(AstKind::Nop))
                } else {
                    Ok(node)
                }
            }
            _ => {
                let mut items = Vec::with_capacity(ast.items.len());
                for item in &ast.items {
                    items.push(self.decode_item(item, depth)?);
                }
                let mut node = Ast::with_items(ast.kind, items);
                node.name = ast.name.clone();
                Ok(node)
            }
        }
    }

    fn decode_item(&self, item: &AstItem, depth: usize) -> Result<AstItem, DecodeError> {
        match item {
            AstItem::Node(child) => Ok(self.decode_node(child, depth)?.into()),
            leaf => Ok(leaf.clone()),
        }
    }

    /// Substitutes a `$name` / `@name` reference when the binding is
    /// known. Closures splice their captured tree (decoded once more so
    /// nested references resolve); literal values become literal nodes;
    /// unknown names stay in place for the evaluator to report.
    fn decode_ref(&self, ast: &Ast, depth: usize, variable: bool) -> Result<Ast, DecodeError> {
        let Some(name) = ast.items.first().and_then(AstItem::as_str) else {
            return Err(DecodeError::BadLoop("reference without a name".into()));
        };
        let resolver = if variable {
            &self.eval.variables
        } else {
            &self.eval.registers
        };

        match resolver.get(name) {
            Some(Binding::Closure(closure)) => self.decode_node(closure.ast(), depth + 1),
            Some(Binding::Value(value)) => match value_to_ast(value) {
                Some(node) => Ok(node),
                // sentinels and opaque values stay symbolic
                None => self.reclone(ast),
            },
            None => self.reclone(ast),
        }
    }

    fn reclone(&self, ast: &Ast) -> Result<Ast, DecodeError> {
        let mut node = ast.clone();
        node.renumber();
        Ok(node)
    }

    /// Unrolls `*FOR count vars IN seq body *ENDFOR` by decoding one
    /// copy of the body per iteration with the loop variables bound.
    fn unfold_star_for(&self, ast: &Ast, depth: usize) -> Result<Ast, DecodeError> {
        let count_ast = ast
            .items
            .first()
            .and_then(AstItem::as_node)
            .ok_or_else(|| DecodeError::BadLoop("*FOR without a count".into()))?;
        let count = match self.eval.eval(count_ast)? {
            Value::Int(v) if v >= 0 => v as usize,
            Value::Float(v) if v >= 0.0 => v as usize,
            Value::Str(s) => s
                .trim()
                .parse::<usize>()
                .map_err(|_| DecodeError::BadLoop(format!("bad *FOR count '{s}'")))?,
            other => {
                return Err(DecodeError::BadLoop(format!("bad *FOR count '{other}'")));
            }
        };

        let idlist = ast
            .items
            .get(1)
            .and_then(AstItem::as_node)
            .ok_or_else(|| DecodeError::BadLoop("*FOR without loop variables".into()))?;
        let mut names = Vec::new();
        for var in idlist.children() {
            match var.kind {
                AstKind::IdRef | AstKind::Str | AstKind::QStr => {
                    let name = var
                        .items
                        .first()
                        .and_then(AstItem::as_str)
                        .ok_or_else(|| DecodeError::BadLoop("unnamed loop variable".into()))?;
                    names.push(name.to_owned());
                }
                _ => {
                    return Err(DecodeError::BadLoop(format!(
                        "loop variable is not a name: {var}"
                    )));
                }
            }
        }
        if names.is_empty() {
            return Err(DecodeError::BadLoop("*FOR without loop variables".into()));
        }

        let seq = match ast.items.get(2) {
            Some(AstItem::Node(seq_ast)) => {
                let values = match self.eval.eval(seq_ast)? {
                    Value::List(items) => items,
                    Value::Str(s) => s
                        .split_whitespace()
                        .map(|w| Value::Str(w.to_owned()))
                        .collect(),
                    other => vec![other],
                };
                if values.is_empty() {
                    None
                } else {
                    Some(values)
                }
            }
            _ => None,
        };

        let body = ast
            .items
            .get(3)
            .and_then(AstItem::as_node)
            .ok_or_else(|| DecodeError::BadLoop("*FOR without a body".into()))?;

        let mut out = Ast::new(AstKind::CmdList);
        for i in 0..count {
            let mut env = self.eval.clone();
            for (j, name) in names.iter().enumerate() {
                let value = match &seq {
                    Some(values) => values[(i * names.len() + j) % values.len()].clone(),
                    None => Value::Int(i as i64),
                };
                env.variables.set(name, value);
            }

            let unrolled = Decoder::new(&env).decode_node(body, depth + 1)?;
            match unrolled.kind {
                AstKind::CmdList => out.items.extend(unrolled.items),
                AstKind::Nop => {}
                _ => out.append(unrolled),
            }
        }

        if out.is_empty() {
            Ok(Ast::new(AstKind::Nop))
        } else {
            Ok(out)
        }
    }
}

/// A literal tree for a plain value; `None` for values that must stay
/// symbolic (the NOP sentinel, procedures).
fn value_to_ast(value: &Value) -> Option<Ast> {
    match value {
        Value::Int(v) => Some(Ast::with_items(AstKind::Number, vec![AstItem::Int(*v)])),
        Value::Float(v) => Some(Ast::with_items(AstKind::Number, vec![AstItem::Float(*v)])),
        Value::Str(s) => Some(Ast::with_items(AstKind::QStr, vec![s.as_str().into()])),
        Value::List(items) => {
            let body = items
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(" ");
            Some(Ast::with_items(AstKind::LStr, vec![body.into()]))
        }
        Value::Nop | Value::Nil | Value::Proc(_) => None,
    }
}
