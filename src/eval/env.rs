// SPDX-License-Identifier: SEE LICENSE IN LICENSE.md
// SPDX-FileCopyrightText: 2023 CYBERTEC PostgreSQL International GmbH
// <office@cybertec.at>

//! Name resolution environments: frame-stacked, case-insensitive
//! variable and register stores, and closures over them.
//!
//! Frames are `Arc`-shared copy-on-write maps, so cloning an evaluator
//! (for a closure capture, an async child or a `LET` scope) is cheap
//! and later mutation of the original never retroactively changes a
//! captured snapshot.

use std::sync::Arc;
use std::sync::OnceLock;

use indexmap::IndexMap;

use crate::ast::Ast;
use crate::error::EvalError;
use crate::eval::{Evaluator, Value};

/// A value, or an unevaluated closure forced on first use.
#[derive(Debug, Clone)]
pub enum Binding {
    Value(Value),
    Closure(Arc<Closure>),
}

impl Binding {
    /// Evaluates closures idempotently; plain values pass through.
    pub fn force(&self) -> Result<Value, EvalError> {
        match self {
            Binding::Value(v) => Ok(v.clone()),
            Binding::Closure(c) => c.force(),
        }
    }
}

impl From<Value> for Binding {
    fn from(v: Value) -> Self {
        Binding::Value(v)
    }
}

/// Case-insensitive parameter map used across dispatch boundaries.
pub type ParamMap = IndexMap<String, Binding>;

/// An unevaluated expression paired with the environment that was live
/// at its capture site. `force` caches the first successful value.
#[derive(Debug)]
pub struct Closure {
    expr: Ast,
    env: Evaluator,
    cache: OnceLock<Value>,
}

impl Closure {
    pub fn new(expr: Ast, env: Evaluator) -> Self {
        Self {
            expr,
            env,
            cache: OnceLock::new(),
        }
    }

    pub fn ast(&self) -> &Ast {
        &self.expr
    }

    pub fn force(&self) -> Result<Value, EvalError> {
        if let Some(cached) = self.cache.get() {
            return Ok(cached.clone());
        }
        let value = self.env.eval(&self.expr)?;
        let _ = self.cache.set(value.clone());
        Ok(value)
    }
}

/// A stack of copy-on-write frames with case-insensitive keys.
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    frames: Vec<Arc<IndexMap<String, Binding>>>,
}

impl Resolver {
    pub fn new() -> Self {
        Self {
            frames: vec![Arc::new(IndexMap::new())],
        }
    }

    pub fn from_map(map: ParamMap) -> Self {
        let mut resolver = Self::new();
        for (name, binding) in map {
            resolver.set(&name, binding);
        }
        resolver
    }

    /// Pushes a new innermost frame holding `bindings`.
    pub fn push(&mut self, bindings: ParamMap) {
        let mut frame = IndexMap::new();
        for (name, binding) in bindings {
            frame.insert(name.to_uppercase(), binding);
        }
        self.frames.push(Arc::new(frame));
    }

    /// Pops the innermost frame. The outermost frame is never popped.
    pub fn pop(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    /// Innermost-first lookup.
    pub fn get(&self, name: &str) -> Option<&Binding> {
        let key = name.to_uppercase();
        self.frames.iter().rev().find_map(|frame| frame.get(&key))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Stores into the innermost frame that already defines `name`;
    /// a new name lands in the outermost frame so a binding made inside
    /// a `LET` or procedure frame survives the frame pop.
    pub fn set(&mut self, name: &str, binding: impl Into<Binding>) {
        let key = name.to_uppercase();
        let binding = binding.into();

        let target = self
            .frames
            .iter()
            .rposition(|frame| frame.contains_key(&key))
            .unwrap_or(0);
        if let Some(frame) = self.frames.get_mut(target) {
            Arc::make_mut(frame).insert(key, binding);
        }
    }

    /// Stores only over an existing binding; unknown names fail. Used
    /// when actual parameters must match declared defaults.
    pub fn set_existing(&mut self, name: &str, binding: impl Into<Binding>) -> Result<(), EvalError> {
        if !self.contains(name) {
            return Err(EvalError::Undefined(name.to_uppercase()));
        }
        self.set(name, binding);
        Ok(())
    }

    /// Every visible name, shadowing respected, in no particular order.
    pub fn names(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for frame in self.frames.iter().rev() {
            for name in frame.keys() {
                if !seen.contains(name) {
                    seen.push(name.clone());
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{NullStatusSource, SerialFrameSource};
    use pretty_assertions::assert_eq;

    fn value(resolver: &Resolver, name: &str) -> Value {
        resolver.get(name).unwrap().force().unwrap()
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mut r = Resolver::new();
        r.set("ExpTime", Value::Int(10));
        assert_eq!(value(&r, "EXPTIME"), Value::Int(10));
        assert_eq!(value(&r, "exptime"), Value::Int(10));
        assert_eq!(value(&r, "eXpTiMe"), Value::Int(10));
    }

    #[test]
    fn test_push_shadows_and_pop_restores() {
        let mut r = Resolver::new();
        r.set("A", Value::Int(1));

        let mut frame = ParamMap::new();
        frame.insert("A".into(), Value::Int(2).into());
        r.push(frame);
        assert_eq!(value(&r, "A"), Value::Int(2));

        r.pop();
        assert_eq!(value(&r, "A"), Value::Int(1));
    }

    #[test]
    fn test_set_writes_to_defining_frame() {
        let mut r = Resolver::new();
        r.set("A", Value::Int(1));

        let mut frame = ParamMap::new();
        frame.insert("B".into(), Value::Int(2).into());
        r.push(frame);

        // A is defined in the outer frame; the write lands there. A
        // brand-new name lands in the outermost frame and survives the
        // pop; the pushed frame's own B does not.
        r.set("A", Value::Int(9));
        r.set("NEW", Value::Int(7));
        r.pop();
        assert_eq!(value(&r, "A"), Value::Int(9));
        assert_eq!(value(&r, "NEW"), Value::Int(7));
        assert!(r.get("B").is_none());
    }

    #[test]
    fn test_set_existing_rejects_unknown() {
        let mut r = Resolver::new();
        r.set("KNOWN", Value::Int(1));
        assert!(r.set_existing("KNOWN", Value::Int(2)).is_ok());
        assert_eq!(
            r.set_existing("TYPO", Value::Int(3)),
            Err(EvalError::Undefined("TYPO".into()))
        );
    }

    #[test]
    fn test_clone_is_a_snapshot() {
        let mut r = Resolver::new();
        r.set("A", Value::Int(1));
        let snapshot = r.clone();

        r.set("A", Value::Int(2));
        assert_eq!(value(&snapshot, "A"), Value::Int(1));
        assert_eq!(value(&r, "A"), Value::Int(2));
    }

    #[test]
    fn test_closure_force_is_idempotent() {
        use crate::grammar;

        let parse = grammar::parse_params("X=1+2");
        let kv = parse.ast.node(0).unwrap();
        let expr = kv.node(1).unwrap().clone();

        let env = Evaluator::new(
            Arc::new(NullStatusSource),
            Arc::new(SerialFrameSource::new()),
        );
        let closure = Closure::new(expr, env);
        assert_eq!(closure.force().unwrap(), Value::Int(3));
        assert_eq!(closure.force().unwrap(), Value::Int(3));
    }
}
