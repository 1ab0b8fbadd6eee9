// SPDX-License-Identifier: SEE LICENSE IN LICENSE.md
// SPDX-FileCopyrightText: 2023 CYBERTEC PostgreSQL International GmbH
// <office@cybertec.at>

//! Expression evaluation against variable, register, status and frame
//! resolvers.

pub mod env;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use lazy_static::lazy_static;
use tracing::warn;

use crate::ast::{Ast, AstItem, AstKind};
use crate::error::EvalError;
use crate::service::{FrameSource, StatusSource, STATERROR, STATNONE};
pub use env::{Binding, Closure, ParamMap, Resolver};

/// A user procedure defined with `DEF`, applied against the call-time
/// environment.
#[derive(Debug)]
pub struct Procedure {
    pub name: String,
    pub params: Vec<String>,
    pub body: Ast,
}

/// Run-time values.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    /// The "parameter not present" sentinel.
    Nop,
    Nil,
    Proc(Arc<Procedure>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Nop, Value::Nop) => true,
            (Value::Nil, Value::Nil) => true,
            (Value::Proc(a), Value::Proc(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v:?}"),
            Value::Str(v) => write!(f, "{v}"),
            Value::List(items) => {
                let body = items
                    .iter()
                    .map(|i| i.to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                write!(f, "{body}")
            }
            Value::Nop => write!(f, "NOP"),
            Value::Nil => Ok(()),
            Value::Proc(p) => write!(f, "<proc {}>", p.name),
        }
    }
}

enum Num {
    I(i64),
    F(f64),
}

fn to_num(value: &Value) -> Option<Num> {
    match value {
        Value::Int(v) => Some(Num::I(*v)),
        Value::Float(v) => Some(Num::F(*v)),
        Value::Str(s) => {
            let s = s.trim();
            if let Ok(v) = s.parse::<i64>() {
                Some(Num::I(v))
            } else if let Ok(v) = s.parse::<f64>() {
                Some(Num::F(v))
            } else {
                None
            }
        }
        _ => None,
    }
}

fn as_f64(n: &Num) -> f64 {
    match n {
        Num::I(v) => *v as f64,
        Num::F(v) => *v,
    }
}

/// Hook through which expression-level procedure calls reach the
/// interpreter; installed by the interpreter before a run.
pub type ProcHook = Arc<
    dyn Fn(&Procedure, Vec<Value>, IndexMap<String, Value>, &Evaluator) -> Result<Value, EvalError>
        + Send
        + Sync,
>;

type BuiltinFn = fn(&str, Vec<Value>) -> Result<Value, EvalError>;

lazy_static! {
    static ref BUILTINS: HashMap<&'static str, BuiltinFn> = {
        let mut t: HashMap<&'static str, BuiltinFn> = HashMap::new();
        t.insert("INT", builtin_int);
        t.insert("FLOAT", builtin_float);
        t.insert("STR", builtin_str);
        t.insert("LEN", builtin_len);
        t.insert("ABS", builtin_abs);
        t.insert("MIN", builtin_min);
        t.insert("MAX", builtin_max);
        t.insert("UPPER", builtin_upper);
        t.insert("LOWER", builtin_lower);
        t
    };
}

fn one_arg(name: &str, mut args: Vec<Value>) -> Result<Value, EvalError> {
    if args.len() != 1 {
        return Err(EvalError::BadArity {
            name: name.to_owned(),
            got: args.len(),
        });
    }
    Ok(args.swap_remove(0))
}

fn numeric_arg(name: &str, value: &Value) -> Result<Num, EvalError> {
    to_num(value).ok_or_else(|| EvalError::TypeMismatch(format!("{name}() needs a number, got '{value}'")))
}

fn builtin_int(name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    let v = one_arg(name, args)?;
    Ok(Value::Int(as_f64(&numeric_arg(name, &v)?) as i64))
}

fn builtin_float(name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    let v = one_arg(name, args)?;
    Ok(Value::Float(as_f64(&numeric_arg(name, &v)?)))
}

fn builtin_str(name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    let v = one_arg(name, args)?;
    Ok(Value::Str(v.to_string()))
}

fn builtin_len(name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    match one_arg(name, args)? {
        Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
        Value::List(items) => Ok(Value::Int(items.len() as i64)),
        other => Err(EvalError::TypeMismatch(format!(
            "LEN() needs a string or list, got '{other}'"
        ))),
    }
}

fn builtin_abs(name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    let v = one_arg(name, args)?;
    match numeric_arg(name, &v)? {
        Num::I(v) => Ok(Value::Int(v.abs())),
        Num::F(v) => Ok(Value::Float(v.abs())),
    }
}

fn extremum(name: &str, args: Vec<Value>, take_max: bool) -> Result<Value, EvalError> {
    if args.is_empty() {
        return Err(EvalError::BadArity {
            name: name.to_owned(),
            got: 0,
        });
    }
    let mut best: Option<Value> = None;
    for arg in args {
        let candidate = as_f64(&numeric_arg(name, &arg)?);
        let replace = match &best {
            None => true,
            Some(b) => {
                let current = as_f64(&numeric_arg(name, b)?);
                if take_max {
                    candidate > current
                } else {
                    candidate < current
                }
            }
        };
        if replace {
            best = Some(arg);
        }
    }
    Ok(best.unwrap_or(Value::Nil))
}

fn builtin_min(name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    extremum(name, args, false)
}

fn builtin_max(name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    extremum(name, args, true)
}

fn builtin_upper(name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    let v = one_arg(name, args)?;
    Ok(Value::Str(v.to_string().to_uppercase()))
}

fn builtin_lower(name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    let v = one_arg(name, args)?;
    Ok(Value::Str(v.to_string().to_lowercase()))
}

/// Recursive evaluator over expression trees.
#[derive(Clone)]
pub struct Evaluator {
    pub variables: Resolver,
    pub registers: Resolver,
    status: Arc<dyn StatusSource>,
    frames: Arc<dyn FrameSource>,
    proc_hook: Option<ProcHook>,
}

impl fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Evaluator")
            .field("variables", &self.variables)
            .field("registers", &self.registers)
            .finish_non_exhaustive()
    }
}

impl Evaluator {
    pub fn new(status: Arc<dyn StatusSource>, frames: Arc<dyn FrameSource>) -> Self {
        let mut variables = Resolver::new();
        // the NOP sentinel is always in scope as $NOP
        variables.set("NOP", Value::Nop);
        Self {
            variables,
            registers: Resolver::new(),
            status,
            frames,
            proc_hook: None,
        }
    }

    pub fn set_proc_hook(&mut self, hook: ProcHook) {
        self.proc_hook = Some(hook);
    }

    pub fn status_source(&self) -> Arc<dyn StatusSource> {
        Arc::clone(&self.status)
    }

    pub fn frame_source(&self) -> Arc<dyn FrameSource> {
        Arc::clone(&self.frames)
    }

    /// Truthiness: nonzero numbers, non-empty strings and non-empty
    /// lists are true; `0`, `""`, `NOP` and absent values are false.
    pub fn is_true(&self, value: &Value) -> bool {
        match value {
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Nop | Value::Nil => false,
            Value::Proc(_) => true,
        }
    }

    pub fn eval(&self, ast: &Ast) -> Result<Value, EvalError> {
        match ast.kind {
            AstKind::Number => match ast.items.first() {
                Some(AstItem::Int(v)) => Ok(Value::Int(*v)),
                Some(AstItem::Float(v)) => Ok(Value::Float(*v)),
                _ => Err(EvalError::Malformed("number".into())),
            },
            AstKind::Str | AstKind::QStr | AstKind::LStr => ast
                .items
                .first()
                .and_then(AstItem::as_str)
                .map(|s| Value::Str(s.to_owned()))
                .ok_or_else(|| EvalError::Malformed(ast.kind.to_string())),
            AstKind::IdRef => {
                let name = self.leaf(ast)?;
                // registers are the fallback so `ASN X=5` is visible
                // through a later `$X`
                match self.variables.get(name).or_else(|| self.registers.get(name)) {
                    Some(binding) => binding.force(),
                    None => Err(EvalError::Undefined(name.to_uppercase())),
                }
            }
            AstKind::RegRef => {
                let name = self.leaf(ast)?;
                match self.registers.get(name) {
                    Some(binding) => binding.force(),
                    None => Err(EvalError::Undefined(name.to_uppercase())),
                }
            }
            AstKind::AliasRef => {
                let alias = self.leaf(ast)?;
                let value = self.status.fetch_one(alias)?;
                if let Value::Str(s) = &value {
                    if s == STATNONE {
                        warn!(alias, "status fetch returned STATNONE");
                    } else if s == STATERROR {
                        warn!(alias, "status fetch returned STATERROR");
                    }
                }
                Ok(value)
            }
            AstKind::FrameIdRef => {
                let spec = self.leaf(ast)?;
                self.eval_frame_ref(spec)
            }
            AstKind::Monad => {
                let op = ast
                    .items
                    .first()
                    .and_then(AstItem::as_str)
                    .ok_or_else(|| EvalError::Malformed("monad".into()))?;
                let arg = self.eval(self.node(ast, 1)?)?;
                self.eval_monad(op, arg)
            }
            AstKind::Dyad => self.eval_dyad(ast),
            AstKind::FuncCall => {
                let name = self
                    .leaf(ast)?
                    .to_uppercase();
                let args_ast = self.node(ast, 1)?;
                let (args, kwargs) = self.eval_args(Some(args_ast))?;
                if !kwargs.is_empty() {
                    return Err(EvalError::TypeMismatch(format!(
                        "{name}() takes no keyword arguments"
                    )));
                }
                match BUILTINS.get(name.as_str()) {
                    Some(f) => f(&name, args),
                    None => Err(EvalError::UnknownFunction(name)),
                }
            }
            AstKind::ProcCall => {
                let name = self.leaf(ast)?;
                let binding = self
                    .registers
                    .get(name)
                    .ok_or_else(|| EvalError::Undefined(name.to_uppercase()))?;
                let value = binding.force()?;
                let Value::Proc(proc) = value else {
                    return Err(EvalError::NotCallable(name.to_uppercase()));
                };
                let args_ast = ast.items.get(1).and_then(AstItem::as_node);
                let (args, kwargs) = self.eval_args(args_ast)?;
                match &self.proc_hook {
                    Some(hook) => hook(&proc, args, kwargs, self),
                    None => Err(EvalError::NotCallable(name.to_uppercase())),
                }
            }
            AstKind::AsNum => self.eval(self.node(ast, 0)?),
            _ => Err(EvalError::Malformed(ast.kind.to_string())),
        }
    }

    fn leaf<'a>(&self, ast: &'a Ast) -> Result<&'a str, EvalError> {
        ast.items
            .first()
            .and_then(AstItem::as_str)
            .ok_or_else(|| EvalError::Malformed(ast.kind.to_string()))
    }

    fn node<'a>(&self, ast: &'a Ast, idx: usize) -> Result<&'a Ast, EvalError> {
        ast.items
            .get(idx)
            .and_then(AstItem::as_node)
            .ok_or_else(|| EvalError::Malformed(ast.kind.to_string()))
    }

    /// `&GET_F_NO[INSTRUMENT TYPE [COUNT]]`
    fn eval_frame_ref(&self, spec: &str) -> Result<Value, EvalError> {
        let parts: Vec<&str> = spec.split_whitespace().collect();
        let (instrument, frame_type, count) = match parts.as_slice() {
            [inst, ftype] => (*inst, *ftype, None),
            [inst, ftype, count] => {
                let n: usize = count
                    .parse()
                    .map_err(|_| EvalError::Frame(format!("bad frame count '{count}'")))?;
                (*inst, *ftype, Some(n))
            }
            _ => return Err(EvalError::Frame(format!("bad frame spec '{spec}'"))),
        };

        let n = count.unwrap_or(1);
        let frames = self.frames.get_frames(instrument, frame_type, n)?;
        if frames.len() != n {
            return Err(EvalError::Frame(format!(
                "number of frames allocated ({}) does not match request ({n})",
                frames.len()
            )));
        }
        let first = frames
            .first()
            .ok_or_else(|| EvalError::Frame("frame service returned nothing".into()))?;
        match count {
            None => Ok(Value::Str(first.clone())),
            Some(n) => Ok(Value::Str(format!("{first}:{n:04}"))),
        }
    }

    fn eval_monad(&self, op: &str, arg: Value) -> Result<Value, EvalError> {
        match op {
            "-" => match to_num(&arg) {
                Some(Num::I(v)) => Ok(Value::Int(-v)),
                Some(Num::F(v)) => Ok(Value::Float(-v)),
                None => Err(EvalError::TypeMismatch(format!("cannot negate '{arg}'"))),
            },
            "NOT" => Ok(Value::Int(i64::from(!self.is_true(&arg)))),
            _ => Err(EvalError::Malformed(format!("monad operator '{op}'"))),
        }
    }

    fn eval_dyad(&self, ast: &Ast) -> Result<Value, EvalError> {
        let op = ast
            .items
            .get(1)
            .and_then(AstItem::as_str)
            .ok_or_else(|| EvalError::Malformed("dyad".into()))?;
        let lhs_ast = self.node(ast, 0)?;
        let rhs_ast = self.node(ast, 2)?;

        // AND / OR short-circuit and yield the deciding operand
        if op == "AND" {
            let lhs = self.eval(lhs_ast)?;
            if !self.is_true(&lhs) {
                return Ok(lhs);
            }
            return self.eval(rhs_ast);
        }
        if op == "OR" {
            let lhs = self.eval(lhs_ast)?;
            if self.is_true(&lhs) {
                return Ok(lhs);
            }
            return self.eval(rhs_ast);
        }

        let lhs = self.eval(lhs_ast)?;
        let rhs = self.eval(rhs_ast)?;
        self.apply_dyad(op, lhs, rhs)
    }

    fn apply_dyad(&self, op: &str, lhs: Value, rhs: Value) -> Result<Value, EvalError> {
        match op {
            "+" | "-" | "*" | "/" => self.arith(op, lhs, rhs),
            "==" | "!=" | "<" | "<=" | ">" | ">=" => {
                let ordering = match (to_num(&lhs), to_num(&rhs)) {
                    (Some(a), Some(b)) => as_f64(&a).partial_cmp(&as_f64(&b)),
                    _ => Some(lhs.to_string().cmp(&rhs.to_string())),
                };
                let Some(ordering) = ordering else {
                    return Err(EvalError::TypeMismatch(format!(
                        "cannot compare '{lhs}' with '{rhs}'"
                    )));
                };
                let result = match op {
                    "==" => ordering.is_eq(),
                    "!=" => ordering.is_ne(),
                    "<" => ordering.is_lt(),
                    "<=" => ordering.is_le(),
                    ">" => ordering.is_gt(),
                    ">=" => ordering.is_ge(),
                    _ => unreachable!(),
                };
                Ok(Value::Int(i64::from(result)))
            }
            _ => Err(EvalError::Malformed(format!("dyad operator '{op}'"))),
        }
    }

    fn arith(&self, op: &str, lhs: Value, rhs: Value) -> Result<Value, EvalError> {
        let (a, b) = match (to_num(&lhs), to_num(&rhs)) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                // string concatenation is the one non-numeric case
                if op == "+" {
                    if let (Value::Str(a), Value::Str(b)) = (&lhs, &rhs) {
                        return Ok(Value::Str(format!("{a}{b}")));
                    }
                }
                return Err(EvalError::TypeMismatch(format!(
                    "cannot apply '{op}' to '{lhs}' and '{rhs}'"
                )));
            }
        };

        // division always promotes; the other operators stay integral
        // when both operands are
        match (op, a, b) {
            ("/", a, b) => {
                let denom = as_f64(&b);
                if denom == 0.0 {
                    return Err(EvalError::TypeMismatch("division by zero".into()));
                }
                Ok(Value::Float(as_f64(&a) / denom))
            }
            ("+", Num::I(a), Num::I(b)) => Ok(Value::Int(a + b)),
            ("-", Num::I(a), Num::I(b)) => Ok(Value::Int(a - b)),
            ("*", Num::I(a), Num::I(b)) => Ok(Value::Int(a * b)),
            ("+", a, b) => Ok(Value::Float(as_f64(&a) + as_f64(&b))),
            ("-", a, b) => Ok(Value::Float(as_f64(&a) - as_f64(&b))),
            ("*", a, b) => Ok(Value::Float(as_f64(&a) * as_f64(&b))),
            _ => Err(EvalError::Malformed(format!("arith operator '{op}'"))),
        }
    }

    /// Evaluates a `param_list` or `kwd_params` into a case-insensitive
    /// (upper-cased) name → value map.
    pub fn eval_params(&self, list: &Ast) -> Result<IndexMap<String, Value>, EvalError> {
        let mut map = IndexMap::new();
        for kv in list.children() {
            let (name, value_ast) = self.split_pair(kv)?;
            map.insert(name, self.eval(value_ast)?);
        }
        Ok(map)
    }

    /// Closes each parameter value over the current environment for
    /// later forcing (used when dispatching abstract commands).
    pub fn close_params(&self, list: &Ast) -> Result<ParamMap, EvalError> {
        let mut map = ParamMap::new();
        for kv in list.children() {
            let (name, value_ast) = self.split_pair(kv)?;
            let closure = Closure::new(value_ast.clone(), self.clone());
            map.insert(name, Binding::Closure(Arc::new(closure)));
        }
        Ok(map)
    }

    fn split_pair<'a>(&self, kv: &'a Ast) -> Result<(String, &'a Ast), EvalError> {
        if kv.kind != AstKind::KeyValuePair {
            return Err(EvalError::Malformed(kv.kind.to_string()));
        }
        let name = self.leaf(kv)?.to_uppercase();
        let value_ast = self.node(kv, 1)?;
        Ok((name, value_ast))
    }

    /// Splits an `arg_list` into positional values and keyword values.
    pub fn eval_args(
        &self,
        args: Option<&Ast>,
    ) -> Result<(Vec<Value>, IndexMap<String, Value>), EvalError> {
        let mut positional = Vec::new();
        let mut keyword = IndexMap::new();
        let Some(args) = args else {
            return Ok((positional, keyword));
        };

        for item in args.children() {
            if item.kind == AstKind::KeyValuePair {
                let (name, value_ast) = self.split_pair(item)?;
                keyword.insert(name, self.eval(value_ast)?);
            } else {
                positional.push(self.eval(item)?);
            }
        }
        Ok((positional, keyword))
    }

    /// Binds a skeleton's default parameters into the variables,
    /// closing each value over the environment built so far.
    pub fn set_params(&mut self, list: &Ast, close: bool) -> Result<(), EvalError> {
        for kv in list.children() {
            let (name, value_ast) = self.split_pair(kv)?;
            let binding = if close {
                Binding::Closure(Arc::new(Closure::new(value_ast.clone(), self.clone())))
            } else {
                Binding::Value(self.eval(value_ast)?)
            };
            self.variables.set(&name, binding);
        }
        Ok(())
    }

    /// Substitutes actual parameters over the defaults. With `nonew`,
    /// an actual that matches no default is an error.
    pub fn set_vars(&mut self, params: ParamMap, nonew: bool) -> Result<(), EvalError> {
        for (name, binding) in params {
            if nonew {
                self.variables.set_existing(&name, binding)?;
            } else {
                self.variables.set(&name, binding);
            }
        }
        Ok(())
    }
}
