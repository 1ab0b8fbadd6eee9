// SPDX-License-Identifier: SEE LICENSE IN LICENSE.md
// SPDX-FileCopyrightText: 2023 CYBERTEC PostgreSQL International GmbH
// <office@cybertec.at>

//! Tree-walking interpreter for decoded command trees.
//!
//! One handler per statement kind; unknown kinds fail with
//! [`InterpError::NoInterpretation`]. Synchronous commands run in
//! source order; asynchronous commands spawn child tasks that the
//! enclosing command list joins before it returns. The
//! `:MAIN_START … :MAIN_END` span runs under the global skeleton
//! critical-section lock.

pub mod task;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::ast::{Ast, AstItem, AstKind};
use crate::decode::Decoder;
use crate::error::{EvalError, ExecError, InterpError, RunError};
use crate::eval::{Binding, Evaluator, ParamMap, Procedure, Value};
use crate::grammar;
use task::{spawn_task, AsyncHandle, ExecContext};

const JOIN_POLL: Duration = Duration::from_millis(10);

/// Result of interpreting a statement: either a plain value, or a value
/// travelling upward from a `RETURN` until a procedure (or the top
/// level) absorbs it.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    Normal(Value),
    Return(Value),
}

impl Flow {
    pub fn into_value(self) -> Value {
        match self {
            Flow::Normal(v) | Flow::Return(v) => v,
        }
    }
}

type InterpResult = Result<Flow, RunError>;

fn now_secs() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| format!("{:.3}", d.as_secs_f64()))
        .unwrap_or_default()
}

/// Tree-walking executor for one running script.
#[derive(Clone)]
pub struct Interpreter {
    pub ctx: ExecContext,
    sk_id: Arc<Mutex<String>>,
}

impl Interpreter {
    pub fn new(ctx: ExecContext) -> Self {
        Self {
            ctx,
            sk_id: Arc::new(Mutex::new(String::new())),
        }
    }

    /// Top-level entry: decodes `ast` against the environment, reports
    /// the decoded tree to the monitor, then interprets it.
    pub fn run(&self, ast: &Ast, eval: &mut Evaluator) -> Result<Value, RunError> {
        self.ctx.check_state()?;

        let hook_interp = self.clone();
        eval.set_proc_hook(Arc::new(move |proc, args, kwargs, env| {
            // expression-position calls run against a snapshot
            let mut env = env.clone();
            hook_interp
                .apply_proc(proc, args, kwargs, &mut env)
                .map_err(|e| match e {
                    RunError::Eval(e) => e,
                    other => EvalError::ProcFailed(other.to_string()),
                })
        }));

        let decoded = Decoder::new(eval).decode(ast)?;

        let sk_id = format!("{}.{}", std::process::id(), decoded.serial);
        *self.sk_id.lock() = sk_id.clone();

        self.ctx.publish("ast_buf", &decoded.render_marked());
        self.ctx.publish("ast_id", &sk_id);
        self.ctx.publish("ast_time", &now_secs());
        info!(ast_id = %sk_id, "=== DECODING RESULT ===\n{decoded}");

        let flow = self.interpret(&decoded, eval)?;
        Ok(flow.into_value())
    }

    fn interpret(&self, ast: &Ast, eval: &mut Evaluator) -> InterpResult {
        self.ctx.check_state()?;
        debug!(kind = %ast.kind, serial = ast.serial, "interpreting");

        match ast.kind {
            AstKind::CommandSection => self.interp_command_section(ast, eval),
            AstKind::CmdList | AstKind::Block => self.block_exec(ast, eval),
            AstKind::IfList | AstKind::StarIf => self.interp_if_list(ast, eval),
            AstKind::While => self.interp_while(ast, eval),
            AstKind::Catch => self.interp_catch(ast, eval),
            AstKind::Raise => self.interp_raise(ast, eval),
            AstKind::Return => self.interp_return(ast, eval),
            AstKind::Set | AstKind::StarSet => self.interp_set(ast, eval),
            AstKind::Let => self.interp_let(ast, eval),
            AstKind::Proc => self.interp_proc(ast, eval),
            AstKind::ProcCall => self.interp_proc_call(ast, eval),
            AstKind::Import => self.interp_import(ast, eval),
            AstKind::Exec => self.interp_exec(ast, eval),
            AstKind::AbsCmd => self.interp_abscmd(ast, eval),
            AstKind::Nop => Ok(Flow::Normal(Value::Int(0))),
            other => Err(InterpError::NoInterpretation(other.to_string()).into()),
        }
    }

    /// Preamble, then the critical section around the main part, then
    /// the endpart after the lock is released. The RAII guard makes
    /// sure errors crossing the section never leak the lock.
    fn interp_command_section(&self, ast: &Ast, eval: &mut Evaluator) -> InterpResult {
        ast.expect_len(3)?;
        let pre = ast.node(0)?;
        let main = ast.node(1)?;
        let post = ast.node(2)?;

        let flow = self.interpret(pre, eval)?;
        if let Flow::Return(v) = flow {
            return Ok(Flow::Return(v));
        }

        let main_result = {
            let _guard = self.ctx.lock_critical_section();
            self.ctx.publish("main_start", &now_secs());
            let result = self.interpret(main, eval);
            self.ctx.publish("main_end", &now_secs());
            result
        };

        match main_result? {
            Flow::Return(v) => Ok(Flow::Return(v)),
            Flow::Normal(_) => self.interpret(post, eval),
        }
    }

    /// Runs a command list: sync children complete in source order,
    /// async children are launched in source order and joined at the
    /// end of the list. A `return` child stops the list and carries its
    /// value upward.
    fn block_exec(&self, ast: &Ast, eval: &mut Evaluator) -> InterpResult {
        let mut result = Flow::Normal(Value::Int(0));
        let mut pending: Vec<AsyncHandle> = Vec::new();
        let mut failure: Option<RunError> = None;

        for item in &ast.items {
            let Some(child) = item.as_node() else {
                continue;
            };

            if let Err(e) = self.ctx.check_state() {
                failure = Some(e);
                break;
            }

            match child.kind {
                AstKind::Nop => continue,
                AstKind::Return => {
                    match self.interp_return(child, eval) {
                        Ok(flow) => result = flow,
                        Err(e) => failure = Some(e),
                    }
                    break;
                }
                AstKind::Async => {
                    let inner = match child.node(0) {
                        Ok(n) => n,
                        Err(e) => {
                            failure = Some(e.into());
                            break;
                        }
                    };
                    let name = inner
                        .name
                        .clone()
                        .unwrap_or_else(|| format!("{}#{}", inner.kind, inner.serial));
                    let interp = self.clone();
                    let sub = inner.clone();
                    let mut env = eval.clone();
                    pending.push(spawn_task(name, move || {
                        interp.interpret(&sub, &mut env).map(Flow::into_value)
                    }));
                }
                _ => {
                    // sync markers unfold; everything else is implicitly
                    // synchronous
                    let stmt = if child.kind == AstKind::Sync {
                        match child.node(0) {
                            Ok(n) => n,
                            Err(e) => {
                                failure = Some(e.into());
                                break;
                            }
                        }
                    } else {
                        child
                    };
                    match self.interpret(stmt, eval) {
                        Ok(Flow::Normal(v)) => result = Flow::Normal(v),
                        Ok(Flow::Return(v)) => {
                            result = Flow::Return(v);
                            break;
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
            }
        }

        // the list boundary is a join barrier for its async children,
        // even when a statement already failed
        while !pending.is_empty() {
            if failure.is_none() {
                if let Err(e) = self.ctx.check_state() {
                    failure = Some(e);
                }
            }
            let mut still_running = Vec::new();
            for handle in pending {
                match handle.wait(Some(JOIN_POLL)) {
                    Ok(_) => {
                        debug!(task = handle.name(), "async child joined");
                    }
                    Err(RunError::Timeout) => still_running.push(handle),
                    Err(e) => {
                        warn!(task = handle.name(), error = %e, "async child failed");
                        if failure.is_none() {
                            failure = Some(e);
                        }
                    }
                }
            }
            pending = still_running;
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    /// The first `cond` rib whose predicate holds runs its body; a
    /// `true` predicate marks the ELSE clause.
    fn interp_if_list(&self, ast: &Ast, eval: &mut Evaluator) -> InterpResult {
        for cond in ast.children() {
            if cond.kind != AstKind::Cond {
                return Err(ast.malformed("expected cond rib").into());
            }
            cond.expect_len(2)?;
            let body = cond.node(1)?;

            match cond.items.first() {
                Some(AstItem::Bool(true)) => return self.interpret(body, eval),
                Some(AstItem::Node(pred)) => {
                    let value = eval.eval(pred)?;
                    if eval.is_true(&value) {
                        return self.interpret(body, eval);
                    }
                }
                _ => return Err(cond.malformed("predicate is neither expression nor ELSE").into()),
            }
        }
        Ok(Flow::Normal(Value::Int(0)))
    }

    fn interp_while(&self, ast: &Ast, eval: &mut Evaluator) -> InterpResult {
        ast.expect_len(2)?;
        let pred = ast.node(0)?;
        let body = ast.node(1)?;

        loop {
            self.ctx.check_state()?;
            let value = eval.eval(pred)?;
            if !eval.is_true(&value) {
                break;
            }
            match self.interpret(body, eval) {
                Ok(Flow::Normal(_)) => {}
                Ok(Flow::Return(v)) => return Ok(Flow::Return(v)),
                Err(RunError::Break) => {
                    info!("breaking loop");
                    break;
                }
                Err(RunError::Continue) => {
                    info!("continuing loop");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Flow::Normal(Value::Int(0)))
    }

    /// Binds the body's outcome (value or catchable error) to the named
    /// register and succeeds. Cancellation and timeouts pass through.
    fn interp_catch(&self, ast: &Ast, eval: &mut Evaluator) -> InterpResult {
        ast.expect_len(2)?;
        let var = ast.leaf_str(0)?.to_owned();
        let body = ast.node(1)?;

        let bound = match self.interpret(body, eval) {
            Ok(flow) => flow.into_value(),
            Err(e) if e.is_catchable() => {
                info!(error = %e, "caught exception in CATCH");
                Value::Str(catch_value(&e))
            }
            Err(e) => return Err(e),
        };
        eval.registers.set(&var, bound);
        Ok(Flow::Normal(Value::Int(0)))
    }

    fn interp_raise(&self, ast: &Ast, eval: &mut Evaluator) -> InterpResult {
        ast.expect_len(1)?;
        let value = eval.eval(ast.node(0)?)?;
        let message = value.to_string();
        match message.to_uppercase().as_str() {
            "BREAK" => Err(RunError::Break),
            "CONTINUE" => Err(RunError::Continue),
            _ => Err(RunError::User(message)),
        }
    }

    fn interp_return(&self, ast: &Ast, eval: &mut Evaluator) -> InterpResult {
        match ast.items.first() {
            Some(AstItem::Node(expr)) => Ok(Flow::Return(eval.eval(expr)?)),
            _ => Ok(Flow::Return(Value::Int(0))),
        }
    }

    /// `ASN` (and decoded `*SET`) stores evaluated parameters into the
    /// registers.
    fn interp_set(&self, ast: &Ast, eval: &mut Evaluator) -> InterpResult {
        let params_ast = ast.node(0)?;
        let params = eval.eval_params(params_ast)?;
        for (name, value) in params {
            eval.registers.set(&name, value);
        }
        Ok(Flow::Normal(Value::Int(0)))
    }

    fn interp_let(&self, ast: &Ast, eval: &mut Evaluator) -> InterpResult {
        ast.expect_len(2)?;
        let params = eval.eval_params(ast.node(0)?)?;
        let body = ast.node(1)?;

        let mut frame = ParamMap::new();
        for (name, value) in params {
            frame.insert(name, value.into());
        }
        eval.registers.push(frame);
        let result = self.interpret(body, eval);
        eval.registers.pop();
        result
    }

    fn interp_proc(&self, ast: &Ast, eval: &mut Evaluator) -> InterpResult {
        ast.expect_len(3)?;
        let name = ast.leaf_str(0)?.to_owned();
        let varlist = ast.node(1)?;
        let body = ast.node(2)?;

        let mut params = Vec::new();
        for item in &varlist.items {
            match item.as_str() {
                Some(var) => params.push(var.to_uppercase()),
                None => return Err(varlist.malformed("procedure parameter is not a name").into()),
            }
        }

        let proc = Procedure {
            name: name.clone(),
            params,
            body: body.clone(),
        };
        eval.registers.set(&name, Value::Proc(Arc::new(proc)));
        Ok(Flow::Normal(Value::Int(0)))
    }

    fn interp_proc_call(&self, ast: &Ast, eval: &mut Evaluator) -> InterpResult {
        ast.expect_len(2)?;
        let name = ast.leaf_str(0)?;
        let binding = eval
            .registers
            .get(name)
            .ok_or_else(|| EvalError::Undefined(name.to_uppercase()))?
            .clone();
        let value = binding.force()?;
        let Value::Proc(proc) = value else {
            return Err(EvalError::NotCallable(name.to_uppercase()).into());
        };

        let args_ast = ast.items.get(1).and_then(AstItem::as_node);
        let (args, kwargs) = eval.eval_args(args_ast)?;
        info!(proc = %proc.name, ?args, "calling procedure");
        let value = self.apply_proc(&proc, args, kwargs, eval)?;
        Ok(Flow::Normal(value))
    }

    /// Applies a user procedure: fresh register frame, positional args
    /// bound to the parameter list in order, then named args; unknown
    /// names are rejected.
    fn apply_proc(
        &self,
        proc: &Procedure,
        args: Vec<Value>,
        kwargs: IndexMap<String, Value>,
        eval: &mut Evaluator,
    ) -> Result<Value, RunError> {
        if args.len() > proc.params.len() {
            return Err(ExecError::Failed {
                cmd: proc.name.clone(),
                detail: format!(
                    "takes {} argument(s), got {}",
                    proc.params.len(),
                    args.len()
                ),
            }
            .into());
        }

        let mut frame = ParamMap::new();
        for (param, value) in proc.params.iter().zip(args) {
            frame.insert(param.clone(), value.into());
        }
        for (name, value) in kwargs {
            if !proc.params.iter().any(|p| p.eq_ignore_ascii_case(&name)) {
                return Err(ExecError::Failed {
                    cmd: proc.name.clone(),
                    detail: format!("parameter '{name}' not defined in procedure"),
                }
                .into());
            }
            frame.insert(name, value.into());
        }

        eval.registers.push(frame);
        let result = self.interpret(&proc.body, eval);
        eval.registers.pop();
        Ok(result?.into_value())
    }

    fn interp_import(&self, ast: &Ast, eval: &mut Evaluator) -> InterpResult {
        ast.expect_len(2)?;
        let module = ast.leaf_str(0)?;
        let varlist = ast.node(1)?;
        let index = self.ctx.modules.lookup(module)?;

        for item in &varlist.items {
            let Some(var) = item.as_str() else {
                return Err(varlist.malformed("import name is not a word").into());
            };
            let value = index
                .get(&var.to_uppercase())
                .cloned()
                .ok_or_else(|| ExecError::NoExport {
                    module: module.to_owned(),
                    name: var.to_owned(),
                })?;
            eval.registers.set(var, value);
        }
        Ok(Flow::Normal(Value::Int(0)))
    }

    /// Device-dependent command dispatch through the task registry.
    fn interp_exec(&self, ast: &Ast, eval: &mut Evaluator) -> InterpResult {
        ast.expect_len(4)?;
        let subsys = eval.eval(ast.node(0)?)?.to_string();
        let cmdname = eval.eval(ast.node(1)?)?.to_string();
        let mut params = eval.eval_params(ast.node(2)?)?;
        let resvar = match ast.items.get(3) {
            Some(AstItem::Str(var)) => Some(var.clone()),
            _ => None,
        };

        // NOP-valued parameters mean "not present" and never cross the
        // dispatch boundary
        params.retain(|_, v| !matches!(v, Value::Nop));

        let bindings: ParamMap = params
            .into_iter()
            .map(|(k, v)| (k, Binding::Value(v)))
            .collect();
        let cmd_str = format!(
            "EXEC {subsys} {} {}",
            cmdname.to_uppercase(),
            fmt_params(&bindings)
        )
        .trim_end()
        .to_owned();
        info!("EXECDD: {cmd_str}");

        let factory = self.ctx.registry.get(&cmdname, &subsys)?;
        let mut command = factory.instantiate(bindings)?;

        let child_ctx = self.ctx.child(&format!("t{}", ast.serial));
        self.publish_dispatch(ast, &cmd_str, &child_ctx.tag);

        match command.run(&child_ctx) {
            Ok(value) => {
                if let Some(var) = &resvar {
                    eval.registers.set(var, value.clone());
                }
                Ok(Flow::Normal(value))
            }
            Err(e @ (RunError::Cancel | RunError::Timeout)) => Err(e),
            Err(e) => match &resvar {
                None => Err(e),
                Some(var) => {
                    warn!(error = %e, "command failed; storing result code");
                    eval.registers.set(var, Value::Int(1));
                    Ok(Flow::Normal(Value::Int(1)))
                }
            },
        }
    }

    /// Abstract command dispatch: parameters close over the current
    /// environment, `OBE_ID`/`OBE_MODE` are forced to locate the
    /// skeleton task factory, and the command runs as a nested
    /// interpreter invocation.
    fn interp_abscmd(&self, ast: &Ast, eval: &mut Evaluator) -> InterpResult {
        ast.expect_len(2)?;
        let cmdname = eval.eval(ast.node(0)?)?.to_string().to_lowercase();
        let mut params = eval.close_params(ast.node(1)?)?;

        let obe_id = params
            .shift_remove("OBE_ID")
            .ok_or(ExecError::MissingParam("OBE_ID".into()))?
            .force()?
            .to_string();
        let obe_mode = params
            .shift_remove("OBE_MODE")
            .ok_or(ExecError::MissingParam("OBE_MODE".into()))?
            .force()?
            .to_string();
        let subsys = format!("{}_{}", obe_id.to_uppercase(), obe_mode.to_uppercase());

        let cmd_str = format!(
            "{} OBE_ID={obe_id} OBE_MODE={obe_mode} {}",
            cmdname.to_uppercase(),
            fmt_params(&params)
        )
        .trim_end()
        .to_owned();
        info!("EXECAB: {cmd_str}");

        let factory = self.ctx.registry.get(&cmdname, &subsys)?;
        let mut command = factory.instantiate(params)?;

        let child_ctx = self.ctx.child(&format!("t{}", ast.serial));
        self.publish_dispatch(ast, &cmd_str, &child_ctx.tag);

        let value = command.run(&child_ctx)?;
        Ok(Flow::Normal(value))
    }

    fn publish_dispatch(&self, ast: &Ast, cmd_str: &str, child_tag: &str) {
        self.ctx.publish("ast_num", &ast.serial.to_string());
        self.ctx.publish("ast_str", cmd_str);
        self.ctx.publish("ast_track", child_tag);
        self.ctx.publish("ast_id", &self.sk_id.lock().clone());
        self.ctx.publish("ast_time", &now_secs());
    }
}

/// The string a `CATCH` handler binds for an intercepted error.
fn catch_value(error: &RunError) -> String {
    match error {
        RunError::User(message) => message.clone(),
        RunError::Break => "BREAK".to_owned(),
        RunError::Continue => "CONTINUE".to_owned(),
        other => other.to_string(),
    }
}

/// Renders a parameter map the way dispatch log lines show it: sorted
/// upper-case keys, closures shown as their source expression, values
/// with embedded spaces quoted.
pub(crate) fn fmt_params(params: &ParamMap) -> String {
    let mut keys: Vec<&String> = params.keys().collect();
    keys.sort();

    let mut parts = Vec::with_capacity(keys.len());
    for key in keys {
        let val_str = match &params[key] {
            Binding::Closure(closure) => closure.ast().to_string(),
            Binding::Value(value) => value.to_string(),
        };
        let val_str = if val_str.contains(' ') && !val_str.starts_with('"') {
            format!("\"{val_str}\"")
        } else {
            val_str
        };
        parts.push(format!("{}={val_str}", key.to_uppercase()));
    }
    parts.join(" ")
}

/// Parses and runs a one-off command string (the on-the-fly execution
/// path): `envstr` is a bare parameter list closed over as defaults,
/// `cmdstr` a single OPE command.
pub fn run_command(ctx: &ExecContext, cmdstr: &str, envstr: &str) -> Result<Value, RunError> {
    let mut eval = Evaluator::new(Arc::clone(&ctx.status), Arc::clone(&ctx.frames));

    let envstr = envstr.trim();
    if !envstr.is_empty() {
        let parse = grammar::parse_params(envstr);
        if !parse.ok() {
            return Err(RunError::SkeletonParse(
                parse.errors.len(),
                "<parameters>".into(),
                parse.errors[0].to_string(),
            ));
        }
        eval.set_params(&parse.ast, true)?;
    }

    let parse = grammar::command::parse_ope_command(cmdstr);
    if !parse.ok() {
        return Err(RunError::SkeletonParse(
            parse.errors.len(),
            "<command>".into(),
            parse.errors[0].to_string(),
        ));
    }
    let cmd = parse.ast.node(0)?;

    let interp = Interpreter::new(ctx.clone());
    interp.run(cmd, &mut eval)
}
