// SPDX-License-Identifier: SEE LICENSE IN LICENSE.md
// SPDX-FileCopyrightText: 2023 CYBERTEC PostgreSQL International GmbH
// <office@cybertec.at>

//! End-to-end tests: parse → decode → interpret against in-process
//! collaborator doubles.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::{Mutex, ReentrantMutex};
use pretty_assertions::assert_eq;

use obscript::interp::task::ExecContext;
use obscript::service::{
    CallbackFactory, EmptyModuleIndex, LocalMonitor, ModuleIndex, Monitor, NullStatusSource, RegistryMap,
    SerialFrameSource, StaticModuleIndex, TaskRegistry,
};
use obscript::{
    parse_params, parse_sk_commands, register_abstract_commands, run_command, Evaluator,
    Interpreter, RunError, SkBank, Value,
};

type Log = Arc<Mutex<Vec<String>>>;

fn context(registry: Arc<dyn TaskRegistry>, modules: Arc<dyn ModuleIndex>) -> ExecContext {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    ExecContext::new(
        Arc::new(LocalMonitor::new()),
        Arc::new(NullStatusSource),
        Arc::new(SerialFrameSource::new()),
        registry,
        modules,
    )
    .with_sk_lock(Arc::new(ReentrantMutex::new(())))
}

fn simple_context(registry: Arc<RegistryMap>) -> ExecContext {
    context(registry, Arc::new(EmptyModuleIndex))
}

/// Registers a command that logs its invocation (after an optional
/// delay) and returns `result`.
fn register_recorder(
    registry: &RegistryMap,
    name: &'static str,
    subsys: &str,
    log: &Log,
    delay: Option<Duration>,
    result: Value,
) {
    let log = Arc::clone(log);
    registry.register(
        name,
        subsys,
        Arc::new(CallbackFactory::new(move |params, ctx| {
            if let Some(delay) = delay {
                ctx.sleep(delay)?;
            }
            let mut keys: Vec<&String> = params.keys().collect();
            keys.sort();
            let rendered: Vec<String> = keys
                .iter()
                .map(|k| {
                    let value = params[k.as_str()].force().unwrap_or(Value::Nil);
                    format!("{k}={value}")
                })
                .collect();
            log.lock().push(format!("{name} {}", rendered.join(" ")).trim_end().to_owned());
            Ok(result.clone())
        })),
    );
}

/// Parses and runs a skeleton body; returns the outcome and the final
/// environment for inspection.
fn run_main(body: &str, defaults: &str, ctx: &ExecContext) -> (Result<Value, RunError>, Evaluator) {
    let src = format!(":START :MAIN_START {body} :MAIN_END :END");
    let parse = parse_sk_commands(&src, 1);
    assert!(parse.ok(), "{:?}", parse.errors);

    let mut eval = Evaluator::new(Arc::clone(&ctx.status), Arc::clone(&ctx.frames));
    if !defaults.is_empty() {
        let params = parse_params(defaults);
        assert!(params.ok(), "{:?}", params.errors);
        eval.set_params(&params.ast, true).unwrap();
    }

    let interp = Interpreter::new(ctx.clone());
    let result = interp.run(&parse.ast, &mut eval);
    (result, eval)
}

fn register(eval: &Evaluator, name: &str) -> Value {
    eval.registers
        .get(name)
        .unwrap_or_else(|| panic!("register {name} not set"))
        .force()
        .unwrap()
}

#[test]
fn test_set_statements_flow_into_registers() {
    let ctx = simple_context(Arc::new(RegistryMap::new()));
    let (result, eval) = run_main("ASN X=5 ; ASN Y=$X ;", "", &ctx);
    result.unwrap();

    assert_eq!(register(&eval, "X"), Value::Int(5));
    assert_eq!(register(&eval, "Y"), Value::Int(5));
    // case-insensitive keys
    assert_eq!(register(&eval, "y"), Value::Int(5));
}

#[test]
fn test_while_consumes_break_after_one_iteration() {
    let ctx = simple_context(Arc::new(RegistryMap::new()));
    let (result, eval) = run_main(
        "ASN N=0 WHILE 1 { ASN N=$N+1 RAISE \"BREAK\" } ASN DONE=1",
        "",
        &ctx,
    );
    result.unwrap();
    assert_eq!(register(&eval, "N"), Value::Int(1));
    assert_eq!(register(&eval, "DONE"), Value::Int(1));
}

#[test]
fn test_while_continue_keeps_looping() {
    let ctx = simple_context(Arc::new(RegistryMap::new()));
    let (result, eval) = run_main(
        "ASN N=0 WHILE $N < 3 { ASN N=$N+1 IF $N < 3 RAISE \"CONTINUE\" ENDIF }",
        "",
        &ctx,
    );
    result.unwrap();
    assert_eq!(register(&eval, "N"), Value::Int(3));
}

#[test]
fn test_catch_binds_error_message() {
    let ctx = simple_context(Arc::new(RegistryMap::new()));
    let (result, eval) = run_main("CATCH ERR { RAISE \"Trouble at mount\" }", "", &ctx);
    result.unwrap();
    assert_eq!(register(&eval, "ERR"), Value::Str("Trouble at mount".into()));
}

#[test]
fn test_catch_binds_body_result_on_success() {
    let ctx = simple_context(Arc::new(RegistryMap::new()));
    let (result, eval) = run_main("CATCH OUT { ASN A=7 }", "", &ctx);
    result.unwrap();
    assert_eq!(register(&eval, "OUT"), Value::Int(0));
    assert_eq!(register(&eval, "A"), Value::Int(7));
}

#[test]
fn test_uncaught_raise_fails_the_run() {
    let ctx = simple_context(Arc::new(RegistryMap::new()));
    let (result, _) = run_main("RAISE \"E-STOP\"", "", &ctx);
    assert_eq!(result, Err(RunError::User("E-STOP".into())));
}

#[test]
fn test_exec_dispatch_stores_result_variable() {
    let registry = Arc::new(RegistryMap::new());
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    register_recorder(&registry, "QUERY", "OBS", &log, None, Value::Str("GOOD".into()));

    let ctx = simple_context(registry);
    let (result, eval) = run_main("STAT=EXEC OBS QUERY KEY=\"A\" ;", "", &ctx);
    result.unwrap();

    assert_eq!(register(&eval, "STAT"), Value::Str("GOOD".into()));
    assert_eq!(log.lock().clone(), vec!["QUERY KEY=A".to_owned()]);
}

#[test]
fn test_exec_failure_propagates_without_result_variable() {
    let registry = Arc::new(RegistryMap::new());
    registry.register(
        "FAULT",
        "OBS",
        Arc::new(CallbackFactory::new(|_, _| {
            Err(RunError::User("device offline".into()))
        })),
    );

    let ctx = simple_context(Arc::clone(&registry));
    let (result, _) = run_main("EXEC OBS FAULT P=1 ;", "", &ctx);
    assert_eq!(result, Err(RunError::User("device offline".into())));

    // with a result variable the failure is absorbed as code 1
    let ctx = simple_context(registry);
    let (result, eval) = run_main("RC=EXEC OBS FAULT P=1 ;", "", &ctx);
    result.unwrap();
    assert_eq!(register(&eval, "RC"), Value::Int(1));
}

#[test]
fn test_unknown_command_is_an_error() {
    let ctx = simple_context(Arc::new(RegistryMap::new()));
    let (result, _) = run_main("EXEC TSCL NOWHERE P=1 ;", "", &ctx);
    assert!(matches!(
        result,
        Err(RunError::Exec(obscript::ExecError::NoFactory { .. }))
    ));
}

#[test]
fn test_sync_commands_run_in_source_order() {
    let registry = Arc::new(RegistryMap::new());
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    register_recorder(&registry, "FIRST", "S", &log, Some(Duration::from_millis(20)), Value::Int(0));
    register_recorder(&registry, "SECOND", "S", &log, None, Value::Int(0));

    let ctx = simple_context(registry);
    let (result, _) = run_main("EXEC S FIRST N=1 ; EXEC S SECOND N=2 ;", "", &ctx);
    result.unwrap();
    assert_eq!(
        log.lock().clone(),
        vec!["FIRST N=1".to_owned(), "SECOND N=2".to_owned()]
    );
}

#[test]
fn test_async_commands_join_at_list_boundary() {
    let registry = Arc::new(RegistryMap::new());
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    register_recorder(&registry, "SLOW", "S", &log, Some(Duration::from_millis(60)), Value::Int(0));
    register_recorder(&registry, "FAST", "S", &log, Some(Duration::from_millis(5)), Value::Int(0));
    register_recorder(&registry, "AFTER", "S", &log, None, Value::Int(0));

    let ctx = simple_context(registry);
    // the block is a join barrier: SLOW and FAST both finish before
    // AFTER starts
    let (result, _) = run_main(
        "{ EXEC S SLOW N=1 , EXEC S FAST N=2 , } ; EXEC S AFTER N=3 ;",
        "",
        &ctx,
    );
    result.unwrap();

    let entries = log.lock().clone();
    assert_eq!(entries.len(), 3);
    // async children complete in their own order
    assert_eq!(entries[0], "FAST N=2");
    assert_eq!(entries[1], "SLOW N=1");
    assert_eq!(entries[2], "AFTER N=3");
}

#[test]
fn test_async_failure_surfaces_after_join() {
    let registry = Arc::new(RegistryMap::new());
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    register_recorder(&registry, "OK", "S", &log, Some(Duration::from_millis(30)), Value::Int(0));
    registry.register(
        "BAD",
        "S",
        Arc::new(CallbackFactory::new(|_, _| {
            Err(RunError::User("boom".into()))
        })),
    );

    let ctx = simple_context(registry);
    let (result, _) = run_main("EXEC S BAD N=1 , EXEC S OK N=2 ,", "", &ctx);
    assert_eq!(result, Err(RunError::User("boom".into())));
    // the healthy sibling still completed before the error surfaced
    assert_eq!(log.lock().clone(), vec!["OK N=2".to_owned()]);
}

#[test]
fn test_cancellation_unwinds_a_blocked_command() {
    let registry = Arc::new(RegistryMap::new());
    registry.register(
        "HANG",
        "S",
        Arc::new(CallbackFactory::new(|_, ctx| {
            ctx.sleep(Duration::from_secs(30))?;
            Ok(Value::Int(0))
        })),
    );

    let ctx = simple_context(registry);
    let canceller = ctx.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(40));
        canceller.request_cancel();
    });

    let (result, _) = run_main("EXEC S HANG P=1 ;", "", &ctx);
    assert_eq!(result, Err(RunError::Cancel));
}

#[test]
fn test_critical_section_is_mutually_exclusive() {
    let registry = Arc::new(RegistryMap::new());
    let active = Arc::new(AtomicI64::new(0));
    let peak = Arc::new(AtomicI64::new(0));
    {
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        registry.register(
            "BUSY",
            "S",
            Arc::new(CallbackFactory::new(move |_, _| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Int(0))
            })),
        );
    }

    // two executors sharing one critical-section lock
    let shared_lock = Arc::new(ReentrantMutex::new(()));
    let mut handles = Vec::new();
    for _ in 0..2 {
        let ctx = simple_context(Arc::clone(&registry)).with_sk_lock(Arc::clone(&shared_lock));
        handles.push(thread::spawn(move || {
            let (result, _) = run_main("EXEC S BUSY P=1 ;", "", &ctx);
            result
        }));
    }
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[test]
fn test_lock_is_released_when_main_fails() {
    let shared_lock = Arc::new(ReentrantMutex::new(()));

    let ctx = simple_context(Arc::new(RegistryMap::new())).with_sk_lock(Arc::clone(&shared_lock));
    let (result, _) = run_main("RAISE \"broken\"", "", &ctx);
    assert_eq!(result, Err(RunError::User("broken".into())));

    // a second executor on another thread can still enter its section
    let ctx2 = simple_context(Arc::new(RegistryMap::new())).with_sk_lock(shared_lock);
    let handle = thread::spawn(move || {
        let (result, eval) = run_main("ASN OK=1", "", &ctx2);
        result.unwrap();
        register(&eval, "OK")
    });
    assert_eq!(handle.join().unwrap(), Value::Int(1));
}

#[test]
fn test_procedures_definition_call_and_return() {
    let ctx = simple_context(Arc::new(RegistryMap::new()));
    let (result, eval) = run_main(
        "DEF ADDONE(X) { RETURN $X + 1 } ASN R=@ADDONE(4) ; DEF STORE(V) { ASN KEPT=$V } @STORE(9) ;",
        "",
        &ctx,
    );
    result.unwrap();
    assert_eq!(register(&eval, "R"), Value::Int(5));
    assert_eq!(register(&eval, "KEPT"), Value::Int(9));
}

#[test]
fn test_procedure_rejects_unknown_keyword() {
    let ctx = simple_context(Arc::new(RegistryMap::new()));
    let (result, _) = run_main("DEF F(A) { ASN Z=$A } @F(NOPE=1) ;", "", &ctx);
    assert!(matches!(
        result,
        Err(RunError::Exec(obscript::ExecError::Failed { .. }))
    ));
}

#[test]
fn test_let_scopes_registers() {
    let ctx = simple_context(Arc::new(RegistryMap::new()));
    let (result, eval) = run_main(
        "ASN B=0 ASN A=1 LET A=2 IN { ASN B=$A } ASN C=$A",
        "",
        &ctx,
    );
    result.unwrap();
    // inside LET the inner A shadows; the write to B lands in the
    // outer frame and survives
    assert_eq!(register(&eval, "B"), Value::Int(2));
    assert_eq!(register(&eval, "C"), Value::Int(1));
}

#[test]
fn test_import_binds_module_names() {
    let modules = StaticModuleIndex::new();
    let mut names = IndexMap::new();
    names.insert("CENTROID".to_owned(), Value::Float(1.5));
    modules.insert("guider", names);

    let ctx = context(Arc::new(RegistryMap::new()), Arc::new(modules));
    let (result, eval) = run_main(
        "FROM \"guider\" IMPORT CENTROID ASN X=@CENTROID",
        "",
        &ctx,
    );
    result.unwrap();
    assert_eq!(register(&eval, "X"), Value::Float(1.5));
}

#[test]
fn test_default_params_decode_into_commands() {
    let registry = Arc::new(RegistryMap::new());
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    register_recorder(&registry, "EXPOSE", "SPCAM", &log, None, Value::Int(0));

    let ctx = simple_context(registry);
    let (result, _) = run_main(
        "EXEC SPCAM EXPOSE TIME=$EXPTIME ;",
        "EXPTIME=10",
        &ctx,
    );
    result.unwrap();
    assert_eq!(log.lock().clone(), vec!["EXPOSE TIME=10".to_owned()]);
}

#[test]
fn test_nop_parameters_are_stripped_before_dispatch() {
    let registry = Arc::new(RegistryMap::new());
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    register_recorder(&registry, "SETUP", "OBS", &log, None, Value::Int(0));

    let ctx = simple_context(registry);
    let (result, _) = run_main("EXEC OBS SETUP A=1 B=$NOP ;", "", &ctx);
    result.unwrap();
    assert_eq!(log.lock().clone(), vec!["SETUP A=1".to_owned()]);
}

#[test]
fn test_monitor_receives_dispatch_signals() {
    let registry = Arc::new(RegistryMap::new());
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    register_recorder(&registry, "TRACK", "TSCL", &log, None, Value::Int(0));

    let monitor = Arc::new(LocalMonitor::new());
    let monitor_dyn: Arc<dyn Monitor> = Arc::clone(&monitor) as Arc<dyn Monitor>;
    let ctx = ExecContext::new(
        monitor_dyn,
        Arc::new(NullStatusSource),
        Arc::new(SerialFrameSource::new()),
        registry,
        Arc::new(EmptyModuleIndex),
    )
    .with_sk_lock(Arc::new(ReentrantMutex::new(())));

    let (result, _) = run_main("EXEC TSCL TRACK MODE=\"ON\" ;", "", &ctx);
    result.unwrap();

    let ast_str = monitor.get("executor", "ast_str").unwrap();
    assert!(ast_str.contains("EXEC TSCL TRACK"), "{ast_str}");
    assert!(monitor.get("executor", "ast_num").is_some());
    assert!(monitor.get("executor", "ast_track").is_some());
    let ast_buf = monitor.get("executor", "ast_buf").unwrap();
    assert!(ast_buf.contains("<div class="), "{ast_buf}");
}

const TAKE_EXPOSURE_SK: &str = "\
:HEADER
OBS_MOD=IMAG_STANDARD
:PARAMETER_LIST
EXPTIME=10
FILTER=\"R\"
:COMMAND
:START
:MAIN_START
EXEC SPCAM EXPOSE TIME=$EXPTIME FILTER=$FILTER ;
:MAIN_END
:END
";

fn bank_fixture() -> (tempfile::TempDir, Arc<SkBank>) {
    let dir = tempfile::tempdir().unwrap();
    let skdir = dir.path().join("SPCAM").join("sk").join("IMAG");
    std::fs::create_dir_all(&skdir).unwrap();
    std::fs::write(skdir.join("take_exposure.sk"), TAKE_EXPOSURE_SK).unwrap();
    let bank = Arc::new(SkBank::new(dir.path()));
    (dir, bank)
}

#[test]
fn test_abstract_command_runs_nested_skeleton() {
    let (_dir, bank) = bank_fixture();
    let registry = Arc::new(RegistryMap::new());
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    register_recorder(&registry, "EXPOSE", "SPCAM", &log, None, Value::Int(0));
    register_abstract_commands(&registry, &bank, &["SPCAM"]);

    let ctx = simple_context(registry);
    run_command(
        &ctx,
        "TAKE_EXPOSURE OBE_ID=SPCAM OBE_MODE=IMAG EXPTIME=5",
        "",
    )
    .unwrap();

    // the actual parameter overrode the skeleton default, the default
    // filter survived
    assert_eq!(log.lock().clone(), vec!["EXPOSE FILTER=R TIME=5".to_owned()]);
}

#[test]
fn test_abstract_command_requires_obe_id_and_mode() {
    let (_dir, bank) = bank_fixture();
    let registry = Arc::new(RegistryMap::new());
    register_abstract_commands(&registry, &bank, &["SPCAM"]);

    let ctx = simple_context(registry);
    let err = run_command(&ctx, "TAKE_EXPOSURE OBE_MODE=IMAG EXPTIME=5", "").unwrap_err();
    assert!(matches!(
        err,
        RunError::Exec(obscript::ExecError::MissingParam(_))
    ));
}

#[test]
fn test_ope_extraction_feeds_execution() {
    let registry = Arc::new(RegistryMap::new());
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    register_recorder(&registry, "AG_TRACK", "TSCL", &log, None, Value::Int(0));

    let ope = "\
:HEADER
:PARAMETER_LIST
MODE=\"ON\"
:COMMAND
EXEC TSCL AG_TRACK MODE=$MODE
";
    let cmdstr =
        obscript::ope::extract_command(ope, "EXEC TSCL AG_TRACK MODE=$MODE", &[]).unwrap();
    assert_eq!(cmdstr, "EXEC TSCL AG_TRACK MODE=\"ON\"");

    let ctx = simple_context(registry);
    run_command(&ctx, &cmdstr, "").unwrap();
    assert_eq!(log.lock().clone(), vec!["AG_TRACK MODE=ON".to_owned()]);
}

#[test]
fn test_command_string_with_environment_defaults() {
    let registry = Arc::new(RegistryMap::new());
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    register_recorder(&registry, "MOVE", "TSCV", &log, None, Value::Int(0));

    let ctx = simple_context(registry);
    run_command(&ctx, "EXEC TSCV MOVE EL=$EL", "EL=89.5").unwrap();
    assert_eq!(log.lock().clone(), vec!["MOVE EL=89.5".to_owned()]);
}
