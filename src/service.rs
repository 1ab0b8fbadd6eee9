// SPDX-License-Identifier: SEE LICENSE IN LICENSE.md
// SPDX-FileCopyrightText: 2023 CYBERTEC PostgreSQL International GmbH
// <office@cybertec.at>

//! Contracts for the external collaborators the interpreter drives:
//! the status store, the frame allocator, the monitor bus, the task
//! registry and the import index. In-process implementations suitable
//! for tests and embedders ship alongside the traits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::{EvalError, ExecError, RunError};
use crate::eval::{ParamMap, Value};
use crate::interp::task::{Event, ExecContext};

/// Sentinel returned by the status store for a missing value.
pub const STATNONE: &str = "##NODATA##";
/// Sentinel returned by the status store for a failed fetch.
pub const STATERROR: &str = "##ERROR##";

/// Read-only gateway to the external status key/value store
/// (`!name` references).
pub trait StatusSource: Send + Sync {
    fn fetch_one(&self, alias: &str) -> Result<Value, EvalError>;

    /// Fetches several aliases; the default implementation loops over
    /// [`fetch_one`](Self::fetch_one).
    fn fetch(&self, aliases: &[String]) -> Result<IndexMap<String, Value>, EvalError> {
        let mut result = IndexMap::new();
        for alias in aliases {
            result.insert(alias.clone(), self.fetch_one(alias)?);
        }
        Ok(result)
    }
}

/// Read-only gateway to the external frame-id allocator
/// (`&GET_F_NO[...]` references).
pub trait FrameSource: Send + Sync {
    fn get_frames(
        &self,
        instrument: &str,
        frame_type: &str,
        count: usize,
    ) -> Result<Vec<String>, EvalError>;
}

/// Publish/subscribe bus the interpreter reports execution progress on.
pub trait Monitor: Send + Sync {
    fn publish(&self, tag: &str, key: &str, value: &str);

    /// Blocks until any of `keys` is published under `tag`, the timeout
    /// expires, or `cancel` is set.
    fn wait_any(
        &self,
        tag: &str,
        keys: &[&str],
        timeout: Option<Duration>,
        cancel: &Event,
    ) -> Result<String, RunError>;
}

/// Index of importable modules for the `FROM … IMPORT` statement.
pub trait ModuleIndex: Send + Sync {
    fn lookup(&self, module: &str) -> Result<IndexMap<String, Value>, ExecError>;
}

/// One runnable external command instance.
pub trait CommandTask: Send {
    fn run(&mut self, ctx: &ExecContext) -> Result<Value, RunError>;
}

/// Instantiates command tasks for one `(command, subsystem)` pair.
pub trait TaskFactory: Send + Sync {
    fn instantiate(&self, params: ParamMap) -> Result<Box<dyn CommandTask>, ExecError>;
}

/// The task-manager contract: factory lookup by command name and
/// subsystem.
pub trait TaskRegistry: Send + Sync {
    fn get(&self, name: &str, subsys: &str) -> Result<Arc<dyn TaskFactory>, ExecError>;
}

// ---------------------------------------------------------------------
// in-process implementations

/// Status source that knows nothing; every fetch yields the
/// [`STATNONE`] sentinel.
#[derive(Debug, Default)]
pub struct NullStatusSource;

impl StatusSource for NullStatusSource {
    fn fetch_one(&self, _alias: &str) -> Result<Value, EvalError> {
        Ok(Value::Str(STATNONE.to_owned()))
    }
}

/// Status store backed by an in-memory map; aliases are
/// case-insensitive.
#[derive(Debug, Default)]
pub struct StaticStatusSource {
    values: RwLock<HashMap<String, Value>>,
}

impl StaticStatusSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, alias: &str, value: Value) {
        self.values.write().insert(alias.to_uppercase(), value);
    }
}

impl StatusSource for StaticStatusSource {
    fn fetch_one(&self, alias: &str) -> Result<Value, EvalError> {
        Ok(self
            .values
            .read()
            .get(&alias.to_uppercase())
            .cloned()
            .unwrap_or_else(|| Value::Str(STATNONE.to_owned())))
    }
}

/// Frame allocator handing out process-locally increasing frame ids of
/// the form `<INSTRUMENT><TYPE><number>`.
#[derive(Debug)]
pub struct SerialFrameSource {
    next: AtomicU64,
}

impl Default for SerialFrameSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialFrameSource {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl FrameSource for SerialFrameSource {
    fn get_frames(
        &self,
        instrument: &str,
        frame_type: &str,
        count: usize,
    ) -> Result<Vec<String>, EvalError> {
        let start = self.next.fetch_add(count as u64, Ordering::Relaxed);
        Ok((0..count as u64)
            .map(|i| format!("{instrument}{frame_type}{:08}", start + i))
            .collect())
    }
}

/// In-process monitor: a keyed blackboard with condvar wakeups.
#[derive(Default)]
pub struct LocalMonitor {
    values: Mutex<HashMap<String, String>>,
    changed: Condvar,
}

impl LocalMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/debug helper: reads one published value.
    pub fn get(&self, tag: &str, key: &str) -> Option<String> {
        self.values.lock().get(&format!("{tag}.{key}")).cloned()
    }
}

impl Monitor for LocalMonitor {
    fn publish(&self, tag: &str, key: &str, value: &str) {
        self.values
            .lock()
            .insert(format!("{tag}.{key}"), value.to_owned());
        self.changed.notify_all();
    }

    fn wait_any(
        &self,
        tag: &str,
        keys: &[&str],
        timeout: Option<Duration>,
        cancel: &Event,
    ) -> Result<String, RunError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut values = self.values.lock();
        loop {
            if cancel.is_set() {
                return Err(RunError::Cancel);
            }
            for key in keys {
                if let Some(value) = values.get(&format!("{tag}.{key}")) {
                    return Ok(value.clone());
                }
            }
            let poll = Duration::from_millis(20);
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(RunError::Timeout);
                    }
                    let wait = poll.min(deadline - now);
                    self.changed.wait_for(&mut values, wait);
                }
                None => {
                    self.changed.wait_for(&mut values, poll);
                }
            }
        }
    }
}

/// Module index backed by a static map.
#[derive(Default)]
pub struct StaticModuleIndex {
    modules: RwLock<HashMap<String, IndexMap<String, Value>>>,
}

impl StaticModuleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, module: &str, names: IndexMap<String, Value>) {
        let folded = names
            .into_iter()
            .map(|(k, v)| (k.to_uppercase(), v))
            .collect();
        self.modules.write().insert(module.to_owned(), folded);
    }
}

impl ModuleIndex for StaticModuleIndex {
    fn lookup(&self, module: &str) -> Result<IndexMap<String, Value>, ExecError> {
        self.modules
            .read()
            .get(module)
            .cloned()
            .ok_or_else(|| ExecError::NoModule(module.to_owned()))
    }
}

/// Module index that knows no modules.
#[derive(Debug, Default)]
pub struct EmptyModuleIndex;

impl ModuleIndex for EmptyModuleIndex {
    fn lookup(&self, module: &str) -> Result<IndexMap<String, Value>, ExecError> {
        Err(ExecError::NoModule(module.to_owned()))
    }
}

type CallbackFn = dyn Fn(ParamMap, &ExecContext) -> Result<Value, RunError> + Send + Sync;

/// Task factory wrapping a plain function; the workhorse for tests and
/// simple embedders.
pub struct CallbackFactory {
    callback: Arc<CallbackFn>,
}

impl CallbackFactory {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(ParamMap, &ExecContext) -> Result<Value, RunError> + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }
}

struct CallbackTask {
    callback: Arc<CallbackFn>,
    params: ParamMap,
}

impl CommandTask for CallbackTask {
    fn run(&mut self, ctx: &ExecContext) -> Result<Value, RunError> {
        (self.callback)(std::mem::take(&mut self.params), ctx)
    }
}

impl TaskFactory for CallbackFactory {
    fn instantiate(&self, params: ParamMap) -> Result<Box<dyn CommandTask>, ExecError> {
        Ok(Box::new(CallbackTask {
            callback: Arc::clone(&self.callback),
            params,
        }))
    }
}

/// Task registry backed by a `(command, subsystem)` map; lookups are
/// case-insensitive.
#[derive(Default)]
pub struct RegistryMap {
    factories: RwLock<HashMap<(String, String), Arc<dyn TaskFactory>>>,
}

impl RegistryMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, subsys: &str, factory: Arc<dyn TaskFactory>) {
        self.factories
            .write()
            .insert((name.to_uppercase(), subsys.to_uppercase()), factory);
    }
}

impl TaskRegistry for RegistryMap {
    fn get(&self, name: &str, subsys: &str) -> Result<Arc<dyn TaskFactory>, ExecError> {
        self.factories
            .read()
            .get(&(name.to_uppercase(), subsys.to_uppercase()))
            .cloned()
            .ok_or_else(|| ExecError::NoFactory {
                name: name.to_owned(),
                subsys: subsys.to_owned(),
            })
    }
}

/// Registry that knows no commands; dispatching through it always
/// fails.
#[derive(Debug, Default)]
pub struct EmptyRegistry;

impl TaskRegistry for EmptyRegistry {
    fn get(&self, name: &str, subsys: &str) -> Result<Arc<dyn TaskFactory>, ExecError> {
        Err(ExecError::NoFactory {
            name: name.to_owned(),
            subsys: subsys.to_owned(),
        })
    }
}
