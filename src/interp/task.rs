// SPDX-License-Identifier: SEE LICENSE IN LICENSE.md
// SPDX-FileCopyrightText: 2023 CYBERTEC PostgreSQL International GmbH
// <office@cybertec.at>

//! Execution context for running interpreters: cancel/pause events,
//! cancellable sleeps, asynchronous child tasks and the global
//! skeleton critical-section lock.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use parking_lot::{Condvar, Mutex, ReentrantMutex, ReentrantMutexGuard};
use tracing::debug;

use crate::error::{ExecError, RunError};
use crate::eval::Value;
use crate::service::{FrameSource, ModuleIndex, Monitor, StatusSource, TaskRegistry};

/// A settable/clearable flag tasks can block on.
#[derive(Debug, Default)]
pub struct Event {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new(set: bool) -> Self {
        Self {
            state: Mutex::new(set),
            cond: Condvar::new(),
        }
    }

    pub fn set(&self) {
        *self.state.lock() = true;
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        *self.state.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock()
    }

    /// Waits up to `timeout` for the event; returns its state at
    /// return time.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if *state {
            return true;
        }
        self.cond.wait_for(&mut state, timeout);
        *state
    }
}

lazy_static! {
    // one skeleton main section runs at a time, process-wide
    static ref SK_LOCK: Arc<ReentrantMutex<()>> = Arc::new(ReentrantMutex::new(()));
}

const POLL: Duration = Duration::from_millis(10);

/// Shared state of one executor and everything it spawns. Cloning
/// shares the flags and services; `child` additionally extends the
/// monitor tag.
#[derive(Clone)]
pub struct ExecContext {
    pub cancel: Arc<Event>,
    pub pause: Arc<Event>,
    pub monitor: Arc<dyn Monitor>,
    pub status: Arc<dyn StatusSource>,
    pub frames: Arc<dyn FrameSource>,
    pub registry: Arc<dyn TaskRegistry>,
    pub modules: Arc<dyn ModuleIndex>,
    sk_lock: Arc<ReentrantMutex<()>>,
    pub tag: String,
}

impl ExecContext {
    pub fn new(
        monitor: Arc<dyn Monitor>,
        status: Arc<dyn StatusSource>,
        frames: Arc<dyn FrameSource>,
        registry: Arc<dyn TaskRegistry>,
        modules: Arc<dyn ModuleIndex>,
    ) -> Self {
        Self {
            cancel: Arc::new(Event::new(false)),
            pause: Arc::new(Event::new(true)),
            monitor,
            status,
            frames,
            registry,
            modules,
            sk_lock: Arc::clone(&SK_LOCK),
            tag: "executor".to_owned(),
        }
    }

    /// Replaces the critical-section lock; tests use this to isolate
    /// executors from the process-wide lock.
    pub fn with_sk_lock(mut self, lock: Arc<ReentrantMutex<()>>) -> Self {
        self.sk_lock = lock;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Context for a child task: shared flags, extended tag.
    pub fn child(&self, name: &str) -> Self {
        let mut ctx = self.clone();
        ctx.tag = format!("{}.{}", self.tag, name);
        ctx
    }

    /// Enters the global skeleton critical section. Reentrant, so a
    /// nested synchronous abstract command may enter while its parent
    /// holds the lock; dropping the guard releases it even when an
    /// error unwinds.
    pub fn lock_critical_section(&self) -> ReentrantMutexGuard<'_, ()> {
        self.sk_lock.lock()
    }

    /// Checks for cancellation and honors a pause. Called at every
    /// statement boundary, loop iteration and polling step.
    pub fn check_state(&self) -> Result<(), RunError> {
        loop {
            if self.cancel.is_set() {
                return Err(RunError::Cancel);
            }
            if self.pause.is_set() {
                return Ok(());
            }
            self.pause.wait_for(POLL);
        }
    }

    /// Sleeps `duration`, waking early on cancellation.
    pub fn sleep(&self, duration: Duration) -> Result<(), RunError> {
        let deadline = Instant::now() + duration;
        loop {
            self.check_state()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            if self.cancel.wait_for(POLL.min(deadline - now)) {
                return Err(RunError::Cancel);
            }
        }
    }

    pub fn request_cancel(&self) {
        self.cancel.set();
        // release any paused waiters so they can observe the cancel
        self.pause.set();
    }

    pub fn request_pause(&self) {
        self.pause.clear();
    }

    pub fn resume(&self) {
        self.pause.set();
    }

    /// Publishes a monitor value under this executor's tag.
    pub fn publish(&self, key: &str, value: &str) {
        self.monitor.publish(&self.tag, key, value);
    }
}

/// Handle onto a spawned asynchronous child.
pub struct AsyncHandle {
    name: String,
    done: Arc<Event>,
    result: Arc<Mutex<Option<Result<Value, RunError>>>>,
}

impl AsyncHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_done(&self) -> bool {
        self.done.is_set()
    }

    /// Waits for the child. `None` blocks until completion; expiry of a
    /// timeout surfaces [`RunError::Timeout`].
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Value, RunError> {
        match timeout {
            Some(t) => {
                if !self.done.wait_for(t) {
                    return Err(RunError::Timeout);
                }
            }
            None => {
                while !self.done.wait_for(Duration::from_millis(100)) {}
            }
        }
        self.result
            .lock()
            .clone()
            .unwrap_or_else(|| Err(RunError::Exec(ExecError::Failed {
                cmd: self.name.clone(),
                detail: "task finished without a result".into(),
            })))
    }
}

/// Spawns `f` on its own thread and returns a handle to join on.
pub fn spawn_task<F>(name: impl Into<String>, f: F) -> AsyncHandle
where
    F: FnOnce() -> Result<Value, RunError> + Send + 'static,
{
    let name = name.into();
    let done = Arc::new(Event::new(false));
    let result: Arc<Mutex<Option<Result<Value, RunError>>>> = Arc::new(Mutex::new(None));

    let thread_done = Arc::clone(&done);
    let thread_result = Arc::clone(&result);
    let thread_name = name.clone();
    let spawned = thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            debug!(task = %thread_name, "async child starting");
            let res = f();
            *thread_result.lock() = Some(res);
            thread_done.set();
            debug!(task = %thread_name, "async child finished");
        });

    if let Err(e) = spawned {
        *result.lock() = Some(Err(RunError::Exec(ExecError::Failed {
            cmd: name.clone(),
            detail: format!("could not spawn thread: {e}"),
        })));
        done.set();
    }

    AsyncHandle { name, done, result }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{
        EmptyModuleIndex, EmptyRegistry, LocalMonitor, NullStatusSource, SerialFrameSource,
    };
    use pretty_assertions::assert_eq;

    fn context() -> ExecContext {
        ExecContext::new(
            Arc::new(LocalMonitor::new()),
            Arc::new(NullStatusSource),
            Arc::new(SerialFrameSource::new()),
            Arc::new(EmptyRegistry),
            Arc::new(EmptyModuleIndex),
        )
        .with_sk_lock(Arc::new(ReentrantMutex::new(())))
    }

    #[test]
    fn test_event_set_clear() {
        let ev = Event::new(false);
        assert!(!ev.is_set());
        ev.set();
        assert!(ev.is_set());
        assert!(ev.wait_for(Duration::from_millis(1)));
        ev.clear();
        assert!(!ev.wait_for(Duration::from_millis(1)));
    }

    #[test]
    fn test_check_state_cancel() {
        let ctx = context();
        assert!(ctx.check_state().is_ok());
        ctx.request_cancel();
        assert_eq!(ctx.check_state(), Err(RunError::Cancel));
    }

    #[test]
    fn test_pause_blocks_until_resume() {
        let ctx = context();
        ctx.request_pause();

        let ctx2 = ctx.clone();
        let handle = spawn_task("paused", move || {
            ctx2.check_state()?;
            Ok(Value::Int(1))
        });

        assert!(!handle.wait(Some(Duration::from_millis(50))).is_ok());
        ctx.resume();
        assert_eq!(handle.wait(None).unwrap(), Value::Int(1));
    }

    #[test]
    fn test_sleep_cancellation() {
        let ctx = context();
        let ctx2 = ctx.clone();
        let handle = spawn_task("sleeper", move || {
            ctx2.sleep(Duration::from_secs(60))?;
            Ok(Value::Int(0))
        });

        ctx.request_cancel();
        assert_eq!(handle.wait(None), Err(RunError::Cancel));
    }

    #[test]
    fn test_async_handle_timeout() {
        let handle = spawn_task("slow", move || {
            thread::sleep(Duration::from_millis(200));
            Ok(Value::Int(0))
        });
        assert_eq!(handle.wait(Some(Duration::from_millis(10))), Err(RunError::Timeout));
        assert_eq!(handle.wait(None).unwrap(), Value::Int(0));
    }

    #[test]
    fn test_reentrant_critical_section() {
        let ctx = context();
        let _outer = ctx.lock_critical_section();
        // same thread may re-enter
        let _inner = ctx.lock_critical_section();
    }

    #[test]
    fn test_child_tag_extends() {
        let ctx = context().with_tag("exec1");
        let child = ctx.child("t42");
        assert_eq!(child.tag, "exec1.t42");
    }
}
