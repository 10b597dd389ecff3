//! Action name → ordered interceptor set, with synchronous cancel/continue dispatch.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

use anyhow::Result;
use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;

use crate::unload::Unload;

const UNKNOWN_SOURCE: &str = "unknown";

/// Result of one interceptor call.
pub enum InterceptVerdict {
    /// Let the action through.
    Continue,
    /// Cancel the action; the original is not invoked.
    Cancel,
    /// Fire-and-forget follow-up work. Never cancels; failures are logged.
    Deferred(BoxFuture<'static, Result<()>>),
}

impl InterceptVerdict {
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self::Deferred(future.boxed())
    }
}

impl From<bool> for InterceptVerdict {
    fn from(cancel: bool) -> Self {
        if cancel {
            Self::Cancel
        } else {
            Self::Continue
        }
    }
}

impl fmt::Debug for InterceptVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => f.write_str("Continue"),
            Self::Cancel => f.write_str("Cancel"),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

type InterceptCallback = dyn Fn(&[Value]) -> Result<InterceptVerdict> + Send + Sync;

#[derive(Clone)]
struct Interceptor {
    id: u64,
    source: String,
    fired: Option<Arc<AtomicBool>>,
    callback: Arc<InterceptCallback>,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<String, Vec<Interceptor>>,
    next_id: u64,
}

fn lock(state: &Mutex<RegistryState>) -> MutexGuard<'_, RegistryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn remove_interceptor(state: &Mutex<RegistryState>, action: &str, id: u64) -> bool {
    let mut state = lock(state);
    let Some(set) = state.entries.get_mut(action) else {
        return false;
    };
    let before = set.len();
    set.retain(|interceptor| interceptor.id != id);
    let removed = set.len() != before;
    if set.is_empty() {
        state.entries.remove(action);
    }
    removed
}

/// Aggregate of one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub cancelled: bool,
    pub invoked: usize,
    pub faults: usize,
}

/// Shared interception registry. Cloning yields another handle to the same state.
#[derive(Clone, Default)]
pub struct InterceptorRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl fmt::Debug for InterceptorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("InterceptorRegistry")
            .field("actions", &state.entries.len())
            .finish()
    }
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, action: &str, source: &str, callback: F) -> InterceptHandle
    where
        F: Fn(&[Value]) -> Result<InterceptVerdict> + Send + Sync + 'static,
    {
        self.insert(action, source, false, Arc::new(callback))
    }

    /// Like [`subscribe`](Self::subscribe), but the interceptor removes itself
    /// before its first call runs.
    pub fn subscribe_once<F>(&self, action: &str, source: &str, callback: F) -> InterceptHandle
    where
        F: Fn(&[Value]) -> Result<InterceptVerdict> + Send + Sync + 'static,
    {
        self.insert(action, source, true, Arc::new(callback))
    }

    fn insert(
        &self,
        action: &str,
        source: &str,
        once: bool,
        callback: Arc<InterceptCallback>,
    ) -> InterceptHandle {
        let source = if source.trim().is_empty() {
            UNKNOWN_SOURCE.to_string()
        } else {
            source.to_string()
        };
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = state.next_id;
        state
            .entries
            .entry(action.to_string())
            .or_default()
            .push(Interceptor {
                id,
                source: source.clone(),
                fired: once.then(|| Arc::new(AtomicBool::new(false))),
                callback,
            });
        InterceptHandle {
            state: Arc::downgrade(&self.state),
            action: action.to_string(),
            source,
            id,
        }
    }

    pub fn subscriber_count(&self, action: &str) -> usize {
        lock(&self.state)
            .entries
            .get(action)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn has_subscribers(&self, action: &str) -> bool {
        self.subscriber_count(action) > 0
    }

    pub fn action_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.state).entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Removes every interceptor registered by `source`.
    pub fn clear_source(&self, source: &str) -> usize {
        let mut state = lock(&self.state);
        let mut removed = 0;
        state.entries.retain(|_, set| {
            let before = set.len();
            set.retain(|interceptor| interceptor.source != source);
            removed += before - set.len();
            !set.is_empty()
        });
        removed
    }

    /// Runs every interceptor registered for `action` at call time, in
    /// subscription order. Changes made by interceptors during the dispatch
    /// take effect from the next dispatch.
    pub fn dispatch(&self, action: &str, args: &[Value]) -> DispatchOutcome {
        let snapshot = match lock(&self.state).entries.get(action) {
            Some(set) => set.clone(),
            None => return DispatchOutcome::default(),
        };

        let mut outcome = DispatchOutcome::default();
        for interceptor in snapshot {
            if let Some(fired) = &interceptor.fired {
                if fired.swap(true, Ordering::SeqCst) {
                    continue;
                }
                remove_interceptor(&self.state, action, interceptor.id);
            }

            outcome.invoked += 1;
            let verdict = panic::catch_unwind(AssertUnwindSafe(|| (interceptor.callback)(args)));
            match verdict {
                Ok(Ok(InterceptVerdict::Continue)) => {}
                Ok(Ok(InterceptVerdict::Cancel)) => outcome.cancelled = true,
                Ok(Ok(InterceptVerdict::Deferred(future))) => {
                    spawn_deferred(action, &interceptor.source, future);
                }
                Ok(Err(error)) => {
                    outcome.faults += 1;
                    tracing::error!(
                        action,
                        source = %interceptor.source,
                        error = %format!("{error:#}"),
                        "error in interceptor"
                    );
                }
                Err(payload) => {
                    outcome.faults += 1;
                    tracing::error!(
                        action,
                        source = %interceptor.source,
                        panic = panic_message(payload.as_ref()),
                        "interceptor panicked"
                    );
                }
            }
        }
        outcome
    }
}

fn spawn_deferred(action: &str, source: &str, future: BoxFuture<'static, Result<()>>) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::warn!(action, source, "no async runtime; deferred interceptor work dropped");
        return;
    };
    let action = action.to_string();
    let source = source.to_string();
    runtime.spawn(async move {
        if let Err(error) = future.await {
            tracing::error!(
                action = %action,
                source = %source,
                error = %format!("{error:#}"),
                "error in deferred interceptor"
            );
        }
    });
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Handle to one registration. Dropping it leaves the interceptor in place.
#[derive(Debug, Clone)]
pub struct InterceptHandle {
    state: Weak<Mutex<RegistryState>>,
    action: String,
    source: String,
    id: u64,
}

impl InterceptHandle {
    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Removes the interceptor. Returns false when it was already gone.
    pub fn unsubscribe(&self) -> bool {
        match self.state.upgrade() {
            Some(state) => remove_interceptor(&state, &self.action, self.id),
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        let Some(state) = self.state.upgrade() else {
            return false;
        };
        let state = lock(&state);
        state
            .entries
            .get(&self.action)
            .is_some_and(|set| set.iter().any(|interceptor| interceptor.id == self.id))
    }

    pub fn into_unload(self) -> Unload {
        let name = format!("intercept:{}", self.action);
        let source = self.source.clone();
        let watched = self.clone();
        Unload::from_fn(name, move || {
            self.unsubscribe();
        })
        .with_source(source)
        .with_liveness(move || watched.is_active())
    }
}
