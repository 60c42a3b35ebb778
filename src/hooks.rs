//! Callbacks fired at REPL lifecycle points.
//!
//! The registry never runs on its own; a front end calls
//! [`HookRegistry::dispatch`] at the matching point of its loop. Callbacks of
//! one kind run in registration order, and a failing or panicking callback
//! is reported without stopping the ones after it.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use tracing::warn;

type PromptFn = dyn Fn() -> Result<()> + Send + Sync;
type ContinuationFn = dyn Fn(&str, &str) -> Result<()> + Send + Sync;
type StatementFn = dyn Fn(&str) -> Result<()> + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    BeforePrompt,
    BeforeContinuation,
    BeforeExecute,
    AfterExecute,
}

/// Registration id, unique across all kinds for the registry's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HookId(u64);

impl HookId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A typed callback.
#[derive(Clone)]
pub enum Hook {
    BeforePrompt(Arc<PromptFn>),
    /// Called with the previous prompt and the buffer accumulated so far.
    BeforeContinuation(Arc<ContinuationFn>),
    /// Called with the statement text about to run.
    BeforeExecute(Arc<StatementFn>),
    /// Called with the statement text that just ran.
    AfterExecute(Arc<StatementFn>),
}

impl Hook {
    pub fn before_prompt(f: impl Fn() -> Result<()> + Send + Sync + 'static) -> Self {
        Hook::BeforePrompt(Arc::new(f))
    }

    pub fn before_continuation(
        f: impl Fn(&str, &str) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Hook::BeforeContinuation(Arc::new(f))
    }

    pub fn before_execute(f: impl Fn(&str) -> Result<()> + Send + Sync + 'static) -> Self {
        Hook::BeforeExecute(Arc::new(f))
    }

    pub fn after_execute(f: impl Fn(&str) -> Result<()> + Send + Sync + 'static) -> Self {
        Hook::AfterExecute(Arc::new(f))
    }

    pub fn kind(&self) -> HookKind {
        match self {
            Hook::BeforePrompt(_) => HookKind::BeforePrompt,
            Hook::BeforeContinuation(_) => HookKind::BeforeContinuation,
            Hook::BeforeExecute(_) => HookKind::BeforeExecute,
            Hook::AfterExecute(_) => HookKind::AfterExecute,
        }
    }

    fn call(&self, event: HookEvent<'_>) -> Result<()> {
        match (self, event) {
            (Hook::BeforePrompt(f), HookEvent::BeforePrompt) => f(),
            (Hook::BeforeContinuation(f), HookEvent::BeforeContinuation { prompt, buffer }) => {
                f(prompt, buffer)
            }
            (Hook::BeforeExecute(f), HookEvent::BeforeExecute { statement }) => f(statement),
            (Hook::AfterExecute(f), HookEvent::AfterExecute { statement }) => f(statement),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hook::{:?}", self.kind())
    }
}

/// One lifecycle point, with its arguments.
#[derive(Debug, Clone, Copy)]
pub enum HookEvent<'a> {
    BeforePrompt,
    BeforeContinuation { prompt: &'a str, buffer: &'a str },
    BeforeExecute { statement: &'a str },
    AfterExecute { statement: &'a str },
}

impl HookEvent<'_> {
    pub fn kind(&self) -> HookKind {
        match self {
            HookEvent::BeforePrompt => HookKind::BeforePrompt,
            HookEvent::BeforeContinuation { .. } => HookKind::BeforeContinuation,
            HookEvent::BeforeExecute { .. } => HookKind::BeforeExecute,
            HookEvent::AfterExecute { .. } => HookKind::AfterExecute,
        }
    }
}

/// A callback that returned an error or panicked during dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookFailure {
    pub id: HookId,
    pub kind: HookKind,
    pub message: String,
}

impl fmt::Display for HookFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} hook {} failed: {}", self.kind, self.id, self.message)
    }
}

#[derive(Debug)]
pub struct HookRegistry {
    next_id: AtomicU64,
    hooks: Mutex<Vec<(HookId, Hook)>>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            hooks: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(HookId, Hook)>> {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, hook: Hook) -> HookId {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, hook));
        id
    }

    /// Remove hook `id` of `kind`. Returns whether it was registered.
    pub fn unregister(&self, kind: HookKind, id: HookId) -> bool {
        let mut hooks = self.lock();
        match hooks
            .iter()
            .position(|(hook_id, hook)| *hook_id == id && hook.kind() == kind)
        {
            Some(pos) => {
                hooks.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Ids of `kind`, in registration order.
    pub fn list(&self, kind: HookKind) -> Vec<HookId> {
        self.lock()
            .iter()
            .filter(|(_, hook)| hook.kind() == kind)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Run every callback registered for the event's kind.
    ///
    /// Callbacks run outside the registry lock, so they may register or
    /// unregister hooks; such changes apply from the next dispatch on.
    pub fn dispatch(&self, event: HookEvent<'_>) -> Vec<HookFailure> {
        let kind = event.kind();
        let hooks: Vec<(HookId, Hook)> = self
            .lock()
            .iter()
            .filter(|(_, hook)| hook.kind() == kind)
            .cloned()
            .collect();

        let mut failures = Vec::new();
        for (id, hook) in hooks {
            let message = match panic::catch_unwind(AssertUnwindSafe(|| hook.call(event))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{e:#}"),
                Err(payload) => panic_message(payload.as_ref()),
            };
            warn!(?kind, %id, %message, "hook failed");
            failures.push(HookFailure { id, kind, message });
        }
        failures
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_owned()
    }
}
