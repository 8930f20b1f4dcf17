//! Handler registry.
//!
//! Maps task type names (e.g. "add") to executable handlers. Workers look
//! the envelope's `task_type` up here; an unregistered name is a permanent
//! failure, never retried.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// How a handler failed. Drives the worker's retry-or-fail decision.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HandlerError {
    /// Transient; the task may succeed if delivered again.
    #[error("retriable: {0}")]
    Retriable(String),
    /// Permanent; retrying cannot help.
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type HandlerResult = std::result::Result<Value, HandlerError>;

/// A task implementation. Must be idempotent or side-effect safe under
/// redelivery: the channel only promises at-least-once.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn execute(&self, args: Vec<Value>) -> HandlerResult;
}

/// Adapter so plain async closures can be registered.
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn execute(&self, args: Vec<Value>) -> HandlerResult {
        (self.0)(args).await
    }
}

/// Registry of handlers, indexed by task type.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create an empty registry with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `task_type`, replacing any previous one.
    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn Handler>) {
        let task_type = task_type.into();
        tracing::debug!(task_type = %task_type, "registered task handler");
        self.handlers.insert(task_type, handler);
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, task_type: impl Into<String>, f: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(task_type, Arc::new(FnHandler(f)));
    }

    /// Look up a handler by task type.
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

// ---------------------------------------------------------------------------
// Built-in tasks
// ---------------------------------------------------------------------------

/// Sum all numeric arguments. Integers stay integers; any float makes the
/// result a float. Non-numeric arguments are a fatal error.
pub async fn add(args: Vec<Value>) -> HandlerResult {
    if args.iter().all(|a| a.is_i64()) {
        let mut sum: i64 = 0;
        for a in &args {
            let n = a.as_i64().unwrap_or_default();
            sum = sum
                .checked_add(n)
                .ok_or_else(|| HandlerError::Fatal("integer overflow".to_string()))?;
        }
        return Ok(Value::from(sum));
    }

    let mut sum = 0.0;
    for a in &args {
        sum += a
            .as_f64()
            .ok_or_else(|| HandlerError::Fatal(format!("add: not a number: {a}")))?;
    }
    Ok(Value::from(sum))
}

/// A registry preloaded with the built-in tasks.
pub fn builtin() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register_fn("add", add);
    registry
}
