//! Local function dispatch: the capability the server side delegates
//! invocations to.
//!
//! The transport never interprets what a function does — it hands
//! `(module, function, args)` to an [`Invoker`] and ships the result (or the
//! crash) back. [`HandlerMap`] is the registry-backed implementation for
//! nodes that expose a static set of functions.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::Term;

/// Why an invocation produced no value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvokeError {
    /// No such module/function is exposed on this node.
    #[error("undefined function {module}:{function}/{arity}")]
    Undefined {
        /// Requested module.
        module: String,
        /// Requested function.
        function: String,
        /// Number of arguments in the request.
        arity: usize,
    },

    /// The function ran and failed.
    #[error("{reason}")]
    Failure {
        /// Failure diagnostic.
        reason: String,
    },
}

/// Executes one invocation on the local node.
#[async_trait]
pub trait Invoker: Send + Sync + 'static {
    /// Run `module:function(args)` to completion.
    async fn invoke(
        &self,
        module: &str,
        function: &str,
        args: Vec<Term>,
    ) -> Result<Term, InvokeError>;
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Term, String>> + Send>>;
type Handler = Arc<dyn Fn(Vec<Term>) -> HandlerFuture + Send + Sync>;

/// Registry of callable functions, keyed by `(module, function)`.
#[derive(Default)]
pub struct HandlerMap {
    handlers: RwLock<HashMap<(String, String), Handler>>,
}

impl HandlerMap {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous function.
    pub fn register<F>(&self, module: impl Into<String>, function: impl Into<String>, f: F)
    where
        F: Fn(Vec<Term>) -> Result<Term, String> + Send + Sync + 'static,
    {
        self.register_async(module, function, move |args| std::future::ready(f(args)));
    }

    /// Register an asynchronous function.
    pub fn register_async<F, Fut>(
        &self,
        module: impl Into<String>,
        function: impl Into<String>,
        f: F,
    ) where
        F: Fn(Vec<Term>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Term, String>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args| Box::pin(f(args)));
        self.handlers
            .write()
            .expect("handler table lock poisoned")
            .insert((module.into(), function.into()), handler);
    }
}

#[async_trait]
impl Invoker for HandlerMap {
    async fn invoke(
        &self,
        module: &str,
        function: &str,
        args: Vec<Term>,
    ) -> Result<Term, InvokeError> {
        let handler = {
            let table = self.handlers.read().expect("handler table lock poisoned");
            table
                .get(&(module.to_string(), function.to_string()))
                .cloned()
        };
        let Some(handler) = handler else {
            return Err(InvokeError::Undefined {
                module: module.to_string(),
                function: function.to_string(),
                arity: args.len(),
            });
        };
        handler(args)
            .await
            .map_err(|reason| InvokeError::Failure { reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn math_handlers() -> HandlerMap {
        let handlers = HandlerMap::new();
        handlers.register("math", "add", |args| {
            let sum = args.iter().filter_map(Term::as_int).sum();
            Ok(Term::Int(sum))
        });
        handlers
    }

    #[tokio::test]
    async fn registered_function_is_invocable() {
        let handlers = math_handlers();
        let result = handlers
            .invoke("math", "add", vec![Term::Int(2), Term::Int(3)])
            .await;
        assert_eq!(result, Ok(Term::Int(5)));
    }

    #[tokio::test]
    async fn unregistered_function_is_undefined() {
        let handlers = math_handlers();
        let result = handlers.invoke("os", "cmd", vec![]).await;
        assert_eq!(
            result,
            Err(InvokeError::Undefined {
                module: "os".to_string(),
                function: "cmd".to_string(),
                arity: 0,
            })
        );
    }

    #[tokio::test]
    async fn handler_failure_is_surfaced() {
        let handlers = HandlerMap::new();
        handlers.register("kv", "get", |_args| Err("no such key".to_string()));
        let result = handlers.invoke("kv", "get", vec![Term::atom("k")]).await;
        assert_eq!(
            result,
            Err(InvokeError::Failure {
                reason: "no such key".to_string()
            })
        );
    }

    #[tokio::test]
    async fn async_handlers_run_to_completion() {
        let handlers = HandlerMap::new();
        handlers.register_async("slow", "sleep", |args| async move {
            let ms = args.first().and_then(Term::as_int).unwrap_or(0) as u64;
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            Ok(Term::atom("ok"))
        });

        let result = handlers.invoke("slow", "sleep", vec![Term::Int(5)]).await;
        assert_eq!(result, Ok(Term::atom("ok")));
    }
}
