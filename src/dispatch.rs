//! The RPC dispatch registry (§4.6, §9 "Dynamic dispatch of RPC targets").
//!
//! The source resolves `(module, function)` through a runtime import; this
//! implementation substitutes the static registry §9 calls for: a table
//! built at actor-construction time mapping `(module, function)` tags to a
//! boxed handler. The RPC allow-list of §3 is exactly the set of modules
//! registered into a given actor's [`Dispatcher`].

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use futures::stream::BoxStream;
use serde_json::Value;

use crate::error::PortalError;

/// The result of invoking a dispatched function: either a single terminal
/// value, or a sequence of yielded values (§9 "Generators as results").
pub enum RpcOutcome {
    /// `rpc-return` — the function ran to completion and produced one value.
    Single(Value),
    /// A sequence later flushed as `rpc-yield`s followed by `rpc-stop`.
    Stream(BoxStream<'static, Value>),
}

/// The remote-error shape carried back over `rpc-error`.
#[derive(Debug, Clone)]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
    pub traceback: String,
}

impl RemoteError {
    /// Builds a `RemoteError` naming `kind` as the failure's category, which
    /// is what S6 checks the caller's `RemoteError` message against.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            traceback: String::new(),
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = traceback.into();
        self
    }
}

impl From<RemoteError> for PortalError {
    fn from(e: RemoteError) -> Self {
        PortalError::RemoteError {
            kind: e.kind,
            message: e.message,
            traceback: e.traceback,
        }
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<RpcOutcome, RemoteError>> + Send>>;

/// A registered RPC handler: takes the call's kwargs (as a JSON value) and
/// returns a future resolving to the outcome.
pub type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// The `(module, function) -> handler` table consulted by an actor's serve
/// loop to resolve an incoming `rpc-call`.
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: HashMap<(&'static str, &'static str), Handler>,
}

impl Dispatcher {
    /// An empty dispatcher with no modules registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under `(module, function)`, declaratively, the
    /// way the teacher wires up supervised actors at startup.
    pub fn register<F, Fut>(&mut self, module: &'static str, function: &'static str, handler: F) -> &mut Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RpcOutcome, RemoteError>> + Send + 'static,
    {
        self.handlers
            .insert((module, function), Arc::new(move |kwargs| Box::pin(handler(kwargs))));
        self
    }

    /// The set of module tags registered, i.e. this actor's RPC allow-list.
    pub fn allowed_modules(&self) -> Vec<&'static str> {
        let mut modules: Vec<_> = self.handlers.keys().map(|(m, _)| *m).collect();
        modules.sort_unstable();
        modules.dedup();
        modules
    }

    /// Looks up the handler for `(module, function)`. Returns `None` both for
    /// an unknown function and for a module outside the allow-list — the
    /// allow-list *is* the registered key space, so the two cases coincide.
    pub fn resolve(&self, module: &str, function: &str) -> Option<Handler> {
        self.handlers
            .iter()
            .find(|((m, f), _)| *m == module && *f == function)
            .map(|(_, h)| h.clone())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("modules", &self.allowed_modules())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn a_registered_handler_resolves_and_runs() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("math", "double", |kwargs| async move {
            let n = kwargs["n"].as_i64().unwrap_or(0);
            Ok(RpcOutcome::Single(Value::from(n * 2)))
        });

        let handler = dispatcher.resolve("math", "double").expect("handler should resolve");
        match handler(serde_json::json!({ "n": 21 })).await.unwrap() {
            RpcOutcome::Single(v) => assert_eq!(v, Value::from(42)),
            RpcOutcome::Stream(_) => panic!("expected a single value"),
        }
    }

    #[test]
    fn unregistered_module_or_function_does_not_resolve() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("math", "double", |_| async { Ok(RpcOutcome::Single(Value::Null)) });

        assert!(dispatcher.resolve("math", "triple").is_none());
        assert!(dispatcher.resolve("other", "double").is_none());
        assert_eq!(dispatcher.allowed_modules(), vec!["math"]);
    }

    #[tokio::test]
    async fn a_failing_handler_surfaces_its_remote_error() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("math", "divide", |kwargs| async move {
            let denominator = kwargs["denominator"].as_f64().unwrap_or(0.0);
            if denominator == 0.0 {
                Err(RemoteError::new("ZeroDivisionError", "division by zero"))
            } else {
                Ok(RpcOutcome::Single(Value::from(kwargs["numerator"].as_f64().unwrap_or(0.0) / denominator)))
            }
        });

        let handler = dispatcher.resolve("math", "divide").unwrap();
        let err = handler(serde_json::json!({ "numerator": 1.0, "denominator": 0.0 })).await.unwrap_err();
        assert_eq!(err.kind, "ZeroDivisionError");

        let portal_err: PortalError = err.into();
        assert!(matches!(portal_err, PortalError::RemoteError { kind, .. } if kind == "ZeroDivisionError"));
    }
}
