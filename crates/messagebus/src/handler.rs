use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::connection::ConnectionHandle;
use crate::error::{HandlerError, StructuredError};
use crate::message::RequestId;

type MethodFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;
type SignalFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

struct MethodEntry {
    min_args: usize,
    max_args: Option<usize>,
    call: Arc<dyn Fn(DispatchContext, Vec<Value>) -> MethodFuture + Send + Sync>,
}

struct SignalEntry {
    min_args: usize,
    max_args: Option<usize>,
    call: Arc<dyn Fn(DispatchContext, Vec<Value>) -> SignalFuture + Send + Sync>,
}

/// What a handler sees for one inbound request or signal: which connection it
/// arrived on, and (for requests) the ability to reply early or defer the
/// reply past the handler's return. Built fresh per dispatch and moved into
/// the task that runs the handler; nothing about it is shared or thread-local.
#[derive(Clone)]
pub struct DispatchContext {
    message_id: Option<RequestId>,
    method: String,
    connection: ConnectionHandle,
    response_sent: Arc<AtomicBool>,
}

impl DispatchContext {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// True for a request, false for a signal (which has no reply channel).
    pub fn is_request(&self) -> bool {
        self.message_id.is_some()
    }

    /// Send a reply before the handler returns. The handler's own return
    /// value is then ignored. Only valid for requests.
    pub fn early_response(&self, value: Value) -> Result<(), StructuredError> {
        let id = self
            .message_id
            .ok_or_else(|| StructuredError::new("InvalidCall", "signals have no reply channel"))?;
        self.connection.send_method_return(id, &value);
        self.response_sent.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Mark the reply as owned by something outside the handler's return
    /// value (e.g. a callback fired later). The handler's return value is
    /// then ignored instead of being sent as a second reply.
    pub fn delay_response(&self) -> Result<(), StructuredError> {
        if self.message_id.is_none() {
            return Err(StructuredError::new("InvalidCall", "signals have no reply channel"));
        }
        self.response_sent.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn arity_ok(min: usize, max: Option<usize>, actual: usize) -> bool {
    actual >= min && max.map_or(true, |max| actual <= max)
}

/// The set of methods and signal handlers a connection or server dispatches
/// inbound requests and signals to. Assembled once via [`HandlerRegistry::builder`]
/// and shared (immutably, behind an `Arc`) across every connection it serves.
pub struct HandlerRegistry {
    methods: HashMap<String, MethodEntry>,
    signals: HashMap<String, SignalEntry>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    pub(crate) async fn dispatch_request(
        &self,
        id: RequestId,
        method: String,
        params: Vec<Value>,
        connection: ConnectionHandle,
    ) {
        let Some(entry) = self.methods.get(&method) else {
            connection.send_error(id, &StructuredError::not_found(&method));
            return;
        };
        if !arity_ok(entry.min_args, entry.max_args, params.len()) {
            tracing::warn!(method = %method, arity = params.len(), "wrong number of arguments");
            connection.send_error(id, &StructuredError::invalid_call(&method));
            return;
        }

        let response_sent = Arc::new(AtomicBool::new(false));
        let ctx = DispatchContext {
            message_id: Some(id),
            method: method.clone(),
            connection: connection.clone(),
            response_sent: response_sent.clone(),
        };

        match (entry.call)(ctx, params).await {
            Ok(value) => {
                if !response_sent.load(Ordering::SeqCst) {
                    connection.send_method_return(id, &value);
                }
            }
            Err(HandlerError::Structured(err)) => {
                if !response_sent.load(Ordering::SeqCst) {
                    connection.send_error(id, &err);
                }
            }
            Err(HandlerError::Other(err)) => {
                tracing::error!(method = %method, error = %err, "uncaught exception in handler");
                if !response_sent.load(Ordering::SeqCst) {
                    connection.send_error(id, &StructuredError::uncaught_exception());
                }
            }
        }
    }

    pub(crate) async fn dispatch_signal(&self, method: String, params: Vec<Value>, connection: ConnectionHandle) {
        let Some(entry) = self.signals.get(&method) else {
            tracing::debug!(method = %method, "no handler registered for signal, dropping");
            return;
        };
        if !arity_ok(entry.min_args, entry.max_args, params.len()) {
            tracing::warn!(method = %method, arity = params.len(), "wrong number of arguments for signal");
            return;
        }

        let ctx = DispatchContext {
            message_id: None,
            method: method.clone(),
            connection,
            response_sent: Arc::new(AtomicBool::new(false)),
        };

        if let Err(err) = (entry.call)(ctx, params).await {
            tracing::warn!(method = %method, error = %err, "signal handler returned an error");
        }
    }
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    methods: HashMap<String, MethodEntry>,
    signals: HashMap<String, SignalEntry>,
}

impl HandlerRegistryBuilder {
    /// Register a method. `min_args`/`max_args` (inclusive, `None` = no
    /// upper bound) are enforced before `f` runs; a mismatch replies
    /// `InvalidCall` without calling `f` at all.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, min_args: usize, max_args: Option<usize>, f: F) -> Self
    where
        F: Fn(DispatchContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.methods.insert(
            name.into(),
            MethodEntry {
                min_args,
                max_args,
                call: Arc::new(move |ctx, params| Box::pin(f(ctx, params))),
            },
        );
        self
    }

    /// Register a signal handler. Errors it returns are logged and dropped;
    /// signals never produce a reply.
    pub fn signal<F, Fut>(mut self, name: impl Into<String>, min_args: usize, max_args: Option<usize>, f: F) -> Self
    where
        F: Fn(DispatchContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.signals.insert(
            name.into(),
            SignalEntry {
                min_args,
                max_args,
                call: Arc::new(move |ctx, params| Box::pin(f(ctx, params))),
            },
        );
        self
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            methods: self.methods,
            signals: self.signals,
        }
    }
}
