use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

use crate::auth::{self, Role};
use crate::call_table::CallTable;
use crate::config::Config;
use crate::error::{MessageBusError, StructuredError};
use crate::frame::{self, ScanResult};
use crate::handler::HandlerRegistry;
use crate::message::{Message, RequestId};
use crate::scheduler::TokioScheduler;
use crate::trace::TraceSink;

/// Fired once, the first time a connection's read or write pump observes the
/// socket is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Closed,
}

struct Inner {
    local_name: String,
    peer_name: String,
    config: Arc<Config>,
    inbound: Mutex<VecDeque<String>>,
    inbound_added: Notify,
    reading: AtomicBool,
    reading_resumed: Notify,
    outbound: Mutex<VecDeque<Value>>,
    outbound_added: Notify,
    closed: AtomicBool,
    trace: Option<Arc<TraceSink>>,
    callbacks: Mutex<Vec<Box<dyn Fn(&ConnectionHandle, ConnectionEvent) + Send + Sync>>>,
    call_table: CallTable<TokioScheduler>,
    handler: Option<Arc<HandlerRegistry>>,
}

/// A live, bidirectional JSON-RPC connection over one stream socket.
///
/// Cheap to clone (an `Arc` underneath): every clone refers to the same read
/// pump, write pump, and dispatch loop, which run as independent spawned
/// tasks for as long as the socket stays open.
#[derive(Clone)]
pub struct ConnectionHandle(Arc<Inner>);

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl ConnectionHandle {
    pub fn local_name(&self) -> &str {
        &self.0.local_name
    }

    pub fn peer_name(&self) -> &str {
        &self.0.peer_name
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::SeqCst)
    }

    /// Whether the read pump is currently allowed to read more bytes, i.e.
    /// not throttled by a saturated inbound queue.
    #[cfg(test)]
    fn is_reading(&self) -> bool {
        self.0.reading.load(Ordering::SeqCst)
    }

    /// Register a callback fired exactly once, when this connection closes.
    pub fn on_close<F>(&self, cb: F)
    where
        F: Fn(&ConnectionHandle, ConnectionEvent) + Send + Sync + 'static,
    {
        self.0.callbacks.lock().unwrap().push(Box::new(cb));
    }

    /// Enqueue a pre-built envelope for the write pump. Silently dropped if
    /// the connection is already closed.
    pub fn push_outgoing(&self, message: Value) {
        if self.0.closed.load(Ordering::SeqCst) {
            return;
        }
        self.0.outbound.lock().unwrap().push_back(message);
        self.0.outbound_added.notify_one();
    }

    pub fn send_method_return(&self, id: RequestId, value: &Value) {
        self.push_outgoing(Message::to_result_value(id, value));
    }

    pub fn send_error(&self, id: RequestId, error: &StructuredError) {
        self.push_outgoing(Message::to_error_value(id, error));
    }

    pub fn send_signal(&self, name: &str, params: &[Value]) {
        self.push_outgoing(Message::to_signal_value(name, params));
    }

    /// Issue a request and await its reply, using this connection's
    /// configured default timeout.
    pub async fn call_method(&self, name: &str, params: Vec<Value>) -> Result<Value, StructuredError> {
        let timeout = self.0.config.timeout;
        self.call_method_with_timeout(name, params, timeout).await
    }

    pub async fn call_method_with_timeout(
        &self,
        name: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, StructuredError> {
        let id = self.0.call_table.allocate_id();
        self.push_outgoing(Message::to_request_value(id, name, &params));
        self.0.call_table.wait(id, timeout).await
    }

    /// Fire-and-forget variant of `call_method`: spawns a task that awaits
    /// the reply and hands it to `on_reply`, for callers that don't want to
    /// hold the future themselves.
    pub fn call_method_detached<F>(&self, name: &str, params: Vec<Value>, on_reply: F)
    where
        F: FnOnce(Result<Value, StructuredError>) + Send + 'static,
    {
        let handle = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let outcome = handle.call_method(&name, params).await;
            on_reply(outcome);
        });
    }

    /// Idempotent. Stops the pumps, drains the Call Table with synthetic
    /// disconnect errors, and fires close callbacks exactly once.
    pub fn close(&self) {
        close_connection(&self.0);
    }
}

fn close_connection(inner: &Arc<Inner>) {
    if inner.closed.swap(true, Ordering::SeqCst) {
        return;
    }
    inner.reading.store(false, Ordering::SeqCst);
    inner.call_table.drain_with_disconnect();
    inner.reading_resumed.notify_one();
    inner.outbound_added.notify_one();
    inner.inbound_added.notify_one();

    let handle = ConnectionHandle(inner.clone());
    for cb in inner.callbacks.lock().unwrap().iter() {
        cb(&handle, ConnectionEvent::Closed);
    }
}

/// Spawn the read pump, write pump, and dispatch loop for an already
/// authenticated stream, and return the handle that owns them.
pub fn spawn<S>(
    stream: S,
    local_name: String,
    peer_name: String,
    config: Arc<Config>,
    handler: Option<Arc<HandlerRegistry>>,
    trace: Option<Arc<TraceSink>>,
) -> ConnectionHandle
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let inner = Arc::new(Inner {
        local_name,
        peer_name,
        config,
        inbound: Mutex::new(VecDeque::new()),
        inbound_added: Notify::new(),
        reading: AtomicBool::new(true),
        reading_resumed: Notify::new(),
        outbound: Mutex::new(VecDeque::new()),
        outbound_added: Notify::new(),
        closed: AtomicBool::new(false),
        trace,
        callbacks: Mutex::new(Vec::new()),
        call_table: CallTable::new(TokioScheduler),
        handler,
    });

    let (read_half, write_half) = tokio::io::split(stream);
    tokio::spawn(read_pump(inner.clone(), read_half));
    tokio::spawn(write_pump(inner.clone(), write_half));
    tokio::spawn(dispatch_loop(inner.clone()));

    ConnectionHandle(inner)
}

/// Run the pre-connection HMAC handshake (if `token` is set) and then spawn
/// the connection. The socket is left untouched (and the error returned) on
/// authentication failure, so the caller can drop it before it ever reaches a
/// connection list.
pub async fn establish<S>(
    mut stream: S,
    role: Role,
    local_name: String,
    peer_name: String,
    config: Arc<Config>,
    token: Option<&[u8]>,
    handler: Option<Arc<HandlerRegistry>>,
    trace: Option<Arc<TraceSink>>,
) -> Result<ConnectionHandle, MessageBusError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    if let Some(token) = token {
        auth::handshake(&mut stream, role, token).await?;
    }
    Ok(spawn(stream, local_name, peer_name, config, handler, trace))
}

async fn read_pump<R>(inner: Arc<Inner>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut raw_buf: Vec<u8> = Vec::new();

    loop {
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }

        loop {
            match frame::scan(&raw_buf) {
                Ok(ScanResult::Complete(end)) => {
                    let text = String::from_utf8_lossy(&raw_buf[..=end]).into_owned();
                    raw_buf.drain(..=end);

                    if let Some(trace) = &inner.trace {
                        trace.record(&inner.local_name, &inner.peer_name, &text, true).await;
                    }

                    push_incoming(&inner, text);
                }
                Ok(ScanResult::Incomplete) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "malformed frame, closing connection");
                    close_connection(&inner);
                    return;
                }
            }
        }

        if raw_buf.len() > inner.config.max_message_size {
            tracing::debug!(size = raw_buf.len(), "incoming message too large, closing connection");
            close_connection(&inner);
            return;
        }

        if !inner.reading.load(Ordering::SeqCst) {
            tracing::debug!("inbound queue full, throttling reads");
            inner.reading_resumed.notified().await;
            continue;
        }

        let mut chunk = [0u8; 16 * 1024];
        match reader.read(&mut chunk).await {
            Ok(0) => {
                tracing::debug!("peer closed the connection");
                close_connection(&inner);
                return;
            }
            Ok(n) => raw_buf.extend_from_slice(&chunk[..n]),
            Err(err) => {
                tracing::warn!(error = %err, "read error, closing connection");
                close_connection(&inner);
                return;
            }
        }
    }
}

async fn write_pump<W>(inner: Arc<Inner>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    loop {
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }

        let next = inner.outbound.lock().unwrap().pop_front();
        let Some(message) = next else {
            inner.outbound_added.notified().await;
            continue;
        };

        let serialized = match serde_json::to_string_pretty(&message) {
            Ok(s) => s,
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize outgoing message, dropping it");
                continue;
            }
        };

        if let Some(trace) = &inner.trace {
            trace.record(&inner.local_name, &inner.peer_name, &serialized, false).await;
        }

        if let Err(err) = writer.write_all(serialized.as_bytes()).await {
            tracing::warn!(error = %err, "write error, closing connection");
            close_connection(&inner);
            return;
        }
    }
}

/// Push one inbound message and, if that pushes the queue over the throttle
/// threshold, disable the read pump.
fn push_incoming(inner: &Arc<Inner>, text: String) {
    let queue_len = {
        let mut guard = inner.inbound.lock().unwrap();
        guard.push_back(text);
        guard.len()
    };
    if queue_len > inner.config.max_incoming_messages {
        inner.reading.store(false, Ordering::SeqCst);
    }
    inner.inbound_added.notify_one();
}

/// Pop one inbound message and, if that drops the queue back under the
/// throttle threshold, re-enable the read pump.
fn pop_incoming(inner: &Arc<Inner>) -> Option<String> {
    let mut guard = inner.inbound.lock().unwrap();
    let raw = guard.pop_front()?;
    let len = guard.len();
    drop(guard);

    if !inner.reading.load(Ordering::SeqCst)
        && !inner.closed.load(Ordering::SeqCst)
        && len < inner.config.max_incoming_messages
    {
        inner.reading.store(true, Ordering::SeqCst);
        inner.reading_resumed.notify_one();
    }
    Some(raw)
}

async fn dispatch_loop(inner: Arc<Inner>) {
    loop {
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }

        let Some(raw) = pop_incoming(&inner) else {
            inner.inbound_added.notified().await;
            continue;
        };

        match Message::decode(&raw) {
            Ok(Message::Response { id, outcome }) => inner.call_table.deliver(id, outcome),
            Ok(Message::Request { id, method, params }) => {
                let Some(handler) = inner.handler.clone() else {
                    tracing::info!(method = %method, "no handler registered, replying NotFound");
                    ConnectionHandle(inner.clone()).send_error(id, &StructuredError::not_found(&method));
                    continue;
                };
                let handle = ConnectionHandle(inner.clone());
                tokio::spawn(async move { handler.dispatch_request(id, method, params, handle).await });
            }
            Ok(Message::Signal { method, params }) => {
                let Some(handler) = inner.handler.clone() else {
                    tracing::debug!(method = %method, "no handler registered, dropping signal");
                    continue;
                };
                let handle = ConnectionHandle(inner.clone());
                tokio::spawn(async move { handler.dispatch_signal(method, params, handle).await });
            }
            Err(err) => {
                tracing::warn!(error = %err, "invalid inbound envelope, closing connection");
                close_connection(&inner);
                return;
            }
        }
    }
}
