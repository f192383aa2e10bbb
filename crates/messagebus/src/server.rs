use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use crate::auth::Role;
use crate::config::Config;
use crate::connection::{self, ConnectionEvent, ConnectionHandle};
use crate::error::StructuredError;
use crate::handler::HandlerRegistry;
use crate::trace::TraceSink;

/// Source of freshly accepted, not-yet-authenticated sockets. Bind/listen
/// boilerplate lives on the implementor; the Server only ever calls `accept`.
#[async_trait]
pub trait Acceptor: Send {
    type Io: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn accept(&mut self) -> std::io::Result<(Self::Io, String)>;
}

/// [`Acceptor`] over a bound `TcpListener`; peer names are `ip:port`.
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    pub async fn bind(addr: impl tokio::net::ToSocketAddrs) -> std::io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
        })
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    type Io = TcpStream;

    async fn accept(&mut self) -> std::io::Result<(TcpStream, String)> {
        let (stream, addr) = self.listener.accept().await?;
        Ok((stream, addr.to_string()))
    }
}

/// Fired as connections come and go.
pub enum ServerEvent {
    ConnectionClosed(ConnectionHandle),
    LastConnectionClosed,
}

struct ServerInner {
    local_name: String,
    config: Arc<Config>,
    handler: Arc<HandlerRegistry>,
    trace: Option<Arc<TraceSink>>,
    token: Option<Vec<u8>>,
    connections: Mutex<Vec<ConnectionHandle>>,
    next_client_id: AtomicU64,
    accepting: AtomicBool,
    callbacks: Mutex<Vec<Box<dyn Fn(&ServerEvent) + Send + Sync>>>,
}

/// Owns the set of currently connected peers and fans requests, signals, and
/// calls out across them by glob pattern on peer name.
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(local_name: impl Into<String>, config: Arc<Config>, handler: Arc<HandlerRegistry>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                local_name: local_name.into(),
                config,
                handler,
                trace: None,
                token: None,
                connections: Mutex::new(Vec::new()),
                next_client_id: AtomicU64::new(1),
                accepting: AtomicBool::new(true),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn with_trace(mut self, trace: Arc<TraceSink>) -> Self {
        Arc::get_mut(&mut self.inner).expect("with_trace must run before serve").trace = Some(trace);
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<Vec<u8>>) -> Self {
        Arc::get_mut(&mut self.inner).expect("with_auth_token must run before serve").token = Some(token.into());
        self
    }

    pub fn on_event<F>(&self, cb: F)
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().unwrap().push(Box::new(cb));
    }

    pub fn client_count(&self) -> usize {
        self.inner.connections.lock().unwrap().len()
    }

    /// Accept connections from `acceptor` until [`Server::stop`] is called.
    /// Each accepted socket is authenticated (if a token is configured) and
    /// wired up on its own task; a failed handshake drops the socket without
    /// ever adding it to the connection list.
    pub async fn serve<A: Acceptor>(&self, mut acceptor: A) {
        loop {
            if !self.inner.accepting.load(Ordering::SeqCst) {
                return;
            }
            match acceptor.accept().await {
                Ok((stream, peer_addr)) => {
                    let inner = self.inner.clone();
                    let client_id = inner.next_client_id.fetch_add(1, Ordering::SeqCst);
                    let peer_name = format!("client-{client_id}@{peer_addr}");
                    tokio::spawn(accept_one(inner, stream, peer_name));
                }
                Err(err) => {
                    tracing::error!(error = %err, "accept failed");
                }
            }
        }
    }

    /// The first connected peer whose name matches `pattern` (`*`, `?`, and
    /// `[...]` globs), or the first peer at all if `pattern` is `None`.
    pub fn get_client(&self, pattern: Option<&str>) -> Option<ConnectionHandle> {
        let connections = self.inner.connections.lock().unwrap();
        match pattern {
            None => connections.first().cloned(),
            Some(pattern) => connections.iter().find(|c| glob_match::glob_match(pattern, c.peer_name())).cloned(),
        }
    }

    pub fn send_signal(&self, pattern: Option<&str>, name: &str, params: &[Value]) {
        let connections = self.inner.connections.lock().unwrap();
        for conn in matching(&connections, pattern) {
            conn.send_signal(name, params);
        }
    }

    /// Fan a call out to every connection matching `pattern` and return the
    /// first reply. Connections that lose the race keep running their own
    /// call to completion (or timeout); their replies are simply never
    /// observed here.
    pub async fn call_method(
        &self,
        pattern: Option<&str>,
        name: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, StructuredError> {
        let targets: Vec<ConnectionHandle> = {
            let connections = self.inner.connections.lock().unwrap();
            matching(&connections, pattern).cloned().collect()
        };
        if targets.is_empty() {
            return Err(StructuredError::not_found(name));
        }

        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        for conn in targets {
            let name = name.to_string();
            let params = params.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let outcome = conn.call_method_with_timeout(&name, params, timeout).await;
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(outcome);
                }
            });
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(StructuredError::disconnected()),
        }
    }

    /// Stop accepting new connections and close every connection currently
    /// in the list.
    pub fn stop(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        let connections = self.inner.connections.lock().unwrap().clone();
        for conn in connections {
            conn.close();
        }
    }
}

fn matching<'a>(connections: &'a [ConnectionHandle], pattern: Option<&'a str>) -> impl Iterator<Item = &'a ConnectionHandle> {
    connections
        .iter()
        .filter(move |c| pattern.map_or(true, |p| glob_match::glob_match(p, c.peer_name())))
}

async fn accept_one<S>(inner: Arc<ServerInner>, mut stream: S, peer_name: String)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    if let Some(token) = &inner.token {
        if let Err(err) = crate::auth::handshake(&mut stream, Role::Server, token).await {
            tracing::warn!(peer = %peer_name, error = %err, "authentication failed, dropping connection");
            return;
        }
    }

    let handle = connection::spawn(
        stream,
        inner.local_name.clone(),
        peer_name,
        inner.config.clone(),
        Some(inner.handler.clone()),
        inner.trace.clone(),
    );

    let on_close_inner = inner.clone();
    handle.on_close(move |conn, event| {
        let ConnectionEvent::Closed = event;
        handle_connection_closed(&on_close_inner, conn.clone());
    });

    inner.connections.lock().unwrap().push(handle);
}

fn handle_connection_closed(inner: &Arc<ServerInner>, conn: ConnectionHandle) {
    let now_empty = {
        let mut connections = inner.connections.lock().unwrap();
        connections.retain(|c| *c != conn);
        connections.is_empty()
    };

    let callbacks = inner.callbacks.lock().unwrap();
    for cb in callbacks.iter() {
        cb(&ServerEvent::ConnectionClosed(conn.clone()));
    }
    if now_empty {
        for cb in callbacks.iter() {
            cb(&ServerEvent::LastConnectionClosed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use serde_json::json;
    use tokio::io::DuplexStream;

    struct FixedAcceptor {
        streams: Vec<Option<(DuplexStream, String)>>,
    }

    #[async_trait]
    impl Acceptor for FixedAcceptor {
        type Io = DuplexStream;

        async fn accept(&mut self) -> std::io::Result<(DuplexStream, String)> {
            loop {
                if let Some(slot) = self.streams.iter_mut().find(|s| s.is_some()) {
                    return Ok(slot.take().unwrap());
                }
                std::future::pending::<()>().await;
            }
        }
    }

    fn echo_registry() -> Arc<HandlerRegistry> {
        Arc::new(
            HandlerRegistry::builder()
                .method("echo", 1, Some(1), |_ctx, mut params| async move {
                    Ok::<_, HandlerError>(params.remove(0))
                })
                .build(),
        )
    }

    #[tokio::test]
    async fn fan_out_returns_the_first_reply() {
        let server = Server::new("server", Arc::new(Config::default()), echo_registry());

        let (client_a, server_a) = tokio::io::duplex(64 * 1024);
        let (client_b, server_b) = tokio::io::duplex(64 * 1024);
        let acceptor = FixedAcceptor {
            streams: vec![Some((server_a, "a".into())), Some((server_b, "b".into()))],
        };

        let inner = server.inner.clone();
        tokio::spawn(async move { server.serve(acceptor).await });

        // Give both connections time to register before issuing the fan-out call.
        let config = Arc::new(Config::default());
        let client_a = connection::spawn(client_a, "client-a".into(), "server".into(), config.clone(), None, None);
        let client_b = connection::spawn(client_b, "client-b".into(), "server".into(), config, None, None);
        while inner.connections.lock().unwrap().len() < 2 {
            tokio::task::yield_now().await;
        }

        let server_view = Server { inner };
        let result = server_view
            .call_method(None, "echo", vec![json!("race")], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result, json!("race"));

        client_a.close();
        client_b.close();
    }

    #[tokio::test]
    async fn get_client_matches_glob_patterns() {
        let server = Server::new("server", Arc::new(Config::default()), echo_registry());
        let (_client, server_io) = tokio::io::duplex(64 * 1024);
        let handle = connection::spawn(server_io, "server".into(), "worker-7".into(), Arc::new(Config::default()), None, None);
        server.inner.connections.lock().unwrap().push(handle);

        assert!(server.get_client(Some("worker-*")).is_some());
        assert!(server.get_client(Some("nope-*")).is_none());
    }

    #[tokio::test]
    async fn stop_closes_every_connection() {
        let server = Server::new("server", Arc::new(Config::default()), echo_registry());
        let (_client, server_io) = tokio::io::duplex(64 * 1024);
        let handle = connection::spawn(server_io, "server".into(), "worker".into(), Arc::new(Config::default()), None, None);
        server.inner.connections.lock().unwrap().push(handle.clone());

        server.stop();
        assert!(handle.is_closed());
    }
}
