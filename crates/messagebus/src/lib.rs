//! A bidirectional, symmetric JSON-RPC 2.0 message bus over a stream socket.
//!
//! Either side of a connection can issue requests, receive requests, send
//! signals, and receive signals — there's no fixed client/server asymmetry in
//! the wire protocol itself, only in who dials and who listens. The pieces:
//!
//! - [`frame`] incrementally finds message boundaries in a byte stream
//!   without needing a length prefix or a newline delimiter.
//! - [`message`] classifies a decoded JSON object as a request, a response,
//!   or a signal, and builds the three back onto the wire.
//! - [`call_table`] correlates an outgoing request with its eventual reply,
//!   including synthetic timeout and disconnect outcomes.
//! - [`handler`] dispatches inbound requests and signals to registered
//!   handlers, enforcing declared arity and marshalling handler errors.
//! - [`connection`] owns one socket and runs its read pump, write pump, and
//!   dispatch loop as independent tasks, with inbound backpressure.
//! - [`auth`] runs an HMAC-SHA-256 challenge-response handshake before a
//!   socket is handed to the Connection Engine.
//! - [`trace`] appends a human-readable record of every message crossing
//!   every connection, for offline debugging.
//! - [`server`] accepts connections from a pluggable [`server::Acceptor`] and
//!   fans signals and calls out across the ones matching a glob pattern.
//! - [`scheduler`] is the thin seam between the Connection Engine and the
//!   concurrency primitives (spawn, defer, timeout) it depends on.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use messagebus::{Config, HandlerRegistry, connection, handler::DispatchContext};
//! use serde_json::{json, Value};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = HandlerRegistry::builder()
//!     .method("echo", 1, Some(1), |_ctx: DispatchContext, mut params: Vec<Value>| async move {
//!         Ok(params.remove(0))
//!     })
//!     .build();
//!
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:9000").await?;
//! let conn = connection::spawn(
//!     stream,
//!     "client".into(),
//!     "server".into(),
//!     Arc::new(Config::default()),
//!     Some(Arc::new(registry)),
//!     None,
//! );
//! let reply = conn.call_method("echo", vec![json!("hi")]).await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod auth;
pub mod call_table;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handler;
pub mod message;
pub mod scheduler;
pub mod server;
pub mod trace;

pub use config::Config;
pub use connection::{ConnectionEvent, ConnectionHandle};
pub use error::{HandlerError, MessageBusError, StructuredError};
pub use handler::{DispatchContext, HandlerRegistry, HandlerRegistryBuilder};
pub use message::{Message, RequestId};
pub use scheduler::{Scheduler, TokioScheduler};
pub use server::{Acceptor, Server, ServerEvent, TcpAcceptor};
