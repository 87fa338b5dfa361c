// src/lib.rs
//! Readiness-driven HTTP/1.1 and WebSocket server core.
//!
//! Every worker thread runs its own [`worker::EventLoop`]: an SO_REUSEPORT
//! listener, a level-triggered epoll instance and a slab of connections.
//! Each connection owns a [`session::Session`] that parses HTTP requests,
//! routes them through the shared [`Router`], and switches to WebSocket
//! framing after a successful handshake.

#[cfg(not(target_os = "linux"))]
compile_error!("fugue-core drives epoll and sendfile directly and only builds on Linux");

pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod router;
pub mod sender;
pub mod server;
pub mod session;
pub mod slab;
pub mod syscalls;
pub mod websocket;
pub mod worker;

pub use config::ServerConfig;
pub use error::{FugueError, FugueResult};
pub use http::{HttpSink, Method, Request, Response, Status, UpgradeNotifier};
pub use router::{HttpHandler, Router, WsHandler};
pub use server::{RunningServer, Server};
pub use websocket::{Frame, Opcode, WsSink};
