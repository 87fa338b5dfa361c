// src/worker.rs
use libc::c_int;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, trace, warn};

use crate::config::ServerConfig;
use crate::conn::Connection;
use crate::error::FugueResult;
use crate::metrics::WorkerMetrics;
use crate::router::Router;
use crate::sender::{Backpressure, BufferedSender, RawSocket};
use crate::session::{Flow, Session};
use crate::slab::{Slab, Token};
use crate::syscalls::{self, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, Epoll, epoll_event};

const LISTENER_TOKEN: u64 = u64::MAX;

/// Upper bound on one wait, so the shutdown flag is noticed.
const WAIT_TIMEOUT_MS: i32 = 1000;

/// One worker: a listener, a readiness context and the connections
/// accepted on that listener. Never shares connections with other loops.
pub struct EventLoop {
    id: usize,
    listen_fd: c_int,
    epoll: Epoll,
    slab: Slab<Connection>,
    router: Arc<Router>,
    metrics: Arc<WorkerMetrics>,
    shutdown: Arc<AtomicBool>,
    read_chunk_size: usize,
    max_payload_size: usize,
    max_events: usize,
}

impl EventLoop {
    /// Takes ownership of `listen_fd`, which must be non-blocking.
    pub fn new(
        id: usize,
        listen_fd: c_int,
        config: &ServerConfig,
        router: Arc<Router>,
        metrics: Arc<WorkerMetrics>,
        shutdown: Arc<AtomicBool>,
    ) -> FugueResult<Self> {
        let epoll = match Epoll::new() {
            Ok(epoll) => epoll,
            Err(e) => {
                syscalls::close_fd(listen_fd);
                return Err(e.into());
            }
        };
        if let Err(e) = epoll.add(listen_fd, LISTENER_TOKEN, EPOLLIN) {
            syscalls::close_fd(listen_fd);
            return Err(e.into());
        }
        Ok(Self {
            id,
            listen_fd,
            epoll,
            slab: Slab::new(config.max_connections),
            router,
            metrics,
            shutdown,
            read_chunk_size: config.read_chunk_size,
            max_payload_size: config.max_payload_size,
            max_events: config.max_events,
        })
    }

    /// Run until the shutdown flag is set. Per-connection failures never end
    /// the loop; only a failing readiness wait does.
    pub fn run(&mut self) -> FugueResult<()> {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; self.max_events];
        let mut chunk = vec![0u8; self.read_chunk_size];
        info!("worker {} entering event loop (listen_fd={})", self.id, self.listen_fd);

        while !self.shutdown.load(Ordering::Acquire) {
            let n = self.epoll.wait(&mut events, WAIT_TIMEOUT_MS)?;
            for ev in &events[..n] {
                let token = ev.u64;
                let flags = ev.events;
                if token == LISTENER_TOKEN {
                    self.accept_all();
                } else {
                    self.on_event(Token(token), flags, &mut chunk);
                }
            }
        }

        info!("worker {} stopping, closing {} connections", self.id, self.slab.len());
        self.close_all();
        Ok(())
    }

    fn accept_all(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some(fd)) => self.register(fd),
                Ok(None) => break,
                Err(e) => {
                    error!("worker {} accept(): {}", self.id, e);
                    break;
                }
            }
        }
    }

    fn register(&mut self, fd: c_int) {
        let Some(token) = self.slab.vacant_token() else {
            warn!(
                "worker {} at capacity ({} connections), rejecting fd {}",
                self.id,
                self.slab.capacity(),
                fd
            );
            syscalls::close_fd(fd);
            return;
        };
        if let Err(e) = syscalls::set_nodelay(fd) {
            debug!("worker {} TCP_NODELAY on fd {}: {}", self.id, fd, e);
        }

        let sender = Arc::new(BufferedSender::new(
            RawSocket(fd),
            self.backpressure(fd, token),
        ));
        let session = Session::new(
            self.router.clone(),
            sender.clone(),
            self.metrics.clone(),
            self.max_payload_size,
        );

        if let Err(e) = self.epoll.add(fd, token.0, EPOLLIN) {
            error!("worker {} epoll_ctl(ADD, {}): {}", self.id, fd, e);
            sender.close();
            syscalls::close_fd(fd);
            return;
        }
        self.slab.insert(Connection::new(fd, sender, session));
        self.metrics.inc_conn();
        debug!("worker {} accepted fd {}", self.id, fd);
    }

    /// Mark adds write interest for the connection, unmark drops it again.
    /// Read interest is always kept.
    fn backpressure(&self, fd: c_int, token: Token) -> Backpressure {
        let epoll_fd = self.epoll.raw_fd();
        let watch = move |interests: i32| {
            if let Err(e) =
                syscalls::epoll_ctl(epoll_fd, libc::EPOLL_CTL_MOD, fd, token.0, interests)
            {
                error!("worker epoll_ctl(MOD, {}): {}", fd, e);
            }
        };
        let unwatch = watch;
        Backpressure::new(
            move || {
                trace!("fd {} write pending", fd);
                watch(EPOLLIN | EPOLLOUT);
            },
            move || {
                trace!("fd {} write drained", fd);
                unwatch(EPOLLIN);
            },
        )
    }

    fn on_event(&mut self, token: Token, flags: u32, chunk: &mut [u8]) {
        let Some(conn) = self.slab.get_mut(token) else {
            trace!("worker {} stale event for {:?}", self.id, token);
            return;
        };

        if flags & EPOLLERR as u32 != 0 {
            debug!("worker {} error readiness on fd {}", self.id, conn.fd);
            self.close(token);
            return;
        }

        if flags & (EPOLLIN | EPOLLHUP) as u32 != 0 {
            match syscalls::read_nonblocking(conn.fd, chunk) {
                Ok(0) => {
                    debug!("worker {} peer closed fd {}", self.id, conn.fd);
                    self.close(token);
                    return;
                }
                Ok(n) => {
                    if conn.session.process(&chunk[..n]) == Flow::Close {
                        self.close(token);
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    error!("worker {} read({}): {}", self.id, conn.fd, e);
                    self.close(token);
                    return;
                }
            }
        }

        if flags & (EPOLLIN | EPOLLOUT) as u32 != 0 {
            self.flush(token);
        }
    }

    fn flush(&mut self, token: Token) {
        let Some(conn) = self.slab.get(token) else {
            return;
        };
        if conn.sender.is_closed() {
            self.close(token);
            return;
        }
        match conn.sender.flush() {
            Ok(n) => self.metrics.add_sent(n),
            Err(e) => {
                error!("worker {} send({}): {}", self.id, conn.fd, e);
                self.close(token);
            }
        }
    }

    fn close(&mut self, token: Token) {
        if let Some(conn) = self.slab.remove(token) {
            debug!("worker {} closing fd {}", self.id, conn.fd);
            conn.teardown(&self.epoll);
            self.metrics.dec_conn();
        }
    }

    fn close_all(&mut self) {
        for token in self.slab.tokens() {
            self.close(token);
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.close_all();
        if let Err(e) = self.epoll.delete(self.listen_fd) {
            trace!("worker {} listener deregistration: {}", self.id, e);
        }
        syscalls::close_fd(self.listen_fd);
    }
}
