// src/conn.rs
use libc::c_int;
use std::sync::Arc;
use tracing::error;

use crate::sender::BufferedSender;
use crate::session::Session;
use crate::syscalls::{self, Epoll};

/// One accepted socket: its descriptor, outbound queue and protocol state.
/// Owned by the slab of the loop that accepted it.
pub struct Connection {
    pub fd: c_int,
    pub sender: Arc<BufferedSender>,
    pub session: Session,
}

impl Connection {
    pub fn new(fd: c_int, sender: Arc<BufferedSender>, session: Session) -> Self {
        Self { fd, sender, session }
    }

    /// Stop watching, shut down and release the descriptor. The sender is
    /// closed before the descriptor so sinks still held by handlers cannot
    /// write to a reused fd.
    pub fn teardown(self, epoll: &Epoll) {
        if let Err(e) = epoll.delete(self.fd) {
            error!("conn epoll_ctl(DEL, {}): {}", self.fd, e);
        }
        self.sender.close();
        syscalls::close_fd(self.fd);
    }
}
