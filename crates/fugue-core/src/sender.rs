//! Per-connection outbound queue.
//!
//! Protocol layers enqueue byte buffers or files; the event loop flushes
//! the queue whenever the socket is writable. The sender tells the loop
//! through [`Backpressure`] when it starts and stops holding unsent data.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use tracing::{error, trace};

use crate::syscalls;

/// Byte-level operations the sender needs from a connected socket.
pub trait Socket: Send + Sync {
    /// Non-blocking write; `WouldBlock` when the kernel buffer is full.
    fn send(&self, buf: &[u8]) -> io::Result<usize>;
    /// Non-blocking zero-copy transfer of up to `count` bytes of `file`.
    fn send_file(&self, file: &File, count: usize) -> io::Result<usize>;
    /// Shut down both directions.
    fn shutdown(&self);
}

/// A raw, non-blocking TCP socket descriptor. Does not own the descriptor.
#[derive(Debug, Clone, Copy)]
pub struct RawSocket(pub libc::c_int);

impl Socket for RawSocket {
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        syscalls::send_nonblocking(self.0, buf)
    }

    fn send_file(&self, file: &File, count: usize) -> io::Result<usize> {
        syscalls::sendfile_nonblocking(self.0, file.as_raw_fd(), count)
    }

    fn shutdown(&self) {
        syscalls::shutdown_both(self.0);
    }
}

/// The two calls a sender may make into its event loop: start watching the
/// socket for writability, and stop watching it.
pub struct Backpressure {
    mark: Box<dyn Fn() + Send + Sync>,
    unmark: Box<dyn Fn() + Send + Sync>,
}

impl Backpressure {
    pub fn new(
        mark: impl Fn() + Send + Sync + 'static,
        unmark: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            mark: Box::new(mark),
            unmark: Box::new(unmark),
        }
    }

    /// Callbacks that do nothing, for senders not attached to a loop.
    pub fn detached() -> Self {
        Self::new(|| {}, || {})
    }
}

enum SendOp {
    Buffer { data: Vec<u8>, offset: usize },
    File { file: File, remaining: usize },
}

enum Progress {
    Done(usize),
    Blocked(usize),
}

impl SendOp {
    fn drive(&mut self, socket: &dyn Socket) -> io::Result<Progress> {
        let mut written = 0;
        loop {
            let step = match self {
                SendOp::Buffer { data, offset } => {
                    if *offset >= data.len() {
                        return Ok(Progress::Done(written));
                    }
                    socket.send(&data[*offset..])
                }
                SendOp::File { file, remaining } => {
                    if *remaining == 0 {
                        return Ok(Progress::Done(written));
                    }
                    socket.send_file(file, *remaining)
                }
            };

            match step {
                Ok(0) => {
                    // sendfile reports 0 at end of file: the file shrank.
                    if let SendOp::File { remaining, .. } = self {
                        *remaining = 0;
                        return Ok(Progress::Done(written));
                    }
                    return Ok(Progress::Blocked(written));
                }
                Ok(n) => {
                    written += n;
                    match self {
                        SendOp::Buffer { offset, .. } => *offset += n,
                        SendOp::File { remaining, .. } => *remaining = remaining.saturating_sub(n),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Progress::Blocked(written));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

struct SendState {
    queue: VecDeque<SendOp>,
    pending: bool,
    closed: bool,
}

/// Ordered, coalescing outbound queue for one connection.
pub struct BufferedSender {
    socket: Box<dyn Socket>,
    backpressure: Backpressure,
    state: Mutex<SendState>,
}

impl BufferedSender {
    pub fn new(socket: impl Socket + 'static, backpressure: Backpressure) -> Self {
        Self {
            socket: Box::new(socket),
            backpressure,
            state: Mutex::new(SendState {
                queue: VecDeque::new(),
                pending: false,
                closed: false,
            }),
        }
    }

    /// Queue bytes, merging them into a trailing buffer operation if any.
    pub fn send(&self, bytes: impl AsRef<[u8]>) {
        let bytes = bytes.as_ref();
        let mut state = self.state.lock();
        if state.closed || bytes.is_empty() {
            return;
        }
        match state.queue.back_mut() {
            Some(SendOp::Buffer { data, .. }) => data.extend_from_slice(bytes),
            _ => state.queue.push_back(SendOp::Buffer {
                data: bytes.to_vec(),
                offset: 0,
            }),
        }
        self.mark_pending(&mut state);
    }

    /// Queue a zero-copy transfer of the whole file. A file whose size cannot
    /// be read counts as empty.
    pub fn send_file(&self, file: File) {
        let remaining = match file.metadata() {
            Ok(meta) => meta.len() as usize,
            Err(e) => {
                error!("sender fstat(): {}", e);
                0
            }
        };
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.queue.push_back(SendOp::File { file, remaining });
        self.mark_pending(&mut state);
    }

    /// Drain as much of the queue as the socket accepts without blocking.
    /// Returns the number of bytes handed to the kernel.
    pub fn flush(&self) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(0);
        }

        let mut total = 0;
        let mut result = Ok(());
        while let Some(op) = state.queue.front_mut() {
            match op.drive(self.socket.as_ref()) {
                Ok(Progress::Done(n)) => {
                    total += n;
                    state.queue.pop_front();
                }
                Ok(Progress::Blocked(n)) => {
                    total += n;
                    break;
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        if state.queue.is_empty() {
            self.unmark_pending(&mut state);
        } else {
            self.mark_pending(&mut state);
        }
        result.map(|_| total)
    }

    /// Shut the socket down once; later calls are no-ops and queued data is
    /// discarded.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.queue.clear();
        self.socket.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().pending
    }

    /// Number of queued operations.
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn mark_pending(&self, state: &mut SendState) {
        if state.pending {
            return;
        }
        state.pending = true;
        trace!("sender mark pending");
        (self.backpressure.mark)();
    }

    fn unmark_pending(&self, state: &mut SendState) {
        if !state.pending {
            return;
        }
        state.pending = false;
        trace!("sender unmark pending");
        (self.backpressure.unmark)();
    }
}

impl Drop for BufferedSender {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::io::Read;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted socket: accepts at most `budget` bytes until refilled.
    #[derive(Clone, Default)]
    pub struct MockSocket {
        pub written: Arc<Mutex<Vec<u8>>>,
        pub budget: Arc<Mutex<Option<usize>>>,
        pub shutdowns: Arc<AtomicUsize>,
    }

    impl MockSocket {
        pub fn unlimited() -> Self {
            Self::default()
        }

        pub fn with_budget(budget: usize) -> Self {
            let socket = Self::default();
            *socket.budget.lock() = Some(budget);
            socket
        }

        pub fn refill(&self, budget: Option<usize>) {
            *self.budget.lock() = budget;
        }

        pub fn take(&self) -> Vec<u8> {
            std::mem::take(&mut *self.written.lock())
        }

        fn accept(&self, want: usize) -> io::Result<usize> {
            let mut budget = self.budget.lock();
            let n = match *budget {
                None => want,
                Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
                Some(left) => {
                    let n = want.min(left);
                    *budget = Some(left - n);
                    n
                }
            };
            Ok(n)
        }
    }

    impl Socket for MockSocket {
        fn send(&self, buf: &[u8]) -> io::Result<usize> {
            let n = self.accept(buf.len())?;
            self.written.lock().extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn send_file(&self, file: &File, count: usize) -> io::Result<usize> {
            let n = self.accept(count)?;
            let mut chunk = vec![0; n];
            let mut reader = file;
            let read = reader.read(&mut chunk)?;
            self.written.lock().extend_from_slice(&chunk[..read]);
            Ok(read)
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Backpressure that counts mark/unmark calls.
    pub fn counting() -> (Backpressure, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let marks = Arc::new(AtomicUsize::new(0));
        let unmarks = Arc::new(AtomicUsize::new(0));
        let (m, u) = (marks.clone(), unmarks.clone());
        let bp = Backpressure::new(
            move || {
                m.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                u.fetch_add(1, Ordering::SeqCst);
            },
        );
        (bp, marks, unmarks)
    }
}
