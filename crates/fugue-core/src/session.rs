// src/session.rs
//! Per-connection protocol state.
//!
//! A session starts in HTTP mode. A request that completes a WebSocket
//! handshake on a WebSocket route replaces the HTTP state with WebSocket
//! state for the rest of the connection's life.
use std::sync::Arc;
use tracing::{debug, error, trace};

use crate::http::{HttpSink, Request, Response, UpgradeNotifier};
use crate::metrics::WorkerMetrics;
use crate::parser::HttpParser;
use crate::router::{HttpHandler, Router, WsHandler};
use crate::sender::BufferedSender;
use crate::websocket::{self, FrameParser, WsSink};

/// What the event loop should do with the connection after a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

struct HttpState {
    parser: HttpParser,
    handler: Option<Box<dyn HttpHandler>>,
    notifier: UpgradeNotifier,
}

struct WsState {
    parser: FrameParser,
    handler: Option<Box<dyn WsHandler>>,
}

enum Active {
    Http(HttpState),
    WebSocket(WsState),
}

pub struct Session {
    router: Arc<Router>,
    sender: Arc<BufferedSender>,
    metrics: Arc<WorkerMetrics>,
    max_payload: usize,
    active: Active,
}

impl Session {
    pub fn new(
        router: Arc<Router>,
        sender: Arc<BufferedSender>,
        metrics: Arc<WorkerMetrics>,
        max_payload: usize,
    ) -> Self {
        Self {
            router,
            sender,
            metrics,
            max_payload,
            active: Active::Http(HttpState {
                parser: HttpParser::new(),
                handler: None,
                notifier: UpgradeNotifier::new(),
            }),
        }
    }

    pub fn is_upgraded(&self) -> bool {
        matches!(self.active, Active::WebSocket(_))
    }

    /// Feed bytes read from the socket and dispatch everything that is now
    /// complete.
    pub fn process(&mut self, bytes: &[u8]) -> Flow {
        if self.sender.is_closed() {
            return Flow::Close;
        }
        self.metrics.add_received(bytes.len());

        let buffered = match &mut self.active {
            Active::Http(http) => {
                http.parser.append(bytes);
                http.parser.len()
            }
            Active::WebSocket(ws) => {
                ws.parser.append(bytes);
                ws.parser.len()
            }
        };
        if buffered > self.max_payload {
            error!(
                "session payload of {} bytes exceeds limit of {}",
                buffered, self.max_payload
            );
            self.sender.close();
            return Flow::Close;
        }

        match self.active {
            Active::Http(_) => self.process_http(),
            Active::WebSocket(_) => self.process_ws(),
        }
    }

    fn process_http(&mut self) -> Flow {
        loop {
            if self.sender.is_closed() {
                return Flow::Close;
            }
            let Active::Http(http) = &mut self.active else {
                break;
            };
            if http.notifier.is_upgraded() && !http.parser.is_passthrough() {
                trace!("session switched to pass-through");
                http.parser.set_passthrough();
            }
            let raw = http.parser.is_passthrough();
            let Some(req) = http.parser.parse() else {
                return Flow::Continue;
            };
            self.metrics.inc_message();

            if raw {
                if let Some(handler) = http.handler.as_mut() {
                    handler.handle(req);
                }
                continue;
            }
            if self.try_upgrade(&req) {
                continue;
            }
            self.dispatch_http(req);
        }
        self.process_ws()
    }

    /// Answer a valid handshake on a WebSocket route and switch protocols.
    /// Anything else falls through to HTTP routing.
    fn try_upgrade(&mut self, req: &Request) -> bool {
        let Some(factory) = self.router.match_ws(&req.path) else {
            return false;
        };
        let Some(response) = websocket::handshake(req) else {
            debug!("session handshake rejected for {}", req.path);
            return false;
        };
        response.write_to(&self.sender);

        let mut parser = FrameParser::new();
        if let Active::Http(http) = &mut self.active {
            parser.append(&http.parser.take_buffered());
        }
        // The HTTP handler is dropped here, before the WebSocket one exists.
        self.active = Active::WebSocket(WsState {
            parser,
            handler: None,
        });
        let handler = factory(WsSink::new(self.sender.clone()));
        if let Active::WebSocket(ws) = &mut self.active {
            ws.handler = Some(handler);
        }
        debug!("session upgraded to websocket on {}", req.path);
        true
    }

    fn dispatch_http(&mut self, req: Request) {
        let Active::Http(http) = &mut self.active else {
            return;
        };
        http.handler = None;
        // An Upgrade header alone does not switch protocols. Only the
        // handler's notifier keeps the connection in pass-through.
        http.parser.clear_passthrough();

        let Some(factory) = self.router.match_http(&req) else {
            debug!("session no route for {} {}", req.method, req.path);
            Response::not_found().write_to(&self.sender);
            return;
        };
        let notifier = UpgradeNotifier::new();
        let mut handler = factory(HttpSink::new(self.sender.clone()), notifier.clone());
        handler.handle(req);
        http.handler = Some(handler);
        http.notifier = notifier;
    }

    fn process_ws(&mut self) -> Flow {
        loop {
            if self.sender.is_closed() {
                return Flow::Close;
            }
            let Active::WebSocket(ws) = &mut self.active else {
                return Flow::Continue;
            };
            let Some(frame) = ws.parser.parse() else {
                return Flow::Continue;
            };
            self.metrics.inc_message();

            if frame.is_close() {
                debug!("session websocket close frame");
                self.sender.close();
                return Flow::Close;
            }
            match ws.handler.as_mut() {
                Some(handler) => handler.on_frame(frame),
                None => {
                    error!("session websocket frame without a handler");
                    self.sender.close();
                    return Flow::Close;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::Backpressure;
    use crate::sender::testing::MockSocket;
    use crate::websocket::Frame;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HANDSHAKE: &[u8] = b"GET /ws HTTP/1.1\r\n\
Host: localhost\r\n\
Upgrade: Websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: x3JJHMbDL1EzLkh9GBhXDw==\r\n\r\n";

    const KEY: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];

    struct Harness {
        session: Session,
        sender: Arc<BufferedSender>,
        socket: MockSocket,
    }

    impl Harness {
        fn new(router: Router, max_payload: usize) -> Self {
            let socket = MockSocket::unlimited();
            let sender = Arc::new(BufferedSender::new(socket.clone(), Backpressure::detached()));
            let session = Session::new(
                Arc::new(router),
                sender.clone(),
                Arc::new(WorkerMetrics::new()),
                max_payload,
            );
            Self {
                session,
                sender,
                socket,
            }
        }

        fn feed(&mut self, bytes: &[u8]) -> Flow {
            let flow = self.session.process(bytes);
            self.sender.flush().unwrap();
            flow
        }

        fn output(&self) -> String {
            String::from_utf8_lossy(&self.socket.take()).into_owned()
        }
    }

    fn echo_router() -> Router {
        let mut router = Router::new();
        router
            .get("/hello", |sink: HttpSink, _| {
                move |req: Request| sink.send(Response::ok(format!("hi {}", req.path)))
            })
            .unwrap()
            .websocket("/ws", |sink: WsSink| move |frame: Frame| sink.send(frame))
            .unwrap();
        router
    }

    #[test]
    fn test_unmatched_route_is_404() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut router = Router::new();
        router
            .get("/only", move |_sink: HttpSink, _| {
                seen.fetch_add(1, Ordering::SeqCst);
                |_req: Request| {}
            })
            .unwrap();
        let mut h = Harness::new(router, 1 << 20);

        assert_eq!(h.feed(b"GET /missing HTTP/1.1\r\n\r\n"), Flow::Continue);
        assert_eq!(
            h.output(),
            "HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\nContent-Type: text/plain\r\n\r\nNot Found"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pipelined_requests_answered_in_order() {
        let mut h = Harness::new(echo_router(), 1 << 20);
        h.feed(b"GET /hello HTTP/1.1\r\n\r\nGET /nope HTTP/1.1\r\n\r\nGET /hello HTTP/1.1\r\n\r\n");
        let out = h.output();
        let first = out.find("hi /hello").unwrap();
        let missing = out.find("404 Not Found").unwrap();
        let last = out.rfind("hi /hello").unwrap();
        assert!(first < missing && missing < last);
    }

    #[test]
    fn test_handler_is_rebuilt_per_request() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();
        let mut router = Router::new();
        router
            .get("/.*", move |sink: HttpSink, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                move |_req: Request| sink.send(Response::ok("ok"))
            })
            .unwrap();
        let mut h = Harness::new(router, 1 << 20);
        h.feed(b"GET /a HTTP/1.1\r\n\r\n");
        h.feed(b"GET /b HTTP/1.1\r\n\r\n");
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_upgrade_then_frames() {
        let mut h = Harness::new(echo_router(), 1 << 20);
        let mut bytes = HANDSHAKE.to_vec();
        bytes.extend(Frame::text("ping").encode_masked(KEY));

        assert_eq!(h.feed(&bytes), Flow::Continue);
        assert!(h.session.is_upgraded());
        let mut expected = b"HTTP/1.1 101 Switching Protocols\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Accept: HSmrc0sMlYUkAGmm5OPpG2HaGWk=\r\n\r\n"
            .to_vec();
        expected.extend(Frame::text("ping").encode());
        assert_eq!(h.socket.take(), expected);

        // Never parsed as HTTP again.
        assert_eq!(h.feed(b"GET /hello HTTP/1.1\r\n\r\n"), Flow::Continue);
        assert!(h.output().is_empty());
    }

    #[test]
    fn test_close_opcode_closes_silently() {
        let mut h = Harness::new(echo_router(), 1 << 20);
        h.feed(HANDSHAKE);
        h.output();

        let mut bytes = Frame::close().encode_masked(KEY);
        bytes.extend(Frame::text("late").encode_masked(KEY));
        assert_eq!(h.feed(&bytes), Flow::Close);
        assert!(h.sender.is_closed());
        assert!(h.output().is_empty());
        assert_eq!(h.socket.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(h.feed(&Frame::text("x").encode_masked(KEY)), Flow::Close);
    }

    #[test]
    fn test_failed_handshake_falls_through() {
        let mut router = echo_router();
        router
            .get("/ws", |sink: HttpSink, _| move |_req: Request| sink.send(Response::ok("plain")))
            .unwrap();
        let mut h = Harness::new(router, 1 << 20);
        h.feed(b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\n\r\n");
        assert!(!h.session.is_upgraded());
        assert!(h.output().ends_with("plain"));

        let mut h = Harness::new(echo_router(), 1 << 20);
        h.feed(b"GET /ws HTTP/1.1\r\nSec-WebSocket-Key: abc\r\n\r\n");
        assert!(!h.session.is_upgraded());
        assert!(h.output().starts_with("HTTP/1.1 404 Not Found"));
    }

    #[test]
    fn test_failed_handshake_keeps_parsing_requests() {
        let mut h = Harness::new(echo_router(), 1 << 20);
        h.feed(b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\n\r\n");
        assert!(h.output().starts_with("HTTP/1.1 404 Not Found"));

        h.feed(b"GET /hello HTTP/1.1\r\n\r\n");
        assert!(h.output().ends_with("hi /hello"));
    }

    #[test]
    fn test_foreign_upgrade_header_does_not_switch_protocols() {
        let paths = Arc::new(Mutex::new(Vec::new()));
        let log = paths.clone();
        let mut router = Router::new();
        router
            .get("/.*", move |_sink: HttpSink, _| {
                let log = log.clone();
                move |req: Request| log.lock().push(req.path)
            })
            .unwrap();
        let mut h = Harness::new(router, 1 << 20);
        h.feed(
            b"GET /a HTTP/1.1\r\nUpgrade: h2c\r\nConnection: Upgrade\r\n\r\n\
GET /b HTTP/1.1\r\n\r\n",
        );
        h.feed(b"GET /c HTTP/1.1\r\n\r\n");
        assert_eq!(*paths.lock(), vec!["/a".to_string(), "/b".into(), "/c".into()]);
    }

    #[test]
    fn test_oversized_payload_closes_without_response() {
        let mut h = Harness::new(echo_router(), 64);
        assert_eq!(h.feed(b"GET /hello HTTP/1.1\r\n"), Flow::Continue);
        assert_eq!(h.feed(&[b'x'; 64]), Flow::Close);
        assert!(h.sender.is_closed());
        assert!(h.output().is_empty());
    }

    #[test]
    fn test_notifier_switches_to_raw_delivery() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = received.clone();
        let mut router = Router::new();
        router
            .post("/stream", move |_sink: HttpSink, notifier: UpgradeNotifier| {
                let log = log.clone();
                move |req: Request| {
                    if !req.is_raw() {
                        notifier.upgrade();
                    }
                    log.lock().push(req.body);
                }
            })
            .unwrap();
        let mut h = Harness::new(router, 1 << 20);
        h.feed(b"POST /stream HTTP/1.1\r\nContent-Length: 2\r\n\r\nhiGET /x HTTP/1.1\r\n\r\n");
        h.feed(b"more");
        assert_eq!(
            *received.lock(),
            vec![b"hi".to_vec(), b"GET /x HTTP/1.1\r\n\r\n".to_vec(), b"more".to_vec()]
        );
        assert!(h.output().is_empty());
    }
}
