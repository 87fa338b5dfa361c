// src/router.rs
//! Route tables. Built once before the server starts and shared read-only
//! by every worker; lookups are first-match-wins in registration order.
use regex::Regex;

use crate::error::FugueResult;
use crate::http::{HttpSink, Method, Request, UpgradeNotifier};
use crate::websocket::{Frame, WsSink};

/// Per-connection HTTP handler. Receives one request at a time and answers
/// through the [`HttpSink`] it was built with.
pub trait HttpHandler {
    fn handle(&mut self, req: Request);
}

impl<F: FnMut(Request)> HttpHandler for F {
    fn handle(&mut self, req: Request) {
        self(req)
    }
}

/// Per-connection WebSocket handler. Receives one frame at a time.
pub trait WsHandler {
    fn on_frame(&mut self, frame: Frame);
}

impl<F: FnMut(Frame)> WsHandler for F {
    fn on_frame(&mut self, frame: Frame) {
        self(frame)
    }
}

pub type HttpFactory =
    Box<dyn Fn(HttpSink, UpgradeNotifier) -> Box<dyn HttpHandler> + Send + Sync>;
pub type WsFactory = Box<dyn Fn(WsSink) -> Box<dyn WsHandler> + Send + Sync>;

struct HttpRoute {
    method: Method,
    pattern: Regex,
    factory: HttpFactory,
}

struct WsRoute {
    pattern: Regex,
    factory: WsFactory,
}

#[derive(Default)]
pub struct Router {
    http: Vec<HttpRoute>,
    ws: Vec<WsRoute>,
}

/// Patterns must match the whole path.
fn compile(pattern: &str) -> FugueResult<Regex> {
    Ok(Regex::new(&format!("^(?:{pattern})$"))?)
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F, H>(&mut self, method: Method, pattern: &str, factory: F) -> FugueResult<&mut Self>
    where
        F: Fn(HttpSink, UpgradeNotifier) -> H + Send + Sync + 'static,
        H: HttpHandler + 'static,
    {
        let pattern = compile(pattern)?;
        self.http.push(HttpRoute {
            method,
            pattern,
            factory: Box::new(move |sink, notifier| Box::new(factory(sink, notifier))),
        });
        Ok(self)
    }

    pub fn get<F, H>(&mut self, pattern: &str, factory: F) -> FugueResult<&mut Self>
    where
        F: Fn(HttpSink, UpgradeNotifier) -> H + Send + Sync + 'static,
        H: HttpHandler + 'static,
    {
        self.add(Method::Get, pattern, factory)
    }

    pub fn post<F, H>(&mut self, pattern: &str, factory: F) -> FugueResult<&mut Self>
    where
        F: Fn(HttpSink, UpgradeNotifier) -> H + Send + Sync + 'static,
        H: HttpHandler + 'static,
    {
        self.add(Method::Post, pattern, factory)
    }

    pub fn websocket<F, H>(&mut self, pattern: &str, factory: F) -> FugueResult<&mut Self>
    where
        F: Fn(WsSink) -> H + Send + Sync + 'static,
        H: WsHandler + 'static,
    {
        let pattern = compile(pattern)?;
        self.ws.push(WsRoute {
            pattern,
            factory: Box::new(move |sink| Box::new(factory(sink))),
        });
        Ok(self)
    }

    /// First HTTP route whose method equals the request's and whose pattern
    /// matches its path.
    pub fn match_http(&self, req: &Request) -> Option<&HttpFactory> {
        let method = req.method_kind()?;
        self.http
            .iter()
            .find(|r| r.method == method && r.pattern.is_match(&req.path))
            .map(|r| &r.factory)
    }

    pub fn match_ws(&self, path: &str) -> Option<&WsFactory> {
        self.ws
            .iter()
            .find(|r| r.pattern.is_match(path))
            .map(|r| &r.factory)
    }

    pub fn http_routes(&self) -> usize {
        self.http.len()
    }

    pub fn ws_routes(&self) -> usize {
        self.ws.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FugueError;
    use crate::http::Response;
    use crate::sender::testing::MockSocket;
    use crate::sender::{Backpressure, BufferedSender};
    use std::sync::Arc;

    fn labelled(
        label: &'static str,
    ) -> impl Fn(HttpSink, UpgradeNotifier) -> Box<dyn FnMut(Request)> {
        move |sink: HttpSink, _: UpgradeNotifier| -> Box<dyn FnMut(Request)> {
            Box::new(move |_req: Request| sink.send(Response::ok(label)))
        }
    }

    fn request(method: &str, path: &str) -> Request {
        Request {
            method: method.into(),
            path: path.into(),
            ..Request::default()
        }
    }

    fn dispatch(router: &Router, req: Request) -> Option<String> {
        let factory = router.match_http(&req)?;
        let socket = MockSocket::unlimited();
        let sender = Arc::new(BufferedSender::new(socket.clone(), Backpressure::detached()));
        let mut handler = factory(HttpSink::new(sender.clone()), UpgradeNotifier::new());
        handler.handle(req);
        sender.flush().unwrap();
        Some(String::from_utf8(socket.take()).unwrap())
    }

    #[test]
    fn test_first_match_wins() {
        let mut router = Router::new();
        router
            .get("/api/.*", labelled("broad"))
            .unwrap()
            .get("/api/probe", labelled("narrow"))
            .unwrap();

        let body = dispatch(&router, request("get", "/api/probe")).unwrap();
        assert!(body.ends_with("broad"), "{body}");
    }

    #[test]
    fn test_method_must_match_exactly() {
        let mut router = Router::new();
        router.post("/submit", labelled("post")).unwrap();
        assert!(router.match_http(&request("post", "/submit")).is_some());
        assert!(router.match_http(&request("get", "/submit")).is_none());
        assert!(router.match_http(&request("", "/submit")).is_none());
    }

    #[test]
    fn test_patterns_are_anchored() {
        let mut router = Router::new();
        router.get("/a|/b", labelled("ab")).unwrap();
        assert!(router.match_http(&request("get", "/a")).is_some());
        assert!(router.match_http(&request("get", "/b")).is_some());
        assert!(router.match_http(&request("get", "/abc")).is_none());
        assert!(router.match_http(&request("get", "/x/a")).is_none());
    }

    #[test]
    fn test_websocket_table_is_separate() {
        let mut router = Router::new();
        router
            .websocket("/ws", |_sink: WsSink| |_frame: Frame| {})
            .unwrap();
        assert!(router.match_ws("/ws").is_some());
        assert!(router.match_ws("/ws/extra").is_none());
        assert!(router.match_http(&request("get", "/ws")).is_none());
        assert_eq!((router.http_routes(), router.ws_routes()), (0, 1));
    }

    #[test]
    fn test_invalid_pattern_is_an_error() {
        let mut router = Router::new();
        let err = router.get("/broken(", labelled("x")).err().unwrap();
        assert!(matches!(err, FugueError::Pattern(_)));
        assert_eq!(router.http_routes(), 0);
    }
}
