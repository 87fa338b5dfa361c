// src/app.rs
//! Application handlers served by the `fugue` binary: static files, the
//! system probe API and a WebSocket echo endpoint.
use fugue_core::{
    Frame, FugueResult, HttpSink, Opcode, Request, Response, Router, WsSink,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error};

use crate::probe::ProbeHistory;

#[derive(Debug, Clone)]
pub struct AppOptions {
    pub www_root: PathBuf,
}

/// Map a request path onto a file under `root`. `/` and directories map to
/// their `index.html`; any `..` segment is refused.
pub fn resolve_static(root: &Path, uri: &str) -> Option<PathBuf> {
    let rel = uri.trim_start_matches('/');
    if rel.split('/').any(|segment| segment == "..") {
        return None;
    }
    let path = if rel.is_empty() {
        root.join("index.html")
    } else {
        root.join(rel)
    };
    if path.is_dir() {
        return Some(path.join("index.html"));
    }
    Some(path)
}

pub fn mime_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

fn serve_file(root: &Path, req: &Request) -> Response {
    match resolve_static(root, &req.path) {
        Some(path) => {
            let mime = mime_type(&path);
            Response::file(path).header("Content-Type", mime)
        }
        None => {
            debug!("app refused path {}", req.path);
            Response::not_found()
        }
    }
}

fn probe_json(history: &ProbeHistory) -> Response {
    match serde_json::to_vec(&history.deltas()) {
        Ok(body) => Response::json(body),
        Err(e) => {
            error!("app probe serialisation: {}", e);
            Response::bad_request()
        }
    }
}

fn probe_stream(history: &ProbeHistory, sink: &HttpSink) {
    let latest = history.deltas().last().copied();
    let body = match serde_json::to_vec(&latest) {
        Ok(body) => body,
        Err(e) => {
            error!("app probe serialisation: {}", e);
            b"null".to_vec()
        }
    };
    sink.send(Response::multipart_start());
    sink.send(Response::multipart_part(body).header("Content-Type", "application/json"));
}

/// Pass-through chunks are never answered; these routes do not upgrade.
fn answer(req: &Request, respond: impl FnOnce()) {
    if req.is_raw() {
        debug!("app ignored {} raw bytes", req.body.len());
        return;
    }
    respond();
}

/// Text and binary frames come back unchanged; pings are answered.
fn echo(sink: &WsSink, frame: Frame) {
    match frame.opcode {
        Opcode::PING => sink.send(Frame::new(true, Opcode::PONG, frame.payload)),
        Opcode::PONG => {}
        _ => sink.send(frame),
    }
}

pub fn build_router(options: AppOptions, history: Arc<ProbeHistory>) -> FugueResult<Router> {
    let mut router = Router::new();
    let stream_history = history.clone();
    let root = Arc::new(options.www_root);

    router
        .websocket("/ws", |sink: WsSink| move |frame: Frame| echo(&sink, frame))?
        .get("/api/probe/stream", move |sink: HttpSink, _| {
            let history = stream_history.clone();
            move |req: Request| answer(&req, || probe_stream(&history, &sink))
        })?
        .get("/api/probe", move |sink: HttpSink, _| {
            let history = history.clone();
            move |req: Request| answer(&req, || sink.send(probe_json(&history)))
        })?
        .get("/.*", move |sink: HttpSink, _| {
            let root = root.clone();
            move |req: Request| answer(&req, || sink.send(serve_file(&root, &req)))
        })?;
    Ok(router)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::Sample;
    use fugue_core::sender::{Backpressure, BufferedSender, Socket};
    use fugue_core::{HttpHandler, Server, ServerConfig, UpgradeNotifier};
    use parking_lot::Mutex;
    use std::fs::{self, File};
    use std::io::{self, Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<u8>>>);

    impl Socket for Recorder {
        fn send(&self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn send_file(&self, _file: &File, count: usize) -> io::Result<usize> {
            Ok(count)
        }

        fn shutdown(&self) {}
    }

    #[test]
    fn test_resolve_static_paths() {
        let root = Path::new("/srv/www");
        assert_eq!(resolve_static(root, "/"), Some(root.join("index.html")));
        assert_eq!(resolve_static(root, "/css/site.css"), Some(root.join("css/site.css")));
        assert_eq!(resolve_static(root, "/../etc/passwd"), None);
        assert_eq!(resolve_static(root, "/a/../../b"), None);
    }

    #[test]
    fn test_directory_maps_to_index() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        assert_eq!(
            resolve_static(dir.path(), "/docs"),
            Some(dir.path().join("docs").join("index.html"))
        );
    }

    #[test]
    fn test_mime_types() {
        assert_eq!(mime_type(Path::new("index.html")), "text/html");
        assert_eq!(mime_type(Path::new("site.css")), "text/css");
        assert_eq!(mime_type(Path::new("blob")), "application/octet-stream");
    }

    #[test]
    fn test_raw_bytes_are_not_answered() {
        let dir = tempfile::tempdir().unwrap();
        let options = AppOptions {
            www_root: dir.path().to_path_buf(),
        };
        let router = build_router(options, Arc::new(ProbeHistory::new(4))).unwrap();

        for path in ["/", "/index.html", "/api/probe", "/api/probe/stream"] {
            let recorder = Recorder::default();
            let sender = Arc::new(BufferedSender::new(recorder.clone(), Backpressure::detached()));
            let req = Request {
                method: "get".into(),
                path: path.into(),
                ..Request::default()
            };
            let factory = router.match_http(&req).unwrap();
            let mut handler = factory(HttpSink::new(sender.clone()), UpgradeNotifier::new());

            handler.handle(Request::raw(b"GET /index.html HTTP/1.1\r\n\r\n".to_vec()));
            sender.flush().unwrap();
            assert!(recorder.0.lock().is_empty(), "{path} answered raw bytes");

            handler.handle(req);
            sender.flush().unwrap();
            assert!(recorder.0.lock().starts_with(b"HTTP/1.1 "), "{path} did not answer");
        }
    }

    fn read_some(stream: &mut TcpStream, len: usize) -> String {
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_app_routes_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "<p>home</p>").unwrap();

        let history = Arc::new(ProbeHistory::new(4));
        for (t, total, idle) in [(1, 100, 50), (2, 200, 100)] {
            history.push(Sample {
                timestamp: t,
                cpu_total: total,
                cpu_idle: idle,
                mem_total: 10,
                mem_free: 5,
                mem_avail: 7,
            });
        }
        let router = build_router(
            AppOptions {
                www_root: dir.path().to_path_buf(),
            },
            history,
        )
        .unwrap();
        let config = ServerConfig {
            port: 0,
            workers: 1,
            pin_workers: false,
            metrics_interval_secs: 0,
            ..ServerConfig::default()
        };
        let running = Server::new(config).start(router).unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", running.local_port())).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let expected = "HTTP/1.1 200 OK\r\nContent-Length: 11\r\nContent-Type: text/html\r\n\r\n<p>home</p>";
        assert_eq!(read_some(&mut stream, expected.len()), expected);

        stream.write_all(b"GET /../secret HTTP/1.1\r\n\r\n").unwrap();
        let not_found = "HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\nContent-Type: text/plain\r\n\r\nNot Found";
        assert_eq!(read_some(&mut stream, not_found.len()), not_found);

        stream.write_all(b"GET /api/probe HTTP/1.1\r\n\r\n").unwrap();
        let body = r#"[{"timestamp":2,"cpu":0.5,"memtotal":10,"memfree":5,"memavail":7}]"#;
        let expected = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/json\r\n\r\n{}",
            body.len(),
            body
        );
        assert_eq!(read_some(&mut stream, expected.len()), expected);

        running.shutdown();
        running.join().unwrap();
    }
}
