// src/http.rs
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::error;

use crate::sender::BufferedSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
    Connect,
}

impl Method {
    /// Case-insensitive lookup of a request-line method token.
    pub fn from_token(token: &str) -> Option<Self> {
        const ALL: [Method; 9] = [
            Method::Get,
            Method::Post,
            Method::Put,
            Method::Delete,
            Method::Patch,
            Method::Head,
            Method::Options,
            Method::Trace,
            Method::Connect,
        ];
        ALL.into_iter().find(|m| m.as_str().eq_ignore_ascii_case(token))
    }

    /// Lower-case form, as stored in [`Request::method`].
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "get",
            Method::Post => "post",
            Method::Put => "put",
            Method::Delete => "delete",
            Method::Patch => "patch",
            Method::Head => "head",
            Method::Options => "options",
            Method::Trace => "trace",
            Method::Connect => "connect",
        }
    }
}

/// Request headers keyed by lower-cased field name; the last value wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(HashMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: &str, value: impl Into<String>) {
        self.0.insert(field.to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        match self.0.get(field) {
            Some(v) => Some(v.as_str()),
            None => self.0.get(&field.to_ascii_lowercase()).map(String::as_str),
        }
    }

    pub fn contains(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A parsed request. `method` is lower-cased; `path` excludes the query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Request {
    /// Bytes received after the connection switched to pass-through mode.
    pub fn raw(body: Vec<u8>) -> Self {
        Self {
            body,
            ..Self::default()
        }
    }

    /// Whether this is pass-through data rather than a parsed request.
    /// Parsed requests always carry a method token.
    pub fn is_raw(&self) -> bool {
        self.method.is_empty()
    }

    pub fn header(&self, field: &str) -> Option<&str> {
        self.headers.get(field)
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    pub fn method_kind(&self) -> Option<Method> {
        Method::from_token(&self.method)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    SwitchingProtocols,
    Ok,
    BadRequest,
    NotFound,
}

impl Status {
    pub fn code(&self) -> u16 {
        match self {
            Status::SwitchingProtocols => 101,
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::NotFound => 404,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Status::SwitchingProtocols => "Switching Protocols",
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::NotFound => "Not Found",
        }
    }

    fn is_informational(&self) -> bool {
        self.code() < 200
    }
}

/// Response header fields, written in insertion order.
pub type HeaderList = Vec<(String, String)>;

pub const MULTIPART_BOUNDARY: &str = "BND";

/// Everything a handler can put on the wire. Streaming kinds are a start
/// value followed by any number of parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Plain {
        status: Status,
        headers: HeaderList,
        body: Vec<u8>,
    },
    /// 200 with the file as body, or 404 if it cannot be opened.
    File { headers: HeaderList, path: PathBuf },
    ChunkedStart { headers: HeaderList },
    /// One chunk; an empty body terminates the stream.
    Chunk { body: Vec<u8> },
    MultipartStart,
    MultipartPart { headers: HeaderList, body: Vec<u8> },
    /// Pre-encoded bytes, sent verbatim.
    Raw(Vec<u8>),
}

impl Response {
    pub fn new(status: Status) -> Self {
        Response::Plain {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::text(Status::Ok, body)
    }

    pub fn text(status: Status, body: impl Into<Vec<u8>>) -> Self {
        Response::Plain {
            status,
            headers: vec![("Content-Type".into(), "text/plain".into())],
            body: body.into(),
        }
    }

    pub fn json(body: impl Into<Vec<u8>>) -> Self {
        Response::Plain {
            status: Status::Ok,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: body.into(),
        }
    }

    pub fn not_found() -> Self {
        Self::text(Status::NotFound, "Not Found")
    }

    pub fn bad_request() -> Self {
        Self::text(Status::BadRequest, "Bad Request")
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Response::File {
            headers: Vec::new(),
            path: path.into(),
        }
    }

    pub fn chunked_start() -> Self {
        Response::ChunkedStart { headers: Vec::new() }
    }

    pub fn chunk(body: impl Into<Vec<u8>>) -> Self {
        Response::Chunk { body: body.into() }
    }

    pub fn multipart_start() -> Self {
        Response::MultipartStart
    }

    pub fn multipart_part(body: impl Into<Vec<u8>>) -> Self {
        Response::MultipartPart {
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Add a header field. No-op for kinds without headers.
    pub fn header(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        match &mut self {
            Response::Plain { headers, .. }
            | Response::File { headers, .. }
            | Response::ChunkedStart { headers }
            | Response::MultipartPart { headers, .. } => headers.push((field.into(), value.into())),
            Response::Chunk { .. } | Response::MultipartStart | Response::Raw(_) => {}
        }
        self
    }

    /// Serialise onto a connection's outbound queue.
    pub fn write_to(self, sender: &BufferedSender) {
        match self {
            Response::File { headers, path } => {
                let file = match File::open(&path) {
                    Ok(file) => file,
                    Err(e) => {
                        error!("http open({:?}): {}", path, e);
                        return Response::not_found().write_to(sender);
                    }
                };
                let size = match file.metadata() {
                    Ok(meta) if meta.is_file() => meta.len(),
                    Ok(_) => {
                        error!("http open({:?}): not a regular file", path);
                        return Response::not_found().write_to(sender);
                    }
                    Err(e) => {
                        error!("http stat({:?}): {}", path, e);
                        return Response::not_found().write_to(sender);
                    }
                };
                let mut head = Vec::with_capacity(128);
                status_line(&mut head, Status::Ok);
                push_header(&mut head, "Content-Length", &size.to_string());
                push_headers(&mut head, &headers, true);
                head.extend_from_slice(b"\r\n");
                sender.send(head);
                sender.send_file(file);
            }
            other => {
                if let Some(bytes) = other.encode() {
                    sender.send(bytes);
                }
            }
        }
    }

    /// Wire bytes for every kind except [`Response::File`], whose body lives
    /// on disk and is only written through [`Response::write_to`].
    pub fn encode(self) -> Option<Vec<u8>> {
        let mut buf = Vec::with_capacity(128);
        match self {
            Response::Plain {
                status,
                headers,
                body,
            } => {
                status_line(&mut buf, status);
                if !status.is_informational() {
                    push_header(&mut buf, "Content-Length", &body.len().to_string());
                }
                push_headers(&mut buf, &headers, true);
                buf.extend_from_slice(b"\r\n");
                buf.extend_from_slice(&body);
            }
            Response::File { .. } => return None,
            Response::ChunkedStart { headers } => {
                status_line(&mut buf, Status::Ok);
                push_header(&mut buf, "Transfer-Encoding", "chunked");
                push_headers(&mut buf, &headers, false);
                buf.extend_from_slice(b"\r\n");
            }
            Response::Chunk { body } => {
                buf.extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
                buf.extend_from_slice(&body);
                buf.extend_from_slice(b"\r\n");
            }
            Response::MultipartStart => {
                status_line(&mut buf, Status::Ok);
                push_header(
                    &mut buf,
                    "Content-Type",
                    &format!("multipart/x-mixed-replace; boundary=\"{MULTIPART_BOUNDARY}\""),
                );
                buf.extend_from_slice(b"\r\n");
            }
            Response::MultipartPart { headers, body } => {
                buf.extend_from_slice(format!("--{MULTIPART_BOUNDARY}\r\n").as_bytes());
                push_header(&mut buf, "Content-Length", &body.len().to_string());
                push_headers(&mut buf, &headers, true);
                buf.extend_from_slice(b"\r\n");
                buf.extend_from_slice(&body);
                buf.extend_from_slice(b"\r\n");
            }
            Response::Raw(bytes) => return Some(bytes),
        }
        Some(buf)
    }
}

fn status_line(buf: &mut Vec<u8>, status: Status) {
    buf.extend_from_slice(b"HTTP/1.1 ");
    buf.extend_from_slice(status.code().to_string().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(status.reason().as_bytes());
    buf.extend_from_slice(b"\r\n");
}

fn push_header(buf: &mut Vec<u8>, field: &str, value: &str) {
    buf.extend_from_slice(field.as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(b"\r\n");
}

/// The injected Content-Length always wins over a caller-supplied one.
fn push_headers(buf: &mut Vec<u8>, headers: &HeaderList, skip_length: bool) {
    for (field, value) in headers {
        if skip_length && field.eq_ignore_ascii_case("content-length") {
            continue;
        }
        push_header(buf, field, value);
    }
}

/// Where an HTTP handler sends its responses.
#[derive(Clone)]
pub struct HttpSink {
    sender: Arc<BufferedSender>,
}

impl HttpSink {
    pub fn new(sender: Arc<BufferedSender>) -> Self {
        Self { sender }
    }

    pub fn send(&self, response: Response) {
        response.write_to(&self.sender);
    }

    pub fn close(&self) {
        self.sender.close();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Lets a handler switch its connection's HTTP parser to raw pass-through:
/// every later read is delivered to the same handler as [`Request::raw`].
#[derive(Clone, Default)]
pub struct UpgradeNotifier(Arc<AtomicBool>);

impl UpgradeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upgrade(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_upgraded(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
