// src/parser.rs
//! Incremental HTTP/1.1 request parser.
//!
//! Bytes are appended as they arrive; [`HttpParser::parse`] extracts at most
//! one complete request per call and keeps its place between calls, so any
//! fragmentation of the input yields the same requests. There is no error
//! state: a request that is not complete yet is simply not returned, and the
//! caller bounds the buffered size.
use memchr::memmem;
use std::collections::HashMap;

use crate::http::{Headers, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    RequestLine,
    Headers,
    Body { length: usize },
}

pub struct HttpParser {
    buf: Vec<u8>,
    /// Bytes of `buf` already recognised as part of the current request.
    cursor: usize,
    stage: Stage,
    partial: Request,
    passthrough: bool,
}

impl HttpParser {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(1024),
            cursor: 0,
            stage: Stage::RequestLine,
            partial: Request::default(),
            passthrough: false,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Buffered bytes not yet handed out as a request.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whether the parser has stopped recognising requests and hands out
    /// raw bytes instead.
    pub fn is_passthrough(&self) -> bool {
        self.passthrough
    }

    pub fn set_passthrough(&mut self) {
        self.passthrough = true;
    }

    pub fn clear_passthrough(&mut self) {
        self.passthrough = false;
    }

    /// Remove and return everything still buffered, resetting the parser.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        self.cursor = 0;
        self.stage = Stage::RequestLine;
        self.partial = Request::default();
        std::mem::take(&mut self.buf)
    }

    /// Extract the next complete request, or `None` until more bytes arrive.
    ///
    /// Once a request carrying an `Upgrade` header has been returned, every
    /// later call yields the raw buffered bytes as [`Request::raw`].
    pub fn parse(&mut self) -> Option<Request> {
        if self.passthrough {
            if self.buf.is_empty() {
                return None;
            }
            return Some(Request::raw(self.take_buffered()));
        }

        loop {
            match self.stage {
                Stage::RequestLine => {
                    let line_end = self.find_line_end()?;
                    let line = &self.buf[self.cursor..line_end];
                    self.cursor = line_end + 2;
                    // Stray CRLFs between requests are skipped.
                    if line.is_empty() {
                        continue;
                    }
                    parse_request_line(line, &mut self.partial);
                    self.stage = Stage::Headers;
                }
                Stage::Headers => {
                    let line_end = self.find_line_end()?;
                    if line_end == self.cursor {
                        self.cursor += 2;
                        let length = self
                            .partial
                            .headers
                            .get("content-length")
                            .and_then(|v| v.trim().parse::<usize>().ok())
                            .unwrap_or(0);
                        self.stage = Stage::Body { length };
                        continue;
                    }
                    parse_header_line(&self.buf[self.cursor..line_end], &mut self.partial.headers);
                    self.cursor = line_end + 2;
                }
                Stage::Body { length } => {
                    if self.buf.len() - self.cursor < length {
                        return None;
                    }
                    let body_end = self.cursor + length;
                    self.partial.body = self.buf[self.cursor..body_end].to_vec();
                    return Some(self.finish(body_end));
                }
            }
        }
    }

    fn find_line_end(&self) -> Option<usize> {
        memmem::find(&self.buf[self.cursor..], b"\r\n").map(|i| self.cursor + i)
    }

    fn finish(&mut self, consumed: usize) -> Request {
        self.buf.drain(..consumed);
        self.cursor = 0;
        self.stage = Stage::RequestLine;
        let request = std::mem::take(&mut self.partial);
        if request.headers.contains("upgrade") {
            self.passthrough = true;
        }
        request
    }
}

impl Default for HttpParser {
    fn default() -> Self {
        Self::new()
    }
}

/// `METHOD URI VERSION`. Missing tokens stay empty, which routes to 404.
fn parse_request_line(line: &[u8], req: &mut Request) {
    let line = String::from_utf8_lossy(line);
    let mut tokens = line.split_ascii_whitespace();
    req.method = tokens.next().unwrap_or_default().to_ascii_lowercase();
    let uri = tokens.next().unwrap_or_default();
    req.version = tokens.next().unwrap_or_default().to_string();

    match uri.split_once('?') {
        Some((path, query)) => {
            req.path = path.to_string();
            req.query = parse_query(query);
        }
        None => req.path = uri.to_string(),
    }
}

/// `field: value`; a line without a colon is a field with an empty value.
fn parse_header_line(line: &[u8], headers: &mut Headers) {
    let line = String::from_utf8_lossy(line);
    let (field, value) = line.split_once(':').unwrap_or((&line, ""));
    let field = field.trim();
    if field.is_empty() {
        return;
    }
    headers.insert(field, value.trim());
}

/// `a=1&b&a=2` gives `{a: 2, b: ""}`.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(key.to_string(), value.to_string());
    }
    params
}
