//! Request parsing and the per-request environment handed to handlers. Grounded on
//! `original_source/upagekite/httpd.py`'s `handle_http_request` (request-line/header
//! parsing, header allowlist) and the dict-shaped response handlers' return contract.

use indexmap::IndexMap;
use regex::Regex;

use pagekite_core::error::{PkError, PkErrorKind, PkResult};

use crate::net::frame::Frame;

/// Headers the server parses out of the raw request; everything else is ignored, both to
/// bound memory on constrained devices and to avoid accidentally trusting hop-by-hop
/// headers a relay might inject.
fn allowed_header_re() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(Auth|Con[nt]|Cook|Host|Orig|Sec-Web|Upgrade|User-Agent)").unwrap()
    })
}

const MAX_HEADER_LINE: usize = 128;

#[derive(Default, Clone)]
pub struct HttpResponse {
    pub code: u16,
    pub msg: String,
    pub mimetype: Option<String>,
    pub headers: IndexMap<String, String>,
    pub body: Vec<u8>,
    pub eof: bool,
    /// Set instead of `body` for large static files: the header block is sent immediately
    /// (with `eof: false`) and this is handed off to `TunnelConnection::start_background_send`
    /// for paced, windowed delivery. See `response::serve_static`.
    pub background_body: Option<Vec<u8>>,
}

impl HttpResponse {
    pub fn ok(body: impl Into<Vec<u8>>, mimetype: &str) -> HttpResponse {
        HttpResponse {
            code: 200,
            msg: "OK".into(),
            mimetype: Some(mimetype.into()),
            headers: IndexMap::new(),
            body: body.into(),
            eof: true,
            background_body: None,
        }
    }

    pub fn status(code: u16, msg: &str) -> HttpResponse {
        HttpResponse {
            code,
            msg: msg.into(),
            mimetype: None,
            headers: IndexMap::new(),
            body: Vec::new(),
            eof: true,
            background_body: None,
        }
    }

    pub fn not_found() -> HttpResponse {
        HttpResponse::status(404, "Not Found")
    }
}

/// The parsed request plus a place for the handler to stash its response. Exists for the
/// lifetime of one request; built fresh for every new SID.
pub struct RequestEnv {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: IndexMap<String, String>,
    pub body: Vec<u8>,
    pub remote_ip: Option<String>,
    pub sid: String,
    pub host: String,

    response: Option<HttpResponse>,
    stream_chunks: Vec<Vec<u8>>,
    postponed: bool,
    parsed_body: Option<super::body::ParsedBody>,
}

impl RequestEnv {
    /// Parses a raw `METHOD path[?qs] HTTP/x.y\r\nHeaders...\r\n\r\nBody` buffer as seen
    /// by the local listener (the whole connection's initial bytes, since the listener
    /// doesn't go through the relay's `SID`/`Host`/`Proto` framing).
    pub fn from_local_frame(frame: &Frame) -> RequestEnv {
        let (head, body) = split_headers_body(&frame.payload);
        let mut env = Self::parse_head(head, body);
        env.sid = frame.sid().unwrap_or_default().to_owned();
        env.host = frame.host().unwrap_or("0.0.0.0").to_owned();
        env.remote_ip = frame.remote_ip().map(str::to_owned);
        env
    }

    /// Parses a request carried as a relay frame's payload: same wire shape, but `Host`/
    /// `Proto`/`RIP` come from the frame's own headers rather than from the HTTP request
    /// line, per spec §4.4/§4.7.
    pub fn from_relay_frame(frame: &Frame) -> RequestEnv {
        let (head, body) = split_headers_body(&frame.payload);
        let mut env = Self::parse_head(head, body);
        env.sid = frame.sid().unwrap_or_default().to_owned();
        env.host = frame.host().unwrap_or_default().to_owned();
        env.remote_ip = frame.remote_ip().map(str::to_owned);
        env
    }

    fn parse_head(head: &[u8], body: &[u8]) -> RequestEnv {
        let head = String::from_utf8_lossy(head);
        let mut lines = head.split("\r\n");

        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or("GET").to_owned();
        let raw_path = parts.next().unwrap_or("/").to_owned();

        let (path, query) = match raw_path.split_once('?') {
            Some((p, q)) => (p.to_owned(), parse_query(q)),
            None => (raw_path, Vec::new()),
        };

        let mut headers = IndexMap::new();
        for line in lines {
            if line.len() > MAX_HEADER_LINE {
                continue;
            }
            if let Some((name, value)) = line.split_once(':') {
                if allowed_header_re().is_match(name.trim()) {
                    headers.insert(name.trim().to_owned(), value.trim().to_owned());
                }
            }
        }

        RequestEnv {
            method,
            path,
            query,
            headers,
            body: body.to_vec(),
            remote_ip: None,
            sid: String::new(),
            host: String::new(),
            response: None,
            stream_chunks: Vec::new(),
            postponed: false,
            parsed_body: None,
        }
    }

    /// Parses `body` by `Content-Type` and stashes the result, making it available to
    /// handlers via `parsed_body()`/`csrf_token()`. Idempotent: the body doesn't change
    /// shape once this is called, so re-parsing would just redo the same work.
    pub fn parse_body(&mut self) {
        if self.parsed_body.is_some() {
            return;
        }
        let content_type = self.headers.get("Content-Type").cloned().unwrap_or_default();
        self.parsed_body = Some(super::body::parse_body(&content_type, &self.body));
    }

    pub fn parsed_body(&self) -> Option<&super::body::ParsedBody> {
        self.parsed_body.as_ref()
    }

    /// Pulls the `upk_csrf` value out of a parsed form or multipart body, per spec §4.8.
    pub fn csrf_token(&self) -> Option<&str> {
        match self.parsed_body.as_ref()? {
            super::body::ParsedBody::Form(pairs) => {
                pairs.iter().find(|(k, _)| k == "upk_csrf").map(|(_, v)| v.as_str())
            }
            super::body::ParsedBody::Multipart(parts) => parts
                .iter()
                .find(|p| p.name == "upk_csrf")
                .and_then(|p| std::str::from_utf8(&p.data).ok()),
            _ => None,
        }
    }

    /// Rejects traversal and any method outside GET/HEAD/POST/OPTIONS, per spec §4.7 step
    /// 1. OPTIONS is accepted (and never subject to CSRF checking, see `response::dispatch`)
    /// so a CORS preflight against a route that sets `Access-Control-Allow-*` can succeed.
    pub fn validate(&self) -> PkResult<()> {
        if !matches!(self.method.as_str(), "GET" | "HEAD" | "POST" | "OPTIONS") {
            return Err(PkError::Fatal(PkErrorKind::Parse(format!("unsupported method {}", self.method))));
        }
        if self.path.contains("..") {
            return Err(PkError::Fatal(PkErrorKind::Parse("path traversal".into())));
        }
        Ok(())
    }

    pub fn respond(&mut self, response: HttpResponse) {
        self.response = Some(response);
    }

    /// Appends one more chunk to a streaming (lazy-iterator-style) response that has
    /// already started; used by static file serving and websocket upgrades that keep the
    /// SID open past the first reply.
    pub fn push_chunk(&mut self, chunk: Vec<u8>) {
        self.stream_chunks.push(chunk);
    }

    pub fn postpone(&mut self) {
        self.postponed = true;
    }

    pub fn is_postponed(&self) -> bool {
        self.postponed
    }

    /// Formats the accumulated response (status line, headers, body) as raw bytes ready
    /// to hand to a `ReplySink`, consuming it so it's only sent once.
    pub fn take_response_bytes(&mut self) -> Option<Vec<u8>> {
        let response = self.response.take()?;
        Some(super::response::format_response(&response, &self.headers))
    }

    pub fn take_stream_chunks(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.stream_chunks)
    }

    /// Pulls the deferred large-file body out of the pending response, if any, without
    /// otherwise disturbing it. Must be called before `take_response_bytes`, which consumes
    /// the response entirely.
    pub fn take_background_body(&mut self) -> Option<Vec<u8>> {
        self.response.as_mut().and_then(|r| r.background_body.take())
    }

    pub fn response_eof(&self) -> bool {
        self.response.as_ref().map(|r| r.eof).unwrap_or(true)
    }
}

fn split_headers_body(payload: &[u8]) -> (&[u8], &[u8]) {
    match payload.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(pos) => (&payload[..pos], &payload[pos + 4..]),
        None => (payload, &[]),
    }
}

fn parse_query(qs: &str) -> Vec<(String, String)> {
    qs.split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (urldecode(k), urldecode(v)),
            None => (urldecode(pair), String::new()),
        })
        .collect()
}

pub fn urldecode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(payload: &str) -> Frame {
        let mut headers = IndexMap::new();
        headers.insert("SID".to_owned(), "sid1".to_owned());
        headers.insert("Host".to_owned(), "example.com".to_owned());
        Frame { headers, payload: payload.as_bytes().to_vec() }
    }

    #[test]
    fn parses_request_line_and_query() {
        let frame = frame_with("GET /foo/bar?a=1&b=two HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let env = RequestEnv::from_relay_frame(&frame);
        assert_eq!(env.method, "GET");
        assert_eq!(env.path, "/foo/bar");
        assert_eq!(env.query, vec![("a".to_owned(), "1".to_owned()), ("b".to_owned(), "two".to_owned())]);
    }

    #[test]
    fn rejects_path_traversal() {
        let frame = frame_with("GET /../etc/passwd HTTP/1.1\r\n\r\n");
        let env = RequestEnv::from_relay_frame(&frame);
        assert!(env.validate().is_err());
    }

    #[test]
    fn rejects_unsupported_method() {
        let frame = frame_with("DELETE /foo HTTP/1.1\r\n\r\n");
        let env = RequestEnv::from_relay_frame(&frame);
        assert!(env.validate().is_err());
    }

    #[test]
    fn drops_disallowed_headers() {
        let frame = frame_with("GET / HTTP/1.1\r\nHost: example.com\r\nX-Evil: 1\r\n\r\n");
        let env = RequestEnv::from_relay_frame(&frame);
        assert!(env.headers.contains_key("Host"));
        assert!(!env.headers.contains_key("X-Evil"));
    }

    #[test]
    fn urldecode_handles_plus_and_percent() {
        assert_eq!(urldecode("a+b%20c"), "a b c");
    }
}
