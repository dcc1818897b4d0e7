//! The in-process HTTP server: route dispatch (registered handlers beat the filesystem),
//! static file serving with `index.html`/`404.html` fallback, and response formatting.
//! Grounded on `original_source/upagekite/httpd.py`'s `HTTPD.run_handler`/`http_response`
//! and its `Match`-based route table; `services/authenticator` (teacher) is the model for
//! registering typed handlers against a shared `Arc` state.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use indexmap::IndexMap;
use pagekite_core::error::PkResult;
use pagekite_core::logging::{self, Logger};

use crate::config::ClientConfig;
use crate::kite::KiteHandler;

use super::body::{CsrfRing, ParsedBody};
use super::request::{HttpResponse, RequestEnv};

pub type RouteFn = dyn Fn(&mut RequestEnv) -> PkResult<HttpResponse> + Send + Sync;

/// An in-process HTTP server. Normally owned by exactly one `Kite` via its
/// `Arc<dyn KiteHandler>`, but nothing stops wiring the same instance to several kites that
/// should share one webroot and route table.
pub struct HttpServer {
    webroot: PathBuf,
    routes: RwLock<IndexMap<String, Arc<RouteFn>>>,
    cors_origin: Option<String>,
    content_security_policy: Option<String>,
    file_read_bytes: usize,
    csrf: Mutex<CsrfRing>,
    log: Logger,
}

impl HttpServer {
    pub fn new(config: &ClientConfig, log: Logger) -> HttpServer {
        HttpServer {
            webroot: PathBuf::from(&config.webroot),
            routes: RwLock::new(IndexMap::new()),
            cors_origin: config.cors_origin.clone(),
            content_security_policy: config.content_security_policy.clone(),
            file_read_bytes: config.file_read_bytes,
            csrf: Mutex::new(CsrfRing::new()),
            log,
        }
    }

    /// Registers a dynamic route. Dynamic routes always win over a same-named static file.
    pub fn register_route(&self, path: &str, handler: Arc<RouteFn>) {
        self.routes.write().unwrap().insert(path.to_owned(), handler);
    }

    /// Mints a fresh CSRF token for a handler to embed in a form it renders (e.g. as a
    /// hidden `upk_csrf` field); `dispatch` later checks incoming POSTs against the ring
    /// this came from.
    pub fn issue_csrf_token(&self) -> String {
        self.csrf.lock().unwrap().issue()
    }

    fn dispatch(&self, env: &mut RequestEnv) -> PkResult<()> {
        if let Err(e) = env.validate() {
            env.respond(HttpResponse::status(400, "Bad Request"));
            logging::debug!(self.log, "rejected request"; "err" => format!("{:?}", e));
            return Ok(());
        }

        if env.method == "POST" {
            env.parse_body();
            if !matches!(env.parsed_body(), Some(ParsedBody::Json(_))) {
                let valid = env.csrf_token().map(|t| self.csrf.lock().unwrap().check(t)).unwrap_or(false);
                if !valid {
                    env.respond(HttpResponse::status(403, "Forbidden"));
                    logging::debug!(self.log, "rejected post with missing/invalid csrf token"; "path" => %env.path);
                    return Ok(());
                }
            }
        }

        let handler = self.routes.read().unwrap().get(&env.path).cloned();

        let mut response = match handler {
            Some(handler) => handler(env).unwrap_or_else(|_| HttpResponse::status(500, "Internal Server Error")),
            None => self.serve_static(&env.path),
        };

        self.apply_ambient_headers(&mut response);
        env.respond(response);
        Ok(())
    }

    /// Reads a webroot file and returns it as a response. Files larger than
    /// `file_read_bytes` are handed off for a paced, windowed background send instead of
    /// being written out in one shot, per `background_send` (`httpd.py:211-287`): the
    /// status line and headers go out immediately with `eof: false`, and the caller
    /// (`http::run_handler`) starts the chunked send once it has a `TunnelConnection` to
    /// pace it against.
    fn serve_static(&self, path: &str) -> HttpResponse {
        let rel = if path == "/" { "index.html" } else { path.trim_start_matches('/') };

        match safe_join(&self.webroot, rel) {
            Some(full) => match fs::read(&full) {
                Ok(file_body) => {
                    if file_body.len() > self.file_read_bytes {
                        logging::debug!(self.log, "streaming large static file"; "path" => %full.display(), "bytes" => file_body.len());
                        let mut response = HttpResponse::status(200, "OK");
                        response.mimetype = Some(mime_for(&full).to_owned());
                        response.eof = false;
                        response.background_body = Some(file_body);
                        response
                    } else {
                        HttpResponse::ok(file_body, mime_for(&full))
                    }
                }
                Err(_) => self.not_found(),
            },
            None => HttpResponse::status(403, "Forbidden"),
        }
    }

    fn not_found(&self) -> HttpResponse {
        match safe_join(&self.webroot, "404.html") {
            Some(full) => match fs::read(&full) {
                Ok(body) => HttpResponse { code: 404, msg: "Not Found".into(), ..HttpResponse::ok(body, "text/html") },
                Err(_) => HttpResponse::not_found(),
            },
            None => HttpResponse::not_found(),
        }
    }

    fn apply_ambient_headers(&self, response: &mut HttpResponse) {
        if let Some(origin) = &self.cors_origin {
            response.headers.insert("Access-Control-Allow-Origin".to_owned(), origin.clone());
        }
        if let Some(csp) = &self.content_security_policy {
            response.headers.insert("Content-Security-Policy".to_owned(), csp.clone());
        }
    }
}

impl KiteHandler for HttpServer {
    fn handle(&self, env: &mut RequestEnv) -> PkResult<()> {
        self.dispatch(env)
    }
}

/// Rejects `..` components and absolute paths so a crafted request path can't escape
/// `webroot`, per spec §4.7's traversal edge case (the `RequestEnv::validate` check in
/// `request.rs` already rejects `..` textually; this is the filesystem-level backstop).
fn safe_join(root: &Path, rel: &str) -> Option<PathBuf> {
    let rel_path = Path::new(rel);
    if rel_path.components().any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_))) {
        return None;
    }
    Some(root.join(rel_path))
}

fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Serializes an `HttpResponse` into raw HTTP bytes (status line, headers, blank line,
/// body). The status line is `HTTP/1.0` unless the response carries an `Upgrade` header,
/// in which case it's `HTTP/1.1` — exactly `httpd.py`'s `'1.1' if ('Upgrade' in hdrs) else
/// '1.0'`. PageKite tunnels don't keep a stream alive across requests, so `Connection:
/// close` is implicit and never negotiated.
pub fn format_response(response: &HttpResponse, _request_headers: &IndexMap<String, String>) -> Vec<u8> {
    let version = if response.headers.contains_key("Upgrade") { "1.1" } else { "1.0" };
    let mut out = format!("HTTP/{} {} {}\r\n", version, response.code, response.msg);

    if let Some(mimetype) = &response.mimetype {
        out.push_str(&format!("Content-Type: {}\r\n", mimetype));
    }
    let content_length = response.background_body.as_ref().map_or(response.body.len(), Vec::len);
    out.push_str(&format!("Content-Length: {}\r\n", content_length));

    for (name, value) in &response.headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str("\r\n");

    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(&response.body);
    bytes
}
