//! Integration tests for `HttpServer`'s dispatch: route vs. static precedence, static file
//! serving (including the large-file background-send handoff), and CSRF enforcement on
//! POST. Exercises `HttpServer` the way `http::mod::run_handler` does, through the
//! `KiteHandler` trait, without needing a live relay connection.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use pagekite_core::error::PkResult;
use pagekite_core::logging;
use pagekite_tunnel::config::ClientConfig;
use pagekite_tunnel::http::request::{HttpResponse, RequestEnv};
use pagekite_tunnel::http::response::HttpServer;
use pagekite_tunnel::kite::KiteHandler;
use pagekite_tunnel::net::frame::Frame;

fn scratch_webroot(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("pagekite-test-webroot-{}-{}", std::process::id(), name));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn server_with_webroot(webroot: &PathBuf, file_read_bytes: usize) -> HttpServer {
    let mut config = ClientConfig::default();
    config.webroot = webroot.to_string_lossy().into_owned();
    config.file_read_bytes = file_read_bytes;
    HttpServer::new(&config, logging::discard())
}

fn frame_for(request_line: &str, headers: &[(&str, &str)], body: &[u8]) -> Frame {
    let mut h = IndexMap::new();
    h.insert("SID".to_owned(), "sid-1".to_owned());
    h.insert("Host".to_owned(), "test.example.com".to_owned());
    let mut payload = format!("{}\r\n", request_line).into_bytes();
    for (name, value) in headers {
        payload.extend_from_slice(format!("{}: {}\r\n", name, value).into_bytes().as_slice());
    }
    payload.extend_from_slice(b"\r\n");
    payload.extend_from_slice(body);
    Frame { headers: h, payload }
}

#[test]
fn serves_small_static_file_inline() {
    let root = scratch_webroot("small");
    fs::write(root.join("hello.txt"), b"hi there").unwrap();
    let server = server_with_webroot(&root, 1024);

    let mut env = RequestEnv::from_relay_frame(&frame_for("GET /hello.txt HTTP/1.1", &[], b""));
    server.handle(&mut env).unwrap();

    let bytes = env.take_response_bytes().unwrap();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("200 OK"));
    assert!(text.ends_with("hi there"));
    assert!(env.take_background_body().is_none());
}

#[test]
fn defers_large_static_file_to_background_send() {
    let root = scratch_webroot("large");
    let body = vec![b'x'; 4096];
    fs::write(root.join("big.bin"), &body).unwrap();
    let server = server_with_webroot(&root, 1024);

    let mut env = RequestEnv::from_relay_frame(&frame_for("GET /big.bin HTTP/1.1", &[], b""));
    server.handle(&mut env).unwrap();

    let background = env.take_background_body();
    assert_eq!(background, Some(body));

    let bytes = env.take_response_bytes().unwrap();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("200 OK"));
    assert!(text.contains("Content-Length: 4096"));
}

#[test]
fn rejects_path_traversal_before_touching_disk() {
    let root = scratch_webroot("traversal");
    let server = server_with_webroot(&root, 1024);

    let mut env = RequestEnv::from_relay_frame(&frame_for("GET /../../etc/passwd HTTP/1.1", &[], b""));
    server.handle(&mut env).unwrap();

    let bytes = env.take_response_bytes().unwrap();
    assert!(String::from_utf8_lossy(&bytes).starts_with("HTTP/1.0 400"));
}

#[test]
fn registered_route_wins_over_static_file() {
    let root = scratch_webroot("routes");
    fs::write(root.join("api.html"), b"static version").unwrap();
    let server = server_with_webroot(&root, 1024);

    server.register_route(
        "/api.html",
        Arc::new(|_env: &mut RequestEnv| -> PkResult<HttpResponse> { Ok(HttpResponse::ok(b"dynamic version".to_vec(), "text/plain")) }),
    );

    let mut env = RequestEnv::from_relay_frame(&frame_for("GET /api.html HTTP/1.1", &[], b""));
    server.handle(&mut env).unwrap();

    let bytes = env.take_response_bytes().unwrap();
    assert!(String::from_utf8_lossy(&bytes).ends_with("dynamic version"));
}

#[test]
fn post_without_csrf_token_is_rejected() {
    let root = scratch_webroot("csrf-missing");
    let server = server_with_webroot(&root, 1024);
    server.register_route("/submit", Arc::new(|_env: &mut RequestEnv| Ok(HttpResponse::ok(b"ok".to_vec(), "text/plain"))));

    let body = b"field=value";
    let headers = [("Content-Type", "application/x-www-form-urlencoded")];
    let mut env = RequestEnv::from_relay_frame(&frame_for("POST /submit HTTP/1.1", &headers, body));
    server.handle(&mut env).unwrap();

    let bytes = env.take_response_bytes().unwrap();
    assert!(String::from_utf8_lossy(&bytes).starts_with("HTTP/1.0 403"));
}

#[test]
fn post_with_valid_csrf_token_reaches_the_route() {
    let root = scratch_webroot("csrf-ok");
    let server = server_with_webroot(&root, 1024);
    server.register_route("/submit", Arc::new(|_env: &mut RequestEnv| Ok(HttpResponse::ok(b"ok".to_vec(), "text/plain"))));

    let token = server.issue_csrf_token();
    let body = format!("field=value&upk_csrf={}", token);
    let headers = [("Content-Type", "application/x-www-form-urlencoded")];
    let mut env = RequestEnv::from_relay_frame(&frame_for("POST /submit HTTP/1.1", &headers, body.as_bytes()));
    server.handle(&mut env).unwrap();

    let bytes = env.take_response_bytes().unwrap();
    assert!(String::from_utf8_lossy(&bytes).starts_with("HTTP/1.0 200"));
}

#[test]
fn json_post_bypasses_csrf_check() {
    let root = scratch_webroot("csrf-json");
    let server = server_with_webroot(&root, 1024);
    server.register_route("/submit", Arc::new(|_env: &mut RequestEnv| Ok(HttpResponse::ok(b"ok".to_vec(), "text/plain"))));

    let headers = [("Content-Type", "application/json")];
    let mut env = RequestEnv::from_relay_frame(&frame_for("POST /submit HTTP/1.1", &headers, br#"{"a":1}"#));
    server.handle(&mut env).unwrap();

    let bytes = env.take_response_bytes().unwrap();
    assert!(String::from_utf8_lossy(&bytes).starts_with("HTTP/1.0 200"));
}

#[test]
fn options_request_never_triggers_csrf_check() {
    let root = scratch_webroot("options");
    let server = server_with_webroot(&root, 1024);
    server.register_route("/submit", Arc::new(|_env: &mut RequestEnv| Ok(HttpResponse::ok(b"ok".to_vec(), "text/plain"))));

    let mut env = RequestEnv::from_relay_frame(&frame_for("OPTIONS /submit HTTP/1.1", &[], b""));
    server.handle(&mut env).unwrap();

    let bytes = env.take_response_bytes().unwrap();
    assert!(String::from_utf8_lossy(&bytes).starts_with("HTTP/1.0 200"));
}
