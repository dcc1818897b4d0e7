//! The HTTP layer: request parsing, route dispatch/static serving, POST body reassembly,
//! and websocket upgrade, plus the glue that turns a relay's "new stream" frame into a
//! dispatched request. Grounded on `original_source/upagekite/httpd.py` end to end.

pub mod body;
pub mod request;
pub mod response;
pub mod websocket;

use pagekite_core::error::PkResult;
use pagekite_core::logging;

use crate::kite::Kite;
use crate::net::frame::Frame;
use crate::net::relay::TunnelConnection;

use self::body::BodyAccumulator;
use self::request::RequestEnv;
use self::websocket::{MailboxSubscriber, Opcode, WebSocketState};

const EOF_BOTH: &str = "1WR";

/// Entry point the connection pool calls for every relay frame whose `SID` has no
/// registered stream handler yet (i.e. the first frame of a new request). Matches the
/// frame's `Host`/`Proto` against `kites`, waits for the full POST body if one is still in
/// flight, then runs the matching kite's handler and writes its response back onto the
/// tunnel. Grounded on `original_source/upagekite/__init__.py`'s
/// `uPageKiteConn.ProcessChunk`'s "first chunk of a SID" branch.
pub fn dispatch_new_stream(
    frame: &Frame,
    conn: &mut TunnelConnection,
    kites: &[Kite],
    max_post_bytes: usize,
    ws_state: &std::sync::Arc<WebSocketState>,
) -> PkResult<()> {
    let sid = frame.sid().unwrap_or_default().to_owned();
    let host = frame.host().unwrap_or_default().to_owned();
    let proto = frame.proto().unwrap_or("http").to_owned();

    let kite = match kites.iter().find(|k| k.name == host && k.matches_proto(&proto)).cloned() {
        Some(kite) => kite,
        None => {
            conn.send_data(&sid, b"HTTP/1.0 404 Not Found\r\nContent-Length: 0\r\n\r\n")?;
            conn.send_eof(&sid, EOF_BOTH)?;
            return Ok(());
        }
    };

    let env = RequestEnv::from_relay_frame(frame);
    let content_length = env
        .headers
        .get("Content-Length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    if env.method == "POST" && content_length > max_post_bytes {
        conn.send_data(&sid, b"HTTP/1.0 400 Bad Request\r\nContent-Length: 0\r\n\r\n")?;
        conn.send_eof(&sid, EOF_BOTH)?;
        return Ok(());
    }

    if env.method == "POST" && content_length > env.body.len() {
        let mut accumulator = BodyAccumulator::new(content_length);
        accumulator.feed(&env.body);

        let mut pending_env = env;
        let mut dispatched = false;

        conn.register_handler(
            sid.clone(),
            Box::new(move |chunk_frame: &Frame| {
                if chunk_frame.eof().is_none() {
                    accumulator.feed(&chunk_frame.payload);
                }

                if dispatched || !accumulator.is_complete() {
                    return Ok(None);
                }
                dispatched = true;

                pending_env.body = accumulator.take_body();
                kite.handler.handle(&mut pending_env)?;

                let mut out = Vec::new();
                if let Some(bytes) = pending_env.take_response_bytes() {
                    out.extend(bytes);
                }
                for chunk in pending_env.take_stream_chunks() {
                    out.extend(chunk);
                }

                Ok(if out.is_empty() { None } else { Some(out) })
            }),
        );

        return Ok(());
    }

    run_handler(&kite, frame, conn, &sid, ws_state)
}

fn run_handler(kite: &Kite, frame: &Frame, conn: &mut TunnelConnection, sid: &str, ws_state: &std::sync::Arc<WebSocketState>) -> PkResult<()> {
    let mut env = RequestEnv::from_relay_frame(frame);

    let mut upgrading = false;
    if let Some(accept_key) = websocket::negotiate(&env) {
        if ws_state.try_acquire() {
            conn.send_data(sid, &websocket::upgrade_response(&accept_key))?;
            env.postpone();
            upgrading = true;
        } else {
            conn.send_data(sid, b"HTTP/1.0 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n")?;
            conn.send_eof(sid, EOF_BOTH)?;
            return Ok(());
        }
    }

    kite.handler.handle(&mut env)?;

    let background_body = env.take_background_body();

    if let Some(bytes) = env.take_response_bytes() {
        conn.send_data(sid, &bytes)?;
    }
    for chunk in env.take_stream_chunks() {
        conn.send_data(sid, &chunk)?;
    }

    if upgrading {
        register_websocket_handler(conn, sid, env.path.clone(), ws_state.clone());
    } else if let Some(body) = background_body {
        conn.start_background_send(sid, body);
    } else if env.response_eof() && !env.is_postponed() {
        conn.send_eof(sid, EOF_BOTH)?;
        conn.unregister_handler(sid);
    }

    Ok(())
}

/// Registers the per-SID continuation that drives one live websocket connection: decodes
/// incoming frames, reassembles continuations, answers `PING` with `PONG` and `CLOSE` with
/// `CLOSE`, and forwards completed text/binary messages to `ChannelRegistry::broadcast` so
/// every subscriber of the request's path (including this connection, via its own
/// `MailboxSubscriber`) receives them. Grounded on
/// `original_source/upagekite/websocket.py`'s `FrameWebsocket.ProcessData`.
fn register_websocket_handler(conn: &mut TunnelConnection, sid: &str, channel: String, ws_state: std::sync::Arc<WebSocketState>) {
    ws_state.registry().subscribe(&channel, std::sync::Arc::new(MailboxSubscriber::new(sid.to_owned(), conn.ws_mailbox())));

    let mut inbuf: Vec<u8> = Vec::new();
    let mut reassembler = websocket::FrameReassembler::default();
    let released = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));

    conn.register_handler(
        sid.to_owned(),
        Box::new(move |frame: &Frame| {
            let release_once = |released: &std::sync::atomic::AtomicBool, ws_state: &WebSocketState| {
                if !released.swap(true, std::sync::atomic::Ordering::SeqCst) {
                    ws_state.release();
                }
            };

            if frame.eof().is_some() {
                release_once(&released, &ws_state);
                return Ok(None);
            }

            inbuf.extend_from_slice(&frame.payload);
            let mut out = Vec::new();

            loop {
                match websocket::decode_frame(&inbuf) {
                    Ok(Some((wsf, consumed))) => {
                        let opcode = wsf.opcode;
                        inbuf.drain(..consumed);

                        match opcode {
                            Opcode::Ping => out.extend(websocket::encode_frame(Opcode::Pong, &[])),
                            Opcode::Close => {
                                out.extend(websocket::encode_frame(Opcode::Close, &[]));
                                release_once(&released, &ws_state);
                                return Ok(if out.is_empty() { None } else { Some(out) });
                            }
                            Opcode::Pong => {}
                            _ => {
                                if let Some((msg_opcode, payload)) = reassembler.push(wsf) {
                                    ws_state.registry().broadcast(&channel, msg_opcode, &payload);
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        inbuf.clear();
                        break;
                    }
                }
            }

            Ok(if out.is_empty() { None } else { Some(out) })
        }),
    );
}

pub fn log_request(log: &logging::Logger, method: &str, path: &str, code: u16) {
    logging::debug!(log, "request served"; "method" => method, "path" => path, "code" => code);
}
