//! A single TLS connection to a relay: handshake (challenge/response signing) plus the
//! per-SID handler dispatch described in spec §4.4. Grounded on
//! `original_source/upagekite/proto.py` (`connect()`, `x_pagekite()`, `parse_challenge()`)
//! for exact protocol semantics, and `lib/neutronium/src/net/channel.rs` for the Rust
//! shape of an owned, buffered, timestamped socket wrapper.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream as StdTcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use pagekite_core::crypto;
use pagekite_core::error::{ErrorUtils, PkError, PkErrorKind, PkResult};
use pagekite_core::logging::{self, Logger};

use super::buffer::Buffer;
use super::frame::{self, Frame};
use crate::kite::Kite;

const READ_BUF_SIZE: usize = 65536;
const WRITE_BUF_SIZE: usize = 65536;
const HEADER_READ_LIMIT: usize = 16384;

pub type Sid = String;
/// A continuation handler for frames after the first one on a SID. Returns bytes it wants
/// written back to the tunnel for this SID (if any); `TunnelConnection` sends them once the
/// handler call returns, since `self` is free again by then (see `dispatch_frame`).
pub type StreamHandler = Box<dyn FnMut(&Frame) -> PkResult<Option<Vec<u8>>> + Send>;

/// A chunked, self-paced send of one large buffer (a static file body) for one SID, per
/// `background_send` (`httpd.py:211-287`): split into `send_window_bytes` pieces, drained
/// one per `pump_pending_sends` call no faster than `ms_delay_per_byte` per byte allows.
struct PendingSend {
    sid: Sid,
    chunks: VecDeque<Vec<u8>>,
    next_send_at: Instant,
}

/// Floor on the pacing delay between chunks, mirroring `background_send`'s
/// `fuzzy_sleep_ms(5)` between each windowed write — without it, a tiny `ms_delay_per_byte`
/// would let a pending send starve everything else on the connection.
const MIN_SEND_PACING: Duration = Duration::from_millis(5);

/// One TLS connection to a relay, carrying many multiplexed SIDs.
pub struct TunnelConnection {
    pub peer_addr: SocketAddr,

    tls: rustls::ClientConnection,
    socket: TcpStream,

    read_buffer: Buffer,
    write_buffer: Buffer,
    plain_read_buffer: Buffer,

    handlers: HashMap<Sid, StreamHandler>,
    pending_sends: Vec<PendingSend>,
    /// Outbound websocket frames queued by a `websocket::MailboxSubscriber` reacting to a
    /// `ChannelRegistry::broadcast` from a different SID's handler; drained by
    /// `drain_ws_mailbox` each pool tick since a `Subscriber` can't hold `&mut self` here.
    ws_mailbox: Arc<Mutex<VecDeque<(Sid, Vec<u8>)>>>,

    send_window_bytes: usize,
    ms_delay_per_byte: f64,

    pub last_data_ts: Instant,
    pub last_handle_ts: Instant,

    log: Logger,
}

fn tls_config() -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    Arc::new(
        rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

impl TunnelConnection {
    /// Opens a TCP+TLS connection to `addr` (SNI `server_name`) with the given connect
    /// timeout, and registers it on `poll` for readable/writable events under `token`.
    pub fn connect(
        addr: SocketAddr,
        server_name: &str,
        connect_timeout: Duration,
        poll: &mio::Poll,
        token: mio::Token,
        send_window_bytes: usize,
        ms_delay_per_byte: f64,
        log: &Logger,
    ) -> PkResult<TunnelConnection> {
        let std_stream = StdTcpStream::connect_timeout(&addr, connect_timeout)?;
        std_stream.set_nodelay(true).ok();
        let socket = TcpStream::from_stream(std_stream)?;

        poll.register(
            &socket,
            token,
            mio::Ready::readable() | mio::Ready::writable(),
            mio::PollOpt::edge(),
        )?;

        let name = rustls::ServerName::try_from(server_name)
            .map_err(|_| PkError::Fatal(PkErrorKind::Tls("invalid server name".into())))?;

        let tls = rustls::ClientConnection::new(tls_config(), name)
            .map_err(|e| PkError::Fatal(PkErrorKind::Tls(e.to_string())))?;

        let now = Instant::now();
        let conn_log = log.new(logging::o!("peer" => addr.to_string()));

        logging::debug!(conn_log, "relay connection opened"; "peer" => %addr);

        Ok(TunnelConnection {
            peer_addr: addr,
            tls,
            socket,
            read_buffer: Buffer::new(READ_BUF_SIZE),
            write_buffer: Buffer::new(WRITE_BUF_SIZE),
            plain_read_buffer: Buffer::new(READ_BUF_SIZE),
            handlers: HashMap::new(),
            pending_sends: Vec::new(),
            ws_mailbox: Arc::new(Mutex::new(VecDeque::new())),
            send_window_bytes: send_window_bytes.max(1),
            ms_delay_per_byte,
            last_data_ts: now,
            last_handle_ts: now,
            log: conn_log,
        })
    }

    /// Performs the CONNECT + X-PageKite handshake (and, if needed, the NOOP re-sign
    /// round trip) for every kite in `kites`. Blocking: used only at connection setup,
    /// before the connection is handed to the pool's non-blocking event loop.
    pub fn handshake(&mut self, global_secret: &str, kites: &mut [Kite], version: &str) -> PkResult<()> {
        let mut request = format!(
            "CONNECT PageKite:1 HTTP/1.0\r\nX-PageKite-Features: AddKites\r\nX-PageKite-Version: {}\r\n",
            version
        );
        let relay_addr = self.peer_addr.to_string();

        for kite in kites.iter() {
            let token = crypto::client_token(global_secret, &relay_addr, &kite.secret);
            request.push_str(&format!(
                "X-PageKite: {}:{}:{}::\r\n",
                kite.proto, kite.name, token
            ));
        }
        request.push_str("\r\n");

        self.write_plain_blocking(request.as_bytes())?;

        let response = self.read_header_block_blocking()?;
        let needs_resign = self.parse_handshake_response(&response, global_secret, kites)?;

        if needs_resign {
            let mut resign = String::from("NOOP: 1\r\n");
            for kite in kites.iter().filter(|k| !k.challenge.is_empty()) {
                let token = crypto::client_token(global_secret, &relay_addr, &kite.secret);
                let sig = crypto::sign_challenge(&kite.secret, &kite.challenge);
                resign.push_str(&format!(
                    "X-PageKite: {}:{}:{}:{}:{}\r\n",
                    kite.proto, kite.name, token, kite.challenge, sig
                ));
            }
            resign.push_str("\r\n");

            let chunk = frame::chunk_wrap(resign.as_bytes());
            self.write_plain_blocking(&chunk)?;

            let response = self.read_header_block_blocking()?;
            self.parse_handshake_response(&response, global_secret, kites)?;
        }

        Ok(())
    }

    /// Parses an `X-PageKite-*` response block, filling in kite challenges and returning
    /// whether a signed re-send is required.
    fn parse_handshake_response(&self, response: &str, _global_secret: &str, kites: &mut [Kite]) -> PkResult<bool> {
        let mut needs_resign = false;
        let mut any_ok = false;

        for line in response.split("\r\n") {
            if let Some(rest) = line.strip_prefix("X-PageKite-SignThis:") {
                let parts: Vec<&str> = rest.trim().splitn(4, ':').collect();
                if parts.len() == 4 {
                    let (proto, name, _salt, challenge) = (parts[0], parts[1], parts[2], parts[3]);
                    if let Some(kite) = kites.iter_mut().find(|k| k.proto == proto && k.name == name) {
                        kite.challenge = challenge.to_owned();
                        needs_resign = true;
                    }
                }
            } else if line.starts_with("X-PageKite-OK:") {
                any_ok = true;
            } else if line.starts_with("X-PageKite-Reject") || line.starts_with("X-PageKite-Duplicate") {
                return Err(PkError::Fatal(PkErrorKind::Rejected(line.to_owned())));
            }
        }

        if !needs_resign && !any_ok {
            return Err(PkError::Fatal(PkErrorKind::Rejected("no kite accepted".into())));
        }

        Ok(needs_resign)
    }

    fn write_plain_blocking(&mut self, data: &[u8]) -> PkResult<()> {
        self.tls.writer().write_all(data).ok();
        self.flush_tls_blocking()
    }

    fn flush_tls_blocking(&mut self) -> PkResult<()> {
        while self.tls.wants_write() {
            self.tls
                .write_tls(&mut self.socket)
                .map_err(|e| PkError::from(e))?;
        }
        Ok(())
    }

    fn read_header_block_blocking(&mut self) -> PkResult<String> {
        let mut collected = Vec::new();

        loop {
            self.tls
                .read_tls(&mut self.socket)
                .map_err(PkError::from)?;
            self.tls
                .process_new_packets()
                .map_err(|e| PkError::Fatal(PkErrorKind::Tls(e.to_string())))?;

            let mut chunk = [0u8; 4096];
            loop {
                match self.tls.reader().read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => collected.extend_from_slice(&chunk[..n]),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(PkError::from(e)),
                }
            }

            if collected.windows(4).any(|w| w == b"\r\n\r\n") || collected.len() > HEADER_READ_LIMIT {
                break;
            }
        }

        Ok(String::from_utf8_lossy(&collected).into_owned())
    }

    /// Registers a continuation handler for `sid`. Subsequent frames for that SID are
    /// dispatched to `handler` instead of being matched against the kite table.
    pub fn register_handler(&mut self, sid: Sid, handler: StreamHandler) {
        self.handlers.insert(sid, handler);
    }

    pub fn unregister_handler(&mut self, sid: &str) {
        self.handlers.remove(sid);
    }

    pub fn has_egress(&self) -> bool {
        !self.write_buffer.is_empty() || self.tls.wants_write()
    }

    /// Queue one outbound data chunk for `sid`.
    pub fn send_data(&mut self, sid: &str, data: &[u8]) -> PkResult<()> {
        self.queue_plaintext(&frame::fmt_data(sid, data))
    }

    pub fn send_eof(&mut self, sid: &str, direction: &str) -> PkResult<()> {
        self.queue_plaintext(&frame::fmt_eof(sid, direction))
    }

    pub fn send_ping(&mut self) -> PkResult<()> {
        self.queue_plaintext(&frame::fmt_ping())
    }

    pub fn send_pong(&mut self, token: &str) -> PkResult<()> {
        self.queue_plaintext(&frame::fmt_pong(token))
    }

    fn queue_plaintext(&mut self, chunk: &[u8]) -> PkResult<()> {
        self.tls.writer().write_all(chunk).ok();
        Ok(())
    }

    /// Starts a paced, windowed send of `body` for `sid`: sliced into `send_window_bytes`
    /// pieces, one drained per `pump_pending_sends` call once its pacing delay elapses.
    /// Sends a final `EOF` once every piece has gone out. Used for static files larger than
    /// `file_read_bytes`, per `background_send`.
    pub fn start_background_send(&mut self, sid: &str, body: Vec<u8>) {
        let chunks: VecDeque<Vec<u8>> = body.chunks(self.send_window_bytes).map(|c| c.to_vec()).collect();
        self.pending_sends.push(PendingSend { sid: sid.to_owned(), chunks, next_send_at: Instant::now() });
    }

    /// Drains every pending background send whose pacing delay has elapsed, writing at
    /// most one window of bytes per SID per call (so many concurrent background sends
    /// interleave fairly instead of one hogging the connection). Called once per pool tick.
    pub fn pump_pending_sends(&mut self, now: Instant) -> PkResult<()> {
        let mut finished = Vec::new();

        for i in 0..self.pending_sends.len() {
            if now < self.pending_sends[i].next_send_at {
                continue;
            }

            let sid = self.pending_sends[i].sid.clone();
            match self.pending_sends[i].chunks.pop_front() {
                Some(data) => {
                    let pacing = Duration::from_millis((data.len() as f64 * self.ms_delay_per_byte) as u64).max(MIN_SEND_PACING);
                    self.pending_sends[i].next_send_at = now + pacing;
                    self.send_data(&sid, &data)?;
                }
                None => finished.push(i),
            }
        }

        for i in finished.into_iter().rev() {
            let sid = self.pending_sends.remove(i).sid;
            self.send_eof(&sid, "1WR")?;
        }

        Ok(())
    }

    /// A clonable handle a `websocket::MailboxSubscriber` can hold to queue frames destined
    /// for one of this connection's SIDs without borrowing the connection itself.
    pub fn ws_mailbox(&self) -> Arc<Mutex<VecDeque<(Sid, Vec<u8>)>>> {
        self.ws_mailbox.clone()
    }

    /// Flushes every frame a broadcast queued into `ws_mailbox` out onto the tunnel. Called
    /// once per pool tick, alongside `pump_pending_sends`.
    pub fn drain_ws_mailbox(&mut self) -> PkResult<()> {
        let items: Vec<(Sid, Vec<u8>)> = self.ws_mailbox.lock().unwrap().drain(..).collect();
        for (sid, frame) in items {
            self.send_data(&sid, &frame)?;
        }
        Ok(())
    }

    /// Non-blocking read+dispatch step, called by the pool when this connection's socket
    /// is readable. Dispatches each parsed frame to its registered SID handler or to
    /// `dispatch_new` for unregistered SIDs.
    pub fn process_io<F>(&mut self, now: Instant, mut dispatch_new: F) -> PkResult<()>
    where
        F: FnMut(&Frame, &mut TunnelConnection) -> PkResult<()>,
    {
        match self.tls.read_tls(&mut self.socket) {
            Ok(0) => return Err(PkError::Fatal(PkErrorKind::EofTunnel)),
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(PkError::from(e)),
        }

        self.tls
            .process_new_packets()
            .map_err(|e| PkError::Fatal(PkErrorKind::Tls(e.to_string())))?;

        let mut chunk = [0u8; 8192];
        loop {
            match self.tls.reader().read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    self.plain_read_buffer
                        .write_slice()
                        .get_mut(..n)
                        .map(|dst| dst.copy_from_slice(&chunk[..n]));
                    self.plain_read_buffer.move_tail(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(PkError::from(e)),
            }
        }

        loop {
            match frame::read_chunk(&mut self.plain_read_buffer)? {
                None => break,
                Some(f) => {
                    self.last_data_ts = now;
                    self.last_handle_ts = now;
                    self.dispatch_frame(&f, &mut dispatch_new)?;
                }
            }
        }

        if self.tls.wants_write() {
            self.tls.write_tls(&mut self.socket).map_err(PkError::from)?;
        }

        Ok(())
    }

    fn dispatch_frame<F>(&mut self, f: &Frame, dispatch_new: &mut F) -> PkResult<()>
    where
        F: FnMut(&Frame, &mut TunnelConnection) -> PkResult<()>,
    {
        if let Some(token) = f.ping() {
            let token = token.to_owned();
            return self.send_pong(&token);
        }

        if let Some(sid) = f.sid().map(str::to_owned) {
            if let Some(mut handler) = self.handlers.remove(&sid) {
                let result = handler(f);
                let keep_alive = result.is_ok() && f.eof().is_none();

                match result {
                    Ok(reply) => {
                        if keep_alive {
                            self.handlers.insert(sid.clone(), handler);
                        }
                        if let Some(bytes) = reply {
                            self.send_data(&sid, &bytes)?;
                        }
                        if !keep_alive {
                            self.send_eof(&sid, "1WR")?;
                        }
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }

            return dispatch_new(f, self);
        }

        Ok(())
    }

    pub fn close(&mut self) {
        logging::debug!(self.log, "closing relay connection"; "peer" => %self.peer_addr);
        self.handlers.clear();
        self.pending_sends.clear();
    }
}
