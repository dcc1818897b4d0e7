//! Accepts direct LAN connections and adapts them to look like tunneled frames, so the
//! same HTTP dispatch code serves both relayed and directly-connected visitors. Grounded
//! on `original_source/upagekite/__init__.py`'s `LocalHTTPKite.process_io` (the
//! 500ms-deadline/20ms-backoff accept loop and synthetic SID format).

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use mio::net::{TcpListener, TcpStream};
use pagekite_core::error::PkResult;
use pagekite_core::time::ticks_ms;

use super::buffer::Buffer;
use super::frame::Frame;
use crate::kite::KiteHandler;

const HEADER_DEADLINE: Duration = Duration::from_millis(500);
const READ_BUF_SIZE: usize = 65536;
const WRITE_BUF_SIZE: usize = 65536;

struct LocalClient {
    socket: TcpStream,
    peer: SocketAddr,
    read_buffer: Buffer,
    write_buffer: Buffer,
    accepted_at: Instant,
    headers_seen: bool,
    eof: bool,
}

pub struct LocalListener {
    listener: TcpListener,
    listener_token: mio::Token,
    clients: HashMap<mio::Token, LocalClient>,
    next_token: usize,
    listen_port: u16,
    epoch: Instant,
    handler: std::sync::Arc<dyn KiteHandler>,
}

impl LocalListener {
    pub fn bind(
        addr: SocketAddr,
        poll: &mio::Poll,
        listener_token: mio::Token,
        handler: std::sync::Arc<dyn KiteHandler>,
    ) -> PkResult<LocalListener> {
        let listener = TcpListener::bind(&addr)?;
        poll.register(&listener, listener_token, mio::Ready::readable(), mio::PollOpt::edge())?;

        Ok(LocalListener {
            listener,
            listener_token,
            clients: HashMap::new(),
            next_token: listener_token.0 + 1,
            listen_port: addr.port(),
            epoch: Instant::now(),
            handler,
        })
    }

    pub fn owns_token(&self, token: mio::Token) -> bool {
        token == self.listener_token || self.clients.contains_key(&token)
    }

    pub fn listener_token(&self) -> mio::Token {
        self.listener_token
    }

    /// Accepts every pending connection (until `WouldBlock`) and begins staging header
    /// bytes for each. Actual registration on the shared poll is the caller's
    /// responsibility via `register_pending` since `mio::Poll` isn't `Sync`-shareable
    /// across this call boundary in mio 0.6's API.
    pub fn accept_ready(&mut self, poll: &mio::Poll) {
        loop {
            match self.listener.accept() {
                Ok((socket, peer)) => {
                    let token = mio::Token(self.next_token);
                    self.next_token += 1;

                    if poll
                        .register(&socket, token, mio::Ready::readable() | mio::Ready::writable(), mio::PollOpt::edge())
                        .is_err()
                    {
                        continue;
                    }

                    self.clients.insert(
                        token,
                        LocalClient {
                            socket,
                            peer,
                            read_buffer: Buffer::new(READ_BUF_SIZE),
                            write_buffer: Buffer::new(WRITE_BUF_SIZE),
                            accepted_at: Instant::now(),
                            headers_seen: false,
                            eof: false,
                        },
                    );
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }

    /// Handles a readable/writable event for one previously accepted client, returning
    /// `true` if the client should be dropped (timed out, EOF, or finished).
    pub fn handle_event(&mut self, token: mio::Token, now: Instant) -> bool {
        let client = match self.clients.get_mut(&token) {
            Some(c) => c,
            None => return true,
        };

        if !client.headers_seen {
            match client.read_buffer.ingress(&client.socket) {
                Ok(_) | Err(_) => {}
            }

            let data = client.read_buffer.read_slice();
            if data.windows(4).any(|w| w == b"\r\n\r\n") {
                client.headers_seen = true;
                let sid = format!("{:x}-{:x}", token.0, ticks_ms(self.epoch));
                let payload = data.to_vec();

                let mut headers = IndexMap::new();
                headers.insert("SID".to_owned(), sid);
                headers.insert("Host".to_owned(), "0.0.0.0".to_owned());
                headers.insert("Proto".to_owned(), "http".to_owned());
                headers.insert("Port".to_owned(), self.listen_port.to_string());
                headers.insert("RIP".to_owned(), format!("::ffff:{}", client.peer.ip()));

                let frame = Frame { headers, payload };

                let mut env = crate::http::request::RequestEnv::from_local_frame(&frame);
                drop(self.handler.handle(&mut env));

                if let Some(response) = env.take_response_bytes() {
                    client.write_buffer.write_slice()[..response.len().min(client.write_buffer.free_capacity())]
                        .copy_from_slice(&response[..response.len().min(client.write_buffer.free_capacity())]);
                    client.write_buffer.move_tail(response.len().min(client.write_buffer.free_capacity()));
                }

                client.eof = true;
            } else if now.duration_since(client.accepted_at) > HEADER_DEADLINE {
                let _ = client.socket.write_all(b"HTTP/1.0 408 Timed out\r\n\r\n");
                return true;
            }
        }

        if !client.write_buffer.is_empty() {
            if client.write_buffer.egress(&client.socket).is_err() {
                return true;
            }
        }

        client.eof && client.write_buffer.is_empty()
    }

    pub fn drop_client(&mut self, token: mio::Token) {
        self.clients.remove(&token);
    }
}
