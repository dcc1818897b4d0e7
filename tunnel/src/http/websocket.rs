//! RFC6455 WebSocket upgrade and frame codec, plus a channel registry for broadcasting to
//! subscribers. Grounded on `original_source/upagekite/websocket.py`'s `FrameWebsocket`
//! (mask/unmask, continuation reassembly) and its `broadcast`/subscriber pruning, with the
//! encode/decode shape following `lib/neutronium/src/net/channel.rs`'s framing style.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use pagekite_core::encoding::base64;
use pagekite_core::error::{PkError, PkErrorKind, PkResult};
use sha1::{Digest, Sha1};

use super::request::RequestEnv;
use crate::net::relay::Sid;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_u8(b: u8) -> PkResult<Opcode> {
        Ok(match b {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            _ => return Err(PkError::Fatal(PkErrorKind::Parse(format!("unknown websocket opcode {:#x}", b)))),
        })
    }

    fn to_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }
}

#[derive(Debug)]
pub struct WsFrame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Computes `Sec-WebSocket-Accept` for a request's `Sec-WebSocket-Key`, and checks that the
/// request looks like a valid upgrade: `Upgrade: websocket`, `Sec-WebSocket-Version: 13`,
/// and (when sent) an `Origin` that matches `Host`. Returns `None` if this isn't a valid
/// websocket upgrade at all (the caller should fall through to normal HTTP handling).
pub fn negotiate(env: &RequestEnv) -> Option<String> {
    let upgrade = env.headers.get("Upgrade")?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return None;
    }
    if env.headers.get("Sec-WebSocket-Version").map(|v| v.trim()) != Some("13") {
        return None;
    }
    if let (Some(origin), Some(host)) = (env.headers.get("Origin"), env.headers.get("Host")) {
        if !origin_matches_host(origin, host) {
            return None;
        }
    }
    let key = env.headers.get("Sec-WebSocket-Key")?;

    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let digest = hasher.finalize();

    Some(base64::encode(digest))
}

/// An `Origin: scheme://host[:port]` header matches `Host` when the host (and explicit
/// port, if any) are the same, ignoring the scheme.
fn origin_matches_host(origin: &str, host: &str) -> bool {
    let origin_host = origin.split("://").nth(1).unwrap_or(origin);
    origin_host.eq_ignore_ascii_case(host.trim())
}

/// Caps how many websocket connections may be live at once (`websocket_max_conns`) and
/// hands out the shared channel registry used for broadcast. Grounded on
/// `original_source/upagekite/websocket.py`'s module-level connection bookkeeping.
pub struct WebSocketState {
    registry: ChannelRegistry,
    live_conns: AtomicUsize,
    max_conns: usize,
}

impl WebSocketState {
    pub fn new(max_conns: usize) -> WebSocketState {
        WebSocketState { registry: ChannelRegistry::new(), live_conns: AtomicUsize::new(0), max_conns }
    }

    /// Atomically claims one connection slot, returning `false` if `max_conns` is already
    /// in use.
    pub fn try_acquire(&self) -> bool {
        self.live_conns
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| if n < self.max_conns { Some(n + 1) } else { None })
            .is_ok()
    }

    pub fn release(&self) {
        self.live_conns.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }
}

/// A `Subscriber` that forwards broadcast messages into a connection's outbound mailbox
/// instead of holding a reference to the connection itself, since a `TunnelConnection` is
/// only ever borrowed mutably for the duration of one dispatch call.
pub struct MailboxSubscriber {
    sid: Sid,
    mailbox: Arc<Mutex<VecDeque<(Sid, Vec<u8>)>>>,
}

impl MailboxSubscriber {
    pub fn new(sid: Sid, mailbox: Arc<Mutex<VecDeque<(Sid, Vec<u8>)>>>) -> MailboxSubscriber {
        MailboxSubscriber { sid, mailbox }
    }
}

impl Subscriber for MailboxSubscriber {
    fn send(&self, opcode: Opcode, payload: &[u8]) -> PkResult<()> {
        let frame = encode_frame(opcode, payload);
        self.mailbox.lock().unwrap().push_back((self.sid.clone(), frame));
        Ok(())
    }
}

pub fn upgrade_response(accept_key: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key
    )
    .into_bytes()
}

/// Parses one frame off the front of `buf`, returning `(frame, bytes_consumed)` or `None`
/// if the buffer doesn't yet hold a complete frame.
pub fn decode_frame(buf: &[u8]) -> PkResult<Option<(WsFrame, usize)>> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let fin = buf[0] & 0x80 != 0;
    let opcode = Opcode::from_u8(buf[0] & 0x0F)?;
    let masked = buf[1] & 0x80 != 0;
    let len_field = buf[1] & 0x7F;

    let (payload_len, mut offset): (u64, usize) = match len_field {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(len_bytes), 10)
        }
        n => (n as u64, 2),
    };

    let mask_key = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let payload_len = payload_len as usize;
    if buf.len() < offset + payload_len {
        return Ok(None);
    }

    let mut payload = buf[offset..offset + payload_len].to_vec();
    if let Some(key) = mask_key {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }

    Ok(Some((WsFrame { fin, opcode, payload }, offset + payload_len)))
}

/// Encodes a server-to-client frame. Server frames are never masked, per RFC6455 §5.1.
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    out.push(0x80 | opcode.to_u8());

    if payload.len() < 126 {
        out.push(payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        out.push(126);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }

    out.extend_from_slice(payload);
    out
}

/// Reassembles `Continuation` frames into a single logical message, per RFC6455 §5.4.
#[derive(Default)]
pub struct FrameReassembler {
    pending: Option<(Opcode, Vec<u8>)>,
}

impl FrameReassembler {
    pub fn push(&mut self, frame: WsFrame) -> Option<(Opcode, Vec<u8>)> {
        match frame.opcode {
            Opcode::Continuation => {
                let (opcode, mut buf) = self.pending.take()?;
                buf.extend_from_slice(&frame.payload);
                if frame.fin {
                    Some((opcode, buf))
                } else {
                    self.pending = Some((opcode, buf));
                    None
                }
            }
            opcode if frame.fin => Some((opcode, frame.payload)),
            opcode => {
                self.pending = Some((opcode, frame.payload));
                None
            }
        }
    }
}

pub trait Subscriber: Send + Sync {
    fn send(&self, opcode: Opcode, payload: &[u8]) -> PkResult<()>;
}

/// Named channels that subscribers (SIDs) join; a publish fans out to every live
/// subscriber, dropping any whose `Weak` has gone stale. Grounded on
/// `original_source/upagekite/websocket.py`'s channel broadcast helper.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<String, Vec<Weak<dyn Subscriber>>>>,
}

impl ChannelRegistry {
    pub fn new() -> ChannelRegistry {
        ChannelRegistry { channels: Mutex::new(HashMap::new()) }
    }

    pub fn subscribe(&self, channel: &str, subscriber: Arc<dyn Subscriber>) {
        self.channels.lock().unwrap().entry(channel.to_owned()).or_default().push(Arc::downgrade(&subscriber));
    }

    pub fn broadcast(&self, channel: &str, opcode: Opcode, payload: &[u8]) {
        let mut channels = self.channels.lock().unwrap();
        if let Some(subs) = channels.get_mut(channel) {
            subs.retain(|weak| match weak.upgrade() {
                Some(sub) => {
                    let _ = sub.send(opcode, payload);
                    true
                }
                None => false,
            });
        }
    }
}
