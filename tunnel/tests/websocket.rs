//! Integration tests for the websocket upgrade negotiation, frame codec, and broadcast
//! fan-out, exercising `websocket::negotiate`, `ChannelRegistry`, and `MailboxSubscriber`
//! together the way `http::mod::run_handler`/`register_websocket_handler` wire them up.

use std::sync::Arc;

use indexmap::IndexMap;
use pagekite_tunnel::http::request::RequestEnv;
use pagekite_tunnel::http::websocket::{
    decode_frame, encode_frame, ChannelRegistry, FrameReassembler, MailboxSubscriber, Opcode, WebSocketState,
};
use pagekite_tunnel::net::frame::Frame;

fn upgrade_frame(extra_headers: &[(&str, &str)]) -> Frame {
    let mut h = IndexMap::new();
    h.insert("SID".to_owned(), "sid-ws".to_owned());
    h.insert("Host".to_owned(), "chat.example.com".to_owned());

    let mut payload = b"GET /chat HTTP/1.1\r\n".to_vec();
    payload.extend_from_slice(b"Upgrade: websocket\r\n");
    payload.extend_from_slice(b"Sec-WebSocket-Version: 13\r\n");
    payload.extend_from_slice(b"Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n");
    payload.extend_from_slice(b"Host: chat.example.com\r\n");
    for (name, value) in extra_headers {
        payload.extend_from_slice(format!("{}: {}\r\n", name, value).into_bytes().as_slice());
    }
    payload.extend_from_slice(b"\r\n");

    Frame { headers: h, payload }
}

#[test]
fn negotiate_computes_the_rfc6455_accept_key() {
    let env = RequestEnv::from_relay_frame(&upgrade_frame(&[]));
    let accept = pagekite_tunnel::http::websocket::negotiate(&env).unwrap();
    assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
}

#[test]
fn negotiate_rejects_version_other_than_13() {
    let mut h = IndexMap::new();
    h.insert("SID".to_owned(), "sid-ws".to_owned());
    h.insert("Host".to_owned(), "chat.example.com".to_owned());
    let payload = b"GET /chat HTTP/1.1\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 8\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n".to_vec();
    let frame = Frame { headers: h, payload };

    let env = RequestEnv::from_relay_frame(&frame);
    assert!(pagekite_tunnel::http::websocket::negotiate(&env).is_none());
}

#[test]
fn negotiate_rejects_origin_that_does_not_match_host() {
    let env = RequestEnv::from_relay_frame(&upgrade_frame(&[("Origin", "https://evil.example.net")]));
    assert!(pagekite_tunnel::http::websocket::negotiate(&env).is_none());
}

#[test]
fn negotiate_accepts_matching_origin() {
    let env = RequestEnv::from_relay_frame(&upgrade_frame(&[("Origin", "https://chat.example.com")]));
    assert!(pagekite_tunnel::http::websocket::negotiate(&env).is_some());
}

#[test]
fn websocket_state_enforces_max_conns() {
    let state = WebSocketState::new(2);
    assert!(state.try_acquire());
    assert!(state.try_acquire());
    assert!(!state.try_acquire());
    state.release();
    assert!(state.try_acquire());
}

struct RecordingSubscriber {
    received: std::sync::Mutex<Vec<(Opcode, Vec<u8>)>>,
}

impl pagekite_tunnel::http::websocket::Subscriber for RecordingSubscriber {
    fn send(&self, opcode: Opcode, payload: &[u8]) -> pagekite_core::error::PkResult<()> {
        self.received.lock().unwrap().push((opcode, payload.to_vec()));
        Ok(())
    }
}

#[test]
fn broadcast_fans_out_to_every_live_subscriber() {
    let registry = ChannelRegistry::new();
    let sub = Arc::new(RecordingSubscriber { received: Default::default() });
    registry.subscribe("room-1", sub.clone());

    registry.broadcast("room-1", Opcode::Text, b"hello room");

    let received = sub.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].1, b"hello room");
}

#[test]
fn broadcast_drops_subscribers_whose_connection_is_gone() {
    let registry = ChannelRegistry::new();
    {
        let sub = Arc::new(RecordingSubscriber { received: Default::default() });
        registry.subscribe("room-2", sub);
    }
    // sub's only Arc has gone out of scope; the registry's Weak should no longer upgrade.
    registry.broadcast("room-2", Opcode::Text, b"nobody home");
}

#[test]
fn mailbox_subscriber_queues_an_encoded_frame() {
    let mailbox = Arc::new(std::sync::Mutex::new(std::collections::VecDeque::new()));
    let sub: Arc<dyn pagekite_tunnel::http::websocket::Subscriber> =
        Arc::new(MailboxSubscriber::new("sid-ws".to_owned(), mailbox.clone()));

    let registry = ChannelRegistry::new();
    registry.subscribe("room-3", sub);
    registry.broadcast("room-3", Opcode::Text, b"broadcast me");

    let queued = mailbox.lock().unwrap().pop_front().unwrap();
    assert_eq!(queued.0, "sid-ws");

    let (frame, consumed) = decode_frame(&queued.1).unwrap().unwrap();
    assert_eq!(consumed, queued.1.len());
    assert_eq!(frame.opcode, Opcode::Text);
    assert_eq!(frame.payload, b"broadcast me");
}

#[test]
fn reassembles_a_fragmented_message_split_across_three_frames() {
    let mut reassembler = FrameReassembler::default();

    let first = encode_frame(Opcode::Text, b"pa");
    let (f1, _) = decode_frame(&first).unwrap().unwrap();
    assert!(reassembler.push(f1).is_none());

    let mut middle = vec![0x00, 0x02];
    middle.extend_from_slice(b"ge");
    let (f2, _) = decode_frame(&middle).unwrap().unwrap();
    assert!(reassembler.push(f2).is_none());

    let mut last = vec![0x80, 0x01];
    last.extend_from_slice(b"!");
    let (f3, _) = decode_frame(&last).unwrap().unwrap();
    let (opcode, payload) = reassembler.push(f3).unwrap();

    assert_eq!(opcode, Opcode::Text);
    assert_eq!(payload, b"page!");
}
