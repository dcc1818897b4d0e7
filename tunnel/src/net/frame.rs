//! The PageKite chunk wire codec: `hex(len)\r\nHEADERS\r\n\r\nPAYLOAD`, where `HEADERS` is
//! a block of `Name: value\r\n` lines. Grounded on `original_source/upagekite/proto.py`'s
//! `Frame`, `send_chunk`/`send_data`/`send_eof`/`send_pong`, and `read_chunk`.

use indexmap::IndexMap;
use pagekite_core::error::{PkError, PkErrorKind, PkResult};
use pagekite_core::time::timestamp_secs;

use super::buffer::Buffer;

/// Maximum bytes we'll scan looking for the length-prefix CRLF before giving up — a
/// malformed or malicious peer should not be able to stall the parser indefinitely.
const MAX_LEN_PREFIX: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub headers: IndexMap<String, String>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn sid(&self) -> Option<&str> {
        self.headers.get("SID").map(String::as_str)
    }

    pub fn host(&self) -> Option<&str> {
        self.headers.get("Host").map(String::as_str)
    }

    pub fn port(&self) -> Option<&str> {
        self.headers.get("Port").map(String::as_str)
    }

    pub fn proto(&self) -> Option<&str> {
        self.headers.get("Proto").map(String::as_str)
    }

    pub fn remote_ip(&self) -> Option<&str> {
        self.headers.get("RIP").map(String::as_str)
    }

    pub fn ping(&self) -> Option<&str> {
        self.headers.get("PING").map(String::as_str)
    }

    pub fn pong(&self) -> Option<&str> {
        self.headers.get("PONG").map(String::as_str)
    }

    /// `EOF` header value, e.g. `"1WR"` meaning both directions closed.
    pub fn eof(&self) -> Option<&str> {
        self.headers.get("EOF").map(String::as_str)
    }

    pub fn is_noop(&self) -> bool {
        self.headers.contains_key("NOOP")
    }

    /// Parse one chunk's header-plus-payload body (the bytes following the length
    /// prefix) into a `Frame`. The header block is split at the first blank line.
    pub fn parse(body: &[u8]) -> PkResult<Frame> {
        let split_at = find_subslice(body, b"\r\n\r\n")
            .ok_or_else(|| PkError::Fatal(PkErrorKind::Parse("no header terminator".into())))?;

        let header_block = &body[..split_at];
        let payload = body[split_at + 4..].to_vec();

        let mut headers = IndexMap::new();
        for line in header_block.split(|&b| b == b'\n') {
            let line = strip_cr(line);
            if line.is_empty() {
                continue;
            }
            if let Some(colon) = line.iter().position(|&b| b == b':') {
                let name = String::from_utf8_lossy(&line[..colon]).trim().to_owned();
                let value = String::from_utf8_lossy(&line[colon + 1..]).trim().to_owned();
                headers.insert(name, value);
            }
        }

        Ok(Frame { headers, payload })
    }
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.split_last() {
        Some((b'\r', rest)) => rest,
        _ => line,
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Wrap a header-plus-payload body in the `hex(len)\r\n...` chunk framing.
pub fn chunk_wrap(body: &[u8]) -> Vec<u8> {
    let mut out = format!("{:x}\r\n", body.len()).into_bytes();
    out.extend_from_slice(body);
    out
}

/// `SID: <sid>\r\n\r\n<data>`.
pub fn fmt_data(sid: &str, data: &[u8]) -> Vec<u8> {
    let mut body = format!("SID: {}\r\n\r\n", sid).into_bytes();
    body.extend_from_slice(data);
    chunk_wrap(&body)
}

/// `SID: <sid>\r\nEOF: 1WR\r\n\r\n`.
pub fn fmt_eof(sid: &str, direction: &str) -> Vec<u8> {
    let body = format!("SID: {}\r\nEOF: {}\r\n\r\n", sid, direction);
    chunk_wrap(body.as_bytes())
}

/// `NOOP: 1\r\nPING: <unix-seconds.ff>\r\n\r\n!`.
pub fn fmt_ping() -> Vec<u8> {
    let body = format!("NOOP: 1\r\nPING: {}.00\r\n\r\n!", timestamp_secs());
    chunk_wrap(body.as_bytes())
}

/// `NOOP: 1\r\nPONG: <token>\r\n\r\n!`.
pub fn fmt_pong(token: &str) -> Vec<u8> {
    let body = format!("NOOP: 1\r\nPONG: {}\r\n\r\n!", token);
    chunk_wrap(body.as_bytes())
}

/// Attempts to pull one complete chunk off the front of `buffer`. Returns `Ok(None)` if
/// the buffer doesn't yet contain a full chunk (the caller should wait for more data),
/// `Err(EofTunnel)` on a malformed length prefix, and otherwise the parsed frame with its
/// bytes consumed from `buffer`.
pub fn read_chunk(buffer: &mut Buffer) -> PkResult<Option<Frame>> {
    let data = buffer.read_slice();

    let prefix_len = data.len().min(MAX_LEN_PREFIX + 2);
    let crlf = match find_subslice(&data[..prefix_len], b"\r\n") {
        Some(pos) => pos,
        None => {
            if data.len() > MAX_LEN_PREFIX + 2 {
                return Err(PkError::Fatal(PkErrorKind::EofTunnel));
            }
            return Ok(None);
        }
    };

    let len_str = std::str::from_utf8(&data[..crlf])
        .map_err(|_| PkError::Fatal(PkErrorKind::EofTunnel))?;
    let chunk_len = usize::from_str_radix(len_str, 16)
        .map_err(|_| PkError::Fatal(PkErrorKind::EofTunnel))?;

    let body_start = crlf + 2;
    if data.len() < body_start + chunk_len {
        return Ok(None);
    }

    let frame = Frame::parse(&data[body_start..body_start + chunk_len])?;
    buffer.move_head(body_start + chunk_len);

    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_data_frame() {
        let chunk = fmt_data("abc123", b"hello world");

        let mut buffer = Buffer::new(65536);
        buffer.write_slice()[..chunk.len()].copy_from_slice(&chunk);
        buffer.move_tail(chunk.len());

        let frame = read_chunk(&mut buffer).unwrap().unwrap();
        assert_eq!(frame.sid(), Some("abc123"));
        assert_eq!(frame.payload, b"hello world");
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn incomplete_chunk_waits() {
        let chunk = fmt_data("abc123", b"hello world");

        let mut buffer = Buffer::new(65536);
        let partial = &chunk[..chunk.len() - 3];
        buffer.write_slice()[..partial.len()].copy_from_slice(partial);
        buffer.move_tail(partial.len());

        assert!(read_chunk(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn eof_frame_carries_direction() {
        let chunk = fmt_eof("abc123", "1WR");

        let mut buffer = Buffer::new(65536);
        buffer.write_slice()[..chunk.len()].copy_from_slice(&chunk);
        buffer.move_tail(chunk.len());

        let frame = read_chunk(&mut buffer).unwrap().unwrap();
        assert_eq!(frame.sid(), Some("abc123"));
        assert_eq!(frame.eof(), Some("1WR"));
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn ping_pong_roundtrip() {
        let ping = fmt_ping();
        let mut buffer = Buffer::new(65536);
        buffer.write_slice()[..ping.len()].copy_from_slice(&ping);
        buffer.move_tail(ping.len());

        let frame = read_chunk(&mut buffer).unwrap().unwrap();
        assert!(frame.is_noop());
        assert!(frame.ping().is_some());
    }

    #[test]
    fn bad_length_prefix_is_fatal() {
        let mut buffer = Buffer::new(65536);
        let bad = b"zzzzzzzzzzzzz\r\n";
        buffer.write_slice()[..bad.len()].copy_from_slice(bad);
        buffer.move_tail(bad.len());

        assert!(matches!(read_chunk(&mut buffer), Err(PkError::Fatal(PkErrorKind::EofTunnel))));
    }
}
