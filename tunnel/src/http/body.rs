//! POST body reassembly and content-type dispatched parsing. Grounded on
//! `original_source/upagekite/httpd.py`'s `Frame.ParsePost` (JSON/form/multipart dispatch,
//! rotating temp files for large multipart parts) and its CSRF token ring buffer.

use std::collections::VecDeque;
use std::fs::File;
use std::io::Write as _;
use std::path::PathBuf;

use pagekite_core::encoding::base64;
use rand::RngCore;

const CSRF_RING_SIZE: usize = 30;
const MULTIPART_SPILL_THRESHOLD: usize = 65536;

/// Accumulates a streamed POST body across successive `DATA` frames for one SID until
/// `Content-Length` bytes have arrived. Used by the relay dispatch path, where a request's
/// body can arrive split across several tunnel chunks.
pub struct BodyAccumulator {
    expected: usize,
    buf: Vec<u8>,
}

impl BodyAccumulator {
    pub fn new(content_length: usize) -> BodyAccumulator {
        BodyAccumulator { expected: content_length, buf: Vec::with_capacity(content_length.min(1 << 20)) }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes still needed; `<= 0` means the body is complete (a negative value means the
    /// sender overshot `Content-Length`, which callers should treat the same as complete).
    pub fn needed(&self) -> i64 {
        self.expected as i64 - self.buf.len() as i64
    }

    pub fn is_complete(&self) -> bool {
        self.needed() <= 0
    }

    pub fn into_body(self) -> Vec<u8> {
        self.buf
    }

    /// Takes the accumulated bytes without consuming the accumulator, for use inside an
    /// `FnMut` closure that can't move itself out of its own captured state.
    pub fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

pub struct MultipartPart {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
    pub spilled_to: Option<PathBuf>,
}

pub enum ParsedBody {
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
    Multipart(Vec<MultipartPart>),
    Raw(Vec<u8>),
}

pub fn parse_body(content_type: &str, body: &[u8]) -> ParsedBody {
    let ct = content_type.split(';').next().unwrap_or("").trim();

    match ct {
        "application/json" => match serde_json::from_slice(body) {
            Ok(value) => ParsedBody::Json(value),
            Err(_) => ParsedBody::Raw(body.to_vec()),
        },
        "application/x-www-form-urlencoded" => {
            let text = String::from_utf8_lossy(body);
            ParsedBody::Form(
                text.split('&')
                    .filter(|s| !s.is_empty())
                    .map(|pair| match pair.split_once('=') {
                        Some((k, v)) => (super::request::urldecode(k), super::request::urldecode(v)),
                        None => (super::request::urldecode(pair), String::new()),
                    })
                    .collect(),
            )
        }
        "multipart/form-data" => match boundary_from_content_type(content_type) {
            Some(boundary) => ParsedBody::Multipart(parse_multipart(body, &boundary)),
            None => ParsedBody::Raw(body.to_vec()),
        },
        _ => ParsedBody::Raw(body.to_vec()),
    }
}

fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let param = param.trim();
        param.strip_prefix("boundary=").map(|b| b.trim_matches('"').to_owned())
    })
}

fn parse_multipart(body: &[u8], boundary: &str) -> Vec<MultipartPart> {
    let delim = format!("--{}", boundary).into_bytes();
    let mut parts = Vec::new();
    let mut spill_counter = 0usize;

    for chunk in split_on(body, &delim).into_iter().filter(|c| !c.is_empty() && *c != b"--\r\n") {
        let chunk = trim_leading_crlf(chunk);
        let header_end = match find(chunk, b"\r\n\r\n") {
            Some(pos) => pos,
            None => continue,
        };

        let head = String::from_utf8_lossy(&chunk[..header_end]);
        let mut data = &chunk[header_end + 4..];
        if data.ends_with(b"\r\n") {
            data = &data[..data.len() - 2];
        }

        let mut name = String::new();
        let mut filename = None;
        let mut content_type = None;

        for line in head.split("\r\n") {
            if let Some(rest) = line.strip_prefix("Content-Disposition:") {
                for field in rest.split(';') {
                    let field = field.trim();
                    if let Some(v) = field.strip_prefix("name=") {
                        name = v.trim_matches('"').to_owned();
                    } else if let Some(v) = field.strip_prefix("filename=") {
                        filename = Some(v.trim_matches('"').to_owned());
                    }
                }
            } else if let Some(rest) = line.strip_prefix("Content-Type:") {
                content_type = Some(rest.trim().to_owned());
            }
        }

        let spilled_to = if data.len() > MULTIPART_SPILL_THRESHOLD {
            spill_counter += 1;
            spill_part(data, spill_counter)
        } else {
            None
        };

        parts.push(MultipartPart {
            name,
            filename,
            content_type,
            data: if spilled_to.is_some() { Vec::new() } else { data.to_vec() },
            spilled_to,
        });
    }

    parts
}

/// Rotates large multipart parts out to a temp file rather than holding them in memory, to
/// stay within the bounded-allocation budget on constrained devices.
fn spill_part(data: &[u8], index: usize) -> Option<PathBuf> {
    let path = std::env::temp_dir().join(format!("pagekite-upload-{}-{}.part", std::process::id(), index));
    let mut file = File::create(&path).ok()?;
    file.write_all(data).ok()?;
    Some(path)
}

fn split_on<'a>(haystack: &'a [u8], needle: &[u8]) -> Vec<&'a [u8]> {
    let mut out = Vec::new();
    let mut rest = haystack;
    while let Some(pos) = find(rest, needle) {
        out.push(&rest[..pos]);
        rest = &rest[pos + needle.len()..];
    }
    out.push(rest);
    out
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn trim_leading_crlf(data: &[u8]) -> &[u8] {
    data.strip_prefix(b"\r\n".as_slice()).unwrap_or(data)
}

/// Ring buffer of outstanding CSRF tokens, per spec §4.7's anti-forgery requirement for
/// form-backed routes. Oldest token is evicted once the ring fills, bounding memory
/// regardless of how many forms a visitor requests.
pub struct CsrfRing {
    tokens: VecDeque<String>,
    cap: usize,
}

impl CsrfRing {
    pub fn new() -> CsrfRing {
        CsrfRing { tokens: VecDeque::with_capacity(CSRF_RING_SIZE), cap: CSRF_RING_SIZE }
    }

    pub fn issue(&mut self) -> String {
        let mut raw = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = base64::encode(raw);

        if self.tokens.len() >= self.cap {
            self.tokens.pop_front();
        }
        self.tokens.push_back(token.clone());
        token
    }

    pub fn check(&self, token: &str) -> bool {
        self.tokens.iter().any(|t| t == token)
    }
}

impl Default for CsrfRing {
    fn default() -> CsrfRing {
        CsrfRing::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_reports_completion() {
        let mut acc = BodyAccumulator::new(10);
        acc.feed(b"hello");
        assert!(!acc.is_complete());
        acc.feed(b"world");
        assert!(acc.is_complete());
        assert_eq!(acc.into_body(), b"helloworld");
    }

    #[test]
    fn parses_form_body() {
        match parse_body("application/x-www-form-urlencoded", b"a=1&b=two+words") {
            ParsedBody::Form(pairs) => {
                assert_eq!(pairs, vec![("a".to_owned(), "1".to_owned()), ("b".to_owned(), "two words".to_owned())]);
            }
            _ => panic!("expected form body"),
        }
    }

    #[test]
    fn parses_json_body() {
        match parse_body("application/json", br#"{"a":1}"#) {
            ParsedBody::Json(value) => assert_eq!(value["a"], 1),
            _ => panic!("expected json body"),
        }
    }

    #[test]
    fn parses_multipart_fields() {
        let body = b"--XYZ\r\nContent-Disposition: form-data; name=\"field\"\r\n\r\nvalue\r\n--XYZ--\r\n";
        let parts = parse_multipart(body, "XYZ");
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].name, "field");
        assert_eq!(parts[0].data, b"value");
    }

    #[test]
    fn csrf_ring_evicts_oldest() {
        let mut ring = CsrfRing::new();
        let first = ring.issue();
        for _ in 0..CSRF_RING_SIZE {
            ring.issue();
        }
        assert!(!ring.check(&first));
    }
}
