//! Concrete `DdnsUpdater`: a signed GET to the PageKite DDNS endpoint. Grounded on
//! spec.md §6 (DDNS contract: `sign_ddns`, `up.pagekite.net`) and
//! `original_source/upagekite/__init__.py`'s `check_dns` for when/why an update fires and
//! how its plaintext reply is read. Implemented as a hand-rolled blocking HTTP/1.0 client
//! over `std::net::TcpStream`, matching the manual-HTTP-parsing idiom used throughout
//! `original_source` and `pagekite_tunnel::net::select`'s relay probe, rather than pulling
//! in a full HTTP client crate for one GET call.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use pagekite_core::crypto;
use pagekite_core::error::{PkError, PkErrorKind, PkResult};

use pagekite_tunnel::ddns::{DdnsOutcome, DdnsUpdate, DdnsUpdater};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpDdnsUpdater {
    url: String,
    kite_secret: String,
}

impl HttpDdnsUpdater {
    pub fn new(url: impl Into<String>, kite_secret: impl Into<String>) -> HttpDdnsUpdater {
        HttpDdnsUpdater { url: url.into(), kite_secret: kite_secret.into() }
    }
}

struct ParsedUrl {
    host: String,
    port: u16,
    path: String,
}

fn parse_http_url(url: &str) -> PkResult<ParsedUrl> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| PkError::Fatal(PkErrorKind::Parse("ddns_url must be http://".into())))?;

    let (authority, path) = match rest.find('/') {
        Some(pos) => (&rest[..pos], &rest[pos..]),
        None => (rest, "/"),
    };

    let (host, port) = match authority.split_once(':') {
        Some((h, p)) => (h.to_owned(), p.parse().unwrap_or(80)),
        None => (authority.to_owned(), 80),
    };

    Ok(ParsedUrl { host, port, path: path.to_owned() })
}

impl DdnsUpdater for HttpDdnsUpdater {
    fn update(&mut self, request: &DdnsUpdate) -> PkResult<DdnsOutcome> {
        let signature = crypto::sign_ddns(&self.kite_secret, &request.kite_name, &request.ip);
        let parsed = parse_http_url(&self.url)?;

        let query = format!("hostname={}&myip={}&sign={}", request.kite_name, request.ip, signature);
        let http_request = format!(
            "GET {}?{} HTTP/1.0\r\nHost: {}\r\nConnection: close\r\n\r\n",
            parsed.path, query, parsed.host
        );

        let addr = format!("{}:{}", parsed.host, parsed.port)
            .parse()
            .or_else(|_| resolve_one(&parsed.host, parsed.port))?;
        let mut stream = TcpStream::connect_timeout(&addr, REQUEST_TIMEOUT)?;
        stream.set_read_timeout(Some(REQUEST_TIMEOUT)).ok();
        stream.write_all(http_request.as_bytes())?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response)?;
        let response = String::from_utf8_lossy(&response);

        let body = response.split("\r\n\r\n").nth(1).unwrap_or("").trim();

        if body.starts_with("-") {
            return Err(PkError::Fatal(PkErrorKind::Rejected(body.to_owned())));
        }
        if body.contains("nochg") {
            return Ok(DdnsOutcome::Unchanged);
        }
        Ok(DdnsOutcome::Updated)
    }
}

fn resolve_one(host: &str, port: u16) -> PkResult<std::net::SocketAddr> {
    use std::net::ToSocketAddrs;
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| PkError::Fatal(PkErrorKind::AddrParse))
}
