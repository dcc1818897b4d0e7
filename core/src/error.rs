use std::io;

pub type PkResult<T> = Result<T, PkError>;

/// Unified error type for the tunnel engine. `Wait` is not a failure: it means the
/// operation would have blocked and the caller should retry on the next scheduler tick.
#[derive(Debug)]
pub enum PkError {
    Wait,
    Fatal(PkErrorKind),
}

#[derive(Debug)]
pub enum PkErrorKind {
    /// The relay rejected one or more kites during handshake.
    Rejected(String),
    /// The tunnel connection hit a clean or dirty EOF, or a malformed chunk header.
    EofTunnel,
    /// A per-SID substream was closed by the peer.
    EofStream,
    /// HTTP-layer access control failure.
    Permission,
    /// Malformed request, oversize body, or invalid multipart payload.
    Parse(String),
    /// No route or file matched the request.
    NotFound,
    /// Signature verification or crypto failure.
    Crypto,
    Io(io::ErrorKind),
    AddrParse,
    Tls(String),
}

impl From<io::Error> for PkError {
    #[inline]
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => PkError::Wait,
            kind => PkError::Fatal(PkErrorKind::Io(kind)),
        }
    }
}

impl From<std::net::AddrParseError> for PkError {
    #[inline]
    fn from(_: std::net::AddrParseError) -> Self {
        PkError::Fatal(PkErrorKind::AddrParse)
    }
}

impl From<serde_json::Error> for PkError {
    #[inline]
    fn from(err: serde_json::Error) -> Self {
        PkError::Fatal(PkErrorKind::Parse(err.to_string()))
    }
}

impl PkError {
    #[inline]
    pub fn fatal(kind: PkErrorKind) -> PkError {
        PkError::Fatal(kind)
    }
}

pub trait ErrorUtils {
    /// True for any error other than `Wait` — the only outcome callers should treat as
    /// "try again next tick" rather than "the connection/request is dead".
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for PkResult<T> {
    #[inline]
    fn has_failed(&self) -> bool {
        !matches!(self, Ok(_) | Err(PkError::Wait))
    }
}
