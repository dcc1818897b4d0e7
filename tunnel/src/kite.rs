use std::sync::Arc;

use crate::http::request::RequestEnv;
use pagekite_core::error::PkResult;

/// A handler invoked when a relay (or the local listener) opens a new stream for one of
/// our kites. Implementations are expected to register further per-SID continuation
/// handlers on the connection if the request needs a streaming body or a websocket.
pub trait KiteHandler: Send + Sync {
    fn handle(&self, env: &mut RequestEnv) -> PkResult<()>;
}

impl<F> KiteHandler for F
where
    F: Fn(&mut RequestEnv) -> PkResult<()> + Send + Sync,
{
    fn handle(&self, env: &mut RequestEnv) -> PkResult<()> {
        self(env)
    }
}

/// An identity advertised to relays: a DNS name, the secret shared with the relay account,
/// and the protocol tag under which it is reachable (`http`, `https`, or a composite like
/// `raw/22` for a raw TCP/SSH kite).
#[derive(Clone)]
pub struct Kite {
    pub name: String,
    pub secret: String,
    pub proto: String,
    /// Server-issued challenge from the most recent `X-PageKite-SignThis` line. Reset to
    /// empty at the start of every handshake attempt.
    pub challenge: String,
    pub handler: Arc<dyn KiteHandler>,
}

impl Kite {
    pub fn new(name: impl Into<String>, secret: impl Into<String>, proto: impl Into<String>, handler: Arc<dyn KiteHandler>) -> Kite {
        Kite {
            name: name.into(),
            secret: secret.into(),
            proto: proto.into(),
            challenge: String::new(),
            handler,
        }
    }

    /// True if `proto` (as seen on an inbound frame's `Proto` header) matches this kite,
    /// either directly or as the base of a `proto-port` composite tag (e.g. `raw` matches
    /// a kite registered as `raw/22`).
    pub fn matches_proto(&self, proto: &str) -> bool {
        self.proto == proto || self.proto.split('/').next() == Some(proto)
    }
}
