//! The control state machine: picks a relay, connects and authenticates, serves traffic
//! through the `ConnectionPool`, and falls back with exponential backoff on failure.
//! Grounded on `original_source/upagekite/__init__.py`'s `uPageKite.relay_loop` /
//! `check_relays` / `check_dns`, reshaped from Python's generator-based cooperative
//! scheduler into an explicit Rust state enum driven by an owning `run()` loop, per
//! DESIGN.md's `tunnel::supervisor` ledger entry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::Token;
use pagekite_core::error::{PkError, PkErrorKind, PkResult};
use pagekite_core::logging::{self, Logger};
use pagekite_core::time::clock_is_sane;

use crate::config::ClientConfig;
use crate::ddns::{DdnsOutcome, DdnsUpdate, DdnsUpdater};
use crate::dns_hints::DnsHints;
use crate::http::dispatch_new_stream;
use crate::http::websocket::WebSocketState;
use crate::kite::Kite;
use crate::net::local_listener::LocalListener;
use crate::net::pool::{ConnectionPool, PoolLimits};
use crate::net::relay::TunnelConnection;
use crate::net::select::{choose_relays, resolve_candidates};

/// Far away from the local listener's auto-incrementing client tokens (which start at
/// `LISTENER_TOKEN.0 + 1`), so the two token spaces can never collide.
const RELAY_TOKEN_BASE: usize = 1_000_000;
const LISTENER_TOKEN: Token = Token(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Selecting,
    Serving,
    Backoff,
}

pub struct Supervisor<D: DdnsUpdater> {
    config: ClientConfig,
    kites: Vec<Kite>,
    global_secret: String,

    hints: DnsHints,
    ddns: D,

    pool: ConnectionPool,
    listener_bound: bool,

    state: SupervisorState,
    backoff: Duration,
    backoff_until: Instant,

    last_ddns_check: Instant,
    relay_addr: Option<SocketAddr>,

    ws_state: Arc<WebSocketState>,

    log: Logger,
}

impl<D: DdnsUpdater> Supervisor<D> {
    pub fn new(config: ClientConfig, kites: Vec<Kite>, global_secret: String, ddns: D, log: Logger) -> PkResult<Supervisor<D>> {
        let limits = PoolLimits {
            tunnel_timeout: Duration::from_secs(config.tunnel_timeout_secs),
            min_check_interval: Duration::from_secs(config.min_check_interval_secs),
            poll_budget: Duration::from_secs(1),
        };
        let pool = ConnectionPool::new(limits, log.new(logging::o!("component" => "pool")))?;
        let ws_state = Arc::new(WebSocketState::new(config.websocket_max_conns));

        Ok(Supervisor {
            config,
            kites,
            global_secret,
            hints: DnsHints::new(),
            ddns,
            pool,
            listener_bound: false,
            state: SupervisorState::Idle,
            backoff: Duration::from_secs(1),
            backoff_until: Instant::now(),
            last_ddns_check: Instant::now() - Duration::from_secs(3600),
            relay_addr: None,
            ws_state,
            log,
        })
    }

    /// Drives the state machine forever. Each call to `tick` does at most one blocking
    /// connect/handshake (in `Selecting`) or one bounded non-blocking poll (in `Serving`),
    /// so callers that need to interleave other work can call `tick` in their own loop
    /// instead of `run`.
    pub fn run(&mut self) -> PkResult<()> {
        loop {
            self.tick()?;
        }
    }

    pub fn tick(&mut self) -> PkResult<()> {
        if !clock_is_sane() {
            logging::warn!(self.log, "system clock looks unset; signed requests may be rejected");
        }

        self.ensure_local_listener()?;

        match self.state {
            SupervisorState::Idle => {
                self.state = SupervisorState::Selecting;
            }
            SupervisorState::Selecting => self.do_select(),
            SupervisorState::Serving => self.do_serve()?,
            SupervisorState::Backoff => {
                if Instant::now() >= self.backoff_until {
                    self.state = SupervisorState::Selecting;
                }
            }
        }

        Ok(())
    }

    /// Binds the direct-LAN listener to the first kite's handler. Multiple kites sharing
    /// one client normally share one `HttpServer` instance anyway (see `client`'s wiring),
    /// so "first kite" in practice means "the app", not an arbitrary choice among unrelated
    /// handlers.
    fn ensure_local_listener(&mut self) -> PkResult<()> {
        if self.listener_bound || self.config.listen_addr.is_empty() {
            return Ok(());
        }

        let handler = match self.kites.first() {
            Some(kite) => kite.handler.clone(),
            None => return Ok(()),
        };

        let addr: SocketAddr = self
            .config
            .listen_addr
            .parse()
            .map_err(|_| PkError::Fatal(PkErrorKind::AddrParse))?;

        let listener = LocalListener::bind(addr, self.pool.poll_handle(), LISTENER_TOKEN, handler)?;
        self.pool.set_listener(listener);
        self.listener_bound = true;
        Ok(())
    }

    fn do_select(&mut self) {
        let names: Vec<&str> = self.kites.iter().map(|k| k.name.as_str()).collect();
        let candidates = resolve_candidates(&names, &self.config.front_end_name, self.config.front_end_port, &self.hints);

        if candidates.is_empty() {
            logging::warn!(self.log, "no relay candidates resolved");
            self.enter_backoff();
            return;
        }

        let chosen = choose_relays(&candidates, self.relay_addr, &mut self.hints, &self.log);

        for addr in chosen {
            match self.connect_and_handshake(addr) {
                Ok(()) => {
                    self.relay_addr = Some(addr);
                    self.backoff = Duration::from_secs(1);
                    self.state = SupervisorState::Serving;
                    return;
                }
                Err(e) => {
                    logging::warn!(self.log, "relay connect failed"; "addr" => %addr, "err" => format!("{:?}", e));
                }
            }
        }

        self.enter_backoff();
    }

    fn connect_and_handshake(&mut self, addr: SocketAddr) -> PkResult<()> {
        let token = Token(RELAY_TOKEN_BASE);
        let mut kites = self.kites.clone();

        let mut conn = TunnelConnection::connect(
            addr,
            &self.config.front_end_name,
            Duration::from_secs(self.config.connect_timeout_secs),
            self.pool.poll_handle(),
            token,
            self.config.send_window_bytes,
            self.config.ms_delay_per_byte,
            &self.log,
        )?;

        conn.handshake(&self.global_secret, &mut kites, env!("CARGO_PKG_VERSION"))?;
        self.kites = kites;
        self.pool.add_connection(token, conn);
        Ok(())
    }

    fn do_serve(&mut self) -> PkResult<()> {
        let deadline = Instant::now() + Duration::from_secs(1);
        let kites = self.kites.clone();
        let max_post_bytes = self.config.max_post_bytes;
        let ws_state = self.ws_state.clone();

        self.pool
            .tick(deadline, &kites, |frame, conn, kites| dispatch_new_stream(frame, conn, kites, max_post_bytes, &ws_state))?;

        if self.pool.is_empty() {
            let max_check = Duration::from_secs(self.config.max_check_interval_secs);
            if Instant::now().duration_since(self.last_ddns_check) > max_check * 2 {
                logging::info!(self.log, "relay connection idle too long, reselecting");
                self.enter_backoff();
                return Ok(());
            }
        }

        self.maybe_update_ddns();

        Ok(())
    }

    /// Re-runs the DDNS update once per `min_check_interval`, backed off up to
    /// `max_check_interval` while nothing changes, per `original_source`'s `check_dns`.
    fn maybe_update_ddns(&mut self) {
        let min_check = Duration::from_secs(self.config.min_check_interval_secs);
        if Instant::now().duration_since(self.last_ddns_check) < min_check {
            return;
        }
        self.last_ddns_check = Instant::now();

        let ip = self.relay_addr.map(|addr| addr.ip().to_string()).unwrap_or_else(|| "0.0.0.0".to_owned());

        for kite in &self.kites {
            let request = DdnsUpdate { kite_name: kite.name.clone(), ip: ip.clone() };
            match self.ddns.update(&request) {
                Ok(DdnsOutcome::Updated) => {
                    logging::info!(self.log, "ddns updated"; "kite" => %kite.name);
                }
                Ok(DdnsOutcome::Unchanged) => {}
                Err(e) => {
                    logging::warn!(self.log, "ddns update failed"; "kite" => %kite.name, "err" => format!("{:?}", e));
                }
            }
        }
    }

    fn enter_backoff(&mut self) {
        let max_backoff = Duration::from_secs(self.config.max_check_interval_secs);
        self.backoff_until = Instant::now() + self.backoff;
        logging::debug!(self.log, "entering backoff"; "seconds" => self.backoff.as_secs());
        self.backoff = (self.backoff * 2).min(max_backoff);
        self.state = SupervisorState::Backoff;
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kite::KiteHandler;
    use std::sync::Arc;

    struct NoopHandler;
    impl KiteHandler for NoopHandler {
        fn handle(&self, _env: &mut crate::http::request::RequestEnv) -> PkResult<()> {
            Ok(())
        }
    }

    struct CountingDdns {
        calls: std::sync::atomic::AtomicUsize,
        last_ip: std::sync::Mutex<Option<String>>,
    }
    impl DdnsUpdater for CountingDdns {
        fn update(&mut self, r: &DdnsUpdate) -> PkResult<DdnsOutcome> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            *self.last_ip.lock().unwrap() = Some(r.ip.clone());
            Ok(DdnsOutcome::Unchanged)
        }
    }

    #[test]
    fn ddns_update_uses_the_relay_address_not_a_placeholder() {
        let mut config = ClientConfig::default();
        config.listen_addr = String::new();
        config.min_check_interval_secs = 0;

        let kite = Kite::new("test.example.com", "secret", "http", Arc::new(NoopHandler));
        let ddns = CountingDdns { calls: Default::default(), last_ip: Default::default() };
        let mut sup = Supervisor::new(config, vec![kite], "global".into(), ddns, logging::discard()).unwrap();

        sup.relay_addr = Some("203.0.113.5:443".parse().unwrap());
        sup.last_ddns_check = Instant::now() - Duration::from_secs(3600);
        sup.maybe_update_ddns();

        assert_eq!(sup.ddns.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(sup.ddns.last_ip.lock().unwrap().as_deref(), Some("203.0.113.5"));
    }

    #[test]
    fn backoff_doubles_up_to_max() {
        let mut config = ClientConfig::default();
        config.listen_addr = String::new();
        config.max_check_interval_secs = 8;

        let kite = Kite::new("test.example.com", "secret", "http", Arc::new(NoopHandler));
        let ddns = CountingDdns { calls: Default::default(), last_ip: Default::default() };
        let mut sup = Supervisor::new(config, vec![kite], "global".into(), ddns, logging::discard()).unwrap();

        sup.backoff = Duration::from_secs(1);
        sup.enter_backoff();
        assert_eq!(sup.backoff, Duration::from_secs(2));
        sup.enter_backoff();
        assert_eq!(sup.backoff, Duration::from_secs(4));
        sup.enter_backoff();
        assert_eq!(sup.backoff, Duration::from_secs(8));
        sup.enter_backoff();
        assert_eq!(sup.backoff, Duration::from_secs(8));
    }
}
