//! The single-threaded cooperative scheduler: one `mio::Poll` drives every relay
//! connection and the local listener, dispatches readable events, and runs housekeeping
//! (dead-tunnel detection, PING emission, watchdog feed) between poll iterations.
//! Grounded on `lib/neutronium/src/net/endpoint.rs` (`Endpoint::sync`/`housekeeping`) for
//! the Rust shape, and `original_source/upagekite/__init__.py`
//! (`uPageKiteConnPool.async_poll`/`process_io`) for the exact PageKite timing formula.

use std::time::{Duration, Instant};

use pagekite_core::error::{ErrorUtils, PkResult};
use pagekite_core::logging::{self, Logger};

use crate::kite::Kite;

use super::local_listener::LocalListener;
use super::relay::TunnelConnection;

/// No-op default for `Watchdog`; a real implementation would feed a hardware timer on an
/// embedded target. See DESIGN.md's Open Question on this trait.
pub trait Watchdog: Send {
    fn arm(&mut self, timeout: Duration);
    fn feed(&mut self);
}

pub struct NullWatchdog;

impl Watchdog for NullWatchdog {
    fn arm(&mut self, _timeout: Duration) {}
    fn feed(&mut self) {}
}

pub struct PoolLimits {
    pub tunnel_timeout: Duration,
    pub min_check_interval: Duration,
    pub poll_budget: Duration,
}

impl Default for PoolLimits {
    fn default() -> PoolLimits {
        PoolLimits {
            tunnel_timeout: Duration::from_secs(240),
            min_check_interval: Duration::from_secs(15),
            poll_budget: Duration::from_secs(5),
        }
    }
}

pub struct ConnectionPool {
    poll: mio::Poll,
    events: mio::Events,
    connections: Vec<(mio::Token, TunnelConnection)>,
    listener: Option<LocalListener>,
    limits: PoolLimits,
    watchdog: Box<dyn Watchdog>,
    log: Logger,
}

impl ConnectionPool {
    pub fn new(limits: PoolLimits, log: Logger) -> PkResult<ConnectionPool> {
        Ok(ConnectionPool {
            poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(1024),
            connections: Vec::new(),
            listener: None,
            limits,
            watchdog: Box::new(NullWatchdog),
            log,
        })
    }

    pub fn set_watchdog(&mut self, watchdog: Box<dyn Watchdog>) {
        self.watchdog = watchdog;
    }

    pub fn poll_handle(&self) -> &mio::Poll {
        &self.poll
    }

    pub fn add_connection(&mut self, token: mio::Token, conn: TunnelConnection) {
        self.connections.push((token, conn));
    }

    pub fn set_listener(&mut self, listener: LocalListener) {
        self.listener = Some(listener);
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Runs one scheduler iteration: poll for events, dispatch readable connections
    /// through `dispatch_new` for frames with no registered SID handler, then run
    /// housekeeping. Returns `Err` if a fatal (non-`Wait`) failure tore down a connection
    /// that the supervisor needs to know about — the supervisor decides whether that's
    /// fatal to the whole tunnel.
    pub fn tick<F>(&mut self, deadline: Instant, kites: &[Kite], mut dispatch_new: F) -> PkResult<()>
    where
        F: FnMut(&super::frame::Frame, &mut TunnelConnection, &[Kite]) -> PkResult<()>,
    {
        self.watchdog.feed();

        let budget = deadline.saturating_duration_since(Instant::now()).min(self.limits.poll_budget);
        self.poll.poll(&mut self.events, Some(budget))?;

        let now = Instant::now();
        let mut dead_tokens = Vec::new();

        let poll_ref = &self.poll;

        for event in self.events.iter() {
            let token = event.token();

            if let Some(listener) = self.listener.as_mut() {
                if token == listener.listener_token() {
                    listener.accept_ready(poll_ref);
                    continue;
                }
                if listener.owns_token(token) {
                    if listener.handle_event(token, now) {
                        listener.drop_client(token);
                    }
                    continue;
                }
            }

            if let Some((_, conn)) = self.connections.iter_mut().find(|(t, _)| *t == token) {
                let result = conn.process_io(now, |frame, conn| dispatch_new(frame, conn, kites));
                if result.has_failed() {
                    dead_tokens.push(token);
                }
            }
        }

        self.connections.retain(|(token, _)| !dead_tokens.contains(token));

        for (_, conn) in self.connections.iter_mut() {
            drop(conn.pump_pending_sends(now));
            drop(conn.drain_ws_mailbox());
        }

        self.housekeeping(now);

        Ok(())
    }

    fn housekeeping(&mut self, now: Instant) {
        let tunnel_timeout = self.limits.tunnel_timeout;
        let min_check = self.limits.min_check_interval;

        let mut dead = Vec::new();

        for (token, conn) in self.connections.iter_mut() {
            let idle = now.duration_since(conn.last_data_ts);

            if idle > tunnel_timeout {
                logging::debug!(self.log, "tunnel idle timeout"; "peer" => %conn.peer_addr);
                dead.push(*token);
                continue;
            }

            if idle > tunnel_timeout.saturating_sub(min_check * 2) {
                drop(conn.send_ping());
            }
        }

        if !dead.is_empty() {
            self.connections.retain(|(token, _)| !dead.contains(token));
        }
    }
}
