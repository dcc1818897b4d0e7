//! Relay selection: DNS resolution, candidate dedupe, and latency-biased probing.
//! Grounded on `original_source/upagekite/__init__.py`'s `uPageKite.choose_relays` and
//! `proto.py`'s `ping_relay`/`get_kite_addrinfo`/`get_relays_addrinfo` for the exact
//! scoring rule.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use pagekite_core::logging::{self, Logger};

use crate::dns_hints::DnsHints;

const UNREACHABLE_SCORE: f64 = 99999.0;
const PREFERRED_BIAS: f64 = 0.75;
const DEFAULT_BIAS: f64 = 1.0;
const OVERLOAD_PENALTY_MS: f64 = 250.0;
const MAX_CANDIDATES: usize = 10;
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_READ_BUDGET: usize = 250;

pub struct Candidate {
    pub addr: SocketAddr,
    pub score: f64,
}

/// Resolve `names` (kite front-end names) plus `default_name` plus any cached DNS hints
/// into at most `MAX_CANDIDATES` deduplicated socket addresses.
pub fn resolve_candidates(
    names: &[&str],
    default_name: &str,
    default_port: u16,
    hints: &DnsHints,
) -> Vec<SocketAddr> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    let mut push_all = |host: &str, port: u16, out: &mut Vec<SocketAddr>| {
        if let Ok(addrs) = (host, port).to_socket_addrs() {
            for addr in addrs {
                if seen.insert(addr) && out.len() < MAX_CANDIDATES {
                    out.push(addr);
                }
            }
        }
        for ip in hints.get(host) {
            if let Ok(addr) = format!("{}:{}", ip, port).parse::<SocketAddr>() {
                if seen.insert(addr) && out.len() < MAX_CANDIDATES {
                    out.push(addr);
                }
            }
        }
    };

    for name in names {
        push_all(name, default_port, &mut out);
    }
    push_all(default_name, default_port, &mut out);

    out
}

/// Probes each candidate with a plaintext `GET /ping` and returns `[fastest, first]` if
/// the fastest candidate isn't the first one tried, else just `[first]`. Unreachable
/// candidates score `UNREACHABLE_SCORE`. Opportunistically scrapes `X-DNS:` hints from
/// probe responses into `hints`.
pub fn choose_relays(candidates: &[SocketAddr], preferred: Option<SocketAddr>, hints: &mut DnsHints, log: &Logger) -> Vec<SocketAddr> {
    if candidates.is_empty() {
        return Vec::new();
    }

    if candidates.len() == 1 {
        return vec![candidates[0]];
    }

    let mut scored: Vec<Candidate> = candidates
        .iter()
        .enumerate()
        .map(|(i, &addr)| {
            let bias = if Some(addr) == preferred || i == 0 {
                PREFERRED_BIAS
            } else {
                DEFAULT_BIAS
            };
            Candidate { addr, score: ping_relay(addr, bias, hints) }
        })
        .collect();

    logging::debug!(log, "relay probe results"; "count" => scored.len());

    scored.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap());
    let fastest = scored[0].addr;
    let first = candidates[0];

    if fastest != first {
        vec![fastest, first]
    } else {
        vec![first]
    }
}

fn ping_relay(addr: SocketAddr, bias: f64, hints: &mut DnsHints) -> f64 {
    let start = Instant::now();

    let mut stream = match TcpStream::connect_timeout(&addr, PROBE_TIMEOUT) {
        Ok(s) => s,
        Err(_) => return UNREACHABLE_SCORE,
    };
    stream.set_read_timeout(Some(PROBE_TIMEOUT)).ok();

    if stream.write_all(b"GET /ping HTTP/1.0\r\n\r\n").is_err() {
        return UNREACHABLE_SCORE;
    }

    let mut buf = [0u8; PROBE_READ_BUDGET];
    let n = match stream.read(&mut buf) {
        Ok(n) => n,
        Err(_) => return UNREACHABLE_SCORE,
    };

    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    let response = String::from_utf8_lossy(&buf[..n]);

    let mut penalty = 0.0;
    for line in response.lines() {
        if let Some(rest) = line.strip_prefix("X-DNS:") {
            let mut parts = rest.trim().splitn(2, ' ');
            if let (Some(host), Some(ips)) = (parts.next(), parts.next()) {
                for ip in ips.split(',') {
                    hints.insert(host, ip.trim());
                }
            }
        }
        if line.starts_with("X-PageKite-Overloaded") {
            penalty = OVERLOAD_PENALTY_MS;
        }
    }

    elapsed_ms * bias + penalty
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_candidate_is_chosen_without_probing() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut hints = DnsHints::new();
        let log = logging::discard();
        assert_eq!(choose_relays(&[addr], None, &mut hints, &log), vec![addr]);
    }

    #[test]
    fn empty_candidates_yields_empty() {
        let mut hints = DnsHints::new();
        let log = logging::discard();
        assert!(choose_relays(&[], None, &mut hints, &log).is_empty());
    }
}
