use serde_derive::{Deserialize, Serialize};

/// Tunable constants governing buffer sizes, timeouts, and backpressure. Defaults favor
/// memory-constrained single-board devices; hosts can raise `send_window_bytes` and
/// `file_read_bytes` via the config file or CLI flags.
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Front-end name used when no kite-specific relay is configured.
    pub front_end_name: String,
    pub front_end_port: u16,

    /// Bytes per outbound chunk write.
    pub send_window_bytes: usize,
    /// Cooperative sleep, in milliseconds, charged per byte sent (anti-bufferbloat).
    pub ms_delay_per_byte: f64,

    pub connect_timeout_secs: u64,
    pub socket_timeout_secs: u64,

    pub tunnel_timeout_secs: u64,
    pub min_check_interval_secs: u64,
    pub max_check_interval_secs: u64,

    pub max_post_bytes: usize,
    pub websocket_max_conns: usize,
    pub file_read_bytes: usize,

    pub webroot: String,
    pub listen_addr: String,

    pub cors_origin: Option<String>,
    pub content_security_policy: Option<String>,

    pub ddns_url: String,
    pub dns_hint_url: String,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            front_end_name: "pagekite.net".into(),
            front_end_port: 443,

            send_window_bytes: 1499,
            ms_delay_per_byte: 0.2,

            connect_timeout_secs: 5,
            socket_timeout_secs: 60,

            tunnel_timeout_secs: 240,
            min_check_interval_secs: 15,
            max_check_interval_secs: 15 * 60,

            max_post_bytes: 64 * 1024,
            websocket_max_conns: 50,
            file_read_bytes: 1499,

            webroot: "webroot".into(),
            listen_addr: "0.0.0.0:8080".into(),

            cors_origin: None,
            content_security_policy: None,

            ddns_url: "http://up.pagekite.net/".into(),
            dns_hint_url: "http://pagekite.net/logs/relays.txt".into(),
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(s: &str) -> serde_json::Result<ClientConfig> {
        serde_json::from_str(s)
    }
}
