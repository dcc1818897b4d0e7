//! Process-wide cache of `hostname -> [ip, ...]` populated by scraping `X-DNS:` header
//! lines from relay responses, to sidestep weak or cache-poisoned local resolvers.
//! Grounded on `original_source/upagekite/proto.py`'s DNS hint handling.

use std::collections::HashMap;

#[derive(Default)]
pub struct DnsHints {
    hints: HashMap<String, Vec<String>>,
}

impl DnsHints {
    pub fn new() -> DnsHints {
        DnsHints { hints: HashMap::new() }
    }

    pub fn insert(&mut self, host: &str, ip: &str) {
        let entry = self.hints.entry(host.to_owned()).or_insert_with(Vec::new);
        if !entry.iter().any(|existing| existing == ip) {
            entry.push(ip.to_owned());
        }
    }

    pub fn get(&self, host: &str) -> &[String] {
        self.hints.get(host).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_dedupes() {
        let mut hints = DnsHints::new();
        hints.insert("foo.example.com", "1.2.3.4");
        hints.insert("foo.example.com", "1.2.3.4");
        hints.insert("foo.example.com", "5.6.7.8");
        assert_eq!(hints.get("foo.example.com"), &["1.2.3.4", "5.6.7.8"]);
    }

    #[test]
    fn unknown_host_is_empty() {
        let hints = DnsHints::new();
        assert!(hints.get("nowhere").is_empty());
    }
}
