//! SHA1-based signing primitives used for the PageKite challenge/response handshake and
//! for the DDNS update signature. Grounded on `original_source/upagekite/proto.py`'s
//! `sign()`, `uPageKiteDefaults.make_random_secret()`, and the `client_token` construction
//! used throughout `connect()`.

use rand::RngCore;
use sha1::{Digest, Sha1};

const TOKEN_LENGTH: usize = 36;

fn sha1_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

/// Eight bytes of randomness rendered as 8 lowercase hex chars, used as a signing salt.
fn random_salt() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// `sign(secret, payload, salt=None, ts=None, length=36)`.
///
/// When `ts` is `Some`, the payload is extended with `hex(ts / 600)` (a ten-minute epoch
/// bucket) and the salt's first character is replaced with `t` to mark it as
/// timestamp-folded (`'t' + salt[1:]`), exactly as the original implementation does so a
/// verifier can tell which form it is looking at.
pub fn sign(secret: &str, payload: &str, salt: Option<&str>, ts: Option<u64>, length: usize) -> String {
    let salt = salt.map(str::to_owned).unwrap_or_else(random_salt);

    let (salt, payload) = match ts {
        Some(ts) => {
            let mut chars = salt.chars();
            chars.next();
            (format!("t{}", chars.as_str()), format!("{}{:x}", payload, ts / 600))
        }
        None => (salt, payload.to_owned()),
    };

    let salt8: String = salt.chars().take(8).collect();
    let digest = sha1_hex(&[secret.as_bytes(), payload.as_bytes(), salt8.as_bytes()]);
    let tail_len = length.saturating_sub(8);

    format!("{}{}", salt8, &digest[..tail_len.min(digest.len())])
}

/// `sign()` with the default 36-character signature length and a supplied salt (used when
/// re-signing against a server-issued challenge).
pub fn sign_challenge(kite_secret: &str, challenge: &str) -> String {
    sign(kite_secret, challenge, None, None, TOKEN_LENGTH)
}

/// `client_token = sha1_hex(global_secret + "/" + relay_addr + "/" + kite_secret)[:36]`.
pub fn client_token(global_secret: &str, relay_addr: &str, kite_secret: &str) -> String {
    let payload = format!("{}/{}/{}", global_secret, relay_addr, kite_secret);
    let digest = sha1_hex(&[payload.as_bytes()]);
    digest[..TOKEN_LENGTH.min(digest.len())].to_owned()
}

/// `sign()` at length 100, used for the DDNS update signature
/// (`sig100 = sign(kite_secret, "<name>:<ip>", length=100)`).
pub fn sign_ddns(kite_secret: &str, name: &str, ip: &str) -> String {
    let payload = format!("{}:{}", name, ip);
    sign(kite_secret, &payload, None, None, 100)
}

/// Generates a fresh random secret suitable for use as a kite secret or global secret.
pub fn make_random_secret() -> String {
    let mut bytes = [0u8; 36];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_is_deterministic_given_salt() {
        let a = sign("s3cr3t", "payload", Some("aabbccdd"), None, 36);
        let b = sign("s3cr3t", "payload", Some("aabbccdd"), None, 36);
        assert_eq!(a, b);
        assert_eq!(&a[..8], "aabbccdd");
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn sign_differs_by_secret() {
        let a = sign("secret-a", "payload", Some("aabbccdd"), None, 36);
        let b = sign("secret-b", "payload", Some("aabbccdd"), None, 36);
        assert_ne!(a, b);
    }

    #[test]
    fn sign_with_timestamp_prefixes_salt_with_t() {
        let s = sign("s3cr3t", "payload", Some("aabbccdd"), Some(1_700_000_000), 36);
        assert_eq!(&s[..1], "t");
        assert_eq!(s.len(), 36);
    }

    #[test]
    fn sign_with_timestamp_replaces_rather_than_prepends_salt_char() {
        // 't' + salt[1:], not 't' + salt (which would shift every following salt char
        // over by one instead of just swapping the first).
        let s = sign("s3cr3t", "payload", Some("aabbccdd"), Some(1_700_000_000), 36);
        assert_eq!(&s[..8], "tabbccdd");
    }

    #[test]
    fn client_token_is_36_chars() {
        let token = client_token("global", "1.2.3.4:443", "kitesecret");
        assert_eq!(token.len(), 36);
    }

    #[test]
    fn sign_ddns_is_100_chars() {
        let sig = sign_ddns("kitesecret", "foo.example.com", "1.2.3.4");
        assert_eq!(sig.len(), 100);
    }

    #[test]
    fn random_secret_is_not_constant() {
        assert_ne!(make_random_secret(), make_random_secret());
    }
}
