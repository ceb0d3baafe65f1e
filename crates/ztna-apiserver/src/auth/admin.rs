//! Administrator credential pair and HTTP Basic parsing.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};

/// The admin username/password, held as digests so comparison time does not
/// depend on where the first mismatching byte sits.
#[derive(Clone)]
pub struct AdminCredentials {
    username: [u8; 32],
    password: [u8; 32],
}

impl AdminCredentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: digest(username),
            password: digest(password),
        }
    }

    pub fn verify(&self, username: &str, password: &str) -> bool {
        // Evaluate both halves unconditionally.
        let user_ok = digest(username) == self.username;
        let pass_ok = digest(password) == self.password;
        user_ok & pass_ok
    }

    /// Verify an `Authorization: Basic ...` header value.
    pub fn verify_header(&self, header: &str) -> bool {
        parse_basic_auth(header).is_some_and(|(u, p)| self.verify(&u, &p))
    }
}

impl std::fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AdminCredentials(..)")
    }
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

/// Split a `Basic <base64(user:pass)>` header value into its two halves.
pub fn parse_basic_auth(header: &str) -> Option<(String, String)> {
    let encoded = header
        .strip_prefix("Basic ")
        .or_else(|| header.strip_prefix("basic "))?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Build a `Basic` header value, the inverse of [`parse_basic_auth`].
pub fn basic_auth_header(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn verifies_exact_pair_only() {
        let creds = AdminCredentials::new("admin", "hunter2");
        assert!(creds.verify("admin", "hunter2"));
        assert!(!creds.verify("admin", "hunter3"));
        assert!(!creds.verify("root", "hunter2"));
    }

    #[test]
    fn parses_basic_header() {
        let header = basic_auth_header("gw-oslo", "pa:ss");
        assert_eq!(
            parse_basic_auth(&header).unwrap(),
            ("gw-oslo".to_string(), "pa:ss".to_string())
        );
    }

    #[test]
    fn rejects_malformed_headers() {
        assert!(parse_basic_auth("Bearer abc").is_none());
        assert!(parse_basic_auth("Basic !!!").is_none());
        assert!(parse_basic_auth(&format!("Basic {}", STANDARD.encode("nocolon"))).is_none());
    }

    #[test]
    fn debug_does_not_leak() {
        let creds = AdminCredentials::new("admin", "hunter2");
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
