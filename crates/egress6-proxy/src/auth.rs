//! Basic-Authentication gate for inbound proxy requests.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

const BASIC_PREFIX: &str = "Basic ";

/// Static username/password pair. Both empty means authentication is off.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// `Proxy-Authorization` value for a username/password pair.
#[cfg(test)]
pub(crate) fn basic_authorization(username: &str, password: &str) -> String {
    format!(
        "{}{}",
        BASIC_PREFIX,
        STANDARD.encode(format!("{}:{}", username, password))
    )
}

/// Validates `Proxy-Authorization` header values against one credential.
#[derive(Debug, Clone)]
pub struct AuthGate {
    credential: Credential,
}

impl AuthGate {
    pub fn new(credential: Credential) -> Self {
        Self { credential }
    }

    /// Open proxy mode: no credential configured.
    pub fn is_open(&self) -> bool {
        self.credential.is_empty()
    }

    /// Pure predicate. Callers answer 407 with a `Proxy-Authenticate: Basic`
    /// challenge when this returns false.
    pub fn authorize(&self, header_value: Option<&str>) -> bool {
        if self.is_open() {
            return true;
        }
        let Some(value) = header_value else {
            return false;
        };
        let Some(encoded) = value.strip_prefix(BASIC_PREFIX) else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded) else {
            return false;
        };
        // Split on the first colon only: passwords may contain ':'.
        let Some(colon) = decoded.iter().position(|&b| b == b':') else {
            return false;
        };
        let (username, password) = (&decoded[..colon], &decoded[colon + 1..]);
        username == self.credential.username.as_bytes()
            && password == self.credential.password.as_bytes()
    }
}
