//! Timestamp-bound HMAC credentials
//!
//! A token is `base64("username:timestamp:base64(mac)")`, or the legacy
//! `base64("timestamp:base64(mac)")`, where
//! `mac = HMAC-SHA256(secret, "smtp-tunnel-auth:[username:]timestamp")`.

use crate::protocol::AUTH_CONTEXT;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ring::hmac;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Reasons a token was refused. Never sent to the peer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,

    #[error("token timestamp outside freshness window")]
    Expired,

    #[error("unknown user")]
    UnknownUser,

    #[error("MAC mismatch")]
    BadMac,
}

/// A pre-shared key. Debug output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Vec<u8>);

impl Secret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Secret {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for Secret {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(..)")
    }
}

/// Parsed contents of an auth token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub username: Option<String>,
    pub timestamp: u64,
    mac: Vec<u8>,
}

impl AuthToken {
    /// Build a token; identical inputs always produce the same token
    pub fn generate(secret: &Secret, timestamp: u64, username: Option<&str>) -> String {
        let tag = sign(secret, username, timestamp);
        let mac = STANDARD.encode(tag.as_ref());

        let inner = match username {
            Some(user) => format!("{}:{}:{}", user, timestamp, mac),
            None => format!("{}:{}", timestamp, mac),
        };
        STANDARD.encode(inner)
    }

    /// Build a token stamped with the current time
    pub fn generate_now(secret: &Secret, username: Option<&str>) -> String {
        Self::generate(secret, unix_now(), username)
    }

    /// Decode the token structure without checking the MAC
    pub fn parse(token: &str) -> Result<Self, AuthError> {
        let raw = STANDARD
            .decode(token.trim())
            .map_err(|_| AuthError::Malformed)?;
        let text = String::from_utf8(raw).map_err(|_| AuthError::Malformed)?;

        // Split from the right so the username may itself contain ':'
        let mut parts = text.rsplitn(3, ':');
        let mac = parts.next().ok_or(AuthError::Malformed)?;
        let timestamp = parts.next().ok_or(AuthError::Malformed)?;
        let username = parts.next();

        let timestamp: u64 = timestamp.parse().map_err(|_| AuthError::Malformed)?;
        let mac = STANDARD.decode(mac).map_err(|_| AuthError::Malformed)?;

        if let Some(user) = username {
            if user.is_empty() {
                return Err(AuthError::Malformed);
            }
        }

        Ok(Self {
            username: username.map(str::to_string),
            timestamp,
            mac,
        })
    }

    /// Verify a token against the secret `lookup` returns for its username
    ///
    /// `lookup` receives `None` for legacy tokens without a username.
    /// Returns the authenticated username (empty for a legacy token).
    pub fn verify<F>(token: &str, lookup: F, max_age: u64, now: u64) -> Result<String, AuthError>
    where
        F: FnOnce(Option<&str>) -> Option<Secret>,
    {
        let parsed = Self::parse(token)?;

        if now.abs_diff(parsed.timestamp) > max_age {
            return Err(AuthError::Expired);
        }

        let username = parsed.username.as_deref();
        let message = signed_message(username, parsed.timestamp);

        match lookup(username) {
            Some(secret) => {
                let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
                hmac::verify(&key, message.as_bytes(), &parsed.mac).map_err(|_| AuthError::BadMac)?;
                Ok(parsed.username.unwrap_or_default())
            }
            None => {
                // Same work as a known user so timing does not reveal membership
                let key = hmac::Key::new(hmac::HMAC_SHA256, &[0u8; 32]);
                let _ = hmac::verify(&key, message.as_bytes(), &parsed.mac);
                Err(AuthError::UnknownUser)
            }
        }
    }

    /// [`AuthToken::verify`] against the current wall clock
    pub fn verify_now<F>(token: &str, lookup: F, max_age: u64) -> Result<String, AuthError>
    where
        F: FnOnce(Option<&str>) -> Option<Secret>,
    {
        Self::verify(token, lookup, max_age, unix_now())
    }
}

fn signed_message(username: Option<&str>, timestamp: u64) -> String {
    match username {
        Some(user) => format!("{}:{}:{}", AUTH_CONTEXT, user, timestamp),
        None => format!("{}:{}", AUTH_CONTEXT, timestamp),
    }
}

fn sign(secret: &Secret, username: Option<&str>, timestamp: u64) -> hmac::Tag {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hmac::sign(&key, signed_message(username, timestamp).as_bytes())
}

/// Seconds since the Unix epoch
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
