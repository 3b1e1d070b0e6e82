//! Adobe authentication (`authmod=adobe`)
//!
//! The server signals each step by rejecting `connect`:
//!
//! 1. `[ code=403 need auth; authmod=adobe ]`: reconnect with
//!    `?authmod=adobe&user=<user>` appended to app and tcUrl.
//! 2. `... ?reason=needauth&user=..&salt=..&challenge=..&opaque=..`:
//!    reconnect with our own challenge and the digest of the password.
//! 3. `?reason=authfailed` or `?reason=nosuchuser`: give up.
//!
//! Every step is a fresh TCP connection and handshake.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use md5::{Digest, Md5};
use url::form_urlencoded;

/// What to do after a `NetConnection.Connect.Rejected`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// The rejection is not an authentication challenge
    NotAuth,
    /// Reconnect with this query appended
    Retry(String),
    /// The server refused the credentials
    Failed(String),
}

/// Credentials plus the challenge/response exchange
#[derive(Debug, Clone)]
pub struct AdobeAuth {
    user: String,
    password: String,
}

impl AdobeAuth {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// Inspect a rejection description and pick the next step
    pub fn on_rejected(&self, description: &str) -> AuthDecision {
        if !description.contains("authmod=adobe") {
            return AuthDecision::NotAuth;
        }

        if description.contains("code=403 need auth") {
            return AuthDecision::Retry(self.initial_query());
        }

        let Some((_, query)) = description.split_once('?') else {
            return AuthDecision::Failed(description.to_string());
        };

        let mut reason = None;
        let mut salt = None;
        let mut challenge = None;
        let mut opaque = None;
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match &*key {
                "reason" => reason = Some(value.into_owned()),
                "salt" => salt = Some(value.into_owned()),
                "challenge" => challenge = Some(value.into_owned()),
                "opaque" => opaque = Some(value.into_owned()),
                _ => {}
            }
        }

        match (reason.as_deref(), salt) {
            (Some("needauth"), Some(salt)) => {
                let client_challenge = format!("{:08x}", rand::random::<u32>());
                let response = adobe_response(
                    &self.user,
                    &self.password,
                    &salt,
                    opaque.as_deref().or(challenge.as_deref()),
                    &client_challenge,
                );

                let mut query = form_urlencoded::Serializer::new(self.initial_query());
                query.append_pair("challenge", &client_challenge);
                query.append_pair("response", &response);
                if let Some(opaque) = &opaque {
                    query.append_pair("opaque", opaque);
                }
                AuthDecision::Retry(query.finish())
            }
            (Some(reason), _) => AuthDecision::Failed(reason.to_string()),
            (None, _) => AuthDecision::Failed(description.to_string()),
        }
    }

    /// `authmod=adobe&user=<user>`
    pub fn initial_query(&self) -> String {
        form_urlencoded::Serializer::new(String::new())
            .append_pair("authmod", "adobe")
            .append_pair("user", &self.user)
            .finish()
    }
}

/// `base64(md5(base64(md5(user + salt + password)) + nonce + client_challenge))`
///
/// `nonce` is the server's opaque value, or its challenge when no opaque was
/// sent.
pub fn adobe_response(
    user: &str,
    password: &str,
    salt: &str,
    nonce: Option<&str>,
    client_challenge: &str,
) -> String {
    let hash1 = STANDARD.encode(Md5::digest(format!("{user}{salt}{password}")));

    let mut hasher = Md5::new();
    hasher.update(hash1.as_bytes());
    hasher.update(nonce.unwrap_or_default().as_bytes());
    hasher.update(client_challenge.as_bytes());
    STANDARD.encode(hasher.finalize())
}
