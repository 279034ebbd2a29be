//! Authenticated session snapshots and the holder shared with the realtime
//! client.
//!
//! Sessions are acquired and refreshed by the REST layer; this module only
//! decodes the token claims the realtime layer cares about and hands out the
//! current snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

/// Errors produced while decoding a session token.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Token is not a three-segment JWT.
    #[error("malformed session token: {0}")]
    MalformedToken(&'static str),

    /// Claims segment is not valid base64url.
    #[error("decode token claims: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Claims segment is not the expected JSON object.
    #[error("parse token claims: {0}")]
    Claims(#[from] serde_json::Error),
}

#[derive(Debug, Default, Deserialize)]
struct TokenClaims {
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    uid: Option<String>,
    #[serde(default)]
    usn: Option<String>,
    #[serde(default)]
    vrs: BTreeMap<String, String>,
}

/// Immutable snapshot of an authenticated session.
///
/// A refresh produces a new `Session`; existing snapshots are never mutated.
#[derive(Clone, Debug)]
pub struct Session {
    token: SecretString,
    refresh_token: Option<SecretString>,
    created: bool,
    user_id: String,
    username: String,
    vars: BTreeMap<String, String>,
    expires_at: Option<DateTime<Utc>>,
    refresh_expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Builds a session from tokens returned by an authenticate call.
    ///
    /// `created` reports whether the account was created by that call.
    pub fn new(
        token: impl Into<String>,
        refresh_token: Option<String>,
        created: bool,
    ) -> Result<Self, SessionError> {
        let token = token.into();
        let claims = decode_claims(&token)?;
        let refresh_expires_at = match refresh_token.as_deref() {
            Some(refresh) if !refresh.is_empty() => decode_claims(refresh)?
                .exp
                .and_then(|exp| DateTime::from_timestamp(exp, 0)),
            _ => None,
        };

        Ok(Self {
            expires_at: claims.exp.and_then(|exp| DateTime::from_timestamp(exp, 0)),
            user_id: claims.uid.unwrap_or_default(),
            username: claims.usn.unwrap_or_default(),
            vars: claims.vrs,
            token: SecretString::new(token),
            refresh_token: refresh_token
                .filter(|refresh| !refresh.is_empty())
                .map(SecretString::new),
            created,
            refresh_expires_at,
        })
    }

    /// Restores a previously persisted session from its tokens.
    pub fn restore(
        token: impl Into<String>,
        refresh_token: Option<String>,
    ) -> Result<Self, SessionError> {
        Self::new(token, refresh_token, false)
    }

    /// Authentication token used to attach the realtime socket.
    pub fn token(&self) -> &SecretString {
        &self.token
    }

    pub fn refresh_token(&self) -> Option<&SecretString> {
        self.refresh_token.as_ref()
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.is_some()
    }

    /// Whether the authenticate call that produced this session created the
    /// account.
    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Session variables embedded in the token by the server.
    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    /// Token expiry. `None` when the token carries no `exp` claim.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn refresh_expires_at(&self) -> Option<DateTime<Utc>> {
        self.refresh_expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    /// Whether the refresh token is missing or expired at `now`.
    pub fn is_refresh_expired_at(&self, now: DateTime<Utc>) -> bool {
        match (&self.refresh_token, self.refresh_expires_at) {
            (None, _) => true,
            (Some(_), Some(expires_at)) => now >= expires_at,
            (Some(_), None) => false,
        }
    }
}

fn decode_claims(token: &str) -> Result<TokenClaims, SessionError> {
    let mut segments = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(SessionError::MalformedToken("expected three dot-separated segments"));
    };

    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Thread-safe holder for the current [`Session`].
///
/// Readers always observe a complete snapshot; `replace` swaps the whole
/// session atomically. Cloning the holder shares the same slot.
#[derive(Clone, Debug)]
pub struct SessionHolder {
    current: Arc<ArcSwap<Session>>,
}

impl SessionHolder {
    pub fn new(session: Session) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(session)),
        }
    }

    /// Returns the current session snapshot.
    pub fn current(&self) -> Arc<Session> {
        self.current.load_full()
    }

    /// Replaces the session, typically after a REST refresh.
    pub fn replace(&self, session: Session) {
        self.current.store(Arc::new(session));
    }
}

/// Encodes unsigned JWT-shaped tokens for tests.
#[cfg(test)]
pub(crate) fn test_token(claims: serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.signature")
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use secrecy::ExposeSecret;
    use serde_json::json;

    use super::{test_token, Session, SessionError, SessionHolder};

    #[test]
    fn decodes_identity_and_expiry_from_claims() {
        let token = test_token(json!({
            "exp": 1_700_000_000,
            "uid": "3c01e3ee-878a-4ec4-8923-40d51a86f91f",
            "usn": "alice",
            "vrs": {"region": "eu"}
        }));
        let session = Session::new(token.clone(), None, true).expect("session");

        assert_eq!(session.user_id(), "3c01e3ee-878a-4ec4-8923-40d51a86f91f");
        assert_eq!(session.username(), "alice");
        assert_eq!(session.vars().get("region").map(String::as_str), Some("eu"));
        assert!(session.is_created());
        assert_eq!(session.token().expose_secret(), &token);
        assert_eq!(
            session.expires_at(),
            Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap())
        );
    }

    #[test]
    fn expiry_is_inclusive() {
        let session =
            Session::restore(test_token(json!({"exp": 1_000})), None).expect("session");
        let expires_at = session.expires_at().expect("exp claim");
        assert!(!session.is_expired_at(expires_at - Duration::seconds(1)));
        assert!(session.is_expired_at(expires_at));
    }

    #[test]
    fn token_without_exp_never_expires() {
        let session = Session::restore(test_token(json!({"uid": "u1"})), None).expect("session");
        assert!(session.expires_at().is_none());
        assert!(!session.is_expired());
    }

    #[test]
    fn refresh_token_expiry_is_tracked() {
        let refresh = test_token(json!({"exp": 2_000}));
        let session = Session::restore(test_token(json!({"exp": 1_000})), Some(refresh))
            .expect("session");
        assert!(session.has_refresh_token());
        let at = Utc.timestamp_opt(1_500, 0).unwrap();
        assert!(session.is_expired_at(at));
        assert!(!session.is_refresh_expired_at(at));

        let without = Session::restore(test_token(json!({"exp": 1_000})), Some(String::new()))
            .expect("session");
        assert!(!without.has_refresh_token());
        assert!(without.is_refresh_expired_at(at));
    }

    #[test]
    fn rejects_malformed_tokens() {
        assert!(matches!(
            Session::restore("not-a-jwt", None),
            Err(SessionError::MalformedToken(_))
        ));
        assert!(matches!(
            Session::restore("a.!!!.c", None),
            Err(SessionError::Base64(_))
        ));
    }

    #[test]
    fn holder_replaces_whole_snapshot() {
        let first = Session::restore(test_token(json!({"uid": "first"})), None).expect("first");
        let holder = SessionHolder::new(first);
        let shared = holder.clone();
        let before = holder.current();

        let second = Session::restore(test_token(json!({"uid": "second"})), None).expect("second");
        shared.replace(second);

        assert_eq!(before.user_id(), "first");
        assert_eq!(holder.current().user_id(), "second");
    }
}
