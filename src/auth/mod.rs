//! Credentials consumed by the WebSocket client.
//!
//! The authentication subsystem itself (login, refresh, logout) lives outside
//! this crate. The client only needs to read the current session token each
//! time it opens a connection, which it does through [`CredentialProvider`].
//!
//! ## Token handling
//!
//! The token is passed to the server as the `token` query parameter of the
//! WebSocket URL. It is read fresh on every connection attempt, so a refreshed
//! token is picked up on the next reconnect, and a cleared one stops the client
//! from reconnecting anonymously. Tokens are never logged.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Source of the session token for WebSocket connections.
pub trait CredentialProvider: Send + Sync {
    /// The current session token, if any.
    fn token(&self) -> Option<String>;

    /// Whether the consumer currently holds a valid session.
    fn is_authenticated(&self) -> bool;
}

impl<T: CredentialProvider + ?Sized> CredentialProvider for Arc<T> {
    fn token(&self) -> Option<String> {
        (**self).token()
    }

    fn is_authenticated(&self) -> bool {
        (**self).is_authenticated()
    }
}

// ============================================================================
// In-memory session
// ============================================================================

#[derive(Clone)]
struct Session {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

/// Cloneable, thread-safe session holder.
///
/// Clones share the same session, so the auth layer can keep one handle and
/// hand another to the WebSocket client.
#[derive(Clone, Default)]
pub struct SessionCredentials {
    inner: Arc<RwLock<Option<Session>>>,
}

impl std::fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("authenticated", &self.is_authenticated())
            .field("expires_at", &self.expires_at())
            .finish()
    }
}

impl SessionCredentials {
    /// An empty (logged out) session.
    pub fn new() -> Self {
        Self::default()
    }

    /// A session holding `token` with no expiry.
    pub fn with_token(token: impl Into<String>) -> Self {
        let creds = Self::new();
        creds.set_token(token, None);
        creds
    }

    /// Store a new token, replacing any previous one.
    pub fn set_token(&self, token: impl Into<String>, expires_at: Option<DateTime<Utc>>) {
        *self.inner.write() = Some(Session {
            token: token.into(),
            expires_at,
        });
    }

    /// Forget the session (logout).
    pub fn clear(&self) {
        *self.inner.write() = None;
    }

    /// When the current session expires, if it has an expiry.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().as_ref().and_then(|s| s.expires_at)
    }

    fn valid_session(&self) -> Option<Session> {
        let guard = self.inner.read();
        let session = guard.as_ref()?;
        if session.token.is_empty() {
            return None;
        }
        match session.expires_at {
            Some(expiry) if Utc::now() >= expiry => None,
            _ => Some(session.clone()),
        }
    }
}

impl CredentialProvider for SessionCredentials {
    fn token(&self) -> Option<String> {
        self.valid_session().map(|s| s.token)
    }

    fn is_authenticated(&self) -> bool {
        self.valid_session().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_empty_session_is_unauthenticated() {
        let creds = SessionCredentials::new();
        assert!(!creds.is_authenticated());
        assert!(creds.token().is_none());
    }

    #[test]
    fn test_token_round_trip_and_clear() {
        let creds = SessionCredentials::with_token("jwt-abc");
        assert!(creds.is_authenticated());
        assert_eq!(creds.token().as_deref(), Some("jwt-abc"));

        creds.clear();
        assert!(!creds.is_authenticated());
        assert!(creds.token().is_none());
    }

    #[test]
    fn test_expired_session_yields_no_token() {
        let creds = SessionCredentials::new();
        creds.set_token("old", Some(Utc::now() - Duration::minutes(1)));
        assert!(!creds.is_authenticated());
        assert!(creds.token().is_none());

        creds.set_token("fresh", Some(Utc::now() + Duration::hours(1)));
        assert_eq!(creds.token().as_deref(), Some("fresh"));
    }

    #[test]
    fn test_clones_share_session() {
        let creds = SessionCredentials::new();
        let handle = creds.clone();
        creds.set_token("shared", None);
        assert_eq!(handle.token().as_deref(), Some("shared"));
    }

    #[test]
    fn test_empty_token_is_not_a_session() {
        let creds = SessionCredentials::with_token("");
        assert!(!creds.is_authenticated());
    }

    #[test]
    fn test_debug_hides_token() {
        let creds = SessionCredentials::with_token("super-secret");
        let shown = format!("{:?}", creds);
        assert!(!shown.contains("super-secret"));
        assert!(shown.contains("authenticated: true"));
    }
}
