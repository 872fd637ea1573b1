// src/auth.rs

//! Session authentication for the controller API
//!
//! Requests carry an opaque token either as a `session_token` cookie or as
//! `Authorization: Bearer <token>`. Tokens resolve to a [`Session`] through
//! a [`SessionStore`]. The configured admin token is stored as a session
//! that never expires; `POST /api/auth/login` trades it for a short-lived
//! cookie session.
//!
//! Expired sessions are rejected on lookup and removed in bulk by a
//! background sweep ([`spawn_sweeper`]).

use crate::api::{ApiError, ApiProblem};
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Cookie carrying the session token
pub const SESSION_COOKIE: &str = "session_token";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub identity: String,
    /// `None` never expires
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn permanent(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            expires_at: None,
        }
    }

    pub fn expiring(identity: impl Into<String>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(12));
        Self {
            identity: identity.into(),
            expires_at: Some(Utc::now() + ttl),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Token to session lookup
pub trait SessionStore: Send + Sync {
    /// The live session for `token`
    fn get(&self, token: &str) -> Option<Session>;

    fn insert(&self, token: String, session: Session);

    fn remove(&self, token: &str) -> bool;

    /// Drop every expired session, returning how many went
    fn sweep_expired(&self) -> usize;

    /// Create a session under a fresh random token
    fn issue(&self, session: Session) -> String {
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.insert(token.clone(), session);
        token
    }
}

/// In-memory sessions; lost on restart
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, Session>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, token: &str) -> Option<Session> {
        let session = self.sessions.get(token)?.clone();
        if session.is_expired(Utc::now()) {
            None
        } else {
            Some(session)
        }
    }

    fn insert(&self, token: String, session: Session) {
        self.sessions.insert(token, session);
    }

    fn remove(&self, token: &str) -> bool {
        self.sessions.remove(token).is_some()
    }

    fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_expired(now));
        before.saturating_sub(self.sessions.len())
    }
}

/// Sweep expired sessions every `interval`
pub fn spawn_sweeper(store: Arc<dyn SessionStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = store.sweep_expired();
            if removed > 0 {
                info!("Swept {} expired session(s)", removed);
            }
        }
    })
}

/// Token from a bearer header or the session cookie
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok())
        && let Some(token) = value.strip_prefix("Bearer ")
    {
        let token = token.trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }

    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

/// Middleware rejecting requests without a live session
pub async fn require_session(
    State(sessions): State<Arc<dyn SessionStore>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(token) = token_from_headers(request.headers()) else {
        return ApiError(ApiProblem::unauthorized("Authentication required")).into_response();
    };

    match sessions.get(&token) {
        Some(session) => {
            debug!("{} {} as {}", request.method(), request.uri().path(), session.identity);
            next.run(request).await
        }
        None => ApiError(ApiProblem::unauthorized("Session expired or invalid")).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_expired_sessions_rejected_and_swept() {
        let store = MemorySessionStore::new();
        store.insert("admin".into(), Session::permanent("admin"));
        store.insert(
            "old".into(),
            Session {
                identity: "web".into(),
                expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
            },
        );
        let fresh = store.issue(Session::expiring("web", Duration::from_secs(60)));

        assert!(store.get("old").is_none());
        assert!(store.get("admin").is_some());
        assert_eq!(store.get(&fresh).unwrap().identity, "web");

        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_remove() {
        let store = MemorySessionStore::new();
        store.insert("t".into(), Session::permanent("admin"));
        assert!(store.remove("t"));
        assert!(!store.remove("t"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_token_from_bearer_and_cookie() {
        let mut headers = HeaderMap::new();
        assert!(token_from_headers(&headers).is_none());

        headers.insert(COOKIE, HeaderValue::from_static("theme=dark; session_token=abc123"));
        assert_eq!(token_from_headers(&headers).as_deref(), Some("abc123"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer xyz"));
        assert_eq!(token_from_headers(&headers).as_deref(), Some("xyz"));
    }

    #[test]
    fn test_empty_cookie_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("session_token="));
        assert!(token_from_headers(&headers).is_none());
    }
}
