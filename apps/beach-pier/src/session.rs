use std::collections::HashMap;
use std::time::Duration;

use metrics::gauge;
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use pier_proto::AuthPayload;
use tokio::time::Instant;
use tracing::{debug, info};

pub const SESSION_ID_LEN: usize = 32;
pub const UPLINK_KEY_HEADER: &str = "X-Uplink-Key";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub cookie_name: String,
    pub query_param: String,
    pub ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "session".into(),
            query_param: "session".into(),
            ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Identity material for one end user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub encrypted_data: Option<String>,
    pub uplink_key: Option<String>,
    pub authenticated: bool,
    pub last_activity: Instant,
}

/// A session id candidate plus the opaque blob that followed it, if any.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionToken {
    pub session_id: String,
    pub encrypted_data: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenSource {
    Cookie,
    Query,
}

impl TokenSource {
    fn label(self) -> &'static str {
        match self {
            TokenSource::Cookie => "cookie",
            TokenSource::Query => "query",
        }
    }
}

pub fn is_valid_session_id(candidate: &str) -> bool {
    candidate.len() == SESSION_ID_LEN
        && candidate
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

/// Splits a decoded value on its first `=` into an id candidate and blob.
fn parse_token(raw: &str) -> Option<SessionToken> {
    let decoded = percent_decode_str(raw).decode_utf8().ok()?;
    let (candidate, blob) = match decoded.split_once('=') {
        Some((id, rest)) => (id, Some(rest.to_string())),
        None => (decoded.as_ref(), None),
    };
    if !is_valid_session_id(candidate) {
        return None;
    }
    Some(SessionToken {
        session_id: candidate.to_string(),
        encrypted_data: blob,
    })
}

pub fn token_from_cookie(header: &str, cookie_name: &str) -> Option<SessionToken> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| name.trim() == cookie_name)
        .and_then(|(_, value)| parse_token(value.trim().trim_matches('"')))
}

pub fn token_from_query(query: &str, param: &str) -> Option<SessionToken> {
    query
        .trim_start_matches('?')
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| *name == param)
        .and_then(|(_, value)| parse_token(value))
}

/// Derives and caches per-user session tokens.
///
/// The cookie wins over the query parameter. Either source must yield a
/// 32-character `[A-Z0-9]` id or it is treated as absent.
#[derive(Debug)]
pub struct SessionExtractor {
    config: SessionConfig,
    sessions: HashMap<String, Session>,
}

impl SessionExtractor {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn extract(
        &mut self,
        cookie_header: Option<&str>,
        query: Option<&str>,
        now: Instant,
    ) -> Option<String> {
        let (token, source) = cookie_header
            .and_then(|header| token_from_cookie(header, &self.config.cookie_name))
            .map(|token| (token, TokenSource::Cookie))
            .or_else(|| {
                query
                    .and_then(|q| token_from_query(q, &self.config.query_param))
                    .map(|token| (token, TokenSource::Query))
            })?;

        debug!(
            session_id = %token.session_id,
            source = source.label(),
            "extracted session token"
        );
        Some(self.upsert(token, now))
    }

    fn upsert(&mut self, token: SessionToken, now: Instant) -> String {
        let SessionToken {
            session_id,
            encrypted_data,
        } = token;
        let session = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| Session {
                session_id: session_id.clone(),
                encrypted_data: None,
                uplink_key: None,
                authenticated: false,
                last_activity: now,
            });
        session.last_activity = now;
        if encrypted_data.is_some() {
            session.encrypted_data = encrypted_data;
        }
        gauge!("pier_sessions_cached", self.sessions.len() as f64);
        session_id
    }

    /// Applies an `AUTH` frame. Returns the session id when the token is usable.
    pub fn record_auth(&mut self, auth: &AuthPayload, now: Instant) -> Option<String> {
        let token = parse_token(&auth.session_token)?;
        let session_id = self.upsert(token, now);
        if let Some(session) = self.sessions.get_mut(&session_id) {
            if auth.uplink_key.is_some() {
                session.uplink_key = auth.uplink_key.clone();
            }
            session.authenticated = true;
        }
        info!(session_id = %session_id, user_id = ?auth.user_id, "session authenticated");
        Some(session_id)
    }

    /// Refreshes `last_activity` for a session seen on the wire.
    pub fn touch(&mut self, session_id: &str, now: Instant) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.last_activity = now;
        }
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    /// Headers replayed toward the backend when a link dials on behalf of a session.
    pub fn backend_headers(&self, session_id: Option<&str>) -> Vec<(String, String)> {
        let Some(session) = session_id.and_then(|id| self.sessions.get(id)) else {
            return Vec::new();
        };
        let value = match &session.encrypted_data {
            Some(blob) => format!("{}={}", session.session_id, blob),
            None => session.session_id.clone(),
        };
        let mut headers = vec![(
            "Cookie".to_string(),
            format!(
                "{}={}",
                self.config.cookie_name,
                utf8_percent_encode(&value, NON_ALPHANUMERIC)
            ),
        )];
        if let Some(key) = &session.uplink_key {
            headers.push((UPLINK_KEY_HEADER.to_string(), key.clone()));
        }
        headers
    }

    /// Evicts sessions idle past the TTL.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let ttl = self.config.ttl;
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| now.saturating_duration_since(session.last_activity) <= ttl);
        let evicted = before - self.sessions.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.sessions.len(), "expired idle sessions");
            gauge!("pier_sessions_cached", self.sessions.len() as f64);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
