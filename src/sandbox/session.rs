//! # Sessions
//!
//! Process-wide storage behind the `session` object scripts see. A session is
//! addressed by its Environment, the Environment's session name (also the
//! cookie name) and the id carried in that cookie. Two APIs answering on the
//! same host never see each other's sessions, even with the same cookie.

use dashmap::DashMap;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

use crate::core::types::Id;

type SessionKey = (Id, String, String);

#[derive(Debug, Clone)]
struct SessionEntry {
    data: Value,
    touched: Instant,
}

/// The session bound to one request
#[derive(Debug, Clone, PartialEq)]
pub struct SessionHandle {
    pub environment_id: Id,
    pub name: String,
    pub id: String,
    pub data: Value,
    /// No cookie was presented; the response must set one
    pub is_new: bool,
}

impl SessionHandle {
    /// `Set-Cookie` value carrying this session's id
    pub fn set_cookie(&self) -> String {
        format!("{}={}; Path=/; HttpOnly", self.name, self.id)
    }

    /// Arguments for the `AP.Session` constructor
    pub fn script_value(&self) -> Value {
        json!({
            "name": self.name,
            "id": self.id,
            "data": self.data,
        })
    }
}

pub struct SessionStore {
    sessions: DashMap<SessionKey, SessionEntry>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
        }
    }

    /// Load the session named `name` of an Environment from the request's
    /// cookies, or start a new one
    pub fn open(&self, environment_id: Id, name: &str, cookie_header: Option<&str>) -> SessionHandle {
        if let Some(id) = cookie_header.and_then(|header| cookie_value(header, name)) {
            let data = self
                .sessions
                .get(&(environment_id, name.to_string(), id.clone()))
                .filter(|entry| entry.touched.elapsed() < self.ttl)
                .map(|entry| entry.data.clone())
                .unwrap_or_else(|| json!({}));
            return SessionHandle {
                environment_id,
                name: name.to_string(),
                id,
                data,
                is_new: false,
            };
        }

        SessionHandle {
            environment_id,
            name: name.to_string(),
            id: Uuid::new_v4().to_string(),
            data: json!({}),
            is_new: true,
        }
    }

    pub fn save(&self, session: &SessionHandle) {
        self.sessions.insert(
            (session.environment_id, session.name.clone(), session.id.clone()),
            SessionEntry {
                data: session.data.clone(),
                touched: Instant::now(),
            },
        );
    }

    /// Drop sessions idle longer than the TTL
    pub fn purge_expired(&self) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, entry| entry.touched.elapsed() < self.ttl);
        let purged = before.saturating_sub(self.sessions.len());
        if purged > 0 {
            debug!(purged, "Purged expired sessions");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Value of cookie `name` in a `Cookie` header
pub fn cookie_value(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name && !value.is_empty()).then(|| value.trim_matches('"').to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_parsing() {
        let header = "theme=dark; session=abc123; other=\"q\"";
        assert_eq!(cookie_value(header, "session"), Some("abc123".to_string()));
        assert_eq!(cookie_value(header, "other"), Some("q".to_string()));
        assert_eq!(cookie_value(header, "missing"), None);
        assert_eq!(cookie_value("session=", "session"), None);
    }

    #[test]
    fn test_new_session_then_resume() {
        let store = SessionStore::new(Duration::from_secs(60));
        let mut session = store.open(1, "sid", None);
        assert!(session.is_new);
        assert_eq!(session.set_cookie(), format!("sid={}; Path=/; HttpOnly", session.id));

        session.data = json!({"count": 1});
        store.save(&session);

        let cookie = format!("sid={}", session.id);
        let resumed = store.open(1, "sid", Some(&cookie));
        assert!(!resumed.is_new);
        assert_eq!(resumed.data, json!({"count": 1}));
    }

    #[test]
    fn test_sessions_are_scoped_by_name() {
        let store = SessionStore::new(Duration::from_secs(60));
        let mut session = store.open(1, "a", None);
        session.data = json!({"x": true});
        store.save(&session);

        let cookie = format!("b={}", session.id);
        assert_eq!(store.open(1, "b", Some(&cookie)).data, json!({}));
    }

    #[test]
    fn test_sessions_are_scoped_by_environment() {
        let store = SessionStore::new(Duration::from_secs(60));
        let mut session = store.open(1, "session", None);
        session.data = json!({"owner": "first"});
        store.save(&session);

        let cookie = format!("session={}", session.id);
        let other = store.open(2, "session", Some(&cookie));
        assert!(!other.is_new);
        assert_eq!(other.data, json!({}));
        assert_eq!(store.open(1, "session", Some(&cookie)).data, json!({"owner": "first"}));
    }

    #[test]
    fn test_expired_sessions_are_purged() {
        let store = SessionStore::new(Duration::from_millis(0));
        store.save(&store.open(1, "sid", None));
        assert_eq!(store.purge_expired(), 1);
        assert!(store.is_empty());
    }
}
