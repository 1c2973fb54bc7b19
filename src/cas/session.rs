//! Session contract consumed by the CAS filter
//!
//! The filter only creates sessions, locates them by cookie, reads and writes
//! the `user` value and transmits/closes them. Storage, expiry and locking
//! belong to the `Sessions` implementation.

use axum::http::{header::SET_COOKIE, HeaderMap, HeaderValue};
use axum::response::Response;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use std::time::{Duration, Instant};

use super::helpers::{extract_cookie, session_hash};

/// How the session identifier travels to the browser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieSettings {
    pub name: String,
    pub max_age: Duration,
    /// None = host-only cookie
    pub domain: Option<String>,
    pub secure: bool,
}

impl CookieSettings {
    pub fn new(name: impl Into<String>, max_age: Duration) -> Self {
        Self {
            name: name.into(),
            max_age,
            domain: None,
            secure: false,
        }
    }

    pub fn domain(mut self, domain: Option<String>) -> Self {
        self.domain = domain;
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// `Set-Cookie` value carrying a session id
    pub fn header(&self, id: &str) -> String {
        let domain = match &self.domain {
            Some(domain) => format!("; Domain={}", domain),
            None => String::new(),
        };
        format!(
            "{}={}; HttpOnly; Path=/; Max-Age={}; SameSite=Lax{}{}",
            self.name,
            id,
            self.max_age.as_secs(),
            domain,
            if self.secure { "; Secure" } else { "" }
        )
    }

    /// Appends the session cookie to a response
    pub fn apply(&self, id: &str, response: &mut Response) {
        match HeaderValue::from_str(&self.header(id)) {
            Ok(value) => {
                response.headers_mut().append(SET_COOKIE, value);
            }
            Err(e) => tracing::error!(
                error = %e,
                cookie = %self.name,
                "Failed to create session cookie header - check COOKIE_DOMAIN"
            ),
        }
    }
}

/// One session, as handed out by a `Sessions` store
pub trait Session: Send + Sync + 'static {
    fn id(&self) -> &str;

    /// False once destroyed or expired
    fn valid(&self) -> bool;

    fn register(&mut self, key: &str, value: Value);

    fn value(&self, key: &str) -> Option<Value>;

    fn destroy(&mut self);

    /// Sends the session identifier along with the response
    fn transmit(&mut self, response: &mut Response);

    /// Releases store-side resources held by this handle. Must be idempotent.
    fn close(&mut self);
}

/// Session store
pub trait Sessions: Send + Sync + 'static {
    type Session: Session;

    fn cookie(&self) -> &CookieSettings;

    fn create(&self) -> impl Future<Output = anyhow::Result<Self::Session>> + Send;

    /// Opens a session by id; `None` if the store does not know it
    fn open(&self, id: &str) -> impl Future<Output = anyhow::Result<Option<Self::Session>>> + Send;

    /// Session referenced by the request cookie, if it exists and is valid
    fn locate(
        &self,
        headers: &HeaderMap,
    ) -> impl Future<Output = anyhow::Result<Option<Self::Session>>> + Send {
        let id = extract_cookie(headers, &self.cookie().name);
        async move {
            let Some(id) = id else {
                return Ok(None);
            };

            match self.open(&id).await? {
                Some(session) if session.valid() => Ok(Some(session)),
                Some(mut session) => {
                    tracing::debug!(session_hash = %session_hash(&id), "Session no longer valid");
                    session.close();
                    Ok(None)
                }
                None => {
                    tracing::debug!(session_hash = %session_hash(&id), "Session not found");
                    Ok(None)
                }
            }
        }
    }
}

/// Closes the wrapped session when dropped, including while unwinding
pub struct SessionGuard<T: Session>(T);

impl<T: Session> SessionGuard<T> {
    pub fn new(session: T) -> Self {
        SessionGuard(session)
    }
}

impl<T: Session> Deref for SessionGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: Session> DerefMut for SessionGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T: Session> Drop for SessionGuard<T> {
    fn drop(&mut self) {
        self.0.close();
    }
}

// =============================================================================
// In-memory store
// =============================================================================

const ID_LENGTH: usize = 32;

struct Entry {
    values: Map<String, Value>,
    /// None when the max age reaches past what `Instant` can represent
    expires: Option<Instant>,
    destroyed: bool,
    open_handles: usize,
}

impl Entry {
    fn valid(&self) -> bool {
        !self.destroyed && self.expires.map_or(true, |expires| Instant::now() < expires)
    }
}

struct Store {
    cookie: CookieSettings,
    entries: RwLock<HashMap<String, Entry>>,
}

impl Store {
    fn entries(&self) -> RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Process-local session store
///
/// Sessions expire after the cookie's max age. Suitable for a single
/// instance; use a shared store behind the `Sessions` trait otherwise.
#[derive(Clone)]
pub struct MemorySessions {
    store: Arc<Store>,
}

impl MemorySessions {
    pub fn new(cookie: CookieSettings) -> Self {
        Self {
            store: Arc::new(Store {
                cookie,
                entries: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Ids of all stored sessions, including invalid ones not yet purged
    pub fn ids(&self) -> Vec<String> {
        self.store.entries().keys().cloned().collect()
    }

    /// Handles opened on a session and not closed yet
    pub fn open_handles(&self, id: &str) -> usize {
        self.store
            .entries()
            .get(id)
            .map(|entry| entry.open_handles)
            .unwrap_or(0)
    }

    fn handle(&self, id: String) -> MemorySession {
        MemorySession {
            id,
            store: Arc::clone(&self.store),
            closed: false,
        }
    }
}

impl Sessions for MemorySessions {
    type Session = MemorySession;

    fn cookie(&self) -> &CookieSettings {
        &self.store.cookie
    }

    async fn create(&self) -> anyhow::Result<MemorySession> {
        let id: String = std::iter::repeat_with(fastrand::alphanumeric)
            .take(ID_LENGTH)
            .collect();

        {
            let mut entries = self.store.entries();
            entries.retain(|_, entry| entry.valid() || entry.open_handles > 0);
            entries.insert(
                id.clone(),
                Entry {
                    values: Map::new(),
                    expires: Instant::now().checked_add(self.store.cookie.max_age),
                    destroyed: false,
                    open_handles: 1,
                },
            );
            tracing::debug!(
                session_hash = %session_hash(&id),
                stored_sessions = entries.len(),
                "Session created"
            );
        }

        Ok(self.handle(id))
    }

    async fn open(&self, id: &str) -> anyhow::Result<Option<MemorySession>> {
        let found = match self.store.entries().get_mut(id) {
            Some(entry) => {
                entry.open_handles += 1;
                true
            }
            None => false,
        };

        Ok(found.then(|| self.handle(id.to_string())))
    }
}

pub struct MemorySession {
    id: String,
    store: Arc<Store>,
    closed: bool,
}

impl Session for MemorySession {
    fn id(&self) -> &str {
        &self.id
    }

    fn valid(&self) -> bool {
        self.store
            .entries()
            .get(&self.id)
            .is_some_and(Entry::valid)
    }

    fn register(&mut self, key: &str, value: Value) {
        if let Some(entry) = self.store.entries().get_mut(&self.id) {
            entry.values.insert(key.to_string(), value);
        }
    }

    fn value(&self, key: &str) -> Option<Value> {
        self.store
            .entries()
            .get(&self.id)
            .and_then(|entry| entry.values.get(key).cloned())
    }

    fn destroy(&mut self) {
        if let Some(entry) = self.store.entries().get_mut(&self.id) {
            entry.destroyed = true;
            entry.values.clear();
        }
    }

    fn transmit(&mut self, response: &mut Response) {
        self.store.cookie.apply(&self.id, response);
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(entry) = self.store.entries().get_mut(&self.id) {
            entry.open_handles = entry.open_handles.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sessions() -> MemorySessions {
        MemorySessions::new(CookieSettings::new("session", Duration::from_secs(3600)))
    }

    fn cookie_headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("cookie", HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_cookie_header_host_only() {
        let cookie = CookieSettings::new("session", Duration::from_secs(60));
        assert_eq!(
            cookie.header("abc"),
            "session=abc; HttpOnly; Path=/; Max-Age=60; SameSite=Lax"
        );
    }

    #[test]
    fn test_cookie_header_domain_and_secure() {
        let cookie = CookieSettings::new("sid", Duration::from_secs(60))
            .domain(Some(".example.com".to_string()))
            .secure(true);
        assert_eq!(
            cookie.header("abc"),
            "sid=abc; HttpOnly; Path=/; Max-Age=60; SameSite=Lax; Domain=.example.com; Secure"
        );
    }

    #[tokio::test]
    async fn test_create_register_and_reopen() {
        let sessions = sessions();
        let mut session = sessions.create().await.unwrap();
        session.register("user", json!({"username": "test"}));
        let id = session.id().to_string();
        session.close();

        assert_eq!(id.len(), ID_LENGTH);
        let reopened = sessions.open(&id).await.unwrap().unwrap();
        assert_eq!(reopened.value("user"), Some(json!({"username": "test"})));
        assert!(reopened.valid());
    }

    #[tokio::test]
    async fn test_locate_by_cookie() {
        let sessions = sessions();
        let session = sessions.create().await.unwrap();
        let headers = cookie_headers(&format!("other=1; session={}", session.id()));

        let located = sessions.locate(&headers).await.unwrap();
        assert_eq!(located.map(|s| s.id().to_string()), Some(session.id().to_string()));
    }

    #[tokio::test]
    async fn test_locate_unknown_id() {
        let located = sessions()
            .locate(&cookie_headers("session=@does.not.exist@"))
            .await
            .unwrap();
        assert!(located.is_none());
    }

    #[tokio::test]
    async fn test_locate_destroyed_session_releases_handle() {
        let sessions = sessions();
        let mut session = sessions.create().await.unwrap();
        session.destroy();
        session.close();
        let id = session.id().to_string();

        let located = sessions
            .locate(&cookie_headers(&format!("session={}", id)))
            .await
            .unwrap();
        assert!(located.is_none());
        assert_eq!(sessions.open_handles(&id), 0);
    }

    #[tokio::test]
    async fn test_expired_session_is_invalid() {
        let sessions = MemorySessions::new(CookieSettings::new("session", Duration::ZERO));
        let session = sessions.create().await.unwrap();
        assert!(!session.valid());
    }

    #[tokio::test]
    async fn test_unrepresentable_max_age_never_expires() {
        let sessions = MemorySessions::new(CookieSettings::new("session", Duration::from_secs(u64::MAX)));
        let mut session = sessions.create().await.unwrap();
        assert!(session.valid());

        let mut response = Response::new(axum::body::Body::empty());
        session.transmit(&mut response);
        let cookie = response.headers().get(SET_COOKIE).unwrap().to_str().unwrap();
        assert!(cookie.contains(&format!("Max-Age={}", u64::MAX)));
    }

    #[tokio::test]
    async fn test_guard_closes_on_drop() {
        let sessions = sessions();
        let session = sessions.create().await.unwrap();
        let id = session.id().to_string();
        assert_eq!(sessions.open_handles(&id), 1);

        {
            let guard = SessionGuard::new(session);
            assert!(guard.valid());
        }
        assert_eq!(sessions.open_handles(&id), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let sessions = sessions();
        let mut first = sessions.create().await.unwrap();
        let id = first.id().to_string();
        let mut second = sessions.open(&id).await.unwrap().unwrap();
        assert_eq!(sessions.open_handles(&id), 2);

        first.close();
        first.close();
        assert_eq!(sessions.open_handles(&id), 1);
        second.close();
        assert_eq!(sessions.open_handles(&id), 0);
    }

    #[tokio::test]
    async fn test_transmit_sets_cookie() {
        let sessions = sessions();
        let mut session = sessions.create().await.unwrap();
        let mut response = Response::new(axum::body::Body::empty());
        session.transmit(&mut response);

        let cookie = response.headers().get(SET_COOKIE).unwrap().to_str().unwrap();
        assert!(cookie.starts_with(&format!("session={};", session.id())));
        assert!(cookie.contains("Max-Age=3600"));
    }
}
