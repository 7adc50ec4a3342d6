//! Session state owned by the session provider.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Authentication material obtained from the portal.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SessionCredentials {
    pub cookies: BTreeMap<String, String>,
}

impl SessionCredentials {
    /// Value for a `Cookie` request header, if any cookie is held.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

// Never print secrets into logs.
impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("cookies", &self.cookies.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Health of the held session. `Expired` means it outlived the configured
/// maximum age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionHealth {
    Valid,
    Expired,
    Blocked,
}

/// Full session state. Only the session provider holds this.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub credentials: Arc<SessionCredentials>,
    pub health: SessionHealth,
    pub refreshed_at: DateTime<Utc>,
    pub generation: u64,
}

/// Opaque handle handed to fetchers.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    credentials: Arc<SessionCredentials>,
    generation: u64,
}

impl SessionHandle {
    pub(crate) fn new(credentials: Arc<SessionCredentials>, generation: u64) -> Self {
        Self {
            credentials,
            generation,
        }
    }

    /// Which authentication round produced this handle.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Attach the session to an outgoing request.
    pub fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.credentials.cookie_header() {
            Some(cookie) => request.header(reqwest::header::COOKIE, cookie),
            None => request,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_header() {
        let mut creds = SessionCredentials::default();
        assert_eq!(creds.cookie_header(), None);
        creds.cookies.insert("JSESSIONID".into(), "abc".into());
        creds.cookies.insert("lang".into(), "es".into());
        assert_eq!(creds.cookie_header().as_deref(), Some("JSESSIONID=abc; lang=es"));
    }

    #[test]
    fn test_debug_redacts_values() {
        let mut creds = SessionCredentials::default();
        creds.cookies.insert("JSESSIONID".into(), "super-secret".into());
        let printed = format!("{creds:?}");
        assert!(printed.contains("JSESSIONID"));
        assert!(!printed.contains("super-secret"));
    }
}
