// src/services/session.rs

//! Session provider.
//!
//! Each target worker owns one `SessionProvider`. It hands out a valid
//! session, re-authenticates when the held one is stale, expired or blocked,
//! and never hammers the portal's login flow: every authentication attempt
//! goes through a host limiter shared by all workers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;

use crate::error::{AppError, Result};
use crate::models::{
    AuthMethod, SessionCredentials, SessionHandle, SessionHealth, SessionState, Target,
};
use crate::pipeline::backoff::RetryPolicy;
use crate::pipeline::rate_limit::HostRateLimiter;
use crate::services::fetcher::BlockDetector;
use crate::utils::http::{is_block_status, is_transient_status};

/// Obtains fresh credentials from the portal.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, target: &Target) -> Result<SessionCredentials>;

    /// Whether `authenticate` sends a request to the portal.
    fn contacts_portal(&self) -> bool {
        true
    }
}

/// For public portals that need no session.
#[derive(Debug, Default)]
pub struct AnonymousAuthenticator;

#[async_trait]
impl Authenticator for AnonymousAuthenticator {
    async fn authenticate(&self, _target: &Target) -> Result<SessionCredentials> {
        Ok(SessionCredentials::default())
    }

    fn contacts_portal(&self) -> bool {
        false
    }
}

/// Loads an entry page and keeps the cookies the portal sets.
pub struct CookieAuthenticator {
    client: Client,
    url: Option<String>,
    detector: Arc<BlockDetector>,
}

impl CookieAuthenticator {
    /// `url` defaults to the target endpoint.
    pub fn new(client: Client, url: Option<String>, detector: Arc<BlockDetector>) -> Self {
        Self {
            client,
            url,
            detector,
        }
    }

    /// Parse `name=value` pairs out of `Set-Cookie` header values.
    pub fn harvest<'a>(values: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, String> {
        values
            .into_iter()
            .filter_map(|raw| {
                let pair = raw.split(';').next()?.trim();
                let (name, value) = pair.split_once('=')?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                Some((name.to_string(), value.trim().to_string()))
            })
            .collect()
    }
}

#[async_trait]
impl Authenticator for CookieAuthenticator {
    async fn authenticate(&self, target: &Target) -> Result<SessionCredentials> {
        let url = self.url.as_deref().unwrap_or(&target.endpoint);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::transient(&target.name, e))?;

        let status = response.status();
        if is_block_status(status) {
            return Err(AppError::blocked(&target.name, format!("login returned HTTP {status}")));
        }
        if is_transient_status(status) {
            return Err(AppError::transient(&target.name, format!("login returned HTTP {status}")));
        }

        let cookies = Self::harvest(
            response
                .headers()
                .get_all(reqwest::header::SET_COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok()),
        );

        let body = response
            .text()
            .await
            .map_err(|e| AppError::transient(&target.name, e))?;
        if let Some(marker) = self.detector.detect(&body) {
            return Err(AppError::blocked(
                &target.name,
                format!("login page challenge (matched '{marker}')"),
            ));
        }
        if cookies.is_empty() {
            return Err(AppError::transient(&target.name, "login set no cookies"));
        }

        Ok(SessionCredentials { cookies })
    }
}

/// Pick the authenticator for a target.
pub fn build_authenticator(
    target: &Target,
    client: Client,
    detector: Arc<BlockDetector>,
) -> Arc<dyn Authenticator> {
    match &target.auth {
        AuthMethod::Anonymous => Arc::new(AnonymousAuthenticator),
        AuthMethod::Cookie { url } => {
            Arc::new(CookieAuthenticator::new(client, url.clone(), detector))
        }
    }
}

/// Hands out sessions for one target.
pub struct SessionProvider {
    target: Arc<Target>,
    host: String,
    authenticator: Arc<dyn Authenticator>,
    limiter: Arc<HostRateLimiter>,
    retry: RetryPolicy,
    max_age: Duration,
    state: Option<SessionState>,
    generation: u64,
}

impl SessionProvider {
    pub fn new(
        target: Arc<Target>,
        authenticator: Arc<dyn Authenticator>,
        limiter: Arc<HostRateLimiter>,
        retry: RetryPolicy,
        max_age: Duration,
    ) -> Result<Self> {
        let host = target.host()?;
        Ok(Self {
            target,
            host,
            authenticator,
            limiter,
            retry,
            max_age,
            state: None,
            generation: 0,
        })
    }

    /// Health of the held session, if one was ever obtained.
    pub fn health(&self) -> Option<SessionHealth> {
        self.state.as_ref().map(|s| self.health_of(s))
    }

    fn health_of(&self, state: &SessionState) -> SessionHealth {
        if state.health != SessionHealth::Valid {
            return state.health;
        }
        let age = Utc::now()
            .signed_duration_since(state.refreshed_at)
            .to_std()
            .unwrap_or_default();
        if age < self.max_age {
            SessionHealth::Valid
        } else {
            SessionHealth::Expired
        }
    }

    /// Return a valid session, authenticating if needed.
    ///
    /// Fails with `AuthExhausted` once the retry budget is spent.
    pub async fn acquire(&mut self) -> Result<SessionHandle> {
        if let Some(state) = &self.state {
            let health = self.health_of(state);
            if health == SessionHealth::Valid {
                return Ok(SessionHandle::new(
                    Arc::clone(&state.credentials),
                    state.generation,
                ));
            }
            log::debug!(
                "[{}] session generation {} is {:?}, re-authenticating",
                self.target.name,
                state.generation,
                health
            );
        }

        let mut last_error = String::new();
        for attempt in 1..=self.retry.max_attempts {
            if self.authenticator.contacts_portal() {
                self.limiter.acquire(&self.host).await;
            }
            match self.authenticator.authenticate(&self.target).await {
                Ok(credentials) => {
                    self.generation += 1;
                    let credentials = Arc::new(credentials);
                    self.state = Some(SessionState {
                        credentials: Arc::clone(&credentials),
                        health: SessionHealth::Valid,
                        refreshed_at: Utc::now(),
                        generation: self.generation,
                    });
                    if self.authenticator.contacts_portal() {
                        log::info!(
                            "[{}] authenticated (generation {}, attempt {})",
                            self.target.name,
                            self.generation,
                            attempt
                        );
                    }
                    return Ok(SessionHandle::new(credentials, self.generation));
                }
                Err(e) => {
                    log::warn!(
                        "[{}] authentication attempt {}/{} failed: {}",
                        self.target.name,
                        attempt,
                        self.retry.max_attempts,
                        e
                    );
                    last_error = e.to_string();
                    if attempt < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.delay_after(attempt)).await;
                    }
                }
            }
        }

        Err(AppError::AuthExhausted {
            target: self.target.name.clone(),
            attempts: self.retry.max_attempts,
            last_error,
        })
    }

    /// Mark the held session unusable. The next `acquire` re-authenticates.
    pub fn invalidate(&mut self, health: SessionHealth, reason: &str) {
        if let Some(state) = &mut self.state {
            log::info!(
                "[{}] session generation {} marked {:?}: {}",
                self.target.name,
                state.generation,
                health,
                reason
            );
            state.health = health;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails a fixed number of times, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Authenticator for Flaky {
        async fn authenticate(&self, target: &Target) -> Result<SessionCredentials> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(AppError::transient(&target.name, "connection reset"));
            }
            let mut creds = SessionCredentials::default();
            creds.cookies.insert("JSESSIONID".into(), format!("s{n}"));
            Ok(creds)
        }
    }

    fn target() -> Arc<Target> {
        Arc::new(
            toml::from_str(
                r#"
                name = "madrid"
                endpoint = "https://citas.example.es/slots"
                [layout]
                kind = "json"
                "#,
            )
            .unwrap(),
        )
    }

    fn provider(auth: Arc<Flaky>, max_attempts: u32) -> SessionProvider {
        SessionProvider::new(
            target(),
            auth,
            Arc::new(HostRateLimiter::new(Duration::from_secs(30))),
            RetryPolicy::new(max_attempts, 100, 1000),
            Duration::from_secs(900),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_reuses_fresh_session() {
        let auth = Arc::new(Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let mut provider = provider(Arc::clone(&auth), 3);
        let first = provider.acquire().await.unwrap();
        let second = provider.acquire().await.unwrap();
        assert_eq!(first.generation(), 1);
        assert_eq!(second.generation(), 1);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_reauth() {
        let auth = Arc::new(Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let mut provider = provider(Arc::clone(&auth), 3);
        provider.acquire().await.unwrap();
        provider.invalidate(SessionHealth::Blocked, "403");
        assert_eq!(provider.health(), Some(SessionHealth::Blocked));

        let handle = provider.acquire().await.unwrap();
        assert_eq!(handle.generation(), 2);
        assert_eq!(provider.health(), Some(SessionHealth::Valid));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aged_session_is_expired_and_renewed() {
        let auth = Arc::new(Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let mut provider = SessionProvider::new(
            target(),
            Arc::clone(&auth) as Arc<dyn Authenticator>,
            Arc::new(HostRateLimiter::new(Duration::ZERO)),
            RetryPolicy::new(3, 100, 1000),
            Duration::ZERO,
        )
        .unwrap();
        provider.acquire().await.unwrap();
        assert_eq!(provider.health(), Some(SessionHealth::Expired));

        let handle = provider.acquire().await.unwrap();
        assert_eq!(handle.generation(), 2);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let auth = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let mut provider = provider(Arc::clone(&auth), 3);
        let handle = provider.acquire().await.unwrap();
        assert_eq!(handle.generation(), 1);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_after_budget() {
        let auth = Arc::new(Flaky {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let mut provider = provider(Arc::clone(&auth), 3);
        let err = provider.acquire().await.unwrap_err();
        assert_eq!(err.kind(), "auth_exhausted");
        assert_eq!(auth.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_attempts_respect_host_interval() {
        let auth = Arc::new(Flaky {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let mut provider = provider(auth, 3);
        let start = tokio::time::Instant::now();
        provider.acquire().await.unwrap_err();
        // Three attempts on one host are two 30s intervals apart at minimum.
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[test]
    fn test_harvest_set_cookie() {
        let cookies = CookieAuthenticator::harvest([
            "JSESSIONID=abc123; Path=/; HttpOnly",
            "lang=es",
            "=orphan",
            "garbage",
        ]);
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies.get("JSESSIONID").map(String::as_str), Some("abc123"));
    }
}
