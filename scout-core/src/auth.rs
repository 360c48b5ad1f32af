use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::browser::{BrowserError, BrowserPage};
use crate::command::{ActionChain, Command, CommandExecutor};
use crate::config::ScoutConfig;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("browser error during auth: {0}")]
    Browser(#[from] BrowserError),
    #[error("login failed: {0}")]
    LoginFailed(String),
    #[error("token capture failed: {0}")]
    TokenCapture(String),
    #[error("token refresh failed: {0}")]
    Refresh(String),
    #[error("session lock error: {0}")]
    Lock(#[from] std::io::Error),
    #[error("refresh request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NoSession,
    LoggingIn,
    SessionValid,
    Refreshing,
    SessionInvalid,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Tokens {
    /// Refresh proactively, `slack` seconds before the recorded expiry.
    pub fn needs_refresh(&self, slack_seconds: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now() + chrono::Duration::seconds(slack_seconds) >= expires_at,
            None => false,
        }
    }
}

/// Seam for the refresh call so tests can count invocations without HTTP.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> AuthResult<Tokens>;
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    /// Epoch seconds.
    expires_at: Option<i64>,
}

pub struct HttpTokenRefresher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTokenRefresher {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> AuthResult<Tokens> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AuthError::Refresh(format!(
                "refresh endpoint returned {}",
                response.status()
            )));
        }
        let body: RefreshResponse = response.json().await?;
        Ok(Tokens {
            access_token: body.access_token,
            refresh_token: body
                .refresh_token
                .or_else(|| Some(refresh_token.to_string())),
            expires_at: body
                .expires_at
                .and_then(|epoch| DateTime::from_timestamp(epoch, 0)),
        })
    }
}

/// Releases the advisory lock when the critical section ends.
struct SessionFileLock {
    file: File,
}

impl SessionFileLock {
    fn acquire(path: PathBuf) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for SessionFileLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            warn!(error = %err, "failed to release session lock");
        }
    }
}

/// Owns login, token capture and refresh for a run. Shared by all workers;
/// the login critical section is additionally guarded by a cross-process
/// file lock so parallel crawl processes against one account do not race.
pub struct SessionManager {
    config: Arc<ScoutConfig>,
    credentials: Option<Credentials>,
    state: Mutex<SessionState>,
    tokens: RwLock<Option<Tokens>>,
    refresh_flight: Mutex<()>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    lock_path: PathBuf,
}

impl SessionManager {
    pub fn new(config: Arc<ScoutConfig>, credentials: Option<Credentials>) -> Self {
        let refresher: Option<Arc<dyn TokenRefresher>> = config
            .auth
            .refresh_endpoint
            .clone()
            .map(|endpoint| Arc::new(HttpTokenRefresher::new(endpoint)) as Arc<dyn TokenRefresher>);
        let lock_path = config.resolve_path(&config.auth.lock_path);
        Self {
            config,
            credentials,
            state: Mutex::new(SessionState::NoSession),
            tokens: RwLock::new(None),
            refresh_flight: Mutex::new(()),
            refresher,
            lock_path,
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    pub async fn install_tokens(&self, tokens: Tokens) {
        *self.tokens.write().await = Some(tokens);
        *self.state.lock().await = SessionState::SessionValid;
    }

    /// Script that pre-seeds a fresh page's storage with the current tokens,
    /// or `None` when there is nothing to seed.
    pub async fn seed_script(&self) -> Option<String> {
        let tokens = self.tokens.read().await;
        let tokens = tokens.as_ref()?;
        let auth = &self.config.auth;
        let mut script = format!(
            "localStorage.setItem({}, {});",
            js_string(&auth.access_token_key),
            js_string(&tokens.access_token),
        );
        if let Some(refresh) = &tokens.refresh_token {
            script.push_str(&format!(
                "localStorage.setItem({}, {});",
                js_string(&auth.refresh_token_key),
                js_string(refresh),
            ));
        }
        if let Some(expires_at) = tokens.expires_at {
            script.push_str(&format!(
                "localStorage.setItem({}, {});",
                js_string(&auth.expires_at_key),
                js_string(&expires_at.timestamp().to_string()),
            ));
        }
        Some(script)
    }

    /// Establishes a valid session on the given page, logging in if needed.
    /// The whole critical section runs under the cross-process file lock;
    /// a second process acquiring the lock re-checks and may skip login.
    pub async fn ensure_session(&self, page: &dyn BrowserPage) -> AuthResult<()> {
        let lock_path = self.lock_path.clone();
        let _guard = tokio::task::spawn_blocking(move || SessionFileLock::acquire(lock_path))
            .await
            .map_err(|err| AuthError::LoginFailed(err.to_string()))??;

        if self.verify_existing_session(page).await? {
            info!("existing session verified, skipping login");
            if let Err(err) = self.capture_tokens(page).await {
                debug!(error = %err, "token capture on existing session failed");
            }
            *self.state.lock().await = SessionState::SessionValid;
            return Ok(());
        }
        self.login(page).await
    }

    /// A live session shows the app's landmark without any credential form.
    async fn verify_existing_session(&self, page: &dyn BrowserPage) -> AuthResult<bool> {
        let auth = &self.config.auth;
        page.goto(&self.config.crawl.start_url).await?;
        if page.find_element(&auth.password_selector).await?.is_some() {
            return Ok(false);
        }
        Ok(page
            .wait_for_selector(&auth.landmark_selector, Duration::from_secs(5))
            .await?)
    }

    async fn login(&self, page: &dyn BrowserPage) -> AuthResult<()> {
        *self.state.lock().await = SessionState::LoggingIn;
        let auth = &self.config.auth;

        let login_url = auth
            .login_url
            .clone()
            .unwrap_or_else(|| self.config.crawl.start_url.clone());
        page.goto(&login_url).await?;

        let has_credentials_form = page.find_element(&auth.username_selector).await?.is_some();
        if has_credentials_form {
            let Some(credentials) = &self.credentials else {
                *self.state.lock().await = SessionState::SessionInvalid;
                return Err(AuthError::LoginFailed(
                    "login form present but no credentials configured".into(),
                ));
            };
            let executor = CommandExecutor::new(&self.config.command);
            let mut chain = ActionChain::new();
            executor
                .execute(
                    page,
                    &Command::Fill {
                        selector: auth.username_selector.clone(),
                        label: "username".into(),
                        value: credentials.username.clone(),
                        sensitive: false,
                    },
                    &mut chain,
                    &login_url,
                )
                .await?;
            executor
                .execute(
                    page,
                    &Command::Fill {
                        selector: auth.password_selector.clone(),
                        label: "password".into(),
                        value: credentials.password.clone(),
                        sensitive: true,
                    },
                    &mut chain,
                    &login_url,
                )
                .await?;
            executor
                .execute(
                    page,
                    &Command::Click {
                        selector: auth.submit_selector.clone(),
                        label: "submit login".into(),
                    },
                    &mut chain,
                    &login_url,
                )
                .await?;
        } else {
            debug!("no credential form found, assuming pre-authenticated session");
        }

        let landmark_ok = page
            .wait_for_selector(&auth.landmark_selector, Duration::from_secs(15))
            .await?;
        if !landmark_ok {
            *self.state.lock().await = SessionState::SessionInvalid;
            return Err(AuthError::LoginFailed(
                "landmark never appeared after login".into(),
            ));
        }

        if let Err(err) = self.capture_tokens(page).await {
            warn!(error = %err, "login succeeded but token capture failed");
        }
        *self.state.lock().await = SessionState::SessionValid;
        info!("session established");
        Ok(())
    }

    /// Tokens may land in storage asynchronously after the login redirect,
    /// so this polls with a bounded budget and then falls back to the
    /// HTTP-only session cookie.
    async fn capture_tokens(&self, page: &dyn BrowserPage) -> AuthResult<()> {
        let auth = &self.config.auth;
        let script = format!(
            "(() => {{\n\
                 const read = (key) => localStorage.getItem(key) || sessionStorage.getItem(key);\n\
                 const access = read({access});\n\
                 if (!access) return null;\n\
                 return {{\n\
                     access_token: access,\n\
                     refresh_token: read({refresh}),\n\
                     expires_at: read({expires}),\n\
                 }};\n\
             }})()",
            access = js_string(&auth.access_token_key),
            refresh = js_string(&auth.refresh_token_key),
            expires = js_string(&auth.expires_at_key),
        );

        for _ in 0..auth.token_poll_attempts {
            match page.evaluate(&script).await {
                Ok(value) if !value.is_null() => {
                    let access = value
                        .get("access_token")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let refresh = value
                        .get("refresh_token")
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                    let expires_at = value
                        .get("expires_at")
                        .and_then(|v| v.as_str())
                        .and_then(|raw| raw.parse::<i64>().ok())
                        .and_then(|epoch| DateTime::from_timestamp(epoch, 0));
                    self.install_tokens(Tokens {
                        access_token: access,
                        refresh_token: refresh,
                        expires_at,
                    })
                    .await;
                    debug!("tokens captured from client storage");
                    return Ok(());
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(error = %err, "storage read failed, trying cookie fallback");
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(auth.token_poll_interval_ms)).await;
        }

        if let Some(cookie_name) = &auth.session_cookie {
            if let Some(value) = page.cookie_value(cookie_name).await? {
                self.install_tokens(Tokens {
                    access_token: value,
                    refresh_token: None,
                    expires_at: None,
                })
                .await;
                debug!("session captured from cookie");
                return Ok(());
            }
        }
        Err(AuthError::TokenCapture(
            "no tokens in storage and no session cookie".into(),
        ))
    }

    /// Current access token, refreshing lazily when it is about to expire.
    /// Refresh is single-flighted: concurrent callers wait for the one
    /// in-flight refresh instead of issuing duplicates.
    pub async fn current_access_token(&self) -> AuthResult<Option<String>> {
        let slack = self.config.auth.refresh_slack_seconds;
        {
            let tokens = self.tokens.read().await;
            match tokens.as_ref() {
                None => return Ok(None),
                Some(tokens) if !tokens.needs_refresh(slack) => {
                    return Ok(Some(tokens.access_token.clone()));
                }
                Some(_) => {}
            }
        }

        let _flight = self.refresh_flight.lock().await;
        // A concurrent caller may have refreshed while this one waited.
        {
            let tokens = self.tokens.read().await;
            if let Some(tokens) = tokens.as_ref() {
                if !tokens.needs_refresh(slack) {
                    return Ok(Some(tokens.access_token.clone()));
                }
            }
        }
        let refresh_token = {
            let tokens = self.tokens.read().await;
            tokens.as_ref().and_then(|t| t.refresh_token.clone())
        };
        let (Some(refresher), Some(refresh_token)) = (self.refresher.as_ref(), refresh_token)
        else {
            // Nothing to refresh with; hand back the stale token and let the
            // app-level auth redirect catch a truly dead session.
            let tokens = self.tokens.read().await;
            return Ok(tokens.as_ref().map(|t| t.access_token.clone()));
        };

        *self.state.lock().await = SessionState::Refreshing;
        match refresher.refresh(&refresh_token).await {
            Ok(fresh) => {
                let access = fresh.access_token.clone();
                self.install_tokens(fresh).await;
                debug!("access token refreshed");
                Ok(Some(access))
            }
            Err(err) => {
                *self.state.lock().await = SessionState::SessionInvalid;
                Err(err)
            }
        }
    }
}

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRefresher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self, _refresh_token: &str) -> AuthResult<Tokens> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Tokens {
                access_token: "fresh".into(),
                refresh_token: Some("next".into()),
                expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
            })
        }
    }

    fn expired_tokens() -> Tokens {
        Tokens {
            access_token: "stale".into(),
            refresh_token: Some("refresh-me".into()),
            expires_at: Some(Utc::now() - chrono::Duration::minutes(5)),
        }
    }

    fn manager_with_counter() -> (Arc<SessionManager>, Arc<CountingRefresher>) {
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
        });
        let config = Arc::new(ScoutConfig::for_url("https://x.com/app"));
        let manager = Arc::new(
            SessionManager::new(config, None).with_refresher(refresher.clone()),
        );
        (manager, refresher)
    }

    #[tokio::test]
    async fn concurrent_token_requests_share_one_refresh() {
        let (manager, refresher) = manager_with_counter();
        manager.install_tokens(expired_tokens()).await;

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.current_access_token().await })
            })
            .collect();
        for task in tasks {
            let token = task.await.unwrap().unwrap();
            assert_eq!(token.as_deref(), Some("fresh"));
        }
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state().await, SessionState::SessionValid);
    }

    #[tokio::test]
    async fn valid_token_is_returned_without_refresh() {
        let (manager, refresher) = manager_with_counter();
        manager
            .install_tokens(Tokens {
                access_token: "still-good".into(),
                refresh_token: Some("unused".into()),
                expires_at: Some(Utc::now() + chrono::Duration::hours(2)),
            })
            .await;
        let token = manager.current_access_token().await.unwrap();
        assert_eq!(token.as_deref(), Some("still-good"));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_tokens_yield_none() {
        let (manager, _) = manager_with_counter();
        assert!(manager.current_access_token().await.unwrap().is_none());
    }

    #[test]
    fn tokens_without_expiry_never_need_refresh() {
        let tokens = Tokens {
            access_token: "opaque".into(),
            refresh_token: None,
            expires_at: None,
        };
        assert!(!tokens.needs_refresh(60));
    }
}
