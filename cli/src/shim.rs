/*
    dw-archiver | Rust tool to archive Discover Weekly into a persistent playlist.
    Copyright (C) 2025  Israel Alberto Roldan Vega

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

//! One-shot automation: start the listener, log in through a browser, wait
//! for the resulting sync, then tear everything down.
//!
//! States only move forward:
//! `Idle -> ListenerStarted -> BrowserOpened -> LoginSubmitted -> SyncTriggered
//! -> ShutdownRequested -> Terminated`. A failing step skips straight to cleanup.

use archive_core::server::{self, ServerHandle, STOP_PATH};
use archive_core::{AppState, ListenerEvent, SyncOutcome};
use async_trait::async_trait;
use log::{info, warn};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

pub const USERNAME_FIELD: &str = "login-username";
pub const PASSWORD_FIELD: &str = "login-password";
pub const LOGIN_BUTTON: &str = "login-button";

#[derive(Error, Debug)]
pub enum ShimError {
    #[error("Element '{0}' not found")]
    ElementNotFound(String),
    #[error("Login rejected: the provider never called back")]
    LoginRejected,
    #[error("Login or sync failed: {0}")]
    Sync(String),
    #[error("Browser automation failed: {0}")]
    Browser(String),
    #[error("Listener failed: {0}")]
    Listener(#[from] std::io::Error),
    #[error("Shutdown request failed: {0}")]
    Shutdown(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShimState {
    Idle,
    ListenerStarted,
    BrowserOpened,
    LoginSubmitted,
    SyncTriggered,
    ShutdownRequested,
    Terminated,
}

/// The browser operations needed to get through the provider's login form.
#[async_trait]
pub trait BrowserDriver: Send {
    async fn open(&mut self) -> Result<(), ShimError>;

    async fn visit(&mut self, url: &str) -> Result<(), ShimError>;

    /// Fails with [`ShimError::ElementNotFound`] if the element does not appear within `timeout`.
    async fn wait_for(&mut self, element_id: &str, timeout: Duration) -> Result<(), ShimError>;

    /// Replaces the content of an input.
    async fn fill(&mut self, element_id: &str, text: &str) -> Result<(), ShimError>;

    async fn click(&mut self, element_id: &str) -> Result<(), ShimError>;

    /// Ends the browser session. Must be safe to call when nothing is open.
    async fn close(&mut self) -> Result<(), ShimError>;
}

#[derive(Debug, Clone)]
pub struct ShimSettings {
    pub bind: SocketAddr,
    pub username: String,
    pub password: String,
    pub element_timeout: Duration,
    pub settle: Duration,
}

pub struct Shim<D> {
    driver: D,
    settings: ShimSettings,
    history: Vec<ShimState>,
}

impl<D: BrowserDriver> Shim<D> {
    pub fn new(driver: D, settings: ShimSettings) -> Self {
        Self {
            driver,
            settings,
            history: vec![ShimState::Idle],
        }
    }

    pub fn state(&self) -> ShimState {
        self.history.last().copied().unwrap_or(ShimState::Idle)
    }

    /// Every state visited so far, starting with `Idle`.
    pub fn history(&self) -> &[ShimState] {
        &self.history
    }

    fn advance(&mut self, next: ShimState) {
        info!("{:?} -> {:?}", self.state(), next);
        self.history.push(next);
    }

    /// Runs the whole sequence once. The browser is closed and the listener
    /// stopped whether or not the login succeeds.
    pub async fn run(&mut self, app: AppState) -> Result<SyncOutcome, ShimError> {
        let server = match server::spawn(self.settings.bind, app).await {
            Ok(server) => server,
            Err(e) => {
                self.advance(ShimState::Terminated);
                return Err(e.into());
            }
        };
        self.advance(ShimState::ListenerStarted);

        let mut events = server.state().subscribe_events();
        let result = self.drive(&server.base_url(), &mut events).await;
        let cleanup = self.teardown(server).await;
        self.advance(ShimState::Terminated);

        let outcome = result?;
        cleanup?;
        Ok(outcome)
    }

    async fn drive(
        &mut self,
        base_url: &str,
        events: &mut watch::Receiver<Option<ListenerEvent>>,
    ) -> Result<SyncOutcome, ShimError> {
        self.driver.open().await?;
        self.advance(ShimState::BrowserOpened);

        self.driver.visit(&format!("{}/", base_url)).await?;
        self.driver
            .wait_for(USERNAME_FIELD, self.settings.element_timeout)
            .await?;
        self.driver
            .fill(USERNAME_FIELD, &self.settings.username)
            .await?;
        self.driver
            .fill(PASSWORD_FIELD, &self.settings.password)
            .await?;
        self.driver.click(LOGIN_BUTTON).await?;
        self.advance(ShimState::LoginSubmitted);

        // Only the callback is bounded by `settle`; the sync itself is not.
        let mut event = match tokio::time::timeout(self.settings.settle, events.wait_for(Option::is_some)).await {
            Ok(Ok(seen)) => seen.clone(),
            _ => None,
        }
        .ok_or(ShimError::LoginRejected)?;
        if !event.is_final() {
            event = events
                .wait_for(|seen| seen.as_ref().is_some_and(ListenerEvent::is_final))
                .await
                .map_err(|_| ShimError::Sync("listener stopped before the sync finished".to_string()))?
                .clone()
                .unwrap_or(event);
        }

        match event {
            ListenerEvent::Synced(outcome) => {
                self.advance(ShimState::SyncTriggered);
                Ok(outcome)
            }
            ListenerEvent::Failed(message) => Err(ShimError::Sync(message)),
            ListenerEvent::LoginCompleted => Err(ShimError::LoginRejected),
        }
    }

    async fn teardown(&mut self, server: ServerHandle) -> Result<(), ShimError> {
        let closed = self.driver.close().await;
        if let Err(e) = &closed {
            warn!("Failed to close browser: {}", e);
        }

        self.advance(ShimState::ShutdownRequested);
        let stop_url = format!("{}{}", server.base_url(), STOP_PATH);
        let stopped = match reqwest::get(&stop_url).await {
            Ok(response) => response.error_for_status().map(|_| ()).map_err(ShimError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = &stopped {
            // Stop in-process so joining cannot hang.
            warn!("{}; stopping listener directly", e);
            server.state().request_shutdown();
        }

        server.join().await?;
        closed?;
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archive_core::archive::ArchiveError;
    use archive_core::auth::AuthError;
    use archive_core::server::DEFAULT_COOKIE_NAME;
    use archive_core::{
        AuthManager, Credential, PlaylistClient, PlaylistConnector, PlaylistNames, PlaylistRef,
        SessionStore, TokenExchange,
    };
    use reqwest::header;
    use std::sync::{Arc, Mutex};

    struct FakeExchange;

    #[async_trait]
    impl TokenExchange for FakeExchange {
        fn authorize_url(&self) -> Result<String, AuthError> {
            Ok("https://accounts.example/authorize".to_string())
        }

        async fn exchange_code(&self, code: &str) -> Result<Credential, AuthError> {
            if code != "granted" {
                return Err(AuthError::Exchange("invalid_grant".to_string()));
            }
            Ok(Credential {
                access_token: "access".to_string(),
                refresh_token: "refresh".to_string(),
                expires_at: i64::MAX / 2,
            })
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<Credential, AuthError> {
            Err(AuthError::Exchange("refresh not expected".to_string()))
        }
    }

    #[derive(Clone, Default)]
    struct FakeLibrary {
        archived: Arc<Mutex<Vec<String>>>,
        rate_limited: bool,
    }

    #[async_trait]
    impl PlaylistClient for FakeLibrary {
        async fn current_user_id(&self) -> Result<String, ArchiveError> {
            if self.rate_limited {
                return Err(ArchiveError::Upstream("429 Too Many Requests".to_string()));
            }
            Ok("user".to_string())
        }

        async fn user_playlists(&self) -> Result<Vec<PlaylistRef>, ArchiveError> {
            Ok(vec![
                PlaylistRef { id: "dw".into(), name: "Discover Weekly".into() },
                PlaylistRef { id: "arch".into(), name: "Discover Weekly Archive".into() },
            ])
        }

        async fn create_playlist(&self, _: &str, _: &str, _: bool) -> Result<PlaylistRef, ArchiveError> {
            Err(ArchiveError::Upstream("archive exists".to_string()))
        }

        async fn playlist_track_uris(&self, playlist_id: &str) -> Result<Vec<String>, ArchiveError> {
            Ok(match playlist_id {
                "dw" => vec!["spotify:track:a".to_string(), "spotify:track:b".to_string()],
                _ => self.archived.lock().unwrap().clone(),
            })
        }

        async fn add_tracks(&self, _: &str, uris: &[String]) -> Result<(), ArchiveError> {
            self.archived.lock().unwrap().extend(uris.iter().cloned());
            Ok(())
        }
    }

    impl PlaylistConnector for FakeLibrary {
        fn connect(&self, _: &Credential) -> Arc<dyn PlaylistClient> {
            Arc::new(self.clone())
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Provider {
        /// Submitting the form sends the browser back with a valid code.
        Accepts,
        /// Submitting the form keeps the browser on the login page.
        Rejects,
        /// The login form never renders.
        NoForm,
    }

    struct FakeDriver {
        provider: Provider,
        base_url: Option<String>,
        filled: Vec<(String, String)>,
        open: bool,
        closed: bool,
    }

    impl FakeDriver {
        fn new(provider: Provider) -> Self {
            Self {
                provider,
                base_url: None,
                filled: Vec::new(),
                open: false,
                closed: false,
            }
        }

        /// Follows the provider redirect the way a browser would, carrying the session cookie.
        /// Like a browser, it renders error pages instead of failing.
        async fn follow_callback(&self) -> Result<(), ShimError> {
            let base = self.base_url.clone().ok_or_else(|| ShimError::Browser("no page".into()))?;
            let client = reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()?;

            let callback = client
                .get(format!("{}/redirect_page?code=granted", base))
                .send()
                .await?;
            let cookie = callback.headers()[header::SET_COOKIE]
                .to_str()
                .unwrap()
                .split(';')
                .next()
                .unwrap()
                .to_string();

            client
                .get(format!("{}/saveDiscoverWeekly", base))
                .header(header::COOKIE, cookie)
                .send()
                .await?;
            Ok(())
        }
    }

    #[async_trait]
    impl BrowserDriver for FakeDriver {
        async fn open(&mut self) -> Result<(), ShimError> {
            self.open = true;
            Ok(())
        }

        async fn visit(&mut self, url: &str) -> Result<(), ShimError> {
            assert!(self.open);
            self.base_url = Some(url.trim_end_matches('/').to_string());
            Ok(())
        }

        async fn wait_for(&mut self, element_id: &str, timeout: Duration) -> Result<(), ShimError> {
            assert_eq!(timeout, Duration::from_secs(10));
            match self.provider {
                Provider::NoForm => Err(ShimError::ElementNotFound(element_id.to_string())),
                _ => Ok(()),
            }
        }

        async fn fill(&mut self, element_id: &str, text: &str) -> Result<(), ShimError> {
            self.filled.push((element_id.to_string(), text.to_string()));
            Ok(())
        }

        async fn click(&mut self, element_id: &str) -> Result<(), ShimError> {
            assert_eq!(element_id, LOGIN_BUTTON);
            match self.provider {
                Provider::Accepts => self.follow_callback().await,
                _ => Ok(()),
            }
        }

        async fn close(&mut self) -> Result<(), ShimError> {
            self.open = false;
            self.closed = true;
            Ok(())
        }
    }

    fn app(library: FakeLibrary) -> AppState {
        let auth = AuthManager::new(Arc::new(FakeExchange), SessionStore::new());
        AppState::new(auth, Arc::new(library), PlaylistNames::default(), DEFAULT_COOKIE_NAME)
    }

    fn shim(provider: Provider) -> Shim<FakeDriver> {
        Shim::new(
            FakeDriver::new(provider),
            ShimSettings {
                bind: SocketAddr::from(([127, 0, 0, 1], 0)),
                username: "listener".to_string(),
                password: "hunter2".to_string(),
                element_timeout: Duration::from_secs(10),
                settle: Duration::from_millis(500),
            },
        )
    }

    #[tokio::test]
    async fn test_successful_login_syncs_and_cleans_up() {
        let library = FakeLibrary::default();
        let mut shim = shim(Provider::Accepts);

        let outcome = shim.run(app(library.clone())).await.unwrap();

        assert_eq!(outcome.added_count(), 2);
        assert_eq!(
            *library.archived.lock().unwrap(),
            vec!["spotify:track:a".to_string(), "spotify:track:b".to_string()]
        );
        assert_eq!(
            shim.history(),
            &[
                ShimState::Idle,
                ShimState::ListenerStarted,
                ShimState::BrowserOpened,
                ShimState::LoginSubmitted,
                ShimState::SyncTriggered,
                ShimState::ShutdownRequested,
                ShimState::Terminated,
            ]
        );
        assert_eq!(
            shim.driver.filled,
            vec![
                (USERNAME_FIELD.to_string(), "listener".to_string()),
                (PASSWORD_FIELD.to_string(), "hunter2".to_string()),
            ]
        );
        assert!(shim.driver.closed);
    }

    #[tokio::test]
    async fn test_rejected_login_still_cleans_up() {
        let mut shim = shim(Provider::Rejects);

        let err = shim.run(app(FakeLibrary::default())).await.unwrap_err();

        assert!(matches!(err, ShimError::LoginRejected));
        assert_eq!(shim.state(), ShimState::Terminated);
        assert!(!shim.history().contains(&ShimState::SyncTriggered));
        assert!(shim.history().contains(&ShimState::ShutdownRequested));
        assert!(shim.driver.closed);
    }

    #[tokio::test]
    async fn test_missing_form_fails_before_submitting() {
        let mut shim = shim(Provider::NoForm);

        let err = shim.run(app(FakeLibrary::default())).await.unwrap_err();

        assert!(matches!(err, ShimError::ElementNotFound(ref id) if id == USERNAME_FIELD));
        assert!(!shim.history().contains(&ShimState::LoginSubmitted));
        assert!(shim.driver.filled.is_empty());
        assert!(shim.driver.closed);
        assert_eq!(shim.state(), ShimState::Terminated);
    }

    #[tokio::test]
    async fn test_upstream_failure_is_reported_as_sync_error() {
        let library = FakeLibrary {
            rate_limited: true,
            ..FakeLibrary::default()
        };
        let mut shim = shim(Provider::Accepts);

        let err = shim.run(app(library.clone())).await.unwrap_err();

        assert!(matches!(err, ShimError::Sync(ref message) if message.contains("429")));
        assert!(library.archived.lock().unwrap().is_empty());
        assert!(!shim.history().contains(&ShimState::SyncTriggered));
        assert!(shim.history().contains(&ShimState::LoginSubmitted));
        assert!(shim.driver.closed);
        assert_eq!(shim.state(), ShimState::Terminated);
    }
}
