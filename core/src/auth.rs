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

use crate::models::Credential;
use crate::session::{SessionId, SessionStore};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use rspotify::{prelude::*, scopes, AuthCodeSpotify, Credentials, OAuth, Token};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    /// No credential is stored for the session; the caller should restart the login flow.
    #[error("No credential stored for this session")]
    NoSession,
    #[error("Token exchange rejected: {0}")]
    Exchange(String),
    #[error("Failed to initialize Spotify client: {0}")]
    ClientConfig(String),
}

/// Scopes requested at login: read the library, modify public and private playlists.
pub fn archive_scopes() -> HashSet<String> {
    scopes!(
        "user-library-read",
        "playlist-modify-public",
        "playlist-modify-private"
    )
}

/// The identity-provider side of the authorization-code flow.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    /// URL the user agent is sent to in order to grant consent.
    fn authorize_url(&self) -> Result<String, AuthError>;

    /// Trades a one-time authorization code for a credential.
    async fn exchange_code(&self, code: &str) -> Result<Credential, AuthError>;

    /// Mints a fresh credential from a refresh token.
    async fn refresh(&self, refresh_token: &str) -> Result<Credential, AuthError>;
}

/// [`TokenExchange`] backed by the Spotify accounts service.
///
/// Every call works on its own `AuthCodeSpotify`, so no token state is shared
/// between sessions.
#[derive(Debug, Clone)]
pub struct SpotifyTokenExchange {
    creds: Credentials,
    oauth: OAuth,
}

impl SpotifyTokenExchange {
    pub fn new(client_id: &str, client_secret: &str, redirect_uri: &str) -> Result<Self, AuthError> {
        if client_id.is_empty() || client_secret.is_empty() {
            return Err(AuthError::ClientConfig(
                "Missing RSPOTIFY_CLIENT_ID or RSPOTIFY_CLIENT_SECRET".to_string(),
            ));
        }
        if redirect_uri.is_empty() {
            return Err(AuthError::ClientConfig(
                "Missing RSPOTIFY_REDIRECT_URI".to_string(),
            ));
        }

        let oauth = OAuth {
            redirect_uri: redirect_uri.to_string(),
            scopes: archive_scopes(),
            ..Default::default()
        };

        Ok(Self {
            creds: Credentials::new(client_id, client_secret),
            oauth,
        })
    }

    fn client(&self) -> AuthCodeSpotify {
        AuthCodeSpotify::new(self.creds.clone(), self.oauth.clone())
    }
}

async fn current_token(client: &AuthCodeSpotify) -> Result<Option<Token>, AuthError> {
    let guard = client
        .token
        .lock()
        .await
        .map_err(|_| AuthError::ClientConfig("Token lock poisoned".to_string()))?;
    Ok((*guard).clone())
}

fn to_credential(token: Token, previous_refresh: Option<&str>) -> Result<Credential, AuthError> {
    // Refresh responses may omit the refresh token, in which case the old one stays valid.
    let refresh_token = token
        .refresh_token
        .or_else(|| previous_refresh.map(str::to_string))
        .ok_or_else(|| AuthError::Exchange("Response carried no refresh token".to_string()))?;

    let expires_at = token
        .expires_at
        .map(|at| at.timestamp())
        .unwrap_or_else(|| Utc::now().timestamp() + token.expires_in.num_seconds());

    Ok(Credential {
        access_token: token.access_token,
        refresh_token,
        expires_at,
    })
}

#[async_trait]
impl TokenExchange for SpotifyTokenExchange {
    fn authorize_url(&self) -> Result<String, AuthError> {
        self.client()
            .get_authorize_url(false)
            .map_err(|e| AuthError::ClientConfig(e.to_string()))
    }

    async fn exchange_code(&self, code: &str) -> Result<Credential, AuthError> {
        let client = self.client();
        client
            .request_token(code)
            .await
            .map_err(|e| AuthError::Exchange(e.to_string()))?;

        let token = current_token(&client)
            .await?
            .ok_or_else(|| AuthError::Exchange("No token returned for code".to_string()))?;
        to_credential(token, None)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Credential, AuthError> {
        let client = self.client();
        *client
            .token
            .lock()
            .await
            .map_err(|_| AuthError::ClientConfig("Token lock poisoned".to_string()))? = Some(Token {
            refresh_token: Some(refresh_token.to_string()),
            ..Token::default()
        });

        client
            .refresh_token()
            .await
            .map_err(|e| AuthError::Exchange(e.to_string()))?;

        let token = current_token(&client)
            .await?
            .ok_or_else(|| AuthError::Exchange("Refresh returned no token".to_string()))?;
        to_credential(token, Some(refresh_token))
    }
}

/// Owns the login flow and the credential lifecycle of each session.
pub struct AuthManager {
    exchange: Arc<dyn TokenExchange>,
    sessions: SessionStore,
}

impl AuthManager {
    pub fn new(exchange: Arc<dyn TokenExchange>, sessions: SessionStore) -> Self {
        Self { exchange, sessions }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn begin_login(&self) -> Result<String, AuthError> {
        self.exchange.authorize_url()
    }

    /// Exchanges `code` and stores the result under `session`.
    ///
    /// The session is cleared before the exchange, so a rejected code leaves
    /// it empty rather than holding the previous credential.
    pub async fn complete_login(&self, session: SessionId, code: &str) -> Result<Credential, AuthError> {
        self.sessions.clear(&session);

        let credential = self.exchange.exchange_code(code).await?;
        self.sessions.insert(session, credential.clone());
        info!("Login completed for session {}", session);

        Ok(credential)
    }

    pub async fn get_valid_credential(&self, session: &SessionId) -> Result<Credential, AuthError> {
        self.get_valid_credential_at(session, Utc::now().timestamp())
            .await
    }

    /// Returns the stored credential, refreshing it first when it is inside
    /// the expiry margin at `now`.
    pub async fn get_valid_credential_at(
        &self,
        session: &SessionId,
        now: i64,
    ) -> Result<Credential, AuthError> {
        let credential = self.sessions.get(session).ok_or(AuthError::NoSession)?;

        if !credential.needs_refresh(now) {
            return Ok(credential);
        }

        debug!(
            "Credential for session {} has {}s left, refreshing",
            session,
            credential.remaining_secs(now)
        );
        let refreshed = self.exchange.refresh(&credential.refresh_token).await?;
        self.sessions.insert(*session, refreshed.clone());
        info!("Refreshed credential for session {}", session);

        Ok(refreshed)
    }
}
