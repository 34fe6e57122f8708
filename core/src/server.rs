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

//! HTTP listener driving the login flow and the archive sync.
//!
//! Routes:
//! - `GET /` redirects to the provider's authorize URL
//! - `GET /redirect_page?code=...` completes the login and redirects to the sync
//! - `GET /saveDiscoverWeekly` runs the sync for the session credential
//! - `GET /stopServer` acknowledges, then stops the listener

use crate::archive::{ArchiveError, Archiver, PlaylistConnector};
use crate::auth::{AuthError, AuthManager};
use crate::models::{PlaylistNames, SyncOutcome};
use crate::session::SessionId;
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use log::{debug, error, info};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const LOGIN_PATH: &str = "/";
pub const CALLBACK_PATH: &str = "/redirect_page";
pub const SYNC_PATH: &str = "/saveDiscoverWeekly";
pub const STOP_PATH: &str = "/stopServer";

pub const DEFAULT_COOKIE_NAME: &str = "spotify_cookie";

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("Authorization callback rejected: {0}")]
    Callback(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Auth(AuthError::NoSession) => {
                debug!("Request without a session");
                StatusCode::UNAUTHORIZED
            }
            AppError::Auth(AuthError::ClientConfig(e)) => {
                error!("Client configuration error: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Auth(AuthError::Exchange(e)) => {
                error!("Token exchange failed: {}", e);
                StatusCode::BAD_GATEWAY
            }
            AppError::Archive(e) => {
                error!("Sync failed: {}", e);
                StatusCode::BAD_GATEWAY
            }
            AppError::Callback(e) => {
                debug!("Callback rejected: {}", e);
                StatusCode::BAD_REQUEST
            }
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Progress of a login-and-sync round trip, as seen by the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// A code was exchanged and the credential stored; the sync is next.
    LoginCompleted,
    Synced(SyncOutcome),
    /// The code exchange, refresh or sync failed with this message.
    Failed(String),
}

impl ListenerEvent {
    /// True once the round trip has ended, successfully or not.
    pub fn is_final(&self) -> bool {
        !matches!(self, ListenerEvent::LoginCompleted)
    }
}

/// Request-scoped context shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthManager>,
    pub connector: Arc<dyn PlaylistConnector>,
    pub names: Arc<PlaylistNames>,
    pub cookie_name: Arc<str>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    events_tx: Arc<watch::Sender<Option<ListenerEvent>>>,
}

impl AppState {
    pub fn new(
        auth: AuthManager,
        connector: Arc<dyn PlaylistConnector>,
        names: PlaylistNames,
        cookie_name: &str,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (events_tx, _) = watch::channel(None);
        Self {
            auth: Arc::new(auth),
            connector,
            names: Arc::new(names),
            cookie_name: Arc::from(cookie_name),
            shutdown_tx: Arc::new(shutdown_tx),
            events_tx: Arc::new(events_tx),
        }
    }

    /// Asks the listener to stop accepting connections.
    pub fn request_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn shutdown_requested(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Receives the latest login or sync event, failures included.
    pub fn subscribe_events(&self) -> watch::Receiver<Option<ListenerEvent>> {
        self.events_tx.subscribe()
    }

    fn publish(&self, event: ListenerEvent) {
        self.events_tx.send_replace(Some(event));
    }

    fn publish_failure<E: Into<AppError>>(&self, e: E) -> AppError {
        let e = e.into();
        self.publish(ListenerEvent::Failed(e.to_string()));
        e
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(LOGIN_PATH, get(login))
        .route(CALLBACK_PATH, get(redirect_page))
        .route(SYNC_PATH, get(save_discover_weekly))
        .route(STOP_PATH, get(stop_server))
        .with_state(state)
}

/// Serves until a shutdown is requested through the state.
pub async fn serve(listener: TcpListener, state: AppState) -> io::Result<()> {
    let mut shutdown = state.shutdown_requested();
    let app = build_router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
            info!("Listener shutting down");
        })
        .await
}

/// A listener running on a background task.
pub struct ServerHandle {
    addr: SocketAddr,
    state: AppState,
    task: JoinHandle<io::Result<()>>,
}

/// Binds `addr` and serves `state` on a background task.
pub async fn spawn(addr: SocketAddr, state: AppState) -> io::Result<ServerHandle> {
    let listener = TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;
    info!("Listening on http://{}", addr);

    let task = tokio::spawn(serve(listener, state.clone()));
    Ok(ServerHandle { addr, state, task })
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Waits for the listener task to finish.
    pub async fn join(self) -> io::Result<()> {
        self.task.await.map_err(io::Error::other)?
    }
}

fn session_from_headers(headers: &HeaderMap, cookie_name: &str) -> Option<SessionId> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == cookie_name)
        .and_then(|(_, value)| SessionId::parse(value))
}

async fn login(State(state): State<AppState>) -> Result<Redirect, AppError> {
    let url = state.auth.begin_login()?;
    Ok(Redirect::to(&url))
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    error: Option<String>,
}

async fn redirect_page(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Result<Response, AppError> {
    // The OAuth `state` parameter is deliberately not verified: the listener
    // is local and only serves the user who started the flow.
    let code = match (params.code, params.error) {
        (Some(code), _) if !code.is_empty() => code,
        (_, Some(error)) => return Err(state.publish_failure(AppError::Callback(error))),
        _ => {
            let missing = AppError::Callback("missing authorization code".to_string());
            return Err(state.publish_failure(missing));
        }
    };

    let session = session_from_headers(&headers, &state.cookie_name).unwrap_or_default();
    state
        .auth
        .complete_login(session, &code)
        .await
        .map_err(|e| state.publish_failure(e))?;
    state.publish(ListenerEvent::LoginCompleted);

    let cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax",
        state.cookie_name, session
    );
    Ok(([(header::SET_COOKIE, cookie)], Redirect::to(SYNC_PATH)).into_response())
}

async fn save_discover_weekly(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let Some(session) = session_from_headers(&headers, &state.cookie_name) else {
        return Ok(Redirect::to(LOGIN_PATH).into_response());
    };

    let credential = match state.auth.get_valid_credential(&session).await {
        Ok(credential) => credential,
        Err(AuthError::NoSession) => return Ok(Redirect::to(LOGIN_PATH).into_response()),
        Err(e) => return Err(state.publish_failure(e)),
    };

    let archiver = Archiver::new(state.connector.connect(&credential), (*state.names).clone());
    let outcome = archiver.sync().await.map_err(|e| state.publish_failure(e))?;
    info!("Sync finished: {}", outcome);

    let message = outcome.to_string();
    state.publish(ListenerEvent::Synced(outcome));
    Ok(message.into_response())
}

async fn stop_server(State(state): State<AppState>) -> Json<Value> {
    info!("Stop requested over HTTP");
    state.request_shutdown();
    Json(json!({ "success": true, "message": "Server is shutting down..." }))
}
