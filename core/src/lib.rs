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

pub mod archive;
pub mod auth;
pub mod models;
pub mod server;
pub mod session;

// Re-export key items for convenience
pub use archive::{Archiver, PlaylistClient, PlaylistConnector, SpotifyConnector};
pub use auth::{AuthManager, SpotifyTokenExchange, TokenExchange};
pub use models::{Credential, PlaylistNames, PlaylistRef, SyncOutcome, SyncReport};
pub use server::{AppState, ListenerEvent, ServerHandle};
pub use session::{SessionId, SessionStore};
