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
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Opaque identifier carried in the session cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses a cookie value. Anything that is not a UUID is treated as no session.
    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value.trim()).ok().map(Self)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Process-local credential store keyed by session id.
///
/// Clones share the same map. Nothing is persisted; entries live until they
/// are cleared by a new login or the process exits.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    inner: Arc<DashMap<SessionId, Credential>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &SessionId) -> Option<Credential> {
        self.inner.get(id).map(|entry| entry.value().clone())
    }

    /// Stores `credential`, replacing any previous value for `id`.
    pub fn insert(&self, id: SessionId, credential: Credential) {
        self.inner.insert(id, credential);
    }

    pub fn clear(&self, id: &SessionId) -> Option<Credential> {
        self.inner.remove(id).map(|(_, credential)| credential)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
