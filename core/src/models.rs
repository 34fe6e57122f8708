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

use serde::{Deserialize, Serialize};
use std::fmt;

/// Seconds of remaining validity below which a credential is refreshed before use.
pub const REFRESH_MARGIN_SECS: i64 = 60;

/// Access credential obtained from the authorization-code flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64, // Unix timestamp
}

impl Credential {
    /// Seconds left until `expires_at`, negative once expired.
    pub fn remaining_secs(&self, now: i64) -> i64 {
        self.expires_at - now
    }

    /// True when fewer than [`REFRESH_MARGIN_SECS`] of validity remain at `now`.
    pub fn needs_refresh(&self, now: i64) -> bool {
        self.remaining_secs(now) < REFRESH_MARGIN_SECS
    }
}

/// A playlist as listed for the current user. Never cached across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistRef {
    pub id: String,
    pub name: String,
}

/// Names used to locate (and, if needed, create) the playlists being synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistNames {
    pub source: String,
    pub archive: String,
    /// Name given to the archive when it has to be created. Differs from
    /// `archive` by default, so a created archive is not found on the next run.
    pub created_archive: String,
}

impl Default for PlaylistNames {
    fn default() -> Self {
        Self {
            source: "Discover Weekly".to_string(),
            archive: "Discover Weekly Archive".to_string(),
            created_archive: "dw archive".to_string(),
        }
    }
}

/// Details of a sync that found its source playlist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub source_id: String,
    pub archive_id: String,
    pub archive_created: bool,
    pub source_tracks: usize,
    pub archive_tracks_before: usize,
    pub added: Vec<String>, // Track URIs, in source order
}

/// Result of one sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// The source playlist does not exist. Nothing was modified.
    SourceNotFound { source: String },
    Synced(SyncReport),
}

impl SyncOutcome {
    pub fn added_count(&self) -> usize {
        match self {
            SyncOutcome::SourceNotFound { .. } => 0,
            SyncOutcome::Synced(report) => report.added.len(),
        }
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::SourceNotFound { source } => write!(f, "{} not found.", source),
            SyncOutcome::Synced(_) => write!(f, "Discover Weekly songs added successfully"),
        }
    }
}
