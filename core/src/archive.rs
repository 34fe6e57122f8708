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

use crate::models::{Credential, PlaylistNames, PlaylistRef, SyncOutcome, SyncReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::TryStreamExt;
use log::{debug, info, warn};
use rspotify::{
    model::{EpisodeId, Id, PlayableId, PlayableItem, PlaylistId, TrackId, UserId},
    prelude::*,
    AuthCodeSpotify, Token,
};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Maximum number of items the Web API accepts in one append request.
const ADD_ITEMS_CHUNK: usize = 100;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Spotify API error: {0}")]
    Spotify(#[from] rspotify::ClientError),
    /// Failure reported by a [`PlaylistClient`] that does not go through
    /// rspotify. The Spotify adapter reports its errors as `Spotify`.
    #[error("Upstream API error: {0}")]
    Upstream(String),
    #[error("Invalid ID: {0}")]
    InvalidId(String),
    #[error("Invalid track URI: {0}")]
    InvalidUri(String),
}

/// The playlist operations a sync needs from the provider.
#[async_trait]
pub trait PlaylistClient: Send + Sync {
    async fn current_user_id(&self) -> Result<String, ArchiveError>;

    /// All playlists owned or followed by the current user, in provider order.
    async fn user_playlists(&self) -> Result<Vec<PlaylistRef>, ArchiveError>;

    async fn create_playlist(
        &self,
        user_id: &str,
        name: &str,
        public: bool,
    ) -> Result<PlaylistRef, ArchiveError>;

    /// URIs of every item in the playlist, in playlist order.
    async fn playlist_track_uris(&self, playlist_id: &str) -> Result<Vec<String>, ArchiveError>;

    /// Appends `uris` to the end of the playlist as one logical batch.
    async fn add_tracks(&self, playlist_id: &str, uris: &[String]) -> Result<(), ArchiveError>;
}

/// Builds a [`PlaylistClient`] authorized by a credential.
pub trait PlaylistConnector: Send + Sync {
    fn connect(&self, credential: &Credential) -> Arc<dyn PlaylistClient>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SpotifyConnector;

impl PlaylistConnector for SpotifyConnector {
    fn connect(&self, credential: &Credential) -> Arc<dyn PlaylistClient> {
        Arc::new(SpotifyPlaylistClient::new(credential))
    }
}

/// [`PlaylistClient`] backed by the Spotify Web API.
pub struct SpotifyPlaylistClient {
    spotify: AuthCodeSpotify,
}

impl SpotifyPlaylistClient {
    pub fn new(credential: &Credential) -> Self {
        let token = Token {
            access_token: credential.access_token.clone(),
            refresh_token: Some(credential.refresh_token.clone()),
            expires_at: DateTime::<Utc>::from_timestamp(credential.expires_at, 0),
            ..Token::default()
        };
        Self {
            spotify: AuthCodeSpotify::from_token(token),
        }
    }
}

fn playable_id(uri: &str) -> Result<PlayableId<'_>, ArchiveError> {
    let parsed = if uri.starts_with("spotify:episode:") {
        EpisodeId::from_uri(uri).map(PlayableId::Episode)
    } else {
        TrackId::from_uri(uri).map(PlayableId::Track)
    };
    parsed.map_err(|_| ArchiveError::InvalidUri(uri.to_string()))
}

#[async_trait]
impl PlaylistClient for SpotifyPlaylistClient {
    async fn current_user_id(&self) -> Result<String, ArchiveError> {
        let user = self.spotify.current_user().await?;
        Ok(user.id.id().to_string())
    }

    async fn user_playlists(&self) -> Result<Vec<PlaylistRef>, ArchiveError> {
        let mut playlists = Vec::new();
        let mut stream = self.spotify.current_user_playlists();

        while let Some(pl) = stream.try_next().await? {
            playlists.push(PlaylistRef {
                id: pl.id.id().to_string(),
                name: pl.name,
            });
        }

        Ok(playlists)
    }

    async fn create_playlist(
        &self,
        user_id: &str,
        name: &str,
        public: bool,
    ) -> Result<PlaylistRef, ArchiveError> {
        let user = UserId::from_id(user_id).map_err(|_| ArchiveError::InvalidId(user_id.to_string()))?;
        let created = self
            .spotify
            .user_playlist_create(user, name, Some(public), None, None)
            .await?;

        Ok(PlaylistRef {
            id: created.id.id().to_string(),
            name: created.name,
        })
    }

    async fn playlist_track_uris(&self, playlist_id: &str) -> Result<Vec<String>, ArchiveError> {
        let playlist = PlaylistId::from_id(playlist_id)
            .map_err(|_| ArchiveError::InvalidId(playlist_id.to_string()))?;

        let mut uris = Vec::new();
        let mut stream = self.spotify.playlist_items(playlist, None, None);

        while let Some(item) = stream.try_next().await? {
            // Local files have no catalog id and cannot be appended elsewhere.
            let uri = match item.track {
                Some(PlayableItem::Track(track)) => track.id.map(|id| id.uri()),
                Some(PlayableItem::Episode(episode)) => Some(episode.id.uri()),
                _ => None,
            };
            if let Some(uri) = uri {
                uris.push(uri);
            }
        }

        Ok(uris)
    }

    async fn add_tracks(&self, playlist_id: &str, uris: &[String]) -> Result<(), ArchiveError> {
        let playlist = PlaylistId::from_id(playlist_id)
            .map_err(|_| ArchiveError::InvalidId(playlist_id.to_string()))?;
        let items = uris
            .iter()
            .map(|uri| playable_id(uri))
            .collect::<Result<Vec<_>, _>>()?;

        for chunk in items.chunks(ADD_ITEMS_CHUNK) {
            self.spotify
                .playlist_add_items(playlist.clone(), chunk.iter().cloned(), None)
                .await?;
        }

        Ok(())
    }
}

/// First playlist named exactly `name`. Duplicate names resolve to whichever
/// the provider listed first, which the provider does not guarantee.
pub fn find_playlist<'a>(playlists: &'a [PlaylistRef], name: &str) -> Option<&'a PlaylistRef> {
    playlists.iter().find(|pl| pl.name == name)
}

/// Source URIs absent from the archive, in source order. Repeats inside the
/// source are kept.
pub fn missing_uris(source: &[String], archive: &[String]) -> Vec<String> {
    let archived: HashSet<&str> = archive.iter().map(String::as_str).collect();
    source
        .iter()
        .filter(|uri| !archived.contains(uri.as_str()))
        .cloned()
        .collect()
}

/// Copies tracks of the source playlist that are not yet archived into the archive playlist.
pub struct Archiver {
    client: Arc<dyn PlaylistClient>,
    names: PlaylistNames,
}

impl Archiver {
    pub fn new(client: Arc<dyn PlaylistClient>, names: PlaylistNames) -> Self {
        Self { client, names }
    }

    pub async fn sync(&self) -> Result<SyncOutcome, ArchiveError> {
        let user_id = self.client.current_user_id().await?;
        let playlists = self.client.user_playlists().await?;
        debug!("User {} has {} playlists", user_id, playlists.len());

        let Some(source) = find_playlist(&playlists, &self.names.source) else {
            info!("Source playlist '{}' not found", self.names.source);
            return Ok(SyncOutcome::SourceNotFound {
                source: self.names.source.clone(),
            });
        };

        let (archive_id, archive_created) = match find_playlist(&playlists, &self.names.archive) {
            Some(archive) => (archive.id.clone(), false),
            None => {
                if self.names.created_archive != self.names.archive {
                    warn!(
                        "Creating archive as '{}', which the next run will not find under '{}'",
                        self.names.created_archive, self.names.archive
                    );
                }
                let created = self
                    .client
                    .create_playlist(&user_id, &self.names.created_archive, true)
                    .await?;
                info!("Created archive playlist '{}' ({})", created.name, created.id);
                (created.id, true)
            }
        };

        let source_uris = self.client.playlist_track_uris(&source.id).await?;
        let archive_uris = self.client.playlist_track_uris(&archive_id).await?;
        let added = missing_uris(&source_uris, &archive_uris);

        if added.is_empty() {
            info!("Archive {} already holds every source track", archive_id);
        } else {
            self.client.add_tracks(&archive_id, &added).await?;
            info!("Appended {} tracks to archive {}", added.len(), archive_id);
        }

        Ok(SyncOutcome::Synced(SyncReport {
            source_id: source.id.clone(),
            archive_id,
            archive_created,
            source_tracks: source_uris.len(),
            archive_tracks_before: archive_uris.len(),
            added,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        CurrentUser,
        Playlists,
        Create(String),
        Items(String),
        Add(String, Vec<String>),
    }

    impl Call {
        fn is_mutating(&self) -> bool {
            matches!(self, Call::Create(_) | Call::Add(_, _))
        }
    }

    #[derive(Default)]
    struct FakeState {
        playlists: Vec<PlaylistRef>,
        items: HashMap<String, Vec<String>>,
        calls: Vec<Call>,
        created: usize,
        fail_items: bool,
    }

    #[derive(Default)]
    struct FakeClient {
        state: Mutex<FakeState>,
    }

    impl FakeClient {
        fn with_playlist(self, id: &str, name: &str, uris: &[&str]) -> Self {
            {
                let mut state = self.state.lock().unwrap();
                state.playlists.push(PlaylistRef {
                    id: id.to_string(),
                    name: name.to_string(),
                });
                state
                    .items
                    .insert(id.to_string(), uris.iter().map(|u| u.to_string()).collect());
            }
            self
        }

        fn calls(&self) -> Vec<Call> {
            self.state.lock().unwrap().calls.clone()
        }

        fn items(&self, id: &str) -> Vec<String> {
            self.state.lock().unwrap().items.get(id).cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl PlaylistClient for FakeClient {
        async fn current_user_id(&self) -> Result<String, ArchiveError> {
            self.state.lock().unwrap().calls.push(Call::CurrentUser);
            Ok("user-1".to_string())
        }

        async fn user_playlists(&self) -> Result<Vec<PlaylistRef>, ArchiveError> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call::Playlists);
            Ok(state.playlists.clone())
        }

        async fn create_playlist(
            &self,
            user_id: &str,
            name: &str,
            public: bool,
        ) -> Result<PlaylistRef, ArchiveError> {
            assert_eq!(user_id, "user-1");
            assert!(public);
            let mut state = self.state.lock().unwrap();
            state.created += 1;
            let created = PlaylistRef {
                id: format!("created-{}", state.created),
                name: name.to_string(),
            };
            state.calls.push(Call::Create(name.to_string()));
            state.playlists.push(created.clone());
            state.items.insert(created.id.clone(), Vec::new());
            Ok(created)
        }

        async fn playlist_track_uris(&self, playlist_id: &str) -> Result<Vec<String>, ArchiveError> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call::Items(playlist_id.to_string()));
            if state.fail_items {
                return Err(ArchiveError::Upstream("429 Too Many Requests".to_string()));
            }
            Ok(state.items.get(playlist_id).cloned().unwrap_or_default())
        }

        async fn add_tracks(&self, playlist_id: &str, uris: &[String]) -> Result<(), ArchiveError> {
            let mut state = self.state.lock().unwrap();
            state
                .calls
                .push(Call::Add(playlist_id.to_string(), uris.to_vec()));
            state
                .items
                .entry(playlist_id.to_string())
                .or_default()
                .extend(uris.iter().cloned());
            Ok(())
        }
    }

    fn archiver(client: &Arc<FakeClient>, names: PlaylistNames) -> Archiver {
        Archiver::new(client.clone(), names)
    }

    fn uris(list: &[&str]) -> Vec<String> {
        list.iter().map(|u| u.to_string()).collect()
    }

    #[test]
    fn test_missing_uris_preserves_source_order_and_repeats() {
        let source = uris(&["a", "b", "a", "c"]);
        let archive = uris(&["b"]);
        assert_eq!(missing_uris(&source, &archive), uris(&["a", "a", "c"]));
        assert!(missing_uris(&uris(&["x"]), &uris(&["x", "y"])).is_empty());
    }

    #[test]
    fn test_find_playlist_first_match_wins() {
        let playlists = vec![
            PlaylistRef { id: "1".into(), name: "Discover Weekly".into() },
            PlaylistRef { id: "2".into(), name: "Discover Weekly".into() },
            PlaylistRef { id: "3".into(), name: "discover weekly".into() },
        ];
        assert_eq!(find_playlist(&playlists, "Discover Weekly").unwrap().id, "1");
        assert!(find_playlist(&playlists, "Discover").is_none());
    }

    #[test]
    fn test_playable_id_accepts_tracks_and_episodes() {
        assert!(matches!(
            playable_id("spotify:track:4iV5W9uYEdYUVa79Axb7Rh"),
            Ok(PlayableId::Track(_))
        ));
        assert!(matches!(
            playable_id("spotify:episode:512ojhOuo1ktJprKbVcKyQ"),
            Ok(PlayableId::Episode(_))
        ));
        assert!(matches!(
            playable_id("spotify:local:artist:album:title:180"),
            Err(ArchiveError::InvalidUri(_))
        ));
    }

    #[tokio::test]
    async fn test_appends_missing_tracks_in_source_order() {
        let client = Arc::new(
            FakeClient::default()
                .with_playlist("dw", "Discover Weekly", &["a", "b", "c"])
                .with_playlist("arch", "Discover Weekly Archive", &["b"]),
        );

        let outcome = archiver(&client, PlaylistNames::default()).sync().await.unwrap();

        let SyncOutcome::Synced(report) = outcome else {
            panic!("expected a sync report");
        };
        assert_eq!(report.added, uris(&["a", "c"]));
        assert_eq!(report.archive_id, "arch");
        assert!(!report.archive_created);
        assert_eq!(report.source_tracks, 3);
        assert_eq!(report.archive_tracks_before, 1);

        let adds: Vec<Call> = client.calls().into_iter().filter(Call::is_mutating).collect();
        assert_eq!(adds, vec![Call::Add("arch".into(), uris(&["a", "c"]))]);
        assert_eq!(client.calls()[0], Call::CurrentUser);
    }

    #[tokio::test]
    async fn test_second_run_adds_nothing() {
        let client = Arc::new(
            FakeClient::default()
                .with_playlist("dw", "Discover Weekly", &["a", "b"])
                .with_playlist("arch", "Discover Weekly Archive", &[]),
        );
        let archiver = archiver(&client, PlaylistNames::default());

        assert_eq!(archiver.sync().await.unwrap().added_count(), 2);
        assert_eq!(archiver.sync().await.unwrap().added_count(), 0);

        let adds = client.calls().into_iter().filter(|c| matches!(c, Call::Add(..))).count();
        assert_eq!(adds, 1);
        assert_eq!(client.items("arch"), uris(&["a", "b"]));
    }

    #[tokio::test]
    async fn test_missing_archive_is_created_and_targeted() {
        let client = Arc::new(FakeClient::default().with_playlist("dw", "Discover Weekly", &["a", "b"]));

        let outcome = archiver(&client, PlaylistNames::default()).sync().await.unwrap();

        let SyncOutcome::Synced(report) = outcome else {
            panic!("expected a sync report");
        };
        assert!(report.archive_created);
        assert_eq!(report.archive_id, "created-1");

        let calls = client.calls();
        let create_at = calls.iter().position(|c| c == &Call::Create("dw archive".into())).unwrap();
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::Create(_))).count(), 1);
        assert!(calls[create_at + 1..].contains(&Call::Items("created-1".into())));
        assert_eq!(calls.last(), Some(&Call::Add("created-1".into(), uris(&["a", "b"]))));
    }

    #[tokio::test]
    async fn test_default_names_create_a_new_archive_each_run() {
        let client = Arc::new(FakeClient::default().with_playlist("dw", "Discover Weekly", &["a"]));
        let archiver = archiver(&client, PlaylistNames::default());

        archiver.sync().await.unwrap();
        archiver.sync().await.unwrap();

        let creates = client.calls().into_iter().filter(|c| matches!(c, Call::Create(_))).count();
        assert_eq!(creates, 2);
    }

    #[tokio::test]
    async fn test_matching_created_name_is_reused() {
        let names = PlaylistNames {
            created_archive: "Discover Weekly Archive".to_string(),
            ..PlaylistNames::default()
        };
        let client = Arc::new(FakeClient::default().with_playlist("dw", "Discover Weekly", &["a"]));
        let archiver = archiver(&client, names);

        archiver.sync().await.unwrap();
        let second = archiver.sync().await.unwrap();

        let creates = client.calls().into_iter().filter(|c| matches!(c, Call::Create(_))).count();
        assert_eq!(creates, 1);
        assert_eq!(second.added_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_source_makes_no_mutating_calls() {
        let client = Arc::new(FakeClient::default().with_playlist("other", "Road Trip", &["a"]));

        let outcome = archiver(&client, PlaylistNames::default()).sync().await.unwrap();

        assert_eq!(
            outcome,
            SyncOutcome::SourceNotFound {
                source: "Discover Weekly".to_string()
            }
        );
        assert!(!client.calls().iter().any(Call::is_mutating));
    }

    #[tokio::test]
    async fn test_upstream_error_propagates() {
        let client = Arc::new(
            FakeClient::default()
                .with_playlist("dw", "Discover Weekly", &["a"])
                .with_playlist("arch", "Discover Weekly Archive", &[]),
        );
        client.state.lock().unwrap().fail_items = true;

        let err = archiver(&client, PlaylistNames::default()).sync().await.unwrap_err();
        assert!(matches!(err, ArchiveError::Upstream(_)));
        assert!(!client.calls().iter().any(Call::is_mutating));
    }
}
