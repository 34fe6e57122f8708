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

use archive_core::server::DEFAULT_COOKIE_NAME;
use archive_core::PlaylistNames;
use clap::{Args, Parser, Subcommand};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "dw-archiver")]
#[command(about = "Copies your Discover Weekly tracks into a permanent archive playlist", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub spotify: SpotifyArgs,

    #[command(flatten)]
    pub server: ServerArgs,

    #[command(flatten)]
    pub playlists: PlaylistArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs the listener and waits for you to log in from your own browser.
    Serve,
    /// Logs in through a WebDriver-controlled browser, syncs once, then exits.
    Run(AutomationArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SpotifyArgs {
    #[arg(long, env = "RSPOTIFY_CLIENT_ID")]
    pub client_id: String,

    #[arg(long, env = "RSPOTIFY_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: String,

    /// Must be registered for the app and point at this listener's /redirect_page
    #[arg(
        long,
        env = "RSPOTIFY_REDIRECT_URI",
        default_value = "http://127.0.0.1:5000/redirect_page"
    )]
    pub redirect_uri: String,
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address the listener binds to
    #[arg(long, env = "DW_ARCHIVER_HOST", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub host: IpAddr,

    #[arg(long, env = "DW_ARCHIVER_PORT", default_value_t = 5000)]
    pub port: u16,

    /// Name of the cookie carrying the session id
    #[arg(long, env = "DW_ARCHIVER_COOKIE", default_value = DEFAULT_COOKIE_NAME)]
    pub cookie_name: String,
}

impl ServerArgs {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[derive(Args, Debug, Clone)]
pub struct PlaylistArgs {
    /// Playlist whose tracks are archived
    #[arg(long, env = "DW_SOURCE_PLAYLIST", default_value = "Discover Weekly")]
    pub source_name: String,

    /// Playlist the tracks are appended to
    #[arg(long, env = "DW_ARCHIVE_PLAYLIST", default_value = "Discover Weekly Archive")]
    pub archive_name: String,

    /// Name given to the archive when it does not exist yet.
    /// Set it to the archive name to reuse the created playlist on later runs.
    #[arg(long, env = "DW_CREATED_ARCHIVE_PLAYLIST", default_value = "dw archive")]
    pub created_archive_name: String,
}

impl PlaylistArgs {
    pub fn names(&self) -> PlaylistNames {
        PlaylistNames {
            source: self.source_name.clone(),
            archive: self.archive_name.clone(),
            created_archive: self.created_archive_name.clone(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct AutomationArgs {
    #[arg(long, env = "SPOTIFY_USERNAME")]
    pub username: String,

    #[arg(long, env = "SPOTIFY_PASSWORD", hide_env_values = true)]
    pub password: String,

    /// WebDriver endpoint (chromedriver, geckodriver, ...)
    #[arg(long, env = "WEBDRIVER_URL", default_value = "http://localhost:4444")]
    pub webdriver_url: String,

    /// Run the browser without a window
    #[arg(long)]
    pub headless: bool,

    /// Seconds to wait for the login form to render
    #[arg(long, default_value_t = 10)]
    pub element_timeout: u64,

    /// Seconds to wait after submitting the login for the sync to finish
    #[arg(long, default_value_t = 5)]
    pub settle: u64,

    /// Output the sync outcome to a JSON file (e.g., --json=outcome.json)
    #[arg(long)]
    pub json: Option<PathBuf>,
}

impl AutomationArgs {
    pub fn element_timeout(&self) -> Duration {
        Duration::from_secs(self.element_timeout)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle)
    }
}
