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

mod args;
mod browser;
mod shim;

use anyhow::{Context, Result};
use archive_core::{
    server, AppState, AuthManager, SessionStore, SpotifyConnector, SpotifyTokenExchange,
    SyncOutcome,
};
use args::{AutomationArgs, Cli, Commands};
use browser::FantocciniDriver;
use clap::Parser;
use dotenvy::dotenv;
use log::{info, warn};
use shim::{Shim, ShimSettings};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::process;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() {
    if dotenv().is_err() {
        // Silently ignore
    }

    env_logger::init();

    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Serve => handle_serve(&cli).await,
        Commands::Run(args) => handle_run(&cli, args).await,
    };

    if let Err(e) = result {
        eprintln!();
        eprintln!("[ERROR] {:#}", e);
        process::exit(1);
    }
}

fn build_state(cli: &Cli) -> Result<AppState> {
    let exchange = SpotifyTokenExchange::new(
        &cli.spotify.client_id,
        &cli.spotify.client_secret,
        &cli.spotify.redirect_uri,
    )
    .context("Error initializing Spotify client")?;

    let names = cli.playlists.names();
    if names.created_archive != names.archive {
        warn!(
            "A missing archive is created as '{}' but looked up as '{}'; \
             each run without '{}' present creates another playlist",
            names.created_archive, names.archive, names.archive
        );
    }

    let callback_base = format!("http://{}/", cli.server.addr());
    if !cli.spotify.redirect_uri.starts_with(&callback_base) {
        warn!(
            "Redirect URI {} does not point at this listener ({})",
            cli.spotify.redirect_uri, callback_base
        );
    }

    let auth = AuthManager::new(Arc::new(exchange), SessionStore::new());
    Ok(AppState::new(
        auth,
        Arc::new(SpotifyConnector),
        names,
        &cli.server.cookie_name,
    ))
}

async fn handle_serve(cli: &Cli) -> Result<()> {
    let state = build_state(cli)?;
    let handle = server::spawn(cli.server.addr(), state)
        .await
        .context("Failed to bind listener")?;

    println!("Open {}/ in your browser to log in and archive your playlist.", handle.base_url());
    println!("Stop with Ctrl+C or {}{}", handle.base_url(), server::STOP_PATH);

    let app = handle.state().clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        app.request_shutdown();
    });

    handle.join().await.context("Listener error")?;
    info!("Listener stopped");
    Ok(())
}

async fn handle_run(cli: &Cli, args: &AutomationArgs) -> Result<()> {
    let state = build_state(cli)?;
    let driver = FantocciniDriver::new(&args.webdriver_url, args.headless);
    let mut shim = Shim::new(
        driver,
        ShimSettings {
            bind: cli.server.addr(),
            username: args.username.clone(),
            password: args.password.clone(),
            element_timeout: args.element_timeout(),
            settle: args.settle(),
        },
    );

    println!("Logging in through {} ...", args.webdriver_url);
    let result = shim.run(state).await;
    info!("Automation ended: {:?}", shim.history());
    let outcome = result.context("Automated run failed")?;

    print_outcome(&outcome);
    if let Some(path) = &args.json {
        write_report(path, &outcome)?;
        println!();
        println!("[SAVED] Outcome saved to: {}", path.display());
    }
    Ok(())
}

fn print_outcome(outcome: &SyncOutcome) {
    println!();
    println!("---------------------------------------------------");
    println!("SYNC COMPLETE");
    println!("---------------------------------------------------");
    match outcome {
        SyncOutcome::SourceNotFound { source } => {
            println!("Source playlist '{}' was not found. Nothing archived.", source);
        }
        SyncOutcome::Synced(report) => {
            println!("Source Playlist:          {}", report.source_id);
            println!(
                "Archive Playlist:         {}{}",
                report.archive_id,
                if report.archive_created { " (created)" } else { "" }
            );
            println!("Tracks in Source:         {}", report.source_tracks);
            println!("Archive Before Sync:      {}", report.archive_tracks_before);
            println!("---------------------------------------------------");
            println!("New Tracks Archived:      {}", report.added.len());
        }
    }
    println!("---------------------------------------------------");
}

fn write_report(path: &Path, outcome: &SyncOutcome) -> Result<()> {
    let json_content = serde_json::to_string_pretty(outcome)?;
    let mut file =
        File::create(path).with_context(|| format!("Failed to create file '{}'", path.display()))?;
    file.write_all(json_content.as_bytes())
        .context("Failed to write report to file")?;
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
