//! Adaptive transcoding and streaming core.
//!
//! Wires the Media Probe, Resource Manager, ABR Ladder Generator, FFmpeg
//! Argument Builder, Process Supervisor, Content Store, Session Manager,
//! Playback Planner, and Validator together, then serves the HTTP surface
//! that fronts them.

mod app;
mod config;
mod content_store;
mod domain;
mod error;
mod ffmpeg;
mod jobs;
mod ladder;
mod media;
mod planner;
mod resources;
mod services;
mod session;
mod streaming;
mod validator;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::app::AppState;
use crate::config::Config;
use crate::content_store::ContentStore;
use crate::ffmpeg::ProcessSupervisor;
use crate::jobs::{ContentSweeperService, SessionReaperService};
use crate::media::MediaProbe;
use crate::planner::Planner;
use crate::resources::ResourceManager;
use crate::services::{HttpServerService, ServicesManager};
use crate::session::SessionManager;
use crate::validator::Validator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    services::logging::init();

    let config = Arc::new(Config::from_env()?);
    info!("configuration loaded");

    let probe = Arc::new(MediaProbe::new(
        config.ffprobe_path.as_str(),
        config.probe_cache_capacity,
        config.probe_timeout_secs,
        config.default_frame_rate,
    ));

    let resources = Arc::new(ResourceManager::new());
    let content_store = Arc::new(ContentStore::new(
        config.content_root.as_str(),
        Duration::from_secs(config.content_ttl_secs),
    ));
    let supervisor = Arc::new(ProcessSupervisor::new(
        config.ffmpeg_path.as_str(),
        Duration::from_secs(config.stall_timeout_secs),
    ));
    let validator = Arc::new(Validator::new(config.ffprobe_path.as_str()));
    let planner = Arc::new(Planner::new(probe.clone()));

    let sessions = Arc::new(SessionManager::new(
        config.ffmpeg_path.as_str(),
        config.max_concurrent_sessions,
        config.default_segment_duration_secs,
        config.cancel_grace_secs,
        content_store.clone(),
        probe.clone(),
        resources.clone(),
        supervisor.clone(),
        validator.clone(),
    ));

    let state = AppState {
        config: config.clone(),
        sessions: sessions.clone(),
        content_store: content_store.clone(),
        planner: planner.clone(),
    };

    let manager = ServicesManager::builder()
        .add_service(Arc::new(HttpServerService::new(config.clone(), state)))
        .add_service(Arc::new(ContentSweeperService::new(
            content_store.clone(),
            Duration::from_secs(config.content_ttl_secs.clamp(60, 3600)),
        )))
        .add_service(Arc::new(SessionReaperService::new(
            sessions.clone(),
            Duration::from_secs(60),
            Duration::from_secs(config.session_max_age_secs),
        )))
        .start()
        .await?;

    info!("all services started");

    shutdown_signal().await;
    info!("shutdown signal received, stopping services");

    sessions.stop_all().await;
    manager.stop_all().await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
