//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::{fs, num::NonZeroU32, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request},
    Router,
};
use chime::{
    catalog::Catalog,
    player::{Engine, PlaybackError, Player},
    server::{self, AppState},
    token::{Credential, TokenStore},
};
use tempfile::TempDir;
use tokio::sync::Notify;

/// Succeeds immediately.
pub struct InstantPlayer;

#[async_trait]
impl Player for InstantPlayer {
    async fn play(&self, _path: &Path) -> Result<(), PlaybackError> {
        Ok(())
    }
}

/// Fails immediately.
pub struct BrokenPlayer;

#[async_trait]
impl Player for BrokenPlayer {
    async fn play(&self, _path: &Path) -> Result<(), PlaybackError> {
        Err(PlaybackError::NoPlayer)
    }
}

/// Plays until released by the test.
#[derive(Default)]
pub struct GatedPlayer {
    pub started: Notify,
    pub release: Notify,
}

#[async_trait]
impl Player for GatedPlayer {
    async fn play(&self, _path: &Path) -> Result<(), PlaybackError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

pub struct Daemon {
    pub dir: TempDir,
    pub tokens: TokenStore,
    pub credential: Credential,
    pub state: AppState,
}

impl Daemon {
    pub fn router(&self) -> Router {
        server::router(self.state.clone())
    }
}

/// Sets up a daemon with `bell.mp3` and `dog-arrived.mp3` in its catalog.
pub fn daemon(player: Arc<dyn Player>) -> Daemon {
    daemon_with_limit(player, 1000)
}

pub fn daemon_with_limit(player: Arc<dyn Player>, max_requests_per_minute: u32) -> Daemon {
    let dir = tempfile::tempdir().unwrap();

    let audio = dir.path().join("audio");
    fs::create_dir(&audio).unwrap();
    fs::write(audio.join("bell.mp3"), b"ID3").unwrap();
    fs::write(audio.join("dog-arrived.mp3"), b"ID3").unwrap();
    fs::write(dir.path().join("outside.mp3"), b"ID3").unwrap();

    let tokens = TokenStore::new(dir.path().join("token"));
    let credential = tokens.issue().unwrap();

    let catalog = Catalog::open(&audio).unwrap();
    let engine = Engine::new(catalog, player, Duration::from_secs(5));
    let state = AppState::new(
        tokens.clone(),
        Arc::new(engine),
        NonZeroU32::new(max_requests_per_minute).unwrap(),
        1024,
    );

    Daemon {
        dir,
        tokens,
        credential,
        state,
    }
}

pub fn play_request(token: Option<&str>, body: impl Into<Body>) -> Request<Body> {
    let mut builder = Request::builder()
        .uri("/play")
        .method("POST")
        .header(header::CONTENT_TYPE, "application/json");

    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    builder.body(body.into()).unwrap()
}

pub fn play_body(audio: &str) -> String {
    serde_json::json!({ "audio": audio }).to_string()
}
