/// Command client tests
/// Run the client against a real listening daemon
mod common;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chime::{
    client::{Client, Outcome, RejectReason},
    server,
    settings::{ConnectionProfile, SettingsStore},
};
use common::{daemon, Daemon, GatedPlayer, InstantPlayer};
use tempfile::TempDir;
use tokio::{net::TcpListener, sync::oneshot};

/// Serves `daemon` on an ephemeral local port until the returned sender is
/// dropped.
async fn listen(daemon: &Daemon) -> (u16, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (stop, stopped) = oneshot::channel::<()>();

    tokio::spawn(server::serve(listener, daemon.router(), async move {
        let _ = stopped.await;
    }));

    (port, stop)
}

fn client(port: u16, credential: &str) -> (TempDir, SettingsStore, Client) {
    let dir = tempfile::tempdir().unwrap();
    let settings = SettingsStore::new(dir.path().join("settings.json"));
    settings
        .save(&ConnectionProfile {
            address: String::from("127.0.0.1"),
            port,
            credential: credential.to_owned(),
        })
        .unwrap();

    let client = Client::with_timeout(settings.clone(), Duration::from_secs(2)).unwrap();
    (dir, settings, client)
}

#[tokio::test]
async fn rotation_scenario() {
    let daemon = daemon(Arc::new(InstantPlayer));
    let (port, _stop) = listen(&daemon).await;
    let t1 = daemon.credential.expose().to_owned();
    let (_dir, settings, client) = client(port, &t1);

    assert_eq!(client.dispatch("bell.mp3").await, Outcome::Delivered);

    let t2 = daemon.tokens.issue().unwrap();
    assert_eq!(
        client.dispatch("bell.mp3").await,
        Outcome::Rejected(RejectReason::Unauthorized)
    );

    let mut profile = settings.get();
    profile.credential = t2.expose().to_owned();
    settings.save(&profile).unwrap();

    assert!(matches!(
        client.dispatch("missing.mp3").await,
        Outcome::Rejected(RejectReason::NotFound(_))
    ));
    assert_eq!(client.dispatch("bell.mp3").await, Outcome::Delivered);
}

#[tokio::test]
async fn unsafe_identifier_is_malformed() {
    let daemon = daemon(Arc::new(InstantPlayer));
    let (port, _stop) = listen(&daemon).await;
    let (_dir, _settings, client) = client(port, daemon.credential.expose());

    assert!(matches!(
        client.dispatch("../outside.mp3").await,
        Outcome::Rejected(RejectReason::Malformed(_))
    ));
}

#[tokio::test]
async fn busy_daemon_is_reported() {
    let player = Arc::new(GatedPlayer::default());
    let daemon = daemon(player.clone());
    let (port, _stop) = listen(&daemon).await;
    let (_dir, _settings, client) = client(port, daemon.credential.expose());
    let client = Arc::new(client);

    let first = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.dispatch("bell.mp3").await }
    });
    player.started.notified().await;

    assert_eq!(
        client.dispatch("dog-arrived.mp3").await,
        Outcome::Rejected(RejectReason::Busy)
    );

    player.release.notify_one();
    assert_eq!(first.await.unwrap(), Outcome::Delivered);
}

#[tokio::test]
async fn closed_port_is_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (_dir, _settings, client) = client(port, "T1");

    assert!(matches!(
        client.dispatch("bell.mp3").await,
        Outcome::Unreachable(_)
    ));
}

#[tokio::test]
async fn silent_daemon_times_out() {
    // Accepts connections at the TCP level but never answers.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let dir = tempfile::tempdir().unwrap();
    let settings = SettingsStore::new(dir.path().join("settings.json"));
    settings
        .save(&ConnectionProfile {
            address: String::from("127.0.0.1"),
            port,
            credential: String::from("T1"),
        })
        .unwrap();
    let client = Client::with_timeout(settings, Duration::from_millis(300)).unwrap();

    let started = Instant::now();
    let outcome = client.dispatch("bell.mp3").await;

    assert!(matches!(outcome, Outcome::Unreachable(_)));
    assert!(started.elapsed() < Duration::from_secs(5));
    drop(listener);
}
