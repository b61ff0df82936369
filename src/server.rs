//! HTTP command endpoint of the playback daemon.
//!
//! Exactly one route exists: `POST /play` with a bearer credential and a JSON
//! body `{"audio": "<filename>"}`. Every request passes, in order:
//!
//! 1. a per-client rate limit (429)
//! 2. authentication against the current credential (401)
//! 3. body size and shape validation (413, 400)
//! 4. dispatch to the playback engine (200, 404, 409, 502)
//!
//! Each stage answers on failure without running the next one. All responses
//! carry `{"success": bool, "message": string}`.

use std::{
    future::Future,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::NonZeroU32,
    sync::Arc,
};

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, ConnectInfo, DefaultBodyLimit, Request, State},
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderMap, Method, StatusCode,
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use crate::{
    catalog::Catalog,
    config::Config,
    error::{Error, ErrorKind, Result},
    player::{Engine, JobState, ProcessPlayer},
    token::TokenStore,
};

/// The only command path.
pub const PLAY_PATH: &str = "/play";

/// Body of a play request.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PlayRequest {
    pub audio: String,
}

/// Body of every response.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PlayResponse {
    pub success: bool,
    pub message: String,
}

/// Shared state of the request handlers.
#[derive(Clone)]
pub struct AppState {
    tokens: TokenStore,
    engine: Arc<Engine>,
    limiter: Arc<DefaultKeyedRateLimiter<IpAddr>>,
    max_body_bytes: usize,
}

impl AppState {
    /// Number of tracked clients above which idle rate limiter entries are
    /// pruned.
    const LIMITER_PRUNE_THRESHOLD: usize = 1024;

    #[must_use]
    pub fn new(
        tokens: TokenStore,
        engine: Arc<Engine>,
        max_requests_per_minute: NonZeroU32,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            tokens,
            engine,
            limiter: Arc::new(RateLimiter::keyed(Quota::per_minute(max_requests_per_minute))),
            max_body_bytes,
        }
    }

    /// Builds the daemon state from its configuration.
    ///
    /// # Errors
    ///
    /// Fails when the credential has not been issued or cannot be read, or
    /// when the audio directory cannot be opened. These conditions abort
    /// startup.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let tokens = TokenStore::new(&config.token_file);
        tokens.load()?;

        let mut catalog = Catalog::open(&config.audio_dir)?;
        if let Some(ref allowed) = config.allowed {
            catalog = catalog.with_allowed(allowed.iter().cloned());
        }
        info!("audio directory: {}", catalog.root().display());

        let player = ProcessPlayer::new(config.players.clone());
        let engine = Engine::new(catalog, Arc::new(player), config.max_duration());

        let max_requests_per_minute = NonZeroU32::new(config.max_requests_per_minute)
            .ok_or_else(|| Error::invalid_argument("max_requests_per_minute must be positive"))?;

        Ok(Self::new(
            tokens,
            Arc::new(engine),
            max_requests_per_minute,
            config.max_body_bytes,
        ))
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }
}

/// Builds the router with all middleware attached.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION]);

    Router::new()
        .route(PLAY_PATH, post(play))
        .route_layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .layer(DefaultBodyLimit::max(state.max_body_bytes))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(cors)
        .with_state(state)
}

/// Serves `router` on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if accepting connections fails.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    Ok(())
}

fn reply<S: Into<String>>(status: StatusCode, message: S) -> Response {
    let body = PlayResponse {
        success: status.is_success(),
        message: message.into(),
    };

    (status, Json(body)).into_response()
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.kind.status_code();
        match self.kind {
            // Never say why.
            ErrorKind::Unauthenticated => reply(status, "unauthorized"),
            ErrorKind::InvalidArgument
            | ErrorKind::NotFound
            | ErrorKind::Aborted
            | ErrorKind::ResourceExhausted
            | ErrorKind::OutOfRange => reply(status, self.error.to_string()),
            _ => {
                error!("{self}");
                reply(status, self.kind.to_string())
            }
        }
    }
}

fn client_ip(request: &Request) -> IpAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |ConnectInfo(addr)| {
            addr.ip()
        })
}

async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let ip = client_ip(&request);

    if state.limiter.len() > AppState::LIMITER_PRUNE_THRESHOLD {
        state.limiter.retain_recent();
    }

    if state.limiter.check_key(&ip).is_err() {
        warn!("rate limit exceeded for {ip}");
        return Error::resource_exhausted("rate limit exceeded").into_response();
    }

    next.run(request).await
}

/// Extracts the credential from an `Authorization: Bearer <credential>`
/// header.
fn bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, credential) = value.split_once(' ')?;
    let credential = credential.trim();

    (scheme.eq_ignore_ascii_case("Bearer") && !credential.is_empty()).then_some(credential)
}

async fn authenticate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let ip = client_ip(&request);

    let Some(presented) = bearer(request.headers()).map(str::to_owned) else {
        warn!("unauthenticated request from {ip}");
        return Error::unauthenticated("missing credential").into_response();
    };

    // The file is re-read on every request so that re-issuing the credential
    // takes effect without a restart.
    let tokens = state.tokens.clone();
    let credential = match tokio::task::spawn_blocking(move || tokens.load()).await {
        Ok(Ok(credential)) => credential,
        Ok(Err(e)) => {
            error!("cannot load credential: {e}");
            return Error::unauthenticated(e).into_response();
        }
        Err(e) => {
            error!("cannot load credential: {e}");
            return Error::unauthenticated(e.to_string()).into_response();
        }
    };

    if !credential.verify(&presented) {
        warn!("invalid credential from {ip}");
        return Error::unauthenticated("invalid credential").into_response();
    }

    next.run(request).await
}

async fn play(
    State(state): State<AppState>,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            return Error::out_of_range("request too large").into_response();
        }
        Err(rejection) => {
            debug!("unreadable request body: {rejection}");
            return Error::invalid_argument("invalid request body").into_response();
        }
    };

    if body.is_empty() {
        return Error::invalid_argument("empty request").into_response();
    }

    let request: PlayRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!("malformed request body: {e}");
            return Error::invalid_argument("invalid JSON data").into_response();
        }
    };

    if request.audio.is_empty() {
        return Error::invalid_argument("no audio file specified").into_response();
    }

    match state.engine.play(&request.audio).await {
        Ok(job) if job.state == JobState::Completed => {
            info!("played announcement: {}", job.audio);
            reply(StatusCode::OK, format!("played {}", job.audio))
        }
        Ok(job) => {
            let diagnostic = job.diagnostic.unwrap_or_else(|| job.state.to_string());
            reply(
                StatusCode::BAD_GATEWAY,
                format!("playback failed: {diagnostic}"),
            )
        }
        Err(e) => {
            if e.kind != ErrorKind::Aborted {
                warn!("rejected {}: {e}", request.audio);
            }
            e.into_response()
        }
    }
}

async fn not_found() -> Response {
    reply(StatusCode::NOT_FOUND, "endpoint not found")
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn bearer_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer(&headers), Some("abc"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer  abc "));
        assert_eq!(bearer(&headers), Some("abc"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer(&headers), None);
    }

    #[test]
    fn unauthenticated_reply_reveals_nothing() {
        let response = Error::unauthenticated("token file missing at /secret").into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
