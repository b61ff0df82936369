//! Controller-side client that asks the daemon to play an announcement.
//!
//! Each dispatch reads the saved connection profile, sends one authenticated
//! request with a short timeout and reports what happened. There is no retry:
//! an announcement that arrives late is worse than one that is reported as
//! failed right away.
//!
//! # Example
//!
//! ```no_run
//! use chime::{client::Client, settings::SettingsStore};
//!
//! # async fn example() -> chime::error::Result<()> {
//! let client = Client::new(SettingsStore::new("settings.json"))?;
//! let outcome = client.dispatch("dog-arrived.mp3").await;
//! println!("{outcome}");
//! # Ok(())
//! # }
//! ```

use std::{fmt, net::Ipv6Addr, time::Duration};

use http::StatusCode;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use url::Url;

use crate::{
    error::{Error, Result},
    server::{PlayRequest, PlayResponse, PLAY_PATH},
    settings::{ConnectionProfile, SettingsStore},
};

/// Why a reachable daemon declined to play.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RejectReason {
    Unauthorized,
    Malformed(String),
    NotFound(String),
    Busy,
    PlaybackFailed(String),
    RateLimited,
    Other { status: u16, message: String },
}

/// Result of a single dispatch as shown to the operator.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The announcement was played.
    Delivered,
    /// The daemon answered but did not play the announcement.
    Rejected(RejectReason),
    /// The daemon could not be reached in time.
    Unreachable(String),
}

impl Outcome {
    #[must_use]
    pub fn is_delivered(&self) -> bool {
        matches!(self, Outcome::Delivered)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Delivered => write!(f, "announcement played"),
            Outcome::Unreachable(reason) => write!(f, "cannot reach the speaker: {reason}"),
            Outcome::Rejected(reason) => match reason {
                RejectReason::Unauthorized => {
                    write!(f, "the speaker rejected the API token; check the settings")
                }
                RejectReason::Malformed(message) => write!(f, "invalid request: {message}"),
                RejectReason::NotFound(message) => write!(f, "{message}"),
                RejectReason::Busy => {
                    write!(f, "another announcement is playing; try again when it ends")
                }
                RejectReason::PlaybackFailed(message) => {
                    write!(f, "the announcement did not play: {message}")
                }
                RejectReason::RateLimited => {
                    write!(f, "too many announcements; wait a moment and try again")
                }
                RejectReason::Other { status, message } => {
                    write!(f, "unexpected answer from the speaker ({status}): {message}")
                }
            },
        }
    }
}

/// Maps a daemon response to an [`Outcome`].
#[must_use]
pub fn classify(status: StatusCode, message: String) -> Outcome {
    if status.is_success() {
        return Outcome::Delivered;
    }

    let reason = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RejectReason::Unauthorized,
        StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE => RejectReason::Malformed(message),
        StatusCode::NOT_FOUND => RejectReason::NotFound(message),
        StatusCode::CONFLICT => RejectReason::Busy,
        StatusCode::TOO_MANY_REQUESTS => RejectReason::RateLimited,
        StatusCode::BAD_GATEWAY => RejectReason::PlaybackFailed(message),
        _ => RejectReason::Other {
            status: status.as_u16(),
            message,
        },
    };

    Outcome::Rejected(reason)
}

/// Issues play commands to the daemon described by a [`SettingsStore`].
pub struct Client {
    settings: SettingsStore,
    http: reqwest::Client,
}

impl Client {
    /// Upper bound on a whole request. On a local network anything slower
    /// means the daemon is stalled or gone.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(settings: SettingsStore) -> Result<Self> {
        Self::with_timeout(settings, Self::DEFAULT_TIMEOUT)
    }

    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_timeout(settings: SettingsStore, timeout: Duration) -> Result<Self> {
        let user_agent = format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .no_proxy()
            .user_agent(user_agent)
            .build()?;

        Ok(Self { settings, http })
    }

    /// Builds the command URL for `profile`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the address does not form a valid URL.
    pub fn endpoint(profile: &ConnectionProfile) -> Result<Url> {
        let address = profile.address.trim();
        if address.is_empty() {
            return Err(Error::failed_precondition("speaker address not configured"));
        }

        let host = if address.parse::<Ipv6Addr>().is_ok() {
            format!("[{address}]")
        } else {
            address.to_owned()
        };

        let url = Url::parse(&format!("http://{host}:{}{PLAY_PATH}", profile.port))?;
        Ok(url)
    }

    /// Asks the daemon to play `audio` and waits for the result.
    pub async fn dispatch(&self, audio: &str) -> Outcome {
        let profile = self.settings.get();

        let url = match Self::endpoint(&profile) {
            Ok(url) => url,
            Err(e) => return Outcome::Unreachable(e.error.to_string()),
        };

        let mut request = self.http.post(url.clone()).json(&PlayRequest {
            audio: audio.to_owned(),
        });

        match HeaderValue::from_str(&format!("Bearer {}", profile.credential.trim())) {
            Ok(mut value) => {
                value.set_sensitive(true);
                request = request.header(AUTHORIZATION, value);
            }
            Err(_) => warn!("API token contains invalid characters, sending none"),
        }

        debug!("dispatching {audio} to {url}");
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let e = Error::from(e);
                warn!("dispatching {audio} failed: {e}");
                return Outcome::Unreachable(e.kind.to_string());
            }
        };

        let status = response.status();
        let message = match response.json::<PlayResponse>().await {
            Ok(body) => body.message,
            Err(_) => status
                .canonical_reason()
                .unwrap_or("unknown status")
                .to_owned(),
        };

        let outcome = classify(status, message);
        if outcome.is_delivered() {
            info!("{audio}: {outcome}");
        } else {
            warn!("{audio}: {outcome}");
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(address: &str, port: u16) -> ConnectionProfile {
        ConnectionProfile {
            address: address.to_owned(),
            port,
            credential: String::from("T1"),
        }
    }

    #[test]
    fn endpoint_from_profile() {
        assert_eq!(
            Client::endpoint(&profile("192.168.1.50", 8080)).unwrap().as_str(),
            "http://192.168.1.50:8080/play"
        );
        assert_eq!(
            Client::endpoint(&profile("pi.local", 9000)).unwrap().as_str(),
            "http://pi.local:9000/play"
        );
        assert_eq!(
            Client::endpoint(&profile("::1", 8080)).unwrap().as_str(),
            "http://[::1]:8080/play"
        );
    }

    #[test]
    fn empty_address_is_not_configured() {
        assert!(Client::endpoint(&profile("", 8080)).is_err());
    }

    #[test]
    fn statuses_map_to_reasons() {
        let message = || String::from("msg");

        assert_eq!(classify(StatusCode::OK, message()), Outcome::Delivered);
        assert_eq!(
            classify(StatusCode::UNAUTHORIZED, message()),
            Outcome::Rejected(RejectReason::Unauthorized)
        );
        assert_eq!(
            classify(StatusCode::CONFLICT, message()),
            Outcome::Rejected(RejectReason::Busy)
        );
        assert_eq!(
            classify(StatusCode::NOT_FOUND, message()),
            Outcome::Rejected(RejectReason::NotFound(message()))
        );
        assert_eq!(
            classify(StatusCode::BAD_REQUEST, message()),
            Outcome::Rejected(RejectReason::Malformed(message()))
        );
        assert_eq!(
            classify(StatusCode::BAD_GATEWAY, message()),
            Outcome::Rejected(RejectReason::PlaybackFailed(message()))
        );
        assert_eq!(
            classify(StatusCode::IM_A_TEAPOT, message()),
            Outcome::Rejected(RejectReason::Other {
                status: 418,
                message: message()
            })
        );
    }

    #[tokio::test]
    async fn unconfigured_client_does_not_touch_the_network() {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::new(SettingsStore::new(dir.path().join("settings.json"))).unwrap();

        assert_eq!(
            client.dispatch("bell.mp3").await,
            Outcome::Unreachable(String::from("speaker address not configured"))
        );
    }
}
