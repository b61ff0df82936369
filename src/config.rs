use std::{
    fs,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{
    error::{Error, Result},
    player::{PlayerCommand, ProcessPlayer},
};

/// Daemon configuration.
///
/// Every key may be omitted from the configuration file; missing keys take
/// their default value.
///
/// ```toml
/// port = 8080
/// audio_dir = "/home/pi/announcement-server/audio"
/// token_file = "/home/pi/announcement-server/token"
/// players = [["mpg123", "-q"], ["aplay", "-q"]]
/// allowed = ["dog-arrived.mp3", "assistance-required.mp3"]
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub listen: IpAddr,
    pub port: u16,

    pub audio_dir: PathBuf,
    pub token_file: PathBuf,

    pub players: Vec<PlayerCommand>,
    pub max_duration_secs: u64,

    pub max_requests_per_minute: u32,
    pub max_body_bytes: usize,

    pub allowed: Option<Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,

            audio_dir: PathBuf::from("audio"),
            token_file: PathBuf::from("token"),

            players: ProcessPlayer::default().commands().to_vec(),
            max_duration_secs: 30,

            max_requests_per_minute: 30,
            max_body_bytes: 1024,

            allowed: None,
        }
    }
}

impl Config {
    /// Prevent out-of-memory condition: configuration files should be small.
    const MAX_FILE_SIZE: u64 = 64 * 1024;

    /// Reads and validates a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid TOML, or
    /// holds values that fail [`Config::validate`].
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let attributes = fs::metadata(path)?;
        if attributes.len() > Self::MAX_FILE_SIZE {
            return Err(Error::out_of_range(format!(
                "{} is too large",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        Ok(config)
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` for a zero port, rate limit, duration or
    /// body size, and for a player list without any program.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::invalid_argument("port must be between 1 and 65535"));
        }

        if self.max_requests_per_minute == 0 {
            return Err(Error::invalid_argument(
                "max_requests_per_minute must be positive",
            ));
        }

        if self.max_duration_secs == 0 {
            return Err(Error::invalid_argument("max_duration_secs must be positive"));
        }

        if self.max_body_bytes == 0 {
            return Err(Error::invalid_argument("max_body_bytes must be positive"));
        }

        if self.players.iter().all(|command| command.program.is_empty()) {
            return Err(Error::invalid_argument("no audio player configured"));
        }

        Ok(())
    }

    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen, self.port)
    }

    #[must_use]
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();

        assert_eq!(config.socket_addr().to_string(), "0.0.0.0:8080");
        assert_eq!(config.max_duration(), Duration::from_secs(30));
        assert_eq!(config.players[0].program, "omxplayer");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chime.toml");
        fs::write(
            &path,
            r#"
port = 9090
players = [["mpg123", "-q"]]
allowed = ["bell.mp3"]
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();

        assert_eq!(config.port, 9090);
        assert_eq!(config.players, vec![PlayerCommand::new("mpg123", &["-q"])]);
        assert_eq!(config.allowed, Some(vec![String::from("bell.mp3")]));
        assert_eq!(config.max_requests_per_minute, 30);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chime.toml");

        fs::write(&path, "port = 0").unwrap();
        assert_eq!(
            Config::from_file(&path).unwrap_err().kind,
            ErrorKind::InvalidArgument
        );

        fs::write(&path, "prot = 80").unwrap();
        assert_eq!(
            Config::from_file(&path).unwrap_err().kind,
            ErrorKind::InvalidArgument
        );
    }
}
