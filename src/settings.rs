//! Controller-side connection settings.
//!
//! The profile is stored as a small JSON document using the key names of the
//! controller application (`piAddress`, `piPort`, `apiToken`). Saving writes a
//! temporary file next to the target and renames it into place, so an
//! interrupted save leaves the previous profile intact.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use veil::Redact;

use crate::error::{Error, Result};

/// Where and how to reach the daemon.
#[derive(Clone, PartialEq, Eq, Hash, Deserialize, Serialize, Redact)]
pub struct ConnectionProfile {
    #[serde(rename = "piAddress")]
    pub address: String,

    #[serde(rename = "piPort")]
    pub port: u16,

    #[serde(rename = "apiToken")]
    #[redact]
    pub credential: String,
}

impl Default for ConnectionProfile {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 8080,
            credential: String::new(),
        }
    }
}

impl ConnectionProfile {
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the port is zero or the address contains
    /// whitespace or a scheme.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::invalid_argument("port must be between 1 and 65535"));
        }

        let address = self.address.trim();
        if address.contains(char::is_whitespace) || address.contains("://") {
            return Err(Error::invalid_argument(format!(
                "\"{address}\" is not a host name or IP address"
            )));
        }

        Ok(())
    }
}

/// Persists a single [`ConnectionProfile`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    const MAX_FILE_SIZE: u64 = 16 * 1024;

    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the last saved profile, or the default one if nothing usable
    /// has been saved.
    #[must_use]
    pub fn get(&self) -> ConnectionProfile {
        match self.read() {
            Ok(profile) => profile,
            Err(e) if e.kind() == io::ErrorKind::NotFound => ConnectionProfile::default(),
            Err(e) => {
                warn!(
                    "ignoring settings in {}: {e}; using defaults",
                    self.path.display()
                );
                ConnectionProfile::default()
            }
        }
    }

    /// Validates and atomically persists `profile`.
    ///
    /// # Errors
    ///
    /// Returns an error if the profile is invalid or cannot be written. The
    /// previously saved profile is untouched in either case.
    pub fn save(&self, profile: &ConnectionProfile) -> Result<()> {
        profile.validate()?;

        let mut profile = profile.clone();
        profile.address = profile.address.trim().to_owned();
        profile.credential = profile.credential.trim().to_owned();

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut temp_name = self.path.file_name().unwrap_or_default().to_owned();
        temp_name.push(".tmp");
        let temp = self.path.with_file_name(temp_name);

        let json = serde_json::to_vec_pretty(&profile)?;
        let result = Self::write_file(&temp, &json).and_then(|()| fs::rename(&temp, &self.path));
        if let Err(e) = result {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }

        debug!("settings saved to {}", self.path.display());
        Ok(())
    }

    fn read(&self) -> io::Result<ConnectionProfile> {
        let attributes = fs::metadata(&self.path)?;
        if attributes.len() > Self::MAX_FILE_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "file is too large"));
        }

        let contents = fs::read(&self.path)?;
        let profile: ConnectionProfile = serde_json::from_slice(&contents)?;
        profile
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        Ok(profile)
    }

    fn write_file(path: &Path, contents: &[u8]) -> io::Result<()> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);

        // The profile holds the credential.
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(path)?;
        file.write_all(contents)?;
        file.sync_all()
    }
}
