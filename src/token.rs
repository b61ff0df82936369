//! Shared-secret credential that authorizes a controller to the daemon.
//!
//! The credential is generated once with the operating system's random number
//! generator, written to a file that only the daemon's user can read, and
//! printed once for the operator. Re-issuing it replaces the file, which
//! immediately invalidates every copy handed out before.
//!
//! # Example
//!
//! ```no_run
//! use chime::token::TokenStore;
//!
//! let store = TokenStore::new("/var/lib/chime/token");
//! let credential = store.issue()?;
//! assert!(store.load()?.verify(credential.expose()));
//! # Ok::<(), chime::error::Error>(())
//! ```

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use veil::Redact;

use crate::error::{Error, Result};

/// An opaque random secret.
///
/// Never printed through `Debug`; use [`Credential::expose`] where the raw
/// value is really needed.
#[derive(Clone, Redact)]
#[redact(all)]
pub struct Credential(String);

impl Credential {
    /// Number of random bytes in a generated credential (256 bits).
    pub const ENTROPY_BYTES: usize = 32;

    /// Generates a fresh URL-safe credential.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0_u8; Self::ENTROPY_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Returns the raw credential string.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Compares a presented value against this credential in constant time.
    ///
    /// Both sides are hashed first so that neither the contents nor the
    /// length of the stored credential influence the comparison time.
    #[must_use]
    pub fn verify(&self, presented: &str) -> bool {
        let expected = Sha256::digest(self.0.as_bytes());
        let actual = Sha256::digest(presented.as_bytes());

        expected
            .iter()
            .zip(actual.iter())
            .fold(0_u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl From<String> for Credential {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Persists the daemon's single credential at a fixed path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    /// Upper bound on the credential file size, so that a wrong path cannot
    /// make the daemon read an arbitrarily large file.
    const MAX_FILE_SIZE: u64 = 1024;

    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Generates a new credential and writes it with owner-only permissions,
    /// replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory or the file cannot be
    /// written.
    pub fn issue(&self) -> Result<Credential> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let credential = Credential::generate();

        let mut file = Self::open_private(&self.path)?;
        file.write_all(credential.expose().as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;

        info!("credential written to {}", self.path.display());
        Ok(credential)
    }

    /// Reads the current credential.
    ///
    /// # Errors
    ///
    /// Returns `FailedPrecondition` if no credential has been issued yet, and
    /// `InvalidArgument` if the file is too large or empty.
    pub fn load(&self) -> Result<Credential> {
        let attributes = match fs::metadata(&self.path) {
            Ok(attributes) => attributes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::failed_precondition(format!(
                    "no credential at {}; issue one first",
                    self.path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        if attributes.len() > Self::MAX_FILE_SIZE {
            return Err(Error::invalid_argument(format!(
                "{} is too large",
                self.path.display()
            )));
        }

        let contents = fs::read_to_string(&self.path)?;
        let value = contents.trim();
        if value.is_empty() {
            return Err(Error::invalid_argument(format!(
                "{} does not contain a credential",
                self.path.display()
            )));
        }

        Ok(Credential(value.to_owned()))
    }

    #[cfg(unix)]
    fn open_private(path: &Path) -> io::Result<fs::File> {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;

        // `mode` only applies on creation; tighten a pre-existing file too.
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
        Ok(file)
    }

    #[cfg(not(unix))]
    fn open_private(path: &Path) -> io::Result<fs::File> {
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
    }
}
