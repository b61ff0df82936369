//! The set of announcement files the daemon is willing to play.
//!
//! Identifiers arrive from the network and are untrusted. They are checked
//! syntactically before any filesystem access, and the resolved path must
//! still lie inside the audio directory after symbolic links are followed.

use std::{
    collections::BTreeSet,
    fs, io,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex_lite::Regex;

use crate::error::{Error, Result};

/// Filenames are restricted to a conservative character set.
static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("identifier pattern is valid"));

/// Longest identifier accepted, well below any filesystem name limit.
const MAX_IDENTIFIER_LEN: usize = 128;

/// Read-only view of the audio directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Catalog {
    root: PathBuf,
    allowed: Option<BTreeSet<String>>,
}

impl Catalog {
    /// Opens the audio directory, creating it when missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or resolved.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.exists() {
            fs::create_dir_all(dir)?;
            info!("created audio directory {}", dir.display());
        }

        let root = dir.canonicalize()?;
        if !root.is_dir() {
            return Err(Error::invalid_argument(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        Ok(Self {
            root,
            allowed: None,
        })
    }

    /// Limits the catalog to the given identifiers.
    #[must_use]
    pub fn with_allowed<I, S>(mut self, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = Some(allowed.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Checks that `identifier` is a bare, well-formed filename.
    ///
    /// This touches no filesystem state.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for empty, overlong or unsafe identifiers.
    pub fn validate(identifier: &str) -> Result<()> {
        if identifier.is_empty() {
            return Err(Error::invalid_argument("no audio file specified"));
        }

        if identifier.len() > MAX_IDENTIFIER_LEN
            || identifier.starts_with('.')
            || identifier.contains("..")
            || !IDENTIFIER.is_match(identifier)
        {
            return Err(Error::invalid_argument("invalid audio file name"));
        }

        Ok(())
    }

    /// Resolves an identifier to a regular file inside the audio directory.
    ///
    /// # Errors
    ///
    /// * `InvalidArgument` if the identifier is malformed or resolves outside
    ///   the audio directory
    /// * `NotFound` if it is not allowed, does not exist or is not a regular
    ///   file
    pub async fn resolve(&self, identifier: &str) -> Result<PathBuf> {
        Self::validate(identifier)?;

        if let Some(ref allowed) = self.allowed {
            if !allowed.contains(identifier) {
                return Err(Self::not_found(identifier));
            }
        }

        let candidate = self.root.join(identifier);
        let resolved = match tokio::fs::canonicalize(&candidate).await {
            Ok(resolved) => resolved,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("cannot resolve {identifier}: {e}");
                }
                return Err(Self::not_found(identifier));
            }
        };

        // A symbolic link may point anywhere.
        if !resolved.starts_with(&self.root) {
            warn!("{identifier} resolves outside the audio directory");
            return Err(Error::invalid_argument("invalid audio file name"));
        }

        match tokio::fs::metadata(&resolved).await {
            Ok(metadata) if metadata.is_file() => Ok(resolved),
            Ok(_) => Err(Self::not_found(identifier)),
            Err(e) => {
                warn!("cannot inspect {identifier}: {e}");
                Err(Self::not_found(identifier))
            }
        }
    }

    /// Filesystem failures are reported without host paths.
    fn not_found(identifier: &str) -> Error {
        Error::not_found(format!("audio file not found: {identifier}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn catalog_with(files: &[&str]) -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("audio");
        fs::create_dir(&audio).unwrap();
        for file in files {
            fs::write(audio.join(file), b"ID3").unwrap();
        }
        let catalog = Catalog::open(&audio).unwrap();
        (dir, catalog)
    }

    #[test]
    fn open_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("missing");

        let catalog = Catalog::open(&audio).unwrap();

        assert!(audio.is_dir());
        assert_eq!(catalog.root(), audio.canonicalize().unwrap());
    }

    #[test]
    fn traversal_and_separators_are_rejected() {
        for identifier in [
            "",
            "..",
            "../bell.mp3",
            "..\\bell.mp3",
            "sub/bell.mp3",
            "/etc/passwd",
            ".hidden.mp3",
            "bell..mp3",
            "bell.mp3\0",
            "bell mp3",
        ] {
            let err = Catalog::validate(identifier).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidArgument, "{identifier:?}");
        }
    }

    #[test]
    fn ordinary_names_are_accepted() {
        for identifier in ["bell.mp3", "dog-arrived.mp3", "chime_02.wav"] {
            assert!(Catalog::validate(identifier).is_ok(), "{identifier}");
        }
    }

    #[tokio::test]
    async fn resolve_finds_existing_file() {
        let (_dir, catalog) = catalog_with(&["bell.mp3"]);

        let path = catalog.resolve("bell.mp3").await.unwrap();

        assert!(path.starts_with(catalog.root()));
        assert!(path.ends_with("bell.mp3"));
    }

    #[tokio::test]
    async fn resolve_reports_missing_file() {
        let (_dir, catalog) = catalog_with(&["bell.mp3"]);

        let err = catalog.resolve("missing.mp3").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn directories_are_not_playable() {
        let (_dir, catalog) = catalog_with(&[]);
        fs::create_dir(catalog.root().join("folder.mp3")).unwrap();

        let err = catalog.resolve("folder.mp3").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn allow_list_hides_other_files() {
        let (_dir, catalog) = catalog_with(&["bell.mp3", "other.mp3"]);
        let catalog = catalog.with_allowed(["bell.mp3"]);

        assert!(catalog.resolve("bell.mp3").await.is_ok());
        let err = catalog.resolve("other.mp3").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escaping_the_directory_is_rejected() {
        let (dir, catalog) = catalog_with(&[]);
        let outside = dir.path().join("secret.mp3");
        fs::write(&outside, b"nope").unwrap();
        std::os::unix::fs::symlink(&outside, catalog.root().join("link.mp3")).unwrap();

        let err = catalog.resolve("link.mp3").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }
}
