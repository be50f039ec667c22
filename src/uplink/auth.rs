//! Bearer token sources for the ingestion endpoint
//!
//! The worker never stores tokens itself: every send asks the provider, and an
//! auth failure calls `refresh()` so the next send picks up a new token.

use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// Supplies the bearer token attached to each outbound batch
pub trait TokenProvider: Send + Sync {
    /// Current token, or `None` when the device is not logged in.
    fn token(&self) -> Option<String>;

    /// Signal that the current token was rejected or is missing.
    fn refresh(&self);
}

/// Fixed token (tests, or deployments with a long-lived device key)
#[derive(Debug, Clone)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    /// A provider that never has a token
    pub fn none() -> Self {
        Self(None)
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }

    fn refresh(&self) {}
}

/// Token persisted in a single file, written by the login flow
///
/// Reads are cached; `refresh()` drops the cache so the next `token()` call
/// re-reads the file.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    cached: RwLock<Option<String>>,
}

impl FileTokenStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cached: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a token (temp file + rename, so a crash never leaves half a token).
    pub fn save(&self, token: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("tmp");
        let written = std::fs::write(&tmp_path, token.trim())
            .and_then(|()| std::fs::rename(&tmp_path, &self.path));
        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e);
        }

        if let Ok(mut cached) = self.cached.write() {
            *cached = Some(token.trim().to_string());
        }
        info!(path = %self.path.display(), "Auth token saved");
        Ok(())
    }

    /// Remove the stored token (logout).
    pub fn clear(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        if let Ok(mut cached) = self.cached.write() {
            *cached = None;
        }
        info!(path = %self.path.display(), "Auth token cleared");
        Ok(())
    }

    fn read_from_disk(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let token = contents.trim();
                (!token.is_empty()).then(|| token.to_string())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Could not read auth token");
                None
            }
        }
    }
}

impl TokenProvider for FileTokenStore {
    fn token(&self) -> Option<String> {
        if let Ok(cached) = self.cached.read() {
            if cached.is_some() {
                return cached.clone();
            }
        }

        let token = self.read_from_disk();
        if let Ok(mut cached) = self.cached.write() {
            cached.clone_from(&token);
        }
        token
    }

    fn refresh(&self) {
        if let Ok(mut cached) = self.cached.write() {
            *cached = None;
        }
        debug!(path = %self.path.display(), "Auth token cache invalidated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_token() {
        assert_eq!(StaticToken::new("abc").token().as_deref(), Some("abc"));
        assert!(StaticToken::none().token().is_none());
    }

    #[test]
    fn test_file_store_save_and_clear() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(tmp.path().join("auth").join("token"));

        assert!(store.token().is_none());

        store.save("jwt-123\n").unwrap();
        assert_eq!(store.token().as_deref(), Some("jwt-123"));

        store.clear().unwrap();
        assert!(store.token().is_none());
        // Clearing twice is fine
        store.clear().unwrap();
    }

    #[test]
    fn test_refresh_picks_up_external_change() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("token");
        let store = FileTokenStore::new(&path);

        store.save("old").unwrap();
        std::fs::write(&path, "new").unwrap();
        assert_eq!(store.token().as_deref(), Some("old"));

        store.refresh();
        assert_eq!(store.token().as_deref(), Some("new"));
    }

    #[test]
    fn test_blank_file_is_no_token() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("token");
        std::fs::write(&path, "   \n").unwrap();
        assert!(FileTokenStore::new(&path).token().is_none());
    }
}
