use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::api::{Error, Result};
use crate::config::APP_NAME;

/// Token file name in the cache directory
const TOKEN_FILE: &str = "token";

/// Seconds before expiry at which a cached token stops being reused.
/// Keeps a token from expiring while a request is in flight.
pub const EXPIRY_GRACE_SECS: f64 = 30.0;

/// Current time as fractional seconds since the epoch.
pub fn now_epoch() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub token: String,
    /// Absolute expiry, seconds since the epoch
    pub expiry: f64,
}

impl Credential {
    pub fn new(token: impl Into<String>, expiry: f64) -> Self {
        Self {
            token: token.into(),
            expiry,
        }
    }

    /// The "no cached session" credential.
    pub fn null() -> Self {
        Self {
            token: String::new(),
            expiry: 0.0,
        }
    }

    pub fn is_valid_at(&self, now: f64) -> bool {
        !self.token.is_empty() && self.expiry > now + EXPIRY_GRACE_SECS
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(now_epoch())
    }

    /// Seconds of usable lifetime left, never negative
    pub fn expires_in(&self, now: f64) -> f64 {
        (self.expiry - now).max(0.0)
    }

    fn parse(contents: &str) -> Self {
        let mut fields = contents.split_whitespace();
        let Some(token) = fields.next() else {
            return Self::null();
        };
        let expiry = fields
            .next()
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|value| value.is_finite())
            .unwrap_or(0.0);
        Self::new(token, expiry)
    }
}

/// File-backed store for the session token.
///
/// The record is a single line: `<token> <expiry>`. A missing, unreadable or
/// garbled file reads back as an expired credential so the next login simply
/// re-authenticates.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<cache_dir>/saltline/token`
    pub fn default_path() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| Error::Config("Could not find cache directory".to_string()))?;
        Ok(cache_dir.join(APP_NAME).join(TOKEN_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Credential {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Credential::parse(&contents),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No cached token");
                Credential::null()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Unreadable token file, ignoring");
                Credential::null()
            }
        }
    }

    pub fn write(&self, credential: &Credential) -> Result<()> {
        if credential.token.is_empty() || credential.token.contains(char::is_whitespace) {
            return Err(Error::Usage(
                "session token must be a non-empty string without whitespace".to_string(),
            ));
        }

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        // Unique temp name per writer; concurrent logins just overwrite each other.
        let mut tmp = NamedTempFile::new_in(parent)?;
        restrict_to_owner(tmp.as_file())?;
        writeln!(tmp, "{} {}", credential.token, credential.expiry)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        debug!(path = %self.path.display(), expiry = credential.expiry, "Token cached");
        Ok(())
    }

    pub fn drop(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Token removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn restrict_to_owner(file: &fs::File) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    file.set_permissions(fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_to_owner(_file: &fs::File) -> std::io::Result<()> {
    Ok(())
}
