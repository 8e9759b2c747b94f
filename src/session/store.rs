//! Durable storage of the authenticated browser state, one file per profile

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PortalError, PortalResult};

/// Opaque storage-state blob with its freshness timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredState {
    pub blob: Vec<u8>,
    pub saved_at: DateTime<Utc>,
}

impl StoredState {
    /// Age relative to `now`, zero for timestamps in the future
    pub fn age(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.saved_at).to_std().unwrap_or_default()
    }
}

/// On-disk envelope
#[derive(Serialize, Deserialize)]
struct StateFile {
    profile: String,
    saved_at: DateTime<Utc>,
    state: String,
}

/// Reads and writes the persisted session for a single profile key
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
    profile: String,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>, profile: impl Into<String>) -> PortalResult<Self> {
        let profile = profile.into();
        if profile.is_empty()
            || !profile
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            || profile.starts_with('.')
        {
            return Err(PortalError::InvalidRequest(format!(
                "Profile key '{profile}' must be non-empty and use only [A-Za-z0-9._-]"
            )));
        }
        Ok(Self {
            dir: dir.into(),
            profile,
        })
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{}.session.json", self.profile))
    }

    /// Load the stored state, `None` when nothing has been saved yet
    pub async fn load(&self) -> PortalResult<Option<StoredState>> {
        let path = self.path();
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PortalError::Storage(format!("{}: {}", path.display(), e))),
        };

        let file: StateFile = serde_json::from_str(&contents)
            .map_err(|e| PortalError::Storage(format!("Corrupt session file {}: {}", path.display(), e)))?;
        if file.profile != self.profile {
            return Err(PortalError::Storage(format!(
                "Session file {} belongs to profile '{}'",
                path.display(),
                file.profile
            )));
        }
        let blob = STANDARD
            .decode(file.state.as_bytes())
            .map_err(|e| PortalError::Storage(format!("Corrupt session state in {}: {}", path.display(), e)))?;

        debug!("Loaded stored session for profile '{}' saved at {}", self.profile, file.saved_at);
        Ok(Some(StoredState {
            blob,
            saved_at: file.saved_at,
        }))
    }

    /// Persist `blob` atomically and return what was written
    pub async fn save(&self, blob: &[u8]) -> PortalResult<StoredState> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let saved_at = Utc::now();
        let file = StateFile {
            profile: self.profile.clone(),
            saved_at,
            state: STANDARD.encode(blob),
        };
        let json = serde_json::to_vec_pretty(&file)?;

        let path = self.path();
        let tmp = self.dir.join(format!(".{}.session.json.tmp", self.profile));
        tokio::fs::write(&tmp, &json).await?;
        restrict_permissions(&tmp).await?;
        tokio::fs::rename(&tmp, &path).await?;

        info!("Saved session state for profile '{}' ({} bytes)", self.profile, blob.len());
        Ok(StoredState {
            blob: blob.to_vec(),
            saved_at,
        })
    }

    /// Remove the stored state; missing files are fine
    pub async fn clear(&self) -> PortalResult<()> {
        match tokio::fs::remove_file(self.path()).await {
            Ok(()) => {
                info!("Cleared stored session for profile '{}'", self.profile);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> PortalResult<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> PortalResult<()> {
    Ok(())
}
