//! Small JSON state files
//!
//! Job records, the endpoint registry and leases are each a single JSON
//! document under the state directory. Writes go to a temp file that is then
//! renamed over the target, so readers never observe a half-written file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tracing::debug;

/// Errors reading or writing a state file.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// I/O error reading or writing the file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file content could not be parsed.
    #[error("corrupt state file {path:?}: {reason}")]
    Corrupt {
        /// Offending file.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },
}

/// Serialize `value` to `path` atomically, creating parent directories.
pub async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let content = serde_json::to_vec_pretty(value).map_err(|e| PersistError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    // Unique temp name so concurrent writers never share a temp file.
    let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp, &content).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    debug!(path = %path.display(), bytes = content.len(), "state file written");
    Ok(())
}

/// Read a JSON document. A missing file is `Ok(None)`.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistError> {
    let content = match fs::read(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|e| PersistError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Remove a file. Returns whether it existed.
pub async fn remove(path: &Path) -> Result<bool, PersistError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        n: u64,
    }

    #[tokio::test]
    async fn test_round_trip_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/doc.json");
        let doc = Doc {
            name: "a".into(),
            n: 7,
        };
        write_json(&path, &doc).await.unwrap();
        assert_eq!(read_json::<Doc>(&path).await.unwrap(), Some(doc));
    }

    #[tokio::test]
    async fn test_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert!(read_json::<Doc>(&path).await.unwrap().is_none());
        assert!(!remove(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(matches!(
            read_json::<Doc>(&path).await,
            Err(PersistError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_overwrite_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        for n in 0..3 {
            write_json(&path, &Doc { name: "x".into(), n }).await.unwrap();
        }
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(read_json::<Doc>(&path).await.unwrap().unwrap().n, 2);
    }
}
