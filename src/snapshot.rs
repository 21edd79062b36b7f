//! Persistence for captured session state.
//!
//! The state file is the raw blob: exactly `state_size()` bytes, no header,
//! no checksum, no version. Whoever loads it is responsible for restoring it
//! only into a session built from the same model and context parameters;
//! the size check is the only guard.
//!
//! History and position are harness metadata, not part of the blob.
//! [`SnapshotStore::save_snapshot`] writes them to a JSON sidecar next to
//! the state file (`<path>.meta.json`).

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::engine::TokenId;
use crate::session::{StateBuffer, TokenHistory};

/// Errors from saving or loading snapshots
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write state to {}: {actual} of {expected} bytes written", path.display())]
    ShortWrite {
        path: PathBuf,
        expected: usize,
        actual: u64,
    },

    #[error("Failed to read state: got {actual} of {expected} bytes")]
    ShortRead { expected: usize, actual: usize },

    #[error("Snapshot file holds {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: u64 },

    #[error("Invalid snapshot metadata: {0}")]
    Metadata(String),
}

/// A captured state plus what the harness needs to resume from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub state: StateBuffer,
    pub history: TokenHistory,
    pub n_past: usize,
}

/// Sidecar contents
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotMeta {
    state_size: usize,
    n_past: usize,
    history_capacity: usize,
    history: Vec<TokenId>,
}

/// Reads and writes state blobs.
pub struct SnapshotStore;

impl SnapshotStore {
    /// Write the whole blob to `path`.
    ///
    /// A write that leaves fewer bytes on disk than the blob holds is an
    /// error, and the truncated file is removed.
    pub fn save(path: &Path, state: &StateBuffer) -> Result<(), SnapshotError> {
        let io_err = |source| SnapshotError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut file = File::create(path).map_err(io_err)?;
        let written = file
            .write_all(state.as_slice())
            .and_then(|()| file.flush())
            .and_then(|()| file.sync_all());
        drop(file);

        if let Err(e) = written {
            return Err(discard_failed_write(path, state.len(), e));
        }

        let on_disk = fs::metadata(path).map_err(io_err)?.len();
        if on_disk != state.len() as u64 {
            remove_partial(path);
            return Err(SnapshotError::ShortWrite {
                path: path.to_path_buf(),
                expected: state.len(),
                actual: on_disk,
            });
        }

        info!("Saved {} bytes of state to {}", state.len(), path.display());
        Ok(())
    }

    /// Read exactly `expected_size` bytes from `path`.
    ///
    /// A shorter file is a [`SnapshotError::ShortRead`]; a longer one is a
    /// [`SnapshotError::SizeMismatch`]. Neither is padded nor truncated.
    pub fn load(path: &Path, expected_size: usize) -> Result<StateBuffer, SnapshotError> {
        let io_err = |source| SnapshotError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut file = File::open(path).map_err(io_err)?;
        let file_len = file.metadata().map_err(io_err)?.len();
        if file_len > expected_size as u64 {
            return Err(SnapshotError::SizeMismatch {
                expected: expected_size,
                actual: file_len,
            });
        }
        // Nothing is allocated for a file that cannot hold the blob
        if file_len < expected_size as u64 {
            return Err(SnapshotError::ShortRead {
                expected: expected_size,
                actual: file_len as usize,
            });
        }

        let mut data = Vec::with_capacity(expected_size);
        let read = (&mut file)
            .take(expected_size as u64)
            .read_to_end(&mut data)
            .map_err(io_err)?;
        if read != expected_size {
            return Err(SnapshotError::ShortRead {
                expected: expected_size,
                actual: read,
            });
        }

        debug!("Loaded {} bytes of state from {}", read, path.display());
        Ok(StateBuffer::from_vec(data))
    }

    /// Save the blob and its history/position sidecar.
    pub fn save_snapshot(path: &Path, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        Self::save(path, &snapshot.state)?;

        let meta = SnapshotMeta {
            state_size: snapshot.state.len(),
            n_past: snapshot.n_past,
            history_capacity: snapshot.history.capacity(),
            history: snapshot.history.to_vec(),
        };
        let meta_path = meta_path(path);
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| SnapshotError::Metadata(e.to_string()))?;
        fs::write(&meta_path, json).map_err(|source| SnapshotError::Io {
            path: meta_path.clone(),
            source,
        })?;
        debug!("Wrote snapshot metadata to {}", meta_path.display());
        Ok(())
    }

    /// Load a snapshot written by [`SnapshotStore::save_snapshot`].
    ///
    /// The sidecar must record exactly `expected_size` bytes of state; the
    /// blob is only read after that check passes.
    pub fn load_snapshot(path: &Path, expected_size: usize) -> Result<Snapshot, SnapshotError> {
        let meta_path = meta_path(path);
        let json = fs::read(&meta_path).map_err(|source| SnapshotError::Io {
            path: meta_path.clone(),
            source,
        })?;
        let meta: SnapshotMeta =
            serde_json::from_slice(&json).map_err(|e| SnapshotError::Metadata(e.to_string()))?;
        if meta.history.len() > meta.history_capacity {
            return Err(SnapshotError::Metadata(format!(
                "history holds {} tokens but capacity is {}",
                meta.history.len(),
                meta.history_capacity
            )));
        }

        if meta.state_size != expected_size {
            return Err(SnapshotError::SizeMismatch {
                expected: expected_size,
                actual: meta.state_size as u64,
            });
        }

        let state = Self::load(path, expected_size)?;
        Ok(Snapshot {
            state,
            history: TokenHistory::from_tokens(meta.history_capacity, &meta.history),
            n_past: meta.n_past,
        })
    }
}

/// `<path>.meta.json`
pub fn meta_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".meta.json");
    PathBuf::from(name)
}

/// Error for a write that stopped early; the partial file is removed after
/// its length is recorded.
fn discard_failed_write(path: &Path, expected: usize, e: std::io::Error) -> SnapshotError {
    let on_disk = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    remove_partial(path);
    if e.kind() == std::io::ErrorKind::WriteZero {
        SnapshotError::ShortWrite {
            path: path.to_path_buf(),
            expected,
            actual: on_disk,
        }
    } else {
        SnapshotError::Io {
            path: path.to_path_buf(),
            source: e,
        }
    }
}

fn remove_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!("Failed to remove partial state file {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(len: usize) -> StateBuffer {
        StateBuffer::from_vec((0..len).map(|i| (i * 31 % 251) as u8).collect())
    }

    #[test]
    fn test_save_then_load_returns_same_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump_state.bin");
        let state = blob(4096);

        SnapshotStore::save(&path, &state).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 4096);

        let loaded = SnapshotStore::load(&path, state.len()).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_empty_blob_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        SnapshotStore::save(&path, &StateBuffer::zeroed(0)).unwrap();
        assert!(SnapshotStore::load(&path, 0).unwrap().is_empty());
    }

    #[test]
    fn test_short_file_is_short_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        fs::write(&path, vec![7u8; 100]).unwrap();

        let err = SnapshotStore::load(&path, 128).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::ShortRead {
                expected: 128,
                actual: 100
            }
        ));
    }

    #[test]
    fn test_long_file_is_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.bin");
        fs::write(&path, vec![7u8; 200]).unwrap();

        let err = SnapshotStore::load(&path, 128).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::SizeMismatch {
                expected: 128,
                actual: 200
            }
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = SnapshotStore::load(Path::new("/nonexistent/state.bin"), 16).unwrap_err();
        assert!(matches!(err, SnapshotError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/state.bin"));
    }

    #[test]
    fn test_save_into_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("state.bin");
        let err = SnapshotStore::save(&path, &blob(8)).unwrap_err();
        assert!(matches!(err, SnapshotError::Io { .. }));
    }

    #[test]
    fn test_snapshot_sidecar_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump_state.bin");
        let snapshot = Snapshot {
            state: blob(512),
            history: TokenHistory::from_tokens(4, &[1, 2, 3, 4, 5]),
            n_past: 20,
        };

        SnapshotStore::save_snapshot(&path, &snapshot).unwrap();
        assert!(meta_path(&path).exists());

        let loaded = SnapshotStore::load_snapshot(&path, 512).unwrap();
        assert_eq!(loaded, snapshot);
        assert_eq!(loaded.history.to_vec(), vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_sidecar_size_must_match_blob() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump_state.bin");
        let snapshot = Snapshot {
            state: blob(64),
            history: TokenHistory::new(2),
            n_past: 3,
        };
        SnapshotStore::save_snapshot(&path, &snapshot).unwrap();
        // Truncate the blob behind the sidecar's back
        fs::write(&path, vec![0u8; 32]).unwrap();

        let err = SnapshotStore::load_snapshot(&path, 64).unwrap_err();
        assert!(matches!(err, SnapshotError::ShortRead { .. }));
    }

    #[test]
    fn test_corrupt_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump_state.bin");
        SnapshotStore::save(&path, &blob(8)).unwrap();
        fs::write(meta_path(&path), b"{not json").unwrap();

        let err = SnapshotStore::load_snapshot(&path, 8).unwrap_err();
        assert!(matches!(err, SnapshotError::Metadata(_)));
    }

    #[test]
    fn test_failed_write_reports_bytes_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        fs::write(&path, vec![3u8; 10]).unwrap();

        let err = discard_failed_write(
            &path,
            100,
            std::io::Error::new(std::io::ErrorKind::WriteZero, "disk full"),
        );
        assert!(matches!(
            err,
            SnapshotError::ShortWrite {
                expected: 100,
                actual: 10,
                ..
            }
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_huge_expected_size_on_small_file_is_short_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.bin");
        fs::write(&path, vec![1u8; 16]).unwrap();

        let err = SnapshotStore::load(&path, usize::MAX / 2).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::ShortRead { expected, actual: 16 } if expected == usize::MAX / 2
        ));
    }

    #[test]
    fn test_sidecar_state_size_checked_before_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump_state.bin");
        let snapshot = Snapshot {
            state: blob(16),
            history: TokenHistory::new(2),
            n_past: 1,
        };
        SnapshotStore::save_snapshot(&path, &snapshot).unwrap();

        // Sidecar claims a huge blob
        let meta = serde_json::json!({
            "state_size": usize::MAX / 2,
            "n_past": 1,
            "history_capacity": 2,
            "history": [],
        });
        fs::write(meta_path(&path), meta.to_string()).unwrap();

        let err = SnapshotStore::load_snapshot(&path, 16).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::SizeMismatch { expected: 16, actual } if actual == (usize::MAX / 2) as u64
        ));
    }
}
