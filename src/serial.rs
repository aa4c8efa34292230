//! Crash-safe monotonic serial allocator (§4.2, authority only).
//!
//! Resolves REDESIGN FLAG R1 (was Q1): the counter is persisted BEFORE the
//! serial is handed to the caller, via a temp-file-then-rename write, so a
//! crash between allocation and publication can never cause serial reuse.

use crate::error::CodecError;
use crate::types::SerialNumber;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Persists a strictly increasing `u64` to a single file (§4.2, §6).
pub struct SerialAllocator {
    path: PathBuf,
    previous: SerialNumber,
}

impl SerialAllocator {
    /// Load the allocator's state from `path`. A missing, malformed, or
    /// wrong-length file is treated as "no serial issued yet" (previous = 0),
    /// not as an error.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let previous = match fs::read(&path).await {
            Ok(bytes) => match <[u8; 8]>::try_from(bytes.as_slice()) {
                Ok(le) => SerialNumber::from_le_bytes(le),
                Err(_) => {
                    warn!(path = %path.display(), "serial file has unexpected length, starting from 0");
                    SerialNumber(0)
                }
            },
            Err(_) => {
                debug!(path = %path.display(), "no serial file yet, starting from 0");
                SerialNumber(0)
            }
        };
        Self { path, previous }
    }

    /// Allocate and persist the next serial, returning it only after the
    /// write has completed (reserve-then-commit).
    pub async fn next(&mut self) -> Result<SerialNumber, CodecError> {
        let next = self.previous.next();
        self.persist(next).await?;
        self.previous = next;
        Ok(next)
    }

    async fn persist(&self, serial: SerialNumber) -> Result<(), CodecError> {
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, serial.to_le_bytes())
            .await
            .map_err(|source| CodecError::Write {
                path: tmp_path.display().to_string(),
                source,
            })?;
        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|source| CodecError::Write {
                path: self.path.display().to_string(),
                source,
            })?;
        debug!(serial = %serial, path = %self.path.display(), "persisted serial");
        Ok(())
    }

    /// The path this allocator persists to, for diagnostics.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn absent_file_starts_at_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut allocator = SerialAllocator::load(dir.path().join("serial")).await;
        assert_eq!(allocator.next().await.unwrap(), SerialNumber::FIRST);
    }

    #[tokio::test]
    async fn malformed_file_starts_at_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serial");
        tokio::fs::write(&path, b"not8bytes").await.unwrap();
        let mut allocator = SerialAllocator::load(&path).await;
        assert_eq!(allocator.next().await.unwrap(), SerialNumber::FIRST);
    }

    #[tokio::test]
    async fn restart_resumes_from_persisted_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serial");
        {
            let mut allocator = SerialAllocator::load(&path).await;
            allocator.next().await.unwrap();
            allocator.next().await.unwrap();
        }
        let mut restarted = SerialAllocator::load(&path).await;
        assert_eq!(restarted.next().await.unwrap(), SerialNumber(3));
    }

    proptest! {
        /// P3: serial numbers issued across any sequence of restarts are
        /// strictly increasing.
        #[test]
        fn serials_strictly_increase_across_restarts(restart_points in proptest::collection::vec(1u8..5, 1..8)) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let dir = tempfile::tempdir().unwrap();
                let path = dir.path().join("serial");
                let mut last = SerialNumber(0);
                for count in restart_points {
                    let mut allocator = SerialAllocator::load(&path).await;
                    for _ in 0..count {
                        let issued = allocator.next().await.unwrap();
                        prop_assert!(issued > last);
                        last = issued;
                    }
                }
                Ok(())
            })?;
        }
    }
}
