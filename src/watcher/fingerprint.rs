//! Content fingerprints for change detection
//!
//! Files up to the configured size are hashed with blake3. Larger files fall back to a
//! size and modification-time token, which is cheap but still changes on every write.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::events::Fingerprint;

/// Fingerprint the current on-disk state of `path`.
///
/// Returns `Ok(None)` for directories, which never produce events.
pub fn fingerprint_path(path: &Path, max_hash_bytes: u64) -> std::io::Result<Option<Fingerprint>> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Some(Fingerprint::absent())),
        Err(e) => return Err(e),
    };
    if metadata.is_dir() {
        return Ok(None);
    }

    if metadata.len() > max_hash_bytes {
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        return Ok(Some(Fingerprint::new(format!(
            "size:{}:mtime:{}",
            metadata.len(),
            mtime
        ))));
    }

    match fs::read(path) {
        Ok(content) => {
            let hash = blake3::hash(&content);
            Ok(Some(Fingerprint::new(hex::encode(hash.as_bytes()))))
        }
        // Deleted between the metadata call and the read
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Some(Fingerprint::absent())),
        Err(e) => Err(e),
    }
}
