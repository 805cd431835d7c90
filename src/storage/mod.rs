pub mod blobs;
pub mod records;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub use blobs::BlobStore;
pub use records::{ImageRecord, RecordStore, UserLedger};

use crate::error::{ApiError, ApiResult};

/// Normalize and validate a user id for safe storage usage.
///
/// Trims whitespace, rejects empty ids and traversal attempts (leading `/`
/// or `\`, any `..`), and substitutes characters outside `[A-Za-z0-9_.-]`
/// with `_`. When `base_dir` is given, the joined path must stay lexically
/// inside it; an escape is a client error, never silently corrected.
pub fn normalize_user_id(user_id: &str, base_dir: Option<&Path>) -> ApiResult<String> {
    let trimmed = user_id.trim();
    if trimmed.is_empty() {
        return Err(ApiError::BadRequest("User ID is required.".to_string()));
    }
    if trimmed.starts_with('/') || trimmed.starts_with('\\') || trimmed.contains("..") {
        return Err(ApiError::BadRequest(
            "Invalid user ID: path traversal or absolute path not allowed.".to_string(),
        ));
    }

    let safe: String = trimmed
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if safe.is_empty() {
        return Err(ApiError::BadRequest(
            "User ID is empty after normalization.".to_string(),
        ));
    }

    if let Some(base) = base_dir {
        let candidate = base.join(&safe);
        if !candidate.starts_with(base) {
            return Err(ApiError::BadRequest(
                "User ID resolves outside allowed directory.".to_string(),
            ));
        }
    }

    Ok(safe)
}

/// Per-user write serialization for the ledger's read-modify-write cycle.
///
/// The backends themselves have no concurrency control, so concurrent
/// uploads for one user would race on load/save and lose updates. Holding
/// the user's entry here across the duplicate-check-to-persist section keeps
/// one user's writes ordered without affecting anyone else.
#[derive(Clone, Default)]
pub struct UserLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_user(&self, normalized_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(normalized_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
