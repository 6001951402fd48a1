//! Object storage tiers.
//!
//! - `hot`: immediately readable objects addressed by bucket and key
//! - `cold`: archive vault with asynchronous, tiered retrieval
//!
//! Both sit on `object_store` backends chosen by URL.

use std::sync::Arc;

use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::prefix::PrefixStore;
use url::Url;

pub mod cold;
pub mod hot;

pub use cold::{ColdArchive, ColdError, RetrievalRecord, RetrievalTier, VaultArchive, VaultConfig};
pub use hot::{HotStore, HotStoreError, ObjectStoreHotTier};

/// Failed to create an object store backend from a URL.
#[derive(Debug, thiserror::Error)]
#[error("failed to create object store for {url}: {reason}")]
pub struct StoreUrlError {
    url: String,
    reason: String,
}

/// Build an object store from a URL.
///
/// - `memory:///` → process-local in-memory store
/// - `file:///some/dir` → local filesystem rooted at that directory (created if missing)
/// - anything else is handed to `object_store::parse_url`
pub fn open_object_store(url: &str) -> Result<Arc<dyn ObjectStore>, StoreUrlError> {
    let err = |reason: String| StoreUrlError {
        url: url.to_string(),
        reason,
    };
    let parsed = Url::parse(url).map_err(|e| err(e.to_string()))?;

    match parsed.scheme() {
        "memory" => Ok(Arc::new(InMemory::new())),
        "file" => {
            let root = parsed
                .to_file_path()
                .map_err(|_| err("not a local path".to_string()))?;
            std::fs::create_dir_all(&root).map_err(|e| err(e.to_string()))?;
            let store = LocalFileSystem::new_with_prefix(&root).map_err(|e| err(e.to_string()))?;
            Ok(Arc::new(store))
        }
        _ => {
            let (store, prefix) = object_store::parse_url(&parsed).map_err(|e| err(e.to_string()))?;
            if prefix.as_ref().is_empty() {
                Ok(Arc::from(store))
            } else {
                Ok(Arc::new(PrefixStore::new(store, prefix)))
            }
        }
    }
}
