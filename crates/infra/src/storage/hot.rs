//! Hot tier: objects addressed by `(bucket, key)`.

use std::path::Path as FsPath;
use std::sync::Arc;

use bytes::Bytes;
use object_store::ObjectStore;
use object_store::path::Path;
use tokio::runtime::Handle;

use annoflow_core::ObjectRef;

#[derive(Debug, thiserror::Error)]
pub enum HotStoreError {
    #[error("object not found: {0}")]
    NotFound(ObjectRef),

    #[error("local file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("object storage error on {object}: {reason}")]
    Storage { object: ObjectRef, reason: String },
}

pub trait HotStore: Send + Sync {
    fn get(&self, object: &ObjectRef) -> Result<Bytes, HotStoreError>;

    /// Write (or overwrite) an object.
    fn put(&self, object: &ObjectRef, data: Bytes) -> Result<(), HotStoreError>;

    /// Remove an object. Removing a missing object succeeds.
    fn delete(&self, object: &ObjectRef) -> Result<(), HotStoreError>;

    fn exists(&self, object: &ObjectRef) -> Result<bool, HotStoreError>;

    /// Copy an object into a local file; returns the byte count.
    fn download_to(&self, object: &ObjectRef, path: &FsPath) -> Result<u64, HotStoreError> {
        let data = self.get(object)?;
        std::fs::write(path, &data).map_err(|source| HotStoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(data.len() as u64)
    }

    /// Upload a local file as an object.
    fn upload_from(&self, path: &FsPath, object: &ObjectRef) -> Result<(), HotStoreError> {
        let data = std::fs::read(path).map_err(|source| HotStoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        self.put(object, Bytes::from(data))
    }
}

impl<S> HotStore for Arc<S>
where
    S: HotStore + ?Sized,
{
    fn get(&self, object: &ObjectRef) -> Result<Bytes, HotStoreError> {
        (**self).get(object)
    }

    fn put(&self, object: &ObjectRef, data: Bytes) -> Result<(), HotStoreError> {
        (**self).put(object, data)
    }

    fn delete(&self, object: &ObjectRef) -> Result<(), HotStoreError> {
        (**self).delete(object)
    }

    fn exists(&self, object: &ObjectRef) -> Result<bool, HotStoreError> {
        (**self).exists(object)
    }

    fn download_to(&self, object: &ObjectRef, path: &FsPath) -> Result<u64, HotStoreError> {
        (**self).download_to(object, path)
    }

    fn upload_from(&self, path: &FsPath, object: &ObjectRef) -> Result<(), HotStoreError> {
        (**self).upload_from(path, object)
    }
}

/// Hot tier on an `object_store` backend; buckets become the first path segment.
#[derive(Debug, Clone)]
pub struct ObjectStoreHotTier {
    store: Arc<dyn ObjectStore>,
    handle: Handle,
}

impl ObjectStoreHotTier {
    pub fn new(store: Arc<dyn ObjectStore>, handle: Handle) -> Self {
        Self { store, handle }
    }

    fn path(object: &ObjectRef) -> Path {
        Path::from(format!("{}/{}", object.bucket, object.key))
    }

    fn storage_error(object: &ObjectRef, err: object_store::Error) -> HotStoreError {
        match err {
            object_store::Error::NotFound { .. } => HotStoreError::NotFound(object.clone()),
            other => HotStoreError::Storage {
                object: object.clone(),
                reason: other.to_string(),
            },
        }
    }
}

impl HotStore for ObjectStoreHotTier {
    fn get(&self, object: &ObjectRef) -> Result<Bytes, HotStoreError> {
        let path = Self::path(object);
        self.handle
            .block_on(async {
                let result = self.store.get(&path).await?;
                result.bytes().await
            })
            .map_err(|e| Self::storage_error(object, e))
    }

    fn put(&self, object: &ObjectRef, data: Bytes) -> Result<(), HotStoreError> {
        let path = Self::path(object);
        self.handle
            .block_on(self.store.put(&path, data.into()))
            .map_err(|e| Self::storage_error(object, e))?;
        tracing::debug!(object = %object, "hot object written");
        Ok(())
    }

    fn delete(&self, object: &ObjectRef) -> Result<(), HotStoreError> {
        let path = Self::path(object);
        match self.handle.block_on(self.store.delete(&path)) {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(Self::storage_error(object, e)),
        }
    }

    fn exists(&self, object: &ObjectRef) -> Result<bool, HotStoreError> {
        let path = Self::path(object);
        match self.handle.block_on(self.store.head(&path)) {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(Self::storage_error(object, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use object_store::memory::InMemory;

    use super::*;

    fn tier() -> (tokio::runtime::Runtime, ObjectStoreHotTier) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let hot = ObjectStoreHotTier::new(Arc::new(InMemory::new()), rt.handle().clone());
        (rt, hot)
    }

    #[test]
    fn put_get_delete() {
        let (_rt, hot) = tier();
        let obj = ObjectRef::new("results", "p/U1/J1~in.annot.vcf");

        assert!(!hot.exists(&obj).unwrap());
        hot.put(&obj, Bytes::from_static(b"annotated")).unwrap();
        assert!(hot.exists(&obj).unwrap());
        assert_eq!(hot.get(&obj).unwrap(), Bytes::from_static(b"annotated"));

        hot.delete(&obj).unwrap();
        assert!(matches!(hot.get(&obj), Err(HotStoreError::NotFound(_))));
        // Idempotent.
        hot.delete(&obj).unwrap();
    }

    #[test]
    fn files_round_trip_through_the_tier() {
        let (_rt, hot) = tier();
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.vcf");
        std::fs::write(&src, b"#VCF").unwrap();

        let obj = ObjectRef::new("inputs", "p/U1/J1~in.vcf");
        hot.upload_from(&src, &obj).unwrap();

        let dst = dir.path().join("copy.vcf");
        assert_eq!(hot.download_to(&obj, &dst).unwrap(), 4);
        assert_eq!(std::fs::read(&dst).unwrap(), b"#VCF");
    }

    #[test]
    fn buckets_are_separate_namespaces() {
        let (_rt, hot) = tier();
        hot.put(&ObjectRef::new("a", "k"), Bytes::from_static(b"1")).unwrap();
        assert!(!hot.exists(&ObjectRef::new("b", "k")).unwrap());
    }
}
