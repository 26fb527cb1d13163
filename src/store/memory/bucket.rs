use crate::core::{Document, ObjectId, OdmError, Result};
use crate::store::{FileInfo, StoreBucket};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct StoredFile {
    info: FileInfo,
    data: Arc<Vec<u8>>,
}

/// Shared file storage behind every handle to the same bucket.
#[derive(Debug, Default)]
pub(crate) struct BucketData {
    files: RwLock<BTreeMap<ObjectId, StoredFile>>,
}

/// Handle to an in-memory large-object bucket.
pub struct MemoryBucket {
    name: String,
    data: Arc<BucketData>,
}

impl MemoryBucket {
    pub(crate) fn new(name: &str, data: Arc<BucketData>) -> Self {
        Self {
            name: name.to_string(),
            data,
        }
    }
}

#[async_trait]
impl StoreBucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upload(
        &self,
        filename: &str,
        data: Vec<u8>,
        metadata: Option<Document>,
    ) -> Result<ObjectId> {
        let id = ObjectId::new();
        let info = FileInfo {
            id,
            filename: filename.to_string(),
            length: data.len() as u64,
            upload_date: Utc::now(),
            metadata,
        };

        let mut files = self.data.files.write().await;
        files.insert(
            id,
            StoredFile {
                info,
                data: Arc::new(data),
            },
        );
        Ok(id)
    }

    async fn download(&self, id: ObjectId) -> Result<Vec<u8>> {
        let files = self.data.files.read().await;
        files
            .get(&id)
            .map(|file| file.data.as_ref().clone())
            .ok_or(OdmError::FileNotFound(id))
    }

    async fn delete(&self, id: ObjectId) -> Result<()> {
        let mut files = self.data.files.write().await;
        files
            .remove(&id)
            .map(|_| ())
            .ok_or(OdmError::FileNotFound(id))
    }

    async fn find_by_filename(&self, filename: &str) -> Result<Vec<FileInfo>> {
        let files = self.data.files.read().await;
        let mut found: Vec<FileInfo> = files
            .values()
            .filter(|file| file.info.filename == filename)
            .map(|file| file.info.clone())
            .collect();
        found.sort_by_key(|info| info.upload_date);
        Ok(found)
    }
}
