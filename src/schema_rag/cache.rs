//! On-disk vector cache keyed by catalog content hash
//!
//! One JSON file per catalog hash. A file is only reused when its hash, model
//! and entry order all match; anything else is a miss and triggers a rebuild.

use crate::error::{BiError, Result};
use crate::schema_rag::vector_store::Embedding;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Serialize, Deserialize)]
struct CachedIndex {
    catalog_hash: String,
    model: String,
    created_at: DateTime<Utc>,
    names: Vec<String>,
    vectors: Vec<Embedding>,
}

#[derive(Debug, Clone)]
pub struct VectorCache {
    dir: PathBuf,
}

impl VectorCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, catalog_hash: &str) -> PathBuf {
        self.dir.join(format!("index-{}.json", catalog_hash))
    }

    /// Cached vectors for exactly these entry names, if present and valid.
    pub fn load(&self, catalog_hash: &str, model: &str, names: &[String]) -> Option<Vec<Embedding>> {
        let path = self.path_for(catalog_hash);
        if !path.exists() {
            debug!("Vector cache miss: {}", path.display());
            return None;
        }

        let cached: CachedIndex = match std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|content| serde_json::from_str(&content).map_err(|e| e.to_string()))
        {
            Ok(cached) => cached,
            Err(e) => {
                warn!("Ignoring unreadable vector cache {}: {}", path.display(), e);
                return None;
            }
        };

        if cached.catalog_hash != catalog_hash
            || cached.model != model
            || cached.names != names
            || cached.vectors.len() != names.len()
        {
            warn!("Vector cache {} does not match the current catalog, rebuilding", path.display());
            return None;
        }

        info!(
            "Loaded {} cached vectors from {} (built {})",
            cached.vectors.len(),
            path.display(),
            cached.created_at
        );
        Some(cached.vectors)
    }

    pub fn store(&self, catalog_hash: &str, model: &str, names: &[String], vectors: &[Embedding]) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| BiError::Execution(format!("Failed to create {}: {}", self.dir.display(), e)))?;

        let cached = CachedIndex {
            catalog_hash: catalog_hash.to_string(),
            model: model.to_string(),
            created_at: Utc::now(),
            names: names.to_vec(),
            vectors: vectors.to_vec(),
        };
        let content = serde_json::to_string(&cached)
            .map_err(|e| BiError::Execution(format!("Failed to serialize vector cache: {}", e)))?;

        // Write then rename so readers never see a partial file.
        let path = self.path_for(catalog_hash);
        let tmp = path.with_extension("json.tmp");
        write_file(&tmp, &content)?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| BiError::Execution(format!("Failed to move {} into place: {}", tmp.display(), e)))?;

        info!("Cached {} vectors at {}", vectors.len(), path.display());
        Ok(path)
    }
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content)
        .map_err(|e| BiError::Execution(format!("Failed to write {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = VectorCache::new(dir.path().join("vectors"));
        let names = vec!["a".to_string(), "b".to_string()];
        let vectors = vec![vec![1.0, 0.0], vec![0.0, 1.0]];

        cache.store("abc123", "model-x", &names, &vectors).unwrap();
        assert_eq!(cache.load("abc123", "model-x", &names), Some(vectors));
    }

    #[test]
    fn test_mismatch_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = VectorCache::new(dir.path());
        let names = vec!["a".to_string()];
        cache.store("h1", "model-x", &names, &[vec![1.0]]).unwrap();

        assert!(cache.load("h1", "model-y", &names).is_none());
        assert!(cache.load("h1", "model-x", &["b".to_string()]).is_none());
        assert!(cache.load("h2", "model-x", &names).is_none());
    }
}
