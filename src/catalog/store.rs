//! Catalog Store - atomically swapped catalog snapshots
//!
//! Readers clone an `Arc<CatalogSnapshot>` and never hold the lock across I/O.
//! A rebuild loads, indexes and then publishes a new snapshot with a single
//! pointer swap; the previous snapshot drains as its last reader drops it.

use crate::catalog::{catalog_hash, CatalogSource, FileCatalogSource, PostgresCatalogSource};
use crate::config::AppConfig;
use crate::error::{BiError, Result};
use crate::schema_rag::{Embedder, IndexHandle, IndexMode, RetrievalIndex, SchemaEmbedder, VectorCache};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

pub struct CatalogSnapshot {
    pub index: IndexHandle,
    pub loaded_at: DateTime<Utc>,
    pub source: String,
}

impl CatalogSnapshot {
    pub fn catalog_hash(&self) -> &str {
        self.index.catalog_hash()
    }

    pub fn is_degraded(&self) -> bool {
        self.index.mode() == IndexMode::Lexical
    }
}

pub struct CatalogStore {
    source: Arc<dyn CatalogSource>,
    embedder: Option<Arc<dyn Embedder>>,
    cache: Option<VectorCache>,
    current: RwLock<Option<Arc<CatalogSnapshot>>>,
    rebuild_lock: tokio::sync::Mutex<()>,
}

impl CatalogStore {
    pub fn new(
        source: Arc<dyn CatalogSource>,
        embedder: Option<Arc<dyn Embedder>>,
        cache: Option<VectorCache>,
    ) -> Self {
        Self {
            source,
            embedder,
            cache,
            current: RwLock::new(None),
            rebuild_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Postgres metadata when a database URL is set, the catalog directory otherwise.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let source: Arc<dyn CatalogSource> = match &config.catalog_database_url {
            Some(url) => Arc::new(
                PostgresCatalogSource::connect(url, config.catalog_schemas.clone(), config.pool.size as u32).await?,
            ),
            None => Arc::new(FileCatalogSource::new(&config.catalog_dir)),
        };
        let embedder: Option<Arc<dyn Embedder>> = if config.embedding.enabled {
            Some(Arc::new(SchemaEmbedder::from_config(&config.embedding)?))
        } else {
            None
        };
        Ok(Self::new(source, embedder, Some(VectorCache::new(&config.vector_dir))))
    }

    /// The published snapshot. `CatalogUnavailable` until the first rebuild succeeds.
    pub fn snapshot(&self) -> Result<Arc<CatalogSnapshot>> {
        self.current
            .read()
            .clone()
            .ok_or_else(|| BiError::CatalogUnavailable("catalog has not been loaded".to_string()))
    }

    /// Load the catalog, build its index and publish it.
    ///
    /// On failure the previously published snapshot stays in place.
    pub async fn rebuild(&self) -> Result<Arc<CatalogSnapshot>> {
        let _guard = self.rebuild_lock.lock().await;

        let entries = self.source.load().await?;
        let hash = catalog_hash(&entries);
        info!(
            "Rebuilding index for {} ({} entries, hash {})",
            self.source.describe(),
            entries.len(),
            &hash[..12.min(hash.len())]
        );

        let index = match &self.embedder {
            Some(embedder) => self.build_vector_index(entries, &hash, Arc::clone(embedder)).await,
            None => {
                info!("No embedding service configured, using lexical retrieval");
                RetrievalIndex::build_lexical(entries)
            }
        };

        let snapshot = Arc::new(CatalogSnapshot {
            index,
            loaded_at: Utc::now(),
            source: self.source.describe(),
        });
        *self.current.write() = Some(Arc::clone(&snapshot));
        info!(
            "Published catalog snapshot ({} entries, mode {:?})",
            snapshot.index.len(),
            snapshot.index.mode()
        );
        Ok(snapshot)
    }

    /// Cache hit, fresh embeddings, or lexical fallback, in that order.
    async fn build_vector_index(
        &self,
        entries: Vec<crate::catalog::SchemaEntry>,
        hash: &str,
        embedder: Arc<dyn Embedder>,
    ) -> IndexHandle {
        let mut names: Vec<String> = entries.iter().map(|e| e.qualified_name.clone()).collect();
        names.sort();

        if let Some(cache) = &self.cache {
            if let Some(vectors) = cache.load(hash, embedder.model(), &names) {
                match RetrievalIndex::from_vectors(entries.clone(), vectors, Arc::clone(&embedder)) {
                    Ok(index) => return index,
                    Err(e) => warn!("Discarding cached vectors: {}", e),
                }
            }
        }

        match RetrievalIndex::build(entries.clone(), Arc::clone(&embedder)).await {
            Ok(index) => {
                if let (Some(cache), Some(vectors)) = (&self.cache, index.vectors()) {
                    if let Err(e) = cache.store(hash, embedder.model(), &index.qualified_names(), vectors) {
                        warn!("Failed to write vector cache: {}", e);
                    }
                }
                index
            }
            Err(e) => {
                warn!("Embedding the catalog failed, degrading to lexical retrieval: {}", e);
                RetrievalIndex::build_lexical(entries)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{InMemoryCatalogSource, SchemaEntry};
    use crate::schema_rag::Embedding;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model(&self) -> &str {
            "counting"
        }

        async fn embed(&self, text: &str) -> Result<Embedding> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(BiError::EmbeddingService("unreachable".to_string()));
            }
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    fn source() -> Arc<dyn CatalogSource> {
        Arc::new(InMemoryCatalogSource::new(vec![
            SchemaEntry::table("main.employees", "One row per employee"),
            SchemaEntry::column("main.employees", "department", "TEXT", "Department"),
        ]))
    }

    #[tokio::test]
    async fn test_snapshot_unavailable_before_rebuild() {
        let store = CatalogStore::new(source(), None, None);
        assert!(matches!(store.snapshot().err().unwrap(), BiError::CatalogUnavailable(_)));
        store.rebuild().await.unwrap();
        assert_eq!(store.snapshot().unwrap().index.len(), 2);
    }

    #[tokio::test]
    async fn test_embedding_failure_degrades_to_lexical() {
        let embedder = Arc::new(CountingEmbedder { calls: AtomicUsize::new(0), fail: true });
        let store = CatalogStore::new(source(), Some(embedder), None);
        let snapshot = store.rebuild().await.unwrap();
        assert!(snapshot.is_degraded());
    }

    #[tokio::test]
    async fn test_cached_vectors_skip_embedding() {
        let dir = tempfile::tempdir().unwrap();
        let embedder = Arc::new(CountingEmbedder { calls: AtomicUsize::new(0), fail: false });

        let first = CatalogStore::new(source(), Some(embedder.clone()), Some(VectorCache::new(dir.path())));
        first.rebuild().await.unwrap();
        let after_first = embedder.calls.load(Ordering::SeqCst);
        assert_eq!(after_first, 2);

        let second = CatalogStore::new(source(), Some(embedder.clone()), Some(VectorCache::new(dir.path())));
        let snapshot = second.rebuild().await.unwrap();
        assert_eq!(snapshot.index.mode(), IndexMode::Vector);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), after_first);
    }

    #[tokio::test]
    async fn test_old_snapshot_survives_swap() {
        let store = CatalogStore::new(source(), None, None);
        let old = store.rebuild().await.unwrap();
        let new = store.rebuild().await.unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(old.index.len(), 2);
        assert!(Arc::ptr_eq(&store.snapshot().unwrap(), &new));
    }
}
