use crate::error::{EngineError, Result};
use arc_swap::ArcSwap;
use datagenie_query::{DataSource, SchemaProvider, SchemaSnapshot};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

type SnapshotMap = HashMap<String, Arc<SchemaSnapshot>>;

/// Structural metadata per data source.
///
/// Reads are lock-free: the whole map sits behind an `ArcSwap` and every
/// refresh publishes a new map with the new snapshot swapped in. There is no
/// implicit expiry; snapshots change only through `refresh` and `remove`.
pub struct SchemaCache {
    provider: Arc<dyn SchemaProvider>,
    snapshots: ArcSwap<SnapshotMap>,
}

impl SchemaCache {
    pub fn new(provider: Arc<dyn SchemaProvider>) -> Self {
        Self {
            provider,
            snapshots: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Current snapshot for a data source
    pub fn get(&self, data_source_id: &str) -> Result<Arc<SchemaSnapshot>> {
        self.snapshots
            .load()
            .get(data_source_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(data_source_id))
    }

    /// Re-read structural metadata and swap in a new snapshot.
    ///
    /// On failure the previous snapshot (if any) stays in place.
    pub async fn refresh(&self, source: &DataSource) -> Result<Arc<SchemaSnapshot>> {
        debug!("Refreshing schema for data source {}", source.id);

        let columns = match self.provider.fetch(source).await {
            Ok(columns) => columns,
            Err(e) => {
                warn!("Schema refresh failed for {}: {}", source.id, e);
                return Err(EngineError::Data(e));
            }
        };

        let snapshot = Arc::new(SchemaSnapshot::from_columns(
            source.id.clone(),
            columns,
            &source.allowed_schemas,
        ));

        self.snapshots.rcu(|current| {
            let mut next = SnapshotMap::clone(current);
            next.insert(source.id.clone(), Arc::clone(&snapshot));
            next
        });

        info!(
            "Schema for {} refreshed: {} tables across {} schemas",
            source.id,
            snapshot.table_count(),
            snapshot.schemas.len()
        );

        Ok(snapshot)
    }

    /// Drop the snapshot of a deregistered data source
    pub fn remove(&self, data_source_id: &str) -> bool {
        let mut removed = false;
        self.snapshots.rcu(|current| {
            let mut next = SnapshotMap::clone(current);
            removed = next.remove(data_source_id).is_some();
            next
        });
        removed
    }

    pub fn ids(&self) -> Vec<String> {
        self.snapshots.load().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use datagenie_query::{
        ColumnMeta, ConnectionDescriptor, DataError, EngineKind, FieldType,
    };
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubProvider {
        fail: AtomicBool,
    }

    #[async_trait]
    impl SchemaProvider for StubProvider {
        async fn fetch(&self, _source: &DataSource) -> datagenie_query::Result<Vec<ColumnMeta>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(DataError::ConnectionFailed("unreachable".into()));
            }
            Ok(vec![
                ColumnMeta {
                    schema: "public".into(),
                    table: "orders".into(),
                    column: "order_date".into(),
                    declared_type: "date".into(),
                    field_type: FieldType::Date,
                    nullable: false,
                    is_primary_key: false,
                },
                ColumnMeta {
                    schema: "finance".into(),
                    table: "orders".into(),
                    column: "amount".into(),
                    declared_type: "numeric".into(),
                    field_type: FieldType::Decimal,
                    nullable: false,
                    is_primary_key: false,
                },
            ])
        }
    }

    fn source() -> DataSource {
        DataSource::new(
            "sales",
            EngineKind::Postgres,
            ConnectionDescriptor::new().with_host("localhost"),
        )
    }

    #[tokio::test]
    async fn test_get_unknown_source() {
        let cache = SchemaCache::new(Arc::new(StubProvider {
            fail: AtomicBool::new(false),
        }));
        assert!(matches!(
            cache.get("missing"),
            Err(EngineError::DataSourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_restricts_to_allowed_schemas() {
        let cache = SchemaCache::new(Arc::new(StubProvider {
            fail: AtomicBool::new(false),
        }));

        let snapshot = cache.refresh(&source()).await.unwrap();
        assert!(snapshot.table("public", "orders").is_some());
        assert!(snapshot.table("finance", "orders").is_none());
        assert!(Arc::ptr_eq(&snapshot, &cache.get("sales").unwrap()));
        assert_eq!(cache.ids(), vec!["sales".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let provider = Arc::new(StubProvider {
            fail: AtomicBool::new(false),
        });
        let cache = SchemaCache::new(provider.clone());

        let first = cache.refresh(&source()).await.unwrap();
        provider.fail.store(true, Ordering::SeqCst);

        assert!(cache.refresh(&source()).await.is_err());
        assert!(Arc::ptr_eq(&first, &cache.get("sales").unwrap()));
    }

    #[tokio::test]
    async fn test_remove() {
        let cache = SchemaCache::new(Arc::new(StubProvider {
            fail: AtomicBool::new(false),
        }));
        cache.refresh(&source()).await.unwrap();

        assert!(cache.remove("sales"));
        assert!(!cache.remove("sales"));
        assert!(cache.get("sales").is_err());
    }
}
