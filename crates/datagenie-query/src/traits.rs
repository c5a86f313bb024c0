use crate::error::Result;
use crate::registry::ConnectionDescriptor;
use crate::types::*;
use async_trait::async_trait;
use std::collections::BTreeSet;

/// An open, read-only session against one data source.
///
/// Dropping a connection must close it. Pools rely on this to force-close
/// sessions whose server-side state is unknown (timeouts, cancellation).
#[async_trait]
pub trait RawConnection: Send {
    /// Run a single read-only statement and return every row it produced
    async fn execute(&mut self, sql: &str, params: &[serde_json::Value]) -> Result<RawRows>;

    /// Cheap liveness probe run before a pooled connection is reused
    async fn ping(&mut self) -> Result<()>;

    /// Enumerate columns of every table in the given schemas, in ordinal order
    async fn introspect(&mut self, allowed_schemas: &BTreeSet<String>) -> Result<Vec<ColumnMeta>>;
}

/// Opens connections for one engine kind
#[async_trait]
pub trait RawConnectionFactory: Send + Sync {
    /// Engine kind this factory handles
    fn engine(&self) -> EngineKind;

    /// Open a new read-only connection
    async fn open(&self, descriptor: &ConnectionDescriptor) -> Result<Box<dyn RawConnection>>;
}

/// Supplies raw structural metadata for a data source
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    async fn fetch(&self, source: &DataSource) -> Result<Vec<ColumnMeta>>;
}
