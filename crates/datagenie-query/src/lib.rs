//! # datagenie-query
//!
//! Data model and connector abstractions shared by the DataGenie query engine
//! and its engine-specific connectors.
//!
//! ## Architecture
//!
//! - **DataSource**: a registered external store (engine kind, connection
//!   descriptor, row and time limits, allowed schemas)
//! - **RawConnection**: an open read-only session that executes a statement,
//!   answers a liveness probe and introspects its own schema
//! - **RawConnectionFactory**: opens connections for one engine kind
//! - **SchemaProvider**: supplies raw column metadata for schema snapshots
//! - **ConnectorRegistry**: maps engine kinds to their factories
//!
//! ## Example
//!
//! ```rust
//! use datagenie_query::{ConnectionDescriptor, ConnectorRegistry, DataSource, EngineKind};
//!
//! # async fn example() -> datagenie_query::Result<()> {
//! let registry = ConnectorRegistry::new();
//!
//! let source = DataSource::new(
//!     "sales",
//!     EngineKind::Postgres,
//!     ConnectionDescriptor::new()
//!         .with_host("localhost")
//!         .with_port(5432)
//!         .with_database("sales")
//!         .with_credentials_ref("SALES_DB_PASSWORD"),
//! )
//! .with_max_rows(500);
//!
//! // Factories are provided by connector crates:
//! // registry.register_factory(Arc::new(PostgresConnectionFactory::new())).await;
//! assert!(!registry.has_engine(source.engine).await);
//! # Ok(())
//! # }
//! ```
//!
//! Connector crates:
//! - `datagenie-query-postgres` - PostgreSQL
//! - `datagenie-query-sqlite` - SQLite files

pub mod error;
pub mod registry;
pub mod traits;
pub mod types;

pub use error::{DataError, Result};
pub use registry::{ConnectionDescriptor, ConnectorRegistry, ConnectorSchemaProvider, Secret};
pub use traits::{RawConnection, RawConnectionFactory, SchemaProvider};
pub use types::{
    ColumnDef, ColumnMeta, DataSource, EngineKind, FieldType, RawRows, ResultColumn,
    SchemaSnapshot, TableMap,
};
