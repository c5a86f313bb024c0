//! # datagenie-engine
//!
//! Natural-language query engine. Turns a free-text question plus a data
//! source id into a validated, read-only query, runs it through a bounded
//! connection pool, masks sensitive columns and caches the result.
//!
//! ## Components
//!
//! - **SchemaCache**: atomically swapped schema snapshots per data source
//! - **QueryGenerator**: prompt construction and reasoning-service calls
//! - **QueryValidator**: SQL parsing, verb and object checks, row limits
//! - **PoolManager**: per-source connection pools with bounded acquire
//! - **ResultCache** / **PlanCache**: TTL caches scoped by data source
//! - **Masking**: per-column PII redaction
//! - **ExecutionCoordinator**: the entry point tying the above together
//!
//! ## Example
//!
//! ```rust,no_run
//! use datagenie_engine::{EngineConfig, ExecutionCoordinator, QueryRequest};
//! use datagenie_query::{ConnectionDescriptor, DataSource, EngineKind};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = EngineConfig::load(None)?;
//! datagenie_engine::logging::init_tracing(&config.logging)?;
//!
//! let engine = ExecutionCoordinator::from_config(config).await?;
//! engine
//!     .register(DataSource::new(
//!         "sales",
//!         EngineKind::Sqlite,
//!         ConnectionDescriptor::new().with_path("/var/data/sales.db"),
//!     ))
//!     .await?;
//!
//! let result = engine
//!     .analyze_and_execute(QueryRequest::new("sales", "Monthly revenue for 2023"))
//!     .await;
//! println!("{}", serde_json::to_string_pretty(&result)?);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod generator;
mod lineage;
pub mod logging;
pub mod masking;
pub mod pool;
pub mod reasoning;
pub mod result_cache;
pub mod schema_cache;
pub mod single_flight;
pub mod types;
pub mod validator;

use datagenie_query::ConnectorRegistry;
use datagenie_query_postgres::PostgresConnectionFactory;
use datagenie_query_sqlite::SqliteConnectionFactory;
use std::sync::Arc;

pub use config::EngineConfig;
pub use coordinator::{EngineStats, ExecutionCoordinator, RequestState};
pub use error::{
    EngineError, FailureKind, GenerationError, PoolError, ReasoningError, Result,
};
pub use generator::{Attempt, QueryGenerator};
pub use masking::{ColumnSensitivityPolicy, MaskingKind, StaticSensitivityPolicy};
pub use pool::{ConnectionPool, PoolManager, PoolStatus, PooledConnection};
pub use reasoning::{HttpReasoningService, ReasoningService};
pub use result_cache::{CacheCategory, PlanCache, ResultCache, TtlCache};
pub use schema_cache::SchemaCache;
pub use single_flight::SingleFlight;
pub use types::{
    AnalyzeResult, CandidateQuery, ExecutionResult, QueryFailure, QueryOutcome, QueryRequest,
    StageTimings,
};
pub use validator::{
    ProjectedColumn, QueryValidator, RejectReason, ValidatedQuery, ValidationVerdict,
};

/// Registry with the bundled PostgreSQL and SQLite connectors
pub async fn default_connectors() -> Arc<ConnectorRegistry> {
    let registry = Arc::new(ConnectorRegistry::new());
    registry
        .register_factory(Arc::new(PostgresConnectionFactory::new()))
        .await;
    registry
        .register_factory(Arc::new(SqliteConnectionFactory::new()))
        .await;
    registry
}
