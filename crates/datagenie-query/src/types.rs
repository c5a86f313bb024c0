use crate::registry::ConnectionDescriptor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

/// Closed set of engine families a data source can belong to
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Relational, PostgreSQL-compatible
    Postgres,
    /// Relational, MySQL-compatible
    MySql,
    /// Embedded, file-based (SQLite)
    Sqlite,
}

impl EngineKind {
    /// Schema unqualified objects live in when the engine has a fixed default
    pub fn default_schema(&self) -> Option<&'static str> {
        match self {
            EngineKind::Postgres => Some("public"),
            EngineKind::Sqlite => Some("main"),
            EngineKind::MySql => None,
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Postgres => write!(f, "postgres"),
            EngineKind::MySql => write!(f, "mysql"),
            EngineKind::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Semantic field types reported for result and schema columns
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// NULL value
    Null,
    /// Boolean true/false
    Boolean,
    /// 32-bit signed integer
    Int32,
    /// 64-bit signed integer
    Int64,
    /// 32-bit floating point
    Float32,
    /// 64-bit floating point
    Float64,
    /// Arbitrary precision decimal, rendered as text
    Decimal,
    /// UTF-8 string
    String,
    /// Binary data
    Bytes,
    /// ISO 8601 date
    Date,
    /// ISO 8601 timestamp
    Timestamp,
    /// JSON object
    Json,
    /// UUID
    Uuid,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Null => write!(f, "null"),
            FieldType::Boolean => write!(f, "boolean"),
            FieldType::Int32 => write!(f, "int32"),
            FieldType::Int64 => write!(f, "int64"),
            FieldType::Float32 => write!(f, "float32"),
            FieldType::Float64 => write!(f, "float64"),
            FieldType::Decimal => write!(f, "decimal"),
            FieldType::String => write!(f, "string"),
            FieldType::Bytes => write!(f, "bytes"),
            FieldType::Date => write!(f, "date"),
            FieldType::Timestamp => write!(f, "timestamp"),
            FieldType::Json => write!(f, "json"),
            FieldType::Uuid => write!(f, "uuid"),
        }
    }
}

/// A registered external data store the engine may query
#[derive(Debug, Clone, Deserialize)]
pub struct DataSource {
    pub id: String,
    pub engine: EngineKind,
    pub descriptor: ConnectionDescriptor,
    /// Always true for sources served by the engine; registration rejects anything else
    #[serde(default = "default_read_only")]
    pub read_only: bool,
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    #[serde(default = "default_max_execution_seconds")]
    pub max_execution_seconds: u64,
    #[serde(default)]
    pub allowed_schemas: BTreeSet<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_read_only() -> bool {
    true
}

fn default_max_rows() -> usize {
    1000
}

fn default_max_execution_seconds() -> u64 {
    30
}

impl DataSource {
    pub fn new(
        id: impl Into<String>,
        engine: EngineKind,
        descriptor: ConnectionDescriptor,
    ) -> Self {
        let now = Utc::now();
        let allowed_schemas = engine
            .default_schema()
            .map(|s| BTreeSet::from([s.to_string()]))
            .unwrap_or_default();

        Self {
            id: id.into(),
            engine,
            descriptor,
            read_only: true,
            max_rows: default_max_rows(),
            max_execution_seconds: default_max_execution_seconds(),
            allowed_schemas,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows;
        self
    }

    pub fn with_max_execution_seconds(mut self, seconds: u64) -> Self {
        self.max_execution_seconds = seconds;
        self
    }

    /// Replace the allowed schema set
    pub fn with_allowed_schemas<I, S>(mut self, schemas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_schemas = schemas.into_iter().map(Into::into).collect();
        self
    }

    /// Hard deadline for a single execution against this source
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.max_execution_seconds)
    }

    /// Case-insensitive membership check against `allowed_schemas`
    pub fn allows_schema(&self, schema: &str) -> bool {
        self.allowed_schemas
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(schema))
    }
}

/// Raw column metadata as reported by an engine during introspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub schema: String,
    pub table: String,
    pub column: String,
    pub declared_type: String,
    pub field_type: FieldType,
    pub nullable: bool,
    pub is_primary_key: bool,
}

/// A column inside a schema snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub declared_type: String,
    pub field_type: FieldType,
    pub nullable: bool,
    pub is_primary_key: bool,
}

/// Tables of one schema, each with its ordered columns
pub type TableMap = BTreeMap<String, Vec<ColumnDef>>;

/// Point-in-time structural metadata for one data source.
///
/// Snapshots are immutable; a refresh builds a new one and swaps it in whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub data_source_id: String,
    pub schemas: BTreeMap<String, TableMap>,
    pub captured_at: DateTime<Utc>,
}

impl SchemaSnapshot {
    /// Group introspected columns into a snapshot, keeping only allowed schemas.
    /// Column order follows the order in which the engine reported them.
    pub fn from_columns(
        data_source_id: impl Into<String>,
        columns: Vec<ColumnMeta>,
        allowed_schemas: &BTreeSet<String>,
    ) -> Self {
        let mut schemas: BTreeMap<String, TableMap> = BTreeMap::new();

        for meta in columns {
            if !allowed_schemas
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(&meta.schema))
            {
                continue;
            }

            schemas
                .entry(meta.schema)
                .or_default()
                .entry(meta.table)
                .or_default()
                .push(ColumnDef {
                    name: meta.column,
                    declared_type: meta.declared_type,
                    field_type: meta.field_type,
                    nullable: meta.nullable,
                    is_primary_key: meta.is_primary_key,
                });
        }

        Self {
            data_source_id: data_source_id.into(),
            schemas,
            captured_at: Utc::now(),
        }
    }

    /// Look up a table's columns; identifiers compare case-insensitively
    pub fn table(&self, schema: &str, table: &str) -> Option<&[ColumnDef]> {
        let tables = self
            .schemas
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(schema))
            .map(|(_, tables)| tables)?;

        tables
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(table))
            .map(|(_, columns)| columns.as_slice())
    }

    /// Canonical (as-captured) names of every schema holding a table with this name
    pub fn schemas_containing(&self, table: &str) -> Vec<&str> {
        self.schemas
            .iter()
            .filter(|(_, tables)| tables.keys().any(|t| t.eq_ignore_ascii_case(table)))
            .map(|(schema, _)| schema.as_str())
            .collect()
    }

    /// Canonical (schema, table) spelling for a case-insensitive reference
    pub fn canonical_name(&self, schema: &str, table: &str) -> Option<(String, String)> {
        let (schema_name, tables) = self
            .schemas
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(schema))?;

        tables
            .keys()
            .find(|name| name.eq_ignore_ascii_case(table))
            .map(|table_name| (schema_name.clone(), table_name.clone()))
    }

    pub fn table_count(&self) -> usize {
        self.schemas.values().map(|tables| tables.len()).sum()
    }
}

/// Output column of a raw or final result set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultColumn {
    pub name: String,
    pub field_type: FieldType,
}

impl ResultColumn {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Rows exactly as an engine returned them, before masking or capping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRows {
    pub columns: Vec<ResultColumn>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl RawRows {
    pub fn new(columns: Vec<ResultColumn>, rows: Vec<Vec<serde_json::Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
