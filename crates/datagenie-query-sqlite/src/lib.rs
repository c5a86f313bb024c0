//! SQLite connector for datagenie-query
//!
//! Files are opened read-only. Statements run on the blocking pool since
//! rusqlite is synchronous; a dropped connection interrupts whatever statement
//! is still running there.

use async_trait::async_trait;
use datagenie_query::{
    ColumnMeta, ConnectionDescriptor, DataError, EngineKind, FieldType, RawConnection,
    RawConnectionFactory, RawRows, Result, ResultColumn,
};
use parking_lot::Mutex;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, ErrorCode, InterruptHandle, OpenFlags};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// The only schema an attached-free SQLite file exposes
const MAIN_SCHEMA: &str = "main";

/// Factory for file-based SQLite data sources
#[derive(Debug, Default, Clone)]
pub struct SqliteConnectionFactory;

impl SqliteConnectionFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RawConnectionFactory for SqliteConnectionFactory {
    fn engine(&self) -> EngineKind {
        EngineKind::Sqlite
    }

    async fn open(&self, descriptor: &ConnectionDescriptor) -> Result<Box<dyn RawConnection>> {
        let connection = SqliteConnection::open(descriptor).await?;
        Ok(Box::new(connection))
    }
}

pub struct SqliteConnection {
    conn: Arc<Mutex<Connection>>,
    interrupt: InterruptHandle,
}

impl SqliteConnection {
    pub async fn open(descriptor: &ConnectionDescriptor) -> Result<Self> {
        let path = descriptor.path.clone().ok_or_else(|| {
            DataError::invalid_configuration("SQLite data source requires a file path")
        })?;

        debug!("Opening SQLite database: {}", path.display());

        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(|e| {
                DataError::ConnectionFailed(format!(
                    "Failed to open SQLite database {}: {}",
                    path.display(),
                    e
                ))
            })?;

            conn.pragma_update(None, "query_only", true).map_err(|e| {
                DataError::ConnectionFailed(format!("Failed to enable query_only: {}", e))
            })?;

            Ok(conn)
        })
        .await
        .map_err(|e| DataError::Internal(format!("SQLite open task failed: {}", e)))??;

        let interrupt = conn.get_interrupt_handle();

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
        })
    }

    /// Map a declared column type to a FieldType using SQLite affinity rules
    fn map_sqlite_type(declared: &str) -> FieldType {
        let upper = declared.to_ascii_uppercase();

        if upper.contains("BOOL") {
            FieldType::Boolean
        } else if upper.contains("DATETIME") || upper.contains("TIMESTAMP") {
            FieldType::Timestamp
        } else if upper.contains("DATE") {
            FieldType::Date
        } else if upper.contains("INT") {
            FieldType::Int64
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            FieldType::String
        } else if upper.contains("BLOB") {
            FieldType::Bytes
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            FieldType::Float64
        } else if upper.contains("NUMERIC") || upper.contains("DECIMAL") {
            FieldType::Decimal
        } else if upper.contains("JSON") {
            FieldType::Json
        } else {
            FieldType::String
        }
    }

    fn value_to_json(value: ValueRef<'_>) -> serde_json::Value {
        match value {
            ValueRef::Null => serde_json::Value::Null,
            ValueRef::Integer(i) => serde_json::Value::Number(i.into()),
            ValueRef::Real(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueRef::Text(bytes) => {
                serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
            }
            ValueRef::Blob(bytes) => serde_json::Value::Array(
                bytes
                    .iter()
                    .map(|b| serde_json::Value::Number((*b).into()))
                    .collect(),
            ),
        }
    }

    fn value_field_type(value: ValueRef<'_>) -> Option<FieldType> {
        match value {
            ValueRef::Null => None,
            ValueRef::Integer(_) => Some(FieldType::Int64),
            ValueRef::Real(_) => Some(FieldType::Float64),
            ValueRef::Text(_) => Some(FieldType::String),
            ValueRef::Blob(_) => Some(FieldType::Bytes),
        }
    }

    fn bind_param(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Integer(*b as i64),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Real(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::Text(s.clone()),
            other => Value::Text(other.to_string()),
        }
    }

    fn map_error(e: rusqlite::Error) -> DataError {
        match &e {
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.code == ErrorCode::OperationInterrupted =>
            {
                DataError::ConnectionLost("statement interrupted".to_string())
            }
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.code == ErrorCode::CannotOpen
                    || failure.code == ErrorCode::NotADatabase =>
            {
                DataError::ConnectionLost(e.to_string())
            }
            _ => DataError::QueryFailed(e.to_string()),
        }
    }

    fn run_query(conn: &Connection, sql: &str, params: Vec<Value>) -> Result<RawRows> {
        let mut stmt = conn.prepare(sql).map_err(Self::map_error)?;
        let names: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();
        let width = names.len();
        let mut field_types: Vec<Option<FieldType>> = vec![None; width];

        let mut rows = stmt
            .query(rusqlite::params_from_iter(params))
            .map_err(Self::map_error)?;

        let mut data = Vec::new();
        while let Some(row) = rows.next().map_err(Self::map_error)? {
            let mut values = Vec::with_capacity(width);
            for (idx, field_type) in field_types.iter_mut().enumerate() {
                let value = row.get_ref(idx).map_err(Self::map_error)?;
                if field_type.is_none() {
                    *field_type = Self::value_field_type(value);
                }
                values.push(Self::value_to_json(value));
            }
            data.push(values);
        }

        let columns = names
            .into_iter()
            .zip(field_types)
            .map(|(name, field_type)| {
                ResultColumn::new(name, field_type.unwrap_or(FieldType::String))
            })
            .collect();

        Ok(RawRows::new(columns, data))
    }

    fn run_introspection(conn: &Connection) -> Result<Vec<ColumnMeta>> {
        let mut tables_stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master \
                 WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
                 ORDER BY name",
            )
            .map_err(|e| DataError::SchemaError(e.to_string()))?;

        let tables = tables_stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| DataError::SchemaError(e.to_string()))?
            .collect::<std::result::Result<Vec<String>, _>>()
            .map_err(|e| DataError::SchemaError(e.to_string()))?;

        let mut columns_stmt = conn
            .prepare(
                "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid",
            )
            .map_err(|e| DataError::SchemaError(e.to_string()))?;

        let mut columns = Vec::new();
        for table in tables {
            let table_columns = columns_stmt
                .query_map([&table], |row| {
                    let declared: String = row.get::<_, Option<String>>(1)?.unwrap_or_default();
                    let not_null: i64 = row.get(2)?;
                    let pk: i64 = row.get(3)?;
                    Ok(ColumnMeta {
                        schema: MAIN_SCHEMA.to_string(),
                        table: table.clone(),
                        column: row.get(0)?,
                        field_type: Self::map_sqlite_type(&declared),
                        declared_type: declared,
                        nullable: not_null == 0,
                        is_primary_key: pk > 0,
                    })
                })
                .map_err(|e| DataError::SchemaError(e.to_string()))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| DataError::SchemaError(e.to_string()))?;

            columns.extend(table_columns);
        }

        Ok(columns)
    }
}

#[async_trait]
impl RawConnection for SqliteConnection {
    async fn execute(&mut self, sql: &str, params: &[serde_json::Value]) -> Result<RawRows> {
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        let params: Vec<Value> = params.iter().map(Self::bind_param).collect();

        let rows = tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            Self::run_query(&conn, &sql, params)
        })
        .await
        .map_err(|e| DataError::Internal(format!("SQLite query task failed: {}", e)))??;

        debug!("SQLite returned {} rows", rows.len());
        Ok(rows)
    }

    async fn ping(&mut self) -> Result<()> {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map(|_| ())
                .map_err(|e| DataError::ConnectionLost(e.to_string()))
        })
        .await
        .map_err(|e| DataError::Internal(format!("SQLite ping task failed: {}", e)))?
    }

    async fn introspect(&mut self, allowed_schemas: &BTreeSet<String>) -> Result<Vec<ColumnMeta>> {
        if !allowed_schemas
            .iter()
            .any(|schema| schema.eq_ignore_ascii_case(MAIN_SCHEMA))
        {
            warn!("SQLite source does not allow the '{}' schema; nothing to introspect", MAIN_SCHEMA);
            return Ok(Vec::new());
        }

        let conn = Arc::clone(&self.conn);

        let columns = tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            Self::run_introspection(&conn)
        })
        .await
        .map_err(|e| DataError::Internal(format!("SQLite introspection task failed: {}", e)))??;

        debug!("Found {} SQLite columns", columns.len());
        Ok(columns)
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        // Abort any statement still running on the blocking pool
        self.interrupt.interrupt();
    }
}
