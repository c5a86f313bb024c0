//! PostgreSQL connector for datagenie-query
//!
//! Opens read-only sessions over `tokio-postgres`, decodes rows into JSON values
//! and introspects `information_schema` for schema snapshots.

use async_trait::async_trait;
use datagenie_query::{
    ColumnMeta, ConnectionDescriptor, DataError, EngineKind, FieldType, RawConnection,
    RawConnectionFactory, RawRows, Result, ResultColumn,
};
use std::collections::BTreeSet;
use std::error::Error;
use tokio::task::JoinHandle;
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::{CancelToken, Client, NoTls, Row};
use tracing::{debug, error, warn};

const INTROSPECTION_QUERY: &str = r#"
    SELECT
        c.table_schema::text,
        c.table_name::text,
        c.column_name::text,
        c.data_type::text,
        c.is_nullable::text,
        EXISTS (
            SELECT 1
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
                AND tc.table_name = kcu.table_name
            WHERE tc.constraint_type = 'PRIMARY KEY'
                AND kcu.table_schema = c.table_schema
                AND kcu.table_name = c.table_name
                AND kcu.column_name = c.column_name
        ) AS is_primary_key
    FROM information_schema.columns c
    JOIN information_schema.tables t
        ON t.table_schema = c.table_schema
        AND t.table_name = c.table_name
    WHERE c.table_schema = ANY($1)
        AND t.table_type IN ('BASE TABLE', 'VIEW')
    ORDER BY c.table_schema, c.table_name, c.ordinal_position
"#;

/// Factory for PostgreSQL-compatible data sources
#[derive(Debug, Default, Clone)]
pub struct PostgresConnectionFactory;

impl PostgresConnectionFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RawConnectionFactory for PostgresConnectionFactory {
    fn engine(&self) -> EngineKind {
        EngineKind::Postgres
    }

    async fn open(&self, descriptor: &ConnectionDescriptor) -> Result<Box<dyn RawConnection>> {
        let connection = PostgresConnection::connect(descriptor).await?;
        Ok(Box::new(connection))
    }
}

/// A single read-only PostgreSQL session
pub struct PostgresConnection {
    client: Client,
    cancel_token: CancelToken,
    driver: JoinHandle<()>,
    busy: bool,
}

impl PostgresConnection {
    /// Connect and switch the session to read-only transactions
    pub async fn connect(descriptor: &ConnectionDescriptor) -> Result<Self> {
        let mut config = tokio_postgres::Config::new();
        config.host(descriptor.host.as_deref().unwrap_or("localhost"));
        config.port(descriptor.port.unwrap_or(5432));

        if let Some(username) = &descriptor.username {
            config.user(username);
        }
        if let Some(password) = descriptor.resolve_password()? {
            config.password(password);
        }
        if let Some(database) = &descriptor.database {
            config.dbname(database);
        }
        config.application_name("datagenie");

        debug!(
            "Connecting to PostgreSQL: {}",
            descriptor.connection_string()
        );

        let (client, connection) = config.connect(NoTls).await.map_err(|e| {
            DataError::ConnectionFailed(format!("PostgreSQL connection failed: {}", e))
        })?;

        // Spawn connection handler
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        client
            .batch_execute("SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY")
            .await
            .map_err(|e| {
                DataError::ConnectionFailed(format!("Failed to enter read-only mode: {}", e))
            })?;

        let cancel_token = client.cancel_token();

        Ok(Self {
            client,
            cancel_token,
            driver,
            busy: false,
        })
    }

    /// Map PostgreSQL type to FieldType
    fn map_pg_type(pg_type: &str) -> FieldType {
        match pg_type {
            "boolean" | "bool" => FieldType::Boolean,
            "smallint" | "int2" => FieldType::Int32,
            "integer" | "int" | "int4" => FieldType::Int32,
            "bigint" | "int8" => FieldType::Int64,
            "real" | "float4" => FieldType::Float32,
            "double precision" | "float8" => FieldType::Float64,
            "numeric" | "decimal" => FieldType::Decimal,
            "character varying" | "varchar" | "character" | "char" | "bpchar" | "text" => {
                FieldType::String
            }
            "bytea" => FieldType::Bytes,
            "date" => FieldType::Date,
            "timestamp"
            | "timestamp without time zone"
            | "timestamp with time zone"
            | "timestamptz" => FieldType::Timestamp,
            "json" | "jsonb" => FieldType::Json,
            "uuid" => FieldType::Uuid,
            _ => FieldType::String, // Default fallback
        }
    }

    /// Extract value from PostgreSQL row
    fn extract_value(row: &Row, idx: usize) -> serde_json::Value {
        let column = &row.columns()[idx];
        let type_name = column.type_().name();

        match type_name {
            "bool" => row
                .try_get::<_, Option<bool>>(idx)
                .ok()
                .flatten()
                .map(serde_json::Value::Bool)
                .unwrap_or(serde_json::Value::Null),

            "int2" => row
                .try_get::<_, Option<i16>>(idx)
                .ok()
                .flatten()
                .map(|v| serde_json::Value::Number(v.into()))
                .unwrap_or(serde_json::Value::Null),

            "int4" => row
                .try_get::<_, Option<i32>>(idx)
                .ok()
                .flatten()
                .map(|v| serde_json::Value::Number(v.into()))
                .unwrap_or(serde_json::Value::Null),

            "int8" => row
                .try_get::<_, Option<i64>>(idx)
                .ok()
                .flatten()
                .map(|v| serde_json::Value::Number(v.into()))
                .unwrap_or(serde_json::Value::Null),

            "float4" => row
                .try_get::<_, Option<f32>>(idx)
                .ok()
                .flatten()
                .and_then(|v| serde_json::Number::from_f64(v as f64))
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),

            "float8" => row
                .try_get::<_, Option<f64>>(idx)
                .ok()
                .flatten()
                .and_then(serde_json::Number::from_f64)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),

            "numeric" => row
                .try_get::<_, Option<PgNumeric>>(idx)
                .ok()
                .flatten()
                .map(|v| v.into_json())
                .unwrap_or(serde_json::Value::Null),

            "date" => row
                .try_get::<_, Option<chrono::NaiveDate>>(idx)
                .ok()
                .flatten()
                .map(|v| serde_json::Value::String(v.to_string()))
                .unwrap_or(serde_json::Value::Null),

            "timestamp" => row
                .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
                .ok()
                .flatten()
                .map(|v| serde_json::Value::String(v.to_string()))
                .unwrap_or(serde_json::Value::Null),

            "timestamptz" => row
                .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
                .ok()
                .flatten()
                .map(|v| serde_json::Value::String(v.to_rfc3339()))
                .unwrap_or(serde_json::Value::Null),

            "json" | "jsonb" => row
                .try_get::<_, Option<serde_json::Value>>(idx)
                .ok()
                .flatten()
                .unwrap_or(serde_json::Value::Null),

            "uuid" => row
                .try_get::<_, Option<uuid::Uuid>>(idx)
                .ok()
                .flatten()
                .map(|v| serde_json::Value::String(v.to_string()))
                .unwrap_or(serde_json::Value::Null),

            _ => {
                // Try to get as string for unknown types
                row.try_get::<_, Option<String>>(idx)
                    .ok()
                    .flatten()
                    .map(serde_json::Value::String)
                    .unwrap_or(serde_json::Value::Null)
            }
        }
    }

    fn bind_param(value: &serde_json::Value) -> Box<dyn ToSql + Sync + Send> {
        match value {
            serde_json::Value::Null => Box::new(Option::<String>::None),
            serde_json::Value::Bool(b) => Box::new(*b),
            serde_json::Value::Number(n) if n.is_i64() => Box::new(n.as_i64()),
            serde_json::Value::Number(n) => Box::new(n.as_f64()),
            serde_json::Value::String(s) => Box::new(s.clone()),
            other => Box::new(other.clone()),
        }
    }

    /// Reduce a driver error to something safe to log. Engine messages may echo
    /// literal values, so only the SQLSTATE and message are kept.
    fn describe_error(e: &tokio_postgres::Error) -> String {
        match e.as_db_error() {
            Some(db_error) => format!("{} ({})", db_error.message(), db_error.code().code()),
            None => e.to_string(),
        }
    }
}

#[async_trait]
impl RawConnection for PostgresConnection {
    async fn execute(&mut self, sql: &str, params: &[serde_json::Value]) -> Result<RawRows> {
        let bound: Vec<Box<dyn ToSql + Sync + Send>> = params.iter().map(Self::bind_param).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = bound
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let statement = self.client.prepare(sql).await.map_err(|e| {
            if e.is_closed() {
                DataError::ConnectionLost(Self::describe_error(&e))
            } else {
                DataError::QueryFailed(Self::describe_error(&e))
            }
        })?;

        // Cleared only on completion; a dropped future leaves it set for Drop
        self.busy = true;
        let result = self.client.query(&statement, &refs).await;
        self.busy = false;

        let rows = result.map_err(|e| {
            warn!("PostgreSQL execution failed: {}", Self::describe_error(&e));
            if e.is_closed() {
                DataError::ConnectionLost(Self::describe_error(&e))
            } else {
                DataError::QueryFailed(Self::describe_error(&e))
            }
        })?;

        let columns = statement
            .columns()
            .iter()
            .map(|col| ResultColumn::new(col.name(), Self::map_pg_type(col.type_().name())))
            .collect::<Vec<_>>();

        let data = rows
            .iter()
            .map(|row| {
                (0..row.columns().len())
                    .map(|idx| Self::extract_value(row, idx))
                    .collect()
            })
            .collect::<Vec<_>>();

        debug!("PostgreSQL returned {} rows", data.len());

        Ok(RawRows::new(columns, data))
    }

    async fn ping(&mut self) -> Result<()> {
        if self.client.is_closed() {
            return Err(DataError::ConnectionLost("client closed".to_string()));
        }

        self.client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(|e| DataError::ConnectionLost(Self::describe_error(&e)))
    }

    async fn introspect(&mut self, allowed_schemas: &BTreeSet<String>) -> Result<Vec<ColumnMeta>> {
        let schemas: Vec<String> = allowed_schemas.iter().cloned().collect();

        let rows = self
            .client
            .query(INTROSPECTION_QUERY, &[&schemas])
            .await
            .map_err(|e| {
                DataError::SchemaError(format!(
                    "Failed to introspect schemas: {}",
                    Self::describe_error(&e)
                ))
            })?;

        let columns = rows
            .iter()
            .map(|row| {
                let data_type: String = row.get(3);
                let is_nullable: String = row.get(4);

                ColumnMeta {
                    schema: row.get(0),
                    table: row.get(1),
                    column: row.get(2),
                    field_type: Self::map_pg_type(&data_type),
                    declared_type: data_type,
                    nullable: is_nullable == "YES",
                    is_primary_key: row.get(5),
                }
            })
            .collect::<Vec<_>>();

        debug!("Found {} columns across {} schemas", columns.len(), schemas.len());

        Ok(columns)
    }
}

impl Drop for PostgresConnection {
    fn drop(&mut self) {
        // A statement still running server-side gets an explicit cancel request
        if self.busy {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let token = self.cancel_token.clone();
                handle.spawn(async move {
                    if let Err(e) = token.cancel_query(NoTls).await {
                        warn!("Failed to cancel abandoned PostgreSQL query: {}", e);
                    }
                });
            }
        }
        self.driver.abort();
    }
}

/// PostgreSQL `numeric` decoded from its binary wire format into decimal text
struct PgNumeric(String);

impl PgNumeric {
    fn into_json(self) -> serde_json::Value {
        self.0
            .parse::<serde_json::Number>()
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::String(self.0))
    }
}

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, Box<dyn Error + Sync + Send>> {
        decode_numeric(raw).map(PgNumeric)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

fn decode_numeric(raw: &[u8]) -> std::result::Result<String, Box<dyn Error + Sync + Send>> {
    if raw.len() < 8 {
        return Err("numeric value too short".into());
    }

    let ndigits = i16::from_be_bytes([raw[0], raw[1]]).max(0) as usize;
    let weight = i16::from_be_bytes([raw[2], raw[3]]) as i32;
    let sign = u16::from_be_bytes([raw[4], raw[5]]);
    let dscale = u16::from_be_bytes([raw[6], raw[7]]) as usize;

    if sign == 0xC000 {
        return Ok("NaN".to_string());
    }
    if raw.len() < 8 + ndigits * 2 {
        return Err("numeric value truncated".into());
    }

    let digits: Vec<i16> = (0..ndigits)
        .map(|i| i16::from_be_bytes([raw[8 + 2 * i], raw[9 + 2 * i]]))
        .collect();
    let digit_at = |pos: i32| -> i16 {
        if pos >= 0 && (pos as usize) < digits.len() {
            digits[pos as usize]
        } else {
            0
        }
    };

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        for pos in 0..=weight {
            if pos == 0 {
                out.push_str(&digit_at(pos).to_string());
            } else {
                out.push_str(&format!("{:04}", digit_at(pos)));
            }
        }
    }

    if dscale > 0 {
        let mut fraction = String::new();
        let mut pos = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit_at(pos)));
            pos += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }

    Ok(out)
}
