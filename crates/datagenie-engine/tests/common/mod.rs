//! Shared fakes for engine integration tests
//!
//! - `FakeFactory`: an in-memory "database" that serves one fixed result set,
//!   honors a trailing `LIMIT n`, and can be slowed down
//! - `ScriptedReasoning`: a reasoning service that replays canned replies
//! - helpers to build a coordinator wired to both

#![allow(dead_code)]

use async_trait::async_trait;
use datagenie_engine::{
    ColumnSensitivityPolicy, EngineConfig, ExecutionCoordinator, ReasoningError,
    ReasoningService, StaticSensitivityPolicy,
};
use datagenie_query::{
    ColumnMeta, ConnectionDescriptor, ConnectorRegistry, DataSource, EngineKind, FieldType,
    RawConnection, RawConnectionFactory, RawRows, ResultColumn,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const SOURCE_ID: &str = "sales";

pub fn column(schema: &str, table: &str, name: &str, declared: &str, field: FieldType) -> ColumnMeta {
    ColumnMeta {
        schema: schema.to_string(),
        table: table.to_string(),
        column: name.to_string(),
        declared_type: declared.to_string(),
        field_type: field,
        nullable: name != "id",
        is_primary_key: name == "id",
    }
}

/// `public.orders`, `public.customers` and a `finance.orders` table that sits
/// outside the default allowed schemas
pub fn sales_schema() -> Vec<ColumnMeta> {
    vec![
        column("public", "orders", "id", "integer", FieldType::Int32),
        column("public", "orders", "order_date", "date", FieldType::Date),
        column("public", "orders", "amount", "numeric", FieldType::Decimal),
        column("public", "orders", "customer_id", "integer", FieldType::Int32),
        column("public", "customers", "id", "integer", FieldType::Int32),
        column("public", "customers", "name", "text", FieldType::String),
        column("public", "customers", "email", "text", FieldType::String),
        column("public", "customers", "phone", "text", FieldType::String),
        column("finance", "orders", "id", "integer", FieldType::Int32),
        column("finance", "orders", "ledger", "text", FieldType::String),
    ]
}

#[derive(Clone)]
pub struct FakeData {
    pub columns: Vec<ResultColumn>,
    pub rows: Vec<Vec<Value>>,
}

impl FakeData {
    pub fn new(columns: &[(&str, FieldType)], rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns: columns
                .iter()
                .map(|(name, field)| ResultColumn::new(*name, *field))
                .collect(),
            rows,
        }
    }

    /// `n` numbered order rows
    pub fn orders(n: usize) -> Self {
        Self::new(
            &[("id", FieldType::Int32), ("amount", FieldType::Decimal)],
            (1..=n).map(|i| vec![json!(i), json!(format!("{}.00", i * 10))]).collect(),
        )
    }

    /// Customer rows with contact details
    pub fn customers() -> Self {
        Self::new(
            &[
                ("name", FieldType::String),
                ("email", FieldType::String),
                ("phone", FieldType::String),
            ],
            vec![
                vec![json!("Alice"), json!("alice@example.com"), json!("010-1234-5678")],
                vec![json!("Bo"), json!("bo@example.com"), json!("010-9876-5432")],
                vec![json!("Cy"), json!(null), json!(null)],
            ],
        )
    }
}

pub struct FakeState {
    pub schema: Vec<ColumnMeta>,
    pub data: FakeData,
    pub delay: Duration,
    pub executed: Vec<String>,
}

/// In-memory connector. Every connection shares the same state.
pub struct FakeFactory {
    pub state: Arc<Mutex<FakeState>>,
    pub opens: AtomicUsize,
}

impl FakeFactory {
    pub fn new(data: FakeData) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(FakeState {
                schema: sales_schema(),
                data,
                delay: Duration::ZERO,
                executed: Vec::new(),
            })),
            opens: AtomicUsize::new(0),
        })
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = delay;
    }

    pub fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }
}

struct FakeConnection {
    state: Arc<Mutex<FakeState>>,
}

fn trailing_limit(sql: &str) -> Option<usize> {
    let upper = sql.to_uppercase();
    let idx = upper.rfind("LIMIT ")?;
    upper[idx + 6..]
        .split_whitespace()
        .next()
        .and_then(|n| n.parse().ok())
}

#[async_trait]
impl RawConnection for FakeConnection {
    async fn execute(&mut self, sql: &str, _params: &[Value]) -> datagenie_query::Result<RawRows> {
        let (delay, data) = {
            let mut state = self.state.lock();
            state.executed.push(sql.to_string());
            (state.delay, state.data.clone())
        };
        tokio::time::sleep(delay).await;

        let mut rows = data.rows;
        if let Some(limit) = trailing_limit(sql) {
            rows.truncate(limit);
        }
        Ok(RawRows::new(data.columns, rows))
    }

    async fn ping(&mut self) -> datagenie_query::Result<()> {
        Ok(())
    }

    async fn introspect(&mut self, allowed: &BTreeSet<String>) -> datagenie_query::Result<Vec<ColumnMeta>> {
        Ok(self
            .state
            .lock()
            .schema
            .iter()
            .filter(|col| allowed.contains(&col.schema))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RawConnectionFactory for FakeFactory {
    fn engine(&self) -> EngineKind {
        EngineKind::Postgres
    }

    async fn open(&self, _descriptor: &ConnectionDescriptor) -> datagenie_query::Result<Box<dyn RawConnection>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            state: self.state.clone(),
        }))
    }
}

/// Replays canned completions in order; the last one repeats
pub struct ScriptedReasoning {
    replies: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    pub calls: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedReasoning {
    pub fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            last: Mutex::new(String::new()),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    /// Service that always answers with this SQL
    pub fn sql(sql: &str) -> Arc<Self> {
        Self::new(&[&sql_reply(sql)])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn sql_reply(sql: &str) -> String {
    json!({
        "sql": sql,
        "explanation": "generated",
        "confidence": 0.9,
        "tables_used": []
    })
    .to_string()
}

#[async_trait]
impl ReasoningService for ScriptedReasoning {
    async fn complete(&self, prompt: &str) -> Result<String, ReasoningError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(prompt.to_string());

        let next = self.replies.lock().pop_front();
        match next {
            Some(reply) => {
                *self.last.lock() = reply.clone();
                Ok(reply)
            }
            None => Ok(self.last.lock().clone()),
        }
    }
}

pub fn postgres_source() -> DataSource {
    DataSource::new(
        SOURCE_ID,
        EngineKind::Postgres,
        ConnectionDescriptor::new()
            .with_host("db.internal")
            .with_port(5432)
            .with_database("sales")
            .with_username("reader")
            .with_password("s3cret-password"),
    )
}

pub fn customer_policy() -> Arc<dyn ColumnSensitivityPolicy> {
    Arc::new(
        StaticSensitivityPolicy::default()
            .with_rule(SOURCE_ID, "customers", "email", datagenie_engine::MaskingKind::Email)
            .with_rule(SOURCE_ID, "customers", "phone", datagenie_engine::MaskingKind::Phone),
    )
}

pub async fn registry_with(factory: Arc<FakeFactory>) -> Arc<ConnectorRegistry> {
    let registry = Arc::new(ConnectorRegistry::new());
    registry.register_factory(factory).await;
    registry
}

/// Coordinator with default configuration over the fake connector
pub async fn engine(
    factory: Arc<FakeFactory>,
    service: Arc<ScriptedReasoning>,
) -> ExecutionCoordinator {
    engine_with(EngineConfig::default(), factory, service, customer_policy()).await
}

pub async fn engine_with(
    config: EngineConfig,
    factory: Arc<FakeFactory>,
    service: Arc<ScriptedReasoning>,
    policy: Arc<dyn ColumnSensitivityPolicy>,
) -> ExecutionCoordinator {
    let registry = registry_with(factory).await;
    ExecutionCoordinator::new(config, registry, service, policy)
}
