use crate::error::{DataError, Result};
use crate::traits::{RawConnectionFactory, SchemaProvider};
use crate::types::{ColumnMeta, DataSource, EngineKind};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// A credential that never shows up in Debug output or logs
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(***)")
    }
}

/// How to reach a data source. Credentials are either inline (wrapped in
/// [`Secret`]) or referenced by environment variable name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionDescriptor {
    /// Host or connection endpoint
    pub host: Option<String>,
    /// Port number
    pub port: Option<u16>,
    /// Username
    pub username: Option<String>,
    /// Inline password
    pub password: Option<Secret>,
    /// Name of the environment variable holding the password
    pub credentials_ref: Option<String>,
    /// Database name
    pub database: Option<String>,
    /// File path for embedded engines
    pub path: Option<PathBuf>,
    /// Additional options as key-value pairs
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl ConnectionDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Secret::new(password));
        self
    }

    pub fn with_credentials_ref(mut self, env_var: impl Into<String>) -> Self {
        self.credentials_ref = Some(env_var.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Resolve the password at connect time. Inline secrets win over references.
    pub fn resolve_password(&self) -> Result<Option<String>> {
        if let Some(secret) = &self.password {
            return Ok(Some(secret.expose().to_string()));
        }

        match &self.credentials_ref {
            Some(var) => std::env::var(var).map(Some).map_err(|_| {
                DataError::invalid_configuration(format!(
                    "Credentials reference '{}' is not set",
                    var
                ))
            }),
            None => Ok(None),
        }
    }

    /// Get connection string for display purposes (without password)
    pub fn connection_string(&self) -> String {
        let mut parts = Vec::new();

        if let Some(username) = &self.username {
            parts.push(format!("{}@", username));
        }

        if let Some(host) = &self.host {
            parts.push(host.clone());

            if let Some(port) = self.port {
                parts.push(format!(":{}", port));
            }
        }

        if let Some(database) = &self.database {
            parts.push(format!("/{}", database));
        }

        if let Some(path) = &self.path {
            parts.push(path.display().to_string());
        }

        parts.join("")
    }
}

/// Registry mapping each engine kind to the factory that opens its connections
pub struct ConnectorRegistry {
    factories: Arc<RwLock<HashMap<EngineKind, Arc<dyn RawConnectionFactory>>>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            factories: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a factory for the engine kind it reports
    pub async fn register_factory(&self, factory: Arc<dyn RawConnectionFactory>) {
        let engine = factory.engine();
        let mut factories = self.factories.write().await;

        if factories.contains_key(&engine) {
            warn!("Overwriting existing connector factory for engine: {}", engine);
        }

        factories.insert(engine, factory);
        debug!("Registered connector factory for engine: {}", engine);
    }

    /// Get the factory for an engine kind
    pub async fn factory(&self, engine: EngineKind) -> Result<Arc<dyn RawConnectionFactory>> {
        let factories = self.factories.read().await;

        factories.get(&engine).cloned().ok_or_else(|| {
            DataError::invalid_configuration(format!(
                "No connector registered for engine: {}",
                engine
            ))
        })
    }

    /// List registered engine kinds
    pub async fn engines(&self) -> Vec<EngineKind> {
        let factories = self.factories.read().await;
        factories.keys().copied().collect()
    }

    pub async fn has_engine(&self, engine: EngineKind) -> bool {
        let factories = self.factories.read().await;
        factories.contains_key(&engine)
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Schema provider that opens a short-lived connection through the registry
/// and asks the engine to introspect itself.
pub struct ConnectorSchemaProvider {
    registry: Arc<ConnectorRegistry>,
}

impl ConnectorSchemaProvider {
    pub fn new(registry: Arc<ConnectorRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl SchemaProvider for ConnectorSchemaProvider {
    async fn fetch(&self, source: &DataSource) -> Result<Vec<ColumnMeta>> {
        let factory = self.registry.factory(source.engine).await?;

        debug!(
            "Introspecting data source {} ({})",
            source.id,
            source.descriptor.connection_string()
        );

        let mut connection = factory.open(&source.descriptor).await?;
        let columns = connection.introspect(&source.allowed_schemas).await?;

        debug!(
            "Introspection of {} returned {} columns",
            source.id,
            columns.len()
        );

        Ok(columns)
    }
}
