//! Per-data-source pools of read-only connections
//!
//! Each pool is bounded by a semaphore. A [`PooledConnection`] holds a permit
//! for as long as it lives and goes back to the idle list on drop, unless it
//! timed out, failed, or was dropped while a statement was running.

use crate::config::PoolConfig;
use crate::error::PoolError;
use datagenie_query::{
    ConnectionDescriptor, ConnectorRegistry, DataSource, RawConnection, RawConnectionFactory,
    RawRows,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub max_connections: usize,
    /// Connections currently checked out
    pub active: usize,
    pub idle: usize,
}

struct IdleConnection {
    conn: Box<dyn RawConnection>,
    idle_since: Instant,
}

struct PoolInner {
    data_source_id: String,
    descriptor: ConnectionDescriptor,
    factory: Arc<dyn RawConnectionFactory>,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection>>,
    active: AtomicUsize,
    closed: AtomicBool,
    executions: Arc<AtomicU64>,
}

/// Bounded pool for one data source. Cloning shares the pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(
        source: &DataSource,
        factory: Arc<dyn RawConnectionFactory>,
        config: PoolConfig,
        executions: Arc<AtomicU64>,
    ) -> Self {
        let max = config.max_connections.max(1);
        Self {
            inner: Arc::new(PoolInner {
                data_source_id: source.id.clone(),
                descriptor: source.descriptor.clone(),
                factory,
                config,
                semaphore: Arc::new(Semaphore::new(max)),
                idle: Mutex::new(VecDeque::new()),
                active: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                executions,
            }),
        }
    }

    pub fn data_source_id(&self) -> &str {
        &self.inner.data_source_id
    }

    /// Check out a connection, waiting at most `acquire_timeout` for a slot
    pub async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed(inner.data_source_id.clone()));
        }

        let wait = inner.config.acquire_timeout();
        let started = Instant::now();
        let permit = match tokio::time::timeout(wait, inner.semaphore.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed(inner.data_source_id.clone())),
            Err(_) => {
                warn!(
                    "Pool for {} exhausted after {}ms",
                    inner.data_source_id,
                    wait.as_millis()
                );
                return Err(PoolError::Exhausted {
                    data_source: inner.data_source_id.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        };

        inner.active.fetch_add(1, Ordering::AcqRel);
        let mut pooled = PooledConnection {
            conn: None,
            pool: self.inner.clone(),
            healthy: true,
            _permit: permit,
        };

        pooled.conn = Some(match self.take_idle().await {
            Some(conn) => conn,
            None => {
                debug!("Opening new connection for {}", inner.data_source_id);
                inner.factory.open(&inner.descriptor).await?
            }
        });

        Ok(pooled)
    }

    /// Pop a reusable idle connection, recycling stale or dead ones
    async fn take_idle(&self) -> Option<Box<dyn RawConnection>> {
        let max_age = self.inner.config.max_idle_age();

        loop {
            let candidate = self.inner.idle.lock().pop_back()?;

            if candidate.idle_since.elapsed() >= max_age {
                debug!(
                    "Recycling idle connection for {} (idle {:?})",
                    self.inner.data_source_id,
                    candidate.idle_since.elapsed()
                );
                continue;
            }

            let mut conn = candidate.conn;
            if self.inner.config.liveness_probe {
                if let Err(e) = conn.ping().await {
                    warn!(
                        "Liveness probe failed for {}, discarding connection: {}",
                        self.inner.data_source_id, e
                    );
                    continue;
                }
            }
            return Some(conn);
        }
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            max_connections: self.inner.config.max_connections.max(1),
            active: self.inner.active.load(Ordering::Acquire),
            idle: self.inner.idle.lock().len(),
        }
    }

    /// Stop handing out connections and drop the idle ones. Checked-out
    /// connections are discarded when released.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.semaphore.close();
        let drained = {
            let mut idle = self.inner.idle.lock();
            let count = idle.len();
            idle.clear();
            count
        };
        info!(
            "Closed pool for {} ({} idle connections dropped)",
            self.inner.data_source_id, drained
        );
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// A checked-out connection. Returned to its pool on drop when still trusted.
pub struct PooledConnection {
    conn: Option<Box<dyn RawConnection>>,
    pool: Arc<PoolInner>,
    /// Cleared while a statement is in flight and after any failure
    healthy: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Run one statement under `timeout`. On expiry the connection is
    /// force-closed; on an engine error it is discarded.
    pub async fn execute(
        &mut self,
        sql: &str,
        params: &[serde_json::Value],
        timeout: Duration,
    ) -> Result<RawRows, PoolError> {
        let data_source_id = self.pool.data_source_id.clone();
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| PoolError::Closed(data_source_id.clone()))?;

        self.pool.executions.fetch_add(1, Ordering::Relaxed);
        self.healthy = false;
        let outcome = tokio::time::timeout(timeout, conn.execute(sql, params)).await;

        match outcome {
            Ok(Ok(rows)) => {
                self.healthy = true;
                Ok(rows)
            }
            Ok(Err(e)) => {
                warn!("Execution failed on {}: {}", data_source_id, e);
                self.conn.take();
                Err(PoolError::Engine(e))
            }
            Err(_) => {
                let ms = timeout.as_millis() as u64;
                warn!(
                    "Execution on {} exceeded {}ms, force-closing connection",
                    data_source_id, ms
                );
                self.conn.take();
                Err(PoolError::Timeout(ms))
            }
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.healthy && !self.pool.closed.load(Ordering::Acquire) {
                self.pool.idle.lock().push_back(IdleConnection {
                    conn,
                    idle_since: Instant::now(),
                });
            } else {
                debug!(
                    "Discarding connection for {} on release",
                    self.pool.data_source_id
                );
            }
        }
        self.pool.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Owns one pool per registered data source
pub struct PoolManager {
    registry: Arc<ConnectorRegistry>,
    config: PoolConfig,
    pools: RwLock<HashMap<String, ConnectionPool>>,
    executions: Arc<AtomicU64>,
}

impl PoolManager {
    pub fn new(registry: Arc<ConnectorRegistry>, config: PoolConfig) -> Self {
        Self {
            registry,
            config,
            pools: RwLock::new(HashMap::new()),
            executions: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create (or replace) the pool for a data source. Fails when no factory
    /// is registered for its engine.
    pub async fn create_pool(&self, source: &DataSource) -> Result<(), PoolError> {
        let factory = self.registry.factory(source.engine).await?;
        let pool = ConnectionPool::new(
            source,
            factory,
            self.config.clone(),
            self.executions.clone(),
        );

        let previous = {
            let mut pools = self.pools.write().await;
            pools.insert(source.id.clone(), pool)
        };
        if let Some(previous) = previous {
            previous.close();
        }

        info!(
            "Created {} pool for {} (max {} connections)",
            source.engine, source.id, self.config.max_connections
        );
        Ok(())
    }

    /// Remove and close a pool; returns whether one existed
    pub async fn remove_pool(&self, data_source_id: &str) -> bool {
        let removed = {
            let mut pools = self.pools.write().await;
            pools.remove(data_source_id)
        };
        match removed {
            Some(pool) => {
                pool.close();
                true
            }
            None => false,
        }
    }

    pub async fn pool(&self, data_source_id: &str) -> Option<ConnectionPool> {
        let pools = self.pools.read().await;
        pools.get(data_source_id).cloned()
    }

    pub async fn acquire(&self, data_source_id: &str) -> Result<PooledConnection, PoolError> {
        let pool = self
            .pool(data_source_id)
            .await
            .ok_or_else(|| PoolError::UnknownDataSource(data_source_id.to_string()))?;
        pool.acquire().await
    }

    pub async fn status(&self, data_source_id: &str) -> Option<PoolStatus> {
        self.pool(data_source_id).await.map(|pool| pool.status())
    }

    /// Statements issued to any pool since startup
    pub fn execution_count(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }
}
