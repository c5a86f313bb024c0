//! Request orchestration
//!
//! `Received → SchemaReady → Generated → Validated → CacheCheck →
//! (CacheHit | Executing → Masking) → Done`, or `Failed(kind)` from any step.
//! The coordinator also owns the data-source registry: registering a source
//! creates its pool and schema snapshot, deregistering removes both together
//! with every cache entry derived from it.

use crate::config::EngineConfig;
use crate::error::{EngineError, FailureKind, GenerationError, PoolError, Result};
use crate::generator::{Attempt, QueryGenerator};
use crate::logging::log_digest;
use crate::masking::{mask, resolve_policy, ColumnSensitivityPolicy, StaticSensitivityPolicy};
use crate::pool::{PoolManager, PoolStatus};
use crate::reasoning::{HttpReasoningService, ReasoningService};
use crate::result_cache::{fingerprint, plan_key, CacheCategory, PlanCache, ResultCache};
use crate::schema_cache::SchemaCache;
use crate::single_flight::SingleFlight;
use crate::types::{
    AnalyzeResult, ExecutionResult, QueryFailure, QueryOutcome, QueryRequest, StageTimings,
};
use crate::validator::{QueryValidator, RejectReason, ValidatedQuery, ValidationVerdict};
use anyhow::Context;
use datagenie_query::{
    ConnectorRegistry, ConnectorSchemaProvider, DataError, DataSource, SchemaProvider,
    SchemaSnapshot,
};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    SchemaReady,
    Generated,
    Validated,
    CacheCheck,
    CacheHit,
    Executing,
    Masking,
    Done,
    Failed(FailureKind),
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestState::Received => write!(f, "RECEIVED"),
            RequestState::SchemaReady => write!(f, "SCHEMA_READY"),
            RequestState::Generated => write!(f, "GENERATED"),
            RequestState::Validated => write!(f, "VALIDATED"),
            RequestState::CacheCheck => write!(f, "CACHE_CHECK"),
            RequestState::CacheHit => write!(f, "CACHE_HIT"),
            RequestState::Executing => write!(f, "EXECUTING"),
            RequestState::Masking => write!(f, "MASKING"),
            RequestState::Done => write!(f, "DONE"),
            RequestState::Failed(kind) => write!(f, "FAILED({})", kind),
        }
    }
}

fn transition(request_id: &str, state: RequestState) {
    debug!("[{}] -> {}", request_id, state);
}

/// Counters since startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub requests: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cache_hits: u64,
    pub plan_hits: u64,
    pub generation_retries: u64,
}

#[derive(Default)]
struct StatCounters {
    requests: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cache_hits: AtomicU64,
    plan_hits: AtomicU64,
    generation_retries: AtomicU64,
}

impl StatCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EngineStats {
        EngineStats {
            requests: self.requests.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            plan_hits: self.plan_hits.load(Ordering::Relaxed),
            generation_retries: self.generation_retries.load(Ordering::Relaxed),
        }
    }
}

type ExecutionOutcome = std::result::Result<Arc<ExecutionResult>, FailureKind>;

/// Registration generation per data source. Every register, refresh and
/// deregister moves it, so work started under an older generation can tell
/// that its cache writes are stale.
#[derive(Default)]
struct Generations {
    next: AtomicU64,
    current: RwLock<HashMap<String, u64>>,
}

impl Generations {
    fn bump(&self, data_source_id: &str) -> u64 {
        let generation = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        self.current
            .write()
            .insert(data_source_id.to_string(), generation);
        generation
    }

    fn retire(&self, data_source_id: &str) {
        self.current.write().remove(data_source_id);
    }

    fn current(&self, data_source_id: &str) -> Option<u64> {
        self.current.read().get(data_source_id).copied()
    }

    fn is_current(&self, data_source_id: &str, generation: u64) -> bool {
        self.current(data_source_id) == Some(generation)
    }
}

pub struct ExecutionCoordinator {
    config: EngineConfig,
    registry: Arc<ConnectorRegistry>,
    sources: RwLock<HashMap<String, Arc<DataSource>>>,
    schemas: SchemaCache,
    pools: Arc<PoolManager>,
    generator: QueryGenerator,
    validator: QueryValidator,
    results: Arc<ResultCache>,
    plans: PlanCache,
    flights: SingleFlight<String, ExecutionOutcome>,
    generations: Arc<Generations>,
    policy: Arc<dyn ColumnSensitivityPolicy>,
    stats: StatCounters,
}

impl ExecutionCoordinator {
    /// Coordinator that introspects schemas through the registered connectors
    pub fn new(
        config: EngineConfig,
        registry: Arc<ConnectorRegistry>,
        service: Arc<dyn ReasoningService>,
        policy: Arc<dyn ColumnSensitivityPolicy>,
    ) -> Self {
        let provider: Arc<dyn SchemaProvider> =
            Arc::new(ConnectorSchemaProvider::new(registry.clone()));
        Self::with_schema_provider(config, registry, provider, service, policy)
    }

    pub fn with_schema_provider(
        config: EngineConfig,
        registry: Arc<ConnectorRegistry>,
        provider: Arc<dyn SchemaProvider>,
        service: Arc<dyn ReasoningService>,
        policy: Arc<dyn ColumnSensitivityPolicy>,
    ) -> Self {
        let generator = QueryGenerator::new(
            service,
            config.generation.clone(),
            config.validation.clone(),
        );

        Self {
            registry: registry.clone(),
            sources: RwLock::new(HashMap::new()),
            schemas: SchemaCache::new(provider),
            pools: Arc::new(PoolManager::new(registry, config.pool.clone())),
            generator,
            validator: QueryValidator::new(config.validation.clone()),
            results: Arc::new(ResultCache::new(config.cache.max_entries)),
            plans: PlanCache::new(config.cache.max_entries),
            flights: SingleFlight::new(),
            generations: Arc::new(Generations::default()),
            policy,
            stats: StatCounters::default(),
            config,
        }
    }

    /// Coordinator wired from configuration: bundled connectors, the HTTP
    /// reasoning service and the configured masking rules
    pub async fn from_config(config: EngineConfig) -> anyhow::Result<Self> {
        let registry = crate::default_connectors().await;
        let service = HttpReasoningService::new(&config.reasoning)
            .context("Failed to create reasoning service")?;
        let policy = StaticSensitivityPolicy::new(config.masking.clone());

        info!(
            "Engine configured with {} masking rules, model {}",
            policy.len(),
            config.reasoning.model
        );

        Ok(Self::new(
            config,
            registry,
            Arc::new(service),
            Arc::new(policy),
        ))
    }

    /// Register (or re-register) a data source: creates its pool and captures
    /// its schema. Any cached entry under the same id is dropped, and work
    /// still in flight for an earlier registration no longer writes to the
    /// caches.
    pub async fn register(&self, source: DataSource) -> Result<Arc<SchemaSnapshot>> {
        if !source.read_only {
            return Err(EngineError::invalid_configuration(format!(
                "data source {} must be read-only",
                source.id
            )));
        }
        if source.max_rows == 0 {
            return Err(EngineError::invalid_configuration(format!(
                "data source {} has max_rows = 0",
                source.id
            )));
        }
        if source.max_execution_seconds == 0 {
            return Err(EngineError::invalid_configuration(format!(
                "data source {} has max_execution_seconds = 0",
                source.id
            )));
        }
        if !self.registry.has_engine(source.engine).await {
            return Err(EngineError::invalid_configuration(format!(
                "no connector registered for engine {}",
                source.engine
            )));
        }

        let replacing = self.sources.read().contains_key(&source.id);
        let snapshot = self.schemas.refresh(&source).await?;

        if let Err(e) = self.pools.create_pool(&source).await {
            if !replacing {
                self.schemas.remove(&source.id);
            }
            return Err(match e {
                PoolError::Engine(DataError::InvalidConfiguration(msg)) => {
                    EngineError::InvalidConfiguration(msg)
                }
                other => EngineError::Pool(other),
            });
        }

        self.generations.bump(&source.id);
        self.invalidate_caches(&source.id).await;

        info!(
            "Registered data source {} ({}, {} tables, max {} rows)",
            source.id,
            source.engine,
            snapshot.table_count(),
            source.max_rows
        );
        self.sources
            .write()
            .insert(source.id.clone(), Arc::new(source));

        Ok(snapshot)
    }

    /// Remove a data source with its pool, snapshot, cached results and plans
    pub async fn deregister(&self, data_source_id: &str) -> Result<()> {
        let removed = self.sources.write().remove(data_source_id);
        if removed.is_none() {
            return Err(EngineError::not_found(data_source_id));
        }

        self.generations.retire(data_source_id);
        self.pools.remove_pool(data_source_id).await;
        self.schemas.remove(data_source_id);
        let (results, plans) = self.invalidate_caches(data_source_id).await;

        info!(
            "Deregistered data source {} ({} cached results, {} plans dropped)",
            data_source_id, results, plans
        );
        Ok(())
    }

    /// Re-capture the schema. Cached results and plans of the source are
    /// dropped since they may no longer match it.
    pub async fn refresh_schema(&self, data_source_id: &str) -> Result<Arc<SchemaSnapshot>> {
        let source = self
            .source(data_source_id)
            .ok_or_else(|| EngineError::not_found(data_source_id))?;

        let snapshot = self.schemas.refresh(&source).await?;
        self.generations.bump(data_source_id);
        self.invalidate_caches(data_source_id).await;
        Ok(snapshot)
    }

    pub fn data_sources(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sources.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn schema(&self, data_source_id: &str) -> Result<Arc<SchemaSnapshot>> {
        self.schemas.get(data_source_id)
    }

    pub async fn pool_status(&self, data_source_id: &str) -> Option<PoolStatus> {
        self.pools.status(data_source_id).await
    }

    /// Statements issued to pools since startup
    pub fn execution_count(&self) -> u64 {
        self.pools.execution_count()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.snapshot()
    }

    /// Drop expired result and plan entries; returns how many were removed
    pub async fn cleanup_expired(&self) -> usize {
        self.results.cleanup_expired().await + self.plans.cleanup_expired().await
    }

    /// Answer one question. Never returns an error: every failure is reported
    /// as [`AnalyzeResult::Failed`] with a user-safe message.
    pub async fn analyze_and_execute(&self, request: QueryRequest) -> AnalyzeResult {
        StatCounters::bump(&self.stats.requests);
        let request_id = request.request_id.clone();
        transition(&request_id, RequestState::Received);

        let result = match self.lookup(&request.data_source_id) {
            Some((source, snapshot, generation)) => {
                let deadline = self.request_deadline(&source);
                let work = self.process(&request, &source, &snapshot, generation);
                match tokio::time::timeout(deadline, work).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(
                            "[{}] request exceeded its {}ms deadline",
                            request_id,
                            deadline.as_millis()
                        );
                        Err(FailureKind::ExecutionTimeout)
                    }
                }
            }
            None => {
                warn!(
                    "[{}] unknown data source {}",
                    request_id, request.data_source_id
                );
                Err(FailureKind::UnknownDataSource)
            }
        };

        match result {
            Ok(outcome) => {
                StatCounters::bump(&self.stats.succeeded);
                transition(&request_id, RequestState::Done);
                AnalyzeResult::Success(outcome)
            }
            Err(kind) => {
                StatCounters::bump(&self.stats.failed);
                transition(&request_id, RequestState::Failed(kind));
                AnalyzeResult::Failed(QueryFailure::new(request_id, kind))
            }
        }
    }

    fn source(&self, data_source_id: &str) -> Option<Arc<DataSource>> {
        self.sources.read().get(data_source_id).cloned()
    }

    /// Source, snapshot and the registration generation they belong to
    fn lookup(
        &self,
        data_source_id: &str,
    ) -> Option<(Arc<DataSource>, Arc<SchemaSnapshot>, u64)> {
        let generation = self.generations.current(data_source_id)?;
        let source = self.source(data_source_id)?;
        let snapshot = self.schemas.get(data_source_id).ok()?;
        Some((source, snapshot, generation))
    }

    /// Two generation attempts, one execution, plus the configured margin
    fn request_deadline(&self, source: &DataSource) -> Duration {
        self.config.generation.timeout() * 2
            + source.execution_timeout()
            + self.config.request.deadline_margin()
    }

    async fn invalidate_caches(&self, data_source_id: &str) -> (usize, usize) {
        let results = self.results.invalidate(data_source_id).await;
        let plans = self.plans.invalidate(data_source_id).await;
        (results, plans)
    }

    async fn process(
        &self,
        request: &QueryRequest,
        source: &Arc<DataSource>,
        snapshot: &SchemaSnapshot,
        generation: u64,
    ) -> std::result::Result<QueryOutcome, FailureKind> {
        let request_id = request.request_id.as_str();
        transition(request_id, RequestState::SchemaReady);

        let mut timings = StageTimings::default();
        let key = plan_key(&source.id, &request.question, &request.prior_context);

        let validated = match self.planned(&key, source, snapshot, &mut timings).await {
            Some(validated) => {
                StatCounters::bump(&self.stats.plan_hits);
                debug!("[{}] reusing cached plan", request_id);
                validated
            }
            None => {
                let validated = self
                    .generate_validated(request, source, snapshot, &mut timings)
                    .await?;
                self.plans
                    .put(
                        key.clone(),
                        &source.id,
                        validated.sql.clone(),
                        self.config.cache.ttl(CacheCategory::Schema),
                    )
                    .await;
                if !self.generations.is_current(&source.id, generation) {
                    debug!("[{}] source changed during generation, plan dropped", request_id);
                    self.plans.remove(&key).await;
                }
                validated
            }
        };
        transition(request_id, RequestState::Validated);
        debug!(
            "[{}] query {} limit {} (injected: {}, clamped: {})",
            request_id,
            log_digest(&validated.sql),
            validated.effective_limit,
            validated.limit_injected,
            validated.limit_clamped
        );

        let fp = fingerprint(&source.id, &validated.sql, &[]);
        transition(request_id, RequestState::CacheCheck);
        if let Some((cached, stored)) = self.results.get_stamped(&fp).await {
            debug!("[{}] result cached at {}", request_id, stored.to_rfc3339());
            transition(request_id, RequestState::CacheHit);
            StatCounters::bump(&self.stats.cache_hits);
            return Ok(outcome(request_id, &cached, true, timings));
        }

        transition(request_id, RequestState::Executing);
        let job = ExecutionJob {
            request_id: request_id.to_string(),
            source: source.clone(),
            validated,
            fingerprint: fp.clone(),
            pools: self.pools.clone(),
            results: self.results.clone(),
            generations: self.generations.clone(),
            generation,
            policy: self.policy.clone(),
            ttl: self.config.cache.ttl(CacheCategory::Result),
        };

        // Requests under a newer registration never join an older execution
        let flight = format!("{}@{}", fp, generation);
        let started = Instant::now();
        let (result, leader) = self.flights.run(flight, move || job.run().boxed()).await;
        timings.execution_ms = started.elapsed().as_millis() as u64;
        if !leader {
            debug!("[{}] shared an in-flight execution", request_id);
        }

        let result = result?;
        Ok(outcome(request_id, &result, false, timings))
    }

    /// Cached plan for this question, re-validated against the current snapshot
    async fn planned(
        &self,
        key: &str,
        source: &DataSource,
        snapshot: &SchemaSnapshot,
        timings: &mut StageTimings,
    ) -> Option<ValidatedQuery> {
        let sql = self.plans.get(key).await?;

        let started = Instant::now();
        let verdict = self.validator.validate_sql(&sql, source, snapshot);
        timings.validation_ms += started.elapsed().as_millis() as u64;

        match verdict {
            ValidationVerdict::Pass(validated) => Some(validated),
            ValidationVerdict::Reject { reason, .. } => {
                debug!("Cached plan for {} no longer valid ({})", source.id, reason);
                self.plans.remove(key).await;
                None
            }
        }
    }

    /// Generate and validate, restating the question once on failure
    async fn generate_validated(
        &self,
        request: &QueryRequest,
        source: &DataSource,
        snapshot: &SchemaSnapshot,
        timings: &mut StageTimings,
    ) -> std::result::Result<ValidatedQuery, FailureKind> {
        let request_id = request.request_id.as_str();
        let mut restatement: Option<&'static str> = None;

        loop {
            let attempt = match restatement {
                None => Attempt::First,
                Some(reason) => Attempt::Restated { reason },
            };
            let last = restatement.is_some();

            let started = Instant::now();
            let generated = self
                .generator
                .generate(
                    &request.question,
                    snapshot,
                    source,
                    &request.prior_context,
                    attempt,
                )
                .await;
            timings.generation_ms += started.elapsed().as_millis() as u64;

            let candidate = match generated {
                Ok(candidate) => candidate,
                Err(e) => {
                    warn!(
                        "[{}] generation attempt {} failed: {}",
                        request_id,
                        attempt.number(),
                        e
                    );
                    if last || !e.is_retryable() {
                        return Err(FailureKind::GenerationFailed);
                    }
                    StatCounters::bump(&self.stats.generation_retries);
                    restatement = Some(generation_restatement(&e));
                    continue;
                }
            };
            transition(request_id, RequestState::Generated);

            let started = Instant::now();
            let verdict = self.validator.validate(&candidate, source, snapshot);
            timings.validation_ms += started.elapsed().as_millis() as u64;

            match verdict {
                ValidationVerdict::Pass(validated) => return Ok(validated),
                ValidationVerdict::Reject { reason, detail } => {
                    warn!(
                        "[{}] candidate {} rejected: {}",
                        request_id,
                        log_digest(&candidate.sql),
                        reason
                    );
                    debug!("[{}] rejection detail: {}", request_id, detail);
                    if last {
                        return Err(FailureKind::ValidationRejected(reason));
                    }
                    StatCounters::bump(&self.stats.generation_retries);
                    restatement = Some(rejection_restatement(reason));
                }
            }
        }
    }
}

fn generation_restatement(err: &GenerationError) -> &'static str {
    match err {
        GenerationError::MalformedOutput(_) => "the response was not a single JSON object",
        GenerationError::EmptyQuery => "the response contained no query",
        GenerationError::Timeout(_) => "the response took too long; answer concisely",
        _ => "the response could not be used",
    }
}

fn rejection_restatement(reason: RejectReason) -> &'static str {
    match reason {
        RejectReason::Malformed => "the query was not valid SQL for this dialect",
        RejectReason::ForbiddenVerb => "the query was not a single read-only SELECT",
        RejectReason::UnknownObject => {
            "the query referenced tables outside the listed schema"
        }
        RejectReason::TooComplex => "the query nested subqueries too deeply",
    }
}

fn outcome(
    request_id: &str,
    result: &ExecutionResult,
    cache_hit: bool,
    timings: StageTimings,
) -> QueryOutcome {
    QueryOutcome {
        request_id: request_id.to_string(),
        columns: result.columns.clone(),
        rows: result.rows.clone(),
        row_count: result.row_count,
        truncated: result.truncated,
        cache_hit,
        timings,
    }
}

/// One execution, shared by every request with the same fingerprint
struct ExecutionJob {
    request_id: String,
    source: Arc<DataSource>,
    validated: ValidatedQuery,
    fingerprint: String,
    pools: Arc<PoolManager>,
    results: Arc<ResultCache>,
    generations: Arc<Generations>,
    generation: u64,
    policy: Arc<dyn ColumnSensitivityPolicy>,
    ttl: Duration,
}

impl ExecutionJob {
    async fn run(self) -> ExecutionOutcome {
        let source_id = self.source.id.as_str();

        let mut conn = self.pools.acquire(source_id).await.map_err(|e| {
            warn!("[{}] acquire failed: {}", self.request_id, e);
            FailureKind::from(&e)
        })?;

        let started = Instant::now();
        let raw = conn
            .execute(&self.validated.sql, &[], self.source.execution_timeout())
            .await
            .map_err(|e| {
                warn!("[{}] execution failed: {}", self.request_id, e);
                FailureKind::from(&e)
            })?;
        let execution_time_ms = started.elapsed().as_millis() as u64;
        drop(conn);

        transition(&self.request_id, RequestState::Masking);

        let mut rows = raw.rows;
        let mut truncated = false;
        if rows.len() > self.source.max_rows {
            rows.truncate(self.source.max_rows);
            truncated = true;
        }
        if self.validated.limit_enforced() && rows.len() as u64 >= self.validated.effective_limit {
            truncated = true;
        }

        let kinds = resolve_policy(
            source_id,
            &raw.columns,
            &self.validated,
            self.policy.as_ref(),
        );
        let rows = mask(&raw.columns, rows, &kinds);

        let result = Arc::new(ExecutionResult {
            row_count: rows.len(),
            columns: raw.columns,
            rows,
            execution_time_ms,
            truncated,
        });

        self.results
            .put(self.fingerprint.clone(), source_id, result.clone(), self.ttl)
            .await;
        // Re-checked after the write so an invalidation racing with it
        // cannot leave the entry behind
        if !self.generations.is_current(source_id, self.generation) {
            debug!(
                "[{}] {} changed during execution, result not cached",
                self.request_id, source_id
            );
            self.results.remove(&self.fingerprint).await;
        }

        info!(
            "Executed {} on {}: {} rows in {}ms{}",
            log_digest(&self.validated.sql),
            source_id,
            result.row_count,
            execution_time_ms,
            if truncated { " (truncated)" } else { "" }
        );

        Ok(result)
    }
}
