//! Static safety checks for generated queries
//!
//! Candidates are parsed with the dialect of the target engine and walked
//! once. Checks run in a fixed order and the first failing one decides the
//! verdict:
//!
//! 1. the text must parse into exactly one statement (`Malformed`)
//! 2. that statement must be a plain read-only query calling only allowlisted,
//!    unqualified functions (`ForbiddenVerb`)
//! 3. every relation must resolve to an allowed schema of the snapshot (`UnknownObject`)
//! 4. subqueries may not nest deeper than the configured limit (`TooComplex`)
//!
//! Passing queries get a row limit injected or clamped and every table spelled
//! as a quoted `schema.table`. The rewritten text is what gets executed.

use crate::config::ValidationConfig;
use crate::lineage::Tracer;
use crate::types::CandidateQuery;
use datagenie_query::{DataSource, EngineKind, SchemaSnapshot};
use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    Expr, Ident, ObjectName, Query, SetExpr, Statement, TableFactor, Value, Visit, VisitMut,
    Visitor, VisitorMut,
};
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::ControlFlow;

/// Read-only scalar, aggregate and window functions every engine understands
const COMMON_FUNCTIONS: &[&str] = &[
    "count", "sum", "avg", "min", "max", "coalesce", "nullif", "abs", "round", "ceil",
    "ceiling", "floor", "mod", "power", "sqrt", "exp", "ln", "log", "log10", "sign",
    "greatest", "least", "lower", "upper", "length", "char_length", "character_length",
    "substr", "substring", "trim", "ltrim", "rtrim", "replace", "concat", "concat_ws", "left",
    "right", "lpad", "rpad", "reverse", "row_number", "rank", "dense_rank", "percent_rank",
    "cume_dist", "ntile", "lag", "lead", "first_value", "last_value", "nth_value",
    "current_date", "current_time", "current_timestamp", "localtime", "localtimestamp",
    "stddev", "stddev_pop", "stddev_samp", "variance", "var_pop", "var_samp",
];

const POSTGRES_FUNCTIONS: &[&str] = &[
    "now", "date_trunc", "date_part", "date_bin", "age", "to_char", "to_date",
    "to_timestamp", "to_number", "make_date", "make_timestamp", "string_agg", "array_agg",
    "bool_and", "bool_or", "every", "percentile_cont", "percentile_disc", "mode", "initcap",
    "split_part", "strpos", "btrim", "repeat", "regexp_replace", "trunc", "octet_length",
    "json_agg", "jsonb_agg", "json_build_object", "jsonb_build_object", "array_length",
    "cardinality", "corr", "covar_pop", "covar_samp",
];

const SQLITE_FUNCTIONS: &[&str] = &[
    "strftime", "date", "time", "datetime", "julianday", "unixepoch", "group_concat",
    "total", "ifnull", "iif", "instr", "printf", "format", "json_extract",
];

const MYSQL_FUNCTIONS: &[&str] = &[
    "now", "date_format", "year", "month", "day", "dayofmonth", "dayofweek", "dayofyear",
    "week", "weekofyear", "quarter", "hour", "minute", "second", "date", "datediff",
    "date_add", "date_sub", "timestampdiff", "str_to_date", "last_day", "group_concat",
    "ifnull", "if", "instr", "locate", "truncate", "curdate", "curtime", "unix_timestamp",
    "from_unixtime", "json_extract",
];

/// Whether a bare function name may appear in a query against `engine`
pub fn is_allowed_function(engine: EngineKind, name: &str) -> bool {
    let name = name.to_lowercase();
    let dialect = match engine {
        EngineKind::Postgres => POSTGRES_FUNCTIONS,
        EngineKind::MySql => MYSQL_FUNCTIONS,
        EngineKind::Sqlite => SQLITE_FUNCTIONS,
    };
    COMMON_FUNCTIONS.contains(&name.as_str()) || dialect.contains(&name.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    Malformed,
    ForbiddenVerb,
    UnknownObject,
    TooComplex,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Malformed => write!(f, "MALFORMED"),
            RejectReason::ForbiddenVerb => write!(f, "FORBIDDEN_VERB"),
            RejectReason::UnknownObject => write!(f, "UNKNOWN_OBJECT"),
            RejectReason::TooComplex => write!(f, "TOO_COMPLEX"),
        }
    }
}

/// A relation resolved against the schema snapshot, in its captured spelling
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

/// A concrete column of a referenced table
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceColumn {
    pub schema: String,
    pub table: String,
    pub column: String,
}

/// One output column of a validated query and the source columns it reads
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedColumn {
    /// Lower-cased output name, when the projection gives one
    pub name: Option<String>,
    pub sources: Vec<SourceColumn>,
    /// False when some input of the column could not be traced to a table
    pub resolved: bool,
}

impl ProjectedColumn {
    pub(crate) fn absorb(&mut self, other: &ProjectedColumn) {
        for source in &other.sources {
            if !self.sources.contains(source) {
                self.sources.push(source.clone());
            }
        }
        self.resolved &= other.resolved;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedQuery {
    /// Canonical text that will be executed
    pub sql: String,
    /// Every relation the query reads, deduplicated
    pub tables: Vec<TableRef>,
    pub limit_injected: bool,
    pub limit_clamped: bool,
    pub effective_limit: u64,
    /// Lower-cased output column name to the source columns it is derived
    /// from; only columns whose lineage is fully resolved
    pub aliases: HashMap<String, Vec<SourceColumn>>,
    /// Output columns in order; `None` when their number cannot be determined
    pub projection: Option<Vec<ProjectedColumn>>,
    /// All columns of all referenced tables
    pub referenced_columns: Vec<SourceColumn>,
}

impl ValidatedQuery {
    /// True when the effective limit came from the validator rather than the query
    pub fn limit_enforced(&self) -> bool {
        self.limit_injected || self.limit_clamped
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationVerdict {
    Pass(ValidatedQuery),
    Reject { reason: RejectReason, detail: String },
}

impl ValidationVerdict {
    fn reject(reason: RejectReason, detail: impl Into<String>) -> Self {
        ValidationVerdict::Reject {
            reason,
            detail: detail.into(),
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, ValidationVerdict::Pass(_))
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            ValidationVerdict::Pass(_) => None,
            ValidationVerdict::Reject { reason, .. } => Some(*reason),
        }
    }
}

/// Deterministic, I/O-free query validator
#[derive(Debug, Clone)]
pub struct QueryValidator {
    config: ValidationConfig,
}

impl QueryValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Row cap applied to queries against this source
    pub fn row_cap(&self, source: &DataSource) -> u64 {
        (source.max_rows as u64).min(self.config.default_row_cap)
    }

    pub fn max_subquery_depth(&self) -> usize {
        self.config.max_subquery_depth
    }

    pub fn validate(
        &self,
        candidate: &CandidateQuery,
        source: &DataSource,
        snapshot: &SchemaSnapshot,
    ) -> ValidationVerdict {
        self.validate_sql(&candidate.sql, source, snapshot)
    }

    pub fn validate_sql(
        &self,
        sql: &str,
        source: &DataSource,
        snapshot: &SchemaSnapshot,
    ) -> ValidationVerdict {
        if sql.trim().is_empty() {
            return ValidationVerdict::reject(RejectReason::Malformed, "empty query");
        }

        let dialect = dialect_for(source.engine);
        let mut statements = match Parser::parse_sql(dialect.as_ref(), sql) {
            Ok(statements) => statements,
            Err(e) => return ValidationVerdict::reject(RejectReason::Malformed, e.to_string()),
        };

        match statements.len() {
            0 => return ValidationVerdict::reject(RejectReason::Malformed, "no statement"),
            1 => {}
            n => {
                return ValidationVerdict::reject(
                    RejectReason::ForbiddenVerb,
                    format!("{} statements", n),
                )
            }
        }

        let mut statement = statements.remove(0);
        let query: &mut Query = match &mut statement {
            Statement::Query(query) => &mut **query,
            other => {
                return ValidationVerdict::reject(
                    RejectReason::ForbiddenVerb,
                    statement_kind(other),
                )
            }
        };

        let mut ctes = CteCollector::default();
        let _ = Visit::visit(&*query, &mut ctes);

        let relations = Relations {
            source,
            snapshot,
            cte_names: ctes.names,
        };
        let mut inspector = Inspector {
            relations: &relations,
            open_queries: 0,
            max_depth: 0,
            forbidden: None,
            unknown: None,
            tables: Vec::new(),
        };
        let _ = Visit::visit(&*query, &mut inspector);

        if let Some(detail) = inspector.forbidden {
            return ValidationVerdict::reject(RejectReason::ForbiddenVerb, detail);
        }
        if let Some(detail) = inspector.unknown {
            return ValidationVerdict::reject(RejectReason::UnknownObject, detail);
        }
        if inspector.max_depth > self.config.max_subquery_depth {
            return ValidationVerdict::reject(
                RejectReason::TooComplex,
                format!(
                    "subquery depth {} exceeds {}",
                    inspector.max_depth, self.config.max_subquery_depth
                ),
            );
        }
        let tables = inspector.tables;

        let cap = self.row_cap(source);
        let (effective_limit, limit_injected, limit_clamped) = apply_limit(query, cap);

        let resolve = |name: &ObjectName| match relations.resolve(name) {
            Resolution::Table(table) => Some(table),
            _ => None,
        };
        let projection = Tracer::new(snapshot, &resolve).trace(query);
        let aliases = resolved_aliases(projection.as_deref());

        // Executed text names every table by schema, never through the
        // engine's search path
        let _ = VisitMut::visit(
            &mut *query,
            &mut Qualifier {
                relations: &relations,
                quote: quote_style(source.engine),
            },
        );

        ValidationVerdict::Pass(ValidatedQuery {
            sql: statement.to_string(),
            referenced_columns: referenced_columns(&tables, snapshot),
            tables,
            limit_injected,
            limit_clamped,
            effective_limit,
            aliases,
            projection,
        })
    }
}

pub fn dialect_for(engine: EngineKind) -> Box<dyn Dialect> {
    match engine {
        EngineKind::Postgres => Box::new(PostgreSqlDialect {}),
        EngineKind::MySql => Box::new(MySqlDialect {}),
        EngineKind::Sqlite => Box::new(SQLiteDialect {}),
    }
}

fn statement_kind(statement: &Statement) -> String {
    let text = statement.to_string();
    let verb = text.split_whitespace().next().unwrap_or("statement");
    format!("{} statement", verb.to_uppercase())
}

/// Names of every CTE defined anywhere in the statement
#[derive(Default)]
struct CteCollector {
    names: HashSet<String>,
}

impl Visitor for CteCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.names.insert(cte.alias.name.value.to_lowercase());
            }
        }
        ControlFlow::Continue(())
    }
}

enum Resolution {
    Table(TableRef),
    Cte,
    Unknown(String),
}

/// Resolves relation names against the snapshot and the source's allowed schemas
struct Relations<'a> {
    source: &'a DataSource,
    snapshot: &'a SchemaSnapshot,
    cte_names: HashSet<String>,
}

impl Relations<'_> {
    fn resolve(&self, name: &ObjectName) -> Resolution {
        let parts: Vec<&str> = name.0.iter().map(|ident| ident.value.as_str()).collect();

        match parts.as_slice() {
            [] => Resolution::Unknown("empty relation name".to_string()),
            [table] => {
                if self.cte_names.contains(&table.to_lowercase()) {
                    return Resolution::Cte;
                }

                let candidates: Vec<&str> = self
                    .snapshot
                    .schemas_containing(table)
                    .into_iter()
                    .filter(|schema| self.source.allows_schema(schema))
                    .collect();

                match candidates.as_slice() {
                    [schema] => self.lookup(schema, table),
                    [] => Resolution::Unknown(format!("unknown table {}", table)),
                    _ => Resolution::Unknown(format!(
                        "ambiguous table {} (found in {})",
                        table,
                        candidates.join(", ")
                    )),
                }
            }
            // Catalog-qualified names resolve on their last two parts
            [.., schema, table] => {
                if !self.source.allows_schema(schema) {
                    return Resolution::Unknown(format!("schema {} is not allowed", schema));
                }
                self.lookup(schema, table)
            }
        }
    }

    fn lookup(&self, schema: &str, table: &str) -> Resolution {
        match self.snapshot.canonical_name(schema, table) {
            Some((schema, table)) => Resolution::Table(TableRef { schema, table }),
            None => Resolution::Unknown(format!("unknown table {}.{}", schema, table)),
        }
    }
}

struct Inspector<'a> {
    relations: &'a Relations<'a>,
    open_queries: usize,
    max_depth: usize,
    forbidden: Option<String>,
    unknown: Option<String>,
    tables: Vec<TableRef>,
}

impl Inspector<'_> {
    fn forbid(&mut self, detail: impl Into<String>) {
        if self.forbidden.is_none() {
            self.forbidden = Some(detail.into());
        }
    }

    fn mark_unknown(&mut self, detail: impl Into<String>) {
        if self.unknown.is_none() {
            self.unknown = Some(detail.into());
        }
    }
}

impl Visitor for Inspector<'_> {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        self.max_depth = self.max_depth.max(self.open_queries);
        self.open_queries += 1;

        if !query.locks.is_empty() {
            self.forbid("row locking clause");
        }
        if let Some(detail) = modifying_body(&query.body) {
            self.forbid(detail);
        }

        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.open_queries = self.open_queries.saturating_sub(1);
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<Self::Break> {
        match table_factor {
            TableFactor::Table { name, args, .. } => {
                if args.is_some() {
                    self.mark_unknown(format!("table function {}", name));
                    return ControlFlow::Continue(());
                }

                match self.relations.resolve(name) {
                    Resolution::Table(table) => {
                        if !self.tables.contains(&table) {
                            self.tables.push(table);
                        }
                    }
                    Resolution::Cte => {}
                    Resolution::Unknown(detail) => self.mark_unknown(detail),
                }
            }
            TableFactor::TableFunction { .. } | TableFactor::UNNEST { .. } => {
                self.mark_unknown("table function");
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if let Expr::Function(function) = expr {
            match function.name.0.as_slice() {
                [name] => {
                    if !is_allowed_function(self.relations.source.engine, &name.value) {
                        self.forbid(format!("function {}", name.value.to_lowercase()));
                    }
                }
                _ => self.forbid(format!("qualified function {}", function.name)),
            }
        }
        ControlFlow::Continue(())
    }
}

/// Rewrites every resolved relation to its quoted `schema.table` spelling
struct Qualifier<'a> {
    relations: &'a Relations<'a>,
    quote: char,
}

impl VisitorMut for Qualifier<'_> {
    type Break = ();

    fn pre_visit_relation(&mut self, relation: &mut ObjectName) -> ControlFlow<Self::Break> {
        if let Resolution::Table(table) = self.relations.resolve(relation) {
            *relation = ObjectName(vec![
                Ident::with_quote(self.quote, table.schema),
                Ident::with_quote(self.quote, table.table),
            ]);
        }
        ControlFlow::Continue(())
    }
}

fn quote_style(engine: EngineKind) -> char {
    match engine {
        EngineKind::MySql => '`',
        EngineKind::Postgres | EngineKind::Sqlite => '"',
    }
}

/// Describe the first data-modifying construct in a query body, if any
fn modifying_body(body: &SetExpr) -> Option<String> {
    match body {
        SetExpr::Insert(_) => Some("INSERT in query body".to_string()),
        SetExpr::Update(_) => Some("UPDATE in query body".to_string()),
        SetExpr::Select(select) if select.into.is_some() => Some("SELECT INTO".to_string()),
        SetExpr::SetOperation { left, right, .. } => {
            modifying_body(left).or_else(|| modifying_body(right))
        }
        _ => None,
    }
}

enum ExplicitLimit {
    Absent,
    Literal(u64),
    Other,
}

/// Rewrite the top-level limit so it never exceeds `cap`.
/// Returns (effective limit, injected, clamped).
fn apply_limit(query: &mut Query, cap: u64) -> (u64, bool, bool) {
    let explicit = match (query.limit.take(), query.fetch.take()) {
        (Some(expr), _) => literal_limit(&expr),
        (None, Some(fetch)) if !fetch.percent => match fetch.quantity {
            Some(expr) => literal_limit(&expr),
            None => ExplicitLimit::Literal(1),
        },
        (None, Some(_)) => ExplicitLimit::Other,
        (None, None) => ExplicitLimit::Absent,
    };

    let (effective, injected, clamped) = match explicit {
        ExplicitLimit::Absent => (cap, true, false),
        ExplicitLimit::Literal(n) if n <= cap => (n, false, false),
        ExplicitLimit::Literal(_) | ExplicitLimit::Other => (cap, false, true),
    };

    query.limit = Some(Expr::Value(Value::Number(effective.to_string(), false)));
    (effective, injected, clamped)
}

fn literal_limit(expr: &Expr) -> ExplicitLimit {
    match expr {
        Expr::Value(Value::Number(n, _)) => n
            .parse::<u64>()
            .map(ExplicitLimit::Literal)
            .unwrap_or(ExplicitLimit::Other),
        _ => ExplicitLimit::Other,
    }
}

fn referenced_columns(tables: &[TableRef], snapshot: &SchemaSnapshot) -> Vec<SourceColumn> {
    tables
        .iter()
        .flat_map(|table| {
            snapshot
                .table(&table.schema, &table.table)
                .unwrap_or_default()
                .iter()
                .map(move |column| SourceColumn {
                    schema: table.schema.clone(),
                    table: table.table.clone(),
                    column: column.name.clone(),
                })
        })
        .collect()
}

fn resolved_aliases(projection: Option<&[ProjectedColumn]>) -> HashMap<String, Vec<SourceColumn>> {
    let mut aliases: HashMap<String, Vec<SourceColumn>> = HashMap::new();
    for column in projection.unwrap_or_default() {
        if let (Some(name), true) = (&column.name, column.resolved) {
            let sources = aliases.entry(name.clone()).or_default();
            for source in &column.sources {
                if !sources.contains(source) {
                    sources.push(source.clone());
                }
            }
        }
    }
    aliases
}

#[cfg(test)]
mod tests {
    use super::*;
    use datagenie_query::{ColumnMeta, ConnectionDescriptor, FieldType};
    use std::collections::BTreeSet;

    fn meta(schema: &str, table: &str, column: &str) -> ColumnMeta {
        ColumnMeta {
            schema: schema.to_string(),
            table: table.to_string(),
            column: column.to_string(),
            declared_type: "text".to_string(),
            field_type: FieldType::String,
            nullable: true,
            is_primary_key: false,
        }
    }

    fn fixture(allowed: &[&str]) -> (DataSource, SchemaSnapshot) {
        let source = DataSource::new(
            "sales",
            EngineKind::Postgres,
            ConnectionDescriptor::new().with_host("localhost"),
        )
        .with_allowed_schemas(allowed.iter().copied());

        let all: BTreeSet<String> = ["public", "finance", "crm"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let snapshot = SchemaSnapshot::from_columns(
            "sales",
            vec![
                meta("public", "orders", "order_date"),
                meta("public", "orders", "amount"),
                meta("public", "orders", "customer_id"),
                meta("public", "customers", "id"),
                meta("public", "customers", "email"),
                meta("public", "customers", "name"),
                meta("finance", "orders", "amount"),
                meta("crm", "customers", "id"),
            ],
            &all,
        );
        (source, snapshot)
    }

    fn validator() -> QueryValidator {
        QueryValidator::new(ValidationConfig::default())
    }

    fn check(sql: &str) -> ValidationVerdict {
        let (source, snapshot) = fixture(&["public"]);
        validator().validate_sql(sql, &source, &snapshot)
    }

    fn pass(sql: &str) -> ValidatedQuery {
        match check(sql) {
            ValidationVerdict::Pass(validated) => validated,
            other => panic!("expected pass for {}, got {:?}", sql, other),
        }
    }

    #[test]
    fn test_monthly_revenue_passes_with_injected_limit() {
        let validated = pass(
            "SELECT DATE_TRUNC('month', order_date) AS month, SUM(amount) AS revenue \
             FROM orders GROUP BY 1 ORDER BY 1",
        );
        assert!(validated.limit_injected);
        assert!(!validated.limit_clamped);
        assert_eq!(validated.effective_limit, 1000);
        assert!(validated.sql.ends_with("LIMIT 1000"));
        assert_eq!(
            validated.tables,
            vec![TableRef {
                schema: "public".into(),
                table: "orders".into()
            }]
        );
    }

    #[test]
    fn test_disallowed_schema_is_unknown_object() {
        assert_eq!(
            check("SELECT amount FROM finance.orders").reject_reason(),
            Some(RejectReason::UnknownObject)
        );
        assert_eq!(
            check("SELECT * FROM missing_table").reject_reason(),
            Some(RejectReason::UnknownObject)
        );
    }

    #[test]
    fn test_write_statements_are_forbidden() {
        for sql in [
            "DELETE FROM orders",
            "UPDATE orders SET amount = 0",
            "INSERT INTO orders (amount) VALUES (1)",
            "DROP TABLE orders",
            "SELECT * INTO orders_copy FROM orders",
            "SELECT * FROM orders FOR UPDATE",
            "SELECT pg_sleep(10)",
        ] {
            assert_eq!(
                check(sql).reject_reason(),
                Some(RejectReason::ForbiddenVerb),
                "{}",
                sql
            );
        }
    }

    #[test]
    fn test_multiple_statements_are_forbidden() {
        assert_eq!(
            check("SELECT 1; SELECT 2").reject_reason(),
            Some(RejectReason::ForbiddenVerb)
        );
    }

    #[test]
    fn test_malformed() {
        assert_eq!(check("").reject_reason(), Some(RejectReason::Malformed));
        assert_eq!(check("   ").reject_reason(), Some(RejectReason::Malformed));
        assert_eq!(
            check("SELEC amount FROM orders").reject_reason(),
            Some(RejectReason::Malformed)
        );
    }

    #[test]
    fn test_first_failing_check_wins() {
        // Forbidden verb outranks the unknown table
        assert_eq!(
            check("DELETE FROM nowhere").reject_reason(),
            Some(RejectReason::ForbiddenVerb)
        );
        // Unknown object outranks excessive nesting
        assert_eq!(
            check(
                "SELECT * FROM (SELECT * FROM (SELECT * FROM (SELECT * FROM \
                 (SELECT * FROM nowhere) a) b) c) d"
            )
            .reject_reason(),
            Some(RejectReason::UnknownObject)
        );
    }

    #[test]
    fn test_subquery_depth() {
        // Depth 3 is allowed
        pass("SELECT * FROM (SELECT * FROM (SELECT * FROM (SELECT * FROM orders) a) b) c");

        assert_eq!(
            check(
                "SELECT * FROM (SELECT * FROM (SELECT * FROM (SELECT * FROM \
                 (SELECT * FROM orders) a) b) c) d"
            )
            .reject_reason(),
            Some(RejectReason::TooComplex)
        );
    }

    #[test]
    fn test_ctes_are_not_relations() {
        let validated =
            pass("WITH recent AS (SELECT * FROM orders) SELECT amount FROM recent");
        assert_eq!(validated.tables.len(), 1);
        assert_eq!(validated.tables[0].table, "orders");
    }

    #[test]
    fn test_ambiguous_unqualified_table() {
        let (source, snapshot) = fixture(&["public", "crm"]);
        let verdict = validator().validate_sql("SELECT id FROM customers", &source, &snapshot);
        assert_eq!(verdict.reject_reason(), Some(RejectReason::UnknownObject));

        let verdict =
            validator().validate_sql("SELECT id FROM crm.customers", &source, &snapshot);
        assert!(verdict.is_pass());
    }

    #[test]
    fn test_table_functions_are_unknown() {
        assert_eq!(
            check("SELECT * FROM generate_series(1, 10)").reject_reason(),
            Some(RejectReason::UnknownObject)
        );
    }

    #[test]
    fn test_explicit_limits() {
        let validated = pass("SELECT amount FROM orders LIMIT 10");
        assert_eq!(validated.effective_limit, 10);
        assert!(!validated.limit_enforced());

        let validated = pass("SELECT amount FROM orders LIMIT 50000");
        assert_eq!(validated.effective_limit, 1000);
        assert!(validated.limit_clamped);
        assert!(validated.sql.ends_with("LIMIT 1000"));
    }

    #[test]
    fn test_row_cap_uses_source_max_rows() {
        let (source, snapshot) = fixture(&["public"]);
        let source = source.with_max_rows(25);
        match validator().validate_sql("SELECT amount FROM orders", &source, &snapshot) {
            ValidationVerdict::Pass(validated) => {
                assert_eq!(validated.effective_limit, 25);
                assert!(validated.sql.ends_with("LIMIT 25"));
            }
            other => panic!("unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn test_alias_map_tracks_source_columns() {
        let validated = pass(
            "SELECT c.email AS contact, UPPER(name) AS display, o.amount \
             FROM customers c JOIN orders o ON o.customer_id = c.id",
        );

        let contact = &validated.aliases["contact"];
        assert_eq!(contact.len(), 1);
        assert_eq!(contact[0].table, "customers");
        assert_eq!(contact[0].column, "email");

        assert_eq!(validated.aliases["display"][0].column, "name");
        assert_eq!(validated.aliases["amount"][0].table, "orders");

        let projection = validated.projection.unwrap();
        assert_eq!(projection.len(), 3);
        assert_eq!(projection[1].sources[0].column, "name");
        assert!(projection.iter().all(|column| column.resolved));
    }

    #[test]
    fn test_wildcard_expands_to_table_columns() {
        let validated = pass("SELECT * FROM customers");
        let projection = validated.projection.unwrap();
        assert_eq!(projection.len(), 3);
        assert_eq!(projection[1].sources[0].column, "email");
        assert_eq!(validated.referenced_columns.len(), 3);
    }

    #[test]
    fn test_alias_inside_derived_table_keeps_its_source() {
        let validated = pass("SELECT e FROM (SELECT email AS e FROM public.customers) t");
        assert_eq!(validated.aliases["e"][0].column, "email");

        let validated = pass("SELECT * FROM (SELECT email AS e FROM customers) t");
        let projection = validated.projection.unwrap();
        assert_eq!(projection[0].sources[0].column, "email");
    }

    #[test]
    fn test_functions_outside_the_allowlist_are_forbidden() {
        for sql in [
            "SELECT query_to_xml('select * from finance.orders', true, true, '')",
            "SELECT table_to_xml('finance.orders', true, true, '')",
            "SELECT schema_to_xml('finance', true, true, '')",
            "SELECT database_to_xml(true, true, '')",
            "SELECT cursor_to_xml('c', 10, true, true, '')",
            "SELECT xpath('/row', query_to_xml('select 1', true, true, ''))",
            "SELECT pg_catalog.upper(name) FROM customers",
            "SELECT information_schema._pg_truetypid(1, 2)",
            "SELECT current_setting('search_path')",
            "SELECT amount FROM orders WHERE amount > (SELECT pg_read_file('/etc/passwd')::int)",
        ] {
            assert_eq!(
                check(sql).reject_reason(),
                Some(RejectReason::ForbiddenVerb),
                "{}",
                sql
            );
        }
    }

    #[test]
    fn test_allowed_functions_per_engine() {
        pass("SELECT COUNT(*), SUM(amount), DATE_TRUNC('month', order_date) FROM orders");
        pass("SELECT ROW_NUMBER() OVER (ORDER BY amount), COALESCE(amount, 0) FROM orders");

        assert!(is_allowed_function(EngineKind::Sqlite, "strftime"));
        assert!(!is_allowed_function(EngineKind::Postgres, "strftime"));
        assert!(is_allowed_function(EngineKind::MySql, "DATE_FORMAT"));
        assert!(!is_allowed_function(EngineKind::Sqlite, "load_extension"));
    }

    #[test]
    fn test_executed_text_names_tables_by_schema() {
        let (source, snapshot) = fixture(&["finance"]);
        let verdict = validator().validate_sql("SELECT amount FROM orders", &source, &snapshot);
        match verdict {
            ValidationVerdict::Pass(validated) => {
                assert_eq!(
                    validated.sql,
                    "SELECT amount FROM \"finance\".\"orders\" LIMIT 1000"
                );
            }
            other => panic!("unexpected verdict {:?}", other),
        }

        let validated = pass(
            "WITH recent AS (SELECT * FROM orders o) \
             SELECT c.email FROM recent r JOIN customers c ON c.id = r.customer_id",
        );
        assert!(validated.sql.contains("FROM \"public\".\"orders\" AS o"));
        assert!(validated.sql.contains("FROM recent AS r"));
        assert!(validated.sql.contains("JOIN \"public\".\"customers\" AS c"));
    }

    #[test]
    fn test_tables_outside_allowed_schemas_never_pass() {
        let (source, snapshot) = fixture(&["public"]);
        let validator = validator();

        let mut checked = 0;
        for schema in ["finance", "crm", "pg_catalog", "information_schema", "missing"] {
            for table in ["orders", "customers", "pg_user", "tables"] {
                for name in [
                    format!("{}.{}", schema, table),
                    format!("sales.{}.{}", schema, table),
                    format!("\"{}\".\"{}\"", schema, table),
                ] {
                    for sql in [
                        format!("SELECT * FROM {}", name),
                        format!("SELECT o.amount FROM orders o JOIN {} x ON x.id = o.customer_id", name),
                        format!("SELECT amount FROM orders WHERE customer_id IN (SELECT id FROM {})", name),
                        format!("WITH t AS (SELECT * FROM {}) SELECT * FROM t", name),
                        format!("SELECT * FROM (SELECT * FROM {}) d", name),
                    ] {
                        assert_eq!(
                            validator.validate_sql(&sql, &source, &snapshot).reject_reason(),
                            Some(RejectReason::UnknownObject),
                            "{}",
                            sql
                        );
                        checked += 1;
                    }
                }
            }
        }

        // Bare names that only exist outside the allowed schemas
        for table in ["ledger", "pg_user", "accounts", "audit_log"] {
            let sql = format!("SELECT * FROM {}", table);
            assert_eq!(
                validator.validate_sql(&sql, &source, &snapshot).reject_reason(),
                Some(RejectReason::UnknownObject),
                "{}",
                sql
            );
            checked += 1;
        }
        assert_eq!(checked, 304);
    }

    #[test]
    fn test_validation_is_deterministic() {
        let sql = "SELECT amount FROM orders WHERE amount > 10";
        assert_eq!(check(sql), check(sql));
    }
}
