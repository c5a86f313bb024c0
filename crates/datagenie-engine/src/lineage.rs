//! Output-column lineage
//!
//! Traces every projected column of a query back to the source-table columns
//! it reads, through derived tables, CTEs and set operations. A column whose
//! inputs cannot all be traced is left unresolved; masking then treats it as
//! reading every referenced column.

use crate::validator::{ProjectedColumn, SourceColumn, TableRef};
use datagenie_query::SchemaSnapshot;
use sqlparser::ast::{
    Expr, ObjectName, Query, Select, SelectItem, SetExpr, TableAlias, TableFactor,
    TableWithJoins, Visit, Visitor,
};
use std::collections::HashMap;
use std::ops::ControlFlow;

type Columns = Vec<ProjectedColumn>;

/// CTEs in scope: name to traced columns (`None` when opaque)
type Ctes = HashMap<String, Option<Columns>>;

/// One relation of a FROM clause as seen by the projection
struct Relation {
    name: Option<String>,
    columns: Option<Columns>,
}

pub(crate) struct Tracer<'a> {
    snapshot: &'a SchemaSnapshot,
    resolve: &'a dyn Fn(&ObjectName) -> Option<TableRef>,
}

impl<'a> Tracer<'a> {
    pub(crate) fn new(
        snapshot: &'a SchemaSnapshot,
        resolve: &'a dyn Fn(&ObjectName) -> Option<TableRef>,
    ) -> Self {
        Self { snapshot, resolve }
    }

    /// Columns of the query's result, or `None` when their number or order
    /// cannot be determined
    pub(crate) fn trace(&self, query: &Query) -> Option<Columns> {
        self.query(query, &Ctes::new())
    }

    fn query(&self, query: &Query, outer: &Ctes) -> Option<Columns> {
        let mut ctes = outer.clone();
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                let columns = self.query(&cte.query, &ctes);
                ctes.insert(
                    cte.alias.name.value.to_lowercase(),
                    renamed(columns, Some(&cte.alias)),
                );
            }
        }
        self.set_expr(&query.body, &ctes)
    }

    fn set_expr(&self, body: &SetExpr, ctes: &Ctes) -> Option<Columns> {
        match body {
            SetExpr::Select(select) => self.select(select, ctes),
            SetExpr::Query(query) => self.query(query, ctes),
            SetExpr::SetOperation { left, right, .. } => {
                let left = self.set_expr(left, ctes)?;
                let right = self.set_expr(right, ctes)?;
                if left.len() != right.len() {
                    return None;
                }
                Some(
                    left.into_iter()
                        .zip(right)
                        .map(|(mut left, right)| {
                            left.absorb(&right);
                            left
                        })
                        .collect(),
                )
            }
            SetExpr::Values(values) => {
                let width = values.rows.first()?.len();
                Some(
                    (0..width)
                        .map(|idx| ProjectedColumn {
                            name: None,
                            sources: Vec::new(),
                            resolved: values.rows.iter().all(|row| {
                                matches!(row.get(idx), Some(Expr::Value(_)))
                            }),
                        })
                        .collect(),
                )
            }
            _ => None,
        }
    }

    fn select(&self, select: &Select, ctes: &Ctes) -> Option<Columns> {
        let mut scope = Vec::new();
        for from in &select.from {
            self.from(from, ctes, &mut scope);
        }

        let mut columns = Vec::with_capacity(select.projection.len());
        for item in &select.projection {
            match item {
                SelectItem::UnnamedExpr(expr) => {
                    columns.push(self.expr(expr, output_name(expr), &scope))
                }
                SelectItem::ExprWithAlias { expr, alias } => {
                    columns.push(self.expr(expr, Some(alias.value.to_lowercase()), &scope))
                }
                SelectItem::Wildcard(_) => {
                    for relation in &scope {
                        columns.extend(relation.columns.as_ref()?.iter().cloned());
                    }
                }
                SelectItem::QualifiedWildcard(name, _) => {
                    let qualifier = name.0.last()?.value.to_lowercase();
                    let relation = scope
                        .iter()
                        .find(|relation| relation.name.as_deref() == Some(qualifier.as_str()))?;
                    columns.extend(relation.columns.as_ref()?.iter().cloned());
                }
            }
        }
        Some(columns)
    }

    fn from(&self, from: &TableWithJoins, ctes: &Ctes, scope: &mut Vec<Relation>) {
        self.factor(&from.relation, ctes, scope);
        for join in &from.joins {
            self.factor(&join.relation, ctes, scope);
        }
    }

    fn factor(&self, factor: &TableFactor, ctes: &Ctes, scope: &mut Vec<Relation>) {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let cte = match name.0.as_slice() {
                    [single] => ctes.get(&single.value.to_lowercase()).cloned(),
                    _ => None,
                };
                let columns = match cte {
                    Some(columns) => columns,
                    None => (self.resolve)(name).map(|table| self.table_columns(&table)),
                };
                scope.push(Relation {
                    name: exposed_name(alias.as_ref())
                        .or_else(|| name.0.last().map(|ident| ident.value.to_lowercase())),
                    columns: renamed(columns, alias.as_ref()),
                });
            }
            TableFactor::Derived {
                subquery, alias, ..
            } => {
                let columns = self.query(subquery, ctes);
                scope.push(Relation {
                    name: exposed_name(alias.as_ref()),
                    columns: renamed(columns, alias.as_ref()),
                });
            }
            TableFactor::NestedJoin {
                table_with_joins,
                alias: None,
            } => self.from(table_with_joins, ctes, scope),
            TableFactor::NestedJoin {
                table_with_joins,
                alias: Some(alias),
            } => {
                let mut inner = Vec::new();
                self.from(table_with_joins, ctes, &mut inner);
                let columns = inner
                    .into_iter()
                    .map(|relation| relation.columns)
                    .collect::<Option<Vec<_>>>()
                    .map(|parts| parts.concat());
                scope.push(Relation {
                    name: exposed_name(Some(alias)),
                    columns: renamed(columns, Some(alias)),
                });
            }
            _ => scope.push(Relation {
                name: None,
                columns: None,
            }),
        }
    }

    fn table_columns(&self, table: &TableRef) -> Columns {
        self.snapshot
            .table(&table.schema, &table.table)
            .unwrap_or_default()
            .iter()
            .map(|column| ProjectedColumn {
                name: Some(column.name.to_lowercase()),
                sources: vec![SourceColumn {
                    schema: table.schema.clone(),
                    table: table.table.clone(),
                    column: column.name.clone(),
                }],
                resolved: true,
            })
            .collect()
    }

    fn expr(&self, expr: &Expr, name: Option<String>, scope: &[Relation]) -> ProjectedColumn {
        let mut refs = ColumnRefs::default();
        let _ = expr.visit(&mut refs);

        let mut column = ProjectedColumn {
            name,
            sources: Vec::new(),
            resolved: !refs.nested_query,
        };
        for (qualifier, ident) in &refs.columns {
            match lookup(scope, qualifier.as_deref(), ident) {
                Some(found) => found.iter().for_each(|source| column.absorb(source)),
                None => column.resolved = false,
            }
        }
        column
    }
}

/// Columns an identifier may refer to; `None` when it cannot be pinned down
fn lookup<'s>(
    scope: &'s [Relation],
    qualifier: Option<&str>,
    ident: &str,
) -> Option<Vec<&'s ProjectedColumn>> {
    let mut found = Vec::new();
    let mut candidates = 0;

    for relation in scope {
        if let Some(qualifier) = qualifier {
            if relation.name.as_deref() != Some(qualifier) {
                continue;
            }
        }
        candidates += 1;
        let columns = relation.columns.as_ref()?;
        found.extend(
            columns
                .iter()
                .filter(|column| column.name.as_deref() == Some(ident)),
        );
    }

    if candidates == 0 || found.is_empty() {
        None
    } else {
        Some(found)
    }
}

/// Alias column lists rename outputs; names are dropped rather than guessed
fn renamed(columns: Option<Columns>, alias: Option<&TableAlias>) -> Option<Columns> {
    let mut columns = columns?;
    if alias.map_or(false, |alias| !alias.columns.is_empty()) {
        columns.iter_mut().for_each(|column| column.name = None);
    }
    Some(columns)
}

fn exposed_name(alias: Option<&TableAlias>) -> Option<String> {
    alias.map(|alias| alias.name.value.to_lowercase())
}

fn output_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|p| p.value.to_lowercase()),
        _ => None,
    }
}

/// Identifiers an expression reads, as lower-cased (qualifier, column)
#[derive(Default)]
struct ColumnRefs {
    columns: Vec<(Option<String>, String)>,
    nested_query: bool,
}

impl Visitor for ColumnRefs {
    type Break = ();

    fn pre_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.nested_query = true;
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => self.columns.push((None, ident.value.to_lowercase())),
            Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
                let column = parts[parts.len() - 1].value.to_lowercase();
                let qualifier = parts[parts.len() - 2].value.to_lowercase();
                self.columns.push((Some(qualifier), column));
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}
