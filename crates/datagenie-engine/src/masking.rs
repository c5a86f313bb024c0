//! PII masking for result rows
//!
//! Masking is a pure, order-preserving transform: one [`MaskingKind`] per
//! result column, applied to every row. Nulls stay null, and a masked value is
//! always different from the raw one.

use crate::config::MaskingRule;
use crate::validator::{SourceColumn, ValidatedQuery};
use datagenie_query::ResultColumn;
use serde::{Deserialize, Serialize};

const REDACTED: &str = "***";
const REDACTED_ALT: &str = "[REDACTED]";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskingKind {
    #[default]
    None,
    Email,
    Phone,
    GenericName,
    FullRedact,
}

impl MaskingKind {
    /// Combine two classifications of the same output column. Conflicting
    /// partial masks collapse to a full redaction.
    pub fn stricter(self, other: MaskingKind) -> MaskingKind {
        match (self, other) {
            (a, b) if a == b => a,
            (MaskingKind::None, b) => b,
            (a, MaskingKind::None) => a,
            _ => MaskingKind::FullRedact,
        }
    }

    fn apply(self, raw: &str) -> String {
        match self {
            MaskingKind::None => raw.to_string(),
            MaskingKind::Email => mask_email(raw),
            MaskingKind::Phone => mask_phone(raw),
            MaskingKind::GenericName => mask_generic(raw),
            MaskingKind::FullRedact => REDACTED.to_string(),
        }
    }
}

/// Externally supplied sensitivity classification of source columns
pub trait ColumnSensitivityPolicy: Send + Sync {
    fn classification(
        &self,
        data_source_id: &str,
        schema: &str,
        table: &str,
        column: &str,
    ) -> MaskingKind;
}

/// In-memory policy built from rules. When several rules match, the strictest wins.
#[derive(Debug, Clone, Default)]
pub struct StaticSensitivityPolicy {
    rules: Vec<MaskingRule>,
}

impl StaticSensitivityPolicy {
    pub fn new(rules: Vec<MaskingRule>) -> Self {
        Self { rules }
    }

    /// Add a rule scoped to one table of one data source
    pub fn with_rule(
        mut self,
        data_source: impl Into<String>,
        table: impl Into<String>,
        column: impl Into<String>,
        kind: MaskingKind,
    ) -> Self {
        self.rules.push(MaskingRule {
            data_source: Some(data_source.into()),
            schema: None,
            table: Some(table.into()),
            column: column.into(),
            kind,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn scope_matches(scope: &Option<String>, value: &str) -> bool {
    scope
        .as_deref()
        .map_or(true, |expected| expected.eq_ignore_ascii_case(value))
}

impl ColumnSensitivityPolicy for StaticSensitivityPolicy {
    fn classification(
        &self,
        data_source_id: &str,
        schema: &str,
        table: &str,
        column: &str,
    ) -> MaskingKind {
        self.rules
            .iter()
            .filter(|rule| {
                rule.column.eq_ignore_ascii_case(column)
                    && scope_matches(&rule.data_source, data_source_id)
                    && scope_matches(&rule.schema, schema)
                    && scope_matches(&rule.table, table)
            })
            .fold(MaskingKind::None, |acc, rule| acc.stricter(rule.kind))
    }
}

/// Resolve the masking kind of every result column.
///
/// Traced projection lineage wins when its width matches the result. A
/// column whose lineage is unknown takes the strictest classification
/// among every column the query references.
pub fn resolve_policy(
    data_source_id: &str,
    columns: &[ResultColumn],
    validated: &ValidatedQuery,
    policy: &dyn ColumnSensitivityPolicy,
) -> Vec<MaskingKind> {
    let classify = |sources: &mut dyn Iterator<Item = &SourceColumn>| {
        sources.fold(MaskingKind::None, |acc, source| {
            acc.stricter(policy.classification(
                data_source_id,
                &source.schema,
                &source.table,
                &source.column,
            ))
        })
    };
    let fallback = classify(&mut validated.referenced_columns.iter());

    if let Some(projection) = validated
        .projection
        .as_ref()
        .filter(|projection| projection.len() == columns.len())
    {
        return projection
            .iter()
            .map(|projected| {
                if projected.resolved {
                    classify(&mut projected.sources.iter())
                } else {
                    fallback
                }
            })
            .collect();
    }

    columns
        .iter()
        .map(|column| match validated.aliases.get(&column.name.to_lowercase()) {
            Some(sources) => classify(&mut sources.iter()),
            None => fallback,
        })
        .collect()
}

/// Apply per-column masking to rows
pub fn mask(
    columns: &[ResultColumn],
    rows: Vec<Vec<serde_json::Value>>,
    kinds: &[MaskingKind],
) -> Vec<Vec<serde_json::Value>> {
    debug_assert_eq!(columns.len(), kinds.len());

    if kinds.iter().all(|kind| *kind == MaskingKind::None) {
        return rows;
    }

    rows.into_iter()
        .map(|row| {
            row.into_iter()
                .enumerate()
                .map(|(idx, value)| {
                    let kind = kinds.get(idx).copied().unwrap_or_default();
                    mask_value(value, kind)
                })
                .collect()
        })
        .collect()
}

fn mask_value(value: serde_json::Value, kind: MaskingKind) -> serde_json::Value {
    if kind == MaskingKind::None || value.is_null() {
        return value;
    }

    let raw = match &value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    let masked = kind.apply(&raw);
    if masked != raw {
        return serde_json::Value::String(masked);
    }

    if raw != REDACTED {
        serde_json::Value::String(REDACTED.to_string())
    } else {
        serde_json::Value::String(REDACTED_ALT.to_string())
    }
}

/// `user@domain.com` -> `u**r@domain.com`; local parts of two characters or
/// fewer are fully starred.
fn mask_email(email: &str) -> String {
    let Some((local, domain)) = email.split_once('@') else {
        return REDACTED.to_string();
    };

    let chars: Vec<char> = local.chars().collect();
    let masked_local = if chars.len() <= 2 {
        "*".repeat(chars.len())
    } else {
        format!(
            "{}{}{}",
            chars[0],
            "*".repeat(chars.len() - 2),
            chars[chars.len() - 1]
        )
    };

    format!("{}@{}", masked_local, domain)
}

/// `010-1234-5678` -> `010-****-5678`
fn mask_phone(phone: &str) -> String {
    let digits: Vec<char> = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 8 {
        return REDACTED.to_string();
    }

    let head: String = digits[..3].iter().collect();
    let tail: String = digits[digits.len() - 4..].iter().collect();
    format!("{}-****-{}", head, tail)
}

/// First character kept, the rest starred
fn mask_generic(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => format!("{}{}", first, "*".repeat(chars.count())),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::ProjectedColumn;
    use datagenie_query::FieldType;
    use serde_json::json;
    use std::collections::HashMap;

    fn columns(names: &[&str]) -> Vec<ResultColumn> {
        names
            .iter()
            .map(|name| ResultColumn::new(*name, FieldType::String))
            .collect()
    }

    #[test]
    fn test_email_mask_format() {
        assert_eq!(mask_email("user@example.com"), "u**r@example.com");
        assert_eq!(mask_email("ab@example.com"), "**@example.com");
        assert_eq!(mask_email("not-an-email"), "***");
    }

    #[test]
    fn test_phone_mask_format() {
        assert_eq!(mask_phone("010-1234-5678"), "010-****-5678");
        assert_eq!(mask_phone("01012345678"), "010-****-5678");
        assert_eq!(mask_phone("12-34"), "***");
    }

    #[test]
    fn test_generic_mask_format() {
        assert_eq!(mask_generic("Alice"), "A****");
        assert_eq!(mask_generic("김철수"), "김**");
    }

    #[test]
    fn test_masked_value_always_differs() {
        // Masking an already-masked value must still change it
        assert_eq!(
            mask_value(json!("010-****-5678"), MaskingKind::Phone),
            json!("***")
        );
        assert_eq!(mask_value(json!("A"), MaskingKind::GenericName), json!("***"));
        assert_eq!(
            mask_value(json!("***"), MaskingKind::FullRedact),
            json!("[REDACTED]")
        );

        for raw in ["user@example.com", "x@y.z", "**@example.com", "a"] {
            let masked = mask_value(json!(raw), MaskingKind::Email);
            assert_ne!(masked, json!(raw), "{}", raw);
        }
    }

    #[test]
    fn test_null_and_non_string_values() {
        assert_eq!(mask_value(json!(null), MaskingKind::Email), json!(null));
        assert_eq!(
            mask_value(json!(1012345678), MaskingKind::FullRedact),
            json!("***")
        );
    }

    #[test]
    fn test_mask_preserves_shape() {
        let cols = columns(&["id", "email"]);
        let rows = vec![
            vec![json!(1), json!("alice@example.com")],
            vec![json!(2), json!(null)],
        ];
        let masked = mask(&cols, rows, &[MaskingKind::None, MaskingKind::Email]);

        assert_eq!(masked.len(), 2);
        assert_eq!(masked[0][0], json!(1));
        assert_eq!(masked[0][1], json!("a***e@example.com"));
        assert_eq!(masked[1][1], json!(null));
    }

    #[test]
    fn test_stricter() {
        assert_eq!(
            MaskingKind::None.stricter(MaskingKind::Email),
            MaskingKind::Email
        );
        assert_eq!(
            MaskingKind::Email.stricter(MaskingKind::Phone),
            MaskingKind::FullRedact
        );
        assert_eq!(
            MaskingKind::FullRedact.stricter(MaskingKind::None),
            MaskingKind::FullRedact
        );
    }

    #[test]
    fn test_static_policy_scoping() {
        let policy = StaticSensitivityPolicy::default()
            .with_rule("sales", "customers", "email", MaskingKind::Email)
            .with_rule("sales", "customers", "email", MaskingKind::FullRedact);

        assert_eq!(
            policy.classification("sales", "public", "customers", "EMAIL"),
            MaskingKind::FullRedact
        );
        assert_eq!(
            policy.classification("other", "public", "customers", "email"),
            MaskingKind::None
        );
        assert_eq!(
            policy.classification("sales", "public", "orders", "email"),
            MaskingKind::None
        );
    }

    #[test]
    fn test_resolve_policy_through_alias() {
        let policy = StaticSensitivityPolicy::default().with_rule(
            "sales",
            "customers",
            "email",
            MaskingKind::Email,
        );

        let email = SourceColumn {
            schema: "public".into(),
            table: "customers".into(),
            column: "email".into(),
        };
        let id = SourceColumn {
            schema: "public".into(),
            table: "customers".into(),
            column: "id".into(),
        };

        let validated = ValidatedQuery {
            sql: "SELECT id, email AS contact FROM customers LIMIT 1000".into(),
            tables: vec![],
            limit_injected: true,
            limit_clamped: false,
            effective_limit: 1000,
            aliases: HashMap::from([
                ("contact".to_string(), vec![email.clone()]),
                ("id".to_string(), vec![id.clone()]),
            ]),
            projection: None,
            referenced_columns: vec![id, email],
        };

        let kinds = resolve_policy("sales", &columns(&["id", "contact"]), &validated, &policy);
        assert_eq!(kinds, vec![MaskingKind::None, MaskingKind::Email]);

        // Names without lineage take the strictest referenced column
        let kinds = resolve_policy("sales", &columns(&["id", "whatever"]), &validated, &policy);
        assert_eq!(kinds, vec![MaskingKind::None, MaskingKind::Email]);
    }

    #[test]
    fn test_unresolved_projection_fails_closed() {
        let policy = StaticSensitivityPolicy::default()
            .with_rule("sales", "customers", "email", MaskingKind::Email)
            .with_rule("sales", "customers", "ssn", MaskingKind::FullRedact);

        let source = |column: &str| SourceColumn {
            schema: "public".into(),
            table: "customers".into(),
            column: column.into(),
        };

        let validated = ValidatedQuery {
            sql: "SELECT id, e, x FROM (SELECT id, email AS e, ssn AS x FROM customers) t".into(),
            tables: vec![],
            limit_injected: true,
            limit_clamped: false,
            effective_limit: 1000,
            aliases: HashMap::new(),
            projection: Some(vec![
                ProjectedColumn {
                    name: Some("id".into()),
                    sources: vec![source("id")],
                    resolved: true,
                },
                ProjectedColumn {
                    name: Some("e".into()),
                    sources: vec![source("email")],
                    resolved: true,
                },
                ProjectedColumn {
                    name: Some("x".into()),
                    sources: vec![],
                    resolved: false,
                },
            ]),
            referenced_columns: vec![source("id"), source("email"), source("ssn")],
        };

        let kinds = resolve_policy("sales", &columns(&["id", "e", "x"]), &validated, &policy);
        assert_eq!(
            kinds,
            vec![MaskingKind::None, MaskingKind::Email, MaskingKind::FullRedact]
        );

        // A result wider than the traced projection ignores it entirely
        let kinds = resolve_policy("sales", &columns(&["id", "e", "x", "y"]), &validated, &policy);
        assert!(kinds.iter().all(|kind| *kind == MaskingKind::FullRedact));
    }
}
