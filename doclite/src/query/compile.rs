use super::{Constraint, Direction, Query, QuerySource, WhereOp};
use crate::engine::{json_to_sql, SqlValue};
use crate::error::{DocError, Result};
use serde_json::Value;

/// SQL text plus positional bindings, ready for the execution queue.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub bindings: Vec<SqlValue>,
    /// Rows come back in flipped order and must be reversed after execution.
    pub reverse: bool,
}

/// Check the query shape without producing SQL.
///
/// - An inequality filter plus at least one `orderBy` requires the first
///   `orderBy` to be on the inequality field.
/// - `limitToLast` requires at least one `orderBy`.
pub fn validate(query: &Query) -> Result<()> {
    let first_order = query.constraints.iter().find_map(|c| match c {
        Constraint::OrderBy { field, .. } => Some(field.as_str()),
        _ => None,
    });

    for constraint in &query.constraints {
        match constraint {
            Constraint::Where { field, op, value } => {
                json_path(field)?;
                if *op == WhereOp::In {
                    in_operand(field, value)?;
                }
                if op.is_inequality() {
                    if let Some(first) = first_order {
                        if first != field {
                            return Err(DocError::Validation(format!(
                                "Invalid query: inequality filter on '{field}' ({op}) requires the first orderBy to be on '{field}', but it is on '{first}'"
                            )));
                        }
                    }
                }
            }
            Constraint::OrderBy { field, .. } => {
                json_path(field)?;
            }
            Constraint::LimitToLast(_) if first_order.is_none() => {
                return Err(DocError::Validation(
                    "Invalid query: limitToLast requires at least one orderBy clause".into(),
                ));
            }
            Constraint::Limit(_) | Constraint::LimitToLast(_) => {}
        }
    }
    Ok(())
}

/// Compile a query into a `SELECT collection_id, doc_id, data` statement.
pub fn compile(query: &Query) -> Result<CompiledQuery> {
    validate(query)?;

    let (limit, limit_to_last) = effective_limits(query);
    let reverse = limit.is_none() && limit_to_last.is_some();

    let mut bindings = Vec::new();
    let mut sql = String::from("SELECT collection_id, doc_id, data FROM documents WHERE ");
    sql.push_str(&predicates(query, &mut bindings)?);

    let mut sort_keys = Vec::new();
    for constraint in &query.constraints {
        if let Constraint::OrderBy { field, direction } = constraint {
            let direction = if reverse { direction.flipped() } else { *direction };
            sort_keys.push(format!("{} {}", field_expr(field)?, direction.as_sql()));
        }
    }
    // Document id breaks ties so results are stable across re-fetches.
    let tiebreak = if reverse {
        Direction::Desc
    } else {
        Direction::Asc
    };
    sort_keys.push(format!("collection_id {}", tiebreak.as_sql()));
    sort_keys.push(format!("doc_id {}", tiebreak.as_sql()));
    sql.push_str(" ORDER BY ");
    sql.push_str(&sort_keys.join(", "));

    if let Some(n) = limit.or(limit_to_last) {
        sql.push_str(" LIMIT ?");
        bindings.push(SqlValue::Integer(i64::try_from(n).unwrap_or(i64::MAX)));
    }

    log::debug!("Compiled query on {}: {sql}", query.source.id());
    Ok(CompiledQuery {
        sql,
        bindings,
        reverse,
    })
}

/// Compile the row count of a query. Ordering and limits are ignored, so
/// neither the orderBy coupling nor the limitToLast rule applies.
pub fn compile_count(query: &Query) -> Result<CompiledQuery> {
    let mut bindings = Vec::new();
    let sql = format!(
        "SELECT COUNT(*) AS count FROM documents WHERE {}",
        predicates(query, &mut bindings)?
    );
    log::debug!("Compiled count on {}: {sql}", query.source.id());
    Ok(CompiledQuery {
        sql,
        bindings,
        reverse: false,
    })
}

/// `json_extract` over a document field, with the path inlined as a literal.
/// Queries and indexes share this text exactly.
pub fn field_expr(field: &str) -> Result<String> {
    Ok(format!("json_extract(data, {})", sql_literal(&json_path(field)?)))
}

/// `a.b` → `$."a"."b"`.
pub(crate) fn json_path(field: &str) -> Result<String> {
    let mut path = String::from("$");
    for segment in field.split('.') {
        if segment.is_empty() || segment.contains('"') {
            return Err(DocError::Validation(format!(
                "Invalid field path '{field}'"
            )));
        }
        path.push_str(".\"");
        path.push_str(segment);
        path.push('"');
    }
    Ok(path)
}

pub(crate) fn sql_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// The last `limit` and the last `limitToLast`, in that order. When both are
/// present `limit` wins and `limitToLast` is ignored.
fn effective_limits(query: &Query) -> (Option<u64>, Option<u64>) {
    let mut limit = None;
    let mut limit_to_last = None;
    for constraint in &query.constraints {
        match constraint {
            Constraint::Limit(n) => limit = Some(*n),
            Constraint::LimitToLast(n) => limit_to_last = Some(*n),
            _ => {}
        }
    }
    if limit.is_some() && limit_to_last.is_some() {
        log::warn!(
            "Query on {} has both limit and limitToLast; limitToLast is ignored",
            query.source.id()
        );
    }
    (limit, limit_to_last)
}

/// Source predicate followed by every `where`, joined with AND.
fn predicates(query: &Query, bindings: &mut Vec<SqlValue>) -> Result<String> {
    let mut clauses = Vec::new();

    match &query.source {
        QuerySource::Collection(collection) => {
            clauses.push("collection_id = ?".to_string());
            bindings.push(SqlValue::Text(collection.id().to_string()));
        }
        QuerySource::CollectionGroup(group) => {
            // Exact, case-sensitive match on the last path segment.
            let suffix = format!("/{}", group.id());
            clauses.push("(collection_id = ? OR substr(collection_id, -?) = ?)".to_string());
            bindings.push(SqlValue::Text(group.id().to_string()));
            bindings.push(SqlValue::Integer(suffix.chars().count() as i64));
            bindings.push(SqlValue::Text(suffix));
        }
    }

    for constraint in &query.constraints {
        if let Constraint::Where { field, op, value } = constraint {
            clauses.push(where_clause(field, *op, value, bindings)?);
        }
    }

    Ok(clauses.join(" AND "))
}

fn where_clause(
    field: &str,
    op: WhereOp,
    value: &Value,
    bindings: &mut Vec<SqlValue>,
) -> Result<String> {
    let expr = field_expr(field)?;
    let clause = match op {
        WhereOp::Eq if value.is_null() => format!("{expr} IS NULL"),
        WhereOp::Ne if value.is_null() => format!("{expr} IS NOT NULL"),
        WhereOp::Eq => {
            bindings.push(json_to_sql(value));
            format!("{expr} = ?")
        }
        WhereOp::Ne | WhereOp::Lt | WhereOp::Lte | WhereOp::Gt | WhereOp::Gte => {
            bindings.push(json_to_sql(value));
            format!("{expr} {} ?", op.as_str())
        }
        WhereOp::ArrayContains => {
            let path = sql_literal(&json_path(field)?);
            bindings.push(json_to_sql(value));
            format!(
                "(json_type(data, {path}) = 'array' AND EXISTS (SELECT 1 FROM json_each(data, {path}) WHERE json_each.value = ?))"
            )
        }
        WhereOp::In => {
            let values = in_operand(field, value)?;
            let placeholders = vec!["?"; values.len()].join(", ");
            bindings.extend(values.iter().map(json_to_sql));
            format!("{expr} IN ({placeholders})")
        }
    };
    Ok(clause)
}

fn in_operand<'a>(field: &str, value: &'a Value) -> Result<&'a Vec<Value>> {
    match value {
        Value::Array(values) if !values.is_empty() => Ok(values),
        _ => Err(DocError::Validation(format!(
            "Invalid 'in' filter on '{field}': value must be a non-empty array"
        ))),
    }
}
