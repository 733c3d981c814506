// Structured queries: a source (collection or collection group) plus an
// ordered list of constraints. `compile` turns one into SQL.

mod compile;

pub use compile::{compile, compile_count, field_expr, validate, CompiledQuery};
pub(crate) use compile::sql_literal;

use crate::reference::{CollectionGroupRef, CollectionRef};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhereOp {
    Lt,
    Lte,
    Eq,
    Gte,
    Gt,
    Ne,
    ArrayContains,
    In,
}

impl WhereOp {
    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            WhereOp::Lt | WhereOp::Lte | WhereOp::Gt | WhereOp::Gte | WhereOp::Ne
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WhereOp::Lt => "<",
            WhereOp::Lte => "<=",
            WhereOp::Eq => "==",
            WhereOp::Gte => ">=",
            WhereOp::Gt => ">",
            WhereOp::Ne => "!=",
            WhereOp::ArrayContains => "array-contains",
            WhereOp::In => "in",
        }
    }
}

impl fmt::Display for WhereOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WhereOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "<" => Ok(WhereOp::Lt),
            "<=" => Ok(WhereOp::Lte),
            "==" => Ok(WhereOp::Eq),
            ">=" => Ok(WhereOp::Gte),
            ">" => Ok(WhereOp::Gt),
            "!=" => Ok(WhereOp::Ne),
            "array-contains" => Ok(WhereOp::ArrayContains),
            "in" => Ok(WhereOp::In),
            other => Err(format!("Unknown where operator '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn flipped(self) -> Self {
        match self {
            Direction::Asc => Direction::Desc,
            Direction::Desc => Direction::Asc,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(Direction::Asc),
            "desc" => Ok(Direction::Desc),
            other => Err(format!("Unknown sort direction '{other}'")),
        }
    }
}

/// One clause of a query.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Where {
        field: String,
        op: WhereOp,
        value: Value,
    },
    OrderBy {
        field: String,
        direction: Direction,
    },
    Limit(u64),
    LimitToLast(u64),
}

pub fn where_field(field: &str, op: WhereOp, value: Value) -> Constraint {
    Constraint::Where {
        field: field.to_string(),
        op,
        value,
    }
}

pub fn order_by(field: &str, direction: Direction) -> Constraint {
    Constraint::OrderBy {
        field: field.to_string(),
        direction,
    }
}

pub fn limit(n: u64) -> Constraint {
    Constraint::Limit(n)
}

pub fn limit_to_last(n: u64) -> Constraint {
    Constraint::LimitToLast(n)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuerySource {
    Collection(CollectionRef),
    CollectionGroup(CollectionGroupRef),
}

impl QuerySource {
    pub fn id(&self) -> &str {
        match self {
            QuerySource::Collection(c) => c.id(),
            QuerySource::CollectionGroup(g) => g.id(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub source: QuerySource,
    pub constraints: Vec<Constraint>,
}

impl Query {
    pub fn new(source: impl Into<QuerySource>, constraints: Vec<Constraint>) -> Self {
        Query {
            source: source.into(),
            constraints,
        }
    }

    /// Append a constraint, builder style.
    pub fn with(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn is_collection_group(&self) -> bool {
        matches!(self.source, QuerySource::CollectionGroup(_))
    }
}

impl From<CollectionRef> for QuerySource {
    fn from(c: CollectionRef) -> Self {
        QuerySource::Collection(c)
    }
}

impl From<CollectionGroupRef> for QuerySource {
    fn from(g: CollectionGroupRef) -> Self {
        QuerySource::CollectionGroup(g)
    }
}

impl From<CollectionRef> for Query {
    fn from(c: CollectionRef) -> Self {
        Query::new(c, Vec::new())
    }
}

impl From<CollectionGroupRef> for Query {
    fn from(g: CollectionGroupRef) -> Self {
        Query::new(g, Vec::new())
    }
}

/// `query(source, constraints)`: build a query from a collection or group.
pub fn query(source: impl Into<QuerySource>, constraints: Vec<Constraint>) -> Query {
    Query::new(source, constraints)
}
