//! Answers remote-API-shaped queries from the mirror alone.
//!
//! A query is either a `list=` collection or a page set (`titles=`,
//! `pageids=` or `generator=`) expanded with `prop=` modules. Results are
//! always complete: continuation is not replayed, and any request for a
//! partial result is rejected with [`QueryError::Unsupported`].

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, params_from_iter};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::timestamp::{Clock, SystemClock};
use crate::title::TitleResolver;

mod lists;
mod mapping;
mod pageset;
mod params;
mod props;
mod revisions;

pub use mapping::FieldRule;
pub use params::{ModuleParams, NameRange, QueryParams, TimeRange};

/// Separator used when names are aggregated in SQL with `char(31)`.
pub(crate) const TAG_SEPARATOR: char = '\u{1f}';

#[derive(Debug, Error)]
pub enum QueryError {
    /// Unknown or contradictory options.
    #[error("invalid query: {0}")]
    Validation(String),
    /// A recognized request the mirror cannot answer faithfully.
    #[error("unsupported query: {0}")]
    Unsupported(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// One result row keyed by column name.
pub type Record = Map<String, Value>;

/// Incrementally assembled SELECT with positional bindings.
#[derive(Debug, Default)]
pub(crate) struct Select {
    distinct: bool,
    columns: Vec<String>,
    from: String,
    joins: Vec<String>,
    filters: Vec<String>,
    order: Vec<String>,
    args: Vec<SqlValue>,
}

impl Select {
    pub fn new(from: &str) -> Self {
        Self {
            from: from.to_string(),
            ..Self::default()
        }
    }

    pub fn distinct(&mut self) {
        self.distinct = true;
    }

    pub fn column(&mut self, expression: &str) {
        self.columns.push(expression.to_string());
    }

    pub fn columns(&mut self, expressions: &[&str]) {
        self.columns.extend(expressions.iter().map(|expression| expression.to_string()));
    }

    pub fn join(&mut self, clause: &str) {
        self.joins.push(clause.to_string());
    }

    pub fn filter(&mut self, condition: String) {
        self.filters.push(condition);
    }

    pub fn order_by(&mut self, term: String) {
        self.order.push(term);
    }

    /// Registers a bound value and returns its placeholder.
    pub fn bind(&mut self, value: impl Into<SqlValue>) -> String {
        self.args.push(value.into());
        format!("?{}", self.args.len())
    }

    /// Binds a list as a JSON array usable with `json_each`.
    pub fn bind_list<T: serde::Serialize>(&mut self, values: &[T]) -> String {
        let encoded = serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string());
        format!("(SELECT value FROM json_each({}))", self.bind(encoded))
    }

    /// Condition matching rows whose namespace and title columns are among `pairs`.
    pub fn bind_pairs(&mut self, pairs: &[(i64, String)], namespace: &str, title: &str) -> String {
        let encoded = serde_json::to_string(pairs).unwrap_or_else(|_| "[]".to_string());
        let placeholder = self.bind(encoded);
        format!(
            "EXISTS (SELECT 1 FROM json_each({placeholder}) AS wanted
              WHERE json_extract(wanted.value, '$[0]') = {namespace}
              AND json_extract(wanted.value, '$[1]') = {title})"
        )
    }

    pub fn sql(&self) -> String {
        let mut sql = format!(
            "SELECT {}{} FROM {}",
            if self.distinct { "DISTINCT " } else { "" },
            self.columns.join(", "),
            self.from
        );
        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join);
        }
        if !self.filters.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.filters.join(" AND "));
        }
        if !self.order.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order.join(", "));
        }
        sql
    }

    pub fn fetch(&self, connection: &Connection) -> Result<Vec<Record>, QueryError> {
        let sql = self.sql();
        tracing::trace!(%sql, "replay select");
        let mut statement = connection.prepare_cached(&sql)?;
        let names = statement
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let mut rows = statement.query(params_from_iter(self.args.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Record::new();
            for (index, name) in names.iter().enumerate() {
                record.insert(name.clone(), json_value(row.get_ref(index)?));
            }
            out.push(record);
        }
        Ok(out)
    }
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null | ValueRef::Blob(_) => Value::Null,
        ValueRef::Integer(number) => Value::from(number),
        ValueRef::Real(number) => Value::from(number),
        ValueRef::Text(text) => Value::from(String::from_utf8_lossy(text).into_owned()),
    }
}

/// Read-only query front end over a mirror database.
pub struct QueryReplay<'conn> {
    connection: &'conn Connection,
    titles: TitleResolver,
    clock: &'conn dyn Clock,
}

impl<'conn> QueryReplay<'conn> {
    pub fn new(connection: &'conn Connection) -> Result<Self> {
        Self::with_clock(connection, &SystemClock)
    }

    /// Expiry filters compare against `clock` instead of the system time.
    pub fn with_clock(connection: &'conn Connection, clock: &'conn dyn Clock) -> Result<Self> {
        Ok(Self {
            connection,
            titles: TitleResolver::load(connection)?,
            clock,
        })
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn connection(&self) -> &'conn Connection {
        self.connection
    }

    pub(crate) fn titles(&self) -> &TitleResolver {
        &self.titles
    }

    pub fn query(&self, params: &QueryParams) -> Result<Vec<Value>, QueryError> {
        let page_sources = ["titles", "pageids", "generator"]
            .into_iter()
            .filter(|key| params.contains(key))
            .collect::<Vec<_>>();
        if let Some(list) = params.get("list") {
            if !page_sources.is_empty() || params.contains("prop") {
                return Err(QueryError::Unsupported(
                    "combining list= with a page set is not supported".to_string(),
                ));
            }
            let entries = lists::run(self, list, params, false)?;
            return Ok(entries.into_iter().map(Value::Object).collect());
        }
        match page_sources.as_slice() {
            [] => Err(QueryError::Validation(
                "query needs list=, titles=, pageids= or generator=".to_string(),
            )),
            [_] => pageset::run(self, params),
            _ => Err(QueryError::Validation(format!(
                "parameters {} cannot be used together",
                page_sources.join(", ")
            ))),
        }
    }
}
