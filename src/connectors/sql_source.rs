//! SQL source reader.
//!
//! Reads source tables through a SeaORM connection (SQLite or Postgres). Table
//! and column names come from job definitions, so they are validated and
//! quoted for the connected backend; values are always bound as parameters.

use std::cmp::Ordering;

use async_trait::async_trait;
use sea_orm::{
    ConnectionTrait, DatabaseBackend, DatabaseConnection, DbErr, FromQueryResult, JsonValue,
    Statement, Value as DbValue,
};
use tracing::debug;

use crate::connectors::trait_::{KeysetFilter, ReadRequest, SourceReader, SyncError};
use crate::models::Row;
use crate::models::value::{compare_stored, parse_datetime};

fn is_identifier(part: &str) -> bool {
    part.chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `SourceReader` over a SeaORM connection.
#[derive(Clone)]
pub struct SqlSource {
    db: DatabaseConnection,
}

impl SqlSource {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    fn backend(&self) -> DatabaseBackend {
        self.db.get_database_backend()
    }

    /// Quote a possibly schema-qualified identifier.
    fn quote(&self, name: &str) -> Result<String, SyncError> {
        let (open, close) = match self.backend() {
            DatabaseBackend::MySql => ('`', '`'),
            _ => ('"', '"'),
        };
        name.split('.')
            .map(|part| {
                if is_identifier(part) {
                    Ok(format!("{open}{part}{close}"))
                } else {
                    Err(SyncError::permanent(format!(
                        "invalid identifier '{name}'"
                    )))
                }
            })
            .collect::<Result<Vec<_>, _>>()
            .map(|parts| parts.join("."))
    }

    fn placeholder(&self, index: usize) -> String {
        match self.backend() {
            DatabaseBackend::Postgres => format!("${index}"),
            _ => "?".to_string(),
        }
    }

    fn bind(&self, value: &serde_json::Value) -> DbValue {
        match value {
            serde_json::Value::Null => DbValue::String(None),
            serde_json::Value::Bool(b) => DbValue::from(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => DbValue::from(i),
                None => DbValue::from(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => {
                // Postgres will not compare a timestamp column with a text parameter.
                if self.backend() == DatabaseBackend::Postgres
                    && let Some(dt) = parse_datetime(s)
                {
                    return DbValue::ChronoDateTimeUtc(Some(Box::new(dt)));
                }
                DbValue::from(s.clone())
            }
            other => DbValue::from(other.to_string()),
        }
    }

    fn build_select(&self, table: &str, request: &ReadRequest) -> Result<Statement, SyncError> {
        let mut sql = format!("SELECT * FROM {}", self.quote(table)?);
        let mut values = Vec::new();

        match &request.filter {
            None => {}
            // NULL sorts first, so every non-NULL value is after a NULL boundary.
            Some(KeysetFilter::After { column, value }) if value.is_null() => {
                sql.push_str(&format!(" WHERE {} IS NOT NULL", self.quote(column)?));
            }
            Some(KeysetFilter::After { column, value }) => {
                values.push(self.bind(value));
                sql.push_str(&format!(
                    " WHERE {} > {}",
                    self.quote(column)?,
                    self.placeholder(values.len())
                ));
            }
            Some(KeysetFilter::AfterTie {
                column,
                value,
                tie_column,
                tie_value,
            }) if value.is_null() => {
                let column = self.quote(column)?;
                let tie_column = self.quote(tie_column)?;
                values.push(self.bind(tie_value));
                let p1 = self.placeholder(values.len());
                sql.push_str(&format!(
                    " WHERE ({column} IS NOT NULL OR ({column} IS NULL AND {tie_column} > {p1}))"
                ));
            }
            Some(KeysetFilter::AfterTie {
                column,
                value,
                tie_column,
                tie_value,
            }) => {
                let column = self.quote(column)?;
                let tie_column = self.quote(tie_column)?;
                values.push(self.bind(value));
                let p1 = self.placeholder(values.len());
                values.push(self.bind(value));
                let p2 = self.placeholder(values.len());
                values.push(self.bind(tie_value));
                let p3 = self.placeholder(values.len());
                sql.push_str(&format!(
                    " WHERE ({column} > {p1} OR ({column} = {p2} AND {tie_column} > {p3}))"
                ));
            }
        }

        if !request.order_by.is_empty() {
            // Keysets assume NULL sorts first, which Postgres only does when asked.
            let nulls = match self.backend() {
                DatabaseBackend::Postgres => " NULLS FIRST",
                _ => "",
            };
            let order = request
                .order_by
                .iter()
                .map(|c| self.quote(c).map(|q| format!("{q} ASC{nulls}")))
                .collect::<Result<Vec<_>, _>>()?;
            sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
        }
        sql.push_str(&format!(" LIMIT {}", request.limit));

        Ok(Statement::from_sql_and_values(self.backend(), sql, values))
    }

    async fn query(&self, stmt: Statement) -> Result<Vec<JsonValue>, SyncError> {
        debug!(sql = %stmt.sql, "source query");
        JsonValue::find_by_statement(stmt)
            .all(&self.db)
            .await
            .map_err(map_db_err)
    }
}

fn map_db_err(err: DbErr) -> SyncError {
    match err {
        DbErr::Conn(_) | DbErr::ConnectionAcquire(_) => {
            SyncError::transient(format!("source connection error: {err}"))
        }
        other => SyncError::permanent(format!("source query failed: {other}")),
    }
}

fn into_row(value: JsonValue) -> Result<Row, SyncError> {
    match value {
        JsonValue::Object(map) => Ok(map),
        other => Err(SyncError::permanent(format!(
            "source returned a non-object row: {other}"
        ))),
    }
}

#[async_trait]
impl SourceReader for SqlSource {
    async fn list_tables(&self) -> Result<Vec<String>, SyncError> {
        let sql = match self.backend() {
            DatabaseBackend::Sqlite => {
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name"
            }
            DatabaseBackend::Postgres => {
                "SELECT table_name AS name FROM information_schema.tables WHERE table_schema = current_schema() ORDER BY table_name"
            }
            DatabaseBackend::MySql => {
                "SELECT TABLE_NAME AS name FROM information_schema.tables WHERE table_schema = DATABASE() ORDER BY TABLE_NAME"
            }
        };
        let rows = self
            .query(Statement::from_string(self.backend(), sql))
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.get("name").and_then(|n| n.as_str()).map(String::from))
            .collect())
    }

    async fn count_rows(&self, table: &str) -> Result<u64, SyncError> {
        let sql = format!("SELECT COUNT(*) AS n FROM {}", self.quote(table)?);
        let rows = self
            .query(Statement::from_string(self.backend(), sql))
            .await?;
        rows.first()
            .and_then(|row| row.get("n"))
            .and_then(|n| n.as_u64().or_else(|| n.as_str().and_then(|s| s.parse().ok())))
            .ok_or_else(|| SyncError::permanent(format!("could not count rows of '{table}'")))
    }

    fn compare_keys(&self, a: &serde_json::Value, b: &serde_json::Value) -> Ordering {
        compare_stored(a, b)
    }

    async fn read_rows(&self, table: &str, request: &ReadRequest) -> Result<Vec<Row>, SyncError> {
        let stmt = self.build_select(table, request)?;
        self.query(stmt)
            .await?
            .into_iter()
            .map(into_row)
            .collect()
    }
}
