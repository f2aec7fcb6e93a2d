//! Postgres idempotency store.
//!
//! Each table has exactly two columns, `id` (the key, primary key) and
//! `updated_at` (admission time as RFC 3339 text). Admission is a single
//! `INSERT ... ON CONFLICT (id) DO NOTHING RETURNING id`: the primary key
//! makes exactly one concurrent insert return a row.

use std::sync::Arc;

use async_trait::async_trait;

use super::Db;
use crate::error::{Error, Result};
use crate::model::{Admission, IdempotencyRecord};
use crate::store::IdempotencyStore;

/// Table created by the migrations and shared by default.
pub const SHARED_TABLE: &str = "idempotency_records";

/// Postgres limit on identifier length.
const MAX_IDENTIFIER: usize = 63;

pub struct PgIdempotencyStore {
    db: Arc<Db>,
    table: String,
    insert_sql: String,
}

impl PgIdempotencyStore {
    /// Store over the shared table created by migrations.
    pub fn shared(db: Arc<Db>) -> Self {
        Self::with_table(db, SHARED_TABLE.to_string())
    }

    /// Store over a table dedicated to one workflow, created if missing.
    pub async fn dedicated(db: Arc<Db>, workflow: &str) -> Result<Self> {
        let table = dedicated_table_name(workflow)?;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (id TEXT PRIMARY KEY, updated_at TEXT NOT NULL)"
        );
        sqlx::query(&ddl).execute(db.pool()).await?;
        Ok(Self::with_table(db, table))
    }

    fn with_table(db: Arc<Db>, table: String) -> Self {
        let insert_sql = format!(
            "INSERT INTO {table} (id, updated_at) VALUES ($1, $2)
             ON CONFLICT (id) DO NOTHING
             RETURNING id"
        );
        Self {
            db,
            table,
            insert_sql,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Look up the record for a key.
    pub async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let row: Option<(String, String)> = sqlx::query_as(&format!(
            "SELECT id, updated_at FROM {} WHERE id = $1",
            self.table
        ))
        .bind(key)
        .fetch_optional(self.db.pool())
        .await?;

        row.map(|(id, updated_at)| {
            let admitted_at = chrono::DateTime::parse_from_rfc3339(&updated_at)
                .map_err(|e| Error::Other(format!("bad updated_at for {id}: {e}")))?
                .with_timezone(&chrono::Utc);
            Ok(IdempotencyRecord::new(id, admitted_at))
        })
        .transpose()
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn insert_if_absent(&self, record: &IdempotencyRecord) -> Result<Admission> {
        let inserted: Option<(String,)> = sqlx::query_as(&self.insert_sql)
            .bind(&record.key)
            .bind(record.updated_at())
            .fetch_optional(self.db.pool())
            .await?;

        Ok(if inserted.is_some() {
            Admission::Admitted
        } else {
            Admission::AlreadyExists
        })
    }
}

/// `idempotency_<workflow>`, lowercased, non-alphanumerics folded to `_`.
fn dedicated_table_name(workflow: &str) -> Result<String> {
    let suffix: String = workflow
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if suffix.trim_matches('_').is_empty() {
        return Err(Error::Config(format!(
            "cannot derive a table name from workflow name {workflow:?}"
        )));
    }
    let name = format!("idempotency_{suffix}");
    if name.len() > MAX_IDENTIFIER {
        return Err(Error::Config(format!(
            "table name {name} exceeds {MAX_IDENTIFIER} characters"
        )));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedicated_names_are_safe_identifiers() {
        assert_eq!(
            dedicated_table_name("Nightly-Report").unwrap(),
            "idempotency_nightly_report"
        );
        assert_eq!(
            dedicated_table_name("a; DROP TABLE x").unwrap(),
            "idempotency_a__drop_table_x"
        );
        assert!(dedicated_table_name("---").is_err());
        assert!(dedicated_table_name(&"x".repeat(80)).is_err());
    }
}
