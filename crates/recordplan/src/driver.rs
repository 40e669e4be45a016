//! Database driver interface (spec §6, consumed external collaborator).
//!
//! A real deployment backs this with a pooled `tokio_postgres` connection.
//! [`InMemoryDriver`] is a hand-rolled fake used by scenario tests so the
//! execution engine can be exercised without a live Postgres instance, in
//! the spirit of the teacher's `tests/compile_check.rs` SQL-shape
//! assertions.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::PlanResult;

/// One row, keyed by column name, independent of any particular driver's
/// row type — the planner never depends on `tokio_postgres::Row` directly.
pub type Row = std::collections::HashMap<String, Value>;

/// The database driver interface the execution engine consumes (spec §6).
/// Transaction start/commit/rollback are modeled by [`crate::transaction`]
/// directly against a `DbDriver`'s connection handle.
#[async_trait]
pub trait DbDriver: Send + Sync {
    async fn start_transaction(&self) -> PlanResult<()>;
    async fn commit_transaction(&self) -> PlanResult<()>;
    async fn rollback_transaction(&self) -> PlanResult<()>;

    /// Executes a SELECT, returning the row stream as a materialized vec
    /// (streaming is an optimization the consumed result-set parser would
    /// otherwise provide; out of scope here).
    async fn execute_query(&self, sql: &str) -> PlanResult<Vec<Row>>;

    /// Executes an INSERT/UPDATE/DELETE, returning affected row count.
    async fn execute_update(&self, sql: &str) -> PlanResult<u64>;

    /// Executes an INSERT that returns a generated id via `RETURNING`.
    async fn execute_insert(&self, sql: &str, generated_id_column: &str) -> PlanResult<Value>;

    /// `selectIntoAnchorTable`: stages ids for a multi-statement operation.
    async fn select_into_anchor_table(
        &self,
        anchor: &str,
        id_expr: &str,
        select_stump: &str,
    ) -> PlanResult<()>;

    async fn drop_anchor_table(&self, anchor: &str) -> PlanResult<()>;
}

/// An in-memory fake driver: tables are `Vec<Row>` keyed by table name,
/// mutated directly by the SQL the planners hand it. It does not parse
/// SQL — callers drive it by pre-seeding table contents and asserting on
/// emitted statement text, matching how the teacher's compile-check tests
/// assert on SQL shape rather than executing it.
#[derive(Default)]
pub struct InMemoryDriver {
    pub issued_statements: Mutex<Vec<String>>,
    pub next_generated_id: Mutex<i64>,
    /// Rows to hand back for an exact SQL match, keyed by the statement
    /// text — seeded by tests that need `execute_query` to return more
    /// than an empty set (e.g. the update planner's pre-update read).
    query_results: Mutex<HashMap<String, Vec<Row>>>,
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self {
            issued_statements: Mutex::new(Vec::new()),
            next_generated_id: Mutex::new(1),
            query_results: Mutex::new(HashMap::new()),
        }
    }

    pub fn statements(&self) -> Vec<String> {
        self.issued_statements.lock().unwrap().clone()
    }

    pub fn seed_query_result(&self, sql: impl Into<String>, rows: Vec<Row>) {
        self.query_results.lock().unwrap().insert(sql.into(), rows);
    }
}

#[async_trait]
impl DbDriver for InMemoryDriver {
    async fn start_transaction(&self) -> PlanResult<()> {
        self.issued_statements.lock().unwrap().push("BEGIN".to_string());
        Ok(())
    }

    async fn commit_transaction(&self) -> PlanResult<()> {
        self.issued_statements.lock().unwrap().push("COMMIT".to_string());
        Ok(())
    }

    async fn rollback_transaction(&self) -> PlanResult<()> {
        self.issued_statements.lock().unwrap().push("ROLLBACK".to_string());
        Ok(())
    }

    async fn execute_query(&self, sql: &str) -> PlanResult<Vec<Row>> {
        self.issued_statements.lock().unwrap().push(sql.to_string());
        Ok(self
            .query_results
            .lock()
            .unwrap()
            .get(sql)
            .cloned()
            .unwrap_or_default())
    }

    async fn execute_update(&self, sql: &str) -> PlanResult<u64> {
        self.issued_statements.lock().unwrap().push(sql.to_string());
        Ok(1)
    }

    async fn execute_insert(&self, sql: &str, _generated_id_column: &str) -> PlanResult<Value> {
        self.issued_statements.lock().unwrap().push(sql.to_string());
        let mut next = self.next_generated_id.lock().unwrap();
        let id = *next;
        *next += 1;
        Ok(Value::from(id))
    }

    async fn select_into_anchor_table(
        &self,
        anchor: &str,
        id_expr: &str,
        select_stump: &str,
    ) -> PlanResult<()> {
        self.issued_statements.lock().unwrap().push(format!(
            "SELECT {id_expr}, row_number() OVER () AS ord FROM ({select_stump}) q INTO {anchor}"
        ));
        Ok(())
    }

    async fn drop_anchor_table(&self, anchor: &str) -> PlanResult<()> {
        self.issued_statements.lock().unwrap().push(format!("DROP TABLE {anchor}"));
        Ok(())
    }
}
