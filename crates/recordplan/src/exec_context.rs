//! Execution context (spec §4.9, component C9).
//!
//! Per-DBO-call mutable state: connection/transaction, actor, the
//! execution timestamp, parameter values, the entangled-updates set, and
//! the affected-rows accumulator. Created per `execute()` call and
//! discarded at completion; never shared across executions (the
//! [`ParamRegistry`] it wraps is the only immutable, reused part).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::driver::DbDriver;
use crate::error::{PlanError, PlanResult};
use crate::params::{substitute, ParamRegistry, ParamResolver, ResolvedParam};
use crate::transaction::TransactionHandle;

/// Per-call tuning knobs (spec §4.9, carried as the engine's one ambient
/// "configuration" struct).
#[derive(Debug, Clone, Copy)]
pub struct ExecutionOptions {
    pub rollback_on_error: bool,
    pub execute_post_statements: bool,
    pub wrap_in_tx: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            rollback_on_error: true,
            execute_post_statements: true,
            wrap_in_tx: true,
        }
    }
}

/// Per-execution mutable state threaded through a command chain.
pub struct ExecutionContext {
    pub driver: Arc<dyn DbDriver>,
    pub transaction: Arc<TransactionHandle>,
    pub actor: Option<String>,
    pub executed_on: DateTime<Utc>,
    params: Arc<ParamRegistry>,
    generated: Mutex<HashMap<String, Value>>,
    entangled_updates: Mutex<HashMap<String, HashSet<String>>>,
    affected_rows: Mutex<HashMap<String, u64>>,
    last_affected: AtomicU64,
    /// Ids of records whose update patch failed a `test` op (spec §4.12
    /// step 3/5) — reported in the update result, not as an error.
    test_failed_ids: Mutex<Vec<Value>>,
    /// Records hydrated by a fetch planner's command (spec §4.13) — the
    /// fetch DBO's result, populated once per execution.
    fetched_records: Mutex<Vec<Value>>,
    pub options: ExecutionOptions,
}

impl ExecutionContext {
    /// Builds a context owning a freshly created (but not yet started)
    /// transaction — the DBO call owns its lifecycle.
    pub fn owning(
        driver: Arc<dyn DbDriver>,
        actor: Option<String>,
        executed_on: DateTime<Utc>,
        params: Arc<ParamRegistry>,
        options: ExecutionOptions,
    ) -> Self {
        let tx = Arc::new(TransactionHandle::new(driver.clone()));
        Self::new(driver, tx, actor, executed_on, params, options)
    }

    /// Builds a context around an externally managed, already-active
    /// transaction. Fails with `UsageError` if it is not active (spec
    /// §4.9).
    pub fn externally_managed(
        driver: Arc<dyn DbDriver>,
        transaction: Arc<TransactionHandle>,
        actor: Option<String>,
        executed_on: DateTime<Utc>,
        params: Arc<ParamRegistry>,
        mut options: ExecutionOptions,
    ) -> PlanResult<Self> {
        if !transaction.is_active() {
            return Err(PlanError::usage(
                "cannot build an execution context around a transaction that is not active",
            ));
        }
        options.wrap_in_tx = false;
        Ok(Self::new(driver, transaction, actor, executed_on, params, options))
    }

    fn new(
        driver: Arc<dyn DbDriver>,
        transaction: Arc<TransactionHandle>,
        actor: Option<String>,
        executed_on: DateTime<Utc>,
        params: Arc<ParamRegistry>,
        options: ExecutionOptions,
    ) -> Self {
        Self {
            driver,
            transaction,
            actor,
            executed_on,
            params,
            generated: Mutex::new(HashMap::new()),
            entangled_updates: Mutex::new(HashMap::new()),
            affected_rows: Mutex::new(HashMap::new()),
            last_affected: AtomicU64::new(0),
            test_failed_ids: Mutex::new(Vec::new()),
            fetched_records: Mutex::new(Vec::new()),
            options,
        }
    }

    pub fn add_generated_param(&self, name: impl Into<String>, value: Value) {
        self.generated.lock().unwrap().insert(name.into(), value);
    }

    pub fn clear_generated_params(&self) {
        self.generated.lock().unwrap().clear();
    }

    pub fn generated_param(&self, name: &str) -> Option<Value> {
        self.generated.lock().unwrap().get(name).cloned()
    }

    /// Records that `id` (rendered as a canonical JSON string) needs its
    /// meta-info bumped because an entangled reference touched it.
    pub fn record_entangled_update(&self, record_type: &str, id: &Value) {
        self.entangled_updates
            .lock()
            .unwrap()
            .entry(record_type.to_string())
            .or_default()
            .insert(id.to_string());
    }

    pub fn entangled_updates(&self) -> HashMap<String, HashSet<String>> {
        self.entangled_updates.lock().unwrap().clone()
    }

    /// Accumulates affected-row counts per record type, and remembers the
    /// count from the most recent statement for single-statement results
    /// (e.g. an update's `recordsUpdated`).
    pub fn affected_rows(&self, record_type: &str, n: u64) {
        *self
            .affected_rows
            .lock()
            .unwrap()
            .entry(record_type.to_string())
            .or_insert(0) += n;
        self.last_affected.store(n, Ordering::Relaxed);
    }

    pub fn affected_rows_by_type(&self) -> HashMap<String, u64> {
        self.affected_rows.lock().unwrap().clone()
    }

    pub fn last_affected_rows(&self) -> u64 {
        self.last_affected.load(Ordering::Relaxed)
    }

    pub fn record_test_failure(&self, id: Value) {
        self.test_failed_ids.lock().unwrap().push(id);
    }

    pub fn test_failed_ids(&self) -> Vec<Value> {
        self.test_failed_ids.lock().unwrap().clone()
    }

    /// Replaces the fetch result with freshly hydrated records, preserving
    /// the anchor/query order they were assembled in.
    pub fn set_fetched_records(&self, records: Vec<Value>) {
        *self.fetched_records.lock().unwrap() = records;
    }

    pub fn fetched_records(&self) -> Vec<Value> {
        self.fetched_records.lock().unwrap().clone()
    }

    /// `getParamSql(ref)`: resolves and renders a single `?{ref}` reference
    /// to its SQL literal.
    pub fn get_param_sql(&self, raw_ref: &str) -> PlanResult<String> {
        substitute(&format!("?{{{raw_ref}}}"), self)
    }

    /// Resolves every `?{ref}` placeholder in a compiled SQL template.
    pub fn render(&self, template: &str) -> PlanResult<String> {
        substitute(template, self)
    }
}

impl ParamResolver for ExecutionContext {
    fn resolve_index(&self, idx: usize) -> PlanResult<ResolvedParam> {
        self.params
            .entry(idx)
            .map(|e| e.value.clone())
            .ok_or_else(|| PlanError::MissingParameter(idx.to_string()))
    }

    fn resolve_named(&self, name: &str) -> PlanResult<ResolvedParam> {
        self.generated_param(name)
            .map(ResolvedParam::Scalar)
            .ok_or_else(|| PlanError::MissingParameter(name.to_string()))
    }

    fn executed_on(&self) -> PlanResult<DateTime<Utc>> {
        Ok(self.executed_on)
    }

    fn actor(&self) -> PlanResult<Option<String>> {
        Ok(self.actor.clone())
    }
}
