//! Command model (spec §4.7, component C7).
//!
//! Each command is a single step in a linear chain run against one
//! [`ExecutionContext`]: render its SQL template against the context,
//! issue it via the driver, fold the outcome back into the context, and
//! propagate errors by simply returning them — the chain itself is driven
//! by `?`-propagating `async` calls in sequence rather than a hand-rolled
//! future combinator, since Rust's own `async`/`await` already gives us
//! that.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{PlanError, PlanResult};
use crate::exec_context::ExecutionContext;
use crate::monitor::RecordCollectionsMonitor;
use crate::params::render_literal;
use crate::schema::IdGenerator;

/// A single unit of work in a DBO's emission order (spec §4.7).
#[async_trait]
pub trait Command: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext) -> PlanResult<()>;
}

/// Runs a command chain in emission order, stopping at the first error.
pub async fn run_chain(commands: &[Box<dyn Command>], ctx: &ExecutionContext) -> PlanResult<()> {
    for command in commands {
        command.execute(ctx).await?;
    }
    Ok(())
}

/// A plain statement with an optional record-type tag for affected-rows
/// accounting.
pub struct ExecuteStatement {
    pub sql_template: String,
    pub stmt_id: String,
    pub record_type: Option<String>,
}

#[async_trait]
impl Command for ExecuteStatement {
    async fn execute(&self, ctx: &ExecutionContext) -> PlanResult<()> {
        let sql = ctx.render(&self.sql_template)?;
        let n = ctx.driver.execute_update(&sql).await?;
        if let Some(rt) = &self.record_type {
            ctx.affected_rows(rt, n);
        }
        Ok(())
    }
}

pub struct LoadAnchorTable {
    pub anchor_table: String,
    pub id_expr_template: String,
    pub select_stump_template: String,
}

#[async_trait]
impl Command for LoadAnchorTable {
    async fn execute(&self, ctx: &ExecutionContext) -> PlanResult<()> {
        let id_expr = ctx.render(&self.id_expr_template)?;
        let stump = ctx.render(&self.select_stump_template)?;
        ctx.driver
            .select_into_anchor_table(&self.anchor_table, &id_expr, &stump)
            .await
    }
}

pub struct DropAnchorTable {
    pub anchor_table: String,
}

#[async_trait]
impl Command for DropAnchorTable {
    async fn execute(&self, ctx: &ExecutionContext) -> PlanResult<()> {
        ctx.driver.drop_anchor_table(&self.anchor_table).await
    }
}

/// Calls a user-supplied generator function and stores the result as a
/// generated param at the property's path.
pub struct Generator {
    pub property_path: String,
    pub generator: Arc<dyn IdGenerator>,
    pub record_snapshot: Value,
}

#[async_trait]
impl Command for Generator {
    async fn execute(&self, ctx: &ExecutionContext) -> PlanResult<()> {
        let value = self
            .generator
            .generate(&self.record_snapshot)
            .await
            .map_err(|err| wrap_with_path(&self.property_path, err))?;
        ctx.add_generated_param(self.property_path.clone(), value);
        Ok(())
    }
}

fn wrap_with_path(path: &str, err: PlanError) -> PlanError {
    match err {
        PlanError::Usage(msg) => PlanError::Usage(format!("generator for `{path}`: {msg}")),
        PlanError::Validation(msg) => PlanError::Validation(format!("generator for `{path}`: {msg}")),
        PlanError::Integrity(msg) => PlanError::Integrity(format!("generator for `{path}`: {msg}")),
        other => other,
    }
}

/// Promotes a client-provided id into generated params.
pub struct AssignedId {
    pub property_path: String,
    pub value: Value,
}

#[async_trait]
impl Command for AssignedId {
    async fn execute(&self, ctx: &ExecutionContext) -> PlanResult<()> {
        ctx.add_generated_param(self.property_path.clone(), self.value.clone());
        Ok(())
    }
}

/// An INSERT, optionally returning a driver-generated id.
pub struct Insert {
    pub table: String,
    pub columns: Vec<String>,
    /// One `?{ref}`-carrying SQL value expression per column.
    pub value_templates: Vec<String>,
    pub generated_id_column: Option<String>,
    pub target_property_path: Option<String>,
    pub record_type: Option<String>,
}

#[async_trait]
impl Command for Insert {
    async fn execute(&self, ctx: &ExecutionContext) -> PlanResult<()> {
        let mut values = Vec::with_capacity(self.value_templates.len());
        for template in &self.value_templates {
            values.push(ctx.render(template)?);
        }
        let columns_sql = self.columns.join(", ");
        let values_sql = values.join(", ");

        match &self.generated_id_column {
            Some(id_col) => {
                let sql = if self.columns.is_empty() {
                    format!("INSERT INTO {}() VALUES () RETURNING {id_col}", self.table)
                } else {
                    format!(
                        "INSERT INTO {} ({columns_sql}) VALUES ({values_sql}) RETURNING {id_col}",
                        self.table
                    )
                };
                let generated = ctx.driver.execute_insert(&sql, id_col).await?;
                if let Some(path) = &self.target_property_path {
                    ctx.add_generated_param(path.clone(), generated);
                }
                if let Some(rt) = &self.record_type {
                    ctx.affected_rows(rt, 1);
                }
            }
            None => {
                let sql = if self.columns.is_empty() {
                    format!("INSERT INTO {}() VALUES ()", self.table)
                } else {
                    format!("INSERT INTO {} ({columns_sql}) VALUES ({values_sql})", self.table)
                };
                let n = ctx.driver.execute_update(&sql).await?;
                if let Some(rt) = &self.record_type {
                    ctx.affected_rows(rt, n);
                }
            }
        }
        Ok(())
    }
}

/// A record type reachable through an entangled reference, whose
/// meta-info must be bumped when it is touched.
pub struct EntangledTypeTarget {
    pub record_type: String,
    pub table: String,
    pub id_column: String,
    pub version_column: String,
    pub modification_timestamp_column: String,
    pub modification_actor_column: Option<String>,
}

/// Emits one UPDATE per entangled type that was actually touched during
/// this execution (spec §4.7/S6).
pub struct UpdateEntangledRecords {
    pub targets: Vec<EntangledTypeTarget>,
}

#[async_trait]
impl Command for UpdateEntangledRecords {
    async fn execute(&self, ctx: &ExecutionContext) -> PlanResult<()> {
        let touched = ctx.entangled_updates();
        for target in &self.targets {
            let Some(ids) = touched.get(&target.record_type) else {
                continue;
            };
            if ids.is_empty() {
                continue;
            }
            let id_literals: PlanResult<Vec<String>> = ids
                .iter()
                .map(|raw| {
                    let value: Value = serde_json::from_str(raw)
                        .map_err(|_| PlanError::integrity(format!("malformed entangled id `{raw}`")))?;
                    render_literal(&value)
                })
                .collect();
            let id_literals = id_literals?;

            let mut sets = vec![format!(
                "{0} = {0} + 1",
                target.version_column
            )];
            sets.push(format!(
                "{} = '{}'",
                target.modification_timestamp_column,
                crate::params::format_datetime(&ctx.executed_on)
            ));
            if let Some(actor_col) = &target.modification_actor_column {
                let actor_literal = match &ctx.actor {
                    Some(a) => format!("'{}'", a.replace('\'', "''")),
                    None => "NULL".to_string(),
                };
                sets.push(format!("{actor_col} = {actor_literal}"));
            }

            let sql = format!(
                "UPDATE {} SET {} WHERE {} IN ({})",
                target.table,
                sets.join(", "),
                target.id_column,
                id_literals.join(", ")
            );
            let n = ctx.driver.execute_update(&sql).await?;
            ctx.affected_rows(&target.record_type, n);
        }
        Ok(())
    }
}

/// External boundary; no-op if no monitor is configured.
pub struct NotifyRecordCollectionsMonitor {
    pub monitor: Option<Arc<dyn RecordCollectionsMonitor>>,
    pub primary_record_type: String,
}

#[async_trait]
impl Command for NotifyRecordCollectionsMonitor {
    async fn execute(&self, ctx: &ExecutionContext) -> PlanResult<()> {
        let Some(monitor) = &self.monitor else {
            return Ok(());
        };
        let mut touched: HashSet<String> = ctx.entangled_updates().into_keys().collect();
        touched.insert(self.primary_record_type.clone());
        monitor.collections_updated(&touched).await
    }
}
