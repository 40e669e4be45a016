//! Client-visible DBO factory (spec §6 "Client-visible DBO factory").
//!
//! A [`Dbo`] is a thin façade over a [`crate::schema::RecordTypeLibrary`]
//! and an optional [`crate::monitor::RecordCollectionsMonitor`]; its
//! `build_*` methods compile a planner output into a re-executable,
//! immutable `*Dbo` value — "built once per plan, executed many times"
//! (spec §3 "Lifecycle").

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::command::{run_chain, Command};
use crate::driver::DbDriver;
use crate::error::PlanResult;
use crate::exec_context::{ExecutionContext, ExecutionOptions};
use crate::monitor::RecordCollectionsMonitor;
use crate::params::ParamRegistry;
use crate::planner::{build_delete, build_fetch, build_insert, build_update};
use crate::schema::RecordTypeLibrary;
use crate::transaction::TransactionHandle;

/// Where a DBO execution gets its transaction from.
enum TxMode {
    /// The DBO call creates and owns the transaction: it starts it, and
    /// commits or rolls it back depending on the outcome (spec §4.9, P6).
    Owned,
    /// An already-active transaction supplied by the caller; the DBO must
    /// never start/commit/roll it back (spec §4.9, P6).
    External(Arc<TransactionHandle>),
}

/// Runs a compiled command chain to completion, handling the owned- vs.
/// externally-managed-transaction split uniformly for every DBO kind.
async fn execute_chain(
    commands: &[Box<dyn Command>],
    driver: Arc<dyn DbDriver>,
    params: Arc<ParamRegistry>,
    actor: Option<String>,
    executed_on: DateTime<Utc>,
    tx_mode: TxMode,
) -> PlanResult<ExecutionContext> {
    let options = ExecutionOptions::default();
    let (ctx, owns_tx) = match tx_mode {
        TxMode::Owned => (
            ExecutionContext::owning(driver, actor, executed_on, params, options),
            true,
        ),
        TxMode::External(tx) => (
            ExecutionContext::externally_managed(driver, tx, actor, executed_on, params, options)?,
            false,
        ),
    };

    if owns_tx {
        ctx.transaction.start().await?;
    }

    match run_chain(commands, &ctx).await {
        Ok(()) => {
            if owns_tx {
                ctx.transaction.commit().await?;
            }
            Ok(ctx)
        }
        Err(err) => {
            if owns_tx && ctx.options.rollback_on_error {
                let _ = ctx.transaction.rollback().await;
            }
            Err(err)
        }
    }
}

/// `buildFetch(recordType, spec)`'s argument bundle: inclusion patterns
/// plus the optional filter/order/range specs (spec §4.13).
#[derive(Debug, Default, Clone)]
pub struct FetchSpec {
    pub properties: Vec<String>,
    pub filter: Option<Value>,
    pub order: Option<Vec<Value>>,
    pub range: Option<Value>,
}

pub struct FetchResult {
    pub records: Vec<Value>,
}

pub struct InsertResult {
    pub id: Value,
}

pub struct UpdateResult {
    pub records_updated: u64,
    pub test_failed: bool,
    pub failed_record_ids: Vec<Value>,
}

pub struct DeleteResult {
    pub records_deleted: HashMap<String, u64>,
}

/// A compiled, re-executable fetch DBO.
pub struct FetchDbo {
    commands: Vec<Box<dyn Command>>,
    params: Arc<ParamRegistry>,
}

impl FetchDbo {
    pub async fn execute(
        &self,
        driver: Arc<dyn DbDriver>,
        actor: Option<String>,
        executed_on: DateTime<Utc>,
    ) -> PlanResult<FetchResult> {
        let ctx = execute_chain(
            &self.commands,
            driver,
            self.params.clone(),
            actor,
            executed_on,
            TxMode::Owned,
        )
        .await?;
        Ok(FetchResult {
            records: ctx.fetched_records(),
        })
    }

    pub async fn execute_in_transaction(
        &self,
        driver: Arc<dyn DbDriver>,
        tx: Arc<TransactionHandle>,
        actor: Option<String>,
        executed_on: DateTime<Utc>,
    ) -> PlanResult<FetchResult> {
        let ctx = execute_chain(
            &self.commands,
            driver,
            self.params.clone(),
            actor,
            executed_on,
            TxMode::External(tx),
        )
        .await?;
        Ok(FetchResult {
            records: ctx.fetched_records(),
        })
    }
}

/// A compiled, re-executable insert DBO.
pub struct InsertDbo {
    commands: Vec<Box<dyn Command>>,
    params: Arc<ParamRegistry>,
    id_path: String,
}

impl InsertDbo {
    pub async fn execute(
        &self,
        driver: Arc<dyn DbDriver>,
        actor: Option<String>,
        executed_on: DateTime<Utc>,
    ) -> PlanResult<InsertResult> {
        let ctx = execute_chain(
            &self.commands,
            driver,
            self.params.clone(),
            actor,
            executed_on,
            TxMode::Owned,
        )
        .await?;
        self.result_from(&ctx)
    }

    pub async fn execute_in_transaction(
        &self,
        driver: Arc<dyn DbDriver>,
        tx: Arc<TransactionHandle>,
        actor: Option<String>,
        executed_on: DateTime<Utc>,
    ) -> PlanResult<InsertResult> {
        let ctx = execute_chain(
            &self.commands,
            driver,
            self.params.clone(),
            actor,
            executed_on,
            TxMode::External(tx),
        )
        .await?;
        self.result_from(&ctx)
    }

    fn result_from(&self, ctx: &ExecutionContext) -> PlanResult<InsertResult> {
        let id = ctx.generated_param(&self.id_path).ok_or_else(|| {
            crate::error::PlanError::integrity(format!(
                "insert DBO produced no id at `{}`",
                self.id_path
            ))
        })?;
        Ok(InsertResult { id })
    }
}

/// A compiled, re-executable update DBO.
pub struct UpdateDbo {
    commands: Vec<Box<dyn Command>>,
    params: Arc<ParamRegistry>,
}

impl UpdateDbo {
    pub async fn execute(
        &self,
        driver: Arc<dyn DbDriver>,
        actor: Option<String>,
        executed_on: DateTime<Utc>,
    ) -> PlanResult<UpdateResult> {
        let ctx = execute_chain(
            &self.commands,
            driver,
            self.params.clone(),
            actor,
            executed_on,
            TxMode::Owned,
        )
        .await?;
        Ok(Self::result_from(&ctx))
    }

    pub async fn execute_in_transaction(
        &self,
        driver: Arc<dyn DbDriver>,
        tx: Arc<TransactionHandle>,
        actor: Option<String>,
        executed_on: DateTime<Utc>,
    ) -> PlanResult<UpdateResult> {
        let ctx = execute_chain(
            &self.commands,
            driver,
            self.params.clone(),
            actor,
            executed_on,
            TxMode::External(tx),
        )
        .await?;
        Ok(Self::result_from(&ctx))
    }

    fn result_from(ctx: &ExecutionContext) -> UpdateResult {
        let failed_record_ids = ctx.test_failed_ids();
        UpdateResult {
            records_updated: ctx.affected_rows_by_type().into_values().sum(),
            test_failed: !failed_record_ids.is_empty(),
            failed_record_ids,
        }
    }
}

/// A compiled, re-executable delete DBO.
pub struct DeleteDbo {
    commands: Vec<Box<dyn Command>>,
    params: Arc<ParamRegistry>,
}

impl DeleteDbo {
    pub async fn execute(
        &self,
        driver: Arc<dyn DbDriver>,
        actor: Option<String>,
        executed_on: DateTime<Utc>,
    ) -> PlanResult<DeleteResult> {
        let ctx = execute_chain(
            &self.commands,
            driver,
            self.params.clone(),
            actor,
            executed_on,
            TxMode::Owned,
        )
        .await?;
        Ok(DeleteResult {
            records_deleted: ctx.affected_rows_by_type(),
        })
    }

    pub async fn execute_in_transaction(
        &self,
        driver: Arc<dyn DbDriver>,
        tx: Arc<TransactionHandle>,
        actor: Option<String>,
        executed_on: DateTime<Utc>,
    ) -> PlanResult<DeleteResult> {
        let ctx = execute_chain(
            &self.commands,
            driver,
            self.params.clone(),
            actor,
            executed_on,
            TxMode::External(tx),
        )
        .await?;
        Ok(DeleteResult {
            records_deleted: ctx.affected_rows_by_type(),
        })
    }
}

/// The client-visible DBO factory (spec §6). Holds the immutable record-type
/// library and the optional collections monitor every compiled DBO is
/// wired to notify.
pub struct Dbo {
    library: Arc<dyn RecordTypeLibrary>,
    monitor: Option<Arc<dyn RecordCollectionsMonitor>>,
}

impl Dbo {
    pub fn new(library: Arc<dyn RecordTypeLibrary>, monitor: Option<Arc<dyn RecordCollectionsMonitor>>) -> Self {
        Self { library, monitor }
    }

    pub fn build_fetch(&self, record_type: &str, spec: &FetchSpec) -> PlanResult<FetchDbo> {
        let patterns: Vec<&str> = spec.properties.iter().map(String::as_str).collect();
        let plan = build_fetch(
            self.library.as_ref(),
            record_type,
            &patterns,
            spec.filter.as_ref(),
            spec.order.as_deref(),
            spec.range.as_ref(),
        )?;
        Ok(FetchDbo {
            commands: plan.commands,
            params: Arc::new(plan.params),
        })
    }

    pub fn build_insert(&self, record_type: &str, record: &Value) -> PlanResult<InsertDbo> {
        let plan = build_insert(self.library.as_ref(), record_type, record, self.monitor.clone())?;
        Ok(InsertDbo {
            commands: plan.commands,
            params: Arc::new(plan.params),
            id_path: plan.id_path,
        })
    }

    pub fn build_update(
        &self,
        record_type: &str,
        patch: &Value,
        filter: Option<&Value>,
    ) -> PlanResult<UpdateDbo> {
        let plan = build_update(self.library.as_ref(), record_type, patch, filter, self.monitor.clone())?;
        Ok(UpdateDbo {
            commands: plan.commands,
            params: Arc::new(plan.params),
        })
    }

    pub fn build_delete(&self, record_type: &str, filter: Option<&Value>) -> PlanResult<DeleteDbo> {
        let plan = build_delete(self.library.as_ref(), record_type, filter, self.monitor.clone())?;
        Ok(DeleteDbo {
            commands: plan.commands,
            params: Arc::new(plan.params),
        })
    }

    /// `newTransaction(conn)`: an externally managed transaction a caller
    /// starts, passes to one or more DBO `execute_in_transaction` calls,
    /// and commits/rolls back itself.
    pub fn new_transaction(&self, driver: Arc<dyn DbDriver>) -> Arc<TransactionHandle> {
        Arc::new(TransactionHandle::new(driver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::InMemoryDriver;
    use crate::schema::{
        Generator, MetaInfoMapping, PropertyDescriptor, PropertyFlags, RecordContainer,
        RecordTypeDescriptor, StaticLibrary, StorageShape, StructuralKind, ValueType,
    };
    use std::sync::Arc as StdArc;

    fn scalar_prop(name: &str, value_type: ValueType, flags: PropertyFlags) -> PropertyDescriptor {
        PropertyDescriptor {
            name: name.to_string(),
            structural_kind: StructuralKind::Scalar,
            value_type,
            storage_shape: StorageShape::InlineColumn,
            generator: if flags.contains(PropertyFlags::ID) {
                Generator::Auto
            } else {
                Generator::None
            },
            flags,
            child_table: None,
            column: Some(name.to_string()),
            nested: None,
            subtypes: Vec::new(),
        }
    }

    fn product_library() -> StaticLibrary {
        let container = RecordContainer {
            properties: vec![
                scalar_prop("id", ValueType::Number, PropertyFlags::ID),
                scalar_prop("name", ValueType::String, PropertyFlags::empty()),
            ],
        };

        let desc = RecordTypeDescriptor {
            name: "Product".to_string(),
            main_table: "products".to_string(),
            id_property: "id".to_string(),
            container: StdArc::new(container),
            meta_info: Some(MetaInfoMapping {
                version: Some("version".to_string()),
                creation_timestamp: Some("creation_timestamp".to_string()),
                creation_actor: Some("creation_actor".to_string()),
                modification_timestamp: Some("modification_timestamp".to_string()),
                modification_actor: Some("modification_actor".to_string()),
            }),
            subtypes: Vec::new(),
            discriminator_property: None,
            super_container: None,
        };

        let mut lib = StaticLibrary::new();
        lib.register(desc);
        lib
    }

    #[tokio::test]
    async fn insert_dbo_reports_generated_id() {
        let lib: Arc<dyn RecordTypeLibrary> = Arc::new(product_library());
        let dbo = Dbo::new(lib, None);
        let insert = dbo
            .build_insert("Product", &serde_json::json!({"name": "Widget"}))
            .unwrap();
        let driver: Arc<dyn DbDriver> = Arc::new(InMemoryDriver::new());
        let result = insert
            .execute(driver, Some("user-1".to_string()), Utc::now())
            .await
            .unwrap();
        assert_eq!(result.id, serde_json::json!(1));
    }

    #[tokio::test]
    async fn delete_dbo_reports_rows_deleted_per_type() {
        let lib: Arc<dyn RecordTypeLibrary> = Arc::new(product_library());
        let dbo = Dbo::new(lib, None);
        let delete = dbo.build_delete("Product", None).unwrap();
        let driver: Arc<dyn DbDriver> = Arc::new(InMemoryDriver::new());
        let result = delete
            .execute(driver, Some("user-1".to_string()), Utc::now())
            .await
            .unwrap();
        assert_eq!(result.records_deleted.get("Product"), Some(&1));
    }
}
