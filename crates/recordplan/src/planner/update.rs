//! Update planner (spec §4.12, component C12).
//!
//! Driven by a JSON-patch spec. Scope mirrors the delete planner: array and
//! map properties are only addressable one level below the record type's
//! own table, and an array/map element is replaced or removed as a whole
//! row rather than patched field-by-field — the patch never reaches inside
//! a child-table row.
//!
//! Phase 1 (here, at plan time) compiles the patch into typed steps and a
//! pre-update read. Phase 2 (spec's numbered steps) runs per matched record
//! inside a single [`ApplyPatchUpdate`] command: fetch, per-record test
//! gate, emit, accumulate — folded into one execute() rather than a
//! decomposed sub-chain, since the decision of *which* statements to emit
//! is only knowable once the pre-update read comes back.

use std::sync::Arc;

use json_patch::{Patch, PatchOperation};
use serde_json::Value;

use crate::command::{Command, NotifyRecordCollectionsMonitor};
use crate::error::{PlanError, PlanResult};
use crate::exec_context::ExecutionContext;
use crate::filter::{self};
use crate::ident::Ident;
use crate::monitor::RecordCollectionsMonitor;
use crate::params::{render_literal, ParamRegistry};
use crate::props_tree;
use crate::query_tree::{self, QueryTree};
use crate::schema::{ChildTableLayout, Clause, RecordTypeLibrary, StorageShape, ValueType};
use crate::select_assembler::SelectAssembler;

pub struct UpdatePlan {
    pub commands: Vec<Box<dyn Command>>,
    pub params: ParamRegistry,
}

#[derive(Debug, Clone)]
enum ScalarOp {
    Test(Value),
    Replace(Value),
}

#[derive(Debug, Clone)]
struct ScalarStep {
    column: String,
    op: ScalarOp,
}

#[derive(Debug, Clone)]
enum ChildOp {
    ReplaceAll(Vec<Value>),
    InsertAt { index: u64, value: Value },
    RemoveAt { index: u64 },
}

#[derive(Debug, Clone)]
struct ChildStep {
    layout: ChildTableLayout,
    value_type: ValueType,
    op: ChildOp,
}

pub fn build_update(
    library: &dyn RecordTypeLibrary,
    record_type: &str,
    patch_spec: &Value,
    filter_spec: Option<&Value>,
    monitor: Option<Arc<dyn RecordCollectionsMonitor>>,
) -> PlanResult<UpdatePlan> {
    let desc = library.get_record_type_desc(record_type)?;
    let id_col = desc
        .id_descriptor()?
        .column
        .clone()
        .unwrap_or_else(|| desc.id_property.clone());

    let patch: Patch = serde_json::from_value(patch_spec.clone())
        .map_err(|err| PlanError::usage(format!("invalid JSON patch: {err}")))?;

    let mut scalar_ops = Vec::new();
    let mut child_ops = Vec::new();
    let mut select_columns = vec![id_col.clone()];

    for op in patch.0 {
        let (path, op) = split_patch_operation(op)?;
        let segments = split_pointer(&path)?;
        let (&head, tail) = segments
            .split_first()
            .ok_or_else(|| PlanError::usage("patch path cannot be the document root"))?;

        let prop = desc
            .container
            .get(head)
            .ok_or_else(|| PlanError::usage(format!("unknown property `{head}` in patch path")))?;

        match prop.storage_shape {
            StorageShape::InlineColumn => {
                if !tail.is_empty() {
                    return Err(PlanError::usage(format!(
                        "`{head}` is a scalar column; patch path cannot continue past it"
                    )));
                }
                let column = prop.column.clone().unwrap_or_else(|| prop.name.clone());
                if !select_columns.contains(&column) {
                    select_columns.push(column.clone());
                }
                match op {
                    RawOp::Test(value) => scalar_ops.push(ScalarStep {
                        column,
                        op: ScalarOp::Test(value),
                    }),
                    RawOp::Replace(value) => scalar_ops.push(ScalarStep {
                        column,
                        op: ScalarOp::Replace(value),
                    }),
                    RawOp::Add(_) | RawOp::Remove => {
                        return Err(PlanError::usage(format!(
                            "`{head}` only supports test/replace, not add/remove"
                        )))
                    }
                }
            }
            StorageShape::ChildTable => {
                let layout = prop.child_table.clone().ok_or_else(|| {
                    PlanError::integrity(format!("property `{head}` has no child-table layout"))
                })?;
                if prop.nested.is_some()
                    && prop
                        .nested
                        .as_ref()
                        .unwrap()
                        .properties
                        .iter()
                        .any(|p| matches!(p.storage_shape, StorageShape::ChildTable | StorageShape::LinkTable))
                {
                    return Err(PlanError::usage(
                        "update does not support child tables nested more than one level deep",
                    ));
                }
                match (tail.split_first(), op) {
                    (None, RawOp::Replace(Value::Array(elements))) => {
                        child_ops.push(ChildStep {
                            layout,
                            value_type: prop.value_type.clone(),
                            op: ChildOp::ReplaceAll(elements),
                        });
                    }
                    (None, RawOp::Replace(_)) => {
                        return Err(PlanError::usage(format!(
                            "`{head}` is an array/map property; replace value must be an array"
                        )))
                    }
                    (Some((&idx_seg, rest)), RawOp::Add(value)) if rest.is_empty() => {
                        let index = parse_array_index(idx_seg)?;
                        child_ops.push(ChildStep {
                            layout,
                            value_type: prop.value_type.clone(),
                            op: ChildOp::InsertAt { index, value },
                        });
                    }
                    (Some((&idx_seg, rest)), RawOp::Remove) if rest.is_empty() => {
                        let index = parse_array_index(idx_seg)?;
                        child_ops.push(ChildStep {
                            layout,
                            value_type: prop.value_type.clone(),
                            op: ChildOp::RemoveAt { index },
                        });
                    }
                    _ => {
                        return Err(PlanError::usage(format!(
                            "unsupported patch operation on child table property `{head}`"
                        )))
                    }
                }
            }
            other => {
                return Err(PlanError::usage(format!(
                    "property `{head}` with storage shape {other:?} cannot be patched"
                )))
            }
        }
    }

    let patterns: Vec<&str> = vec![desc.id_property.as_str()];
    let mut params = ParamRegistry::new();
    let mut where_sql = None;
    let mut involved = props_tree::build(library, record_type, Clause::Where, &patterns)?;

    if let Some(spec) = filter_spec {
        let parsed = filter::parse_filter(spec, &desc)?;
        let paths = filter::join_paths(&parsed);
        let path_refs: Vec<&str> = paths.iter().map(String::as_str).collect();
        let filter_props = props_tree::build(library, record_type, Clause::Where, &path_refs)?;
        involved = props_tree::combine(&involved, &filter_props)?;
        let tree = query_tree::for_direct_query(&desc, &involved)?;
        where_sql = Some(filter::translate(&parsed, &tree.translation_context(), &mut params)?);
    }

    let tree = query_tree::for_direct_query(&desc, &involved)?;
    let assembler = SelectAssembler::new(&tree);
    let root_alias = tree.node(QueryTree::ROOT).alias.clone();
    let select_columns_sql = select_columns
        .iter()
        .map(|c| Ident::dotted(&root_alias, c).map(|i| i.to_sql()))
        .collect::<PlanResult<Vec<_>>>()?
        .join(", ");
    let mut select_sql_template = format!("SELECT {select_columns_sql} FROM {}", assembler.from_clause());
    if let Some(w) = &where_sql {
        if !w.is_empty() {
            select_sql_template.push_str(" WHERE ");
            select_sql_template.push_str(w);
        }
    }

    let meta = desc.meta_info.clone();
    let table_sql = Ident::parse(&desc.main_table)?.to_sql();

    let mut commands: Vec<Box<dyn Command>> = Vec::new();
    commands.push(Box::new(ApplyPatchUpdate {
        record_type: desc.name.clone(),
        table: table_sql,
        id_column: id_col,
        select_sql_template,
        scalar_ops,
        child_ops,
        version_column: meta.as_ref().and_then(|m| m.version.clone()),
        modification_timestamp_column: meta.as_ref().and_then(|m| m.modification_timestamp.clone()),
        modification_actor_column: meta.as_ref().and_then(|m| m.modification_actor.clone()),
    }));
    commands.push(Box::new(NotifyRecordCollectionsMonitor {
        monitor,
        primary_record_type: desc.name.clone(),
    }));

    Ok(UpdatePlan { commands, params })
}

enum RawOp {
    Test(Value),
    Replace(Value),
    Add(Value),
    Remove,
}

fn split_patch_operation(op: PatchOperation) -> PlanResult<(String, RawOp)> {
    Ok(match op {
        PatchOperation::Test(t) => (t.path, RawOp::Test(t.value)),
        PatchOperation::Replace(r) => (r.path, RawOp::Replace(r.value)),
        PatchOperation::Add(a) => (a.path, RawOp::Add(a.value)),
        PatchOperation::Remove(r) => (r.path, RawOp::Remove),
        PatchOperation::Move(_) | PatchOperation::Copy(_) => {
            return Err(PlanError::usage("move/copy patch operations are not supported"))
        }
    })
}

fn split_pointer(path: &str) -> PlanResult<Vec<String>> {
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| PlanError::usage(format!("patch path `{path}` must start with '/'")))?;
    if rest.is_empty() {
        return Ok(Vec::new());
    }
    Ok(rest
        .split('/')
        .map(|seg| seg.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn parse_array_index(segment: &str) -> PlanResult<u64> {
    segment
        .parse::<u64>()
        .map_err(|_| PlanError::usage("append (`-`) is not supported; patch with an explicit array index"))
}

/// Executes a compiled patch against every record the filter matches.
struct ApplyPatchUpdate {
    record_type: String,
    table: String,
    id_column: String,
    select_sql_template: String,
    scalar_ops: Vec<ScalarStep>,
    child_ops: Vec<ChildStep>,
    version_column: Option<String>,
    modification_timestamp_column: Option<String>,
    modification_actor_column: Option<String>,
}

#[async_trait::async_trait]
impl Command for ApplyPatchUpdate {
    async fn execute(&self, ctx: &ExecutionContext) -> PlanResult<()> {
        let select_sql = ctx.render(&self.select_sql_template)?;
        let rows = ctx.driver.execute_query(&select_sql).await?;
        let mut updated = 0u64;

        for row in rows {
            let id = row.get(&self.id_column).cloned().unwrap_or(Value::Null);

            let mut test_failed = false;
            for step in &self.scalar_ops {
                if let ScalarOp::Test(expected) = &step.op {
                    let actual = row.get(&step.column).cloned().unwrap_or(Value::Null);
                    if &actual != expected {
                        test_failed = true;
                        break;
                    }
                }
            }
            if test_failed {
                ctx.record_test_failure(id);
                continue;
            }

            let mut scalar_sets = Vec::new();
            for step in &self.scalar_ops {
                if let ScalarOp::Replace(value) = &step.op {
                    scalar_sets.push(format!("{} = {}", step.column, render_literal(value)?));
                }
            }

            let id_literal = render_literal(&id)?;
            let mut child_statements = Vec::new();
            for child in &self.child_ops {
                child_statements.extend(render_child_op(child, &id_literal)?);
            }

            if scalar_sets.is_empty() && child_statements.is_empty() {
                continue;
            }

            for stmt in &child_statements {
                ctx.driver.execute_update(stmt).await?;
            }

            if !scalar_sets.is_empty() || !child_statements.is_empty() {
                let mut sets = Vec::new();
                if let Some(version_col) = &self.version_column {
                    sets.push(format!("{0} = {0} + 1", version_col));
                }
                if let Some(ts_col) = &self.modification_timestamp_column {
                    sets.push(format!(
                        "{ts_col} = '{}'",
                        crate::params::format_datetime(&ctx.executed_on)
                    ));
                }
                if let Some(actor_col) = &self.modification_actor_column {
                    let actor_literal = match &ctx.actor {
                        Some(a) => format!("'{}'", a.replace('\'', "''")),
                        None => "NULL".to_string(),
                    };
                    sets.push(format!("{actor_col} = {actor_literal}"));
                }
                sets.extend(scalar_sets);

                // A child-only patch with no meta-info columns configured has
                // nothing left to SET on the root row.
                if !sets.is_empty() {
                    let sql = format!(
                        "UPDATE {} SET {} WHERE {} = {id_literal}",
                        self.table,
                        sets.join(", "),
                        self.id_column
                    );
                    ctx.driver.execute_update(&sql).await?;
                }
            }

            updated += 1;
        }

        ctx.affected_rows(&self.record_type, updated);
        Ok(())
    }
}

fn render_child_op(child: &ChildStep, parent_id_literal: &str) -> PlanResult<Vec<String>> {
    let table_sql = Ident::parse(&child.layout.table)?.to_sql();
    let parent_fk_sql = Ident::parse(&child.layout.parent_id_column)?.to_sql();
    let value_column = "value".to_string();

    let mut statements = Vec::new();
    match &child.op {
        ChildOp::ReplaceAll(elements) => {
            statements.push(format!("DELETE FROM {table_sql} WHERE {parent_fk_sql} IN ({parent_id_literal})"));
            for (idx, element) in elements.iter().enumerate() {
                statements.push(render_child_insert(child, parent_id_literal, idx as u64, element, &value_column)?);
            }
        }
        ChildOp::InsertAt { index, value } => {
            statements.push(render_child_insert(child, parent_id_literal, *index, value, &value_column)?);
        }
        ChildOp::RemoveAt { index } => {
            let index_col = child
                .layout
                .index_column
                .clone()
                .ok_or_else(|| PlanError::integrity("child table has no index column to remove by"))?;
            statements.push(format!(
                "DELETE FROM {table_sql} WHERE {parent_fk_sql} IN ({parent_id_literal}) AND {index_col} = {index}"
            ));
        }
    }
    Ok(statements)
}

fn render_child_insert(
    child: &ChildStep,
    parent_id_literal: &str,
    index: u64,
    element: &Value,
    value_column: &str,
) -> PlanResult<String> {
    let table_sql = Ident::parse(&child.layout.table)?.to_sql();
    let mut columns = vec![child.layout.parent_id_column.clone()];
    let mut values = vec![parent_id_literal.to_string()];

    if let Some(index_col) = &child.layout.index_column {
        columns.push(index_col.clone());
        values.push(index.to_string());
    }

    match (&child.value_type, element) {
        (ValueType::Object, Value::Object(map)) => {
            for (key, value) in map {
                columns.push(key.clone());
                values.push(render_literal(value)?);
            }
        }
        (ValueType::Object, _) => {
            return Err(PlanError::usage("array element must be an object for this child table"));
        }
        (_, scalar) => {
            columns.push(value_column.to_string());
            values.push(render_literal(scalar)?);
        }
    }

    Ok(format!(
        "INSERT INTO {table_sql} ({}) VALUES ({})",
        columns.join(", "),
        values.join(", ")
    ))
}
