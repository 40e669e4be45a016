//! Fetch planner (spec §4.13, component C13).
//!
//! A fetch's properties tree is examined for *collection branches* — direct
//! children whose storage shape is a child table, link table, or reverse
//! reference, which each introduce a one-to-many join. With at most one
//! branch, a single SELECT (left-joined against that one branch) covers the
//! whole record type, and duplicate rows sharing a root id are folded back
//! into one record with the branch's rows gathered into an array/map. With
//! more than one branch, a single combined SELECT would duplicate rows
//! across the cross product of the branches, so an ids-only SELECT stages
//! matching ids into a persisted anchor table, and one branch SELECT per
//! collection (plus one for the record's own scalar columns) is issued
//! against that anchor and reassembled by id.
//!
//! Range and order apply only to the anchor-forming (or, single-branch, the
//! direct) SELECT; branch SELECTs order by their own stable position column
//! so array/map reconstruction is deterministic regardless of issue order.
//! This module renders `LIMIT`/`OFFSET` straight into the SQL template
//! rather than through a separate driver hook, the same way every other
//! planner in this crate inlines SQL text rather than routing through extra
//! `DbDriver` methods.
//!
//! Scope note: like the delete/update planners, a collection branch nested
//! more than one level deep, or a polymorphic subtype selection, is rejected
//! at plan time rather than silently mishandled. A super-property path
//! (`.foo`) is supported for a single scalar; a path continuing past it
//! (the `.superAggregate` style of access) is explicitly under-specified
//! upstream and is also rejected.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::command::{Command, DropAnchorTable, LoadAnchorTable};
use crate::driver::Row;
use crate::error::{PlanError, PlanResult};
use crate::exec_context::ExecutionContext;
use crate::filter::{self, Direction, FilterTerm, OrderElement, Range};
use crate::ident::Ident;
use crate::params::ParamRegistry;
use crate::props_tree::{self, PropertiesTree};
use crate::query_tree::{self, JoinKind, QueryTree, TranslationContext};
use crate::schema::{
    Clause, PropertyDescriptor, RecordTypeDescriptor, RecordTypeLibrary, StorageShape,
    StructuralKind,
};
use crate::select_assembler::SelectAssembler;
use crate::value_expr::ValueExpr;

pub struct FetchPlan {
    pub commands: Vec<Box<dyn Command>>,
    pub params: ParamRegistry,
}

#[allow(clippy::too_many_arguments)]
pub fn build_fetch(
    library: &dyn RecordTypeLibrary,
    record_type: &str,
    inclusion_patterns: &[&str],
    filter_spec: Option<&Value>,
    order_spec: Option<&[Value]>,
    range_spec: Option<&Value>,
) -> PlanResult<FetchPlan> {
    let desc = library.get_record_type_desc(record_type)?;

    let mut select_patterns: Vec<&str> = vec![desc.id_property.as_str()];
    select_patterns.extend(inclusion_patterns.iter().copied());
    let select_props = props_tree::build(library, record_type, Clause::Select, &select_patterns)?;

    if contains_subtype_selector(&select_props, PropertiesTree::ROOT) {
        return Err(PlanError::usage("fetch does not support polymorphic subtype selection"));
    }
    for &idx in select_props.children(PropertiesTree::ROOT) {
        let node = select_props.node(idx);
        if node.is_super && !select_props.children(idx).is_empty() {
            return Err(PlanError::usage(
                "fetch does not support a path beyond a super-property scalar (a `.superAggregate`-style path is unsupported)",
            ));
        }
    }

    let mut params = ParamRegistry::new();
    let mut involved = select_props.clone();
    let mut term: Option<FilterTerm> = None;
    if let Some(spec) = filter_spec {
        let parsed = filter::parse_filter(spec, &desc)?;
        let paths = filter::join_paths(&parsed);
        let path_refs: Vec<&str> = paths.iter().map(String::as_str).collect();
        let filter_props = props_tree::build(library, record_type, Clause::Where, &path_refs)?;
        involved = props_tree::combine(&involved, &filter_props)?;
        term = Some(parsed);
    }

    let order = match order_spec {
        Some(spec) => filter::parse_order(spec)?,
        None => Vec::new(),
    };
    if !order.is_empty() {
        let order_patterns: Vec<&str> = order.iter().map(|o| o.expr.as_str()).collect();
        let order_props = props_tree::build(library, record_type, Clause::Order, &order_patterns)?;
        involved = props_tree::combine(&involved, &order_props)?;
    }

    let range = match range_spec {
        Some(spec) => Some(filter::parse_range(spec)?),
        None => None,
    };

    let id_col = desc
        .id_descriptor()?
        .column
        .clone()
        .unwrap_or_else(|| desc.id_property.clone());

    let collection_children: Vec<usize> = select_props
        .children(PropertiesTree::ROOT)
        .iter()
        .copied()
        .filter(|&idx| {
            select_props
                .node(idx)
                .descriptor
                .as_ref()
                .map(|d| is_collection_shape(d))
                .unwrap_or(false)
        })
        .collect();

    for &idx in &collection_children {
        let node = select_props.node(idx);
        if let Some(nested) = node.descriptor.as_ref().and_then(|d| d.nested.as_ref()) {
            if nested
                .properties
                .iter()
                .any(|p| matches!(p.storage_shape, StorageShape::ChildTable | StorageShape::LinkTable))
            {
                return Err(PlanError::usage(
                    "fetch does not support child tables nested more than one level deep",
                ));
            }
        }
    }

    let mut commands: Vec<Box<dyn Command>> = Vec::new();

    if collection_children.len() <= 1 {
        let tree = query_tree::for_direct_query(&desc, &involved)?;
        let where_sql = match &term {
            Some(t) => Some(filter::translate(t, &tree.translation_context(), &mut params)?),
            None => None,
        };
        let cmd = build_direct_fetch(
            &desc,
            &tree,
            &select_props,
            collection_children.first().copied(),
            where_sql.as_deref(),
            &order,
            range,
        )?;
        commands.push(Box::new(cmd));
    } else {
        build_anchored_fetch(
            library,
            &desc,
            &select_props,
            &collection_children,
            &id_col,
            &term,
            &order,
            range,
            &mut params,
            &mut commands,
        )?;
    }

    Ok(FetchPlan { commands, params })
}

fn is_collection_shape(d: &PropertyDescriptor) -> bool {
    matches!(
        d.storage_shape,
        StorageShape::ChildTable | StorageShape::LinkTable | StorageShape::ReverseReference
    ) && matches!(d.structural_kind, StructuralKind::Array | StructuralKind::Map)
}

fn contains_subtype_selector(props: &PropertiesTree, idx: usize) -> bool {
    props.children(idx).iter().any(|&child| {
        props.node(child).is_subtype_selector || contains_subtype_selector(props, child)
    })
}

/// A single selected column: its output JSON key and the SQL alias it was
/// given in the SELECT list.
struct SelectColumn {
    json_key: String,
    alias: String,
}

fn collect_subtree_patterns(props: &PropertiesTree, idx: usize, out: &mut Vec<String>) {
    let children = props.children(idx);
    if children.is_empty() {
        out.push(props.node(idx).path.clone());
        return;
    }
    for &child in children {
        collect_subtree_patterns(props, child, out);
    }
}

/// Every leaf pattern at or below the root, excluding the given child
/// indices (used to split off collection branches from scalar columns).
fn root_scalar_patterns(props: &PropertiesTree, exclude: &[usize]) -> Vec<String> {
    let mut out = Vec::new();
    for &idx in props.children(PropertiesTree::ROOT) {
        if exclude.contains(&idx) {
            continue;
        }
        collect_subtree_patterns(props, idx, &mut out);
    }
    out
}

fn build_select_columns(
    ctx: &TranslationContext,
    base_prefix: &str,
    paths: &[String],
    alias_start: usize,
) -> PlanResult<(Vec<SelectColumn>, Vec<String>)> {
    let mut columns = Vec::with_capacity(paths.len());
    let mut fragments = Vec::with_capacity(paths.len());
    for (i, path) in paths.iter().enumerate() {
        let alias = format!("c{}", alias_start + i);
        let sql_expr = ctx.translate_prop_path(path)?;
        let json_key = path
            .strip_prefix(base_prefix)
            .map(|s| s.trim_start_matches('.'))
            .filter(|s| !s.is_empty())
            .unwrap_or(path.as_str())
            .to_string();
        fragments.push(format!("{sql_expr} AS {alias}"));
        columns.push(SelectColumn { json_key, alias });
    }
    Ok((columns, fragments))
}

/// Columns for a collection branch's own element properties. A branch whose
/// elements have no nested container (a scalar array/map) has a single
/// implicit `value` column, following the same convention the insert/update
/// planners use for scalar child-table elements.
fn branch_value_columns(
    props: &PropertiesTree,
    branch_idx: usize,
    branch_path: &str,
    ctx: &TranslationContext,
    branch_alias_sql: &str,
    alias_start: usize,
) -> PlanResult<(Vec<SelectColumn>, Vec<String>)> {
    let node = props.node(branch_idx);
    let desc = node
        .descriptor
        .as_ref()
        .ok_or_else(|| PlanError::integrity("collection branch node has no descriptor"))?;

    if desc.nested.is_none() {
        let alias = format!("c{alias_start}");
        let sql_expr = Ident::dotted(branch_alias_sql, "value")?.to_sql();
        return Ok((
            vec![SelectColumn { json_key: "value".to_string(), alias: alias.clone() }],
            vec![format!("{sql_expr} AS {alias}")],
        ));
    }

    let mut patterns = Vec::new();
    collect_subtree_patterns(props, branch_idx, &mut patterns);
    build_select_columns(ctx, branch_path, &patterns, alias_start)
}

fn branch_position_column(desc: &PropertyDescriptor) -> PlanResult<(String, bool)> {
    let layout = desc.child_table.as_ref().ok_or_else(|| {
        PlanError::integrity(format!("property `{}` has no child-table layout", desc.name))
    })?;
    match desc.structural_kind {
        StructuralKind::Array => {
            let col = layout.index_column.clone().ok_or_else(|| {
                PlanError::integrity(format!("array property `{}` has no index column", desc.name))
            })?;
            Ok((col, false))
        }
        StructuralKind::Map => {
            let col = layout.key_column.clone().ok_or_else(|| {
                PlanError::integrity(format!("map property `{}` has no key column", desc.name))
            })?;
            Ok((col, true))
        }
        StructuralKind::Scalar => Err(PlanError::integrity(format!(
            "property `{}` is scalar, not a collection",
            desc.name
        ))),
    }
}

fn find_branch_alias(tree: &QueryTree, branch_path: &str) -> PlanResult<String> {
    tree.children(QueryTree::ROOT)
        .iter()
        .copied()
        .find(|&idx| tree.node(idx).path == branch_path)
        .map(|idx| tree.node(idx).alias.clone())
        .ok_or_else(|| PlanError::integrity(format!("query tree has no join for branch `{branch_path}`")))
}

fn branch_element_value(columns: &[SelectColumn], row: &Row) -> Value {
    if columns.len() == 1 && columns[0].json_key == "value" {
        return row.get(&columns[0].alias).cloned().unwrap_or(Value::Null);
    }
    let mut obj = Map::new();
    for col in columns {
        obj.insert(col.json_key.clone(), row.get(&col.alias).cloned().unwrap_or(Value::Null));
    }
    Value::Object(obj)
}

fn value_to_map_key(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Prefixes a branch's own join onto an anchored query tree's FROM clause —
/// the anchor is the tree's ROOT's parent, not a node `walk`/`from_clause`
/// visits, so it needs to be rendered explicitly.
fn anchored_from_clause(tree: &QueryTree) -> PlanResult<String> {
    let root = tree.node(QueryTree::ROOT);
    let anchor_idx = root
        .parent
        .ok_or_else(|| PlanError::integrity("anchored query tree is missing its anchor node"))?;
    let anchor = tree.node(anchor_idx);
    let cond = anchor
        .join_condition
        .as_deref()
        .ok_or_else(|| PlanError::integrity("anchor node has no join condition"))?;

    let mut sql = format!("{} {} JOIN {} {} ON {cond}", anchor.table, anchor.alias, root.table, root.alias);
    tree.walk(|idx, node, _| {
        if idx == QueryTree::ROOT {
            return;
        }
        let join_kw = match node.join_kind {
            JoinKind::Inner => "JOIN",
            JoinKind::LeftOuter => "LEFT OUTER JOIN",
        };
        let ncond = node.join_condition.as_deref().unwrap_or("TRUE");
        sql.push_str(&format!(" {join_kw} {} {} ON {ncond}", node.table, node.alias));
    });
    Ok(sql)
}

fn order_by_fragments(ctx: &TranslationContext, order: &[OrderElement]) -> PlanResult<Vec<String>> {
    let mut fragments = Vec::with_capacity(order.len());
    for elem in order {
        let sql_expr = ValueExpr::parse(&elem.expr)?.translate(ctx)?;
        let dir = match elem.direction {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        };
        fragments.push(format!("{sql_expr} {dir}"));
    }
    Ok(fragments)
}

// --- single-branch (direct) strategy -----------------------------------

struct DirectBranch {
    json_key: String,
    is_map: bool,
    position_alias: String,
    columns: Vec<SelectColumn>,
}

struct FetchDirect {
    select_sql_template: String,
    id_alias: String,
    root_columns: Vec<SelectColumn>,
    branch: Option<DirectBranch>,
}

fn build_direct_fetch(
    desc: &Arc<RecordTypeDescriptor>,
    tree: &QueryTree,
    select_props: &PropertiesTree,
    branch_idx: Option<usize>,
    where_sql: Option<&str>,
    order: &[OrderElement],
    range: Option<Range>,
) -> PlanResult<FetchDirect> {
    let ctx = tree.translation_context();

    let exclude: Vec<usize> = branch_idx.into_iter().collect();
    let root_patterns = root_scalar_patterns(select_props, &exclude);
    let (root_columns, mut fragments) = build_select_columns(&ctx, "", &root_patterns, 0)?;
    let id_alias = root_columns
        .iter()
        .find(|c| c.json_key == desc.id_property)
        .map(|c| c.alias.clone())
        .ok_or_else(|| PlanError::integrity("fetch must always select the id property"))?;

    let mut branch = None;
    let mut position_order: Option<String> = None;

    if let Some(idx) = branch_idx {
        let node = select_props.node(idx);
        let branch_desc = node
            .descriptor
            .as_ref()
            .ok_or_else(|| PlanError::integrity("collection branch node has no descriptor"))?;
        let branch_alias_sql = find_branch_alias(tree, &node.path)?;
        let (columns, branch_fragments) = branch_value_columns(
            select_props,
            idx,
            &node.path,
            &ctx,
            &branch_alias_sql,
            root_columns.len(),
        )?;
        fragments.extend(branch_fragments);

        let (position_col, is_map) = branch_position_column(branch_desc)?;
        let position_alias = format!("c{}", root_columns.len() + columns.len());
        let position_sql = Ident::dotted(&branch_alias_sql, &position_col)?.to_sql();
        fragments.push(format!("{position_sql} AS {position_alias}"));
        position_order = Some(format!("{position_sql} ASC"));

        branch = Some(DirectBranch {
            json_key: node.name.clone(),
            is_map,
            position_alias,
            columns,
        });
    }

    let assembler = SelectAssembler::new(tree);
    let mut sql = format!("SELECT {} FROM {}", fragments.join(", "), assembler.from_clause());
    if let Some(w) = where_sql {
        if !w.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(w);
        }
    }

    let mut order_fragments = order_by_fragments(&ctx, order)?;
    if let Some(pos) = position_order {
        order_fragments.push(pos);
    }
    if !order_fragments.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&order_fragments.join(", "));
    }
    if let Some(r) = range {
        sql.push_str(&format!(" LIMIT {} OFFSET {}", r.limit, r.offset));
    }

    Ok(FetchDirect {
        select_sql_template: sql,
        id_alias,
        root_columns,
        branch,
    })
}

#[async_trait]
impl Command for FetchDirect {
    async fn execute(&self, ctx: &ExecutionContext) -> PlanResult<()> {
        let sql = ctx.render(&self.select_sql_template)?;
        let rows = ctx.driver.execute_query(&sql).await?;

        let mut records: Vec<Value> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for row in rows {
            let id_value = row.get(&self.id_alias).cloned().unwrap_or(Value::Null);
            let id_key = id_value.to_string();
            let branch = &self.branch;
            let root_columns = &self.root_columns;
            let record_idx = *index.entry(id_key).or_insert_with(|| {
                let mut obj = Map::new();
                for col in root_columns {
                    obj.insert(col.json_key.clone(), row.get(&col.alias).cloned().unwrap_or(Value::Null));
                }
                if let Some(b) = branch {
                    obj.insert(
                        b.json_key.clone(),
                        if b.is_map { Value::Object(Map::new()) } else { Value::Array(Vec::new()) },
                    );
                }
                records.push(Value::Object(obj));
                records.len() - 1
            });

            if let Some(b) = &self.branch {
                let pos = row.get(&b.position_alias).cloned().unwrap_or(Value::Null);
                if !pos.is_null() {
                    let element = branch_element_value(&b.columns, &row);
                    if let Some(Value::Object(rec)) = records.get_mut(record_idx) {
                        match rec.get_mut(&b.json_key) {
                            Some(Value::Array(arr)) => arr.push(element),
                            Some(Value::Object(map)) => {
                                map.insert(value_to_map_key(&pos), element);
                            }
                            _ => {}
                        }
                    }
                }
            }
        }

        ctx.set_fetched_records(records);
        Ok(())
    }
}

// --- multi-branch (anchored) strategy ----------------------------------

struct FetchBranch {
    json_key: String,
    is_map: bool,
    select_sql_template: String,
    id_alias: String,
    /// `None` for the root-scalars branch, which never needs a map key.
    position_alias: Option<String>,
    columns: Vec<SelectColumn>,
}

struct FetchAnchored {
    branches: Vec<FetchBranch>,
}

#[async_trait]
impl Command for FetchAnchored {
    async fn execute(&self, ctx: &ExecutionContext) -> PlanResult<()> {
        let Some(root) = self.branches.first() else {
            return Ok(());
        };
        let sql = ctx.render(&root.select_sql_template)?;
        let rows = ctx.driver.execute_query(&sql).await?;

        let mut records: Vec<Value> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for row in rows {
            let id_value = row.get(&root.id_alias).cloned().unwrap_or(Value::Null);
            let mut obj = Map::new();
            for col in &root.columns {
                obj.insert(col.json_key.clone(), row.get(&col.alias).cloned().unwrap_or(Value::Null));
            }
            for branch in &self.branches[1..] {
                obj.insert(
                    branch.json_key.clone(),
                    if branch.is_map { Value::Object(Map::new()) } else { Value::Array(Vec::new()) },
                );
            }
            index.insert(id_value.to_string(), records.len());
            records.push(Value::Object(obj));
        }

        for branch in &self.branches[1..] {
            let sql = ctx.render(&branch.select_sql_template)?;
            let rows = ctx.driver.execute_query(&sql).await?;
            for row in rows {
                let id_value = row.get(&branch.id_alias).cloned().unwrap_or(Value::Null);
                let Some(&rec_idx) = index.get(&id_value.to_string()) else {
                    continue;
                };
                let element = branch_element_value(&branch.columns, &row);
                if let Some(Value::Object(rec)) = records.get_mut(rec_idx) {
                    match rec.get_mut(&branch.json_key) {
                        Some(Value::Array(arr)) => arr.push(element),
                        Some(Value::Object(map)) => {
                            let key_alias = branch
                                .position_alias
                                .as_ref()
                                .expect("collection branch carries a position column");
                            let key = row.get(key_alias).cloned().unwrap_or(Value::Null);
                            map.insert(value_to_map_key(&key), element);
                        }
                        _ => {}
                    }
                }
            }
        }

        ctx.set_fetched_records(records);
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn build_anchored_fetch(
    library: &dyn RecordTypeLibrary,
    desc: &Arc<RecordTypeDescriptor>,
    select_props: &PropertiesTree,
    collection_children: &[usize],
    id_col: &str,
    term: &Option<FilterTerm>,
    order: &[OrderElement],
    range: Option<Range>,
    params: &mut ParamRegistry,
    commands: &mut Vec<Box<dyn Command>>,
) -> PlanResult<()> {
    let anchor_table = format!("q_{}", desc.main_table);

    let mut id_props = props_tree::build(library, &desc.name, Clause::Select, &[desc.id_property.as_str()])?;
    if let Some(t) = term {
        let paths = filter::join_paths(t);
        let path_refs: Vec<&str> = paths.iter().map(String::as_str).collect();
        let filter_props = props_tree::build(library, &desc.name, Clause::Where, &path_refs)?;
        id_props = props_tree::combine(&id_props, &filter_props)?;
    }
    if !order.is_empty() {
        let order_patterns: Vec<&str> = order.iter().map(|o| o.expr.as_str()).collect();
        let order_props = props_tree::build(library, &desc.name, Clause::Order, &order_patterns)?;
        id_props = props_tree::combine(&id_props, &order_props)?;
    }
    let id_tree = query_tree::for_direct_query(desc, &id_props)?;
    let where_sql = match term {
        Some(t) => Some(filter::translate(t, &id_tree.translation_context(), params)?),
        None => None,
    };

    let assembler = SelectAssembler::new(&id_tree);
    let id_expr = assembler.id_value_expr(id_col)?;
    let mut select_stump = format!("SELECT {id_expr} FROM {}", assembler.from_clause());
    if let Some(w) = &where_sql {
        if !w.is_empty() {
            select_stump.push_str(" WHERE ");
            select_stump.push_str(w);
        }
    }
    let order_fragments = order_by_fragments(&id_tree.translation_context(), order)?;
    if !order_fragments.is_empty() {
        select_stump.push_str(" ORDER BY ");
        select_stump.push_str(&order_fragments.join(", "));
    }
    if let Some(r) = range {
        select_stump.push_str(&format!(" LIMIT {} OFFSET {}", r.limit, r.offset));
    }

    commands.push(Box::new(LoadAnchorTable {
        anchor_table: anchor_table.clone(),
        id_expr_template: id_expr,
        select_stump_template: select_stump,
    }));

    let mut branches = Vec::with_capacity(1 + collection_children.len());
    branches.push(build_root_scalars_branch(library, desc, select_props, collection_children, &anchor_table)?);
    for &idx in collection_children {
        branches.push(build_collection_branch(library, desc, select_props, idx, &anchor_table)?);
    }

    commands.push(Box::new(FetchAnchored { branches }));
    commands.push(Box::new(DropAnchorTable { anchor_table }));

    Ok(())
}

fn build_root_scalars_branch(
    library: &dyn RecordTypeLibrary,
    desc: &Arc<RecordTypeDescriptor>,
    select_props: &PropertiesTree,
    collection_children: &[usize],
    anchor_table: &str,
) -> PlanResult<FetchBranch> {
    let root_patterns = root_scalar_patterns(select_props, collection_children);
    let pattern_refs: Vec<&str> = root_patterns.iter().map(String::as_str).collect();
    let root_props = props_tree::build(library, &desc.name, Clause::Select, &pattern_refs)?;
    let tree = query_tree::for_anchored_query(desc, &root_props, anchor_table)?;
    let ctx = tree.translation_context();
    let (columns, fragments) = build_select_columns(&ctx, "", &root_patterns, 0)?;
    let id_alias = columns
        .iter()
        .find(|c| c.json_key == desc.id_property)
        .map(|c| c.alias.clone())
        .ok_or_else(|| PlanError::integrity("fetch must always select the id property"))?;

    let from = anchored_from_clause(&tree)?;
    let anchor_idx = tree
        .node(QueryTree::ROOT)
        .parent
        .ok_or_else(|| PlanError::integrity("anchored query tree is missing its anchor node"))?;
    let anchor_alias = tree.node(anchor_idx).alias.clone();
    let sql = format!("SELECT {} FROM {from} ORDER BY {anchor_alias}.ord ASC", fragments.join(", "));

    Ok(FetchBranch {
        json_key: String::new(),
        is_map: false,
        select_sql_template: sql,
        id_alias,
        position_alias: None,
        columns,
    })
}

fn build_collection_branch(
    library: &dyn RecordTypeLibrary,
    desc: &Arc<RecordTypeDescriptor>,
    select_props: &PropertiesTree,
    branch_idx: usize,
    anchor_table: &str,
) -> PlanResult<FetchBranch> {
    let node = select_props.node(branch_idx);
    let branch_desc = node
        .descriptor
        .as_ref()
        .ok_or_else(|| PlanError::integrity("collection branch node has no descriptor"))?;

    let mut patterns = vec![desc.id_property.clone()];
    collect_subtree_patterns(select_props, branch_idx, &mut patterns);
    let pattern_refs: Vec<&str> = patterns.iter().map(String::as_str).collect();
    let branch_props = props_tree::build(library, &desc.name, Clause::Select, &pattern_refs)?;
    let tree = query_tree::for_anchored_query(desc, &branch_props, anchor_table)?;
    let ctx = tree.translation_context();

    let branch_alias_sql = find_branch_alias(&tree, &node.path)?;
    let (columns, mut fragments) =
        branch_value_columns(select_props, branch_idx, &node.path, &ctx, &branch_alias_sql, 1)?;

    let id_sql = ctx.translate_prop_path(&desc.id_property)?;
    fragments.insert(0, format!("{id_sql} AS c0"));
    let id_alias = "c0".to_string();

    let (position_col, is_map) = branch_position_column(branch_desc)?;
    let position_alias = format!("c{}", columns.len() + 1);
    let position_sql = Ident::dotted(&branch_alias_sql, &position_col)?.to_sql();
    fragments.push(format!("{position_sql} AS {position_alias}"));

    let from = anchored_from_clause(&tree)?;
    let sql = format!("SELECT {} FROM {from} ORDER BY {position_sql} ASC", fragments.join(", "));

    Ok(FetchBranch {
        json_key: node.name.clone(),
        is_map,
        select_sql_template: sql,
        id_alias,
        position_alias: Some(position_alias),
        columns,
    })
}
