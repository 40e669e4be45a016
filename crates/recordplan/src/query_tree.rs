//! Query-tree builder, translation context, and SELECT assembler glue
//! (spec §4.4/§4.5, components C4/C5).
//!
//! A [`QueryTree`] is derived from a [`PropertiesTree`]: one node per table
//! participation, arena-indexed like the properties tree, with a
//! [`TranslationContext`] mapping property paths to aliased column SQL.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{PlanError, PlanResult};
use crate::ident::Ident;
use crate::props_tree::PropertiesTree;
use crate::schema::{RecordTypeDescriptor, StorageShape, UsageFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    LeftOuter,
}

#[derive(Debug, Clone)]
pub struct SelectItem {
    pub sql: String,
    pub label: String,
}

/// One table participation in the join tree.
#[derive(Debug, Clone)]
pub struct QueryNode {
    pub table: String,
    pub alias: String,
    pub join_kind: JoinKind,
    /// SQL join condition; `None` for the root node (no join, it's the FROM).
    pub join_condition: Option<String>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub aggregated: bool,
    pub select_list: Vec<SelectItem>,
    pub group_by: Vec<String>,
    pub order_by: Vec<String>,
    /// A *proper* table is mutable/exclusively lockable; a *referred* table
    /// is a read-only join (reverse-references, or a child table joined
    /// only to test existence in WHERE).
    pub proper: bool,
    /// Properties-tree path this node was derived from; empty for root.
    pub path: String,
}

/// The derived join tree plus the property-path → column map that backs
/// [`TranslationContext`].
#[derive(Debug, Clone)]
pub struct QueryTree {
    pub root_type: String,
    arena: Vec<QueryNode>,
    columns: HashMap<String, (String, String)>,
}

impl QueryTree {
    pub const ROOT: usize = 0;

    pub fn node(&self, idx: usize) -> &QueryNode {
        &self.arena[idx]
    }

    pub fn children(&self, idx: usize) -> &[usize] {
        &self.arena[idx].children
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    /// Preorder visitor: node, then children left-to-right. The visitor
    /// receives the node index and its ancestor chain (root-first).
    pub fn walk(&self, mut visit: impl FnMut(usize, &QueryNode, &[usize])) {
        let mut ancestors = Vec::new();
        self.walk_from(Self::ROOT, &mut ancestors, &mut visit);
    }

    fn walk_from(
        &self,
        idx: usize,
        ancestors: &mut Vec<usize>,
        visit: &mut impl FnMut(usize, &QueryNode, &[usize]),
    ) {
        visit(idx, &self.arena[idx], ancestors);
        ancestors.push(idx);
        for &child in &self.arena[idx].children {
            self.walk_from(child, ancestors, visit);
        }
        ancestors.pop();
    }

    /// Postorder visitor: children before node — used by the delete planner
    /// to emit leaf-table DELETEs before root-table DELETEs.
    pub fn walk_reverse(&self, mut visit: impl FnMut(usize, &QueryNode, &[usize])) {
        let mut ancestors = Vec::new();
        self.walk_reverse_from(Self::ROOT, &mut ancestors, &mut visit);
    }

    fn walk_reverse_from(
        &self,
        idx: usize,
        ancestors: &mut Vec<usize>,
        visit: &mut impl FnMut(usize, &QueryNode, &[usize]),
    ) {
        ancestors.push(idx);
        for &child in &self.arena[idx].children {
            self.walk_reverse_from(child, ancestors, visit);
        }
        ancestors.pop();
        visit(idx, &self.arena[idx], ancestors);
    }

    pub fn translation_context(&self) -> TranslationContext<'_> {
        TranslationContext {
            columns: Cow::Borrowed(&self.columns),
            prefix: String::new(),
        }
    }

    pub fn tables_for_lock(&self, exclusive: bool) -> (Vec<String>, Vec<String>) {
        let mut exclusive_tables = Vec::new();
        let mut shared_tables = Vec::new();
        self.walk(|_, node, _| {
            if exclusive {
                if node.proper {
                    exclusive_tables.push(node.alias.clone());
                } else {
                    shared_tables.push(node.alias.clone());
                }
            } else {
                shared_tables.push(node.alias.clone());
            }
        });
        (exclusive_tables, shared_tables)
    }
}

/// Maps property paths to aliased column SQL for one query tree (or a
/// rebased sub-scope of one).
#[derive(Debug, Clone)]
pub struct TranslationContext<'a> {
    columns: Cow<'a, HashMap<String, (String, String)>>,
    prefix: String,
}

impl<'a> TranslationContext<'a> {
    /// Builds a standalone context over a freshly assembled column map, for
    /// a collection test's correlated subquery — which has its own alias
    /// and columns unrelated to the outer query tree's.
    pub fn from_columns(columns: HashMap<String, (String, String)>) -> TranslationContext<'static> {
        TranslationContext {
            columns: Cow::Owned(columns),
            prefix: String::new(),
        }
    }

    fn full_path(&self, path: &str) -> String {
        if self.prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}.{path}", self.prefix)
        }
    }

    pub fn get_prop_value_column(&self, path: &str) -> PlanResult<(&str, &str)> {
        let full = self.full_path(path);
        self.columns
            .get(&full)
            .map(|(alias, column)| (alias.as_str(), column.as_str()))
            .ok_or_else(|| PlanError::usage(format!("property path `{full}` is not part of this query")))
    }

    pub fn translate_prop_path(&self, path: &str) -> PlanResult<String> {
        let (alias, column) = self.get_prop_value_column(path)?;
        let sql = Ident::dotted(alias, column)?.to_sql();
        Ok(sql)
    }

    /// Returns a context scoped to paths under `prefix`, for compiling a
    /// collection test's sub-filter against the collection's own columns.
    pub fn rebase(&self, prefix: &str) -> TranslationContext<'a> {
        let full_prefix = self.full_path(prefix);
        TranslationContext {
            columns: self.columns.clone(),
            prefix: full_prefix,
        }
    }
}

struct Builder<'a> {
    arena: Vec<QueryNode>,
    columns: HashMap<String, (String, String)>,
    alias_seq: usize,
    desc: &'a RecordTypeDescriptor,
}

impl<'a> Builder<'a> {
    fn next_alias(&mut self) -> String {
        let alias = format!("t{}", self.alias_seq);
        self.alias_seq += 1;
        alias
    }

    fn new_node(
        &mut self,
        parent: usize,
        table: String,
        join_kind: JoinKind,
        join_condition: String,
        proper: bool,
        path: String,
    ) -> usize {
        let alias = self.next_alias();
        let idx = self.arena.len();
        self.arena.push(QueryNode {
            table,
            alias,
            join_kind,
            join_condition: Some(join_condition),
            parent: Some(parent),
            children: Vec::new(),
            aggregated: false,
            select_list: Vec::new(),
            group_by: Vec::new(),
            order_by: Vec::new(),
            proper,
            path,
        });
        self.arena[parent].children.push(idx);
        idx
    }

    fn visit(&mut self, table_node: usize, path_prefix: &str, props: &PropertiesTree, prop_idx: usize) -> PlanResult<()> {
        for &child in props.children(prop_idx) {
            let node = props.node(child);
            let Some(desc) = &node.descriptor else { continue };

            let path = if path_prefix.is_empty() {
                node.name.clone()
            } else {
                format!("{path_prefix}.{}", node.name)
            };

            match desc.storage_shape {
                StorageShape::InlineColumn | StorageShape::Calculated => {
                    let column = desc.column.clone().unwrap_or_else(|| node.name.clone());
                    let alias = self.arena[table_node].alias.clone();
                    self.columns.insert(path.clone(), (alias, column));
                    self.visit(table_node, &path, props, child)?;
                }
                StorageShape::View => {
                    let column = desc.column.clone().unwrap_or_else(|| node.name.clone());
                    let alias = self.arena[table_node].alias.clone();
                    self.columns.insert(path.clone(), (alias, column));
                }
                StorageShape::ChildTable | StorageShape::LinkTable => {
                    let layout = desc.child_table.as_ref().ok_or_else(|| {
                        PlanError::integrity(format!("property `{path}` has no child-table layout"))
                    })?;
                    let parent_alias = self.arena[table_node].alias.clone();
                    let parent_id = self
                        .desc
                        .id_descriptor()?
                        .column
                        .clone()
                        .unwrap_or_else(|| self.desc.id_property.clone());
                    let required = node.usage.intersects(
                        UsageFlags::WHERE | UsageFlags::DELETE | UsageFlags::UPDATE,
                    );
                    let join_kind = if required {
                        JoinKind::Inner
                    } else {
                        JoinKind::LeftOuter
                    };
                    let proper = required
                        || node
                            .usage
                            .intersects(UsageFlags::SELECT | UsageFlags::ORDER_BY);
                    let child_alias_placeholder = format!("t{}", self.alias_seq);
                    let condition = format!(
                        "{} = {}",
                        Ident::dotted(&child_alias_placeholder, &layout.parent_id_column)?.to_sql(),
                        Ident::dotted(&parent_alias, &parent_id)?.to_sql(),
                    );
                    let child_node = self.new_node(
                        table_node,
                        layout.table.clone(),
                        join_kind,
                        condition,
                        proper,
                        path.clone(),
                    );
                    if let Some(nested) = &desc.nested {
                        for prop in &nested.properties {
                            if let Some(col) = &prop.column {
                                self.columns.insert(
                                    format!("{path}.{}", prop.name),
                                    (self.arena[child_node].alias.clone(), col.clone()),
                                );
                            }
                        }
                    }
                    self.visit(child_node, &path, props, child)?;
                }
                StorageShape::ReverseReference => {
                    let layout = desc.child_table.as_ref().ok_or_else(|| {
                        PlanError::integrity(format!(
                            "reverse-reference property `{path}` has no join layout"
                        ))
                    })?;
                    let parent_alias = self.arena[table_node].alias.clone();
                    let parent_id = self
                        .desc
                        .id_descriptor()?
                        .column
                        .clone()
                        .unwrap_or_else(|| self.desc.id_property.clone());
                    let child_alias_placeholder = format!("t{}", self.alias_seq);
                    let condition = format!(
                        "{} = {}",
                        Ident::dotted(&child_alias_placeholder, &layout.parent_id_column)?.to_sql(),
                        Ident::dotted(&parent_alias, &parent_id)?.to_sql(),
                    );
                    let child_node = self.new_node(
                        table_node,
                        layout.table.clone(),
                        JoinKind::LeftOuter,
                        condition,
                        false,
                        path.clone(),
                    );
                    self.visit(child_node, &path, props, child)?;
                }
            }
        }
        Ok(())
    }
}

fn build_from_props(desc: &Arc<RecordTypeDescriptor>, props: &PropertiesTree) -> PlanResult<QueryTree> {
    let root_alias = "t0".to_string();
    let mut builder = Builder {
        arena: vec![QueryNode {
            table: desc.main_table.clone(),
            alias: root_alias,
            join_kind: JoinKind::Inner,
            join_condition: None,
            parent: None,
            children: Vec::new(),
            aggregated: false,
            select_list: Vec::new(),
            group_by: Vec::new(),
            order_by: Vec::new(),
            proper: true,
            path: String::new(),
        }],
        columns: HashMap::new(),
        alias_seq: 1,
        desc,
    };

    for prop in &desc.container.properties {
        if let Some(col) = &prop.column {
            builder.columns.insert(prop.name.clone(), ("t0".to_string(), col.clone()));
        }
    }

    builder.visit(QueryTree::ROOT, "", props, PropertiesTree::ROOT)?;

    Ok(QueryTree {
        root_type: desc.name.clone(),
        arena: builder.arena,
        columns: builder.columns,
    })
}

/// `forDirectQuery` — a single-SELECT plan over the properties tree.
pub fn for_direct_query(desc: &Arc<RecordTypeDescriptor>, props: &PropertiesTree) -> PlanResult<QueryTree> {
    build_from_props(desc, props)
}

/// `forIdsOnlyQuery` — builds just enough of the tree to select ids into an
/// anchor table (id column plus whatever WHERE/ORDER branches require).
pub fn for_ids_only_query(desc: &Arc<RecordTypeDescriptor>, props: &PropertiesTree) -> PlanResult<QueryTree> {
    build_from_props(desc, props)
}

/// `forAnchoredQuery` — joins a persisted anchor table as the root instead
/// of the record type's own main table; branch SELECTs use this to
/// re-derive full rows for the ids already staged by the ids-only query.
pub fn for_anchored_query(
    desc: &Arc<RecordTypeDescriptor>,
    props: &PropertiesTree,
    anchor_table: &str,
) -> PlanResult<QueryTree> {
    let mut tree = build_from_props(desc, props)?;
    let id_col = desc
        .id_descriptor()?
        .column
        .clone()
        .unwrap_or_else(|| desc.id_property.clone());
    let anchor_alias = "anchor".to_string();
    let condition = format!(
        "{} = {}",
        Ident::dotted(&anchor_alias, "id")?.to_sql(),
        Ident::dotted("t0", &id_col)?.to_sql(),
    );
    let anchor_idx = tree.arena.len();
    tree.arena.push(QueryNode {
        table: anchor_table.to_string(),
        alias: anchor_alias,
        join_kind: JoinKind::Inner,
        join_condition: Some(condition),
        parent: None,
        children: vec![QueryTree::ROOT],
        aggregated: false,
        select_list: Vec::new(),
        group_by: Vec::new(),
        order_by: vec!["ord".to_string()],
        proper: false,
        path: String::new(),
    });
    tree.arena[QueryTree::ROOT].parent = Some(anchor_idx);
    Ok(tree)
    // Note: `walk`/`walk_reverse` still traverse from the record type's own
    // root — the anchor node is consulted directly by the fetch/delete
    // planners for the FROM-clause prefix and join condition, not visited
    // through the normal tree walk.
}
