//! SELECT assembler (spec §4.5, component C5).
//!
//! Assembles a SQL template (with `?{ref}` placeholders still unresolved)
//! from a [`QueryTree`] plus translated filter/order. Range application and
//! lock-clause wrapping are left to the driver, which is why this module
//! only ever returns a bare `SELECT ... FROM ... WHERE ... ORDER BY ...`
//! stump plus the pieces a driver needs to wrap it.

use crate::error::PlanResult;
use crate::filter::{Direction, OrderElement};
use crate::ident::Ident;
use crate::query_tree::{JoinKind, QueryTree};
use crate::value_expr::ValueExpr;

/// A compiled SELECT: the stump (no range/lock wrapping) plus the id
/// expression and lock-table partition a driver needs to finish the job.
pub struct SelectAssembler<'a> {
    tree: &'a QueryTree,
}

impl<'a> SelectAssembler<'a> {
    pub fn new(tree: &'a QueryTree) -> Self {
        Self { tree }
    }

    /// `toSql(stumpOnly)`: `stumpOnly=true` omits ORDER BY (anchor-forming
    /// queries want the anchor's own `ord` column for ordering instead).
    pub fn to_sql(
        &self,
        where_sql: Option<&str>,
        order: &[OrderElement],
        stump_only: bool,
    ) -> PlanResult<String> {
        let ctx = self.tree.translation_context();

        let mut select_list = Vec::new();
        self.tree.walk(|_, node, _| {
            for item in &node.select_list {
                select_list.push(item.sql.clone());
            }
        });
        if select_list.is_empty() {
            select_list.push(format!("{}.*", self.tree.node(QueryTree::ROOT).alias));
        }

        let mut sql = format!("SELECT {} FROM {}", select_list.join(", "), self.from_clause());

        if let Some(w) = where_sql {
            if !w.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(w);
            }
        }

        let group_by: Vec<String> = {
            let mut gb = Vec::new();
            self.tree.walk(|_, node, _| gb.extend(node.group_by.iter().cloned()));
            gb
        };
        if !group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&group_by.join(", "));
        }

        if !stump_only && !order.is_empty() {
            let mut seen = std::collections::HashSet::new();
            let mut fragments = Vec::new();
            for elem in order {
                let expr = ValueExpr::parse(&elem.expr)?;
                let sql_expr = expr.translate(&ctx)?;
                if seen.insert(sql_expr.clone()) {
                    let dir = match elem.direction {
                        Direction::Asc => "ASC",
                        Direction::Desc => "DESC",
                    };
                    fragments.push(format!("{sql_expr} {dir}"));
                }
            }
            if !fragments.is_empty() {
                sql.push_str(" ORDER BY ");
                sql.push_str(&fragments.join(", "));
            }
        }

        Ok(sql)
    }

    /// Exposed for the delete/update planners, which assemble their own
    /// `id IN (SELECT ...)` subqueries rather than a full SELECT.
    pub(crate) fn from_clause(&self) -> String {
        let root = self.tree.node(QueryTree::ROOT);
        let mut sql = format!(
            "{} {}",
            root.table,
            root.alias,
        );
        self.tree.walk(|idx, node, _| {
            if idx == QueryTree::ROOT {
                return;
            }
            let join_kw = match node.join_kind {
                JoinKind::Inner => "JOIN",
                JoinKind::LeftOuter => "LEFT OUTER JOIN",
            };
            let cond = node.join_condition.as_deref().unwrap_or("TRUE");
            sql.push_str(&format!(" {join_kw} {} {} ON {cond}", node.table, node.alias));
        });
        sql
    }

    /// `getIdValueExpr()`: the aliased id column of the root table.
    pub fn id_value_expr(&self, id_column: &str) -> PlanResult<String> {
        let root_alias = self.tree.node(QueryTree::ROOT).alias.clone();
        Ok(Ident::dotted(&root_alias, id_column)?.to_sql())
    }

    /// `getTablesForLock(lockType)`: partitions into exclusive/shared table
    /// alias sets.
    pub fn tables_for_lock(&self, exclusive: bool) -> (Vec<String>, Vec<String>) {
        self.tree.tables_for_lock(exclusive)
    }
}
