//! Filter/order/range builder (spec §4.3, component C3).
//!
//! Filter specs are arrays whose first element is a predicate string and
//! whose remainder are arguments, e.g. `["status|eq", "cancelled"]` or
//! `[":and", ["a|eq", 1], ["b|gt", 2]]`. This module turns them into a
//! [`FilterTerm`] tree, validating operator arity along the way.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{PlanError, PlanResult};
use crate::ident::Ident;
use crate::params::ParamRegistry;
use crate::query_tree::TranslationContext;
use crate::schema::{
    Generator, PropertyDescriptor, PropertyFlags, RecordContainer, RecordTypeDescriptor,
    StorageShape, StructuralKind,
};
use crate::value_expr::ValueFn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JunctionKind {
    And,
    Or,
    /// `:any` — at least one child of a collection sub-filter matches.
    Any,
    /// `:none` — no child matches.
    None,
    /// `:all` — every child matches.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOp {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
    In,
    Between,
    Contains,
    ContainsI,
    Prefix,
    PrefixI,
    Matches,
    MatchesI,
    Empty,
}

impl TestOp {
    fn canonicalize(raw: &str) -> Option<Self> {
        Some(match raw {
            "eq" => TestOp::Eq,
            "ne" => TestOp::Ne,
            "ge" | "min" => TestOp::Ge,
            "le" | "max" => TestOp::Le,
            "gt" => TestOp::Gt,
            "lt" => TestOp::Lt,
            "in" => TestOp::In,
            "between" | "rng" => TestOp::Between,
            "contains" => TestOp::Contains,
            "containsi" | "sub" => TestOp::ContainsI,
            "prefix" => TestOp::Prefix,
            "prefixi" | "pre" => TestOp::PrefixI,
            "matches" => TestOp::Matches,
            "matchesi" | "re" => TestOp::MatchesI,
            "empty" => TestOp::Empty,
            _ => return None,
        })
    }

    /// Folds `(base op, inverted)` into a canonical op with a (possibly
    /// cleared) inverted flag, per spec's `!eq == ne`-style aliases.
    fn fold_inversion(self, inverted: bool) -> (Self, bool) {
        if !inverted {
            return (self, false);
        }
        match self {
            TestOp::Eq => (TestOp::Ne, false),
            TestOp::Ne => (TestOp::Eq, false),
            TestOp::Lt => (TestOp::Ge, false),
            TestOp::Ge => (TestOp::Lt, false),
            TestOp::Le => (TestOp::Gt, false),
            TestOp::Gt => (TestOp::Le, false),
            other => (other, true),
        }
    }

    fn arity(self) -> Arity {
        match self {
            TestOp::Eq
            | TestOp::Ne
            | TestOp::Lt
            | TestOp::Le
            | TestOp::Gt
            | TestOp::Ge
            | TestOp::Contains
            | TestOp::ContainsI
            | TestOp::Prefix
            | TestOp::PrefixI
            | TestOp::Matches
            | TestOp::MatchesI => Arity::Single,
            TestOp::Between => Arity::Pair,
            TestOp::In => Arity::List,
            TestOp::Empty => Arity::Zero,
        }
    }
}

enum Arity {
    Single,
    Pair,
    List,
    Zero,
}

/// A filter term (spec §3 "Filter term" sum type).
#[derive(Debug, Clone)]
pub enum FilterTerm {
    Junction {
        kind: JunctionKind,
        inverted: bool,
        children: Vec<FilterTerm>,
    },
    SingleProp {
        path: String,
        value_fn: ValueFn,
        op: TestOp,
        inverted: bool,
        params: Vec<Value>,
    },
    CollectionTest {
        path: String,
        inverted: bool,
        /// The child/link table the collection's rows live in.
        child_table: String,
        /// Column in that table holding the parent row's id.
        parent_id_column: String,
        /// Property path of the parent row's own id, resolved against
        /// whatever translation context the collection test is compiled in.
        outer_id_property: String,
        /// The collection element's own properties, used to resolve the
        /// sub-filter's paths: the nested container for object elements, or
        /// a synthesized single-property container for scalar/ref elements.
        element: Arc<RecordContainer>,
        sub_filter: Option<Box<FilterTerm>>,
    },
}

/// Every property path a filter term references, collection sub-filter
/// paths rebased under the collection's own path.
pub fn referenced_paths(term: &FilterTerm) -> Vec<String> {
    match term {
        FilterTerm::Junction { children, .. } => children.iter().flat_map(referenced_paths).collect(),
        FilterTerm::SingleProp { path, .. } => vec![path.clone()],
        FilterTerm::CollectionTest { path, sub_filter, .. } => {
            let mut out = vec![path.clone()];
            if let Some(sub) = sub_filter {
                out.extend(
                    referenced_paths(sub)
                        .into_iter()
                        .map(|p| format!("{path}.{p}")),
                );
            }
            out
        }
    }
}

/// Property paths that need merging into the query tree's own properties
/// tree so `translate` can resolve them against a join. A collection test's
/// path is deliberately excluded: it compiles to a self-contained correlated
/// subquery (see `translate`), never a join, so folding it into the outer
/// properties tree would only risk an unwanted join-induced row duplication.
pub fn join_paths(term: &FilterTerm) -> Vec<String> {
    match term {
        FilterTerm::Junction { children, .. } => children.iter().flat_map(join_paths).collect(),
        FilterTerm::SingleProp { path, .. } => vec![path.clone()],
        FilterTerm::CollectionTest { .. } => Vec::new(),
    }
}

pub fn parse_filter(spec: &Value, desc: &RecordTypeDescriptor) -> PlanResult<FilterTerm> {
    parse_filter_inner(spec, desc, &desc.container, true)
}

fn parse_filter_inner(
    spec: &Value,
    desc: &RecordTypeDescriptor,
    container: &RecordContainer,
    allow_collection: bool,
) -> PlanResult<FilterTerm> {
    let arr = spec
        .as_array()
        .ok_or_else(|| PlanError::usage("filter spec must be an array"))?;
    let (head, args) = arr
        .split_first()
        .ok_or_else(|| PlanError::usage("filter spec array cannot be empty"))?;
    let predicate = head
        .as_str()
        .ok_or_else(|| PlanError::usage("filter predicate must be a string"))?;

    if let Some(junction) = parse_junction(predicate) {
        let (kind, inverted) = junction;
        let mut children = Vec::with_capacity(args.len());
        for child_spec in args {
            children.push(parse_filter_inner(child_spec, desc, container, allow_collection)?);
        }
        return Ok(FilterTerm::Junction {
            kind,
            inverted,
            children,
        });
    }

    parse_property_test(predicate, args, desc, container, allow_collection)
}

fn parse_junction(predicate: &str) -> Option<(JunctionKind, bool)> {
    let (inverted, rest) = match predicate.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, predicate),
    };
    let kind = match rest {
        ":and" => JunctionKind::And,
        ":or" => JunctionKind::Or,
        ":any" => JunctionKind::Any,
        ":none" => JunctionKind::None,
        ":all" => JunctionKind::All,
        _ => return None,
    };
    Some((kind, inverted))
}

fn parse_property_test(
    predicate: &str,
    args: &[Value],
    desc: &RecordTypeDescriptor,
    container: &RecordContainer,
    allow_collection: bool,
) -> PlanResult<FilterTerm> {
    let mut stages = predicate.split('|').map(str::trim);
    let path = stages
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PlanError::usage(format!("filter predicate `{predicate}` has no property path")))?
        .to_string();

    let stage2 = stages.next();
    let stage3 = stages.next();
    if stages.next().is_some() {
        return Err(PlanError::usage(format!(
            "filter predicate `{predicate}` has too many pipe stages"
        )));
    }

    let prop = resolve_path(container, &path)?;

    if prop.structural_kind != StructuralKind::Scalar {
        if path.contains('.') {
            return Err(PlanError::usage(format!(
                "collection test `{path}` must name a direct property; a collection reachable only through another property is not supported"
            )));
        }
        if !allow_collection {
            return Err(PlanError::usage(format!(
                "`{path}` is a collection; collection tests cannot nest inside another collection test's sub-filter"
            )));
        }
        if stage3.is_some() {
            return Err(PlanError::usage(format!(
                "collection test `{predicate}` does not take a value function"
            )));
        }
        let op_stage = stage2.ok_or_else(|| {
            PlanError::usage(format!("filter predicate `{predicate}` has no test operator"))
        })?;
        let (raw_op, inverted) = match op_stage.strip_prefix('!') {
            Some(rest) => (rest, true),
            None => (op_stage, false),
        };
        if TestOp::canonicalize(raw_op) != Some(TestOp::Empty) {
            return Err(PlanError::usage(format!(
                "collection test `{predicate}` only supports empty/!empty"
            )));
        }
        if args.len() > 1 {
            return Err(PlanError::usage(format!(
                "collection test `{predicate}` takes at most one sub-filter argument"
            )));
        }
        return parse_collection_test(desc, prop, &path, inverted, args.first());
    }

    let (value_fn_stage, op_stage) = match stage3 {
        Some(op) => (stage2, op),
        None => (
            None,
            stage2.ok_or_else(|| {
                PlanError::usage(format!("filter predicate `{predicate}` has no test operator"))
            })?,
        ),
    };

    let value_fn = match value_fn_stage {
        Some(vf) => parse_value_fn(vf)?,
        None => ValueFn::Val,
    };

    let (raw_op, inverted) = match op_stage.strip_prefix('!') {
        Some(rest) => (rest, true),
        None => (op_stage, false),
    };
    let base_op = TestOp::canonicalize(raw_op)
        .ok_or_else(|| PlanError::usage(format!("unknown test operator `{op_stage}`")))?;
    let (op, inverted) = base_op.fold_inversion(inverted);

    validate_arity(predicate, op, args)?;
    let params = normalize_args(op, args);

    Ok(FilterTerm::SingleProp {
        path,
        value_fn,
        op,
        inverted,
        params,
    })
}

fn parse_value_fn(stage: &str) -> PlanResult<ValueFn> {
    let (name, args) = match stage.find('(') {
        Some(idx) => {
            let rest = &stage[idx + 1..];
            let args = rest
                .strip_suffix(')')
                .ok_or_else(|| PlanError::usage(format!("unterminated value function `{stage}`")))?;
            (&stage[..idx], args)
        }
        None => (stage, ""),
    };
    crate::value_expr::ValueExpr::parse(&format!("_ | {name}({args})"))
        .map(|e| e.func().clone())
        .map_err(|_| PlanError::usage(format!("unknown value function `{name}`")))
}

fn validate_arity(predicate: &str, op: TestOp, args: &[Value]) -> PlanResult<()> {
    match op.arity() {
        Arity::Zero => {
            if !args.is_empty() {
                return Err(PlanError::usage(format!(
                    "`{predicate}` takes no arguments"
                )));
            }
        }
        Arity::Single => {
            if args.len() != 1 || args[0].is_array() {
                return Err(PlanError::usage(format!(
                    "`{predicate}` takes exactly one scalar argument"
                )));
            }
        }
        Arity::Pair => {
            let ok = match args {
                [a, b] => !a.is_array() && !b.is_array(),
                [Value::Array(list)] => list.len() == 2,
                _ => false,
            };
            if !ok {
                return Err(PlanError::usage(format!(
                    "`{predicate}` takes two scalars or a 2-element list"
                )));
            }
        }
        Arity::List => {
            let flat = flatten_list(args);
            if flat.is_empty() {
                return Err(PlanError::usage(format!(
                    "`{predicate}` needs at least one value"
                )));
            }
            if flat.iter().any(Value::is_null) {
                return Err(PlanError::usage(format!("`{predicate}` cannot contain null")));
            }
        }
    }
    Ok(())
}

/// Normalizes validated arguments into their canonical stored shape:
/// `in` flattens to a single list, `between` unwraps a 2-element list into
/// two scalars.
fn normalize_args(op: TestOp, args: &[Value]) -> Vec<Value> {
    match op.arity() {
        Arity::List => flatten_list(args),
        Arity::Pair => match args {
            [Value::Array(list)] => list.clone(),
            _ => args.to_vec(),
        },
        _ => args.to_vec(),
    }
}

fn flatten_list(args: &[Value]) -> Vec<Value> {
    let mut out = Vec::new();
    for v in args {
        match v {
            Value::Array(items) => out.extend(flatten_list(items)),
            other => out.push(other.clone()),
        }
    }
    out
}

/// Resolves a dotted property path against a container, requiring every
/// intermediate segment to be a scalar object (the same rule the
/// properties-tree builder enforces for WHERE/ORDER paths) while leaving the
/// terminal property's own structural kind unconstrained — callers decide
/// whether a scalar or a collection terminus is acceptable.
fn resolve_path<'c>(container: &'c RecordContainer, path: &str) -> PlanResult<&'c PropertyDescriptor> {
    let mut current = container;
    let mut segments = path.split('.').peekable();
    loop {
        let seg = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PlanError::usage(format!("empty property path segment in `{path}`")))?;
        let prop = current
            .get(seg)
            .ok_or_else(|| PlanError::usage(format!("unknown property `{seg}` in path `{path}`")))?;
        if segments.peek().is_none() {
            return Ok(prop);
        }
        if !prop.is_scalar_intermediate_ok() {
            return Err(PlanError::usage(format!(
                "`{seg}` is not scalar; `{path}` cannot traverse through it"
            )));
        }
        current = prop.nested.as_deref().ok_or_else(|| {
            PlanError::usage(format!("`{seg}` has no nested properties to continue path into"))
        })?;
    }
}

/// Parses a collection test: `path` is non-scalar, accepts only
/// empty/!empty plus an optional sub-filter array that builds a recursive
/// sub-query over the collection's own element properties.
fn parse_collection_test(
    desc: &RecordTypeDescriptor,
    prop: &PropertyDescriptor,
    path: &str,
    inverted: bool,
    sub_filter_spec: Option<&Value>,
) -> PlanResult<FilterTerm> {
    let layout = prop.child_table.as_ref().ok_or_else(|| {
        PlanError::integrity(format!("property `{}` has no child-table layout", prop.name))
    })?;
    let element = element_container(prop)?;
    let sub_filter = match sub_filter_spec {
        Some(spec) => Some(Box::new(parse_filter_inner(spec, desc, &element, false)?)),
        None => None,
    };
    let outer_id_property = desc.id_property.clone();

    Ok(FilterTerm::CollectionTest {
        path: path.to_string(),
        inverted,
        child_table: layout.table.clone(),
        parent_id_column: layout.parent_id_column.clone(),
        outer_id_property,
        element,
        sub_filter,
    })
}

/// The properties a collection test's sub-filter resolves paths against:
/// the nested container for object elements, or a synthesized single
/// `value`/ref-id property for scalar and link-table collections, which
/// carry no `nested` container of their own.
fn element_container(prop: &PropertyDescriptor) -> PlanResult<Arc<RecordContainer>> {
    if let Some(nested) = &prop.nested {
        return Ok(nested.clone());
    }
    match prop.storage_shape {
        StorageShape::LinkTable => {
            let layout = prop.child_table.as_ref().ok_or_else(|| {
                PlanError::integrity(format!("property `{}` has no child-table layout", prop.name))
            })?;
            let column = layout.key_column.clone().unwrap_or_else(|| "ref_id".to_string());
            Ok(Arc::new(RecordContainer {
                properties: vec![synthetic_element_prop(column, prop.value_type.clone())],
            }))
        }
        StorageShape::ChildTable => Ok(Arc::new(RecordContainer {
            properties: vec![synthetic_element_prop("value".to_string(), prop.value_type.clone())],
        })),
        _ => Err(PlanError::usage(format!(
            "collection test over `{}` has no element properties to filter on",
            prop.name
        ))),
    }
}

fn synthetic_element_prop(column: String, value_type: crate::schema::ValueType) -> PropertyDescriptor {
    PropertyDescriptor {
        name: "value".to_string(),
        structural_kind: StructuralKind::Scalar,
        value_type,
        storage_shape: StorageShape::InlineColumn,
        generator: Generator::None,
        flags: PropertyFlags::empty(),
        child_table: None,
        column: Some(column),
        nested: None,
        subtypes: Vec::new(),
    }
}

/// Flattens a container's own inline-column properties (recursing into
/// scalar-object nesting) into a single alias's path→column map, for
/// compiling a collection test's sub-filter against its own correlated
/// subquery table.
fn flatten_container_columns(
    container: &RecordContainer,
    prefix: &str,
    alias: &str,
    out: &mut HashMap<String, (String, String)>,
) {
    for prop in &container.properties {
        let path = if prefix.is_empty() {
            prop.name.clone()
        } else {
            format!("{prefix}.{}", prop.name)
        };
        if matches!(
            prop.storage_shape,
            StorageShape::InlineColumn | StorageShape::Calculated | StorageShape::View
        ) {
            if let Some(col) = &prop.column {
                out.insert(path.clone(), (alias.to_string(), col.clone()));
            }
            if prop.is_scalar_intermediate_ok() {
                if let Some(nested) = &prop.nested {
                    flatten_container_columns(nested, &path, alias, out);
                }
            }
        }
    }
}

/// Translates a filter term into a SQL boolean expression, registering any
/// literal values as filter parameters along the way (spec §4.5/§4.6: the
/// WHERE clause is built from translated, placeholder-carrying SQL, never
/// from inlined literals).
pub fn translate(
    term: &FilterTerm,
    ctx: &TranslationContext,
    params: &mut ParamRegistry,
) -> PlanResult<String> {
    match term {
        FilterTerm::Junction { kind, inverted, children } => {
            let joiner = match kind {
                JunctionKind::And | JunctionKind::All => " AND ",
                JunctionKind::Or | JunctionKind::Any => " OR ",
                JunctionKind::None => " OR ",
            };
            let mut parts = Vec::with_capacity(children.len());
            for child in children {
                parts.push(format!("({})", translate(child, ctx, params)?));
            }
            let body = if parts.is_empty() {
                "TRUE".to_string()
            } else {
                parts.join(joiner)
            };
            let body = if matches!(kind, JunctionKind::None) {
                format!("NOT ({body})")
            } else {
                body
            };
            Ok(if *inverted { format!("NOT ({body})") } else { body })
        }
        FilterTerm::SingleProp {
            path,
            value_fn,
            op,
            inverted,
            params: values,
        } => {
            let column_sql = ctx.translate_prop_path(path)?;
            let lhs = value_fn.translate_sql(&column_sql);
            let sql = translate_single_prop(&lhs, path, value_fn, *op, values, params)?;
            Ok(if *inverted { format!("NOT ({sql})") } else { sql })
        }
        FilterTerm::CollectionTest {
            path,
            inverted,
            child_table,
            parent_id_column,
            outer_id_property,
            element,
            sub_filter,
        } => {
            // Unqualified (`empty`) means the filtered subset is empty —
            // the default is NOT EXISTS, mirroring how a scalar `empty`
            // test is plain `IS NULL` and only `!empty` wraps it in NOT.
            let exists_kw = if *inverted { "EXISTS" } else { "NOT EXISTS" };
            let outer_id_sql = ctx.translate_prop_path(outer_id_property)?;
            let alias = format!("ct_{}", path.replace('.', "_"));
            let correlation = format!(
                "{} = {outer_id_sql}",
                Ident::dotted(&alias, parent_id_column)?.to_sql()
            );
            let body = match sub_filter {
                Some(sub) => {
                    let mut sub_columns = HashMap::new();
                    flatten_container_columns(element, "", &alias, &mut sub_columns);
                    let sub_ctx = TranslationContext::from_columns(sub_columns);
                    format!("{correlation} AND ({})", translate(sub, &sub_ctx, params)?)
                }
                None => correlation,
            };
            Ok(format!("{exists_kw} (SELECT 1 FROM {child_table} {alias} WHERE {body})"))
        }
    }
}

fn translate_single_prop(
    lhs: &str,
    path: &str,
    value_fn: &ValueFn,
    op: TestOp,
    values: &[Value],
    params: &mut ParamRegistry,
) -> PlanResult<String> {
    let scalar = |params: &mut ParamRegistry, v: &Value| -> PlanResult<String> {
        params.register_scalar(path, value_fn.clone(), v.clone())
    };

    Ok(match op {
        TestOp::Eq => format!("{lhs} = {}", scalar(params, &values[0])?),
        TestOp::Ne => format!("{lhs} <> {}", scalar(params, &values[0])?),
        TestOp::Ge => format!("{lhs} >= {}", scalar(params, &values[0])?),
        TestOp::Le => format!("{lhs} <= {}", scalar(params, &values[0])?),
        TestOp::Gt => format!("{lhs} > {}", scalar(params, &values[0])?),
        TestOp::Lt => format!("{lhs} < {}", scalar(params, &values[0])?),
        TestOp::Between => format!(
            "{lhs} BETWEEN {} AND {}",
            scalar(params, &values[0])?,
            scalar(params, &values[1])?
        ),
        TestOp::In => {
            let refp = params.register_list(path, value_fn.clone(), values.to_vec())?;
            format!("{lhs} IN ({refp})")
        }
        TestOp::Contains => format!("{lhs} LIKE '%' || {} || '%'", scalar(params, &values[0])?),
        TestOp::ContainsI => format!("{lhs} ILIKE '%' || {} || '%'", scalar(params, &values[0])?),
        TestOp::Prefix => format!("{lhs} LIKE {} || '%'", scalar(params, &values[0])?),
        TestOp::PrefixI => format!("{lhs} ILIKE {} || '%'", scalar(params, &values[0])?),
        TestOp::Matches => format!("{lhs} ~ {}", scalar(params, &values[0])?),
        TestOp::MatchesI => format!("{lhs} ~* {}", scalar(params, &values[0])?),
        TestOp::Empty => format!("{lhs} IS NULL"),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct OrderElement {
    pub expr: String,
    pub direction: Direction,
}

/// Parses an order spec: a list of `expr [| asc|desc]`.
pub fn parse_order(spec: &[Value]) -> PlanResult<Vec<OrderElement>> {
    spec.iter()
        .map(|v| {
            let s = v
                .as_str()
                .ok_or_else(|| PlanError::usage("order element must be a string"))?;
            let mut parts = s.split('|').map(str::trim);
            let expr = parts
                .next()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| PlanError::usage(format!("order element `{s}` has no expression")))?
                .to_string();
            let direction = match parts.next() {
                None | Some("asc") => Direction::Asc,
                Some("desc") => Direction::Desc,
                Some(other) => {
                    return Err(PlanError::usage(format!("unknown order direction `{other}`")))
                }
            };
            if parts.next().is_some() {
                return Err(PlanError::usage(format!("malformed order element `{s}`")));
            }
            Ok(OrderElement { expr, direction })
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct Range {
    pub offset: u64,
    pub limit: u64,
}

/// Parses a `[offset, limit]` range tuple.
pub fn parse_range(spec: &Value) -> PlanResult<Range> {
    let arr = spec
        .as_array()
        .ok_or_else(|| PlanError::usage("range must be a 2-element array"))?;
    let [offset, limit] = arr.as_slice() else {
        return Err(PlanError::usage("range must be a 2-element array"));
    };
    let offset = offset
        .as_u64()
        .ok_or_else(|| PlanError::usage("range offset must be a non-negative integer"))?;
    let limit = limit
        .as_u64()
        .ok_or_else(|| PlanError::usage("range limit must be a non-negative integer"))?;
    Ok(Range { offset, limit })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::schema::{ChildTableLayout, MetaInfoMapping, ValueType};

    fn scalar_prop(name: &str, value_type: ValueType) -> PropertyDescriptor {
        PropertyDescriptor {
            name: name.to_string(),
            structural_kind: StructuralKind::Scalar,
            value_type,
            storage_shape: StorageShape::InlineColumn,
            generator: Generator::None,
            flags: PropertyFlags::empty(),
            child_table: None,
            column: Some(name.to_string()),
            nested: None,
            subtypes: Vec::new(),
        }
    }

    fn desc_fixture() -> RecordTypeDescriptor {
        let line_container = Arc::new(RecordContainer {
            properties: vec![
                scalar_prop("sku", ValueType::String),
                scalar_prop("qty", ValueType::Number),
            ],
        });
        let lines_prop = PropertyDescriptor {
            name: "lines".to_string(),
            structural_kind: StructuralKind::Array,
            value_type: ValueType::Object,
            storage_shape: StorageShape::ChildTable,
            generator: Generator::None,
            flags: PropertyFlags::empty(),
            child_table: Some(ChildTableLayout {
                table: "order_lines".to_string(),
                parent_id_column: "order_id".to_string(),
                index_column: Some("idx".to_string()),
                key_column: None,
                key_value_type: None,
            }),
            column: None,
            nested: Some(line_container),
            subtypes: Vec::new(),
        };

        let mut properties: Vec<PropertyDescriptor> = [
            ("id", ValueType::Number),
            ("status", ValueType::String),
            ("price", ValueType::Number),
            ("tag", ValueType::String),
            ("tags", ValueType::String),
            ("a", ValueType::Number),
            ("b", ValueType::Number),
            ("name", ValueType::String),
        ]
        .into_iter()
        .map(|(n, vt)| scalar_prop(n, vt))
        .collect();
        properties.push(lines_prop);

        RecordTypeDescriptor {
            name: "Widget".to_string(),
            main_table: "widgets".to_string(),
            id_property: "id".to_string(),
            container: Arc::new(RecordContainer { properties }),
            meta_info: Some(MetaInfoMapping::default()),
            subtypes: Vec::new(),
            discriminator_property: None,
            super_container: None,
        }
    }

    #[test]
    fn parses_simple_eq_test() {
        let desc = desc_fixture();
        let term = parse_filter(&json!(["status|eq", "cancelled"]), &desc).unwrap();
        match term {
            FilterTerm::SingleProp { path, op, params, .. } => {
                assert_eq!(path, "status");
                assert_eq!(op, TestOp::Eq);
                assert_eq!(params, vec![json!("cancelled")]);
            }
            _ => panic!("expected SingleProp"),
        }
    }

    #[test]
    fn folds_inverted_eq_to_ne() {
        let desc = desc_fixture();
        let term = parse_filter(&json!(["status|!eq", "x"]), &desc).unwrap();
        match term {
            FilterTerm::SingleProp { op, inverted, .. } => {
                assert_eq!(op, TestOp::Ne);
                assert!(!inverted);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn canonicalizes_synonyms() {
        let desc = desc_fixture();
        let term = parse_filter(&json!(["price|min", 10]), &desc).unwrap();
        match term {
            FilterTerm::SingleProp { op, .. } => assert_eq!(op, TestOp::Ge),
            _ => panic!(),
        }
    }

    #[test]
    fn rejects_wrong_arity_for_between() {
        let desc = desc_fixture();
        let err = parse_filter(&json!(["price|rng", 1]), &desc).unwrap_err();
        assert!(err.is_usage());
    }

    #[test]
    fn accepts_between_as_two_element_list() {
        let desc = desc_fixture();
        let term = parse_filter(&json!(["price|between", [1, 10]]), &desc).unwrap();
        match term {
            FilterTerm::SingleProp { op, .. } => assert_eq!(op, TestOp::Between),
            _ => panic!(),
        }
    }

    #[test]
    fn in_flattens_nested_lists_and_rejects_null() {
        let desc = desc_fixture();
        assert!(parse_filter(&json!(["tag|in", [1, [2, 3]]]), &desc).is_ok());
        assert!(parse_filter(&json!(["tag|in", [1, null]]), &desc).is_err());
    }

    #[test]
    fn parses_junction_with_children() {
        let desc = desc_fixture();
        let term = parse_filter(
            &json!([
                ":and",
                ["a|eq", 1],
                ["b|gt", 2]
            ]),
            &desc,
        )
        .unwrap();
        match term {
            FilterTerm::Junction { kind, children, .. } => {
                assert_eq!(kind, JunctionKind::And);
                assert_eq!(children.len(), 2);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn empty_takes_zero_args() {
        let desc = desc_fixture();
        assert!(parse_filter(&json!(["tags|empty"]), &desc).is_ok());
        assert!(parse_filter(&json!(["tags|empty", 1]), &desc).is_err());
    }

    #[test]
    fn parses_order_elements() {
        let elems = parse_order(&[json!("name|desc"), json!("id")]).unwrap();
        assert_eq!(elems[0].direction, Direction::Desc);
        assert_eq!(elems[1].direction, Direction::Asc);
    }

    #[test]
    fn parses_range() {
        let r = parse_range(&json!([0, 20])).unwrap();
        assert_eq!(r.offset, 0);
        assert_eq!(r.limit, 20);
    }

    #[test]
    fn bare_collection_empty_test_has_no_sub_filter() {
        let desc = desc_fixture();
        let term = parse_filter(&json!(["lines|empty"]), &desc).unwrap();
        match term {
            FilterTerm::CollectionTest {
                path,
                inverted,
                child_table,
                parent_id_column,
                sub_filter,
                ..
            } => {
                assert_eq!(path, "lines");
                assert!(!inverted);
                assert_eq!(child_table, "order_lines");
                assert_eq!(parent_id_column, "order_id");
                assert!(sub_filter.is_none());
            }
            _ => panic!("expected CollectionTest"),
        }
    }

    #[test]
    fn collection_test_with_sub_filter_resolves_against_element_container() {
        let desc = desc_fixture();
        let term = parse_filter(&json!(["lines|!empty", ["sku|eq", "ABC"]]), &desc).unwrap();
        match term {
            FilterTerm::CollectionTest { inverted, sub_filter, .. } => {
                assert!(inverted);
                let sub = sub_filter.expect("sub-filter present");
                match *sub {
                    FilterTerm::SingleProp { path, .. } => assert_eq!(path, "sku"),
                    _ => panic!("expected SingleProp sub-filter"),
                }
            }
            _ => panic!("expected CollectionTest"),
        }
    }

    #[test]
    fn collection_test_rejects_non_empty_operator() {
        let desc = desc_fixture();
        assert!(parse_filter(&json!(["lines|eq", 1]), &desc).is_err());
    }

    #[test]
    fn collection_test_rejects_dotted_path() {
        let desc = desc_fixture();
        assert!(parse_filter(&json!(["lines.sku|empty"]), &desc).is_err());
    }

    #[test]
    fn collection_test_rejects_nested_collection_sub_filter() {
        let desc = desc_fixture();
        assert!(parse_filter(&json!(["lines|empty", ["lines|empty"]]), &desc).is_err());
    }

    #[test]
    fn join_paths_excludes_collection_test_path() {
        let desc = desc_fixture();
        let term = parse_filter(
            &json!([":and", ["status|eq", "x"], ["lines|empty"]]),
            &desc,
        )
        .unwrap();
        let paths = join_paths(&term);
        assert_eq!(paths, vec!["status".to_string()]);
    }

    #[test]
    fn referenced_paths_still_descends_into_collection_test() {
        let desc = desc_fixture();
        let term = parse_filter(&json!(["lines|!empty", ["sku|eq", "ABC"]]), &desc).unwrap();
        let paths = referenced_paths(&term);
        assert!(paths.contains(&"lines".to_string()));
    }

    #[test]
    fn translate_collection_test_emits_correlated_exists_subquery() {
        let desc = desc_fixture();
        let term = parse_filter(&json!(["lines|!empty", ["sku|eq", "ABC"]]), &desc).unwrap();
        let mut columns = HashMap::new();
        columns.insert("id".to_string(), ("t0".to_string(), "id".to_string()));
        let ctx = TranslationContext::from_columns(columns);
        let mut params = ParamRegistry::new();
        let sql = translate(&term, &ctx, &mut params).unwrap();
        assert!(sql.starts_with("EXISTS (SELECT 1 FROM order_lines ct_lines WHERE"));
        assert!(sql.contains("ct_lines.order_id = t0.id"));
        assert!(sql.contains("ct_lines.sku"));
    }
}
