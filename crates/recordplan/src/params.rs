//! Filter-params registry and placeholder substitution (spec §4.6, §6
//! "Placeholder wire format", component C6).
//!
//! Compiled SQL templates carry `?{ref}` placeholders outside single-quoted
//! literals. [`substitute`] is the one function that ever looks inside a
//! template string; everything upstream only ever produces templates and
//! never concatenates a literal value into SQL directly.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::error::{PlanError, PlanResult};
use crate::value_expr::ValueFn;

/// A resolved parameter value: either a single scalar or a list (for `in`
/// tests), which renders as a comma-separated literal sequence.
#[derive(Debug, Clone)]
pub enum ResolvedParam {
    Scalar(Value),
    List(Vec<Value>),
}

/// A registered filter parameter: a monotonically assigned numeric
/// reference to a client-visible name, the value already known from the
/// filter spec the DBO was compiled from, and the value-function the
/// comparison side applies. Filter literal values are known at plan-build
/// time (the DBO is built once from a concrete filter spec and may be
/// re-executed many times against those same values), so the registry
/// stores them directly rather than deferring to per-execution input.
#[derive(Debug, Clone)]
pub struct ParamEntry {
    pub name: String,
    pub value_fn: ValueFn,
    pub value: ResolvedParam,
}

/// Assigns `?{N}` references to filter parameters as a DBO is compiled.
/// Immutable once the DBO is built; shared across every execution of it.
#[derive(Debug, Clone, Default)]
pub struct ParamRegistry {
    entries: Vec<ParamEntry>,
}

impl ParamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new scalar parameter and returns its `?{ref}` placeholder.
    ///
    /// Fails with [`PlanError::TypeMismatch`] if `value`'s type conflicts
    /// with what `value_fn` is declared over (spec §4.6).
    pub fn register_scalar(&mut self, name: impl Into<String>, value_fn: ValueFn, value: Value) -> PlanResult<String> {
        self.push(name, value_fn, ResolvedParam::Scalar(value))
    }

    /// Registers a new list parameter (for `in`-style tests).
    pub fn register_list(&mut self, name: impl Into<String>, value_fn: ValueFn, values: Vec<Value>) -> PlanResult<String> {
        self.push(name, value_fn, ResolvedParam::List(values))
    }

    fn push(&mut self, name: impl Into<String>, value_fn: ValueFn, value: ResolvedParam) -> PlanResult<String> {
        let name = name.into();
        check_value_fn_type(&name, &value_fn, &value)?;
        let idx = self.entries.len();
        self.entries.push(ParamEntry {
            name,
            value_fn,
            value,
        });
        Ok(format!("?{{{idx}}}"))
    }

    pub fn entry(&self, idx: usize) -> Option<&ParamEntry> {
        self.entries.get(idx)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Supplies concrete values for `?{ref}` placeholders at execution time.
/// Implemented by the execution context (C9), which layers the input
/// filter-params map, the generated-params map, and `ctx.executedOn`/
/// `ctx.actor` specials over one registry.
pub trait ParamResolver {
    fn resolve_index(&self, idx: usize) -> PlanResult<ResolvedParam>;
    fn resolve_named(&self, name: &str) -> PlanResult<ResolvedParam>;
    fn executed_on(&self) -> PlanResult<DateTime<Utc>>;
    fn actor(&self) -> PlanResult<Option<String>>;
}

enum ParamRef<'a> {
    Index(usize),
    Named(&'a str),
    CtxExecutedOn,
    CtxActor,
}

fn parse_ref(raw: &str) -> ParamRef<'_> {
    match raw {
        "ctx.executedOn" => ParamRef::CtxExecutedOn,
        "ctx.actor" => ParamRef::CtxActor,
        _ => match raw.parse::<usize>() {
            Ok(n) => ParamRef::Index(n),
            Err(_) => ParamRef::Named(raw),
        },
    }
}

/// Formats a value as a SQL literal. Datetimes use the ISO-8601
/// millisecond-`Z` wire format (spec §6, invariant P3).
pub fn render_literal(value: &Value) -> PlanResult<String> {
    match value {
        Value::Null => Ok("NULL".to_string()),
        Value::Bool(b) => Ok(if *b { "TRUE".to_string() } else { "FALSE".to_string() }),
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if !f.is_finite() {
                    return Err(PlanError::InvalidParameter(
                        "<number>".to_string(),
                        "NaN/Infinity is not a valid SQL literal".to_string(),
                    ));
                }
            }
            Ok(n.to_string())
        }
        Value::String(s) => {
            if let Some(dt) = try_parse_datetime(s) {
                Ok(format!("'{}'", format_datetime(&dt)))
            } else {
                Ok(format!("'{}'", s.replace('\'', "''")))
            }
        }
        other => Err(PlanError::InvalidParameter(
            "<value>".to_string(),
            format!("cannot render {other:?} as a SQL literal"),
        )),
    }
}

fn try_parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
        .filter(|_| s.ends_with('Z') && s.contains('.'))
}

/// Renders a datetime as `YYYY-MM-DDTHH:MM:SS.sssZ` (spec §6).
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Checks that a value's JSON type is one `value_fn` could plausibly have
/// produced or could compare against (spec §4.6: placeholder substitution
/// fails with `TypeMismatch` if the supplied type conflicts with the
/// parameter's declared value function). `Null` always passes — filter
/// tests against absent values are a separate (is-empty) concern.
fn check_value_fn_type(name: &str, value_fn: &ValueFn, value: &ResolvedParam) -> PlanResult<()> {
    let check_one = |v: &Value| -> PlanResult<()> {
        if v.is_null() {
            return Ok(());
        }
        let ok = match value_fn {
            ValueFn::Val => true,
            ValueFn::Len => v.is_number(),
            ValueFn::Lc | ValueFn::Uc | ValueFn::Sub(..) | ValueFn::Lpad(..) => v.is_string(),
        };
        if ok {
            Ok(())
        } else {
            Err(PlanError::TypeMismatch(
                name.to_string(),
                format!("value {v} is not compatible with value function {value_fn:?}"),
            ))
        }
    };
    match value {
        ResolvedParam::Scalar(v) => check_one(v),
        ResolvedParam::List(items) => items.iter().try_for_each(check_one),
    }
}

fn render_resolved(resolved: &ResolvedParam) -> PlanResult<String> {
    match resolved {
        ResolvedParam::Scalar(v) => render_literal(v),
        ResolvedParam::List(items) => {
            let parts: Result<Vec<_>, _> = items.iter().map(render_literal).collect();
            Ok(parts?.join(", "))
        }
    }
}

/// Substitutes every `?{ref}` placeholder in `template` outside
/// single-quoted literals, leaving `'…'` contents (and `''` escapes)
/// byte-for-byte untouched (spec invariant P2).
pub fn substitute(template: &str, resolver: &dyn ParamResolver) -> PlanResult<String> {
    let bytes = template.as_bytes();
    let mut out = String::with_capacity(template.len());
    let mut i = 0;
    let mut in_string = false;

    while i < bytes.len() {
        let c = bytes[i] as char;

        if in_string {
            if c == '\'' {
                if bytes.get(i + 1) == Some(&b'\'') {
                    out.push_str("''");
                    i += 2;
                    continue;
                }
                in_string = false;
            }
            out.push(c);
            i += 1;
            continue;
        }

        if c == '\'' {
            in_string = true;
            out.push(c);
            i += 1;
            continue;
        }

        if c == '?' && bytes.get(i + 1) == Some(&b'{') {
            let start = i + 2;
            let end = template[start..]
                .find('}')
                .map(|p| start + p)
                .ok_or_else(|| PlanError::usage(format!("unterminated placeholder at byte {i}")))?;
            let raw_ref = &template[start..end];
            let literal = match parse_ref(raw_ref) {
                ParamRef::Index(idx) => render_resolved(&resolver.resolve_index(idx)?)?,
                ParamRef::Named(name) => render_resolved(&resolver.resolve_named(name)?)?,
                ParamRef::CtxExecutedOn => format!("'{}'", format_datetime(&resolver.executed_on()?)),
                ParamRef::CtxActor => match resolver.actor()? {
                    Some(actor) => format!("'{}'", actor.replace('\'', "''")),
                    None => "NULL".to_string(),
                },
            };
            out.push_str(&literal);
            i = end + 1;
            continue;
        }

        out.push(c);
        i += 1;
    }

    if in_string {
        return Err(PlanError::usage("unterminated string literal in SQL template"));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeResolver {
        indexed: HashMap<usize, ResolvedParam>,
        executed_on: DateTime<Utc>,
        actor: Option<String>,
    }

    impl ParamResolver for FakeResolver {
        fn resolve_index(&self, idx: usize) -> PlanResult<ResolvedParam> {
            self.indexed
                .get(&idx)
                .cloned()
                .ok_or_else(|| PlanError::MissingParameter(idx.to_string()))
        }
        fn resolve_named(&self, name: &str) -> PlanResult<ResolvedParam> {
            Err(PlanError::MissingParameter(name.to_string()))
        }
        fn executed_on(&self) -> PlanResult<DateTime<Utc>> {
            Ok(self.executed_on)
        }
        fn actor(&self) -> PlanResult<Option<String>> {
            Ok(self.actor.clone())
        }
    }

    #[test]
    fn s5_placeholder_substitution_scenario() {
        let mut indexed = HashMap::new();
        indexed.insert(0, ResolvedParam::Scalar(serde_json::json!(42)));
        indexed.insert(
            1,
            ResolvedParam::List(vec![serde_json::json!("a"), serde_json::json!("b")]),
        );
        let resolver = FakeResolver {
            indexed,
            executed_on: Utc::now(),
            actor: None,
        };
        let template = "SELECT * FROM t WHERE name = 'it''s' AND k = ?{0} AND v IN (?{1})";
        let result = substitute(template, &resolver).unwrap();
        assert_eq!(
            result,
            "SELECT * FROM t WHERE name = 'it''s' AND k = 42 AND v IN ('a', 'b')"
        );
    }

    #[test]
    fn missing_parameter_errors() {
        let resolver = FakeResolver {
            indexed: HashMap::new(),
            executed_on: Utc::now(),
            actor: None,
        };
        let err = substitute("WHERE k = ?{0}", &resolver).unwrap_err();
        assert!(matches!(err, PlanError::MissingParameter(_)));
    }

    #[test]
    fn ctx_actor_renders_null_when_absent() {
        let resolver = FakeResolver {
            indexed: HashMap::new(),
            executed_on: Utc::now(),
            actor: None,
        };
        let result = substitute("SET actor = ?{ctx.actor}", &resolver).unwrap();
        assert_eq!(result, "SET actor = NULL");
    }

    #[test]
    fn datetime_round_trips_iso_ms_z() {
        let dt: DateTime<Utc> = "2024-03-05T10:20:30.123Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(format_datetime(&dt), "2024-03-05T10:20:30.123Z");
    }

    #[test]
    fn registry_assigns_sequential_refs() {
        let mut reg = ParamRegistry::new();
        assert_eq!(
            reg.register_scalar("a", ValueFn::Val, serde_json::json!(1)).unwrap(),
            "?{0}"
        );
        assert_eq!(
            reg.register_scalar("b", ValueFn::Val, serde_json::json!(2)).unwrap(),
            "?{1}"
        );
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn len_value_fn_rejects_non_numeric_value() {
        let mut reg = ParamRegistry::new();
        let err = reg
            .register_scalar("tag", ValueFn::Len, serde_json::json!("abc"))
            .unwrap_err();
        assert!(matches!(err, PlanError::TypeMismatch(_, _)));
    }

    #[test]
    fn uc_value_fn_rejects_non_string_list_element() {
        let mut reg = ParamRegistry::new();
        let err = reg
            .register_list(
                "tags",
                ValueFn::Uc,
                vec![serde_json::json!("a"), serde_json::json!(1)],
            )
            .unwrap_err();
        assert!(matches!(err, PlanError::TypeMismatch(_, _)));
    }

    #[test]
    fn null_value_passes_any_value_fn() {
        let mut reg = ParamRegistry::new();
        assert!(reg.register_scalar("x", ValueFn::Len, Value::Null).is_ok());
    }
}
