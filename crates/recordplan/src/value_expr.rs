//! Value-expression compiler (spec §4.1, component C1).
//!
//! Parses strings of the form `path` or `path | fn(args)`, evaluated in a
//! value-expression context that knows the base property path a relative
//! expression is anchored to. A [`ValueExpr`] records every path it
//! references (so the query-tree builder knows which joins it needs) and
//! can be rebased under a new path prefix without mutating the original —
//! `rebase` always returns a fresh value.

use crate::error::{PlanError, PlanResult};
use crate::query_tree::TranslationContext;

/// A scalar transform applied to a property's value before comparison or
/// selection.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueFn {
    /// The bare value (the default when no `| fn` stage is present).
    Val,
    /// String/array/map length.
    Len,
    /// Lower-case.
    Lc,
    /// Upper-case.
    Uc,
    /// Substring: 1-based start, optional length.
    Sub(i64, Option<i64>),
    /// Left-pad to width with fill string.
    Lpad(i64, String),
}

impl ValueFn {
    fn parse(name: &str, args: &str) -> PlanResult<Self> {
        let args = args.trim();
        match name {
            "val" => Ok(ValueFn::Val),
            "len" => Ok(ValueFn::Len),
            "lc" => Ok(ValueFn::Lc),
            "uc" => Ok(ValueFn::Uc),
            "sub" => {
                let parts: Vec<&str> = args.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
                if parts.is_empty() || parts.len() > 2 {
                    return Err(PlanError::validation(format!(
                        "sub() expects 1 or 2 arguments, got `{args}`"
                    )));
                }
                let start = parts[0]
                    .parse::<i64>()
                    .map_err(|_| PlanError::validation(format!("sub(): invalid start `{}`", parts[0])))?;
                let len = match parts.get(1) {
                    Some(s) => Some(
                        s.parse::<i64>()
                            .map_err(|_| PlanError::validation(format!("sub(): invalid length `{s}`")))?,
                    ),
                    None => None,
                };
                Ok(ValueFn::Sub(start, len))
            }
            "lpad" => {
                let parts: Vec<&str> = args.split(',').map(str::trim).collect();
                if parts.len() != 2 {
                    return Err(PlanError::validation(format!(
                        "lpad() expects 2 arguments, got `{args}`"
                    )));
                }
                let width = parts[0]
                    .parse::<i64>()
                    .map_err(|_| PlanError::validation(format!("lpad(): invalid width `{}`", parts[0])))?;
                let fill = parts[1].trim_matches('\'').to_string();
                Ok(ValueFn::Lpad(width, fill))
            }
            other => Err(PlanError::validation(format!("unknown value function `{other}`"))),
        }
    }

    pub(crate) fn translate_sql(&self, column_sql: &str) -> String {
        match self {
            ValueFn::Val => column_sql.to_string(),
            ValueFn::Len => format!("char_length({column_sql})"),
            ValueFn::Lc => format!("lower({column_sql})"),
            ValueFn::Uc => format!("upper({column_sql})"),
            ValueFn::Sub(start, len) => match len {
                Some(l) => format!("substring({column_sql} from {start} for {l})"),
                None => format!("substring({column_sql} from {start})"),
            },
            ValueFn::Lpad(width, fill) => {
                format!("lpad({column_sql}, {width}, '{}')", fill.replace('\'', "''"))
            }
        }
    }
}

/// A compiled value expression: a property path (relative to some base),
/// optionally transformed by a [`ValueFn`].
#[derive(Debug, Clone, PartialEq)]
pub struct ValueExpr {
    path: String,
    func: ValueFn,
}

impl ValueExpr {
    /// Parse `path` or `path | fn(args)`. A single pipe stage only — per
    /// SPEC_FULL.md's grammar decision, chained pipes are rejected rather
    /// than guessed at.
    pub fn parse(spec: &str) -> PlanResult<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(PlanError::validation("empty value expression"));
        }
        let mut stages = spec.split('|').map(str::trim);
        let path = stages
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PlanError::validation("value expression has no property path"))?
            .to_string();

        let func = match stages.next() {
            None => ValueFn::Val,
            Some(stage) => {
                let (name, args) = match stage.find('(') {
                    Some(idx) => {
                        let name = &stage[..idx];
                        let rest = &stage[idx + 1..];
                        let args = rest.strip_suffix(')').ok_or_else(|| {
                            PlanError::validation(format!("unterminated value function call `{stage}`"))
                        })?;
                        (name, args)
                    }
                    None => (stage, ""),
                };
                ValueFn::parse(name, args)?
            }
        };

        if stages.next().is_some() {
            return Err(PlanError::validation(format!(
                "value expression `{spec}` has more than one pipe stage"
            )));
        }

        Ok(Self { path, func })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn func(&self) -> &ValueFn {
        &self.func
    }

    /// Every property path this expression references, relative to its
    /// current base.
    pub fn referenced_paths(&self) -> Vec<String> {
        vec![self.path.clone()]
    }

    /// Returns a new expression with its path composed under `prefix`,
    /// leaving `self` untouched.
    pub fn rebase(&self, prefix: &str) -> Self {
        let path = if prefix.is_empty() {
            self.path.clone()
        } else {
            format!("{prefix}.{}", self.path)
        };
        Self {
            path,
            func: self.func.clone(),
        }
    }

    /// Translate to a SQL fragment using the given translation context.
    pub fn translate(&self, ctx: &TranslationContext) -> PlanResult<String> {
        let column_sql = ctx.translate_prop_path(&self.path)?;
        Ok(self.func.translate_sql(&column_sql))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_path() {
        let e = ValueExpr::parse("name").unwrap();
        assert_eq!(e.path(), "name");
        assert_eq!(e.func(), &ValueFn::Val);
    }

    #[test]
    fn parses_len_fn() {
        let e = ValueExpr::parse("name | len").unwrap();
        assert_eq!(e.func(), &ValueFn::Len);
    }

    #[test]
    fn parses_sub_with_args() {
        let e = ValueExpr::parse("name | sub(1,3)").unwrap();
        assert_eq!(e.func(), &ValueFn::Sub(1, Some(3)));
    }

    #[test]
    fn rejects_double_pipe() {
        assert!(ValueExpr::parse("name | lc | uc").is_err());
    }

    #[test]
    fn rebase_prefixes_path_without_mutating_original() {
        let e = ValueExpr::parse("name").unwrap();
        let rebased = e.rebase("lines");
        assert_eq!(e.path(), "name");
        assert_eq!(rebased.path(), "lines.name");
    }

    #[test]
    fn referenced_paths_returns_base_path() {
        let e = ValueExpr::parse("a.b | uc").unwrap();
        assert_eq!(e.referenced_paths(), vec!["a.b".to_string()]);
    }

    #[test]
    fn unknown_function_is_validation_error() {
        assert!(ValueExpr::parse("name | nope").is_err());
    }
}
