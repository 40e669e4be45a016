//! Safe SQL identifier handling for table/column/alias names.
//!
//! Ported from the teacher's `pgorm::ident` module: unquoted parts must
//! match `[A-Za-z_][A-Za-z0-9_$]*`, quoted parts allow anything but NUL and
//! escape `"` as `""`. The query-tree builder uses this to render aliases
//! and column references; it is the only thing standing between a
//! record-type/property name and a string directly concatenated into SQL.

use crate::error::{PlanError, PlanResult};

#[derive(Debug, Clone, PartialEq, Eq)]
enum IdentPart {
    Unquoted(String),
    Quoted(String),
}

/// A SQL identifier (column, table, or alias), possibly dotted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident {
    parts: Vec<IdentPart>,
}

impl Ident {
    pub fn parse(s: &str) -> PlanResult<Self> {
        if s.is_empty() {
            return Err(PlanError::validation("identifier cannot be empty"));
        }
        if s.contains('\0') {
            return Err(PlanError::validation(
                "identifier cannot contain NUL character",
            ));
        }

        let mut parts = Vec::new();
        let mut chars = s.chars().peekable();

        while chars.peek().is_some() {
            if !parts.is_empty() {
                match chars.next() {
                    Some('.') => {
                        if chars.peek().is_none() {
                            return Err(PlanError::validation("trailing '.' in identifier"));
                        }
                    }
                    Some(c) => {
                        return Err(PlanError::validation(format!(
                            "expected '.' between identifier parts, got '{c}'"
                        )));
                    }
                    None => break,
                }
            }

            if chars.peek() == Some(&'"') {
                chars.next();
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('"') => {
                            if chars.peek() == Some(&'"') {
                                chars.next();
                                name.push('"');
                            } else {
                                break;
                            }
                        }
                        Some(c) => name.push(c),
                        None => return Err(PlanError::validation("unclosed quoted identifier")),
                    }
                }
                if name.is_empty() {
                    return Err(PlanError::validation("empty quoted identifier"));
                }
                parts.push(IdentPart::Quoted(name));
                continue;
            }

            let mut name = String::new();
            while let Some(&c) = chars.peek() {
                if c == '.' {
                    break;
                }
                if name.is_empty() {
                    if c == '_' || c.is_ascii_alphabetic() {
                        name.push(c);
                        chars.next();
                    } else {
                        return Err(PlanError::validation(format!(
                            "invalid identifier start character: '{c}'"
                        )));
                    }
                } else if c == '_' || c == '$' || c.is_ascii_alphanumeric() {
                    name.push(c);
                    chars.next();
                } else {
                    return Err(PlanError::validation(format!(
                        "invalid character in identifier: '{c}'"
                    )));
                }
            }
            if name.is_empty() {
                return Err(PlanError::validation("empty identifier segment"));
            }
            parts.push(IdentPart::Unquoted(name));
        }

        if parts.is_empty() {
            return Err(PlanError::validation("empty identifier"));
        }

        Ok(Self { parts })
    }

    /// Build a two-part dotted identifier (e.g. a `table.column` reference)
    /// from already-validated simple names, without re-parsing dots inside
    /// either part.
    pub fn dotted(a: &str, b: &str) -> PlanResult<Self> {
        let mut ident = Ident::parse(a)?;
        ident.parts.extend(Ident::parse(b)?.parts);
        Ok(ident)
    }

    pub fn to_sql(&self) -> String {
        let mut out = String::new();
        self.write_sql(&mut out);
        out
    }

    pub(crate) fn write_sql(&self, out: &mut String) {
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                out.push('.');
            }
            match part {
                IdentPart::Unquoted(s) => out.push_str(s),
                IdentPart::Quoted(s) => {
                    out.push('"');
                    for ch in s.chars() {
                        if ch == '"' {
                            out.push_str("\"\"");
                        } else {
                            out.push(ch);
                        }
                    }
                    out.push('"');
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ident_simple() {
        assert_eq!(Ident::parse("users").unwrap().to_sql(), "users");
    }

    #[test]
    fn ident_dotted_parse() {
        assert_eq!(Ident::parse("t0.name").unwrap().to_sql(), "t0.name");
    }

    #[test]
    fn ident_dotted_helper() {
        assert_eq!(Ident::dotted("t0", "name").unwrap().to_sql(), "t0.name");
    }

    #[test]
    fn ident_rejects_injection() {
        assert!(Ident::parse("users; drop table users; --").is_err());
    }

    #[test]
    fn ident_rejects_leading_digit() {
        assert!(Ident::parse("1table").is_err());
    }

    #[test]
    fn ident_quoted_roundtrip() {
        let ident = Ident::parse(r#""Has""Quote""#).unwrap();
        assert_eq!(ident.to_sql(), r#""Has""Quote""#);
    }
}
