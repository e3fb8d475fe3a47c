//! Index key functions.
//!
//! A key function maps a document to zero, one or many index keys. Two forms
//! exist:
//!
//! - **Templates**, a small formatting language compiled once:
//!   - `{name}` substitutes a field, `{address.city}` and `{tags.0}` follow
//!     dotted paths through objects and arrays
//!   - `{*tags}` expands over an array, producing one key per element (at
//!     most one expansion per template)
//!   - `{age:05}`, `{name:<10}`, `{name:>10}` pad to a width with zeros,
//!     left alignment or right alignment; `{name:lower}` and `{name:upper}`
//!     change case
//!   - `{{` and `}}` are literal braces
//!
//!   A template produces no key when any referenced field is missing or
//!   null, which makes the index partial.
//! - **Native functions** registered by name (see
//!   [`KeyFnRegistry`](crate::registry::KeyFnRegistry)).

use crate::datum::Datum;
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// A native key function
pub type NativeKeyFn = Arc<dyn Fn(&Datum) -> Vec<String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Align {
    Left,
    Right,
    ZeroFill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FormatSpec {
    Lower,
    Upper,
    Width { align: Align, width: usize },
}

impl FormatSpec {
    fn parse(spec: &str, template: &str) -> Result<Self> {
        match spec {
            "lower" => return Ok(FormatSpec::Lower),
            "upper" => return Ok(FormatSpec::Upper),
            _ => {}
        }
        let (align, digits) = match spec.as_bytes().first() {
            Some(b'<') => (Align::Left, &spec[1..]),
            Some(b'>') => (Align::Right, &spec[1..]),
            Some(b'0') if spec.len() > 1 => (Align::ZeroFill, &spec[1..]),
            _ => (Align::Right, spec),
        };
        let width = digits.parse::<usize>().map_err(|_| {
            Error::InvalidKeyFunction(format!("Bad format spec '{}' in '{}'", spec, template))
        })?;
        Ok(FormatSpec::Width { align, width })
    }

    fn apply(&self, text: String) -> String {
        match *self {
            FormatSpec::Lower => text.to_lowercase(),
            FormatSpec::Upper => text.to_uppercase(),
            FormatSpec::Width { align, width } => match align {
                Align::Left => format!("{:<width$}", text, width = width),
                Align::Right => format!("{:>width$}", text, width = width),
                Align::ZeroFill => match text.strip_prefix('-') {
                    Some(digits) => format!("-{:0>width$}", digits, width = width.saturating_sub(1)),
                    None => format!("{:0>width$}", text, width = width),
                },
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field {
        path: String,
        expand: bool,
        spec: Option<FormatSpec>,
    },
}

/// A compiled key template
#[derive(Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl fmt::Debug for KeyTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyTemplate({:?})", self.source)
    }
}

impl fmt::Display for KeyTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl KeyTemplate {
    /// Compile a template
    pub fn parse(source: &str) -> Result<Self> {
        let invalid = |msg: &str| Error::InvalidKeyFunction(format!("{} in '{}'", msg, source));

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();
        let mut expansions = 0;

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(invalid("Unmatched '}'")),
                '{' => {
                    let mut body = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') => return Err(invalid("Nested '{'")),
                            Some(ch) => body.push(ch),
                            None => return Err(invalid("Unclosed '{'")),
                        }
                    }

                    let (field, spec) = match body.split_once(':') {
                        Some((field, spec)) => (field, Some(FormatSpec::parse(spec, source)?)),
                        None => (body.as_str(), None),
                    };
                    let (path, expand) = match field.strip_prefix('*') {
                        Some(path) => (path.trim(), true),
                        None => (field.trim(), false),
                    };
                    if path.is_empty() || path.split('.').any(str::is_empty) {
                        return Err(invalid("Empty field path"));
                    }
                    if expand {
                        expansions += 1;
                        if expansions > 1 {
                            return Err(invalid("More than one '*' expansion"));
                        }
                    }

                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field {
                        path: path.to_string(),
                        expand,
                        spec,
                    });
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        if !segments.iter().any(|s| matches!(s, Segment::Field { .. })) {
            return Err(invalid("Template references no field"));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Keys for a document, sorted and without repeats
    pub fn keys(&self, doc: &Datum) -> Vec<String> {
        // Values substituted for the expansion, or a single pass without one
        let expansion: Vec<Option<&Datum>> = match self.segments.iter().find_map(|s| match s {
            Segment::Field {
                path, expand: true, ..
            } => Some(path),
            _ => None,
        }) {
            None => vec![None],
            Some(path) => match doc.lookup(path) {
                None | Some(Datum::Null) => return Vec::new(),
                Some(Datum::Array(items)) => items.iter().map(Some).collect(),
                Some(single) => vec![Some(single)],
            },
        };

        let mut keys = BTreeSet::new();
        for element in expansion {
            if let Some(key) = self.render(doc, element) {
                keys.insert(key);
            }
        }
        keys.into_iter().collect()
    }

    fn render(&self, doc: &Datum, element: Option<&Datum>) -> Option<String> {
        let mut key = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => key.push_str(text),
                Segment::Field { path, expand, spec } => {
                    let value = if *expand { element? } else { doc.lookup(path)? };
                    if value.is_null() {
                        return None;
                    }
                    let text = value.render();
                    key.push_str(&match spec {
                        Some(spec) => spec.apply(text),
                        None => text,
                    });
                }
            }
        }
        Some(key)
    }
}

/// How an index derives its keys, as given to `ensure`
#[derive(Debug, Clone)]
pub enum KeySpec {
    Template(String),
    /// Name of a function registered on the database
    Native(String),
}

impl KeySpec {
    pub fn template(source: impl Into<String>) -> Self {
        KeySpec::Template(source.into())
    }

    pub fn native(name: impl Into<String>) -> Self {
        KeySpec::Native(name.into())
    }
}

impl From<&str> for KeySpec {
    fn from(source: &str) -> Self {
        KeySpec::Template(source.to_string())
    }
}

impl From<String> for KeySpec {
    fn from(source: String) -> Self {
        KeySpec::Template(source)
    }
}

/// A resolved key function
#[derive(Clone)]
pub enum KeyFunction {
    Template(KeyTemplate),
    Native { name: String, func: NativeKeyFn },
}

impl fmt::Debug for KeyFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyFunction::Template(t) => t.fmt(f),
            KeyFunction::Native { name, .. } => write!(f, "NativeKeyFn({})", name),
        }
    }
}

impl KeyFunction {
    /// Keys as stored in the index keyspace
    pub fn keys(&self, doc: &Datum) -> Vec<Vec<u8>> {
        match self {
            KeyFunction::Template(template) => template
                .keys(doc)
                .into_iter()
                .map(String::into_bytes)
                .collect(),
            KeyFunction::Native { func, .. } => {
                let keys: BTreeSet<String> = func(doc).into_iter().collect();
                keys.into_iter().map(String::into_bytes).collect()
            }
        }
    }

    /// Single key for point lookups: the first derived key
    pub fn key(&self, doc: &Datum) -> Option<Vec<u8>> {
        self.keys(doc).into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys(template: &str, doc: serde_json::Value) -> Vec<String> {
        KeyTemplate::parse(template)
            .expect("valid template")
            .keys(&Datum::from(doc))
    }

    #[test]
    fn test_simple_and_composite() {
        assert_eq!(keys("{name}", json!({"name": "Tom"})), vec!["Tom"]);
        assert_eq!(
            keys("{last}, {first}", json!({"first": "Ada", "last": "Lovelace"})),
            vec!["Lovelace, Ada"]
        );
        assert_eq!(keys("{a.b.1}", json!({"a": {"b": ["x", "y"]}})), vec!["y"]);
    }

    #[test]
    fn test_missing_or_null_field_yields_no_key() {
        assert!(keys("{name}", json!({"age": 3})).is_empty());
        assert!(keys("{name}", json!({"name": null})).is_empty());
        assert!(keys("{a}-{b}", json!({"a": 1})).is_empty());
    }

    #[test]
    fn test_format_specs() {
        assert_eq!(keys("{age:03}", json!({"age": 7})), vec!["007"]);
        assert_eq!(keys("{n:04}", json!({"n": -5})), vec!["-005"]);
        assert_eq!(keys("{name:lower}", json!({"name": "TOM"})), vec!["tom"]);
        assert_eq!(keys("{name:upper}", json!({"name": "tom"})), vec!["TOM"]);
        assert_eq!(keys("[{name:<5}]", json!({"name": "ab"})), vec!["[ab   ]"]);
        assert_eq!(keys("[{name:>5}]", json!({"name": "ab"})), vec!["[   ab]"]);
    }

    #[test]
    fn test_multi_key_expansion() {
        assert_eq!(
            keys("tag:{*tags}", json!({"tags": ["b", "a", "b", null]})),
            vec!["tag:a", "tag:b"]
        );
        assert!(keys("{*tags}", json!({"tags": []})).is_empty());
        assert!(keys("{*tags}", json!({})).is_empty());
        assert_eq!(keys("{*tags}", json!({"tags": "solo"})), vec!["solo"]);
    }

    #[test]
    fn test_escapes() {
        assert_eq!(keys("{{{name}}}", json!({"name": "x"})), vec!["{x}"]);
    }

    #[test]
    fn test_invalid_templates() {
        for bad in ["{name", "name}", "{}", "plain", "{*a}{*b}", "{a:xyz}", "{a..b}", "{a{b}}"] {
            assert!(
                matches!(KeyTemplate::parse(bad), Err(Error::InvalidKeyFunction(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_native_function_keys_are_deduplicated() {
        let func: NativeKeyFn = Arc::new(|doc: &Datum| {
            let name = doc.get("name").map(Datum::render).unwrap_or_default();
            vec![name.clone(), name]
        });
        let key_fn = KeyFunction::Native {
            name: "twice".to_string(),
            func,
        };
        assert_eq!(
            key_fn.keys(&Datum::from(json!({"name": "x"}))),
            vec![b"x".to_vec()]
        );
    }
}
