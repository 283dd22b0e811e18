//! Key/value projection of recorded payloads.
//!
//! Every payload stored in the history implements [`StatusFields`]. Rendering goes
//! through [`prune`], which drops missing values and empty collections so the status
//! output stays compact. The projection is a fresh `Vec`; the stored record is never
//! touched.

use std::fmt;

/// A single displayable attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Missing,
    Text(String),
    Number(f64),
    Flag(bool),
    List(Vec<String>),
}

impl FieldValue {
    /// `true` for values that carry no information (`None`, empty list).
    ///
    /// Empty text is kept on purpose: an empty URL is a meaningful stop request.
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Missing => true,
            FieldValue::List(items) => items.is_empty(),
            _ => false,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Missing => write!(f, "None"),
            FieldValue::Text(text) => write!(f, "{:?}", text),
            FieldValue::Number(number) => write!(f, "{}", number),
            FieldValue::Flag(flag) => write!(f, "{}", flag),
            FieldValue::List(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(value: Vec<String>) -> Self {
        FieldValue::List(value)
    }
}

impl From<Option<String>> for FieldValue {
    fn from(value: Option<String>) -> Self {
        value.map_or(FieldValue::Missing, FieldValue::Text)
    }
}

impl From<Option<f32>> for FieldValue {
    fn from(value: Option<f32>) -> Self {
        value.map_or(FieldValue::Missing, |n| FieldValue::Number(f64::from(n)))
    }
}

impl From<Option<f64>> for FieldValue {
    fn from(value: Option<f64>) -> Self {
        value.map_or(FieldValue::Missing, FieldValue::Number)
    }
}

impl From<Option<bool>> for FieldValue {
    fn from(value: Option<bool>) -> Self {
        value.map_or(FieldValue::Missing, FieldValue::Flag)
    }
}

/// Explicit replacement for attribute introspection on recorded payloads.
pub trait StatusFields {
    /// Short type label shown above the attributes
    fn type_name(&self) -> &'static str;

    /// All public attributes, including empty ones
    fn fields(&self) -> Vec<(&'static str, FieldValue)>;
}

/// Drops empty attributes and sorts the rest by name.
pub fn prune(fields: Vec<(&'static str, FieldValue)>) -> Vec<(&'static str, FieldValue)> {
    let mut kept: Vec<_> = fields
        .into_iter()
        .filter(|(_, value)| !value.is_empty())
        .collect();
    kept.sort_by(|a, b| a.0.cmp(b.0));
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_drops_missing_and_empty_lists() {
        let fields = vec![
            ("zeta", FieldValue::Number(1.0)),
            ("alpha", FieldValue::Missing),
            ("apps", FieldValue::List(Vec::new())),
            ("url", FieldValue::Text(String::new())),
            ("beta", FieldValue::Flag(false)),
        ];

        let pruned = prune(fields);
        let names: Vec<_> = pruned.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, vec!["beta", "url", "zeta"]);
    }

    #[test]
    fn display_quotes_text_like_a_repr() {
        assert_eq!(FieldValue::from("a").to_string(), "\"a\"");
        assert_eq!(FieldValue::from(Some(0.5f32)).to_string(), "0.5");
        assert_eq!(FieldValue::Missing.to_string(), "None");
    }
}
