//! Request shapes shared by both protocols.

use serde::Deserialize;

/// A field that accepts either a single value or an array of values.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }
}

/// Flatten an optional one-or-many field; absent means empty.
pub fn optional_vec<T>(value: Option<OneOrMany<T>>) -> Vec<T> {
    value.map(OneOrMany::into_vec).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Body {
        #[serde(default)]
        input: Option<OneOrMany<String>>,
    }

    fn parse(raw: &str) -> Vec<String> {
        optional_vec(serde_json::from_str::<Body>(raw).unwrap().input)
    }

    #[test]
    fn accepts_string_array_or_nothing() {
        assert_eq!(parse(r#"{"input":"hi"}"#), vec!["hi"]);
        assert_eq!(parse(r#"{"input":["a","b"]}"#), vec!["a", "b"]);
        assert!(parse(r#"{"input":[]}"#).is_empty());
        assert!(parse("{}").is_empty());
    }
}
