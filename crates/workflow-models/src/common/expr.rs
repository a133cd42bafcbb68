//! "Literal or expression" modeling.

use serde::{Deserialize, Deserializer};

/// A YAML value that is wholly a `${{ ... }}` expression.
#[derive(Debug, PartialEq)]
pub struct ExplicitExpr(String);

impl ExplicitExpr {
    /// Construct an `ExplicitExpr` from the given string, returning
    /// `None` unless the trimmed value is entirely a curly expression.
    pub fn from_curly(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if !trimmed.starts_with("${{") || !trimmed.ends_with("}}") {
            return None;
        }

        Some(Self(value))
    }

    /// The raw expression, including its curly fences.
    pub fn as_curly(&self) -> &str {
        self.0.trim()
    }

    /// The "bare" expression, i.e. the body between the fences.
    pub fn as_bare(&self) -> &str {
        self.as_curly()
            .trim_start_matches("${{")
            .trim_end_matches("}}")
            .trim()
    }
}

impl<'de> Deserialize<'de> for ExplicitExpr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        ExplicitExpr::from_curly(raw)
            .ok_or_else(|| serde::de::Error::custom("expected a wholly-curly expression"))
    }
}

/// A "literal or expression" value: either a structured literal of type
/// `T`, or an entire `${{ ... }}` expression standing in for one.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(untagged)]
pub enum LoE<T> {
    // NOTE: `Expr` must come first so that untagged deserialization
    // prefers it for strings that are wholly expressions.
    Expr(ExplicitExpr),
    Literal(T),
}

impl<T: Default> Default for LoE<T> {
    fn default() -> Self {
        Self::Literal(T::default())
    }
}
