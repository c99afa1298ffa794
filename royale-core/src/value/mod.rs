//! Sampled values.
//!
//! A [`Value`] is what a sampling generator produces for one trial input: a
//! tagged union of a double-precision number or a piece of text. On the wire
//! a value is a bare JSON number or string.
//!
//! Conversions between the two arms are explicit. The strict accessors
//! ([`as_number`](Value::as_number), [`as_str`](Value::as_str)) only accept
//! the matching arm; the lenient [`to_number`](Value::to_number) additionally
//! accepts a string iff it parses as a double.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single sampled value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    String(String),
}

/// Conversion failures between the two value arms.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValueError {
    #[error("value is not a number: {0:?}")]
    NotNumeric(String),
    #[error("value is not a string: {0}")]
    NotText(f64),
    #[error("string does not parse as a number: {0:?}")]
    Unparseable(String),
}

impl Value {
    /// Strict numeric access. Fails on the string arm, even if the text
    /// would parse as a number.
    pub fn as_number(&self) -> Result<f64, ValueError> {
        match self {
            Value::Number(n) => Ok(*n),
            Value::String(s) => Err(ValueError::NotNumeric(s.clone())),
        }
    }

    /// Lenient numeric access. Succeeds on the string arm iff the text
    /// parses as a double.
    pub fn to_number(&self) -> Result<f64, ValueError> {
        match self {
            Value::Number(n) => Ok(*n),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| ValueError::Unparseable(s.clone())),
        }
    }

    /// Strict text access.
    pub fn as_str(&self) -> Result<&str, ValueError> {
        match self {
            Value::Number(n) => Err(ValueError::NotText(*n)),
            Value::String(s) => Ok(s),
        }
    }

    /// Numeric access with a fallback for the string arm.
    pub fn number_or(&self, default: f64) -> f64 {
        self.as_number().unwrap_or(default)
    }

    /// Text access with a fallback for the numeric arm.
    pub fn str_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.as_str().unwrap_or(default)
    }

    /// Renders either arm as text.
    pub fn to_text(&self) -> String {
        match self {
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.clone(),
        }
    }
}

/// Integral doubles render without a trailing `.0` so that `42` round-trips
/// as `"42"`.
fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_number_access() {
        let v = Value::from(42);
        assert_eq!(v.as_number(), Ok(42.0));
        assert!(v.as_str().is_err());
        assert_eq!(v.str_or("foo"), "foo");
        assert_eq!(v.to_text(), "42");
    }

    #[test]
    fn strict_string_access() {
        let v = Value::from("world");
        assert_eq!(v.as_str(), Ok("world"));
        assert!(v.as_number().is_err());
        assert!(v.to_number().is_err());
        assert_eq!(v.number_or(-12.0), -12.0);
    }

    #[test]
    fn lenient_numeric_parse() {
        assert_eq!(Value::from("4").to_number(), Ok(4.0));
        assert_eq!(Value::from("2.5").to_number(), Ok(2.5));
        assert!(matches!(
            Value::from("hello").to_number(),
            Err(ValueError::Unparseable(_))
        ));
    }

    #[test]
    fn wire_form_is_untagged() {
        assert_eq!(serde_json::to_string(&Value::from(3)).unwrap(), "3.0");
        assert_eq!(
            serde_json::to_string(&Value::from("a")).unwrap(),
            "\"a\""
        );
        let n: Value = serde_json::from_str("7").unwrap();
        assert_eq!(n, Value::Number(7.0));
        let s: Value = serde_json::from_str("\"7\"").unwrap();
        assert_eq!(s, Value::String("7".into()));
    }
}
