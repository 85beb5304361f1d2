//! Message property values.
//!
//! Selectors compare message properties against literals. Both sides are
//! represented as a `Value`, and comparisons follow SQL-style typing: numbers
//! compare across int/float, other types only compare with themselves.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// A typed message property or selector literal.
///
/// # Examples
///
/// ```
/// use kyromatch::Value;
///
/// let int_val = Value::Int(3);
/// let float_val = Value::Float(3.0);
/// let string_val = Value::String("gold".to_string());
///
/// assert!(int_val.is_numeric());
/// assert_eq!(int_val.compare(&float_val), Some(std::cmp::Ordering::Equal));
/// assert!(string_val.is_string());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// SQL NULL, also used for absent properties.
    #[default]
    Null,
}

impl Value {
    /// Returns true for `Bool`.
    #[must_use]
    pub const fn is_bool(&self) -> bool {
        matches!(self, Self::Bool(_))
    }

    /// Returns true for `Int` and `Float`.
    #[must_use]
    pub const fn is_numeric(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_))
    }

    /// Returns true for `String`.
    #[must_use]
    pub const fn is_string(&self) -> bool {
        matches!(self, Self::String(_))
    }

    /// Returns true for `Null`.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The boolean, if this is one.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric value widened to `f64`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// The string, if this is one.
    #[must_use]
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    /// Compares two values.
    ///
    /// Returns `None` when the values are not comparable (different types, a
    /// null operand, or a NaN), which selector evaluation treats as unknown.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Int(_) | Self::Float(_), Self::Int(_) | Self::Float(_)) => {
                let a = self.as_float()?;
                let b = other.as_float()?;
                a.partial_cmp(&b)
            }
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Null => "null",
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "'{}'", v.replace('\'', "''")),
            Self::Null => write!(f, "NULL"),
        }
    }
}

// Convenient From implementations
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_numeric_cross_compare() {
        assert_eq!(Value::Int(2).compare(&Value::Float(2.5)), Some(Ordering::Less));
        assert_eq!(Value::Float(3.0).compare(&Value::Int(3)), Some(Ordering::Equal));
        assert_eq!(Value::Int(7).compare(&Value::Int(5)), Some(Ordering::Greater));
    }

    #[test]
    fn test_value_incomparable() {
        assert_eq!(Value::Int(1).compare(&Value::String("1".into())), None);
        assert_eq!(Value::Null.compare(&Value::Null), None);
        assert_eq!(Value::Float(f64::NAN).compare(&Value::Float(1.0)), None);
    }

    #[test]
    fn test_value_string() {
        let val = Value::String("hello".to_string());
        assert!(val.is_string());
        assert_eq!(val.as_string(), Some("hello"));
        assert_eq!(val.type_name(), "string");
    }

    #[test]
    fn test_value_display() {
        assert_eq!(format!("{}", Value::Bool(true)), "true");
        assert_eq!(format!("{}", Value::Int(42)), "42");
        assert_eq!(format!("{}", Value::String("it's".into())), "'it''s'");
        assert_eq!(format!("{}", Value::Null), "NULL");
    }

    #[test]
    fn test_value_serialization() {
        let val = Value::String("test".into());
        let json = serde_json::to_string(&val).unwrap();
        let deserialized: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(val, deserialized);
    }

    #[test]
    fn test_value_default_is_null() {
        assert!(Value::default().is_null());
    }
}
