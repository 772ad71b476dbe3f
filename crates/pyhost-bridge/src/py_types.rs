//! Python Value Representation
//!
//! [`PyValue`] is the runtime-side view of a Python object once it has
//! been copied out of (or before it is copied into) the interpreter.
//! Backends translate between their native objects and this enum; the
//! marshaller in [`conversion`](crate::conversion) translates between
//! this enum and host [`Value`](crate::value::Value)s.
//!
//! Containers own their items. Nothing here aliases interpreter memory,
//! so a `PyValue` stays valid after the execution token is released.

use std::fmt;

use indexmap::IndexMap;
use smol_str::SmolStr;

/// Represents a Python value that crossed the interpreter boundary.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PyValue {
    /// Python `None`
    #[default]
    None,

    /// Python `bool` (True/False)
    Bool(bool),

    /// Python `int` (arbitrary precision in Python, i64 for the bridge)
    Int(i64),

    /// Python `float` (IEEE 754 double)
    Float(f64),

    /// Python `str`
    Str(SmolStr),

    /// Python `list`
    List(Vec<PyValue>),

    /// Python `tuple`
    Tuple(Vec<PyValue>),

    /// Python `dict` with string keys, insertion ordered
    Dict(IndexMap<SmolStr, PyValue>),
}

impl PyValue {
    /// Get the Python type name for this value
    pub fn type_name(&self) -> &'static str {
        match self {
            PyValue::None => "NoneType",
            PyValue::Bool(_) => "bool",
            PyValue::Int(_) => "int",
            PyValue::Float(_) => "float",
            PyValue::Str(_) => "str",
            PyValue::List(_) => "list",
            PyValue::Tuple(_) => "tuple",
            PyValue::Dict(_) => "dict",
        }
    }

    /// Check if this value is None
    pub fn is_none(&self) -> bool {
        matches!(self, PyValue::None)
    }

    /// Check if this value is an int or float (bool excluded)
    pub fn is_number(&self) -> bool {
        matches!(self, PyValue::Int(_) | PyValue::Float(_))
    }

    /// Items of a list or tuple
    pub fn as_sequence(&self) -> Option<&[PyValue]> {
        match self {
            PyValue::List(items) | PyValue::Tuple(items) => Some(items),
            _ => None,
        }
    }

    /// Try to extract as dict
    pub fn as_dict(&self) -> Option<&IndexMap<SmolStr, PyValue>> {
        match self {
            PyValue::Dict(dict) => Some(dict),
            _ => None,
        }
    }

    /// Build a dict from key-value pairs
    pub fn dict<K, I>(items: I) -> Self
    where
        K: Into<SmolStr>,
        I: IntoIterator<Item = (K, PyValue)>,
    {
        PyValue::Dict(items.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl fmt::Display for PyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PyValue::None => write!(f, "None"),
            PyValue::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            PyValue::Int(n) => write!(f, "{}", n),
            PyValue::Float(n) => write!(f, "{:?}", n),
            PyValue::Str(s) => write!(f, "'{}'", s),
            PyValue::List(items) => {
                write!(f, "[")?;
                write_items(f, items)?;
                write!(f, "]")
            }
            PyValue::Tuple(items) => {
                write!(f, "(")?;
                write_items(f, items)?;
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            PyValue::Dict(dict) => {
                write!(f, "{{")?;
                for (i, (k, v)) in dict.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "'{}': {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

fn write_items(f: &mut fmt::Formatter<'_>, items: &[PyValue]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pyvalue_type_names() {
        assert_eq!(PyValue::None.type_name(), "NoneType");
        assert_eq!(PyValue::Bool(true).type_name(), "bool");
        assert_eq!(PyValue::Int(42).type_name(), "int");
        assert_eq!(PyValue::Float(2.5).type_name(), "float");
        assert_eq!(PyValue::Str("hello".into()).type_name(), "str");
        assert_eq!(PyValue::Tuple(vec![]).type_name(), "tuple");
    }

    #[test]
    fn test_as_sequence_accepts_list_and_tuple() {
        let list = PyValue::List(vec![PyValue::Int(1)]);
        let tuple = PyValue::Tuple(vec![PyValue::Int(1)]);
        assert_eq!(list.as_sequence(), tuple.as_sequence());
        assert!(PyValue::Int(1).as_sequence().is_none());
    }

    #[test]
    fn test_pyvalue_display() {
        assert_eq!(format!("{}", PyValue::None), "None");
        assert_eq!(format!("{}", PyValue::Bool(false)), "False");
        assert_eq!(format!("{}", PyValue::Float(3.0)), "3.0");
        assert_eq!(
            format!("{}", PyValue::List(vec![PyValue::Int(1), PyValue::Int(2)])),
            "[1, 2]"
        );
        assert_eq!(format!("{}", PyValue::Tuple(vec![PyValue::Int(1)])), "(1,)");

        let dict = PyValue::dict([("x", PyValue::Int(1))]);
        assert_eq!(format!("{}", dict), "{'x': 1}");
    }
}
