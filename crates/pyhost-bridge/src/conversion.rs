//! Type Conversion Traits
//!
//! Conversion between host [`Value`]s and the interpreter-side [`PyValue`]
//! representation, plus the JSON encoding used by the subprocess transport.
//!
//! ## Traits
//!
//! - `ToPython`: host value to Python value (infallible; shapes are
//!   already validated on the host side)
//! - `FromPython`: Python value to host value (fallible)
//!
//! Conversions never return a partially converted value: a nested
//! mismatch anywhere fails the whole conversion.

use std::borrow::Cow;

use indexmap::IndexMap;
use smol_str::SmolStr;

use crate::error::{BridgeError, BridgeResult};
use crate::py_types::PyValue;
use crate::value::{Mapping, Matrix, Value};

// ============================================================================
// ToPython Trait
// ============================================================================

/// Trait for converting host values to Python values.
pub trait ToPython {
    /// Convert this value to a Python value.
    fn to_python(&self) -> PyValue;
}

impl ToPython for () {
    fn to_python(&self) -> PyValue {
        PyValue::None
    }
}

impl ToPython for bool {
    fn to_python(&self) -> PyValue {
        PyValue::Bool(*self)
    }
}

impl ToPython for i32 {
    fn to_python(&self) -> PyValue {
        PyValue::Int(*self as i64)
    }
}

impl ToPython for i64 {
    fn to_python(&self) -> PyValue {
        PyValue::Int(*self)
    }
}

impl ToPython for usize {
    fn to_python(&self) -> PyValue {
        PyValue::Int(*self as i64)
    }
}

impl ToPython for f64 {
    fn to_python(&self) -> PyValue {
        PyValue::Float(*self)
    }
}

impl ToPython for str {
    fn to_python(&self) -> PyValue {
        PyValue::Str(SmolStr::new(self))
    }
}

impl ToPython for String {
    fn to_python(&self) -> PyValue {
        PyValue::Str(SmolStr::new(self))
    }
}

impl<T: ToPython + ?Sized> ToPython for &T {
    fn to_python(&self) -> PyValue {
        (**self).to_python()
    }
}

impl<T: ToPython> ToPython for Option<T> {
    fn to_python(&self) -> PyValue {
        match self {
            Some(v) => v.to_python(),
            None => PyValue::None,
        }
    }
}

impl<T: ToPython> ToPython for [T] {
    fn to_python(&self) -> PyValue {
        PyValue::List(self.iter().map(ToPython::to_python).collect())
    }
}

impl<T: ToPython> ToPython for Vec<T> {
    fn to_python(&self) -> PyValue {
        self.as_slice().to_python()
    }
}

impl ToPython for Matrix {
    fn to_python(&self) -> PyValue {
        PyValue::List(self.iter_rows().map(|row| row.to_python()).collect())
    }
}

impl ToPython for Mapping {
    fn to_python(&self) -> PyValue {
        PyValue::Dict(
            self.iter()
                .map(|(k, v)| (SmolStr::new(k), v.to_python()))
                .collect(),
        )
    }
}

impl ToPython for Value {
    fn to_python(&self) -> PyValue {
        match self {
            Value::None => PyValue::None,
            Value::Bool(b) => PyValue::Bool(*b),
            Value::Int(n) => PyValue::Int(*n),
            Value::Float(f) => PyValue::Float(*f),
            Value::Str(s) => s.to_python(),
            Value::Sequence(items) => items.to_python(),
            Value::Matrix(m) => m.to_python(),
            Value::Mapping(m) => m.to_python(),
        }
    }
}

/// Marshal positional call arguments.
pub fn marshal_args(args: &[Value]) -> Vec<PyValue> {
    args.iter().map(ToPython::to_python).collect()
}

// ============================================================================
// FromPython Trait
// ============================================================================

/// Trait for converting Python values to host values.
pub trait FromPython: Sized {
    /// Try to convert a Python value to this type.
    fn from_python(value: &PyValue) -> BridgeResult<Self>;
}

impl FromPython for () {
    fn from_python(value: &PyValue) -> BridgeResult<Self> {
        match value {
            PyValue::None => Ok(()),
            _ => Err(BridgeError::type_mismatch("None", value.type_name())),
        }
    }
}

impl FromPython for bool {
    fn from_python(value: &PyValue) -> BridgeResult<Self> {
        match value {
            PyValue::Bool(b) => Ok(*b),
            _ => Err(BridgeError::type_mismatch("bool", value.type_name())),
        }
    }
}

impl FromPython for i64 {
    fn from_python(value: &PyValue) -> BridgeResult<Self> {
        match value {
            PyValue::Int(n) => Ok(*n),
            PyValue::Float(f) if f.fract() == 0.0 => {
                if *f >= i64::MIN as f64 && *f < i64::MAX as f64 {
                    Ok(*f as i64)
                } else {
                    Err(BridgeError::numeric_overflow(f, "i64"))
                }
            }
            PyValue::Float(f) => Err(BridgeError::numeric_overflow(f, "int without rounding")),
            _ => Err(BridgeError::type_mismatch("int", value.type_name())),
        }
    }
}

impl FromPython for i32 {
    fn from_python(value: &PyValue) -> BridgeResult<Self> {
        let n = i64::from_python(value)?;
        i32::try_from(n).map_err(|_| BridgeError::numeric_overflow(n, "i32"))
    }
}

impl FromPython for u32 {
    fn from_python(value: &PyValue) -> BridgeResult<Self> {
        let n = i64::from_python(value)?;
        u32::try_from(n).map_err(|_| BridgeError::numeric_overflow(n, "u32"))
    }
}

impl FromPython for usize {
    fn from_python(value: &PyValue) -> BridgeResult<Self> {
        let n = i64::from_python(value)?;
        usize::try_from(n).map_err(|_| BridgeError::numeric_overflow(n, "usize"))
    }
}

impl FromPython for f64 {
    fn from_python(value: &PyValue) -> BridgeResult<Self> {
        match value {
            PyValue::Float(f) => Ok(*f),
            PyValue::Int(n) => Ok(*n as f64),
            _ => Err(BridgeError::type_mismatch("float", value.type_name())),
        }
    }
}

impl FromPython for String {
    fn from_python(value: &PyValue) -> BridgeResult<Self> {
        match value {
            PyValue::Str(s) => Ok(s.to_string()),
            _ => Err(BridgeError::type_mismatch("str", value.type_name())),
        }
    }
}

impl<T: FromPython> FromPython for Option<T> {
    fn from_python(value: &PyValue) -> BridgeResult<Self> {
        match value {
            PyValue::None => Ok(None),
            _ => T::from_python(value).map(Some),
        }
    }
}

impl<T: FromPython> FromPython for Vec<T> {
    fn from_python(value: &PyValue) -> BridgeResult<Self> {
        match value.as_sequence() {
            Some(items) => items.iter().map(T::from_python).collect(),
            None => Err(BridgeError::type_mismatch("list", value.type_name())),
        }
    }
}

impl FromPython for Matrix {
    fn from_python(value: &PyValue) -> BridgeResult<Self> {
        let rows = value
            .as_sequence()
            .ok_or_else(|| BridgeError::type_mismatch("list of rows", value.type_name()))?;
        let rows = rows
            .iter()
            .map(Vec::<f64>::from_python)
            .collect::<BridgeResult<Vec<_>>>()?;
        Matrix::from_rows(&rows)
    }
}

impl FromPython for Mapping {
    fn from_python(value: &PyValue) -> BridgeResult<Self> {
        let dict = value
            .as_dict()
            .ok_or_else(|| BridgeError::type_mismatch("dict", value.type_name()))?;
        dict.iter()
            .map(|(k, v)| Ok::<_, BridgeError>((k.clone(), Value::from_python(v)?)))
            .collect()
    }
}

impl FromPython for Value {
    fn from_python(value: &PyValue) -> BridgeResult<Self> {
        Ok(match value {
            PyValue::None => Value::None,
            PyValue::Bool(b) => Value::Bool(*b),
            PyValue::Int(n) => Value::Int(*n),
            PyValue::Float(f) => Value::Float(*f),
            PyValue::Str(s) => Value::Str(s.to_string()),
            PyValue::List(items) => promote_rows(
                items
                    .iter()
                    .map(Value::from_python)
                    .collect::<BridgeResult<_>>()?,
            )?,
            PyValue::Tuple(items) => Value::Sequence(
                items
                    .iter()
                    .map(Value::from_python)
                    .collect::<BridgeResult<_>>()?,
            ),
            PyValue::Dict(_) => Value::Mapping(Mapping::from_python(value)?),
        })
    }
}

impl FromPython for PyValue {
    fn from_python(value: &PyValue) -> BridgeResult<Self> {
        Ok(value.clone())
    }
}

/// Turn a list of equal-length numeric rows into a matrix.
///
/// Rows qualify when they hold only ints and floats and at least one
/// float appears; all-int rows stay a sequence so integers come back
/// unchanged. Qualifying rows of different lengths fail.
fn promote_rows(items: Vec<Value>) -> BridgeResult<Value> {
    match numeric_rows(&items) {
        Some(rows) => Matrix::from_rows(&rows).map(Value::Matrix),
        None => Ok(Value::Sequence(items)),
    }
}

fn numeric_rows(items: &[Value]) -> Option<Vec<Vec<f64>>> {
    let mut any_float = false;
    let mut rows = Vec::with_capacity(items.len());
    for item in items {
        let Value::Sequence(row) = item else {
            return None;
        };
        let mut numbers = Vec::with_capacity(row.len());
        for x in row {
            match x {
                Value::Int(n) => numbers.push(*n as f64),
                Value::Float(f) => {
                    any_float = true;
                    numbers.push(*f);
                }
                _ => return None,
            }
        }
        rows.push(numbers);
    }
    any_float.then_some(rows)
}

/// Unmarshal a call result into a host value.
pub fn unmarshal(value: &PyValue) -> BridgeResult<Value> {
    Value::from_python(value)
}

// ============================================================================
// JSON (subprocess transport)
// ============================================================================

/// Key of the object standing in for a non-finite float
pub const NON_FINITE_TAG: &str = "$float";

/// Bare tokens Python's `json` module writes for non-finite floats
const PYTHON_CONSTANTS: [(&str, &str); 3] =
    [("-Infinity", "-inf"), ("Infinity", "inf"), ("NaN", "nan")];

/// Encode a host value as JSON.
///
/// Matrices become arrays of row arrays. Non-finite floats become
/// `{"$float": "inf" | "-inf" | "nan"}`.
pub fn to_json(value: &Value) -> BridgeResult<serde_json::Value> {
    use serde_json::Value as Json;

    Ok(match value {
        Value::None => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(n) => Json::from(*n),
        Value::Float(f) => json_float(*f),
        Value::Str(s) => Json::String(s.clone()),
        Value::Sequence(items) => Json::Array(items.iter().map(to_json).collect::<BridgeResult<_>>()?),
        Value::Matrix(m) => Json::Array(
            m.iter_rows()
                .map(|row| Json::Array(row.iter().map(|f| json_float(*f)).collect()))
                .collect(),
        ),
        Value::Mapping(m) => Json::Object(
            m.iter()
                .map(|(k, v)| Ok::<_, BridgeError>((k.to_string(), to_json(v)?)))
                .collect::<BridgeResult<_>>()?,
        ),
    })
}

fn json_float(f: f64) -> serde_json::Value {
    match serde_json::Number::from_f64(f) {
        Some(n) => serde_json::Value::Number(n),
        None => {
            let name = if f.is_nan() {
                "nan"
            } else if f > 0.0 {
                "inf"
            } else {
                "-inf"
            };
            let mut tag = serde_json::Map::new();
            tag.insert(NON_FINITE_TAG.to_string(), serde_json::Value::from(name));
            serde_json::Value::Object(tag)
        }
    }
}

fn tagged_float(fields: &serde_json::Map<String, serde_json::Value>) -> Option<f64> {
    if fields.len() != 1 {
        return None;
    }
    match fields.get(NON_FINITE_TAG)?.as_str()? {
        "inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        "nan" => Some(f64::NAN),
        _ => None,
    }
}

/// Decode JSON into a host value.
///
/// Arrays of numeric rows become matrices under the same rule as
/// unmarshalled lists; ragged numeric rows fail.
pub fn from_json(json: &serde_json::Value) -> BridgeResult<Value> {
    use serde_json::Value as Json;

    Ok(match json {
        Json::Null => Value::None,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(s) => Value::Str(s.clone()),
        Json::Array(items) => promote_rows(items.iter().map(from_json).collect::<BridgeResult<_>>()?)?,
        Json::Object(fields) => match tagged_float(fields) {
            Some(f) => Value::Float(f),
            None => {
                let mut mapping = Mapping::new();
                for (k, v) in fields {
                    mapping.insert(k.as_str(), from_json(v)?);
                }
                Value::Mapping(mapping)
            }
        },
    })
}

/// Parse JSON text into a host value.
///
/// Accepts the bare `NaN` and `Infinity` tokens Python writes by default.
pub fn parse_json(text: &str) -> BridgeResult<Value> {
    let text = tag_python_constants(text);
    let json: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| BridgeError::marshalling(format!("invalid JSON output: {}", e)))?;
    from_json(&json)
}

fn tag_python_constants(text: &str) -> Cow<'_, str> {
    if !text.contains("NaN") && !text.contains("Infinity") {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len() + 32);
    let mut in_string = false;
    let mut escaped = false;
    let mut rest = text;
    while let Some(c) = rest.chars().next() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
        } else if c == '"' {
            in_string = true;
        } else if let Some((token, name)) = PYTHON_CONSTANTS.iter().find(|(token, _)| rest.starts_with(token)) {
            out.push_str(&format!("{{\"{}\":\"{}\"}}", NON_FINITE_TAG, name));
            rest = &rest[token.len()..];
            continue;
        }
        out.push(c);
        rest = &rest[c.len_utf8()..];
    }
    Cow::Owned(out)
}

/// Builder for Python dicts, used by native modules to shape results
#[derive(Debug, Default)]
pub struct PyDictBuilder {
    items: IndexMap<SmolStr, PyValue>,
}

impl PyDictBuilder {
    /// Create a new empty dict builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key-value pair
    pub fn insert(mut self, key: impl Into<SmolStr>, value: impl ToPython) -> Self {
        self.items.insert(key.into(), value.to_python());
        self
    }

    /// Build the final dict
    pub fn build(self) -> PyValue {
        PyValue::Dict(self.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_to_python_primitives() {
        assert_eq!(42i64.to_python(), PyValue::Int(42));
        assert_eq!(2.5f64.to_python(), PyValue::Float(2.5));
        assert_eq!(true.to_python(), PyValue::Bool(true));
        assert_eq!("hello".to_python(), PyValue::Str("hello".into()));
        assert_eq!(().to_python(), PyValue::None);
        assert_eq!(None::<i64>.to_python(), PyValue::None);
    }

    #[test]
    fn test_matrix_to_python_is_list_of_rows() {
        let m = Matrix::from_rows(&[[1.0, 2.0], [3.0, 4.0]]).unwrap();
        assert_eq!(
            m.to_python(),
            PyValue::List(vec![
                PyValue::List(vec![PyValue::Float(1.0), PyValue::Float(2.0)]),
                PyValue::List(vec![PyValue::Float(3.0), PyValue::Float(4.0)]),
            ])
        );
    }

    #[test]
    fn test_matrix_round_trip_preserves_shape_and_order() {
        let shapes = [(1, 1), (2, 3), (3, 2), (4, 4), (1, 5), (5, 1)];
        for (rows, cols) in shapes {
            let data = (0..rows * cols).map(|i| i as f64 * 0.5 - 3.25).collect();
            let m = Matrix::from_vec(rows, cols, data).unwrap();
            let back = Matrix::from_python(&m.to_python()).unwrap();
            assert_eq!(back, m, "shape {}x{}", rows, cols);
        }
    }

    #[test]
    fn test_matrix_value_survives_marshal_and_unmarshal() {
        let shapes = [(1, 1), (2, 3), (3, 2), (4, 4), (1, 5), (5, 1)];
        for (rows, cols) in shapes {
            let data = (0..rows * cols).map(|i| i as f64 * 0.5 - 3.25).collect();
            let value = Value::Matrix(Matrix::from_vec(rows, cols, data).unwrap());
            let back = unmarshal(&value.to_python()).unwrap();
            assert_eq!(back, value, "shape {}x{}", rows, cols);
        }

        // Integer-valued floats are still floats on the interpreter side
        let whole = Value::Matrix(Matrix::from_rows(&[[1.0, 0.0], [0.0, 1.0]]).unwrap());
        assert_eq!(unmarshal(&whole.to_python()).unwrap(), whole);
    }

    #[test]
    fn test_unmarshal_row_rules() {
        let mixed = PyValue::List(vec![
            PyValue::List(vec![PyValue::Int(1), PyValue::Float(2.5)]),
            PyValue::List(vec![PyValue::Int(3), PyValue::Int(4)]),
        ]);
        assert_eq!(
            unmarshal(&mixed).unwrap(),
            Value::Matrix(Matrix::from_rows(&[[1.0, 2.5], [3.0, 4.0]]).unwrap())
        );

        let ints = PyValue::List(vec![PyValue::List(vec![PyValue::Int(1), PyValue::Int(2)])]);
        assert_eq!(
            unmarshal(&ints).unwrap(),
            Value::Sequence(vec![Value::Sequence(vec![Value::Int(1), Value::Int(2)])])
        );

        let tuple_rows = PyValue::Tuple(vec![PyValue::List(vec![PyValue::Float(1.0)])]);
        assert!(matches!(unmarshal(&tuple_rows).unwrap(), Value::Sequence(_)));

        let ragged = PyValue::List(vec![
            PyValue::List(vec![PyValue::Float(1.0), PyValue::Float(2.0)]),
            PyValue::List(vec![PyValue::Float(3.0)]),
        ]);
        assert!(unmarshal(&ragged).unwrap_err().is_marshalling());

        let labelled = PyValue::List(vec![PyValue::List(vec![PyValue::Float(1.0), PyValue::Str("x".into())])]);
        assert!(matches!(unmarshal(&labelled).unwrap(), Value::Sequence(_)));
    }

    #[test]
    fn test_float_precision_is_preserved() {
        let v = 0.1f64 + 0.2f64;
        assert_eq!(f64::from_python(&v.to_python()).unwrap().to_bits(), v.to_bits());
    }

    #[test]
    fn test_ragged_matrix_is_rejected_whole() {
        let ragged = PyValue::List(vec![
            PyValue::List(vec![PyValue::Int(1), PyValue::Int(2)]),
            PyValue::List(vec![PyValue::Int(3)]),
        ]);
        let err = Matrix::from_python(&ragged).unwrap_err();
        assert!(err.is_marshalling());
    }

    #[test]
    fn test_from_python_numeric_rules() {
        assert_eq!(f64::from_python(&PyValue::Int(42)).unwrap(), 42.0);
        assert_eq!(i64::from_python(&PyValue::Float(42.0)).unwrap(), 42);
        assert!(i64::from_python(&PyValue::Float(42.5)).is_err());
        assert!(i64::from_python(&PyValue::Bool(true)).is_err());
        assert!(i32::from_python(&PyValue::Int(1 << 40)).is_err());
        assert!(usize::from_python(&PyValue::Int(-1)).is_err());
    }

    #[test]
    fn test_from_python_type_mismatch() {
        let err = i64::from_python(&PyValue::Str("hello".into())).unwrap_err();
        assert!(err.is_marshalling());
        assert!(err.to_string().contains("expected int, got str"));
    }

    #[test]
    fn test_unmarshal_dict_to_mapping() {
        let py = PyDictBuilder::new()
            .insert("S", vec![9.5, 0.75])
            .insert("rank", 2i64)
            .build();
        let value = unmarshal(&py).unwrap();
        let mapping = value.into_mapping().unwrap();
        assert_eq!(mapping.get_as::<Vec<f64>>("S").unwrap(), vec![9.5, 0.75]);
        assert_eq!(mapping.get_as::<i64>("rank").unwrap(), 2);
    }

    #[test]
    fn test_unmarshal_then_marshal_is_identity_for_lists() {
        let py = PyValue::List(vec![
            PyValue::Int(1),
            PyValue::Str("a".into()),
            PyValue::List(vec![PyValue::Float(1.5), PyValue::None]),
            PyValue::dict([("ok", PyValue::Bool(true))]),
        ]);
        assert_eq!(unmarshal(&py).unwrap().to_python(), py);
    }

    #[test]
    fn test_json_round_trip() {
        let value = Value::Mapping(
            Mapping::new()
                .with("U", Matrix::from_rows(&[[1.0, 0.0], [0.0, 1.0]]).unwrap())
                .with("label", "svd")
                .with("rank", 2i64),
        );
        let json = to_json(&value).unwrap();
        assert_eq!(json["U"][1][1], serde_json::json!(1.0));

        let back = from_json(&json).unwrap().into_mapping().unwrap();
        assert!(matches!(back.get("U"), Some(Value::Matrix(_))));
        let u: Matrix = back.get_as("U").unwrap();
        assert_eq!(u.shape(), (2, 2));
        assert_eq!(back.get_as::<String>("label").unwrap(), "svd");
    }

    #[test]
    fn test_json_non_finite_round_trip() {
        let value = Value::Mapping(
            Mapping::new()
                .with("cond", f64::INFINITY)
                .with("low", f64::NEG_INFINITY)
                .with("undefined", f64::NAN)
                .with("rows", Matrix::from_rows(&[[1.0, f64::INFINITY]]).unwrap()),
        );
        let json = to_json(&value).unwrap();
        assert_eq!(json["cond"], serde_json::json!({"$float": "inf"}));

        let back = parse_json(&json.to_string()).unwrap().into_mapping().unwrap();
        assert_eq!(back.get_as::<f64>("cond").unwrap(), f64::INFINITY);
        assert_eq!(back.get_as::<f64>("low").unwrap(), f64::NEG_INFINITY);
        assert!(back.get_as::<f64>("undefined").unwrap().is_nan());
        let rows: Matrix = back.get_as("rows").unwrap();
        assert_eq!(rows.get(0, 1), Some(f64::INFINITY));
    }

    #[test]
    fn test_parse_json_accepts_python_constants() {
        let text = r#"{"a": Infinity, "b": [-Infinity, NaN], "s": "NaN \" Infinity"}"#;
        let back = parse_json(text).unwrap().into_mapping().unwrap();
        assert_eq!(back.get_as::<f64>("a").unwrap(), f64::INFINITY);
        let b: Vec<f64> = back.get_as("b").unwrap();
        assert_eq!(b[0], f64::NEG_INFINITY);
        assert!(b[1].is_nan());
        assert_eq!(back.get_as::<String>("s").unwrap(), "NaN \" Infinity");
    }

    #[test]
    fn test_tag_lookalike_objects_stay_mappings() {
        let back = parse_json(r#"{"$float": "huge"}"#).unwrap();
        assert!(matches!(back, Value::Mapping(_)));
        let back = parse_json(r#"{"$float": "inf", "other": 1}"#).unwrap();
        assert_eq!(back.as_mapping().unwrap().len(), 2);
    }

    #[test]
    fn test_json_float_rows_become_matrix() {
        let back = parse_json("[[1.0, 2], [3, 4.5]]").unwrap();
        assert_eq!(back, Value::Matrix(Matrix::from_rows(&[[1.0, 2.0], [3.0, 4.5]]).unwrap()));

        let ints = parse_json("[[1, 2], [3, 4]]").unwrap();
        assert!(matches!(ints, Value::Sequence(_)));

        assert!(parse_json("[[1.0, 2.0], [3.0]]").unwrap_err().is_marshalling());
    }

    #[test]
    fn test_parse_json_error_is_marshalling() {
        let err = parse_json("not json").unwrap_err();
        assert!(err.is_marshalling());
    }
}
