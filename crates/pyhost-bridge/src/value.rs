//! Host-side values
//!
//! Everything a caller passes into or receives from the bridge is a
//! [`Value`]. Matrices are a first-class variant so their rectangular
//! shape is checked once, at construction, instead of at every use.

use std::fmt;

use indexmap::IndexMap;
use smol_str::SmolStr;

use crate::error::{BridgeError, BridgeResult};

/// A host-native value crossing the bridge.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Absent value (`None` on the Python side)
    #[default]
    None,
    /// Boolean scalar
    Bool(bool),
    /// Signed integer scalar
    Int(i64),
    /// Double precision scalar
    Float(f64),
    /// UTF-8 string
    Str(String),
    /// Ordered, possibly heterogeneous sequence
    Sequence(Vec<Value>),
    /// Rectangular matrix of doubles
    Matrix(Matrix),
    /// Named fields
    Mapping(Mapping),
}

impl Value {
    /// Short name of the variant, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Sequence(_) => "sequence",
            Value::Matrix(_) => "matrix",
            Value::Mapping(_) => "mapping",
        }
    }

    /// Sequence of floats
    pub fn floats(items: impl IntoIterator<Item = f64>) -> Self {
        Value::Sequence(items.into_iter().map(Value::Float).collect())
    }

    /// Numeric view of a scalar (ints widen to f64)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    /// Try to borrow as mapping
    pub fn as_mapping(&self) -> Option<&Mapping> {
        match self {
            Value::Mapping(m) => Some(m),
            _ => None,
        }
    }

    /// Convert into a mapping, failing for any other shape
    pub fn into_mapping(self) -> BridgeResult<Mapping> {
        match self {
            Value::Mapping(m) => Ok(m),
            other => Err(BridgeError::type_mismatch("mapping", other.kind())),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Matrix> for Value {
    fn from(v: Matrix) -> Self {
        Value::Matrix(v)
    }
}

impl From<Mapping> for Value {
    fn from(v: Mapping) -> Self {
        Value::Mapping(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Sequence(v)
    }
}

// ============================================================================
// Matrix
// ============================================================================

/// Dense row-major matrix of doubles.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    /// Build from row slices. Every row must have the same length.
    pub fn from_rows<R: AsRef<[f64]>>(rows: &[R]) -> BridgeResult<Self> {
        let cols = rows.first().map_or(0, |r| r.as_ref().len());
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            if row.len() != cols {
                return Err(ragged_row(i, cols, row.len()));
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data,
        })
    }

    /// Build from row-major data with an explicit shape
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> BridgeResult<Self> {
        if rows * cols != data.len() {
            return Err(BridgeError::marshalling(format!(
                "{} elements cannot fill a {}x{} matrix",
                data.len(),
                rows,
                cols
            )));
        }
        Ok(Self { rows, cols, data })
    }

    /// All-zero matrix
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Number of rows
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// `(rows, cols)`
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Check if the matrix has no elements
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Element at `(row, col)`
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row < self.rows && col < self.cols {
            Some(self.data[row * self.cols + col])
        } else {
            None
        }
    }

    /// Overwrite element at `(row, col)`; panics when out of bounds
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        assert!(row < self.rows && col < self.cols, "matrix index out of bounds");
        self.data[row * self.cols + col] = value;
    }

    /// Borrow one row
    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    /// Iterate over rows
    pub fn iter_rows(&self) -> impl Iterator<Item = &[f64]> {
        (0..self.rows).map(move |r| self.row(r))
    }

    /// Copy out as nested vectors
    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        self.iter_rows().map(<[f64]>::to_vec).collect()
    }

    /// Row-major element storage
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Transposed copy
    pub fn transpose(&self) -> Matrix {
        let mut out = Matrix::zeros(self.cols, self.rows);
        for r in 0..self.rows {
            for c in 0..self.cols {
                out.data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        out
    }
}

impl fmt::Display for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, row) in self.iter_rows().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}", row)?;
        }
        write!(f, "]")
    }
}

fn ragged_row(row: usize, expected: usize, actual: usize) -> BridgeError {
    BridgeError::marshalling(format!(
        "matrix row {} has {} elements, expected {}",
        row, actual, expected
    ))
}

// ============================================================================
// Mapping
// ============================================================================

/// Named-field result. Fields are accessed by name, never by position.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Mapping {
    fields: IndexMap<SmolStr, Value>,
}

impl Mapping {
    /// Create an empty mapping
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a field
    pub fn insert(&mut self, name: impl Into<SmolStr>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<SmolStr>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Borrow a field, failing if it is absent
    pub fn field(&self, name: &str) -> BridgeResult<&Value> {
        self.fields
            .get(name)
            .ok_or_else(|| BridgeError::missing_field(name))
    }

    /// Borrow a field if present
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Extract a field as a typed host value
    pub fn get_as<'a, T>(&'a self, name: &str) -> BridgeResult<T>
    where
        T: TryFrom<&'a Value, Error = BridgeError>,
    {
        T::try_from(self.field(name)?).map_err(|e| match e {
            BridgeError::Marshalling { reason } => {
                BridgeError::marshalling(format!("field '{}': {}", name, reason))
            }
            other => other,
        })
    }

    /// Check if a field exists
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if there are no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field names in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(SmolStr::as_str)
    }

    /// Iterate over fields in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<SmolStr>> FromIterator<(K, Value)> for Mapping {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

// ============================================================================
// Typed extraction from host values
// ============================================================================

impl TryFrom<&Value> for f64 {
    type Error = BridgeError;

    fn try_from(value: &Value) -> BridgeResult<Self> {
        value
            .as_f64()
            .ok_or_else(|| BridgeError::type_mismatch("float", value.kind()))
    }
}

impl TryFrom<&Value> for i64 {
    type Error = BridgeError;

    fn try_from(value: &Value) -> BridgeResult<Self> {
        match value {
            Value::Int(n) => Ok(*n),
            Value::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(*f as i64),
            Value::Float(f) => Err(BridgeError::numeric_overflow(f, "int without rounding")),
            other => Err(BridgeError::type_mismatch("int", other.kind())),
        }
    }
}

impl TryFrom<&Value> for bool {
    type Error = BridgeError;

    fn try_from(value: &Value) -> BridgeResult<Self> {
        match value {
            Value::Bool(b) => Ok(*b),
            other => Err(BridgeError::type_mismatch("bool", other.kind())),
        }
    }
}

impl TryFrom<&Value> for String {
    type Error = BridgeError;

    fn try_from(value: &Value) -> BridgeResult<Self> {
        match value {
            Value::Str(s) => Ok(s.clone()),
            other => Err(BridgeError::type_mismatch("string", other.kind())),
        }
    }
}

impl TryFrom<&Value> for Vec<f64> {
    type Error = BridgeError;

    fn try_from(value: &Value) -> BridgeResult<Self> {
        match value {
            Value::Sequence(items) => items.iter().map(f64::try_from).collect(),
            Value::Matrix(m) if m.rows() == 1 => Ok(m.row(0).to_vec()),
            other => Err(BridgeError::type_mismatch("sequence of floats", other.kind())),
        }
    }
}

impl TryFrom<&Value> for Matrix {
    type Error = BridgeError;

    fn try_from(value: &Value) -> BridgeResult<Self> {
        match value {
            Value::Matrix(m) => Ok(m.clone()),
            Value::Sequence(rows) => {
                let rows = rows
                    .iter()
                    .map(Vec::<f64>::try_from)
                    .collect::<BridgeResult<Vec<_>>>()?;
                Matrix::from_rows(&rows)
            }
            other => Err(BridgeError::type_mismatch("matrix", other.kind())),
        }
    }
}

impl TryFrom<&Value> for Mapping {
    type Error = BridgeError;

    fn try_from(value: &Value) -> BridgeResult<Self> {
        value
            .as_mapping()
            .cloned()
            .ok_or_else(|| BridgeError::type_mismatch("mapping", value.kind()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_matrix_from_rows() {
        let m = Matrix::from_rows(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]).unwrap();
        assert_eq!(m.shape(), (2, 3));
        assert_eq!(m.row(1), &[4.0, 5.0, 6.0]);
        assert_eq!(m.get(0, 2), Some(3.0));
        assert_eq!(m.get(2, 0), None);
    }

    #[test]
    fn test_matrix_ragged_rows_rejected() {
        let rows = vec![vec![1.0, 2.0], vec![3.0]];
        let err = Matrix::from_rows(&rows).unwrap_err();
        assert!(err.is_marshalling());
        assert!(err.to_string().contains("row 1"));
    }

    #[test]
    fn test_matrix_transpose() {
        let m = Matrix::from_rows(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]).unwrap();
        let t = m.transpose();
        assert_eq!(t.shape(), (3, 2));
        assert_eq!(t.to_rows(), vec![vec![1.0, 4.0], vec![2.0, 5.0], vec![3.0, 6.0]]);
    }

    #[test]
    fn test_matrix_from_vec_shape_check() {
        assert!(Matrix::from_vec(2, 2, vec![1.0; 4]).is_ok());
        assert!(Matrix::from_vec(2, 3, vec![1.0; 4]).is_err());
    }

    #[test]
    fn test_mapping_field_access() {
        let mapping = Mapping::new()
            .with("final_loss", 0.25)
            .with("epochs", 200i64);

        assert_eq!(mapping.get_as::<f64>("final_loss").unwrap(), 0.25);
        assert_eq!(mapping.get_as::<i64>("epochs").unwrap(), 200);
        assert_eq!(mapping.keys().collect::<Vec<_>>(), vec!["final_loss", "epochs"]);

        let err = mapping.field("result").unwrap_err();
        assert!(err.is_marshalling());
    }

    #[test]
    fn test_mapping_typed_mismatch_names_field() {
        let mapping = Mapping::new().with("device_name", "cpu");
        let err = mapping.get_as::<f64>("device_name").unwrap_err();
        assert!(err.to_string().contains("field 'device_name'"));
    }

    #[test]
    fn test_int_extraction_refuses_rounding() {
        assert_eq!(i64::try_from(&Value::Float(4.0)).unwrap(), 4);
        assert!(i64::try_from(&Value::Float(4.5)).is_err());
    }

    #[test]
    fn test_matrix_from_nested_sequence() {
        let nested = Value::Sequence(vec![
            Value::floats([1.0, 2.0]),
            Value::Sequence(vec![Value::Int(3), Value::Float(4.0)]),
        ]);
        let m = Matrix::try_from(&nested).unwrap();
        assert_eq!(m.to_rows(), vec![vec![1.0, 2.0], vec![3.0, 4.0]]);

        let ragged = Value::Sequence(vec![Value::floats([1.0, 2.0]), Value::floats([3.0])]);
        assert!(Matrix::try_from(&ragged).is_err());
    }
}
