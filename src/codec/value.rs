//! Native value model for data exchanged with the engine.

use std::collections::BTreeMap;
use std::fmt;

use crate::codec::CodecError;

/// A complex scalar.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Complex {
    pub re: f64,
    pub im: f64,
}

impl Complex {
    pub fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }
}

impl fmt::Display for Complex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.im.is_sign_negative() {
            write!(f, "{}-{}i", self.re, -self.im)
        } else {
            write!(f, "{}+{}i", self.re, self.im)
        }
    }
}

/// Dense real array stored in column-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl NdArray {
    /// Build an array from column-major data.
    ///
    /// Fails if the element count does not match the product of `shape`.
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self, CodecError> {
        let expected = element_count(&shape)?;
        if expected != data.len() {
            return Err(CodecError::ShapeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// One-dimensional array of `data.len()` elements.
    pub fn vector(data: Vec<f64>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    /// Row vector of shape `(1, n)`.
    pub fn row(data: Vec<f64>) -> Self {
        Self {
            shape: vec![1, data.len()],
            data,
        }
    }

    pub fn zeros(shape: Vec<usize>) -> Result<Self, CodecError> {
        let n = element_count(&shape)?;
        Ok(Self {
            shape,
            data: vec![0.0; n],
        })
    }

    /// Build a 2-D array from row-major nested rows, the way matrices are
    /// usually written down in source code.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, CodecError> {
        let nrows = rows.len();
        let ncols = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|r| r.len() != ncols) {
            return Err(CodecError::Ragged);
        }

        let mut data = Vec::with_capacity(nrows * ncols);
        for c in 0..ncols {
            for row in rows {
                data.push(row[c]);
            }
        }
        Ok(Self {
            shape: vec![nrows, ncols],
            data,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Elements in column-major order.
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Element at a multi-index, `None` if out of bounds or of the wrong rank.
    pub fn get(&self, index: &[usize]) -> Option<f64> {
        column_major_offset(&self.shape, index).map(|i| self.data[i])
    }

    /// Row-major nested rows of a 2-D array (vectors count as one row).
    pub fn to_rows(&self) -> Option<Vec<Vec<f64>>> {
        let (nrows, ncols) = match self.shape.as_slice() {
            [n] => (1, *n),
            [r, c] => (*r, *c),
            _ => return None,
        };
        Some(
            (0..nrows)
                .map(|r| (0..ncols).map(|c| self.data[r + c * nrows]).collect())
                .collect(),
        )
    }
}

/// Dense complex array with separate real and imaginary buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplexNdArray {
    shape: Vec<usize>,
    re: Vec<f64>,
    im: Vec<f64>,
}

impl ComplexNdArray {
    /// Build from column-major real and imaginary parts of equal length.
    pub fn new(shape: Vec<usize>, re: Vec<f64>, im: Vec<f64>) -> Result<Self, CodecError> {
        let expected = element_count(&shape)?;
        for part in [&re, &im] {
            if part.len() != expected {
                return Err(CodecError::ShapeMismatch {
                    expected,
                    actual: part.len(),
                });
            }
        }
        Ok(Self { shape, re, im })
    }

    pub fn from_elements(shape: Vec<usize>, elements: &[Complex]) -> Result<Self, CodecError> {
        let re = elements.iter().map(|c| c.re).collect();
        let im = elements.iter().map(|c| c.im).collect();
        Self::new(shape, re, im)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn re(&self) -> &[f64] {
        &self.re
    }

    pub fn im(&self) -> &[f64] {
        &self.im
    }

    pub fn len(&self) -> usize {
        self.re.len()
    }

    pub fn is_empty(&self) -> bool {
        self.re.is_empty()
    }

    pub fn get(&self, index: &[usize]) -> Option<Complex> {
        column_major_offset(&self.shape, index).map(|i| Complex::new(self.re[i], self.im[i]))
    }
}

/// Sparse real matrix in coordinate form with 0-based indices.
///
/// Duplicate coordinates accumulate, matching the engine's `sparse()`.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseMatrix {
    rows: usize,
    cols: usize,
    entries: Vec<(usize, usize, f64)>,
}

impl SparseMatrix {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            entries: Vec::new(),
        }
    }

    pub fn from_triplets(
        rows: usize,
        cols: usize,
        triplets: impl IntoIterator<Item = (usize, usize, f64)>,
    ) -> Result<Self, CodecError> {
        let mut matrix = Self::new(rows, cols);
        for (r, c, v) in triplets {
            matrix.push(r, c, v)?;
        }
        Ok(matrix)
    }

    /// Add a non-zero entry.
    pub fn push(&mut self, row: usize, col: usize, value: f64) -> Result<(), CodecError> {
        if row >= self.rows || col >= self.cols {
            return Err(CodecError::InvalidShape(format!(
                "entry ({}, {}) outside {}x{} sparse matrix",
                row, col, self.rows, self.cols
            )));
        }
        self.entries.push((row, col, value));
        Ok(())
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn entries(&self) -> &[(usize, usize, f64)] {
        &self.entries
    }

    pub fn nnz(&self) -> usize {
        self.entries.len()
    }

    /// Dense equivalent; fails if `rows * cols` does not fit in memory indices.
    pub fn to_dense(&self) -> Result<NdArray, CodecError> {
        let mut dense = NdArray::zeros(vec![self.rows, self.cols])?;
        for &(r, c, v) in &self.entries {
            dense.data[r + c * self.rows] += v;
        }
        Ok(dense)
    }

    /// Row vectors of 1-based row indices, 1-based column indices and values,
    /// ready to be fed to the engine's `sparse(i, j, v, m, n)`.
    pub fn to_triplet_arrays(&self) -> (NdArray, NdArray, NdArray) {
        let rows = self.entries.iter().map(|e| (e.0 + 1) as f64).collect();
        let cols = self.entries.iter().map(|e| (e.1 + 1) as f64).collect();
        let vals = self.entries.iter().map(|e| e.2).collect();
        (NdArray::row(rows), NdArray::row(cols), NdArray::row(vals))
    }
}

/// A value that can cross the engine boundary.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Complex(Complex),
    Array(NdArray),
    ComplexArray(ComplexNdArray),
    Sparse(SparseMatrix),
    List(Vec<Value>),
    Struct(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric scalar view. One-element arrays count as scalars since the
    /// engine does not distinguish the two.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Array(a) if a.len() == 1 => Some(a.data()[0]),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&NdArray> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Split a multi-output result into its outputs.
    ///
    /// Engines report `nargout > 1` results as a list; anything else is a
    /// single output.
    pub fn into_outputs(self) -> Vec<Value> {
        match self {
            Value::List(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        }
    }

    /// Short type name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Complex(_) => "complex",
            Value::Array(_) => "array",
            Value::ComplexArray(_) => "complex array",
            Value::Sparse(_) => "sparse",
            Value::List(_) => "list",
            Value::Struct(_) => "struct",
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Number(f64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(v as f64)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Number(v as f64)
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

impl From<Complex> for Value {
    fn from(v: Complex) -> Self {
        Value::Complex(v)
    }
}

impl From<NdArray> for Value {
    fn from(v: NdArray) -> Self {
        Value::Array(v)
    }
}

impl From<ComplexNdArray> for Value {
    fn from(v: ComplexNdArray) -> Self {
        Value::ComplexArray(v)
    }
}

impl From<SparseMatrix> for Value {
    fn from(v: SparseMatrix) -> Self {
        Value::Sparse(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Array(NdArray::vector(v))
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Struct(v)
    }
}

fn element_count(shape: &[usize]) -> Result<usize, CodecError> {
    shape
        .iter()
        .try_fold(1usize, |n, &dim| n.checked_mul(dim))
        .ok_or_else(|| CodecError::InvalidShape(format!("{:?} overflows the element count", shape)))
}

fn column_major_offset(shape: &[usize], index: &[usize]) -> Option<usize> {
    if index.len() != shape.len() {
        return None;
    }
    let mut offset = 0;
    let mut stride = 1;
    for (&i, &dim) in index.iter().zip(shape) {
        if i >= dim {
            return None;
        }
        offset += i * stride;
        stride *= dim;
    }
    Some(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_from_rows_is_column_major() {
        let a = NdArray::from_rows(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap();
        assert_eq!(a.shape(), &[2, 3]);
        assert_eq!(a.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert_eq!(a.get(&[1, 2]), Some(6.0));
        assert_eq!(a.get(&[2, 0]), None);
        assert_eq!(
            a.to_rows().unwrap(),
            vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]
        );
    }

    #[test]
    fn test_from_rows_rejects_ragged() {
        let err = NdArray::from_rows(&[vec![1.0, 2.0], vec![3.0]]).unwrap_err();
        assert!(matches!(err, CodecError::Ragged));
    }

    #[test]
    fn test_new_checks_element_count() {
        assert!(NdArray::new(vec![2, 2], vec![1.0; 4]).is_ok());
        let err = NdArray::new(vec![2, 3], vec![1.0; 5]).unwrap_err();
        assert!(matches!(
            err,
            CodecError::ShapeMismatch {
                expected: 6,
                actual: 5
            }
        ));
    }

    #[test]
    fn test_three_dimensional_indexing() {
        let data: Vec<f64> = (0..24).map(|i| i as f64).collect();
        let a = NdArray::new(vec![2, 3, 4], data).unwrap();
        // offset = i + 2*j + 6*k
        assert_eq!(a.get(&[1, 2, 3]), Some(23.0));
        assert_eq!(a.get(&[0, 1, 2]), Some(14.0));
    }

    #[test]
    fn test_sparse_to_dense_accumulates_duplicates() {
        let s = SparseMatrix::from_triplets(3, 2, [(0, 0, 1.0), (2, 1, 4.0), (2, 1, 1.0)]).unwrap();
        let dense = s.to_dense().unwrap();
        assert_eq!(dense.shape(), &[3, 2]);
        assert_eq!(dense.get(&[2, 1]), Some(5.0));
        assert_eq!(dense.get(&[1, 0]), Some(0.0));
    }

    #[test]
    fn test_sparse_triplets_are_one_based() {
        let s = SparseMatrix::from_triplets(4, 4, [(0, 3, 2.5), (3, 0, -1.0)]).unwrap();
        let (r, c, v) = s.to_triplet_arrays();
        assert_eq!(r.data(), &[1.0, 4.0]);
        assert_eq!(c.data(), &[4.0, 1.0]);
        assert_eq!(v.data(), &[2.5, -1.0]);
        assert_eq!(r.shape(), &[1, 2]);
    }

    #[test]
    fn test_sparse_push_out_of_bounds() {
        let mut s = SparseMatrix::new(2, 2);
        assert!(s.push(2, 0, 1.0).is_err());
        assert_eq!(s.nnz(), 0);
    }

    #[test]
    fn test_value_scalar_views() {
        assert_eq!(Value::from(3).as_f64(), Some(3.0));
        assert_eq!(Value::Array(NdArray::row(vec![7.0])).as_f64(), Some(7.0));
        assert_eq!(Value::from("x").as_f64(), None);
        assert_eq!(Value::from("x").as_str(), Some("x"));
    }

    #[test]
    fn test_into_outputs() {
        let multi = Value::List(vec![Value::from(1.0), Value::from(2.0)]);
        assert_eq!(multi.into_outputs().len(), 2);
        assert!(Value::Null.into_outputs().is_empty());
        assert_eq!(Value::from(5.0).into_outputs(), vec![Value::Number(5.0)]);
    }

    #[test]
    fn test_complex_display() {
        assert_eq!(Complex::new(1.0, -2.0).to_string(), "1-2i");
        assert_eq!(Complex::new(0.5, 3.0).to_string(), "0.5+3i");
    }
}
