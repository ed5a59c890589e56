//! Encoding of [`Value`] to and from wire JSON.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Map, Number};
use thiserror::Error;

use crate::codec::{Complex, ComplexNdArray, NdArray, Value};

/// Marker key identifying an encoded numeric array.
const ARRAY_MARKER: &str = "ndarray";

/// Errors raised while encoding or decoding wire values.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Array buffer of {0} bytes is not a whole number of f64 values")]
    ByteLength(usize),

    #[error("Shape holds {expected} elements but data has {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("Encoded array is missing field `{0}`")]
    MissingField(&'static str),

    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("Rows of a matrix must all have the same length")]
    Ragged,

    #[error("Sparse matrices cannot be encoded inline; assign them with set_variable")]
    SparseNotInline,
}

/// Encode a value into its wire representation.
pub fn encode(value: &Value) -> Result<serde_json::Value, CodecError> {
    let encoded = match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => match Number::from_f64(*n) {
            Some(num) => serde_json::Value::Number(num),
            // JSON has no NaN/Inf; a 1x1 array keeps the bit pattern intact
            None => encode_real(&[1, 1], &[*n]),
        },
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::Complex(c) => json!({ "real": c.re, "imag": c.im }),
        Value::Array(a) => encode_real(&normalized_shape(a.shape()), a.data()),
        Value::ComplexArray(a) => json!({
            ARRAY_MARKER: true,
            "shape": normalized_shape(a.shape()),
            "real": pack_f64(a.re()),
            "imag": pack_f64(a.im()),
        }),
        Value::Sparse(_) => return Err(CodecError::SparseNotInline),
        Value::List(items) => serde_json::Value::Array(
            items.iter().map(encode).collect::<Result<Vec<_>, _>>()?,
        ),
        Value::Struct(fields) => {
            let mut obj = Map::with_capacity(fields.len());
            for (k, v) in fields {
                obj.insert(k.clone(), encode(v)?);
            }
            serde_json::Value::Object(obj)
        }
    };
    Ok(encoded)
}

/// Decode a wire value into a native [`Value`].
///
/// Malformed array payloads are errors, never silently dropped: they mean
/// client and engine no longer agree on the format.
pub fn decode(wire: &serde_json::Value) -> Result<Value, CodecError> {
    let value = match wire {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(items) => {
            Value::List(items.iter().map(decode).collect::<Result<Vec<_>, _>>()?)
        }
        serde_json::Value::Object(obj) => decode_object(obj)?,
    };
    Ok(value)
}

fn decode_object(obj: &Map<String, serde_json::Value>) -> Result<Value, CodecError> {
    if is_marked_array(obj) {
        let shape = decode_shape(obj.get("shape").ok_or(CodecError::MissingField("shape"))?)?;

        if let Some(data) = obj.get("data") {
            let data = unpack_f64(data)?;
            return Ok(Value::Array(NdArray::new(shape, data)?));
        }

        let re = unpack_f64(obj.get("real").ok_or(CodecError::MissingField("real"))?)?;
        let im = unpack_f64(obj.get("imag").ok_or(CodecError::MissingField("imag"))?)?;
        return Ok(Value::ComplexArray(ComplexNdArray::new(shape, re, im)?));
    }

    if obj.len() == 2 {
        if let (Some(re), Some(im)) = (
            obj.get("real").and_then(serde_json::Value::as_f64),
            obj.get("imag").and_then(serde_json::Value::as_f64),
        ) {
            return Ok(Value::Complex(Complex::new(re, im)));
        }
    }

    let mut fields = BTreeMap::new();
    for (k, v) in obj {
        fields.insert(k.clone(), decode(v)?);
    }
    Ok(Value::Struct(fields))
}

fn is_marked_array(obj: &Map<String, serde_json::Value>) -> bool {
    match obj.get(ARRAY_MARKER) {
        Some(serde_json::Value::Bool(b)) => *b,
        // MATLAB's JSON writer emits logical true as 1
        Some(serde_json::Value::Number(n)) => n.as_f64() == Some(1.0),
        _ => false,
    }
}

fn encode_real(shape: &[usize], data: &[f64]) -> serde_json::Value {
    json!({
        ARRAY_MARKER: true,
        "shape": shape,
        "data": pack_f64(data),
    })
}

/// One-dimensional arrays go out as `(1, n)` row vectors so the engine
/// never confuses them with scalars.
fn normalized_shape(shape: &[usize]) -> Vec<usize> {
    match shape {
        [n] => vec![1, *n],
        other => other.to_vec(),
    }
}

fn pack_f64(data: &[f64]) -> String {
    let bytes: Vec<u8> = data.iter().flat_map(|x| x.to_le_bytes()).collect();
    STANDARD.encode(bytes)
}

fn unpack_f64(field: &serde_json::Value) -> Result<Vec<f64>, CodecError> {
    let text = field
        .as_str()
        .ok_or_else(|| CodecError::InvalidShape("array buffer is not a string".to_string()))?;
    let bytes = STANDARD.decode(text)?;
    if bytes.len() % 8 != 0 {
        return Err(CodecError::ByteLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            f64::from_le_bytes(buf)
        })
        .collect())
}

fn decode_shape(field: &serde_json::Value) -> Result<Vec<usize>, CodecError> {
    let dims = match field {
        serde_json::Value::Array(dims) => dims.as_slice(),
        // A scalar shape shows up when the engine serializes a 1-element dims vector
        serde_json::Value::Number(_) => std::slice::from_ref(field),
        other => return Err(CodecError::InvalidShape(other.to_string())),
    };
    dims.iter()
        .map(|d| {
            d.as_u64()
                .or_else(|| {
                    d.as_f64()
                        .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                        .map(|f| f as u64)
                })
                .and_then(|d| usize::try_from(d).ok())
                .ok_or_else(|| CodecError::InvalidShape(d.to_string()))
        })
        .collect()
}
