//! Wire codec for values crossing the engine boundary.
//!
//! Values travel as JSON. Scalars, strings, lists and structs map onto plain
//! JSON; numeric arrays are carried as base64 buffers of little-endian
//! 64-bit floats in column-major order, the layout the engine stores them in:
//!
//! ```text
//! {"ndarray": true, "shape": [2, 3], "data": "AAAAAAAA8D8AAAAAAAAAQA..."}
//! {"ndarray": true, "shape": [1, 2], "real": "...", "imag": "..."}
//! {"real": 1.0, "imag": -2.0}
//! ```
//!
//! Sparse matrices never travel inline. They are split into coordinate
//! triplets and rebuilt on the engine side, see
//! [`Session::set_variable`](crate::Session::set_variable).

mod value;
mod wire;

pub use value::{Complex, ComplexNdArray, NdArray, SparseMatrix, Value};
pub use wire::{decode, encode, CodecError};
