//! Text literal and binary wire codecs for [`Vector`].
//!
//! Text form: `[x1,x2,…,xd]`, ASCII decimal floats, brackets mandatory,
//! whitespace around components tolerated. Formatting uses the shortest
//! round-tripping float representation, so `parse(format(v)) == v` bit-exact.
//!
//! Binary form: `u16 dim | u16 reserved | dim × f32`, little-endian.

use crate::error::{Result, VexError};
use crate::vector::Vector;
use std::fmt;
use std::str::FromStr;

/// Parse a vector literal.
pub fn parse_vector(input: &str) -> Result<Vector> {
    let s = input.trim();
    let inner = s
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(|| {
            VexError::bad_input(format!(
                "malformed vector literal: {input:?} (expected \"[x1,x2,...]\")"
            ))
        })?;

    if inner.trim().is_empty() {
        return Err(VexError::bad_input("vector must have at least 1 dimension"));
    }

    let mut data = Vec::new();
    for piece in inner.split(',') {
        let token = piece.trim();
        if token.is_empty() {
            return Err(VexError::bad_input(format!(
                "malformed vector literal: empty component in {input:?}"
            )));
        }
        let value: f32 = token.parse().map_err(|_| {
            VexError::bad_input(format!("invalid vector component {token:?}"))
        })?;
        data.push(value);
    }
    // Vector::new re-checks finiteness: "inf"/"nan" parse as floats but are
    // not valid components
    Vector::new(data)
}

/// Format a vector as its text literal.
pub fn format_vector(v: &Vector) -> String {
    let mut out = String::with_capacity(2 + v.dims() * 8);
    out.push('[');
    for (i, x) in v.as_slice().iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        // f32 Display is the shortest representation that round-trips
        out.push_str(&x.to_string());
    }
    out.push(']');
    out
}

impl fmt::Display for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_vector(self))
    }
}

impl FromStr for Vector {
    type Err = VexError;

    fn from_str(s: &str) -> Result<Self> {
        parse_vector(s)
    }
}

/// Encode a vector into the binary wire form.
pub fn encode_binary(v: &Vector) -> Vec<u8> {
    let dim = v.dims() as u16;
    let mut out = Vec::with_capacity(4 + v.dims() * 4);
    out.extend_from_slice(&dim.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    for x in v.as_slice() {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

/// Decode a vector from the binary wire form, validating as construction
/// would.
pub fn decode_binary(bytes: &[u8]) -> Result<Vector> {
    if bytes.len() < 4 {
        return Err(VexError::bad_input("binary vector shorter than its header"));
    }
    let dim = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
    let expected = 4 + dim * 4;
    if bytes.len() != expected {
        return Err(VexError::bad_input(format!(
            "binary vector length {} does not match dimension {dim}",
            bytes.len()
        )));
    }
    let mut data = Vec::with_capacity(dim);
    for i in 0..dim {
        let off = 4 + i * 4;
        data.push(f32::from_le_bytes([
            bytes[off],
            bytes[off + 1],
            bytes[off + 2],
            bytes[off + 3],
        ]));
    }
    Vector::new(data)
}
