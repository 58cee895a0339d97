//! Typed value ABI (C1): tagged values that cross the host/sandbox boundary
//! as single 64-bit words, plus the data-model type used everywhere else in
//! the query plane.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    Bool,
    I32,
    I64,
    F32,
    F64,
    String,
}

impl DType {
    pub fn is_numeric(self) -> bool {
        matches!(self, DType::I32 | DType::I64 | DType::F32 | DType::F64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypedValue {
    Bool(bool),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
}

impl TypedValue {
    pub fn dtype(&self) -> DType {
        match self {
            TypedValue::Bool(_) => DType::Bool,
            TypedValue::I32(_) => DType::I32,
            TypedValue::I64(_) => DType::I64,
            TypedValue::F32(_) => DType::F32,
            TypedValue::F64(_) => DType::F64,
            TypedValue::String(_) => DType::String,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TypedValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            TypedValue::I32(v) => Some(*v as f64),
            TypedValue::I64(v) => Some(*v as f64),
            TypedValue::F32(v) => Some(*v as f64),
            TypedValue::F64(v) => Some(*v),
            TypedValue::String(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TypedValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AbiError {
    #[error("expected tag {expected:?}, payload shape does not match")]
    MismatchedTag { expected: DType },

    #[error("payload is not valid for the declared tag {tag:?}")]
    InvalidPayload { tag: DType },
}

/// Encodes a fixed-width value (never `String`) into its 64-bit ABI word per
/// the table in the typed value ABI: low bits hold the two's-complement
/// integer or IEEE-754 bit pattern, high bits zero for the 32-bit tags.
pub fn to_word(value: &TypedValue) -> Result<u64, AbiError> {
    match value {
        TypedValue::Bool(b) => Ok(if *b { 1 } else { 0 }),
        TypedValue::I32(v) => Ok((*v as u32) as u64),
        TypedValue::I64(v) => Ok(*v as u64),
        TypedValue::F32(v) => Ok((v.to_bits()) as u64),
        TypedValue::F64(v) => Ok(v.to_bits()),
        TypedValue::String(_) => Err(AbiError::MismatchedTag { expected: DType::String }),
    }
}

/// The exact inverse of [`to_word`] for every fixed-width tag.
pub fn from_word(tag: DType, word: u64) -> Result<TypedValue, AbiError> {
    match tag {
        DType::Bool => match word {
            0 => Ok(TypedValue::Bool(false)),
            1 => Ok(TypedValue::Bool(true)),
            _ => Err(AbiError::InvalidPayload { tag }),
        },
        DType::I32 => Ok(TypedValue::I32(word as u32 as i32)),
        DType::I64 => Ok(TypedValue::I64(word as i64)),
        DType::F32 => Ok(TypedValue::F32(f32::from_bits(word as u32))),
        DType::F64 => Ok(TypedValue::F64(f64::from_bits(word))),
        DType::String => Err(AbiError::MismatchedTag { expected: DType::String }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_fixed_width() {
        let values = [
            TypedValue::Bool(true),
            TypedValue::Bool(false),
            TypedValue::I32(-7),
            TypedValue::I64(i64::MIN),
            TypedValue::F32(1.5),
            TypedValue::F64(-0.0),
        ];

        for v in values {
            let tag = v.dtype();
            let word = to_word(&v).unwrap();
            let back = from_word(tag, word).unwrap();
            match (&v, &back) {
                (TypedValue::F64(a), TypedValue::F64(b)) => assert_eq!(a.to_bits(), b.to_bits()),
                (TypedValue::F32(a), TypedValue::F32(b)) => assert_eq!(a.to_bits(), b.to_bits()),
                _ => assert_eq!(v, back),
            }
        }
    }

    #[test]
    fn string_cannot_cross_as_word() {
        assert!(to_word(&TypedValue::String("x".to_string())).is_err());
        assert!(from_word(DType::String, 0).is_err());
    }

    #[test]
    fn invalid_bool_payload() {
        assert_eq!(
            from_word(DType::Bool, 2),
            Err(AbiError::InvalidPayload { tag: DType::Bool })
        );
    }
}
