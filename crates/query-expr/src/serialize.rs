//! Binary serializer (C2, spec §4.2): a compact, little-endian, byte-stable
//! encoding of a validated [`Expr`] tree. This is the wire contract between
//! the query plane and the shard/engine — the exact byte layout matters.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::ast::{BinaryOp, Expr, Func, UnaryOp};
use crate::value::{DType, TypedValue};

#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("io error while serializing expression: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DeserializeError {
    #[error("io error while deserializing expression: {0}")]
    Io(#[from] io::Error),

    #[error("unknown expr-kind byte {0}")]
    UnknownKind(u8),

    #[error("unknown dtype byte {0}")]
    UnknownDtype(u8),

    #[error("unknown operator byte {0}")]
    UnknownOperator(u8),

    #[error("unknown function byte {0}")]
    UnknownFunction(u8),

    #[error("string payload was not valid utf-8")]
    InvalidUtf8,
}

const KIND_CONST: u8 = 0;
const KIND_FIELD: u8 = 1;
const KIND_UNARY: u8 = 2;
const KIND_BINARY: u8 = 3;
const KIND_TERNARY: u8 = 4;
const KIND_FUNCTION: u8 = 5;

fn dtype_byte(t: DType) -> u8 {
    match t {
        DType::Bool => 0,
        DType::I32 => 1,
        DType::I64 => 2,
        DType::F32 => 3,
        DType::F64 => 4,
        DType::String => 5,
    }
}

fn byte_dtype(b: u8) -> Result<DType, DeserializeError> {
    Ok(match b {
        0 => DType::Bool,
        1 => DType::I32,
        2 => DType::I64,
        3 => DType::F32,
        4 => DType::F64,
        5 => DType::String,
        other => return Err(DeserializeError::UnknownDtype(other)),
    })
}

fn unary_byte(op: UnaryOp) -> u8 {
    match op {
        UnaryOp::Neg => 0,
        UnaryOp::Not => 1,
    }
}

fn byte_unary(b: u8) -> Result<UnaryOp, DeserializeError> {
    Ok(match b {
        0 => UnaryOp::Neg,
        1 => UnaryOp::Not,
        other => return Err(DeserializeError::UnknownOperator(other)),
    })
}

fn binary_byte(op: BinaryOp) -> u8 {
    match op {
        BinaryOp::Add => 0,
        BinaryOp::Sub => 1,
        BinaryOp::Mul => 2,
        BinaryOp::Div => 3,
        BinaryOp::Mod => 4,
        BinaryOp::Pow => 5,
        BinaryOp::Eq => 6,
        BinaryOp::Ne => 7,
        BinaryOp::Lt => 8,
        BinaryOp::Le => 9,
        BinaryOp::Gt => 10,
        BinaryOp::Ge => 11,
        BinaryOp::And => 12,
        BinaryOp::Or => 13,
    }
}

fn byte_binary(b: u8) -> Result<BinaryOp, DeserializeError> {
    Ok(match b {
        0 => BinaryOp::Add,
        1 => BinaryOp::Sub,
        2 => BinaryOp::Mul,
        3 => BinaryOp::Div,
        4 => BinaryOp::Mod,
        5 => BinaryOp::Pow,
        6 => BinaryOp::Eq,
        7 => BinaryOp::Ne,
        8 => BinaryOp::Lt,
        9 => BinaryOp::Le,
        10 => BinaryOp::Gt,
        11 => BinaryOp::Ge,
        12 => BinaryOp::And,
        13 => BinaryOp::Or,
        other => return Err(DeserializeError::UnknownOperator(other)),
    })
}

fn func_byte(f: Func) -> u8 {
    match f {
        Func::Abs => 0,
        Func::Sqrt => 1,
        Func::Min => 2,
        Func::Max => 3,
        Func::Floor => 4,
        Func::Ceil => 5,
        Func::Round => 6,
        Func::Log => 7,
        Func::Log10 => 8,
        Func::Exp => 9,
        Func::Pow => 10,
        Func::Sin => 11,
        Func::Cos => 12,
        Func::Tan => 13,
    }
}

fn byte_func(b: u8) -> Result<Func, DeserializeError> {
    Ok(match b {
        0 => Func::Abs,
        1 => Func::Sqrt,
        2 => Func::Min,
        3 => Func::Max,
        4 => Func::Floor,
        5 => Func::Ceil,
        6 => Func::Round,
        7 => Func::Log,
        8 => Func::Log10,
        9 => Func::Exp,
        10 => Func::Pow,
        11 => Func::Sin,
        12 => Func::Cos,
        13 => Func::Tan,
        other => return Err(DeserializeError::UnknownFunction(other)),
    })
}

fn write_value(w: &mut impl Write, v: &TypedValue) -> Result<(), SerializeError> {
    w.write_u8(dtype_byte(v.dtype()))?;
    match v {
        TypedValue::Bool(b) => w.write_u8(if *b { 1 } else { 0 })?,
        TypedValue::I32(n) => w.write_i64::<LittleEndian>(*n as i64)?,
        TypedValue::I64(n) => w.write_i64::<LittleEndian>(*n)?,
        TypedValue::F32(n) => w.write_f64::<LittleEndian>(*n as f64)?,
        TypedValue::F64(n) => w.write_f64::<LittleEndian>(*n)?,
        TypedValue::String(s) => {
            w.write_u32::<LittleEndian>(s.len() as u32)?;
            w.write_all(s.as_bytes())?;
        }
    }
    Ok(())
}

fn read_value(r: &mut impl Read) -> Result<TypedValue, DeserializeError> {
    let dtype = byte_dtype(r.read_u8()?)?;
    Ok(match dtype {
        DType::Bool => TypedValue::Bool(r.read_u8()? != 0),
        DType::I32 => TypedValue::I32(r.read_i64::<LittleEndian>()? as i32),
        DType::I64 => TypedValue::I64(r.read_i64::<LittleEndian>()?),
        DType::F32 => TypedValue::F32(r.read_f64::<LittleEndian>()? as f32),
        DType::F64 => TypedValue::F64(r.read_f64::<LittleEndian>()?),
        DType::String => {
            let len = r.read_u32::<LittleEndian>()? as usize;
            let mut buf = vec![0u8; len];
            r.read_exact(&mut buf)?;
            TypedValue::String(String::from_utf8(buf).map_err(|_| DeserializeError::InvalidUtf8)?)
        }
    })
}

fn write_expr(w: &mut impl Write, expr: &Expr) -> Result<(), SerializeError> {
    match expr {
        Expr::Const(v, _) => {
            w.write_u8(KIND_CONST)?;
            write_value(w, v)?;
        }
        Expr::Field(path, dtype) => {
            w.write_u8(KIND_FIELD)?;
            w.write_u8(dtype_byte(*dtype))?;
            w.write_u32::<LittleEndian>(path.len() as u32)?;
            w.write_all(path.as_bytes())?;
        }
        Expr::UnaryOp(op, child, dtype) => {
            w.write_u8(KIND_UNARY)?;
            w.write_u8(unary_byte(*op))?;
            w.write_u8(dtype_byte(*dtype))?;
            write_expr(w, child)?;
        }
        Expr::BinaryOp(op, left, right, dtype) => {
            w.write_u8(KIND_BINARY)?;
            w.write_u8(binary_byte(*op))?;
            w.write_u8(dtype_byte(*dtype))?;
            write_expr(w, left)?;
            write_expr(w, right)?;
        }
        Expr::Ternary(cond, then, els, dtype) => {
            w.write_u8(KIND_TERNARY)?;
            w.write_u8(dtype_byte(*dtype))?;
            write_expr(w, cond)?;
            write_expr(w, then)?;
            write_expr(w, els)?;
        }
        Expr::Function(func, args, dtype) => {
            w.write_u8(KIND_FUNCTION)?;
            w.write_u8(func_byte(*func))?;
            w.write_u8(dtype_byte(*dtype))?;
            w.write_u32::<LittleEndian>(args.len() as u32)?;
            for a in args {
                write_expr(w, a)?;
            }
        }
    }
    Ok(())
}

fn read_expr(r: &mut impl Read) -> Result<Expr, DeserializeError> {
    let kind = r.read_u8()?;
    Ok(match kind {
        KIND_CONST => {
            let v = read_value(r)?;
            let dtype = v.dtype();
            Expr::Const(v, dtype)
        }
        KIND_FIELD => {
            let dtype = byte_dtype(r.read_u8()?)?;
            let len = r.read_u32::<LittleEndian>()? as usize;
            let mut buf = vec![0u8; len];
            r.read_exact(&mut buf)?;
            let path = String::from_utf8(buf).map_err(|_| DeserializeError::InvalidUtf8)?;
            Expr::Field(path, dtype)
        }
        KIND_UNARY => {
            let op = byte_unary(r.read_u8()?)?;
            let dtype = byte_dtype(r.read_u8()?)?;
            let child = read_expr(r)?;
            Expr::UnaryOp(op, Box::new(child), dtype)
        }
        KIND_BINARY => {
            let op = byte_binary(r.read_u8()?)?;
            let dtype = byte_dtype(r.read_u8()?)?;
            let left = read_expr(r)?;
            let right = read_expr(r)?;
            Expr::BinaryOp(op, Box::new(left), Box::new(right), dtype)
        }
        KIND_TERNARY => {
            let dtype = byte_dtype(r.read_u8()?)?;
            let cond = read_expr(r)?;
            let then = read_expr(r)?;
            let els = read_expr(r)?;
            Expr::Ternary(Box::new(cond), Box::new(then), Box::new(els), dtype)
        }
        KIND_FUNCTION => {
            let func = byte_func(r.read_u8()?)?;
            let dtype = byte_dtype(r.read_u8()?)?;
            let n = r.read_u32::<LittleEndian>()? as usize;
            let mut args = Vec::with_capacity(n);
            for _ in 0..n {
                args.push(read_expr(r)?);
            }
            Expr::Function(func, args, dtype)
        }
        other => return Err(DeserializeError::UnknownKind(other)),
    })
}

pub fn serialize(expr: &Expr) -> Result<Vec<u8>, SerializeError> {
    let mut buf = Vec::new();
    write_expr(&mut buf, expr)?;
    Ok(buf)
}

pub fn deserialize(bytes: &[u8]) -> Result<Expr, DeserializeError> {
    let mut cursor = io::Cursor::new(bytes);
    read_expr(&mut cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse;
    use crate::validate::validate;
    use proptest::prelude::*;
    use serde_json::json;

    fn valid(v: serde_json::Value) -> Expr {
        validate(parse(&v).unwrap()).unwrap()
    }

    #[test]
    fn serialization_is_byte_stable() {
        let e = valid(json!({"op": "+", "left": {"field": "a"}, "right": {"const": 1.5}}));
        let b1 = serialize(&e).unwrap();
        let b2 = serialize(&e).unwrap();
        assert_eq!(b1, b2);
    }

    #[test]
    fn round_trips_through_bytes() {
        let e = valid(json!({
            "func": "min",
            "args": [{"const": 1}, {"const": 2}, {"op": "*", "left": {"field": "x", "type": "int64"}, "right": {"const": 2}}]
        }));
        let bytes = serialize(&e).unwrap();
        let back = deserialize(&bytes).unwrap();
        assert_eq!(e, back);
    }

    #[test]
    fn differing_asts_yield_differing_bytes() {
        let a = valid(json!({"const": 1}));
        let b = valid(json!({"const": 2}));
        assert_ne!(serialize(&a).unwrap(), serialize(&b).unwrap());
    }

    proptest! {
        #[test]
        fn arbitrary_consts_round_trip(n in any::<i64>(), s in ".*") {
            let e = valid(json!({"const": n}));
            let bytes = serialize(&e).unwrap();
            prop_assert_eq!(deserialize(&bytes).unwrap(), e);

            let e = validate(Expr::Const(TypedValue::String(s.clone()), DType::String)).unwrap();
            let bytes = serialize(&e).unwrap();
            prop_assert_eq!(deserialize(&bytes).unwrap(), e);
        }
    }
}
