//! Parses the untyped JSON expression form (§4.2) into an [`Expr`] tree.
//! Type inference and invariant checking happen later, in [`crate::validate`];
//! this stage only assigns a placeholder dtype (f64) to computed nodes.

use crate::ast::{BinaryOp, Expr, Func, UnaryOp};
use crate::value::{DType, TypedValue};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("expression node is not a JSON object")]
    NotAnObject,

    #[error("expression node did not match any known shape: {0}")]
    UnrecognizedShape(String),

    #[error("unknown operator {0:?}")]
    UnknownOperator(String),

    #[error("unknown function {0:?}")]
    UnknownFunction(String),

    #[error("unknown type name {0:?}")]
    UnknownType(String),

    #[error("const value has no supported JSON representation")]
    UnsupportedConst,
}

fn parse_dtype(name: &str) -> Result<DType, ParseError> {
    match name {
        "bool" => Ok(DType::Bool),
        "int" => Ok(DType::I32),
        "int64" => Ok(DType::I64),
        "float" => Ok(DType::F32),
        "float64" => Ok(DType::F64),
        "string" => Ok(DType::String),
        other => Err(ParseError::UnknownType(other.to_string())),
    }
}

fn parse_binary_op(op: &str) -> Result<BinaryOp, ParseError> {
    Ok(match op {
        "+" | "add" => BinaryOp::Add,
        "-" | "sub" => BinaryOp::Sub,
        "*" | "mul" => BinaryOp::Mul,
        "/" | "div" => BinaryOp::Div,
        "%" | "mod" => BinaryOp::Mod,
        "**" | "pow" => BinaryOp::Pow,
        "==" | "eq" => BinaryOp::Eq,
        "!=" | "ne" => BinaryOp::Ne,
        "<=" | "lte" | "le" => BinaryOp::Le,
        ">=" | "gte" | "ge" => BinaryOp::Ge,
        "<" | "lt" => BinaryOp::Lt,
        ">" | "gt" => BinaryOp::Gt,
        "&&" | "and" => BinaryOp::And,
        "||" | "or" => BinaryOp::Or,
        other => return Err(ParseError::UnknownOperator(other.to_string())),
    })
}

fn parse_func(name: &str) -> Result<Func, ParseError> {
    Ok(match name {
        "abs" => Func::Abs,
        "sqrt" => Func::Sqrt,
        "min" => Func::Min,
        "max" => Func::Max,
        "floor" => Func::Floor,
        "ceil" => Func::Ceil,
        "round" => Func::Round,
        "log" | "ln" => Func::Log,
        "log10" => Func::Log10,
        "exp" => Func::Exp,
        "pow" => Func::Pow,
        "sin" => Func::Sin,
        "cos" => Func::Cos,
        "tan" => Func::Tan,
        other => return Err(ParseError::UnknownFunction(other.to_string())),
    })
}

fn const_value(v: &serde_json::Value) -> Result<TypedValue, ParseError> {
    match v {
        serde_json::Value::Bool(b) => Ok(TypedValue::Bool(*b)),
        serde_json::Value::String(s) => {
            if let Ok(i) = s.parse::<i64>() {
                Ok(TypedValue::I64(i))
            } else if let Ok(f) = s.parse::<f64>() {
                Ok(TypedValue::F64(f))
            } else {
                Ok(TypedValue::String(s.clone()))
            }
        }
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(TypedValue::I64(i))
            } else if let Some(f) = n.as_f64() {
                Ok(TypedValue::F64(f))
            } else {
                Err(ParseError::UnsupportedConst)
            }
        }
        _ => Err(ParseError::UnsupportedConst),
    }
}

pub fn parse(v: &serde_json::Value) -> Result<Expr, ParseError> {
    let obj = v.as_object().ok_or(ParseError::NotAnObject)?;

    if let Some(c) = obj.get("const") {
        let value = const_value(c)?;
        let dtype = value.dtype();
        return Ok(Expr::Const(value, dtype));
    }

    if let Some(path) = obj.get("field") {
        let path = path.as_str().ok_or(ParseError::UnsupportedConst)?.to_string();
        let dtype = match obj.get("type").and_then(|t| t.as_str()) {
            Some(t) => parse_dtype(t)?,
            None => DType::F64,
        };
        return Ok(Expr::Field(path, dtype));
    }

    if let (Some(op), Some(left), Some(right)) = (obj.get("op"), obj.get("left"), obj.get("right"))
    {
        let op = op.as_str().ok_or(ParseError::UnsupportedConst)?;
        let op = parse_binary_op(op)?;
        let left = parse(left)?;
        let right = parse(right)?;
        return Ok(Expr::BinaryOp(op, Box::new(left), Box::new(right), DType::F64));
    }

    if let (Some(op), Some(operand)) = (obj.get("op"), obj.get("operand")) {
        let op_str = op.as_str().ok_or(ParseError::UnsupportedConst)?;
        let op = match op_str {
            "-" | "neg" => UnaryOp::Neg,
            "!" | "not" => UnaryOp::Not,
            other => return Err(ParseError::UnknownOperator(other.to_string())),
        };
        let operand = parse(operand)?;
        return Ok(Expr::UnaryOp(op, Box::new(operand), DType::F64));
    }

    if let (Some(cond), Some(t), Some(f)) =
        (obj.get("condition"), obj.get("true"), obj.get("false"))
    {
        let cond = parse(cond)?;
        let t = parse(t)?;
        let f = parse(f)?;
        return Ok(Expr::Ternary(Box::new(cond), Box::new(t), Box::new(f), DType::F64));
    }

    if let (Some(func), Some(args)) = (obj.get("func"), obj.get("args")) {
        let func = func.as_str().ok_or(ParseError::UnsupportedConst)?;
        let func = parse_func(func)?;
        let args = args
            .as_array()
            .ok_or(ParseError::UnsupportedConst)?
            .iter()
            .map(parse)
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Expr::Function(func, args, DType::F64));
    }

    Err(ParseError::UnrecognizedShape(v.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_const_and_field() {
        let e = parse(&json!({"const": 10})).unwrap();
        assert_eq!(e, Expr::Const(TypedValue::I64(10), DType::I64));

        let e = parse(&json!({"field": "price", "type": "int"})).unwrap();
        assert_eq!(e, Expr::Field("price".to_string(), DType::I32));

        let e = parse(&json!({"field": "price"})).unwrap();
        assert_eq!(e, Expr::Field("price".to_string(), DType::F64));
    }

    #[test]
    fn accepts_operator_aliases() {
        for (alias, op) in [("==", BinaryOp::Eq), ("eq", BinaryOp::Eq), ("<=", BinaryOp::Le), ("lte", BinaryOp::Le)] {
            let e = parse(&json!({"op": alias, "left": {"const": 1}, "right": {"const": 2}})).unwrap();
            match e {
                Expr::BinaryOp(got, ..) => assert_eq!(got, op),
                _ => panic!("expected binary op"),
            }
        }
    }

    #[test]
    fn accepts_function_alias_log_ln() {
        let e = parse(&json!({"func": "ln", "args": [{"const": 1.0}]})).unwrap();
        match e {
            Expr::Function(f, ..) => assert_eq!(f, Func::Log),
            _ => panic!("expected function"),
        }
    }
}
