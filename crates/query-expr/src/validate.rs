//! Validator (C2): checks the invariants from spec §3 against a parsed
//! [`Expr`] tree and computes the correct result [`DType`] for every node,
//! rejecting with a path naming the offending subtree on failure.

use crate::ast::{BinaryOp, Expr, Func, PathSegment, UnaryOp};
use crate::value::DType;

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("invalid expression at {path:?}: {reason}")]
pub struct InvalidExpression {
    pub path: Vec<PathSegment>,
    pub reason: String,
}

fn err(path: &[PathSegment], reason: impl Into<String>) -> InvalidExpression {
    InvalidExpression {
        path: path.to_vec(),
        reason: reason.into(),
    }
}

fn widen(a: DType, b: DType) -> DType {
    if a == DType::F64 || b == DType::F64 {
        DType::F64
    } else {
        DType::I64
    }
}

fn push(path: &[PathSegment], seg: PathSegment) -> Vec<PathSegment> {
    let mut p = path.to_vec();
    p.push(seg);
    p
}

/// Validates `expr` and returns a new tree with every node's dtype corrected
/// per the inference rules in spec §3/§4.2.
pub fn validate(expr: Expr) -> Result<Expr, InvalidExpression> {
    validate_at(expr, &[])
}

fn validate_at(expr: Expr, path: &[PathSegment]) -> Result<Expr, InvalidExpression> {
    match expr {
        Expr::Const(v, _) => {
            let dtype = v.dtype();
            Ok(Expr::Const(v, dtype))
        }
        Expr::Field(name, dtype) => Ok(Expr::Field(name, dtype)),
        Expr::UnaryOp(op, child, _) => {
            let child_path = push(path, PathSegment::Operand);
            let child = validate_at(*child, &child_path)?;
            let dtype = match op {
                UnaryOp::Not => {
                    if child.dtype() != DType::Bool {
                        return Err(err(&child_path, "`!`/`not` requires a bool operand"));
                    }
                    DType::Bool
                }
                UnaryOp::Neg => {
                    if !child.dtype().is_numeric() {
                        return Err(err(&child_path, "`-`/`neg` requires a numeric operand"));
                    }
                    child.dtype()
                }
            };
            Ok(Expr::UnaryOp(op, Box::new(child), dtype))
        }
        Expr::BinaryOp(op, left, right, _) => {
            let left_path = push(path, PathSegment::Left);
            let right_path = push(path, PathSegment::Right);
            let left = validate_at(*left, &left_path)?;
            let right = validate_at(*right, &right_path)?;

            let dtype = if op.is_arithmetic() {
                if !left.dtype().is_numeric() || !right.dtype().is_numeric() {
                    return Err(err(path, "arithmetic operator requires numeric operands"));
                }
                widen(left.dtype(), right.dtype())
            } else if op.is_comparison() {
                let compatible = left.dtype() == right.dtype()
                    || (left.dtype().is_numeric() && right.dtype().is_numeric());
                if !compatible {
                    return Err(err(path, "comparison operands are not compatible"));
                }
                DType::Bool
            } else {
                debug_assert!(op.is_logical());
                if left.dtype() != DType::Bool || right.dtype() != DType::Bool {
                    return Err(err(path, "logical operator needs bool operands"));
                }
                DType::Bool
            };

            Ok(Expr::BinaryOp(op, Box::new(left), Box::new(right), dtype))
        }
        Expr::Ternary(cond, then, els, _) => {
            let cond_path = push(path, PathSegment::Condition);
            let then_path = push(path, PathSegment::Then);
            let else_path = push(path, PathSegment::Else);

            let cond = validate_at(*cond, &cond_path)?;
            if cond.dtype() != DType::Bool {
                return Err(err(&cond_path, "ternary condition must be bool"));
            }
            let then = validate_at(*then, &then_path)?;
            let els = validate_at(*els, &else_path)?;

            let compatible = then.dtype() == els.dtype()
                || (then.dtype().is_numeric() && els.dtype().is_numeric());
            if !compatible {
                return Err(err(path, "ternary branches are not compatible"));
            }
            let dtype = if then.dtype().is_numeric() {
                widen(then.dtype(), els.dtype())
            } else {
                then.dtype()
            };

            Ok(Expr::Ternary(Box::new(cond), Box::new(then), Box::new(els), dtype))
        }
        Expr::Function(func, args, _) => {
            let args = args
                .into_iter()
                .enumerate()
                .map(|(i, a)| validate_at(a, &push(path, PathSegment::Arg(i))))
                .collect::<Result<Vec<_>, _>>()?;

            for (i, a) in args.iter().enumerate() {
                if !a.dtype().is_numeric() {
                    return Err(err(
                        &push(path, PathSegment::Arg(i)),
                        "function argument must be numeric",
                    ));
                }
            }

            let dtype = match func {
                Func::Floor | Func::Ceil | Func::Round => {
                    if args.len() != 1 {
                        return Err(err(path, "floor/ceil/round takes exactly one argument"));
                    }
                    DType::I64
                }
                Func::Min | Func::Max => {
                    if args.len() < 2 {
                        return Err(err(path, "min/max requires at least two arguments"));
                    }
                    args[0].dtype()
                }
                Func::Pow => {
                    if args.len() != 2 {
                        return Err(err(path, "pow requires exactly two arguments"));
                    }
                    widen(args[0].dtype(), args[1].dtype())
                }
                Func::Abs | Func::Sqrt | Func::Log | Func::Log10 | Func::Exp | Func::Sin
                | Func::Cos | Func::Tan => {
                    if args.len() != 1 {
                        return Err(err(path, "function requires exactly one argument"));
                    }
                    args[0].dtype()
                }
            };

            Ok(Expr::Function(func, args, dtype))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse;
    use serde_json::json;

    fn run(v: serde_json::Value) -> Result<Expr, InvalidExpression> {
        validate(parse(&v).unwrap())
    }

    #[test]
    fn arithmetic_on_string_rejected() {
        let res = run(json!({"op": "+", "left": {"field": "name", "type": "string"}, "right": {"const": 10}}));
        assert!(res.is_err());
    }

    #[test]
    fn logical_needs_bool() {
        let res = run(json!({"op": "&&", "left": {"const": 10}, "right": {"const": 20}}));
        assert!(res.is_err());
    }

    #[test]
    fn abs_arg_count() {
        let res = run(json!({"func": "abs", "args": [{"const": 1}, {"const": 2}]}));
        assert!(res.is_err());
    }

    #[test]
    fn comparison_and_logical_infer_bool() {
        let e = run(json!({"op": "==", "left": {"const": 1}, "right": {"const": 1}})).unwrap();
        assert_eq!(e.dtype(), DType::Bool);

        let e = run(json!({"op": "&&", "left": {"op": "==", "left": {"const": 1}, "right": {"const": 1}}, "right": {"op": "==", "left": {"const": 1}, "right": {"const": 1}}})).unwrap();
        assert_eq!(e.dtype(), DType::Bool);
    }

    #[test]
    fn floor_infers_i64() {
        let e = run(json!({"func": "floor", "args": [{"const": 1.5}]})).unwrap();
        assert_eq!(e.dtype(), DType::I64);
    }

    #[test]
    fn numeric_binary_widens_to_f64() {
        let e = run(json!({"op": "+", "left": {"const": 1}, "right": {"const": 1.5}})).unwrap();
        assert_eq!(e.dtype(), DType::F64);

        let e = run(json!({"op": "+", "left": {"const": 1}, "right": {"const": 2}})).unwrap();
        assert_eq!(e.dtype(), DType::I64);
    }

    #[test]
    fn min_max_result_is_first_arg_type() {
        let e = run(json!({"func": "min", "args": [{"const": 1}, {"const": 2.5}]})).unwrap();
        assert_eq!(e.dtype(), DType::I64);
    }
}
