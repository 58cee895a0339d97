//! Expression AST (C2): the algebraic tree produced by the parser, annotated
//! with a result [`DType`] by the validator before it is ever serialized.

use serde::{Deserialize, Serialize};

use crate::value::{DType, TypedValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    pub fn is_arithmetic(self) -> bool {
        !self.is_comparison() && !self.is_logical()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Func {
    Abs,
    Sqrt,
    Min,
    Max,
    Floor,
    Ceil,
    Round,
    Log,
    Log10,
    Exp,
    Pow,
    Sin,
    Cos,
    Tan,
}

/// A path segment used by validator errors to point at the offending subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathSegment {
    Left,
    Right,
    Operand,
    Condition,
    Then,
    Else,
    Arg(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Const(TypedValue, DType),
    Field(String, DType),
    UnaryOp(UnaryOp, Box<Expr>, DType),
    BinaryOp(BinaryOp, Box<Expr>, Box<Expr>, DType),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>, DType),
    Function(Func, Vec<Expr>, DType),
}

impl Expr {
    pub fn dtype(&self) -> DType {
        match self {
            Expr::Const(_, t)
            | Expr::Field(_, t)
            | Expr::UnaryOp(_, _, t)
            | Expr::BinaryOp(_, _, _, t)
            | Expr::Ternary(_, _, _, t)
            | Expr::Function(_, _, t) => *t,
        }
    }
}
