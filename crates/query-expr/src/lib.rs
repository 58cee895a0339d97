// Stract is an open source web search engine.
// Copyright (C) 2024 Stract ApS
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Typed value ABI and the expression sub-language: JSON in, validated AST,
//! compact binary wire format out.

pub mod ast;
pub mod parse;
pub mod serialize;
pub mod validate;
pub mod value;

pub use ast::{BinaryOp, Expr, Func, PathSegment, UnaryOp};
pub use parse::{parse, ParseError};
pub use serialize::{deserialize, serialize, DeserializeError, SerializeError};
pub use validate::{validate, InvalidExpression};
pub use value::{from_word, to_word, AbiError, DType, TypedValue};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Invalid(#[from] InvalidExpression),

    #[error(transparent)]
    Serialize(#[from] SerializeError),

    #[error(transparent)]
    Deserialize(#[from] DeserializeError),
}

/// Parses, validates, and serializes an expression in one call — the shape
/// the query DSL parser (`query_dsl`) needs for an `expr` clause.
pub fn compile(v: &serde_json::Value) -> Result<(Expr, Vec<u8>), Error> {
    let expr = validate(parse(v)?)?;
    let bytes = serialize(&expr)?;
    Ok((expr, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compile_end_to_end() {
        let (expr, bytes) = compile(&json!({"op": ">", "left": {"field": "price"}, "right": {"const": 10}})).unwrap();
        assert_eq!(expr.dtype(), DType::Bool);
        assert!(!bytes.is_empty());
    }
}
