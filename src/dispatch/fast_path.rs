//! Direct implementations of builtin intrinsics.
//!
//! When resolution lands on an intrinsic, the handle builder targets these
//! instead of a generic native call. Arguments have already been coerced to
//! the operand kind the intrinsic was declared with.

use std::sync::Arc;

use crate::error::{DispatchError, DispatchResult};
use crate::model::{ArithOp, Intrinsic, NumKind, Value};

pub fn run(op: Intrinsic, receiver: &Value, args: &[Value]) -> DispatchResult<Value> {
    match op {
        Intrinsic::Arith(op, operand) => {
            let rhs = args
                .first()
                .ok_or_else(|| DispatchError::internal("arithmetic intrinsic without operand"))?;
            arith(op, operand, receiver, rhs)
        }
        Intrinsic::ArrayClone => match receiver {
            Value::Array(items) => Ok(Value::Array(Arc::new(items.as_ref().clone()))),
            other => Err(DispatchError::internal(format!(
                "array clone invoked on {} receiver",
                other.type_name()
            ))),
        },
    }
}

fn receiver_kind(receiver: &Value) -> Option<NumKind> {
    match receiver {
        Value::Int(_) => Some(NumKind::Int),
        Value::Long(_) => Some(NumKind::Long),
        Value::Double(_) => Some(NumKind::Double),
        _ => None,
    }
}

/// Result kind of mixing two numeric kinds.
fn wider(a: NumKind, b: NumKind) -> NumKind {
    match (a, b) {
        (NumKind::Double, _) | (_, NumKind::Double) => NumKind::Double,
        (NumKind::Long, _) | (_, NumKind::Long) => NumKind::Long,
        _ => NumKind::Int,
    }
}

fn arith(op: ArithOp, operand: NumKind, lhs: &Value, rhs: &Value) -> DispatchResult<Value> {
    let kind = receiver_kind(lhs)
        .map(|k| wider(k, operand))
        .ok_or_else(|| DispatchError::internal(format!("arithmetic on {} receiver", lhs.type_name())))?;

    let mismatch = || DispatchError::wrong_argument_type(0, format!("{:?}", operand), rhs.type_name());
    match kind {
        NumKind::Int => {
            let (Value::Int(a), Value::Int(b)) = (lhs, rhs) else {
                return Err(mismatch());
            };
            Ok(Value::Int(match op {
                ArithOp::Plus => a.wrapping_add(*b),
                ArithOp::Minus => a.wrapping_sub(*b),
                ArithOp::Multiply => a.wrapping_mul(*b),
            }))
        }
        NumKind::Long => {
            let (Some(a), Some(b)) = (lhs.as_i64(), rhs.as_i64()) else {
                return Err(mismatch());
            };
            Ok(Value::Long(match op {
                ArithOp::Plus => a.wrapping_add(b),
                ArithOp::Minus => a.wrapping_sub(b),
                ArithOp::Multiply => a.wrapping_mul(b),
            }))
        }
        NumKind::Double => {
            let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) else {
                return Err(mismatch());
            };
            Ok(Value::Double(match op {
                ArithOp::Plus => a + b,
                ArithOp::Minus => a - b,
                ArithOp::Multiply => a * b,
            }))
        }
    }
}
