//! Builtin classes for the value kinds every program starts with.
//!
//! Builtin classes use fixed ids so [`Value::class_id`] can answer without
//! consulting the symbol table.

use std::sync::Arc;

use crate::error::{DispatchError, DispatchResult};
use crate::model::class::{ArithOp, Class, ClassBuilder, ClassId, Intrinsic, MethodDef, NumKind, ParamType};
use crate::model::value::Value;

pub const OBJECT: &str = "Object";
pub const NUMBER: &str = "Number";
pub const NULL_OBJECT: &str = "NullObject";
pub const BOOLEAN: &str = "Boolean";
pub const INTEGER: &str = "Integer";
pub const LONG: &str = "Long";
pub const DOUBLE: &str = "Double";
pub const CHARACTER: &str = "Character";
pub const STRING: &str = "String";
pub const ARRAY: &str = "Array";
pub const CLASS: &str = "Class";

pub const OBJECT_ID: ClassId = ClassId(0);
pub const NUMBER_ID: ClassId = ClassId(1);
pub const NULL_OBJECT_ID: ClassId = ClassId(2);
pub const BOOLEAN_ID: ClassId = ClassId(3);
pub const INTEGER_ID: ClassId = ClassId(4);
pub const LONG_ID: ClassId = ClassId(5);
pub const DOUBLE_ID: ClassId = ClassId(6);
pub const CHARACTER_ID: ClassId = ClassId(7);
pub const STRING_ID: ClassId = ClassId(8);
pub const ARRAY_ID: ClassId = ClassId(9);
pub const CLASS_ID: ClassId = ClassId(10);

/// Handles to every builtin class.
#[derive(Debug, Clone)]
pub struct Builtins {
    pub object: Arc<Class>,
    pub number: Arc<Class>,
    pub null_object: Arc<Class>,
    pub boolean: Arc<Class>,
    pub integer: Arc<Class>,
    pub long: Arc<Class>,
    pub double: Arc<Class>,
    pub character: Arc<Class>,
    pub string: Arc<Class>,
    pub array: Arc<Class>,
    pub class: Arc<Class>,
}

impl Builtins {
    pub fn new() -> Self {
        let object = ClassBuilder::new(OBJECT)
            .with_id(OBJECT_ID)
            .method(MethodDef::native("toString", vec![], |receiver, _| {
                Ok(Value::str(receiver.to_string()))
            }))
            .method(MethodDef::native("equals", vec![ParamType::Any], |receiver, args| {
                Ok(Value::Bool(*receiver == args[0]))
            }))
            .method(MethodDef::native("getClass", vec![], |receiver, _| {
                Ok(Value::str(receiver.type_name()))
            }))
            .build();

        let number = ClassBuilder::new(NUMBER)
            .with_id(NUMBER_ID)
            .extends(&object)
            .method(MethodDef::native("intValue", vec![], |receiver, _| {
                let n = receiver
                    .as_f64()
                    .ok_or_else(|| receiver_mismatch(NUMBER, receiver))?;
                Ok(Value::Int(n as i32))
            }))
            .build();

        let null_object = ClassBuilder::new(NULL_OBJECT)
            .with_id(NULL_OBJECT_ID)
            .extends(&object)
            .method(MethodDef::native("toString", vec![], |_, _| Ok(Value::str("null"))))
            .method(MethodDef::native("equals", vec![ParamType::Any], |_, args| {
                Ok(Value::Bool(args[0].is_null()))
            }))
            .method(MethodDef::native("is", vec![ParamType::Any], |_, args| {
                Ok(Value::Bool(args[0].is_null()))
            }))
            .build();

        let boolean = ClassBuilder::new(BOOLEAN)
            .with_id(BOOLEAN_ID)
            .extends(&object)
            .method(MethodDef::native("and", vec![ParamType::Bool], |receiver, args| {
                Ok(Value::Bool(
                    matches!(receiver, Value::Bool(true)) && matches!(args[0], Value::Bool(true)),
                ))
            }))
            .build();

        let integer = numeric_class(INTEGER, INTEGER_ID, &number, NumKind::Int);
        let long = numeric_class(LONG, LONG_ID, &number, NumKind::Long);
        let double = numeric_class(DOUBLE, DOUBLE_ID, &number, NumKind::Double);

        let character = ClassBuilder::new(CHARACTER)
            .with_id(CHARACTER_ID)
            .extends(&object)
            .build();

        let string = ClassBuilder::new(STRING)
            .with_id(STRING_ID)
            .extends(&object)
            .method(MethodDef::native("toString", vec![], |receiver, _| Ok(receiver.clone())))
            .method(MethodDef::native("length", vec![], |receiver, _| {
                Ok(Value::Int(receiver_str(receiver)?.chars().count() as i32))
            }))
            .method(MethodDef::native("toUpperCase", vec![], |receiver, _| {
                Ok(Value::str(receiver_str(receiver)?.to_uppercase()))
            }))
            .method(MethodDef::native("concat", vec![ParamType::Str], |receiver, args| {
                let tail = args[0].as_str().unwrap_or("null");
                Ok(Value::str(format!("{}{}", receiver_str(receiver)?, tail)))
            }))
            .method(MethodDef::native("plus", vec![ParamType::Any], |receiver, args| {
                Ok(Value::str(format!("{}{}", receiver_str(receiver)?, args[0])))
            }))
            .method(MethodDef::native("substring", vec![ParamType::Int], |receiver, args| {
                let s = receiver_str(receiver)?;
                let from = index_arg(&args[0], s)?;
                Ok(Value::str(s.chars().skip(from).collect::<String>()))
            }))
            .method(MethodDef::native(
                "substring",
                vec![ParamType::Int, ParamType::Int],
                |receiver, args| {
                    let s = receiver_str(receiver)?;
                    let from = index_arg(&args[0], s)?;
                    let to = index_arg(&args[1], s)?.max(from);
                    Ok(Value::str(s.chars().skip(from).take(to - from).collect::<String>()))
                },
            ))
            .method(
                MethodDef::native(
                    "join",
                    vec![ParamType::Str, ParamType::array_of(ParamType::Str)],
                    |_, args| {
                        let separator = args[0].as_str().unwrap_or("");
                        let parts: Vec<String> = args[1]
                            .as_array()
                            .map(|items| items.iter().map(|v| v.to_string()).collect())
                            .unwrap_or_default();
                        Ok(Value::str(parts.join(separator)))
                    },
                )
                .varargs()
                .static_method(),
            )
            .method(
                MethodDef::native("valueOf", vec![ParamType::Any], |_, args| {
                    Ok(Value::str(args[0].to_string()))
                })
                .static_method(),
            )
            .build();

        let array = ClassBuilder::new(ARRAY)
            .with_id(ARRAY_ID)
            .extends(&object)
            .method(MethodDef::native("size", vec![], |receiver, _| {
                let items = receiver
                    .as_array()
                    .ok_or_else(|| receiver_mismatch(ARRAY, receiver))?;
                Ok(Value::Int(items.len() as i32))
            }))
            .method(MethodDef::native("get", vec![ParamType::Int], |receiver, args| {
                let items = receiver
                    .as_array()
                    .ok_or_else(|| receiver_mismatch(ARRAY, receiver))?;
                let index = args[0].as_i64().unwrap_or(-1);
                usize::try_from(index)
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .ok_or_else(|| {
                        DispatchError::thrown_value(
                            format!("Index {} out of bounds for length {}", index, items.len()),
                            args[0].clone(),
                        )
                    })
            }))
            .method(MethodDef::intrinsic("clone", vec![], Intrinsic::ArrayClone))
            .build();

        let class = ClassBuilder::new(CLASS)
            .with_id(CLASS_ID)
            .extends(&object)
            .method(MethodDef::native("getName", vec![], |receiver, _| match receiver {
                Value::Class(class) => Ok(Value::str(class.name())),
                other => Err(receiver_mismatch(CLASS, other)),
            }))
            .build();

        Self {
            object,
            number,
            null_object,
            boolean,
            integer,
            long,
            double,
            character,
            string,
            array,
            class,
        }
    }

    pub fn all(&self) -> [&Arc<Class>; 11] {
        [
            &self.object,
            &self.number,
            &self.null_object,
            &self.boolean,
            &self.integer,
            &self.long,
            &self.double,
            &self.character,
            &self.string,
            &self.array,
            &self.class,
        ]
    }

    /// Runtime class of a value that is not a user object.
    pub fn class_of(&self, value: &Value) -> Arc<Class> {
        match value {
            Value::Null => self.null_object.clone(),
            Value::Bool(_) => self.boolean.clone(),
            Value::Int(_) => self.integer.clone(),
            Value::Long(_) => self.long.clone(),
            Value::Double(_) => self.double.clone(),
            Value::Char(_) => self.character.clone(),
            Value::Str(_) => self.string.clone(),
            Value::Array(_) => self.array.clone(),
            Value::Object(instance) => instance.class().clone(),
            Value::Class(_) => self.class.clone(),
        }
    }
}

/// Arithmetic methods for one numeric class. `plus`/`minus`/`multiply` are
/// overloaded on every wider-or-equal kind so resolution can pick the
/// narrowest applicable one.
fn numeric_class(name: &str, id: ClassId, number: &Arc<Class>, kind: NumKind) -> Arc<Class> {
    let operand_kinds: &[NumKind] = match kind {
        NumKind::Int => &[NumKind::Int, NumKind::Long, NumKind::Double],
        NumKind::Long => &[NumKind::Long, NumKind::Double],
        NumKind::Double => &[NumKind::Double],
    };

    let mut builder = ClassBuilder::new(name).with_id(id).extends(number);
    for op in [ArithOp::Plus, ArithOp::Minus, ArithOp::Multiply] {
        let method = match op {
            ArithOp::Plus => "plus",
            ArithOp::Minus => "minus",
            ArithOp::Multiply => "multiply",
        };
        for operand in operand_kinds {
            let param = match operand {
                NumKind::Int => ParamType::Int,
                NumKind::Long => ParamType::Long,
                NumKind::Double => ParamType::Double,
            };
            builder = builder.method(MethodDef::intrinsic(
                method,
                vec![param],
                Intrinsic::Arith(op, *operand),
            ));
        }
    }
    builder.build()
}

fn receiver_str(receiver: &Value) -> DispatchResult<&str> {
    receiver
        .as_str()
        .ok_or_else(|| receiver_mismatch(STRING, receiver))
}

fn index_arg(arg: &Value, s: &str) -> DispatchResult<usize> {
    let index = arg.as_i64().unwrap_or(-1);
    let len = s.chars().count();
    usize::try_from(index)
        .ok()
        .filter(|i| *i <= len)
        .ok_or_else(|| DispatchError::thrown(format!("String index out of range: {}", index)))
}

fn receiver_mismatch(expected: &str, receiver: &Value) -> DispatchError {
    DispatchError::internal(format!(
        "{} method invoked on {} receiver",
        expected,
        receiver.type_name()
    ))
}
