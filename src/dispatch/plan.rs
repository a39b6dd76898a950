//! Dispatch plans: the data form of an invokable handle.
//!
//! A plan records each adaptation step the handle builder decided on
//! (arity correction, per-argument coercion, the call target). [`DispatchPlan::execute`]
//! is the single interpreter for them. Exception translation is part of every
//! plan: one level of [`DispatchError::Wrapped`] is removed on the way out.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::dispatch::fast_path;
use crate::error::{DispatchError, DispatchResult};
use crate::model::class::{InitFn, NativeFn};
use crate::model::{Class, FieldDescriptor, Instance, Intrinsic, ParamType, Value};

pub type Args = SmallVec<[Value; 4]>;

/// How the argument list is reshaped before coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArityCorrection {
    None,
    /// One missing trailing reference argument, filled with null.
    AppendNull,
    /// No variadic arguments given; pass an empty array.
    EmptyVarargs,
    /// Collect `args[from..]` into one array argument.
    CollectVarargs { from: usize },
}

/// Conversion applied to one argument so it matches its parameter type.
///
/// Conversions are checked: a value that cannot become the target type is a
/// [`DispatchError::WrongArgumentType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    ToBool,
    ToInt,
    ToLong,
    ToDouble,
    ToChar,
    ToStr,
}

impl Coercion {
    /// The conversion a parameter of type `param` needs, if any.
    pub fn for_param(param: &ParamType) -> Option<Coercion> {
        match param {
            ParamType::Bool => Some(Coercion::ToBool),
            ParamType::Int => Some(Coercion::ToInt),
            ParamType::Long => Some(Coercion::ToLong),
            ParamType::Double => Some(Coercion::ToDouble),
            ParamType::Char => Some(Coercion::ToChar),
            ParamType::Str => Some(Coercion::ToStr),
            _ => None,
        }
    }

    /// True if applying this coercion to `value` would change it.
    pub fn converts(&self, value: &Value) -> bool {
        !matches!(
            (self, value),
            (Coercion::ToBool, Value::Bool(_))
                | (Coercion::ToInt, Value::Int(_))
                | (Coercion::ToLong, Value::Long(_))
                | (Coercion::ToDouble, Value::Double(_))
                | (Coercion::ToChar, Value::Char(_))
                | (Coercion::ToStr, Value::Str(_))
                | (Coercion::ToStr, Value::Null)
        )
    }

    pub fn apply(&self, position: usize, value: Value) -> DispatchResult<Value> {
        match (self, value) {
            (Coercion::ToBool, v @ Value::Bool(_)) => Ok(v),
            (Coercion::ToInt, v @ Value::Int(_)) => Ok(v),
            (Coercion::ToLong, v @ Value::Long(_)) => Ok(v),
            (Coercion::ToLong, Value::Int(n)) => Ok(Value::Long(n as i64)),
            (Coercion::ToDouble, v @ Value::Double(_)) => Ok(v),
            (Coercion::ToDouble, Value::Int(n)) => Ok(Value::Double(n as f64)),
            (Coercion::ToDouble, Value::Long(n)) => Ok(Value::Double(n as f64)),
            (Coercion::ToChar, v @ Value::Char(_)) => Ok(v),
            (Coercion::ToStr, v @ (Value::Str(_) | Value::Null)) => Ok(v),
            (Coercion::ToStr, Value::Char(c)) => Ok(Value::str(c.to_string())),
            (_, other) => Err(DispatchError::wrong_argument_type(
                position,
                self.target_name(),
                other.type_name(),
            )),
        }
    }

    fn target_name(&self) -> &'static str {
        match self {
            Coercion::ToBool => "boolean",
            Coercion::ToInt => "int",
            Coercion::ToLong => "long",
            Coercion::ToDouble => "double",
            Coercion::ToChar => "char",
            Coercion::ToStr => "String",
        }
    }
}

/// What a plan finally calls.
#[derive(Clone)]
pub enum PlanTarget {
    Native(NativeFn),
    /// Allocate an instance of the receiver class and run `init`, if any.
    Construct(Option<InitFn>),
    FieldGet(Arc<FieldDescriptor>),
    FieldSet(Arc<FieldDescriptor>),
    /// `invokeMethod(name, args)`
    InvokeHook { hook: NativeFn, name: Arc<str> },
    /// `getProperty(name)` or, with one argument, `setProperty(name, value)`
    PropertyHook { hook: NativeFn, name: Arc<str> },
    Fast(Intrinsic),
    ConstantNull,
}

impl std::fmt::Debug for PlanTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanTarget::Native(_) => write!(f, "Native"),
            PlanTarget::Construct(init) => write!(f, "Construct(init: {})", init.is_some()),
            PlanTarget::FieldGet(field) => write!(f, "FieldGet({})", field.name()),
            PlanTarget::FieldSet(field) => write!(f, "FieldSet({})", field.name()),
            PlanTarget::InvokeHook { name, .. } => write!(f, "InvokeHook({})", name),
            PlanTarget::PropertyHook { name, .. } => write!(f, "PropertyHook({})", name),
            PlanTarget::Fast(op) => write!(f, "Fast({:?})", op),
            PlanTarget::ConstantNull => write!(f, "ConstantNull"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub target: PlanTarget,
    pub arity: ArityCorrection,
    /// Indexed by parameter position after arity correction.
    pub coercions: SmallVec<[Option<Coercion>; 4]>,
    /// Applied to each collected variadic element.
    pub vararg_coercion: Option<Coercion>,
    /// Human-readable description of the selected member.
    pub label: Arc<str>,
}

impl DispatchPlan {
    pub fn constant_null() -> Self {
        Self {
            target: PlanTarget::ConstantNull,
            arity: ArityCorrection::None,
            coercions: SmallVec::new(),
            vararg_coercion: None,
            label: Arc::from("null"),
        }
    }

    /// Run the plan. Exceptions raised by the target lose one level of
    /// internal wrapping.
    pub fn execute(&self, receiver: &Value, args: &[Value]) -> DispatchResult<Value> {
        if let PlanTarget::ConstantNull = self.target {
            return Ok(Value::Null);
        }
        let args = self.adapt(args)?;
        self.call(receiver, &args).map_err(DispatchError::unwrap_runtime)
    }

    fn adapt(&self, args: &[Value]) -> DispatchResult<Args> {
        let mut adapted: Args = match self.arity {
            ArityCorrection::None => args.iter().cloned().collect(),
            ArityCorrection::AppendNull => args.iter().cloned().chain(std::iter::once(Value::Null)).collect(),
            ArityCorrection::EmptyVarargs => args
                .iter()
                .cloned()
                .chain(std::iter::once(Value::array(Vec::new())))
                .collect(),
            ArityCorrection::CollectVarargs { from } => {
                if from > args.len() {
                    return Err(DispatchError::internal(format!(
                        "variadic collection from {} with only {} arguments",
                        from,
                        args.len()
                    )));
                }
                let (fixed, rest) = args.split_at(from);
                let collected = rest
                    .iter()
                    .enumerate()
                    .map(|(i, value)| match self.vararg_coercion {
                        Some(coercion) => coercion.apply(from + i, value.clone()),
                        None => Ok(value.clone()),
                    })
                    .collect::<DispatchResult<Vec<Value>>>()?;
                fixed
                    .iter()
                    .cloned()
                    .chain(std::iter::once(Value::array(collected)))
                    .collect()
            }
        };

        for (position, coercion) in self.coercions.iter().enumerate() {
            let (Some(coercion), Some(slot)) = (coercion, adapted.get_mut(position)) else {
                continue;
            };
            let value = std::mem::replace(slot, Value::Null);
            *slot = coercion.apply(position, value)?;
        }
        Ok(adapted)
    }

    fn call(&self, receiver: &Value, args: &[Value]) -> DispatchResult<Value> {
        match &self.target {
            PlanTarget::Native(f) => f(receiver, args),
            PlanTarget::Construct(init) => {
                let Value::Class(class) = receiver else {
                    return Err(DispatchError::internal(format!(
                        "constructor invoked on {} receiver",
                        receiver.type_name()
                    )));
                };
                let instance = Arc::new(Instance::new(class.clone()));
                if let Some(init) = init {
                    init(&instance, args)?;
                }
                Ok(Value::Object(instance))
            }
            PlanTarget::FieldGet(field) => read_field(receiver, field),
            PlanTarget::FieldSet(field) => {
                let value = args.first().cloned().unwrap_or(Value::Null);
                write_field(receiver, field, value)?;
                Ok(Value::Null)
            }
            PlanTarget::InvokeHook { hook, name } => {
                let hook_args = [Value::Str(name.clone()), Value::array(args.to_vec())];
                hook(receiver, &hook_args)
            }
            PlanTarget::PropertyHook { hook, name } => {
                let mut hook_args: Args = SmallVec::new();
                hook_args.push(Value::Str(name.clone()));
                hook_args.extend(args.iter().cloned());
                hook(receiver, &hook_args)
            }
            PlanTarget::Fast(op) => fast_path::run(*op, receiver, args),
            PlanTarget::ConstantNull => Ok(Value::Null),
        }
    }
}

/// The class in `start`'s superclass chain that declares `field`.
fn declaring_class(start: &Arc<Class>, field: &FieldDescriptor) -> Option<Arc<Class>> {
    let mut current = Some(start.clone());
    while let Some(class) = current {
        if class.name() == field.declaring_name() {
            return Some(class);
        }
        current = class.superclass().cloned();
    }
    None
}

fn owner_class(receiver: &Value) -> Option<&Arc<Class>> {
    match receiver {
        Value::Class(class) => Some(class),
        Value::Object(instance) => Some(instance.class()),
        _ => None,
    }
}

fn read_field(receiver: &Value, field: &FieldDescriptor) -> DispatchResult<Value> {
    if field.is_static() {
        let class = owner_class(receiver)
            .and_then(|c| declaring_class(c, field))
            .ok_or_else(|| field_mismatch(receiver, field))?;
        return Ok(class.static_value(field.slot()));
    }
    match receiver {
        Value::Object(instance) => Ok(instance.field(field.slot())),
        _ => Err(field_mismatch(receiver, field)),
    }
}

fn write_field(receiver: &Value, field: &FieldDescriptor, value: Value) -> DispatchResult<()> {
    let written = if field.is_static() {
        owner_class(receiver)
            .and_then(|c| declaring_class(c, field))
            .map(|class| class.set_static_value(field.slot(), value))
            .unwrap_or(false)
    } else {
        match receiver {
            Value::Object(instance) => instance.set_field(field.slot(), value),
            _ => false,
        }
    };
    if written {
        Ok(())
    } else {
        Err(field_mismatch(receiver, field))
    }
}

fn field_mismatch(receiver: &Value, field: &FieldDescriptor) -> DispatchError {
    DispatchError::internal(format!(
        "field {}.{} is not reachable from {} receiver",
        field.declaring_name(),
        field.name(),
        receiver.type_name()
    ))
}
