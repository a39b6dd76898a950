//! Handle builder: turns a [`Selection`] into a [`DispatchPlan`].

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::trace;

use crate::dispatch::plan::{ArityCorrection, Coercion, DispatchPlan, PlanTarget};
use crate::dispatch::resolver::{CallShape, Selection};
use crate::error::{DispatchError, DispatchResult};
use crate::model::{MethodBody, MethodDescriptor, ParamType, Value};

pub struct HandleBuilder;

impl HandleBuilder {
    /// Build the plan for `selection` as invoked with `shape`'s arguments.
    ///
    /// A selected member without an invokable body means resolution and the
    /// class model disagree, which is an internal consistency error.
    pub fn build(selection: &Selection, shape: &CallShape<'_>) -> DispatchResult<DispatchPlan> {
        let plan = match selection {
            Selection::ConstantNull => DispatchPlan::constant_null(),
            Selection::Method { method, .. } => {
                let target = match method.body() {
                    MethodBody::Native(f) => PlanTarget::Native(f.clone()),
                    MethodBody::Intrinsic(op) => PlanTarget::Fast(*op),
                    MethodBody::Init(_) | MethodBody::Abstract => return Err(not_invokable(method)),
                };
                Self::for_params(target, method, shape.args)?
            }
            Selection::Constructor { class, method: None } => DispatchPlan {
                target: PlanTarget::Construct(None),
                arity: ArityCorrection::None,
                coercions: SmallVec::new(),
                vararg_coercion: None,
                label: Arc::from(format!("{}.<init>()", class.name())),
            },
            Selection::Constructor { method: Some(method), .. } => {
                let target = match method.body() {
                    MethodBody::Init(init) => PlanTarget::Construct(Some(init.clone())),
                    _ => return Err(not_invokable(method)),
                };
                Self::for_params(target, method, shape.args)?
            }
            Selection::FieldGet(field) => DispatchPlan {
                target: PlanTarget::FieldGet(field.clone()),
                arity: ArityCorrection::None,
                coercions: SmallVec::new(),
                vararg_coercion: None,
                label: Arc::from(format!("{}.{}", field.declaring_name(), field.name())),
            },
            Selection::FieldSet(field) => {
                let mut coercions = SmallVec::new();
                coercions.push(Coercion::for_param(field.ty()));
                DispatchPlan {
                    target: PlanTarget::FieldSet(field.clone()),
                    arity: ArityCorrection::None,
                    coercions,
                    vararg_coercion: None,
                    label: Arc::from(format!("{}.{}", field.declaring_name(), field.name())),
                }
            }
            Selection::InvokeHook { hook, name } => DispatchPlan {
                target: PlanTarget::InvokeHook {
                    hook: native_body(hook)?,
                    name: name.clone(),
                },
                arity: ArityCorrection::None,
                coercions: SmallVec::new(),
                vararg_coercion: None,
                label: Arc::from(hook.signature()),
            },
            Selection::PropertyHook { hook, name } => DispatchPlan {
                target: PlanTarget::PropertyHook {
                    hook: native_body(hook)?,
                    name: name.clone(),
                },
                arity: ArityCorrection::None,
                coercions: SmallVec::new(),
                vararg_coercion: None,
                label: Arc::from(hook.signature()),
            },
        };
        trace!(plan = %plan.label, arity = ?plan.arity, "handle built");
        Ok(plan)
    }

    fn for_params(target: PlanTarget, method: &MethodDescriptor, args: &[Value]) -> DispatchResult<DispatchPlan> {
        let params = method.params();
        let arity = correct_arity(method, args)?;
        if arity != ArityCorrection::None {
            trace!(method = %method.signature(), ?arity, "arity correction added");
        }

        let vararg_coercion = match arity {
            ArityCorrection::CollectVarargs { .. } => params.last().and_then(ParamType::element).and_then(Coercion::for_param),
            _ => None,
        };

        let coercions: SmallVec<[Option<Coercion>; 4]> = params.iter().map(Coercion::for_param).collect();
        for (position, (coercion, arg)) in coercions.iter().zip(args).enumerate() {
            if let Some(coercion) = coercion.filter(|c| c.converts(arg)) {
                trace!(method = %method.signature(), position, ?coercion, "coercion inserted");
            }
        }

        Ok(DispatchPlan {
            target,
            arity,
            coercions,
            vararg_coercion,
            label: Arc::from(method.signature()),
        })
    }
}

/// How `args` must be reshaped to fit `method`'s parameter list.
fn correct_arity(method: &MethodDescriptor, args: &[Value]) -> DispatchResult<ArityCorrection> {
    let params = method.params().len();
    let given = args.len();

    if method.is_varargs() {
        let last = params - 1;
        if given == params && matches!(args[last], Value::Array(_) | Value::Null) {
            return Ok(ArityCorrection::None);
        }
        if given == last {
            return Ok(ArityCorrection::EmptyVarargs);
        }
        if given >= last {
            return Ok(ArityCorrection::CollectVarargs { from: last });
        }
    } else if given == params {
        return Ok(ArityCorrection::None);
    } else if given + 1 == params && !method.params()[given].is_primitive() {
        return Ok(ArityCorrection::AppendNull);
    }

    Err(DispatchError::internal(format!(
        "{} selected for {} arguments",
        method.signature(),
        given
    )))
}

fn native_body(hook: &MethodDescriptor) -> DispatchResult<crate::model::class::NativeFn> {
    match hook.body() {
        MethodBody::Native(f) => Ok(f.clone()),
        _ => Err(not_invokable(hook)),
    }
}

fn not_invokable(method: &MethodDescriptor) -> DispatchError {
    DispatchError::internal(format!(
        "{} was selected but has no invokable body",
        method.signature()
    ))
}
