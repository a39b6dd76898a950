//! Symbol resolution: picks the member a call site should invoke for the
//! runtime types it is seeing right now.
//!
//! Lookup order for a method call:
//! 1. the receiver's per-instance dispatch table
//! 2. categories active on this thread, innermost first
//! 3. the receiver's class, superclasses, then interfaces
//!
//! Inside each source, overloads are matched in phases: same arity with
//! exact or assignable types, then variadic collection, then an omitted
//! trailing argument filled with null. The cheapest conversion wins, ties go
//! to the most-derived declaring class, and remaining ties are ambiguous.
//!
//! Resolution is a pure function of (receiver type, argument types, symbol
//! table, active categories).

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::trace;

use crate::dispatch::call_site::{CallFlags, CallKind};
use crate::dispatch::category;
use crate::error::{DispatchError, DispatchResult};
use crate::model::{Class, FieldDescriptor, MethodDescriptor, ParamType, SymbolTable, Value, CONSTRUCTOR_NAME};

/// Name of the generic method-invocation hook (`invokeMethod(name, args)`).
pub const INVOKE_METHOD_HOOK: &str = "invokeMethod";
/// Name of the generic property-read hook (`getProperty(name)`).
pub const GET_PROPERTY_HOOK: &str = "getProperty";
/// Name of the generic property-write hook (`setProperty(name, value)`).
pub const SET_PROPERTY_HOOK: &str = "setProperty";

const NULL_TO_REFERENCE: u32 = 1;
const NULL_TO_ANY: u32 = 2;
const CHAR_TO_STRING: u32 = 3;
const ANY_BASE: u32 = 10;

/// Everything resolution needs to know about one invocation.
#[derive(Debug, Clone, Copy)]
pub struct CallShape<'a> {
    pub name: &'a str,
    pub kind: CallKind,
    pub flags: CallFlags,
    /// The class the call expression was compiled in.
    pub owner: Option<&'a Arc<Class>>,
    /// Declared type an interface call goes through.
    pub interface: Option<&'a Arc<Class>>,
    pub receiver: &'a Value,
    pub args: &'a [Value],
}

/// What the call site should invoke.
#[derive(Debug, Clone)]
pub enum Selection {
    Method {
        method: Arc<MethodDescriptor>,
        via_instance_table: bool,
    },
    Constructor {
        class: Arc<Class>,
        /// `None` selects the implicit no-argument constructor.
        method: Option<Arc<MethodDescriptor>>,
    },
    FieldGet(Arc<FieldDescriptor>),
    FieldSet(Arc<FieldDescriptor>),
    /// Generic `invokeMethod(name, args)` on the receiver.
    InvokeHook {
        hook: Arc<MethodDescriptor>,
        name: Arc<str>,
    },
    /// Generic `getProperty(name)` / `setProperty(name, value)` on the receiver.
    PropertyHook {
        hook: Arc<MethodDescriptor>,
        name: Arc<str>,
    },
    /// Safe navigation on a null receiver.
    ConstantNull,
}

impl Selection {
    /// The method this selection will run, if it runs one.
    pub fn method(&self) -> Option<&Arc<MethodDescriptor>> {
        match self {
            Selection::Method { method, .. } => Some(method),
            Selection::Constructor { method, .. } => method.as_ref(),
            Selection::InvokeHook { hook, .. } | Selection::PropertyHook { hook, .. } => Some(hook),
            _ => None,
        }
    }

    pub fn is_category_method(&self) -> bool {
        matches!(self, Selection::Method { method, .. } if method.is_category())
    }
}

#[derive(Debug, Clone)]
pub enum Resolution {
    Found(Selection),
    NotFound,
}

pub struct Resolver<'a> {
    symbols: &'a SymbolTable,
}

impl<'a> Resolver<'a> {
    pub fn new(symbols: &'a SymbolTable) -> Self {
        Self { symbols }
    }

    /// Resolve a call. Only ambiguity is an error here; a missing member is
    /// reported as [`Resolution::NotFound`] so the caller can try the
    /// receiver's generic hooks.
    pub fn resolve(&self, shape: &CallShape<'_>) -> DispatchResult<Resolution> {
        if shape.receiver.is_null() && shape.flags.contains(CallFlags::SAFE_NAVIGATION) {
            trace!(name = shape.name, "safe navigation on null receiver");
            return Ok(Resolution::Found(Selection::ConstantNull));
        }

        let found = match shape.kind {
            CallKind::Method => self.resolve_method(shape)?,
            CallKind::Interface => self.resolve_interface(shape)?,
            CallKind::Init => self.resolve_constructor(shape)?,
            CallKind::GetProperty => self.resolve_property_get(shape)?,
            CallKind::SetProperty => self.resolve_property_set(shape)?,
        };

        match found {
            Some(selection) => {
                trace!(name = shape.name, kind = ?shape.kind, selection = ?selection_label(&selection), "resolved");
                Ok(Resolution::Found(selection))
            }
            None => {
                trace!(name = shape.name, kind = ?shape.kind, "no member found");
                Ok(Resolution::NotFound)
            }
        }
    }

    /// The receiver's generic hook for this kind of call, if it defines one.
    pub fn resolve_hook(&self, shape: &CallShape<'_>) -> Option<Selection> {
        let (hook_name, arity) = match shape.kind {
            CallKind::Method | CallKind::Interface => (INVOKE_METHOD_HOOK, 2),
            CallKind::GetProperty => (GET_PROPERTY_HOOK, 1),
            CallKind::SetProperty => (SET_PROPERTY_HOOK, 2),
            CallKind::Init => return None,
        };
        let hook = self.find_hook(shape.receiver, hook_name, arity)?;
        let name: Arc<str> = Arc::from(shape.name);
        Some(match shape.kind {
            CallKind::Method | CallKind::Interface => Selection::InvokeHook { hook, name },
            _ => Selection::PropertyHook { hook, name },
        })
    }

    fn find_hook(&self, receiver: &Value, hook_name: &str, arity: usize) -> Option<Arc<MethodDescriptor>> {
        let class = self.symbols.class_of(receiver);
        class
            .linearize()
            .iter()
            .flat_map(|c| c.declared_methods(hook_name))
            .find(|m| !m.is_static() && m.params().len() == arity)
    }

    fn resolve_method(&self, shape: &CallShape<'_>) -> DispatchResult<Option<Selection>> {
        if let Value::Class(target) = shape.receiver {
            return self.resolve_static(shape, target);
        }

        let class = self.symbols.class_of(shape.receiver);

        if class.intercepts_all() {
            if let Some(hook) = self.find_hook(shape.receiver, INVOKE_METHOD_HOOK, 2) {
                trace!(class = %class.name(), "receiver intercepts all calls");
                return Ok(Some(Selection::InvokeHook {
                    hook,
                    name: Arc::from(shape.name),
                }));
            }
        }

        if let Some(table) = shape.receiver.dispatch_table() {
            let candidates = table.methods(shape.name);
            if let Some(method) = self.select(&class, shape.name, candidates, shape.args)? {
                return Ok(Some(Selection::Method {
                    method,
                    via_instance_table: true,
                }));
            }
        }

        Ok(self
            .select_instance_method(&class, shape.name, shape)?
            .map(|method| Selection::Method {
                method,
                via_instance_table: false,
            }))
    }

    fn resolve_interface(&self, shape: &CallShape<'_>) -> DispatchResult<Option<Selection>> {
        if let Some(interface) = shape.interface {
            let class = self.symbols.class_of(shape.receiver);
            if !class.is_assignable_to(interface.name()) {
                trace!(class = %class.name(), interface = %interface.name(), "receiver does not implement interface");
                return Ok(None);
            }
        }
        self.resolve_method(shape)
    }

    /// Categories first, then the class hierarchy.
    fn select_instance_method(
        &self,
        class: &Arc<Class>,
        name: &str,
        shape: &CallShape<'_>,
    ) -> DispatchResult<Option<Arc<MethodDescriptor>>> {
        for category in category::active_categories() {
            let candidates = category.methods_for(class, name);
            if let Some(method) = self.select(class, name, &candidates, shape.args)? {
                trace!(category = %category.name(), "category method selected");
                return Ok(Some(method));
            }
        }

        let private_owner = if shape.flags.contains(CallFlags::THIS_CALL) {
            shape.owner.map(|owner| owner.id())
        } else {
            None
        };
        let candidates = self.hierarchy_methods(class, name, |method| {
            !method.is_private() || Some(method.declaring()) == private_owner
        });
        self.select(class, name, &candidates, shape.args)
    }

    fn resolve_static(&self, shape: &CallShape<'_>, target: &Arc<Class>) -> DispatchResult<Option<Selection>> {
        let statics = self.hierarchy_methods(target, shape.name, |method| method.is_static());
        if let Some(method) = self.select(target, shape.name, &statics, shape.args)? {
            return Ok(Some(Selection::Method {
                method,
                via_instance_table: false,
            }));
        }

        // Methods of `Class` itself, e.g. `getName`.
        let meta = self.symbols.builtins().class.clone();
        Ok(self
            .select_instance_method(&meta, shape.name, shape)?
            .map(|method| Selection::Method {
                method,
                via_instance_table: false,
            }))
    }

    fn resolve_constructor(&self, shape: &CallShape<'_>) -> DispatchResult<Option<Selection>> {
        let Value::Class(class) = shape.receiver else {
            return Ok(None);
        };
        if class.is_interface() {
            return Ok(None);
        }
        let constructors = class.declared_methods(CONSTRUCTOR_NAME);
        if constructors.is_empty() {
            return Ok(shape.args.is_empty().then(|| Selection::Constructor {
                class: class.clone(),
                method: None,
            }));
        }
        Ok(self
            .select(class, CONSTRUCTOR_NAME, &constructors, shape.args)?
            .map(|method| Selection::Constructor {
                class: class.clone(),
                method: Some(method),
            }))
    }

    fn resolve_property_get(&self, shape: &CallShape<'_>) -> DispatchResult<Option<Selection>> {
        let (class, statics_only) = match shape.receiver {
            Value::Class(target) => (target.clone(), true),
            other => (self.symbols.class_of(other), false),
        };

        if let Some(field) = class.find_field(shape.name) {
            if !statics_only || field.is_static() {
                return Ok(Some(Selection::FieldGet(field)));
            }
        }

        let capitalized = capitalize(shape.name);
        let getter = format!("get{}", capitalized);
        if let Some(selection) = self.resolve_accessor(shape, &getter, &[])? {
            return Ok(Some(selection));
        }

        let boolean_getter = format!("is{}", capitalized);
        match self.resolve_accessor(shape, &boolean_getter, &[])? {
            Some(Selection::Method { method, .. }) if method.returns() != Some(&ParamType::Bool) => Ok(None),
            other => Ok(other),
        }
    }

    fn resolve_property_set(&self, shape: &CallShape<'_>) -> DispatchResult<Option<Selection>> {
        let (class, statics_only) = match shape.receiver {
            Value::Class(target) => (target.clone(), true),
            other => (self.symbols.class_of(other), false),
        };

        if let Some(field) = class.find_field(shape.name) {
            if !field.is_final() && (!statics_only || field.is_static()) {
                return Ok(Some(Selection::FieldSet(field)));
            }
        }

        let setter = format!("set{}", capitalize(shape.name));
        self.resolve_accessor(shape, &setter, shape.args)
    }

    /// Resolve a conventional accessor as if it were called as a method.
    fn resolve_accessor(
        &self,
        shape: &CallShape<'_>,
        accessor: &str,
        args: &[Value],
    ) -> DispatchResult<Option<Selection>> {
        let accessor_shape = CallShape {
            name: accessor,
            kind: CallKind::Method,
            args,
            ..*shape
        };
        self.resolve_method(&accessor_shape)
    }

    /// Methods named `name` visible from `class`, with overridden
    /// signatures removed so the most-derived declaration remains.
    fn hierarchy_methods(
        &self,
        class: &Arc<Class>,
        name: &str,
        visible: impl Fn(&MethodDescriptor) -> bool,
    ) -> Vec<Arc<MethodDescriptor>> {
        let mut found: Vec<Arc<MethodDescriptor>> = Vec::new();
        for ancestor in class.linearize() {
            for method in ancestor.declared_methods(name) {
                if !visible(&method) {
                    continue;
                }
                if found.iter().any(|kept| kept.same_signature(&method)) {
                    continue;
                }
                found.push(method);
            }
        }
        found
    }

    /// Pick the best applicable overload out of `candidates`.
    fn select(
        &self,
        class: &Class,
        name: &str,
        candidates: &[Arc<MethodDescriptor>],
        args: &[Value],
    ) -> DispatchResult<Option<Arc<MethodDescriptor>>> {
        if candidates.is_empty() {
            return Ok(None);
        }

        let fixed: SmallVec<[(u32, &Arc<MethodDescriptor>); 4]> = candidates
            .iter()
            .filter(|m| m.params().len() == args.len())
            .filter_map(|m| self.fixed_cost(m.params(), args).map(|cost| (cost, m)))
            .collect();
        if !fixed.is_empty() {
            return self.most_specific(class, name, args, &fixed);
        }

        let variadic: SmallVec<[(u32, &Arc<MethodDescriptor>); 4]> = candidates
            .iter()
            .filter(|m| m.is_varargs() && args.len() + 1 >= m.params().len())
            .filter_map(|m| self.varargs_cost(m.params(), args).map(|cost| (cost, m)))
            .collect();
        if !variadic.is_empty() {
            trace!(name, "vararg overload selected");
            return self.most_specific(class, name, args, &variadic);
        }

        if args.is_empty() {
            let optional: SmallVec<[(u32, &Arc<MethodDescriptor>); 4]> = candidates
                .iter()
                .filter(|m| m.params().len() == 1 && !m.params()[0].is_primitive() && !m.is_varargs())
                .map(|m| (NULL_TO_REFERENCE, m))
                .collect();
            if !optional.is_empty() {
                trace!(name, "single-parameter overload selected for empty argument list");
                return self.most_specific(class, name, args, &optional);
            }
        }

        Ok(None)
    }

    fn most_specific(
        &self,
        class: &Class,
        name: &str,
        args: &[Value],
        scored: &[(u32, &Arc<MethodDescriptor>)],
    ) -> DispatchResult<Option<Arc<MethodDescriptor>>> {
        let Some(best_cost) = scored.iter().map(|(cost, _)| *cost).min() else {
            return Ok(None);
        };
        let cheapest: SmallVec<[&Arc<MethodDescriptor>; 4]> = scored
            .iter()
            .filter(|(cost, _)| *cost == best_cost)
            .map(|(_, m)| *m)
            .collect();
        let deepest = cheapest.iter().map(|m| m.depth()).max().unwrap_or(0);
        let winners: SmallVec<[&Arc<MethodDescriptor>; 4]> = cheapest
            .into_iter()
            .filter(|m| m.depth() == deepest)
            .collect();

        match winners.as_slice() {
            [only] => Ok(Some(Arc::clone(only))),
            [] => Ok(None),
            many => {
                let candidates: Vec<String> = many.iter().map(|m| m.signature()).collect();
                Err(DispatchError::ambiguity(
                    class.name(),
                    name,
                    argument_types(args),
                    candidates.join(", "),
                ))
            }
        }
    }

    fn fixed_cost(&self, params: &[ParamType], args: &[Value]) -> Option<u32> {
        params
            .iter()
            .zip(args)
            .try_fold(0u32, |total, (param, arg)| self.arg_cost(arg, param).map(|c| total + c))
    }

    fn varargs_cost(&self, params: &[ParamType], args: &[Value]) -> Option<u32> {
        let (last, fixed_params) = params.split_last()?;
        let element = last.element()?;
        if args.len() < fixed_params.len() {
            return None;
        }
        let (fixed_args, trailing) = args.split_at(fixed_params.len());
        let fixed = self.fixed_cost(fixed_params, fixed_args)?;
        trailing
            .iter()
            .try_fold(fixed, |total, arg| self.arg_cost(arg, element).map(|c| total + c))
    }

    /// Conversion cost from a runtime argument to a parameter type, or
    /// `None` if the argument is not assignable.
    pub fn arg_cost(&self, arg: &Value, param: &ParamType) -> Option<u32> {
        match (param, arg) {
            (ParamType::Any, Value::Null) => Some(NULL_TO_ANY),
            (ParamType::Any, other) => Some(ANY_BASE + self.symbols.class_of(other).depth() as u32),
            (p, Value::Null) if p.is_primitive() => None,
            (_, Value::Null) => Some(NULL_TO_REFERENCE),

            (ParamType::Bool, Value::Bool(_)) => Some(0),
            (ParamType::Int, Value::Int(_)) => Some(0),
            (ParamType::Long, Value::Long(_)) => Some(0),
            (ParamType::Long, Value::Int(_)) => Some(1),
            (ParamType::Double, Value::Double(_)) => Some(0),
            (ParamType::Double, Value::Long(_)) => Some(1),
            (ParamType::Double, Value::Int(_)) => Some(2),
            (ParamType::Char, Value::Char(_)) => Some(0),
            (ParamType::Str, Value::Str(_)) => Some(0),
            (ParamType::Str, Value::Char(_)) => Some(CHAR_TO_STRING),
            (ParamType::Array(_), Value::Array(_)) => Some(0),
            (ParamType::Class(name), other) => self.symbols.class_of(other).distance_to(name),
            _ => None,
        }
    }
}

/// `name` -> `Name`, for accessor lookup.
pub fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Comma-separated runtime type names, for error messages.
pub fn argument_types(args: &[Value]) -> String {
    args.iter()
        .map(|arg| arg.type_name())
        .collect::<Vec<_>>()
        .join(", ")
}

fn selection_label(selection: &Selection) -> String {
    match selection {
        Selection::Method { method, .. } => method.signature(),
        Selection::Constructor { class, method } => match method {
            Some(method) => method.signature(),
            None => format!("{}.<init>()", class.name()),
        },
        Selection::FieldGet(field) | Selection::FieldSet(field) => {
            format!("{}.{}", field.declaring_name(), field.name())
        }
        Selection::InvokeHook { hook, .. } | Selection::PropertyHook { hook, .. } => hook.signature(),
        Selection::ConstantNull => "null".to_string(),
    }
}
