//! Class metadata: classes, method and field descriptors, per-instance dispatch tables.
//!
//! Descriptors are immutable once published. Only the *set* of methods a
//! class exposes may change at runtime, and every such change goes through
//! the [`SymbolTable`](crate::model::SymbolTable) so the dispatch epoch is
//! replaced.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::error::DispatchResult;
use crate::model::value::{Instance, Value};

/// Name under which constructors are registered.
pub const CONSTRUCTOR_NAME: &str = "<init>";

/// First id handed out to non-builtin classes.
pub const FIRST_USER_CLASS_ID: u64 = 64;

static NEXT_CLASS_ID: AtomicU64 = AtomicU64::new(FIRST_USER_CLASS_ID);

/// Unique identity of a class. Guards compare these instead of names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u64);

impl ClassId {
    fn next() -> Self {
        ClassId(NEXT_CLASS_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassId({})", self.0)
    }
}

/// Declared type of a parameter or field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamType {
    /// Accepts anything; never coerced.
    Any,
    Bool,
    Int,
    Long,
    Double,
    Char,
    Str,
    Array(Box<ParamType>),
    /// A reference to a named class or interface (or any subtype).
    Class(Arc<str>),
}

impl ParamType {
    pub fn class(name: &str) -> Self {
        ParamType::Class(Arc::from(name))
    }

    pub fn array_of(element: ParamType) -> Self {
        ParamType::Array(Box::new(element))
    }

    /// Primitive parameters never hold null.
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            ParamType::Bool | ParamType::Int | ParamType::Long | ParamType::Double | ParamType::Char
        )
    }

    /// Parameters whose accepted runtime class cannot vary beyond what
    /// coercion normalizes. Argument guards are skipped for these.
    pub fn is_final(&self) -> bool {
        self.is_primitive() || matches!(self, ParamType::Str | ParamType::Array(_))
    }

    pub fn element(&self) -> Option<&ParamType> {
        match self {
            ParamType::Array(element) => Some(element),
            _ => None,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Any => write!(f, "Object"),
            ParamType::Bool => write!(f, "boolean"),
            ParamType::Int => write!(f, "int"),
            ParamType::Long => write!(f, "long"),
            ParamType::Double => write!(f, "double"),
            ParamType::Char => write!(f, "char"),
            ParamType::Str => write!(f, "String"),
            ParamType::Array(element) => write!(f, "{}[]", element),
            ParamType::Class(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Public,
    /// Only selectable from calls on `this` inside the declaring class.
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Plus,
    Minus,
    Multiply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumKind {
    Int,
    Long,
    Double,
}

/// Builtin operations the handle builder can run without the generic
/// invocation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    Arith(ArithOp, NumKind),
    ArrayClone,
}

pub type NativeFn = Arc<dyn Fn(&Value, &[Value]) -> DispatchResult<Value> + Send + Sync>;
pub type InitFn = Arc<dyn Fn(&Arc<Instance>, &[Value]) -> DispatchResult<()> + Send + Sync>;

/// How a method is actually run.
#[derive(Clone)]
pub enum MethodBody {
    Native(NativeFn),
    Init(InitFn),
    Intrinsic(Intrinsic),
    /// Declared without an invokable body. Selecting it is an internal error.
    Abstract,
}

impl fmt::Debug for MethodBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodBody::Native(_) => write!(f, "Native"),
            MethodBody::Init(_) => write!(f, "Init"),
            MethodBody::Intrinsic(op) => write!(f, "Intrinsic({:?})", op),
            MethodBody::Abstract => write!(f, "Abstract"),
        }
    }
}

/// An unpublished method definition.
#[derive(Debug, Clone)]
pub struct MethodDef {
    name: Arc<str>,
    params: Vec<ParamType>,
    varargs: bool,
    is_static: bool,
    visibility: Visibility,
    returns: Option<ParamType>,
    body: MethodBody,
}

impl MethodDef {
    pub fn native<F>(name: &str, params: Vec<ParamType>, body: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> DispatchResult<Value> + Send + Sync + 'static,
    {
        Self::with_body(name, params, MethodBody::Native(Arc::new(body)))
    }

    pub fn constructor<F>(params: Vec<ParamType>, body: F) -> Self
    where
        F: Fn(&Arc<Instance>, &[Value]) -> DispatchResult<()> + Send + Sync + 'static,
    {
        Self::with_body(CONSTRUCTOR_NAME, params, MethodBody::Init(Arc::new(body)))
    }

    pub fn intrinsic(name: &str, params: Vec<ParamType>, op: Intrinsic) -> Self {
        Self::with_body(name, params, MethodBody::Intrinsic(op))
    }

    pub fn declared(name: &str, params: Vec<ParamType>) -> Self {
        Self::with_body(name, params, MethodBody::Abstract)
    }

    fn with_body(name: &str, params: Vec<ParamType>, body: MethodBody) -> Self {
        Self {
            name: Arc::from(name),
            params,
            varargs: false,
            is_static: false,
            visibility: Visibility::Public,
            returns: None,
            body,
        }
    }

    /// Mark the trailing array parameter as variadic.
    pub fn varargs(mut self) -> Self {
        self.varargs = matches!(self.params.last(), Some(ParamType::Array(_)));
        self
    }

    pub fn static_method(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn private(mut self) -> Self {
        self.visibility = Visibility::Private;
        self
    }

    /// Declare the return type. Only `is`-prefixed boolean getters need it.
    pub fn returns(mut self, ty: ParamType) -> Self {
        self.returns = Some(ty);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A published method, bound to the class (or category) that declares it.
#[derive(Debug)]
pub struct MethodDescriptor {
    def: MethodDef,
    declaring: ClassId,
    declaring_name: Arc<str>,
    depth: usize,
    category: bool,
}

impl MethodDescriptor {
    pub(crate) fn bind(def: MethodDef, declaring: ClassId, declaring_name: Arc<str>, depth: usize) -> Self {
        Self {
            def,
            declaring,
            declaring_name,
            depth,
            category: false,
        }
    }

    pub(crate) fn bind_category(def: MethodDef, category: ClassId, category_name: Arc<str>) -> Self {
        Self {
            def,
            declaring: category,
            declaring_name: category_name,
            depth: 0,
            category: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn params(&self) -> &[ParamType] {
        &self.def.params
    }

    pub fn is_varargs(&self) -> bool {
        self.def.varargs
    }

    pub fn returns(&self) -> Option<&ParamType> {
        self.def.returns.as_ref()
    }

    pub fn is_static(&self) -> bool {
        self.def.is_static
    }

    pub fn is_private(&self) -> bool {
        self.def.visibility == Visibility::Private
    }

    pub fn is_constructor(&self) -> bool {
        &*self.def.name == CONSTRUCTOR_NAME
    }

    pub fn is_category(&self) -> bool {
        self.category
    }

    pub fn body(&self) -> &MethodBody {
        &self.def.body
    }

    pub fn declaring(&self) -> ClassId {
        self.declaring
    }

    pub fn declaring_name(&self) -> &str {
        &self.declaring_name
    }

    /// Inheritance depth of the declaring class (`Object` is 0).
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// True if both descriptors take the same parameter list.
    pub fn same_signature(&self, other: &MethodDescriptor) -> bool {
        self.def.params == other.def.params && self.def.varargs == other.def.varargs
    }

    pub fn signature(&self) -> String {
        let params: Vec<String> = self.def.params.iter().map(|p| p.to_string()).collect();
        format!("{}.{}({})", self.declaring_name, self.def.name, params.join(", "))
    }
}

/// A field (instance or static) that property access can read or write.
#[derive(Debug)]
pub struct FieldDescriptor {
    name: Arc<str>,
    ty: ParamType,
    slot: usize,
    is_static: bool,
    is_final: bool,
    declaring_name: Arc<str>,
}

impl FieldDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &ParamType {
        &self.ty
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }

    pub fn is_final(&self) -> bool {
        self.is_final
    }

    pub fn declaring_name(&self) -> &str {
        &self.declaring_name
    }
}

/// Methods attached to a single instance, shadowing its class.
///
/// Tables are immutable; replacing an instance's table changes its identity,
/// which is what receiver guards compare.
#[derive(Debug)]
pub struct DispatchTable {
    methods: AHashMap<Arc<str>, Vec<Arc<MethodDescriptor>>>,
}

impl DispatchTable {
    pub fn new(class: &Class, defs: Vec<MethodDef>) -> Arc<Self> {
        let mut methods: AHashMap<Arc<str>, Vec<Arc<MethodDescriptor>>> = AHashMap::new();
        for def in defs {
            let descriptor = MethodDescriptor::bind(def, class.id(), class.name.clone(), class.depth() + 1);
            methods
                .entry(descriptor.def.name.clone())
                .or_default()
                .push(Arc::new(descriptor));
        }
        Arc::new(Self { methods })
    }

    pub fn methods(&self, name: &str) -> &[Arc<MethodDescriptor>] {
        self.methods.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Default)]
struct Members {
    methods: AHashMap<Arc<str>, Vec<Arc<MethodDescriptor>>>,
    fields: Vec<Arc<FieldDescriptor>>,
}

/// Runtime class metadata.
pub struct Class {
    id: ClassId,
    name: Arc<str>,
    meta_key: Arc<str>,
    superclass: Option<Arc<Class>>,
    interfaces: Vec<Arc<Class>>,
    depth: usize,
    is_interface: bool,
    intercepts_all: bool,
    instance_fields: usize,
    members: RwLock<Members>,
    statics: RwLock<Vec<Value>>,
    per_instance_tables: AtomicBool,
}

impl Class {
    pub fn id(&self) -> ClassId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn name_arc(&self) -> &Arc<str> {
        &self.name
    }

    /// Cache key used when this class is itself the receiver (static calls,
    /// constructors).
    pub fn meta_key(&self) -> &Arc<str> {
        &self.meta_key
    }

    pub fn superclass(&self) -> Option<&Arc<Class>> {
        self.superclass.as_ref()
    }

    pub fn interfaces(&self) -> &[Arc<Class>] {
        &self.interfaces
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_interface(&self) -> bool {
        self.is_interface
    }

    /// Every method call on instances goes through `invokeMethod`.
    pub fn intercepts_all(&self) -> bool {
        self.intercepts_all
    }

    pub fn instance_field_count(&self) -> usize {
        self.instance_fields
    }

    pub fn has_per_instance_tables(&self) -> bool {
        self.per_instance_tables.load(Ordering::Acquire)
    }

    pub(crate) fn mark_per_instance_tables(&self) {
        self.per_instance_tables.store(true, Ordering::Release);
    }

    /// Methods with this name declared directly on this class.
    pub fn declared_methods(&self, name: &str) -> Vec<Arc<MethodDescriptor>> {
        self.members
            .read()
            .methods
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Find a field by name on this class or any superclass.
    pub fn find_field(&self, name: &str) -> Option<Arc<FieldDescriptor>> {
        let own = self
            .members
            .read()
            .fields
            .iter()
            .find(|field| &*field.name == name)
            .cloned();
        own.or_else(|| self.superclass.as_ref().and_then(|s| s.find_field(name)))
    }

    pub fn static_value(&self, slot: usize) -> Value {
        self.statics.read().get(slot).cloned().unwrap_or(Value::Null)
    }

    pub fn set_static_value(&self, slot: usize, value: Value) -> bool {
        match self.statics.write().get_mut(slot) {
            Some(current) => {
                *current = value;
                true
            }
            None => false,
        }
    }

    /// Distance from this class to the named class or interface, if this
    /// class is assignable to it.
    pub fn distance_to(&self, name: &str) -> Option<u32> {
        if &*self.name == name {
            return Some(0);
        }
        let via_super = self
            .superclass
            .as_ref()
            .and_then(|s| s.distance_to(name))
            .map(|d| d + 1);
        let via_interfaces = self
            .interfaces
            .iter()
            .filter_map(|i| i.distance_to(name))
            .min()
            .map(|d| d + 1);
        match (via_super, via_interfaces) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn is_assignable_to(&self, name: &str) -> bool {
        self.distance_to(name).is_some()
    }

    /// This class, its superclasses, then every implemented interface, each
    /// exactly once and most-derived first.
    pub fn linearize(self: &Arc<Self>) -> Vec<Arc<Class>> {
        let mut order: Vec<Arc<Class>> = Vec::new();
        let mut current = Some(self.clone());
        while let Some(class) = current {
            current = class.superclass.clone();
            order.push(class);
        }
        let mut index = 0;
        let supers = order.len();
        let mut pending: Vec<Arc<Class>> = order[..supers]
            .iter()
            .flat_map(|c| c.interfaces.iter().cloned())
            .collect();
        while index < pending.len() {
            let iface = pending[index].clone();
            index += 1;
            if order.iter().any(|c| c.id == iface.id) {
                continue;
            }
            pending.extend(iface.interfaces.iter().cloned());
            order.push(iface);
        }
        order
    }

    pub(crate) fn add_method(&self, descriptor: Arc<MethodDescriptor>) {
        self.members
            .write()
            .methods
            .entry(descriptor.def.name.clone())
            .or_default()
            .push(descriptor);
    }

    /// Remove declared methods with this name and parameter count.
    pub(crate) fn remove_methods(&self, name: &str, arity: usize) -> usize {
        let mut members = self.members.write();
        let Some(list) = members.methods.get_mut(name) else {
            return 0;
        };
        let before = list.len();
        list.retain(|m| m.params().len() != arity);
        before - list.len()
    }

    pub(crate) fn bind_method(&self, def: MethodDef) -> Arc<MethodDescriptor> {
        Arc::new(MethodDescriptor::bind(def, self.id, self.name.clone(), self.depth))
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("superclass", &self.superclass.as_ref().map(|s| s.name()))
            .finish()
    }
}

struct FieldDef {
    name: Arc<str>,
    ty: ParamType,
    is_static: bool,
    is_final: bool,
    initial: Value,
}

/// Builder for a class definition; publish it with
/// [`SymbolTable::define`](crate::model::SymbolTable::define).
pub struct ClassBuilder {
    id: Option<ClassId>,
    name: Arc<str>,
    superclass: Option<Arc<Class>>,
    interfaces: Vec<Arc<Class>>,
    is_interface: bool,
    intercepts_all: bool,
    methods: Vec<MethodDef>,
    fields: Vec<FieldDef>,
}

impl ClassBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            id: None,
            name: Arc::from(name),
            superclass: None,
            interfaces: Vec::new(),
            is_interface: false,
            intercepts_all: false,
            methods: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub(crate) fn with_id(mut self, id: ClassId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn extends(mut self, superclass: &Arc<Class>) -> Self {
        self.superclass = Some(superclass.clone());
        self
    }

    pub fn implements(mut self, interface: &Arc<Class>) -> Self {
        self.interfaces.push(interface.clone());
        self
    }

    pub fn interface(mut self) -> Self {
        self.is_interface = true;
        self
    }

    pub fn intercepts_all(mut self) -> Self {
        self.intercepts_all = true;
        self
    }

    pub fn method(mut self, def: MethodDef) -> Self {
        self.methods.push(def);
        self
    }

    pub fn field(mut self, name: &str, ty: ParamType) -> Self {
        self.fields.push(FieldDef {
            name: Arc::from(name),
            ty,
            is_static: false,
            is_final: false,
            initial: Value::Null,
        });
        self
    }

    pub fn final_field(mut self, name: &str, ty: ParamType) -> Self {
        self.fields.push(FieldDef {
            name: Arc::from(name),
            ty,
            is_static: false,
            is_final: true,
            initial: Value::Null,
        });
        self
    }

    pub fn static_field(mut self, name: &str, ty: ParamType, initial: Value) -> Self {
        self.fields.push(FieldDef {
            name: Arc::from(name),
            ty,
            is_static: true,
            is_final: false,
            initial,
        });
        self
    }

    pub(crate) fn has_superclass(&self) -> bool {
        self.superclass.is_some()
    }

    pub(crate) fn is_interface_def(&self) -> bool {
        self.is_interface
    }

    pub(crate) fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub(crate) fn build(self) -> Arc<Class> {
        let id = self.id.unwrap_or_else(ClassId::next);
        let depth = self.superclass.as_ref().map(|s| s.depth + 1).unwrap_or(0);
        let inherited = self
            .superclass
            .as_ref()
            .map(|s| s.instance_fields)
            .unwrap_or(0);

        let mut fields = Vec::with_capacity(self.fields.len());
        let mut statics = Vec::new();
        let mut next_slot = inherited;
        for def in self.fields {
            let slot = if def.is_static {
                statics.push(def.initial);
                statics.len() - 1
            } else {
                next_slot += 1;
                next_slot - 1
            };
            fields.push(Arc::new(FieldDescriptor {
                name: def.name,
                ty: def.ty,
                slot,
                is_static: def.is_static,
                is_final: def.is_final,
                declaring_name: self.name.clone(),
            }));
        }

        let mut methods: AHashMap<Arc<str>, Vec<Arc<MethodDescriptor>>> = AHashMap::new();
        for def in self.methods {
            let descriptor = MethodDescriptor::bind(def, id, self.name.clone(), depth);
            methods
                .entry(descriptor.def.name.clone())
                .or_default()
                .push(Arc::new(descriptor));
        }

        Arc::new(Class {
            id,
            meta_key: Arc::from(format!("class {}", self.name)),
            name: self.name,
            superclass: self.superclass,
            interfaces: self.interfaces,
            depth,
            is_interface: self.is_interface,
            intercepts_all: self.intercepts_all,
            instance_fields: next_slot,
            members: RwLock::new(Members { methods, fields }),
            statics: RwLock::new(statics),
            per_instance_tables: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hierarchy() -> (Arc<Class>, Arc<Class>, Arc<Class>) {
        let named = ClassBuilder::new("Named").interface().build();
        let base = ClassBuilder::new("Base")
            .field("id", ParamType::Long)
            .build();
        let derived = ClassBuilder::new("Derived")
            .extends(&base)
            .implements(&named)
            .field("label", ParamType::Str)
            .static_field("count", ParamType::Int, Value::Int(3))
            .build();
        (named, base, derived)
    }

    #[test]
    fn test_field_slots_continue_after_superclass() {
        let (_, base, derived) = hierarchy();
        assert_eq!(base.instance_field_count(), 1);
        assert_eq!(derived.instance_field_count(), 2);
        assert_eq!(derived.find_field("id").map(|f| f.slot()), Some(0));
        assert_eq!(derived.find_field("label").map(|f| f.slot()), Some(1));

        let count = derived.find_field("count").expect("static field");
        assert!(count.is_static());
        assert_eq!(derived.static_value(count.slot()), Value::Int(3));
    }

    #[test]
    fn test_distance_walks_superclasses_and_interfaces() {
        let (named, base, derived) = hierarchy();
        assert_eq!(derived.distance_to("Derived"), Some(0));
        assert_eq!(derived.distance_to("Base"), Some(1));
        assert_eq!(derived.distance_to("Named"), Some(1));
        assert_eq!(base.distance_to("Named"), None);
        assert!(!named.is_assignable_to("Base"));
    }

    #[test]
    fn test_linearize_is_most_derived_first() {
        let (_, _, derived) = hierarchy();
        let names: Vec<String> = derived.linearize().iter().map(|c| c.name().to_string()).collect();
        assert_eq!(names, vec!["Derived", "Base", "Named"]);
    }

    #[test]
    fn test_varargs_requires_trailing_array() {
        let ok = MethodDef::declared("f", vec![ParamType::array_of(ParamType::Any)]).varargs();
        let not = MethodDef::declared("f", vec![ParamType::Any]).varargs();
        let class = ClassBuilder::new("V").build();
        assert!(class.bind_method(ok).is_varargs());
        assert!(!class.bind_method(not).is_varargs());
    }

    #[test]
    fn test_remove_methods_by_arity() {
        let class = ClassBuilder::new("R")
            .method(MethodDef::declared("m", vec![]))
            .method(MethodDef::declared("m", vec![ParamType::Any]))
            .build();
        assert_eq!(class.remove_methods("m", 1), 1);
        assert_eq!(class.declared_methods("m").len(), 1);
        assert_eq!(class.remove_methods("missing", 0), 0);
    }
}
