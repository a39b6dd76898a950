//! Runtime values seen by call sites.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::model::builtins;
use crate::model::class::{Class, ClassId, DispatchTable};

/// A runtime value passed as receiver or argument.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Char(char),
    Str(Arc<str>),
    Array(Arc<Vec<Value>>),
    Object(Arc<Instance>),
    Class(Arc<Class>),
}

/// Cheap classification of a value, used by coercions and fast paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Long,
    Double,
    Char,
    Str,
    Array,
    Object,
    Class,
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::Str(Arc::from(s.as_ref()))
    }

    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Arc::new(items))
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Long(_) => ValueKind::Long,
            Value::Double(_) => ValueKind::Double,
            Value::Char(_) => ValueKind::Char,
            Value::Str(_) => ValueKind::Str,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
            Value::Class(_) => ValueKind::Class,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Identity of the value's runtime class.
    ///
    /// Builtin kinds map to the fixed builtin class ids, so this never needs
    /// a symbol table lookup.
    #[inline]
    pub fn class_id(&self) -> ClassId {
        match self {
            Value::Null => builtins::NULL_OBJECT_ID,
            Value::Bool(_) => builtins::BOOLEAN_ID,
            Value::Int(_) => builtins::INTEGER_ID,
            Value::Long(_) => builtins::LONG_ID,
            Value::Double(_) => builtins::DOUBLE_ID,
            Value::Char(_) => builtins::CHARACTER_ID,
            Value::Str(_) => builtins::STRING_ID,
            Value::Array(_) => builtins::ARRAY_ID,
            Value::Object(instance) => instance.class().id(),
            Value::Class(_) => builtins::CLASS_ID,
        }
    }

    /// Name of the value's runtime class.
    pub fn type_name(&self) -> &str {
        match self {
            Value::Null => builtins::NULL_OBJECT,
            Value::Bool(_) => builtins::BOOLEAN,
            Value::Int(_) => builtins::INTEGER,
            Value::Long(_) => builtins::LONG,
            Value::Double(_) => builtins::DOUBLE,
            Value::Char(_) => builtins::CHARACTER,
            Value::Str(_) => builtins::STRING,
            Value::Array(_) => builtins::ARRAY,
            Value::Object(instance) => instance.class().name(),
            Value::Class(_) => builtins::CLASS,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n as i64),
            Value::Long(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Long(n) => Some(*n as f64),
            Value::Double(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Arc<Vec<Value>>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&Arc<Instance>> {
        match self {
            Value::Object(instance) => Some(instance),
            _ => None,
        }
    }

    /// The per-instance dispatch table, if the receiver carries one.
    pub fn dispatch_table(&self) -> Option<Arc<DispatchTable>> {
        self.as_instance().and_then(|instance| instance.dispatch_table())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => a.id() == b.id(),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Long(n) => write!(f, "{}", n),
            Value::Double(n) => write!(f, "{}", n),
            Value::Char(c) => write!(f, "{}", c),
            Value::Str(s) => write!(f, "{}", s),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Object(instance) => write!(f, "{}@{:x}", instance.class().name(), instance.identity()),
            Value::Class(class) => write!(f, "class {}", class.name()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Char(c) => write!(f, "{:?}", c),
            _ => write!(f, "{}", self),
        }
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Long(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Double(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

/// An instance of a user-defined class.
pub struct Instance {
    class: Arc<Class>,
    fields: RwLock<Vec<Value>>,
    table: RwLock<Option<Arc<DispatchTable>>>,
}

impl Instance {
    pub fn new(class: Arc<Class>) -> Self {
        let fields = vec![Value::Null; class.instance_field_count()];
        Self {
            class,
            fields: RwLock::new(fields),
            table: RwLock::new(None),
        }
    }

    pub fn class(&self) -> &Arc<Class> {
        &self.class
    }

    pub fn field(&self, slot: usize) -> Value {
        self.fields.read().get(slot).cloned().unwrap_or(Value::Null)
    }

    pub fn set_field(&self, slot: usize, value: Value) -> bool {
        match self.fields.write().get_mut(slot) {
            Some(field) => {
                *field = value;
                true
            }
            None => false,
        }
    }

    /// Read a field by name, walking the class hierarchy for its slot.
    pub fn field_named(&self, name: &str) -> Option<Value> {
        self.class
            .find_field(name)
            .filter(|field| !field.is_static())
            .map(|field| self.field(field.slot()))
    }

    pub fn dispatch_table(&self) -> Option<Arc<DispatchTable>> {
        self.table.read().clone()
    }

    /// Give this instance its own dispatch table.
    ///
    /// The owning class is marked as having per-instance tables, which makes
    /// call sites stop caching by class name for all of its instances.
    pub fn set_dispatch_table(&self, table: Arc<DispatchTable>) {
        self.class.mark_per_instance_tables();
        *self.table.write() = Some(table);
    }

    fn identity(&self) -> usize {
        self as *const Instance as usize
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("class", &self.class.name())
            .field("fields", &*self.fields.read())
            .finish()
    }
}
