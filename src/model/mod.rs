//! Runtime model consumed by dispatch: values, classes and the symbol table.

pub mod builtins;
pub mod class;
pub mod symbol_table;
pub mod value;

pub use builtins::Builtins;
pub use class::{
    ArithOp, Class, ClassBuilder, ClassId, DispatchTable, FieldDescriptor, Intrinsic, MethodBody,
    MethodDef, MethodDescriptor, NumKind, ParamType, Visibility, CONSTRUCTOR_NAME,
};
pub use symbol_table::SymbolTable;
pub use value::{Instance, Value, ValueKind};
