//! The class registry that resolution reads from.
//!
//! Reads are lock-free with respect to dispatch state: the table has its own
//! read/write lock, and every mutation that can change what a call site
//! would resolve replaces the dispatch epoch before returning.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::dispatch::epoch::Epoch;
use crate::model::builtins::Builtins;
use crate::model::class::{Class, ClassBuilder, MethodDef, MethodDescriptor};
use crate::model::value::Value;

pub struct SymbolTable {
    classes: RwLock<AHashMap<Arc<str>, Arc<Class>>>,
    builtins: Builtins,
    epoch: Arc<Epoch>,
}

impl SymbolTable {
    pub fn new(epoch: Arc<Epoch>) -> Self {
        let builtins = Builtins::new();
        let mut classes = AHashMap::new();
        for class in builtins.all() {
            classes.insert(class.name_arc().clone(), class.clone());
        }
        Self {
            classes: RwLock::new(classes),
            builtins,
            epoch,
        }
    }

    pub fn builtins(&self) -> &Builtins {
        &self.builtins
    }

    pub fn epoch(&self) -> &Arc<Epoch> {
        &self.epoch
    }

    /// Publish a class. Classes without an explicit superclass extend `Object`.
    ///
    /// Redefining an existing name replaces it and invalidates the epoch.
    pub fn define(&self, builder: ClassBuilder) -> Arc<Class> {
        let builder = if builder.has_superclass() || builder.is_interface_def() {
            builder
        } else {
            builder.extends(&self.builtins.object)
        };
        let name = builder.name().clone();
        let class = builder.build();
        let replaced = self.classes.write().insert(name.clone(), class.clone());
        if replaced.is_some() {
            debug!(class = %name, "class redefined");
            self.epoch.invalidate();
        }
        class
    }

    pub fn class(&self, name: &str) -> Option<Arc<Class>> {
        self.classes.read().get(name).cloned()
    }

    /// Runtime class of a value. Null resolves to `NullObject`.
    pub fn class_of(&self, value: &Value) -> Arc<Class> {
        self.builtins.class_of(value)
    }

    /// Add a method to a published class.
    pub fn add_method(&self, class: &Arc<Class>, def: MethodDef) -> Arc<MethodDescriptor> {
        let descriptor = class.bind_method(def);
        class.add_method(descriptor.clone());
        debug!(method = %descriptor.signature(), "method added");
        self.epoch.invalidate();
        descriptor
    }

    /// Remove methods by name and parameter count. Returns how many were removed.
    pub fn remove_method(&self, class: &Arc<Class>, name: &str, arity: usize) -> usize {
        let removed = class.remove_methods(name, arity);
        if removed > 0 {
            debug!(class = %class.name(), method = name, arity, removed, "methods removed");
            self.epoch.invalidate();
        }
        removed
    }

    /// Drop a class from the table. Call site caches only hold weak
    /// references, so their entries for it become collectable.
    pub fn unload(&self, name: &str) -> Option<Arc<Class>> {
        let removed = self.classes.write().remove(name);
        if removed.is_some() {
            debug!(class = name, "class unloaded");
            self.epoch.invalidate();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.classes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.read().is_empty()
    }
}

impl std::fmt::Debug for SymbolTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolTable")
            .field("classes", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::class::ParamType;

    fn table() -> SymbolTable {
        SymbolTable::new(Arc::new(Epoch::new()))
    }

    #[test]
    fn test_define_defaults_superclass_to_object() {
        let table = table();
        let point = table.define(ClassBuilder::new("Point"));
        assert_eq!(point.superclass().map(|s| s.name()), Some("Object"));
        assert!(table.class("Point").is_some());
        assert!(table.class("String").is_some());
    }

    #[test]
    fn test_mutations_replace_epoch() {
        let table = table();
        let point = table.define(ClassBuilder::new("Point"));
        let before = table.epoch().current();

        table.add_method(&point, MethodDef::declared("norm", vec![]));
        assert!(!before.is_valid());

        let after_add = table.epoch().current();
        assert_eq!(table.remove_method(&point, "norm", 0), 1);
        assert!(!after_add.is_valid());

        let after_remove = table.epoch().current();
        assert_eq!(table.remove_method(&point, "norm", 0), 0);
        assert!(after_remove.is_valid());
    }

    #[test]
    fn test_unload_releases_class() {
        let table = table();
        let weak = {
            let temp = table.define(ClassBuilder::new("Temp").field("x", ParamType::Int));
            Arc::downgrade(&temp)
        };
        assert!(weak.upgrade().is_some());
        assert!(table.unload("Temp").is_some());
        assert!(weak.upgrade().is_none());
    }
}
