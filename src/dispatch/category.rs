//! Categories: method sets that are only visible while a thread has entered them.
//!
//! Activation is thread-local, so it is invisible to class-identity guards.
//! Two mechanisms keep cached handles honest:
//! - entering or leaving a scope invalidates the epoch
//! - a handle whose target is a category method also checks
//!   [`has_category_in_current_thread`] on every call

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::dispatch::epoch::Epoch;
use crate::model::{Class, ClassId, MethodDef, MethodDescriptor};

/// Category ids live in their own range so they never collide with classes.
const FIRST_CATEGORY_ID: u64 = 1 << 48;

static NEXT_CATEGORY_ID: AtomicU64 = AtomicU64::new(FIRST_CATEGORY_ID);

thread_local! {
    static ACTIVE: RefCell<Vec<Arc<Category>>> = const { RefCell::new(Vec::new()) };
}

/// A named set of methods attached to target classes by name.
#[derive(Debug)]
pub struct Category {
    id: ClassId,
    name: Arc<str>,
    methods: Vec<(Arc<str>, Arc<MethodDescriptor>)>,
}

impl Category {
    pub fn builder(name: &str) -> CategoryBuilder {
        CategoryBuilder {
            id: ClassId(NEXT_CATEGORY_ID.fetch_add(1, Ordering::Relaxed)),
            name: Arc::from(name),
            methods: Vec::new(),
        }
    }

    pub fn id(&self) -> ClassId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Methods named `name` that apply to a receiver of class `class`
    /// (directly or through inheritance).
    pub fn methods_for(&self, class: &Class, name: &str) -> Vec<Arc<MethodDescriptor>> {
        self.methods
            .iter()
            .filter(|(target, method)| method.name() == name && class.is_assignable_to(target))
            .map(|(_, method)| method.clone())
            .collect()
    }
}

pub struct CategoryBuilder {
    id: ClassId,
    name: Arc<str>,
    methods: Vec<(Arc<str>, Arc<MethodDescriptor>)>,
}

impl CategoryBuilder {
    /// Attach a method to every instance of `target` and its subclasses.
    pub fn method(mut self, target: &str, def: MethodDef) -> Self {
        let descriptor = MethodDescriptor::bind_category(def, self.id, self.name.clone());
        self.methods.push((Arc::from(target), Arc::new(descriptor)));
        self
    }

    pub fn build(self) -> Arc<Category> {
        Arc::new(Category {
            id: self.id,
            name: self.name,
            methods: self.methods,
        })
    }
}

/// True if the current thread is inside any category scope.
#[inline]
pub fn has_category_in_current_thread() -> bool {
    ACTIVE.with(|active| !active.borrow().is_empty())
}

/// Categories active on this thread, innermost first.
pub fn active_categories() -> Vec<Arc<Category>> {
    ACTIVE.with(|active| active.borrow().iter().rev().cloned().collect())
}

/// RAII scope for an entered category. Leaving is tied to drop, on the same
/// thread that entered.
pub struct CategoryScope {
    epoch: Arc<Epoch>,
    category: Arc<Category>,
    _thread_bound: PhantomData<Rc<()>>,
}

impl CategoryScope {
    pub fn enter(epoch: Arc<Epoch>, category: Arc<Category>) -> Self {
        ACTIVE.with(|active| active.borrow_mut().push(category.clone()));
        debug!(category = %category.name(), "category entered");
        epoch.invalidate();
        Self {
            epoch,
            category,
            _thread_bound: PhantomData,
        }
    }

    pub fn category(&self) -> &Arc<Category> {
        &self.category
    }
}

impl Drop for CategoryScope {
    fn drop(&mut self) {
        ACTIVE.with(|active| {
            let mut active = active.borrow_mut();
            if let Some(pos) = active.iter().rposition(|c| Arc::ptr_eq(c, &self.category)) {
                active.remove(pos);
            }
        });
        debug!(category = %self.category.name(), "category left");
        self.epoch.invalidate();
    }
}
