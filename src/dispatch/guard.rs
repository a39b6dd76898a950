//! Guard composer: wraps a dispatch plan in the runtime checks that keep it
//! valid, producing a [`GuardedHandle`].
//!
//! A handle is valid while all of these hold:
//! - the epoch token captured before resolution is still valid
//! - the receiver has the recorded class, class value, or per-instance
//!   dispatch table
//! - every guarded argument has its recorded class, or is still null
//! - category activity on the calling thread matches build time
//!
//! Arguments whose static type at the call site is primitive or final are
//! not class-checked; their values can only vary within what coercion
//! normalizes. Primitive positions still reject null.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use smallvec::SmallVec;
use tracing::trace;

use crate::dispatch::category::has_category_in_current_thread;
use crate::dispatch::epoch::EpochToken;
use crate::dispatch::plan::DispatchPlan;
use crate::dispatch::resolver::Selection;
use crate::error::DispatchResult;
use crate::model::{ClassId, DispatchTable, ParamType, Value};

/// Outcome of evaluating a guard set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardCheck {
    Pass,
    /// Everything matched except the epoch token.
    StaleEpoch,
    /// The receiver, an argument, or category state no longer matches.
    Mismatch,
}

#[derive(Debug, Clone)]
pub enum ReceiverGuard {
    Null,
    /// Non-null receiver of exactly this class, without per-instance tables.
    Class(ClassId),
    /// The receiver is this class value (static calls, constructors).
    ClassValue(ClassId),
    /// The receiver carries exactly this per-instance dispatch table.
    DispatchTable(Weak<DispatchTable>),
}

impl ReceiverGuard {
    pub fn for_receiver(receiver: &Value) -> Self {
        match receiver {
            Value::Null => ReceiverGuard::Null,
            Value::Class(class) => ReceiverGuard::ClassValue(class.id()),
            Value::Object(instance) => match instance.dispatch_table() {
                Some(table) => ReceiverGuard::DispatchTable(Arc::downgrade(&table)),
                None => ReceiverGuard::Class(instance.class().id()),
            },
            other => ReceiverGuard::Class(other.class_id()),
        }
    }

    #[inline]
    pub fn test(&self, receiver: &Value) -> bool {
        match (self, receiver) {
            (ReceiverGuard::Null, value) => value.is_null(),
            (ReceiverGuard::ClassValue(id), Value::Class(class)) => class.id() == *id,
            (ReceiverGuard::ClassValue(_), _) => false,
            (ReceiverGuard::DispatchTable(expected), Value::Object(instance)) => instance
                .dispatch_table()
                .map(|table| std::ptr::eq(Arc::as_ptr(&table), expected.as_ptr()))
                .unwrap_or(false),
            (ReceiverGuard::DispatchTable(_), _) => false,
            (ReceiverGuard::Class(_), Value::Null | Value::Class(_)) => false,
            (ReceiverGuard::Class(id), Value::Object(instance)) => {
                instance.class().id() == *id && !instance.class().has_per_instance_tables()
            }
            (ReceiverGuard::Class(id), value) => value.class_id() == *id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgGuard {
    Skip,
    IsNull,
    NonNull,
    SameClass(ClassId),
}

impl ArgGuard {
    /// Guard for one argument position, given the call site's static type
    /// there and the value seen at build time.
    pub fn for_argument(static_type: &ParamType, arg: &Value) -> Self {
        if static_type.is_primitive() {
            ArgGuard::NonNull
        } else if static_type.is_final() {
            ArgGuard::Skip
        } else if arg.is_null() {
            ArgGuard::IsNull
        } else {
            ArgGuard::SameClass(arg.class_id())
        }
    }

    #[inline]
    pub fn test(&self, arg: &Value) -> bool {
        match self {
            ArgGuard::Skip => true,
            ArgGuard::IsNull => arg.is_null(),
            ArgGuard::NonNull => !arg.is_null(),
            ArgGuard::SameClass(id) => !arg.is_null() && arg.class_id() == *id,
        }
    }
}

/// Expected category activity on the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryGuard {
    /// Valid only while no category is active.
    Absent,
    /// Valid only while some category is active.
    Present,
}

#[derive(Debug, Clone)]
pub struct GuardSet {
    pub epoch: Arc<EpochToken>,
    pub receiver: ReceiverGuard,
    pub category: CategoryGuard,
    pub args: SmallVec<[ArgGuard; 4]>,
}

impl GuardSet {
    #[inline]
    pub fn check(&self, receiver: &Value, args: &[Value]) -> GuardCheck {
        let structural = self.receiver.test(receiver)
            && args.len() == self.args.len()
            && self.args.iter().zip(args).all(|(guard, arg)| guard.test(arg))
            && (self.category == CategoryGuard::Present) == has_category_in_current_thread();
        if !structural {
            GuardCheck::Mismatch
        } else if !self.epoch.is_valid() {
            GuardCheck::StaleEpoch
        } else {
            GuardCheck::Pass
        }
    }
}

/// One resolved dispatch decision plus the checks that keep it valid.
#[derive(Debug)]
pub struct GuardedHandle {
    plan: Arc<DispatchPlan>,
    guards: GuardSet,
    key: Arc<str>,
    hits: AtomicU64,
}

impl GuardedHandle {
    pub fn new(plan: Arc<DispatchPlan>, guards: GuardSet, key: Arc<str>) -> Self {
        Self {
            plan,
            guards,
            key,
            hits: AtomicU64::new(0),
        }
    }

    pub fn plan(&self) -> &Arc<DispatchPlan> {
        &self.plan
    }

    pub fn guards(&self) -> &GuardSet {
        &self.guards
    }

    /// Receiver type name this handle was built for.
    pub fn key(&self) -> &Arc<str> {
        &self.key
    }

    /// Count a cache hit. Returns the new total.
    #[inline]
    pub fn record_hit(&self) -> u64 {
        self.hits.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub fn check(&self, receiver: &Value, args: &[Value]) -> GuardCheck {
        self.guards.check(receiver, args)
    }

    /// Invoke the plan without checking guards.
    #[inline]
    pub fn invoke_direct(&self, receiver: &Value, args: &[Value]) -> DispatchResult<Value> {
        self.plan.execute(receiver, args)
    }

    /// Invoke the plan if the guards hold, else hand the failed check to
    /// `fallback`.
    #[inline]
    pub fn invoke_or_else<F>(&self, receiver: &Value, args: &[Value], fallback: F) -> DispatchResult<Value>
    where
        F: FnOnce(GuardCheck) -> DispatchResult<Value>,
    {
        match self.check(receiver, args) {
            GuardCheck::Pass => self.invoke_direct(receiver, args),
            failed => fallback(failed),
        }
    }
}

pub struct GuardComposer;

impl GuardComposer {
    /// Wrap `plan` in guards for the receiver and arguments it was built
    /// for. `epoch` must be the token captured before resolution started.
    pub fn guard(
        plan: Arc<DispatchPlan>,
        selection: &Selection,
        receiver: &Value,
        args: &[Value],
        static_types: &[ParamType],
        epoch: Arc<EpochToken>,
        key: Arc<str>,
    ) -> GuardedHandle {
        let receiver_guard = ReceiverGuard::for_receiver(receiver);

        let arg_guards: SmallVec<[ArgGuard; 4]> = if matches!(selection, Selection::ConstantNull) {
            args.iter().map(|_| ArgGuard::Skip).collect()
        } else {
            args.iter()
                .enumerate()
                .map(|(i, arg)| ArgGuard::for_argument(static_types.get(i).unwrap_or(&ParamType::Any), arg))
                .collect()
        };

        let category = if selection.is_category_method() || has_category_in_current_thread() {
            CategoryGuard::Present
        } else {
            CategoryGuard::Absent
        };

        trace!(
            key = %key,
            receiver = ?receiver_guard,
            args = ?arg_guards,
            ?category,
            generation = epoch.generation(),
            "guards added"
        );

        GuardedHandle::new(
            plan,
            GuardSet {
                epoch,
                receiver: receiver_guard,
                category,
                args: arg_guards,
            },
            key,
        )
    }
}
