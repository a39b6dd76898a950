//! Solilang dispatch core: call-site linkage, overload resolution and inline caching.
//!
//! This is the library root that exports all modules.
//!
//! # Dispatch pipeline
//!
//! Every call expression compiled by the front end is linked once into a
//! [`CallSite`](dispatch::CallSite). Invoking it walks the following path:
//! - **Guarded target**: a monomorphic call site runs its installed handle
//!   directly as long as the handle's guards hold
//! - **Call site cache**: a bounded LRU map from receiver type name to a
//!   guarded handle
//! - **Resolution**: resolver, handle builder and guard composer produce a
//!   fresh guarded handle which is cached for the next call
//!
//! Any change to the method set of a class replaces the process-wide
//! [`EpochToken`](dispatch::EpochToken), which makes every previously built
//! guarded handle fall back to resolution on its next use.

#![allow(clippy::new_without_default)]
#![allow(clippy::type_complexity)]
#![allow(clippy::too_many_arguments)]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod model;
pub mod runtime;

pub use config::DispatchConfig;
pub use dispatch::{CallFlags, CallKind, CallSite, CallSiteId, CallSiteState, Category};
pub use error::{DispatchError, DispatchResult};
pub use model::{Class, ClassBuilder, MethodDef, ParamType, SymbolTable, Value};
pub use runtime::{DispatchRuntime, RUNTIME};
