//! Call-site dispatch: resolution, handle building, guarding, caching and
//! the per-site state machine that ties them together.

pub mod builder;
pub mod cache;
pub mod call_site;
pub mod category;
pub mod epoch;
pub mod fast_path;
pub mod guard;
pub mod orchestrator;
pub mod plan;
pub mod registry;
pub mod resolver;

pub use builder::HandleBuilder;
pub use cache::CallSiteCache;
pub use call_site::{
    CallFlags, CallKind, CallSite, CallSiteDescriptor, CallSiteId, CallSiteState, CallSiteStats, Target,
};
pub use category::{Category, CategoryBuilder, CategoryScope};
pub use epoch::{Epoch, EpochToken};
pub use guard::{GuardCheck, GuardComposer, GuardedHandle};
pub use orchestrator::Dispatcher;
pub use plan::DispatchPlan;
pub use registry::{CallSiteRegistry, SweepReport};
pub use resolver::{CallShape, Resolution, Resolver, Selection};
