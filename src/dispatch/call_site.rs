//! Call site state: descriptor, installed target, counters.
//!
//! The installed target is swapped atomically with `arc-swap`; readers on
//! the hot path take one load. The default target is fixed at construction.
//! Counter updates are relaxed except where they gate state transitions.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use bitflags::bitflags;
use crossbeam::utils::CachePadded;
use serde::Serialize;
use tracing::debug;

use crate::dispatch::cache::CallSiteCache;
use crate::dispatch::guard::GuardedHandle;
use crate::model::{Class, ParamType};

/// What a call expression does with its receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CallKind {
    Method,
    /// Construct an instance of the receiver class value.
    Init,
    GetProperty,
    SetProperty,
    /// Method call through an interface type; the receiver must implement it.
    Interface,
}

bitflags! {
    /// Per-call-site flags fixed at link time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CallFlags: u32 {
        /// `a?.b()`: a null receiver yields null without resolution.
        const SAFE_NAVIGATION = 1;
        /// Call on `this`; private members of the owner are selectable.
        const THIS_CALL = 1 << 1;
        /// `a.b(*list)`: the last argument is spread into positional ones.
        const SPREAD_CALL = 1 << 4;
        /// Never cache or install targets for this site.
        const UNCACHED_CALL = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CallSiteId(pub u32);

impl std::fmt::Display for CallSiteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Everything fixed about a call expression when it is linked.
#[derive(Debug, Clone)]
pub struct CallSiteDescriptor {
    pub id: CallSiteId,
    pub name: Arc<str>,
    pub kind: CallKind,
    pub flags: CallFlags,
    /// Declared argument count.
    pub arity: usize,
    /// Static argument types; `Any` where the call site has none.
    pub static_types: Vec<ParamType>,
    /// Class the call expression was compiled in.
    pub owner: Option<Arc<Class>>,
    /// Declared receiver type of an interface call.
    pub interface: Option<Arc<Class>>,
}

impl CallSiteDescriptor {
    pub fn new(id: CallSiteId, name: &str, kind: CallKind, arity: usize) -> Self {
        Self {
            id,
            name: Arc::from(name),
            kind,
            flags: CallFlags::empty(),
            arity,
            static_types: vec![ParamType::Any; arity],
            owner: None,
            interface: None,
        }
    }

    pub fn with_flags(mut self, flags: CallFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_owner(mut self, owner: &Arc<Class>) -> Self {
        self.owner = Some(owner.clone());
        self
    }

    pub fn with_interface(mut self, interface: &Arc<Class>) -> Self {
        self.interface = Some(interface.clone());
        self
    }

    /// Declare the static type of each argument. Missing positions stay `Any`.
    pub fn with_static_types(mut self, types: Vec<ParamType>) -> Self {
        for (slot, ty) in self.static_types.iter_mut().zip(types) {
            *slot = ty;
        }
        self
    }
}

/// A call site's installed target.
#[derive(Debug)]
pub enum Target {
    Unlinked,
    /// The cache-consulting slow path.
    Adaptive,
    /// Straight to resolution; used for uncached sites.
    Fallback,
    /// A promoted monomorphic handle.
    Guarded(Arc<GuardedHandle>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallSiteState {
    Unlinked,
    Adaptive,
    MonomorphicOptimized,
    Deoptimized,
}

/// Diagnostic counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CallSiteStats {
    /// Calls served by an existing cache entry or installed handle.
    pub hits: u64,
    /// Calls that found no cache entry.
    pub misses: u64,
    /// Runs of the resolution pipeline.
    pub resolutions: u64,
    /// Guard failures routed to the fallback path.
    pub fallbacks: u64,
    pub promotions: u64,
    pub deoptimizations: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    resolutions: AtomicU64,
    fallbacks: AtomicU64,
    promotions: AtomicU64,
    deoptimizations: AtomicU64,
}

pub struct CallSite {
    descriptor: CallSiteDescriptor,
    target: ArcSwap<Target>,
    default_target: Arc<Target>,
    cache: CallSiteCache,
    fallback_count: CachePadded<AtomicU64>,
    total_fallbacks: AtomicU64,
    frozen: AtomicBool,
    deoptimized: AtomicBool,
    counters: Counters,
}

impl CallSite {
    pub fn new(descriptor: CallSiteDescriptor, cache_capacity: usize) -> Self {
        let uncached = descriptor.flags.contains(CallFlags::UNCACHED_CALL);
        Self {
            descriptor,
            target: ArcSwap::from_pointee(Target::Unlinked),
            default_target: Arc::new(if uncached { Target::Fallback } else { Target::Adaptive }),
            cache: CallSiteCache::new(cache_capacity),
            fallback_count: CachePadded::new(AtomicU64::new(0)),
            total_fallbacks: AtomicU64::new(0),
            frozen: AtomicBool::new(uncached),
            deoptimized: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn descriptor(&self) -> &CallSiteDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> CallSiteId {
        self.descriptor.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn kind(&self) -> CallKind {
        self.descriptor.kind
    }

    pub fn flags(&self) -> CallFlags {
        self.descriptor.flags
    }

    pub fn cache(&self) -> &CallSiteCache {
        &self.cache
    }

    /// Install the default target on an unlinked site.
    pub fn link(&self) {
        let current = self.target.load();
        if matches!(**current, Target::Unlinked) {
            let _ = self.target.compare_and_swap(&*current, self.default_target.clone());
            debug!(site = %self.id(), name = %self.name(), "call site linked");
        }
    }

    #[inline]
    pub fn target(&self) -> arc_swap::Guard<Arc<Target>> {
        self.target.load()
    }

    /// Swap a stale promoted handle for a freshly resolved one, unless the
    /// site is frozen.
    pub(crate) fn revalidate(&self, handle: Arc<GuardedHandle>) -> bool {
        if self.is_frozen() {
            return false;
        }
        self.target.store(Arc::new(Target::Guarded(handle)));
        if self.is_frozen() {
            self.install_default();
            return false;
        }
        true
    }

    pub fn install_default(&self) {
        self.target.store(self.default_target.clone());
    }

    /// Replace the default target with `handle`.
    ///
    /// Fails if another target is installed or the site is frozen. A site
    /// frozen while the swap was in flight gets its default back.
    pub(crate) fn promote(&self, handle: Arc<GuardedHandle>) -> bool {
        let current = self.target.load();
        if !Arc::ptr_eq(&current, &self.default_target) || self.is_frozen() {
            return false;
        }
        let promoted = Arc::new(Target::Guarded(handle));
        let previous = self.target.compare_and_swap(&*current, promoted.clone());
        if !Arc::ptr_eq(&previous, &self.default_target) {
            return false;
        }
        if self.is_frozen() {
            let _ = self.target.compare_and_swap(&promoted, self.default_target.clone());
            return false;
        }
        true
    }

    /// Return to the default target for good.
    pub(crate) fn deoptimize(&self) {
        self.mark_deoptimized();
        self.install_default();
    }

    pub fn is_default(&self) -> bool {
        Arc::ptr_eq(&self.target.load(), &self.default_target)
    }

    /// The promoted handle, if one is installed.
    pub fn installed_handle(&self) -> Option<Arc<GuardedHandle>> {
        match &**self.target.load() {
            Target::Guarded(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    pub fn state(&self) -> CallSiteState {
        if self.deoptimized.load(Ordering::Acquire) {
            return CallSiteState::Deoptimized;
        }
        match &**self.target.load() {
            Target::Unlinked => CallSiteState::Unlinked,
            Target::Adaptive | Target::Fallback => CallSiteState::Adaptive,
            Target::Guarded(_) => CallSiteState::MonomorphicOptimized,
        }
    }

    /// Sites that may no longer be promoted.
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    pub(crate) fn freeze(&self) {
        if !self.frozen.swap(true, Ordering::SeqCst) {
            debug!(site = %self.id(), name = %self.name(), "call site frozen");
        }
    }

    pub(crate) fn mark_deoptimized(&self) {
        self.deoptimized.store(true, Ordering::Release);
        self.freeze();
        self.counters.deoptimizations.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one fallback. Returns (fallbacks since last reset, total).
    pub(crate) fn count_fallback(&self) -> (u64, u64) {
        self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
        let recent = self.fallback_count.fetch_add(1, Ordering::AcqRel) + 1;
        let total = self.total_fallbacks.fetch_add(1, Ordering::AcqRel) + 1;
        (recent, total)
    }

    pub(crate) fn reset_fallback_count(&self) {
        self.fallback_count.store(0, Ordering::Release);
    }

    pub(crate) fn count_hit(&self) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_miss(&self) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_resolution(&self) {
        self.counters.resolutions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_promotion(&self) {
        self.counters.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CallSiteStats {
        CallSiteStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            resolutions: self.counters.resolutions.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            promotions: self.counters.promotions.load(Ordering::Relaxed),
            deoptimizations: self.counters.deoptimizations.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CallSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSite")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("state", &self.state())
            .field("cache", &self.cache)
            .finish()
    }
}
