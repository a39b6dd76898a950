//! The dispatch entry point run on every call.
//!
//! ```text
//!             link                hits > optimize_threshold
//! Unlinked ---------> Adaptive ------------------------------> Monomorphic
//!                        ^                                          |
//!                        |   fallbacks > fallback_threshold         |
//!                        +---------------- Deoptimized <------------+
//! ```
//!
//! `from_cache` is the adaptive target: look up the receiver's type name in
//! the call site cache, resolving on a miss, and promote an entry once it
//! dominates traffic. `select_method` is the fallback target that guard
//! failures land on; it re-resolves and decides whether to keep, replace or
//! drop the installed handle.

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::config::DispatchConfig;
use crate::dispatch::builder::HandleBuilder;
use crate::dispatch::call_site::{CallFlags, CallKind, CallSite, Target};
use crate::dispatch::category::has_category_in_current_thread;
use crate::dispatch::epoch::Epoch;
use crate::dispatch::guard::{GuardCheck, GuardComposer, GuardedHandle};
use crate::dispatch::resolver::{argument_types, CallShape, Resolution, Resolver};
use crate::error::{DispatchError, DispatchResult, MemberKind};
use crate::model::{Class, SymbolTable, Value};

enum Route {
    Installed(Arc<GuardedHandle>),
    Adaptive,
    Fallback,
}

pub struct Dispatcher<'a> {
    site: &'a CallSite,
    symbols: &'a SymbolTable,
    epoch: &'a Epoch,
    config: &'a DispatchConfig,
}

impl<'a> Dispatcher<'a> {
    pub fn new(site: &'a CallSite, symbols: &'a SymbolTable, epoch: &'a Epoch, config: &'a DispatchConfig) -> Self {
        Self {
            site,
            symbols,
            epoch,
            config,
        }
    }

    pub fn invoke(&self, receiver: &Value, args: &[Value]) -> DispatchResult<Value> {
        let arity = self.site.descriptor().arity;
        if args.len() != arity {
            return Err(DispatchError::internal(format!(
                "call site {} ({}) declares {} arguments but was invoked with {}",
                self.site.id(),
                self.site.name(),
                arity,
                args.len()
            )));
        }

        let spread;
        let args = if self.site.flags().contains(CallFlags::SPREAD_CALL) {
            spread = spread_arguments(args)?;
            spread.as_slice()
        } else {
            args
        };

        if matches!(**self.site.target(), Target::Unlinked) {
            self.site.link();
        }
        let route = match &**self.site.target() {
            Target::Guarded(handle) => Route::Installed(handle.clone()),
            Target::Fallback => Route::Fallback,
            Target::Adaptive | Target::Unlinked => Route::Adaptive,
        };

        match route {
            Route::Installed(handle) => {
                handle.invoke_or_else(receiver, args, |check| self.select_method(receiver, args, check))
            }
            Route::Fallback => self.fallback(receiver, args)?.invoke_direct(receiver, args),
            Route::Adaptive => self.from_cache(receiver, args),
        }
    }

    /// The adaptive target.
    fn from_cache(&self, receiver: &Value, args: &[Value]) -> DispatchResult<Value> {
        if self.bypass_cache(receiver) {
            trace!(site = %self.site.id(), "cache bypassed");
            return self.fallback(receiver, args)?.invoke_direct(receiver, args);
        }

        let (key, class) = self.cache_key(receiver);
        let (handle, computed) = self.site.cache().get_or_compute(&key, &class, || {
            self.site.count_miss();
            self.fallback(receiver, args)
        })?;
        if !computed {
            self.site.count_hit();
        }

        let hits = handle.record_hit();
        if hits > self.config.optimize_threshold && !self.site.is_frozen() {
            self.promote(&handle, hits);
        }

        handle.invoke_or_else(receiver, args, |check| self.select_method(receiver, args, check))
    }

    fn promote(&self, handle: &Arc<GuardedHandle>, hits: u64) {
        if !self.site.promote(handle.clone()) {
            return;
        }
        self.site.reset_fallback_count();
        self.site.count_promotion();
        debug!(site = %self.site.id(), name = %self.site.name(), key = %handle.key(), hits, "call site target set");
    }

    /// The fallback target: a guard failed, resolve again.
    fn select_method(&self, receiver: &Value, args: &[Value], check: GuardCheck) -> DispatchResult<Value> {
        let (recent, total) = self.site.count_fallback();
        trace!(site = %self.site.id(), ?check, recent, total, "guard failed");

        let fresh = self.fallback(receiver, args)?;

        let past_cutoff = total > self.config.fallback_cutoff;
        if past_cutoff {
            self.site.freeze();
        }

        if self.site.installed_handle().is_some() {
            if recent > self.config.fallback_threshold || past_cutoff {
                self.site.deoptimize();
                self.site.reset_fallback_count();
                debug!(site = %self.site.id(), name = %self.site.name(), recent, total, "call site target reset to default");
            } else if check == GuardCheck::StaleEpoch && self.site.revalidate(fresh.clone()) {
                self.site.reset_fallback_count();
                debug!(site = %self.site.id(), name = %self.site.name(), "installed target revalidated");
            }
        }

        if self.site.is_default()
            && !self.bypass_cache(receiver)
            && !self.site.flags().contains(CallFlags::UNCACHED_CALL)
        {
            let (key, class) = self.cache_key(receiver);
            self.site.cache().put(&key, &class, fresh.clone());
        }

        fresh.invoke_direct(receiver, args)
    }

    /// Resolve, build and guard a handle for this invocation.
    fn fallback(&self, receiver: &Value, args: &[Value]) -> DispatchResult<Arc<GuardedHandle>> {
        self.site.count_resolution();
        let token = self.epoch.current();

        let descriptor = self.site.descriptor();
        let shape = CallShape {
            name: &descriptor.name,
            kind: descriptor.kind,
            flags: descriptor.flags,
            owner: descriptor.owner.as_ref(),
            interface: descriptor.interface.as_ref(),
            receiver,
            args,
        };

        let resolver = Resolver::new(self.symbols);
        let selection = match resolver.resolve(&shape)? {
            Resolution::Found(selection) => selection,
            Resolution::NotFound => match resolver.resolve_hook(&shape) {
                Some(hook) => {
                    debug!(name = %descriptor.name, receiver = receiver.type_name(), "routing to generic hook");
                    hook
                }
                None => return Err(missing_member(&shape)),
            },
        };

        let plan = HandleBuilder::build(&selection, &shape)?;
        let (key, _) = self.cache_key(receiver);
        debug!(site = %self.site.id(), key = %key, target = %plan.label, "method selected");

        Ok(Arc::new(GuardComposer::guard(
            Arc::new(plan),
            &selection,
            receiver,
            args,
            &descriptor.static_types,
            token,
            key,
        )))
    }

    fn bypass_cache(&self, receiver: &Value) -> bool {
        self.site.flags().contains(CallFlags::SPREAD_CALL)
            || has_category_in_current_thread()
            || receiver
                .as_instance()
                .map(|instance| instance.class().has_per_instance_tables())
                .unwrap_or(false)
    }

    /// Receiver type name used as cache key, and the class it names.
    fn cache_key(&self, receiver: &Value) -> (Arc<str>, Arc<Class>) {
        match receiver {
            Value::Class(class) => (class.meta_key().clone(), class.clone()),
            other => {
                let class = self.symbols.class_of(other);
                (class.name_arc().clone(), class)
            }
        }
    }
}

/// Expand a trailing array argument into positional arguments.
fn spread_arguments(args: &[Value]) -> DispatchResult<SmallVec<[Value; 4]>> {
    let Some((last, fixed)) = args.split_last() else {
        return Ok(SmallVec::new());
    };
    let mut expanded: SmallVec<[Value; 4]> = fixed.iter().cloned().collect();
    match last {
        Value::Array(items) => expanded.extend(items.iter().cloned()),
        Value::Null => {}
        other => {
            return Err(DispatchError::wrong_argument_type(
                fixed.len(),
                "Array",
                other.type_name(),
            ))
        }
    }
    Ok(expanded)
}

fn missing_member(shape: &CallShape<'_>) -> DispatchError {
    let kind = match shape.kind {
        CallKind::Init => MemberKind::Constructor,
        CallKind::GetProperty | CallKind::SetProperty => MemberKind::Property,
        CallKind::Method | CallKind::Interface => MemberKind::Method,
    };
    let class = match shape.receiver {
        Value::Class(class) => class.name().to_string(),
        other => other.type_name().to_string(),
    };
    DispatchError::missing_member(kind, class, shape.name, argument_types(shape.args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::call_site::{CallSiteDescriptor, CallSiteId, CallSiteState};
    use pretty_assertions::assert_eq;

    struct Fixture {
        epoch: Arc<Epoch>,
        symbols: SymbolTable,
        config: DispatchConfig,
    }

    impl Fixture {
        fn new(config: DispatchConfig) -> Self {
            let epoch = Arc::new(Epoch::new());
            Self {
                symbols: SymbolTable::new(epoch.clone()),
                epoch,
                config,
            }
        }

        fn site(&self, name: &str, arity: usize, flags: CallFlags) -> CallSite {
            CallSite::new(
                CallSiteDescriptor::new(CallSiteId(1), name, CallKind::Method, arity).with_flags(flags),
                self.config.cache_capacity,
            )
        }

        fn call(&self, site: &CallSite, receiver: &Value, args: &[Value]) -> DispatchResult<Value> {
            Dispatcher::new(site, &self.symbols, &self.epoch, &self.config).invoke(receiver, args)
        }
    }

    #[test]
    fn test_first_call_links_and_caches() {
        let fx = Fixture::new(DispatchConfig::default());
        let site = fx.site("length", 0, CallFlags::empty());
        assert_eq!(fx.call(&site, &Value::str("abc"), &[]).expect("ok"), Value::Int(3));
        assert_eq!(site.state(), CallSiteState::Adaptive);
        assert_eq!(site.cache().keys(), vec![Arc::<str>::from("String")]);
        assert_eq!(site.stats().resolutions, 1);
    }

    #[test]
    fn test_arity_mismatch_is_internal_error() {
        let fx = Fixture::new(DispatchConfig::default());
        let site = fx.site("length", 0, CallFlags::empty());
        let err = fx.call(&site, &Value::str("abc"), &[Value::Int(1)]).expect_err("arity");
        assert!(matches!(err, DispatchError::InternalConsistency(_)));
    }

    #[test]
    fn test_spread_expands_last_argument() {
        let fx = Fixture::new(DispatchConfig::default());
        let site = fx.site("substring", 1, CallFlags::SPREAD_CALL);
        let args = [Value::array(vec![Value::Int(1), Value::Int(3)])];
        assert_eq!(fx.call(&site, &Value::str("hello"), &args).expect("ok"), Value::str("el"));
        assert!(site.cache().is_empty());
    }

    #[test]
    fn test_uncached_site_never_caches() {
        let fx = Fixture::new(DispatchConfig::default().with_optimize_threshold(1));
        let site = fx.site("length", 0, CallFlags::UNCACHED_CALL);
        for _ in 0..5 {
            fx.call(&site, &Value::str("abc"), &[]).expect("ok");
        }
        assert!(site.cache().is_empty());
        assert_eq!(site.stats().resolutions, 5);
        assert_eq!(site.state(), CallSiteState::Adaptive);
    }

    #[test]
    fn test_missing_member_after_hooks() {
        let fx = Fixture::new(DispatchConfig::default());
        let site = fx.site("nope", 1, CallFlags::empty());
        let err = fx.call(&site, &Value::Int(1), &[Value::str("x")]).expect_err("missing");
        assert_eq!(
            err.to_string(),
            "No signature of method Integer.nope() is applicable for argument types (String)"
        );
    }
}
