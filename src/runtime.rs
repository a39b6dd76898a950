//! The dispatch runtime: link-time and call-time entry points.
//!
//! A [`DispatchRuntime`] owns the epoch, the symbol table and the registry of
//! linked call sites. [`RUNTIME`] is the process-wide instance configured from
//! the environment; embedders and tests can create isolated runtimes.

use std::sync::Arc;

use lazy_static::lazy_static;
use tracing::debug;

use crate::config::DispatchConfig;
use crate::dispatch::call_site::{CallFlags, CallKind, CallSite, CallSiteDescriptor, CallSiteId};
use crate::dispatch::category::{Category, CategoryScope};
use crate::dispatch::epoch::Epoch;
use crate::dispatch::orchestrator::Dispatcher;
use crate::dispatch::registry::{CallSiteRegistry, SweepReport};
use crate::error::DispatchResult;
use crate::model::{Class, SymbolTable, Value};

lazy_static! {
    /// Process-wide runtime, configured from `SOLI_INDY_*` variables.
    pub static ref RUNTIME: DispatchRuntime = DispatchRuntime::new(DispatchConfig::from_env());
}

pub struct DispatchRuntime {
    config: DispatchConfig,
    epoch: Arc<Epoch>,
    symbols: SymbolTable,
    registry: CallSiteRegistry,
}

impl DispatchRuntime {
    pub fn new(config: DispatchConfig) -> Self {
        let epoch = Arc::new(Epoch::new());
        Self {
            symbols: SymbolTable::new(epoch.clone()),
            epoch,
            config,
            registry: CallSiteRegistry::new(),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn epoch(&self) -> &Arc<Epoch> {
        &self.epoch
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn registry(&self) -> &CallSiteRegistry {
        &self.registry
    }

    /// Link a call expression. Called once per call site at class-link time.
    pub fn link(
        &self,
        id: CallSiteId,
        owner: Option<&Arc<Class>>,
        name: &str,
        kind: CallKind,
        arity: usize,
        flags: CallFlags,
    ) -> Arc<CallSite> {
        let mut descriptor = CallSiteDescriptor::new(id, name, kind, arity).with_flags(flags);
        if let Some(owner) = owner {
            descriptor = descriptor.with_owner(owner);
        }
        self.link_descriptor(descriptor)
    }

    /// Link a call site from a full descriptor (e.g. with static argument types).
    pub fn link_descriptor(&self, descriptor: CallSiteDescriptor) -> Arc<CallSite> {
        let site = Arc::new(CallSite::new(descriptor, self.config.cache_capacity));
        site.link();
        self.registry.register(&site);
        site
    }

    /// Execute a call site.
    pub fn invoke(&self, site: &CallSite, receiver: &Value, args: &[Value]) -> DispatchResult<Value> {
        Dispatcher::new(site, &self.symbols, &self.epoch, &self.config).invoke(receiver, args)
    }

    /// Report a structural change to dispatch state, for `class` or globally.
    pub fn notify_metaclass_changed(&self, class: Option<&str>) -> SweepReport {
        debug!(class = class.unwrap_or("*"), "metaclass changed");
        self.invalidate()
    }

    /// Invalidate every cached dispatch decision.
    pub fn invalidate(&self) -> SweepReport {
        self.epoch.invalidate();
        self.registry.sweep()
    }

    /// Activate `category` on this thread until the returned scope is dropped.
    pub fn enter_category(&self, category: Arc<Category>) -> CategoryScope {
        let scope = CategoryScope::enter(self.epoch.clone(), category);
        self.registry.sweep();
        scope
    }

    /// Run `f` with `category` active on this thread.
    pub fn use_category<R>(&self, category: Arc<Category>, f: impl FnOnce() -> R) -> R {
        let _scope = self.enter_category(category);
        f()
    }
}

impl std::fmt::Debug for DispatchRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRuntime")
            .field("config", &self.config)
            .field("generation", &self.epoch.generation())
            .field("symbols", &self.symbols)
            .field("call_sites", &self.registry.live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::call_site::CallSiteState;
    use crate::error::DispatchError;
    use crate::model::{ClassBuilder, DispatchTable, Instance, MethodDef, ParamType};
    use pretty_assertions::assert_eq;

    fn runtime() -> DispatchRuntime {
        DispatchRuntime::new(DispatchConfig::default())
    }

    fn method_site(rt: &DispatchRuntime, name: &str, arity: usize) -> Arc<CallSite> {
        rt.link(CallSiteId(1), None, name, CallKind::Method, arity, CallFlags::empty())
    }

    fn object(class: &Arc<Class>) -> Value {
        Value::Object(Arc::new(Instance::new(class.clone())))
    }

    #[test]
    fn test_guard_routes_new_receiver_class_to_its_own_method() {
        let rt = runtime();
        let site = method_site(&rt, "toString", 0);

        let text = Value::str("abc");
        let result = rt.invoke(&site, &text, &[]).expect("ok");
        assert_eq!(result, text);

        let result = rt.invoke(&site, &Value::Int(42), &[]).expect("ok");
        assert_eq!(result, Value::str("42"));
        assert_eq!(site.stats().resolutions, 2);
    }

    #[test]
    fn test_promotion_happens_after_threshold_not_at_it() {
        let rt = DispatchRuntime::new(DispatchConfig::default().with_optimize_threshold(5));
        let site = method_site(&rt, "length", 0);
        let receiver = Value::str("abcd");

        for _ in 0..5 {
            assert_eq!(rt.invoke(&site, &receiver, &[]).expect("ok"), Value::Int(4));
        }
        assert_eq!(site.state(), CallSiteState::Adaptive);
        assert!(site.installed_handle().is_none());

        rt.invoke(&site, &receiver, &[]).expect("ok");
        assert_eq!(site.state(), CallSiteState::MonomorphicOptimized);
        let installed = site.installed_handle().expect("promoted");
        let cached = site.cache().get("String").expect("cached");
        assert!(Arc::ptr_eq(&installed, &cached));
        assert_eq!(site.stats().resolutions, 1);
        assert_eq!(site.stats().promotions, 1);
    }

    #[test]
    fn test_invalidation_costs_exactly_one_resolution() {
        let rt = DispatchRuntime::new(DispatchConfig::default().with_optimize_threshold(2));
        let site = method_site(&rt, "length", 0);
        let receiver = Value::str("ab");
        for _ in 0..3 {
            rt.invoke(&site, &receiver, &[]).expect("ok");
        }
        assert_eq!(site.state(), CallSiteState::MonomorphicOptimized);
        let stale = site.installed_handle().expect("promoted");

        rt.invalidate();
        assert_eq!(stale.check(&receiver, &[]), crate::dispatch::GuardCheck::StaleEpoch);

        for _ in 0..4 {
            rt.invoke(&site, &receiver, &[]).expect("ok");
        }
        assert_eq!(site.stats().resolutions, 2);
    }

    #[test]
    fn test_symbol_table_change_revalidates_promoted_target() {
        let rt = DispatchRuntime::new(DispatchConfig::default().with_optimize_threshold(2));
        let point = rt.symbols().define(
            ClassBuilder::new("Point").method(MethodDef::native("name", vec![], |_, _| Ok(Value::str("old")))),
        );
        let site = method_site(&rt, "name", 0);
        let receiver = object(&point);
        for _ in 0..3 {
            assert_eq!(rt.invoke(&site, &receiver, &[]).expect("ok"), Value::str("old"));
        }
        assert_eq!(site.state(), CallSiteState::MonomorphicOptimized);

        rt.symbols().remove_method(&point, "name", 0);
        rt.symbols()
            .add_method(&point, MethodDef::native("name", vec![], |_, _| Ok(Value::str("new"))));

        assert_eq!(rt.invoke(&site, &receiver, &[]).expect("ok"), Value::str("new"));
        assert_eq!(rt.invoke(&site, &receiver, &[]).expect("ok"), Value::str("new"));
        assert_eq!(site.stats().resolutions, 2);
        assert_eq!(site.state(), CallSiteState::MonomorphicOptimized);
    }

    #[test]
    fn test_polymorphic_traffic_deoptimizes_without_thrashing() {
        let config = DispatchConfig::default()
            .with_optimize_threshold(2)
            .with_fallback_threshold(5);
        let rt = DispatchRuntime::new(config);
        let site = method_site(&rt, "toString", 0);

        for _ in 0..3 {
            rt.invoke(&site, &Value::str("a"), &[]).expect("ok");
        }
        assert_eq!(site.state(), CallSiteState::MonomorphicOptimized);

        for _ in 0..6 {
            assert_eq!(rt.invoke(&site, &Value::Int(7), &[]).expect("ok"), Value::str("7"));
        }
        assert_eq!(site.state(), CallSiteState::Deoptimized);
        assert!(site.is_default());

        let resolutions = site.stats().resolutions;
        for _ in 0..20 {
            assert_eq!(rt.invoke(&site, &Value::Int(7), &[]).expect("ok"), Value::str("7"));
            assert_eq!(rt.invoke(&site, &Value::str("b"), &[]).expect("ok"), Value::str("b"));
        }
        assert_eq!(site.stats().resolutions, resolutions);
        assert_eq!(site.state(), CallSiteState::Deoptimized);
    }

    #[test]
    fn test_cache_holds_capacity_entries_evicting_lru() {
        let rt = runtime();
        let site = method_site(&rt, "toString", 0);
        let receivers = [
            Value::str("s"),
            Value::Int(1),
            Value::Long(2),
            Value::Double(3.0),
            Value::Bool(true),
        ];
        for receiver in &receivers {
            rt.invoke(&site, receiver, &[]).expect("ok");
        }
        let keys: Vec<String> = site.cache().keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["Boolean", "Double", "Long", "Integer"]);
    }

    #[test]
    fn test_safe_navigation_on_null() {
        let rt = runtime();
        let site = rt.link(CallSiteId(9), None, "length", CallKind::Method, 0, CallFlags::SAFE_NAVIGATION);
        assert_eq!(rt.invoke(&site, &Value::Null, &[]).expect("null"), Value::Null);
        assert_eq!(rt.invoke(&site, &Value::str("xyz"), &[]).expect("ok"), Value::Int(3));

        let unsafe_site = method_site(&rt, "length", 0);
        let err = rt.invoke(&unsafe_site, &Value::Null, &[]).expect_err("missing on NullObject");
        assert!(err.is_missing_member());
    }

    #[test]
    fn test_varargs_shapes() {
        let rt = runtime();
        let string = Value::Class(rt.symbols().builtins().string.clone());
        let cases: Vec<(Vec<&str>, &str)> = vec![
            (vec![], ""),
            (vec!["a"], "a"),
            (vec!["a", "b", "c"], "a-b-c"),
        ];
        for (id, (parts, expected)) in cases.into_iter().enumerate() {
            let mut args = vec![Value::str("-")];
            args.extend(parts.iter().map(|p| Value::str(p)));
            let site = rt.link(CallSiteId(id as u32), None, "join", CallKind::Method, args.len(), CallFlags::empty());
            assert_eq!(rt.invoke(&site, &string, &args).expect("ok"), Value::str(expected));
        }
    }

    #[test]
    fn test_ambiguity_is_reported_and_not_cached() {
        let rt = runtime();
        let a = rt.symbols().define(ClassBuilder::new("A").interface());
        let b = rt.symbols().define(ClassBuilder::new("B").interface());
        let ab = rt.symbols().define(ClassBuilder::new("AB").implements(&a).implements(&b));
        let host = rt.symbols().define(
            ClassBuilder::new("Host")
                .method(MethodDef::native("take", vec![ParamType::class("A")], |_, _| Ok(Value::Int(1))))
                .method(MethodDef::native("take", vec![ParamType::class("B")], |_, _| Ok(Value::Int(2)))),
        );
        let site = method_site(&rt, "take", 1);
        let err = rt.invoke(&site, &object(&host), &[object(&ab)]).expect_err("ambiguous");
        assert!(err.is_ambiguity());
        assert!(site.cache().is_empty());
    }

    #[test]
    fn test_generic_hooks() {
        let rt = runtime();
        let dynamic = rt.symbols().define(
            ClassBuilder::new("Dynamic")
                .method(MethodDef::native(
                    "invokeMethod",
                    vec![ParamType::Str, ParamType::array_of(ParamType::Any)],
                    |_, args| {
                        let count = args[1].as_array().map(|a| a.len()).unwrap_or(0);
                        Ok(Value::str(format!("{}:{}", args[0], count)))
                    },
                ))
                .method(MethodDef::native("getProperty", vec![ParamType::Str], |_, args| {
                    Ok(Value::str(format!("prop {}", args[0])))
                })),
        );
        let receiver = object(&dynamic);

        let site = method_site(&rt, "anything", 2);
        let result = rt.invoke(&site, &receiver, &[Value::Int(1), Value::Int(2)]).expect("hook");
        assert_eq!(result, Value::str("anything:2"));

        let property = rt.link(CallSiteId(2), None, "color", CallKind::GetProperty, 0, CallFlags::empty());
        assert_eq!(rt.invoke(&property, &receiver, &[]).expect("hook"), Value::str("prop color"));
    }

    #[test]
    fn test_interceptor_routes_every_call_through_invoke_method() {
        let rt = runtime();
        let proxy = rt.symbols().define(
            ClassBuilder::new("Proxy")
                .intercepts_all()
                .method(MethodDef::native("real", vec![], |_, _| Ok(Value::str("real"))))
                .method(MethodDef::native(
                    "invokeMethod",
                    vec![ParamType::Str, ParamType::array_of(ParamType::Any)],
                    |_, args| Ok(Value::str(format!("intercepted {}", args[0]))),
                )),
        );
        let site = method_site(&rt, "real", 0);
        assert_eq!(
            rt.invoke(&site, &object(&proxy), &[]).expect("ok"),
            Value::str("intercepted real")
        );
    }

    #[test]
    fn test_constructor_and_properties() {
        let rt = runtime();
        let point = rt.symbols().define(
            ClassBuilder::new("Point")
                .field("x", ParamType::Long)
                .field("y", ParamType::Long)
                .method(MethodDef::constructor(vec![ParamType::Long, ParamType::Long], |this, args| {
                    this.set_field(0, args[0].clone());
                    this.set_field(1, args[1].clone());
                    Ok(())
                }))
                .method(MethodDef::native("getSum", vec![], |this, _| {
                    let instance = this.as_instance().ok_or_else(|| DispatchError::internal("not a point"))?;
                    let x = instance.field(0).as_i64().unwrap_or(0);
                    let y = instance.field(1).as_i64().unwrap_or(0);
                    Ok(Value::Long(x + y))
                })),
        );

        let new = rt.link(CallSiteId(1), None, "<init>", CallKind::Init, 2, CallFlags::empty());
        let p = rt
            .invoke(&new, &Value::Class(point.clone()), &[Value::Int(1), Value::Int(2)])
            .expect("constructed");
        assert_eq!(p.as_instance().map(|i| i.field(0)), Some(Value::Long(1)));

        let get_x = rt.link(CallSiteId(2), None, "x", CallKind::GetProperty, 0, CallFlags::empty());
        assert_eq!(rt.invoke(&get_x, &p, &[]).expect("x"), Value::Long(1));

        let set_x = rt.link(CallSiteId(3), None, "x", CallKind::SetProperty, 1, CallFlags::empty());
        rt.invoke(&set_x, &p, &[Value::Int(10)]).expect("set");
        assert_eq!(rt.invoke(&get_x, &p, &[]).expect("x"), Value::Long(10));

        let sum = rt.link(CallSiteId(4), None, "sum", CallKind::GetProperty, 0, CallFlags::empty());
        assert_eq!(rt.invoke(&sum, &p, &[]).expect("getter"), Value::Long(12));
    }

    #[test]
    fn test_static_calls_guard_on_class_value() {
        let rt = runtime();
        let site = method_site(&rt, "getName", 0);
        let string = Value::Class(rt.symbols().builtins().string.clone());
        let integer = Value::Class(rt.symbols().builtins().integer.clone());
        assert_eq!(rt.invoke(&site, &string, &[]).expect("ok"), Value::str("String"));
        assert_eq!(rt.invoke(&site, &integer, &[]).expect("ok"), Value::str("Integer"));

        let keys: Vec<String> = site.cache().keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["class Integer", "class String"]);

        let value_of = method_site(&rt, "valueOf", 1);
        assert_eq!(rt.invoke(&value_of, &string, &[Value::Int(5)]).expect("ok"), Value::str("5"));
    }

    #[test]
    fn test_target_exceptions_lose_one_wrapper() {
        let rt = runtime();
        let failing = rt.symbols().define(ClassBuilder::new("Failing").method(MethodDef::native(
            "explode",
            vec![],
            |_, _| Err(DispatchError::wrapped(DispatchError::thrown("boom"))),
        )));
        let site = method_site(&rt, "explode", 0);
        let err = rt.invoke(&site, &object(&failing), &[]).expect_err("throws");
        assert!(matches!(err, DispatchError::Thrown { ref message, .. } if message == "boom"));
    }

    #[test]
    fn test_category_scope_shadows_and_restores() {
        let rt = runtime();
        let shout = Category::builder("Shout")
            .method(
                "String",
                MethodDef::native("toUpperCase", vec![], |receiver, _| Ok(Value::str(format!("{}!", receiver)))),
            )
            .build();
        let site = method_site(&rt, "toUpperCase", 0);
        let receiver = Value::str("hi");

        assert_eq!(rt.invoke(&site, &receiver, &[]).expect("ok"), Value::str("HI"));
        let inside = rt.use_category(shout, || rt.invoke(&site, &receiver, &[]).expect("ok"));
        assert_eq!(inside, Value::str("hi!"));
        assert_eq!(rt.invoke(&site, &receiver, &[]).expect("ok"), Value::str("HI"));
    }

    #[test]
    fn test_per_instance_tables_bypass_cache() {
        let rt = runtime();
        let widget = rt.symbols().define(
            ClassBuilder::new("Widget").method(MethodDef::native("render", vec![], |_, _| Ok(Value::str("plain")))),
        );
        let special = Arc::new(Instance::new(widget.clone()));
        special.set_dispatch_table(DispatchTable::new(
            &widget,
            vec![MethodDef::native("render", vec![], |_, _| Ok(Value::str("special")))],
        ));

        let site = method_site(&rt, "render", 0);
        assert_eq!(
            rt.invoke(&site, &Value::Object(special), &[]).expect("ok"),
            Value::str("special")
        );
        assert_eq!(rt.invoke(&site, &object(&widget), &[]).expect("ok"), Value::str("plain"));
        assert!(site.cache().is_empty());
    }

    #[test]
    fn test_this_call_selects_private_member() {
        let rt = runtime();
        let vault = rt.symbols().define(
            ClassBuilder::new("Vault")
                .method(MethodDef::native("secret", vec![], |_, _| Ok(Value::Int(7))).private()),
        );
        let outside = method_site(&rt, "secret", 0);
        assert!(rt.invoke(&outside, &object(&vault), &[]).is_err());

        let inside = rt.link(CallSiteId(2), Some(&vault), "secret", CallKind::Method, 0, CallFlags::THIS_CALL);
        assert_eq!(rt.invoke(&inside, &object(&vault), &[]).expect("ok"), Value::Int(7));
    }

    #[test]
    fn test_unloaded_classes_leave_the_cache() {
        let rt = runtime();
        let site = method_site(&rt, "toString", 0);
        {
            let temp = rt.symbols().define(ClassBuilder::new("Temp"));
            rt.invoke(&site, &object(&temp), &[]).expect("ok");
        }
        rt.symbols().unload("Temp");
        rt.invoke(&site, &Value::Int(1), &[]).expect("ok");

        let keys: Vec<String> = site.cache().keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["Integer"]);
    }

    #[test]
    fn test_notify_sweeps_registered_sites() {
        let rt = DispatchRuntime::new(DispatchConfig::default().with_optimize_threshold(1));
        let site = method_site(&rt, "length", 0);
        for _ in 0..2 {
            rt.invoke(&site, &Value::str("x"), &[]).expect("ok");
        }
        assert_eq!(site.state(), CallSiteState::MonomorphicOptimized);

        let report = rt.notify_metaclass_changed(Some("String"));
        assert_eq!(report.cleared, 1);
        assert_eq!(site.state(), CallSiteState::Adaptive);
        assert!(site.cache().is_empty());
    }

    #[test]
    fn test_concurrent_mixed_receivers() {
        let rt = DispatchRuntime::new(DispatchConfig::default().with_optimize_threshold(10));
        let site = method_site(&rt, "toString", 0);
        crossbeam::thread::scope(|scope| {
            for worker in 0..8 {
                let rt = &rt;
                let site = &site;
                scope.spawn(move |_| {
                    for i in 0..200 {
                        let (receiver, expected) = if (i + worker) % 3 == 0 {
                            (Value::Int(i), Value::str(i.to_string()))
                        } else {
                            (Value::str("s"), Value::str("s"))
                        };
                        assert_eq!(rt.invoke(site, &receiver, &[]).expect("ok"), expected);
                        if worker == 0 && i == 100 {
                            rt.invalidate();
                        }
                    }
                });
            }
        })
        .expect("scope panicked");
        assert!(site.cache().len() <= rt.config().cache_capacity);
    }

    #[test]
    fn test_interface_call_requires_the_declared_interface() {
        let rt = runtime();
        let runnable = rt.symbols().define(ClassBuilder::new("Runnable").interface());
        let task = rt.symbols().define(
            ClassBuilder::new("Task")
                .implements(&runnable)
                .method(MethodDef::native("run", vec![], |_, _| Ok(Value::str("ran")))),
        );
        let stray = rt.symbols().define(
            ClassBuilder::new("Stray").method(MethodDef::native("run", vec![], |_, _| Ok(Value::str("stray")))),
        );
        let main = rt.symbols().define(ClassBuilder::new("Main"));

        let site = rt.link_descriptor(
            CallSiteDescriptor::new(CallSiteId(5), "run", CallKind::Interface, 0)
                .with_owner(&main)
                .with_interface(&runnable),
        );
        assert_eq!(rt.invoke(&site, &object(&task), &[]).expect("ok"), Value::str("ran"));
        let err = rt.invoke(&site, &object(&stray), &[]).expect_err("not a Runnable");
        assert!(err.is_missing_member());
    }

    #[test]
    fn test_fallback_cutoff_returns_site_to_default() {
        let config = DispatchConfig::default()
            .with_optimize_threshold(2)
            .with_fallback_cutoff(3);
        let rt = DispatchRuntime::new(config);
        let site = method_site(&rt, "toString", 0);

        for _ in 0..3 {
            rt.invoke(&site, &Value::str("a"), &[]).expect("ok");
        }
        assert_eq!(site.state(), CallSiteState::MonomorphicOptimized);

        for _ in 0..3 {
            assert_eq!(rt.invoke(&site, &Value::Int(7), &[]).expect("ok"), Value::str("7"));
        }
        assert_eq!(site.state(), CallSiteState::MonomorphicOptimized);

        rt.invoke(&site, &Value::Int(7), &[]).expect("ok");
        assert!(site.is_default());
        assert!(site.is_frozen());
        assert_eq!(site.state(), CallSiteState::Deoptimized);
        assert_eq!(site.stats().promotions, 1);

        let resolutions = site.stats().resolutions;
        for _ in 0..10 {
            assert_eq!(rt.invoke(&site, &Value::Int(7), &[]).expect("ok"), Value::str("7"));
            assert_eq!(rt.invoke(&site, &Value::str("b"), &[]).expect("ok"), Value::str("b"));
        }
        assert_eq!(site.stats().resolutions, resolutions);
        assert_eq!(site.stats().promotions, 1);
        assert!(site.is_default());
    }

    #[test]
    fn test_mismatches_on_promoted_site_leave_cache_alone() {
        let rt = DispatchRuntime::new(DispatchConfig::default().with_optimize_threshold(2));
        let site = method_site(&rt, "toString", 0);
        for _ in 0..3 {
            rt.invoke(&site, &Value::str("a"), &[]).expect("ok");
        }
        let installed = site.installed_handle().expect("promoted");

        assert_eq!(rt.invoke(&site, &Value::Int(1), &[]).expect("ok"), Value::str("1"));

        let keys: Vec<String> = site.cache().keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["String"]);
        let cached = site.cache().get("String").expect("cached");
        assert!(Arc::ptr_eq(&installed, &cached));
        let still = site.installed_handle().expect("still promoted");
        assert!(Arc::ptr_eq(&installed, &still));
    }

    #[test]
    fn test_varargs_tail_is_packed_into_an_array() {
        let rt = runtime();
        let collector = rt.symbols().define(ClassBuilder::new("Collector").method(
            MethodDef::native(
                "collect",
                vec![ParamType::Int, ParamType::array_of(ParamType::Int)],
                |_, args| Ok(args[1].clone()),
            )
            .varargs(),
        ));
        let receiver = object(&collector);

        for (id, count) in [0usize, 1, 3].into_iter().enumerate() {
            let tail: Vec<Value> = (0..count).map(|i| Value::Int(i as i32 + 10)).collect();
            let mut args = vec![Value::Int(0)];
            args.extend(tail.iter().cloned());
            let site = rt.link(CallSiteId(id as u32), None, "collect", CallKind::Method, args.len(), CallFlags::empty());

            let packed = rt.invoke(&site, &receiver, &args).expect("ok");
            assert_eq!(packed.as_array().map(|items| items.len()), Some(count));
            assert_eq!(packed, Value::array(tail));
        }
    }

    #[test]
    fn test_property_writes_fall_back_to_setter_then_hook() {
        let rt = runtime();
        let bean = rt.symbols().define(
            ClassBuilder::new("Bean")
                .field("levelValue", ParamType::Int)
                .field("log", ParamType::Str)
                .method(MethodDef::native("setLevel", vec![ParamType::Int], |this, args| {
                    let instance = this.as_instance().ok_or_else(|| DispatchError::internal("not a bean"))?;
                    instance.set_field(0, args[0].clone());
                    Ok(Value::Null)
                }))
                .method(MethodDef::native(
                    "setProperty",
                    vec![ParamType::Str, ParamType::Any],
                    |this, args| {
                        let instance = this.as_instance().ok_or_else(|| DispatchError::internal("not a bean"))?;
                        instance.set_field(1, Value::str(format!("{}={}", args[0], args[1])));
                        Ok(Value::Null)
                    },
                )),
        );
        let receiver = object(&bean);

        let set_level = rt.link(CallSiteId(1), None, "level", CallKind::SetProperty, 1, CallFlags::empty());
        rt.invoke(&set_level, &receiver, &[Value::Int(3)]).expect("setter");
        let get_level = rt.link(CallSiteId(2), None, "levelValue", CallKind::GetProperty, 0, CallFlags::empty());
        assert_eq!(rt.invoke(&get_level, &receiver, &[]).expect("field"), Value::Int(3));

        let set_color = rt.link(CallSiteId(3), None, "color", CallKind::SetProperty, 1, CallFlags::empty());
        rt.invoke(&set_color, &receiver, &[Value::str("red")]).expect("hook");
        let get_log = rt.link(CallSiteId(4), None, "log", CallKind::GetProperty, 0, CallFlags::empty());
        assert_eq!(rt.invoke(&get_log, &receiver, &[]).expect("field"), Value::str("color=red"));
    }

    #[test]
    fn test_global_runtime_is_usable() {
        let site = RUNTIME.link(CallSiteId(1), None, "length", CallKind::Method, 0, CallFlags::empty());
        assert_eq!(RUNTIME.invoke(&site, &Value::str("four"), &[]).expect("ok"), Value::Int(4));
    }
}
