//! Named service registry with lazily constructed singletons.
//!
//! Services are shared as `Arc<dyn Any + Send + Sync>` and recovered with a
//! checked downcast. Consumers declare what they need through typed
//! [`Slot`]s and implement [`Injectable`] to have them filled.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::error::{PluginError, PluginResult};

/// A type-erased shared service instance.
pub type SharedService = Arc<dyn Any + Send + Sync>;

type FactoryFn = dyn Fn(&ServiceRegistry) -> PluginResult<SharedService> + Send + Sync;

struct LazyService {
    factory: Box<FactoryFn>,
    instance: Mutex<Option<SharedService>>,
}

#[derive(Clone)]
enum Registration {
    Instance(SharedService),
    Factory(Arc<LazyService>),
}

/// Registry of named services.
///
/// A name holds either a ready instance or a factory. Factories run at most
/// once, on first resolution, and the result is memoized. A factory may
/// resolve other names from the registry, but not its own.
#[derive(Default)]
pub struct ServiceRegistry {
    entries: DashMap<String, Registration>,
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("names", &self.names())
            .finish_non_exhaustive()
    }
}

impl ServiceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a ready instance under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::DuplicateService`] if `name` is taken.
    pub fn register_service<T>(&self, name: impl Into<String>, instance: T) -> PluginResult<()>
    where
        T: Any + Send + Sync,
    {
        self.register_shared(name, Arc::new(instance))
    }

    /// Register an already shared instance under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::DuplicateService`] if `name` is taken.
    pub fn register_shared(
        &self,
        name: impl Into<String>,
        instance: SharedService,
    ) -> PluginResult<()> {
        self.insert(name.into(), Registration::Instance(instance))
    }

    /// Register a factory producing the service on first use.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::DuplicateService`] if `name` is taken.
    pub fn register_factory<T, F>(&self, name: impl Into<String>, factory: F) -> PluginResult<()>
    where
        T: Any + Send + Sync,
        F: Fn(&ServiceRegistry) -> PluginResult<T> + Send + Sync + 'static,
    {
        let lazy = LazyService {
            factory: Box::new(move |registry| {
                factory(registry).map(|value| Arc::new(value) as SharedService)
            }),
            instance: Mutex::new(None),
        };
        self.insert(name.into(), Registration::Factory(Arc::new(lazy)))
    }

    fn insert(&self, name: String, registration: Registration) -> PluginResult<()> {
        match self.entries.entry(name) {
            Entry::Occupied(entry) => Err(PluginError::DuplicateService(entry.key().clone())),
            Entry::Vacant(entry) => {
                debug!(service = %entry.key(), "Registered service");
                entry.insert(registration);
                Ok(())
            },
        }
    }

    /// Resolve `name`, running and memoizing its factory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ServiceNotRegistered`] for unknown names, or
    /// the factory's own error.
    pub fn get_service(&self, name: &str) -> PluginResult<SharedService> {
        // Clone out so the shard lock is released before a factory runs.
        let registration = self
            .entries
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PluginError::ServiceNotRegistered(name.to_string()))?;

        match registration {
            Registration::Instance(instance) => Ok(instance),
            Registration::Factory(lazy) => {
                let mut slot = lazy
                    .instance
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if let Some(instance) = slot.as_ref() {
                    return Ok(Arc::clone(instance));
                }
                let instance = (lazy.factory)(self)?;
                debug!(service = %name, "Constructed singleton service");
                *slot = Some(Arc::clone(&instance));
                Ok(instance)
            },
        }
    }

    /// Resolve `name` as a `T`.
    ///
    /// # Errors
    ///
    /// As [`ServiceRegistry::get_service`], plus
    /// [`PluginError::TypeMismatch`] if the service is not a `T`.
    pub fn get<T>(&self, name: &str) -> PluginResult<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.get_service(name)?
            .downcast::<T>()
            .map_err(|_| PluginError::TypeMismatch {
                name: name.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Remove `name` and any memoized instance.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ServiceNotRegistered`] for unknown names.
    pub fn unregister(&self, name: &str) -> PluginResult<()> {
        self.entries
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| PluginError::ServiceNotRegistered(name.to_string()))
    }

    /// Fill every slot of `target`.
    ///
    /// # Errors
    ///
    /// Returns the first resolution failure reported by the target.
    pub fn inject<T: Injectable + ?Sized>(&self, target: &mut T) -> PluginResult<()> {
        target.inject(self)
    }
}

/// A typed requirement on a named service.
pub struct Slot<T> {
    name: String,
    optional: bool,
    value: Option<Arc<T>>,
}

impl<T> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("name", &self.name)
            .field("optional", &self.optional)
            .field("filled", &self.value.is_some())
            .finish()
    }
}

impl<T: Any + Send + Sync> Slot<T> {
    /// A slot that must be filled.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optional: false,
            value: None,
        }
    }

    /// A slot left empty when the service is not registered.
    #[must_use]
    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            optional: true,
            ..Self::new(name)
        }
    }

    /// Service name this slot binds to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The resolved service, if any.
    #[must_use]
    pub fn get(&self) -> Option<&Arc<T>> {
        self.value.as_ref()
    }

    /// Whether a service has been bound.
    #[must_use]
    pub fn is_filled(&self) -> bool {
        self.value.is_some()
    }

    /// Resolve the slot from `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::TypeMismatch`] on a type mismatch and
    /// [`PluginError::ServiceNotRegistered`] for a missing required service.
    pub fn resolve(&mut self, registry: &ServiceRegistry) -> PluginResult<()> {
        match registry.get::<T>(&self.name) {
            Ok(value) => {
                self.value = Some(value);
                Ok(())
            },
            Err(PluginError::ServiceNotRegistered(_)) if self.optional => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// A record whose fields are [`Slot`]s filled from a [`ServiceRegistry`].
pub trait Injectable {
    /// Resolve every slot.
    ///
    /// # Errors
    ///
    /// Returns the first slot resolution failure.
    fn inject(&mut self, registry: &ServiceRegistry) -> PluginResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Clock(u64);

    #[derive(Debug)]
    struct Auditor {
        sink: String,
    }

    struct Consumer {
        clock: Slot<Clock>,
        auditor: Slot<Auditor>,
    }

    impl Injectable for Consumer {
        fn inject(&mut self, registry: &ServiceRegistry) -> PluginResult<()> {
            self.clock.resolve(registry)?;
            self.auditor.resolve(registry)
        }
    }

    #[test]
    fn test_register_and_get() {
        let registry = ServiceRegistry::new();
        registry.register_service("clock", Clock(7)).unwrap();
        assert_eq!(registry.get::<Clock>("clock").unwrap().0, 7);
        assert!(registry.has("clock"));
    }

    #[test]
    fn test_duplicate_names_rejected_across_kinds() {
        let registry = ServiceRegistry::new();
        registry.register_service("clock", Clock(1)).unwrap();
        assert!(matches!(
            registry.register_service("clock", Clock(2)),
            Err(PluginError::DuplicateService(_))
        ));
        assert!(matches!(
            registry.register_factory("clock", |_| Ok(Clock(3))),
            Err(PluginError::DuplicateService(_))
        ));
    }

    #[test]
    fn test_factory_is_lazy_and_memoized() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = ServiceRegistry::new();
        let counter = Arc::clone(&calls);
        registry
            .register_factory("clock", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Clock(42))
            })
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let first = registry.get::<Clock>("clock").unwrap();
        let second = registry.get::<Clock>("clock").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_factory_can_resolve_other_services() {
        let registry = ServiceRegistry::new();
        registry.register_service("sink", String::from("syslog")).unwrap();
        registry
            .register_factory("auditor", |r| {
                let sink = r.get::<String>("sink")?;
                Ok(Auditor {
                    sink: sink.as_ref().clone(),
                })
            })
            .unwrap();

        assert_eq!(registry.get::<Auditor>("auditor").unwrap().sink, "syslog");
    }

    #[test]
    fn test_failed_factory_retries_next_time() {
        let registry = ServiceRegistry::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        registry
            .register_factory("flaky", move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(PluginError::Internal("not yet".into()))
                } else {
                    Ok(Clock(1))
                }
            })
            .unwrap();

        assert!(registry.get_service("flaky").is_err());
        assert!(registry.get::<Clock>("flaky").is_ok());
    }

    #[test]
    fn test_missing_and_mismatched() {
        let registry = ServiceRegistry::new();
        assert!(matches!(
            registry.get_service("nope"),
            Err(PluginError::ServiceNotRegistered(_))
        ));

        registry.register_service("clock", Clock(1)).unwrap();
        assert!(matches!(
            registry.get::<Auditor>("clock"),
            Err(PluginError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_inject_slots() {
        let registry = ServiceRegistry::new();
        registry.register_service("clock", Clock(9)).unwrap();

        let mut consumer = Consumer {
            clock: Slot::new("clock"),
            auditor: Slot::optional("auditor"),
        };
        registry.inject(&mut consumer).unwrap();
        assert_eq!(consumer.clock.get().unwrap().0, 9);
        assert!(!consumer.auditor.is_filled());

        let mut strict = Consumer {
            clock: Slot::new("clock"),
            auditor: Slot::new("auditor"),
        };
        assert!(matches!(
            registry.inject(&mut strict),
            Err(PluginError::ServiceNotRegistered(_))
        ));
    }

    #[test]
    fn test_inject_type_mismatch() {
        let registry = ServiceRegistry::new();
        registry.register_service("clock", String::from("not a clock")).unwrap();
        let mut consumer = Consumer {
            clock: Slot::new("clock"),
            auditor: Slot::optional("auditor"),
        };
        assert!(matches!(
            registry.inject(&mut consumer),
            Err(PluginError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_unregister_and_names() {
        let registry = ServiceRegistry::new();
        registry.register_service("b", Clock(1)).unwrap();
        registry.register_service("a", Clock(2)).unwrap();
        assert_eq!(registry.names(), vec!["a", "b"]);
        registry.unregister("a").unwrap();
        assert!(!registry.has("a"));
        assert!(registry.unregister("a").is_err());
    }
}
