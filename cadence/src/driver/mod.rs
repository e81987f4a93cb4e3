//! Driver adapters.
//!
//! A driver is selected once per activity by name and maps each op template
//! to a dispenser. The registry is an ordinary value owned by whoever builds
//! scenarios; there is no process-wide driver table.

use std::{collections::BTreeMap, str::FromStr, sync::Arc};

use crate::{
    error::{Error, Result},
    op::{OpDispenser, OpTemplate},
    params::ActivityDef,
};

#[cfg(feature = "builtins")]
pub mod diag;
#[cfg(feature = "builtins")]
pub mod stdout;

pub trait DriverAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Resolves one template. Called once per template when the activity is
    /// loaded; errors here are configuration errors.
    fn map_op(&self, template: &OpTemplate, def: &ActivityDef) -> Result<Arc<dyn OpDispenser>>;
}

pub type DriverFactory = Arc<dyn Fn(&ActivityDef) -> Result<Arc<dyn DriverAdapter>> + Send + Sync>;

#[derive(Clone)]
pub struct DriverRegistry {
    factories: BTreeMap<String, DriverFactory>,
}

impl DriverRegistry {
    /// A registry with no drivers at all.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// A registry holding the built-in `stdout` and `diag` drivers.
    #[cfg(feature = "builtins")]
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("stdout", |def| {
            Ok(Arc::new(stdout::StdoutDriver::open(def)?) as Arc<dyn DriverAdapter>)
        });
        registry.register("diag", |_| {
            Ok(Arc::new(diag::DiagDriver) as Arc<dyn DriverAdapter>)
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ActivityDef) -> Result<Arc<dyn DriverAdapter>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Builds the adapter named by the activity's `driver` parameter.
    pub fn create(&self, def: &ActivityDef) -> Result<Arc<dyn DriverAdapter>> {
        let name = def.driver();
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::UnknownDriver {
                name: name.to_string(),
                known: self.names().join(", "),
            })?;
        factory(def)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        #[cfg(feature = "builtins")]
        return Self::with_builtins();
        #[cfg(not(feature = "builtins"))]
        return Self::empty();
    }
}

/// Reads a driver knob from the template's fields, falling back to the
/// activity parameters.
pub fn knob<T>(template: &OpTemplate, def: &ActivityDef, key: &str) -> Result<Option<T>>
where
    T: FromStr,
{
    let raw = template
        .field_str(key)
        .or_else(|| def.params().get(key).map(str::to_string));
    match raw {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            Error::invalid(key, &raw, format!("unusable value for op '{}'", template.name))
        }),
    }
}
