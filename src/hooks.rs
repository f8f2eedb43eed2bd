use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::Context;

/// A property callback: receives the resolver context and an input string,
/// returns an answer or `None` when it has nothing to say.
pub type PropertyCallback = Arc<dyn Fn(&Context, &str) -> Option<String> + Send + Sync>;

/// Open registry of (module, property) callbacks for user hooks.
///
/// Callbacks get the context as an explicit argument; there is no global
/// state to reach for.
#[derive(Default)]
pub struct PropertyRegistry {
    props: RwLock<HashMap<(String, String), PropertyCallback>>,
}

impl PropertyRegistry {
    pub fn new() -> Self {
        PropertyRegistry::default()
    }

    pub fn register(&self, module: &str, prop: &str, callback: PropertyCallback) {
        self.props
            .write()
            .insert((module.to_string(), prop.to_string()), callback);
    }

    /// Drop every property a module registered.
    pub fn unregister_module(&self, module: &str) {
        self.props.write().retain(|(m, _), _| m != module);
    }

    /// Invoke a registered property; `None` when no such (module, prop).
    pub fn call(&self, ctx: &Context, module: &str, prop: &str, input: &str) -> Option<String> {
        let callback = self
            .props
            .read()
            .get(&(module.to_string(), prop.to_string()))
            .cloned()?;
        callback(ctx, input)
    }

    pub fn len(&self) -> usize {
        self.props.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.read().is_empty()
    }
}
