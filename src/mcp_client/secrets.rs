//! Secret/settings lookup used by placeholder substitution.
//!
//! The loader only ever asks "what is the value of NAME?". Where the value
//! lives (environment, keychain, settings file) is the provider's business,
//! and so is masking values in its own logs.

use std::collections::HashMap;

/// A narrow `get(name) -> value` capability.
pub trait SecretProvider: Send + Sync {
    /// Return the value for `name`, or `None` when it is not known.
    fn get(&self, name: &str) -> Option<String>;
}

/// Reads values from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecrets;

impl SecretProvider for EnvSecrets {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Fixed in-memory values. Handy for tests and for settings objects that
/// are already loaded.
#[derive(Debug, Clone, Default)]
pub struct MapSecrets {
    values: HashMap<String, String>,
}

impl MapSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a value (builder style).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MapSecrets {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl SecretProvider for MapSecrets {
    fn get(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

/// Consults each provider in order; first hit wins.
#[derive(Default)]
pub struct ChainSecrets {
    providers: Vec<Box<dyn SecretProvider>>,
}

impl ChainSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, provider: impl SecretProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }
}

impl SecretProvider for ChainSecrets {
    fn get(&self, name: &str) -> Option<String> {
        self.providers.iter().find_map(|p| p.get(name))
    }
}
