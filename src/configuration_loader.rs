//! Source of flag definitions consumed by [`ConfigurationCache`](crate::ConfigurationCache).
use std::{
    collections::HashMap,
    future::Future,
    path::Path,
    pin::Pin,
    sync::{Arc, RwLock},
};

use crate::{
    flag::{FlagDefinition, FlagSet},
    Result,
};

/// Future returned by [`ConfigurationLoader::load`].
pub type LoadFuture<'a> = Pin<Box<dyn Future<Output = Result<LoadOutcome>> + Send + 'a>>;

/// Successful result of a load.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Found(FlagDefinition),
    /// The flag is confirmed absent. This is not an error and is cached like a definition.
    NotFound,
}

/// Loads flag definitions on cache miss or expiry.
///
/// Implementations must be idempotent and safe to retry. Concurrent requests for the same key
/// are collapsed by the cache, so a loader sees at most one in-flight call per key.
///
/// Returning [`Error::ConfigInvalid`](crate::Error::ConfigInvalid) marks the flag as invalid (it
/// evaluates to `DISABLED`). Any other error is a load failure.
pub trait ConfigurationLoader: Send + Sync {
    /// Load the definition of `flag_key`.
    fn load<'a>(&'a self, flag_key: &'a str) -> LoadFuture<'a>;
}

impl<T: ConfigurationLoader + ?Sized> ConfigurationLoader for Arc<T> {
    fn load<'a>(&'a self, flag_key: &'a str) -> LoadFuture<'a> {
        (**self).load(flag_key)
    }
}

/// In-memory loader backed by a map of definitions.
///
/// Useful to embed a fixed flag set, and in tests. Definitions can be replaced at runtime; the
/// cache picks them up on its next refresh.
#[derive(Debug, Default)]
pub struct StaticLoader {
    flags: RwLock<HashMap<String, FlagDefinition>>,
}

impl StaticLoader {
    pub fn new() -> StaticLoader {
        StaticLoader::default()
    }

    pub fn from_flags(flags: impl IntoIterator<Item = FlagDefinition>) -> StaticLoader {
        StaticLoader {
            flags: RwLock::new(
                flags
                    .into_iter()
                    .map(|flag| (flag.key.clone(), flag))
                    .collect(),
            ),
        }
    }

    /// Build from a flag set: `{"flags": {"<key>": {...}, ...}}`.
    pub fn from_flag_set(flag_set: FlagSet) -> StaticLoader {
        StaticLoader {
            flags: RwLock::new(flag_set.flags),
        }
    }

    /// Parse a flag set from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`](crate::Error::ConfigInvalid) if `json` is not a valid flag
    /// set.
    pub fn from_json(json: &str) -> Result<StaticLoader> {
        let flag_set: FlagSet = serde_json::from_str(json)?;
        Ok(StaticLoader::from_flag_set(flag_set))
    }

    /// Read and parse a flag set JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if the file cannot be read and
    /// [`Error::ConfigInvalid`](crate::Error::ConfigInvalid) if it is not a valid flag set.
    pub fn from_path(path: impl AsRef<Path>) -> Result<StaticLoader> {
        let json = std::fs::read_to_string(path)?;
        StaticLoader::from_json(&json)
    }

    /// Insert or replace a definition.
    pub fn insert(&self, flag: FlagDefinition) {
        self.flags
            .write()
            .expect("thread holding flags lock should not panic")
            .insert(flag.key.clone(), flag);
    }

    /// Remove a definition. Subsequent loads report [`LoadOutcome::NotFound`].
    pub fn remove(&self, flag_key: &str) -> Option<FlagDefinition> {
        self.flags
            .write()
            .expect("thread holding flags lock should not panic")
            .remove(flag_key)
    }
}

impl ConfigurationLoader for StaticLoader {
    fn load<'a>(&'a self, flag_key: &'a str) -> LoadFuture<'a> {
        let outcome = self
            .flags
            .read()
            .expect("thread holding flags lock should not panic")
            .get(flag_key)
            .cloned()
            .map_or(LoadOutcome::NotFound, LoadOutcome::Found);
        Box::pin(std::future::ready(Ok(outcome)))
    }
}

impl From<FlagSet> for StaticLoader {
    fn from(value: FlagSet) -> Self {
        StaticLoader::from_flag_set(value)
    }
}
