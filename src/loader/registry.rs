//! The arena of libraries a loader has mapped.
//!
//! The registry is owned by the caller and handed to every load. A library enters it as
//! [`ModuleState::Loading`] as soon as its export table is known, which is what lets a
//! dependency that imports from it again (directly or through a longer cycle) bind without
//! recursing. Once the library is sealed it is replaced by [`ModuleState::Loaded`].

use std::{collections::HashMap, sync::Arc};

use crate::loader::{LoadedImage, ModuleExports};

/// Registry entry of one library.
#[derive(Clone)]
pub enum ModuleState {
    /// Mapped and relocated, imports still being bound
    Loading(Arc<ModuleExports>),
    /// Sealed and initialized
    Loaded(Arc<LoadedImage>),
}

impl ModuleState {
    /// The export table of the library, in either state.
    #[must_use]
    pub fn exports(&self) -> &ModuleExports {
        match self {
            ModuleState::Loading(exports) => exports,
            ModuleState::Loaded(image) => image.exports(),
        }
    }
}

/// Name to library map shared by all loads of one owner.
///
/// Names compare the way Windows compares module names: case-insensitively, with `\` and `/`
/// treated alike.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, ModuleState>,
}

impl ModuleRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> ModuleRegistry {
        ModuleRegistry::default()
    }

    /// The normalized key of `name`.
    #[must_use]
    pub fn key(name: &str) -> String {
        name.replace('\\', "/").to_lowercase()
    }

    /// The state of `name`, if it is known.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ModuleState> {
        self.modules.get(&Self::key(name))
    }

    /// The library registered as `name`, if it finished loading.
    #[must_use]
    pub fn loaded(&self, name: &str) -> Option<Arc<LoadedImage>> {
        match self.get(name)? {
            ModuleState::Loaded(image) => Some(Arc::clone(image)),
            ModuleState::Loading(_) => None,
        }
    }

    /// Returns `true` if `name` is loading or loaded.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Number of registered libraries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns `true` if no library is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// The normalized names of all registered libraries.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// All libraries that finished loading.
    pub fn images(&self) -> impl Iterator<Item = &Arc<LoadedImage>> {
        self.modules.values().filter_map(|state| match state {
            ModuleState::Loaded(image) => Some(image),
            ModuleState::Loading(_) => None,
        })
    }

    pub(crate) fn insert(&mut self, name: &str, state: ModuleState) {
        self.modules.insert(Self::key(name), state);
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<ModuleState> {
        self.modules.remove(&Self::key(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_normalized() {
        let mut registry = ModuleRegistry::new();
        registry.insert(
            "Pkg\\Spam.PYD",
            ModuleState::Loading(Arc::new(ModuleExports::empty("Pkg\\Spam.PYD", 0x1000))),
        );

        assert!(registry.contains("pkg/spam.pyd"));
        assert!(registry.contains("PKG\\SPAM.pyd"));
        assert!(registry.loaded("pkg/spam.pyd").is_none());
        assert_eq!(
            registry.get("pkg/spam.pyd").map(|state| state.exports().base),
            Some(0x1000)
        );
        assert_eq!(registry.names().collect::<Vec<_>>(), ["pkg/spam.pyd"]);
        assert_eq!(registry.len(), 1);

        assert!(registry.remove("PKG/SPAM.PYD").is_some());
        assert!(registry.is_empty());
    }
}
