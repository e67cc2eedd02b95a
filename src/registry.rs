//! Provider registry: the name→fixture table consulted during resolution.
//!
//! Definitions are registered once at collection time and immutable
//! afterwards, except for a registry-wide clear between independent runs.
//! The registry is an explicit object created per run rather than a
//! process-wide global, so concurrent runs (including the engine's own
//! tests) never interfere.

use indexmap::IndexMap;

use crate::error::FixtureError;
use crate::model::{FixtureDef, UnitLocation};

/// The active set of fixture definitions for one run.
#[derive(Default)]
pub struct FixtureRegistry {
    /// All definitions in registration order; autouse collection walks this.
    defs: Vec<FixtureDef>,
    /// Name → indices into `defs`, preserving registration order per name.
    by_name: IndexMap<String, Vec<usize>>,
}

impl FixtureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the active set with `defs`.
    pub fn register(&mut self, defs: Vec<FixtureDef>) {
        self.clear();
        for def in defs {
            self.add(def);
        }
    }

    /// Append one definition to the active set.
    pub fn add(&mut self, def: FixtureDef) {
        let index = self.defs.len();
        self.by_name
            .entry(def.name.clone())
            .or_default()
            .push(index);
        self.defs.push(def);
    }

    /// Empty the registry between independent runs.
    pub fn clear(&mut self) {
        self.defs.clear();
        self.by_name.clear();
    }

    /// Find the nearest visible definition of `name` for a unit at `at`.
    ///
    /// Shadowing is resolved by visibility specificity; among equally
    /// specific candidates the later registration wins, matching the
    /// convention that more deeply nested configuration is registered
    /// after its ancestors.
    pub fn lookup(&self, name: &str, at: &UnitLocation<'_>) -> Result<&FixtureDef, FixtureError> {
        self.get_visible(name, at)
            .ok_or_else(|| FixtureError::NotFound(name.to_string()))
    }

    /// Like [`Self::lookup`] but returning `None` instead of an error.
    pub fn get_visible(&self, name: &str, at: &UnitLocation<'_>) -> Option<&FixtureDef> {
        let candidates = self.by_name.get(name)?;
        let mut best: Option<(u32, usize)> = None;
        for &index in candidates {
            let def = &self.defs[index];
            if let Some(rank) = def.visibility.specificity(at) {
                match best {
                    Some((best_rank, _)) if best_rank > rank => {}
                    _ => best = Some((rank, index)),
                }
            }
        }
        best.map(|(_, index)| &self.defs[index])
    }

    /// Names of autouse fixtures visible to a unit at `at`, in registration
    /// order with duplicates removed keeping the first occurrence.
    pub fn autouse_for(&self, at: &UnitLocation<'_>) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for def in &self.defs {
            if !def.autouse || def.visibility.specificity(at).is_none() {
                continue;
            }
            if !names.contains(&def.name.as_str()) {
                names.push(def.name.as_str());
            }
        }
        names
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FixtureFactory, FixtureScope, FixtureVisibility};

    fn def(name: &str, visibility: FixtureVisibility) -> FixtureDef {
        FixtureDef::new(
            name,
            FixtureScope::Function,
            FixtureFactory::from_value(0u8),
        )
        .visible_in(visibility)
    }

    fn at(module: &str) -> UnitLocation<'_> {
        UnitLocation {
            module,
            class: None,
        }
    }

    #[test]
    fn module_definition_shadows_shared_directory() {
        let mut registry = FixtureRegistry::new();
        registry.register(vec![
            def("db", FixtureVisibility::Directory(String::new())),
            def("db", FixtureVisibility::Directory("tests/api".into())),
            def("db", FixtureVisibility::Module("tests/api/test_login.rs".into())),
        ]);

        let location = at("tests/api/test_login.rs");
        let found = registry.lookup("db", &location).unwrap();
        assert_eq!(
            found.visibility,
            FixtureVisibility::Module("tests/api/test_login.rs".into())
        );

        // A unit in a sibling module only sees the directory definitions.
        let sibling = at("tests/api/test_logout.rs");
        let found = registry.lookup("db", &sibling).unwrap();
        assert_eq!(
            found.visibility,
            FixtureVisibility::Directory("tests/api".into())
        );

        // A unit outside tests/api falls back to the root definition.
        let outside = at("tests/db/test_pool.rs");
        let found = registry.lookup("db", &outside).unwrap();
        assert_eq!(
            found.visibility,
            FixtureVisibility::Directory(String::new())
        );
    }

    #[test]
    fn missing_name_is_a_not_found_error() {
        let registry = FixtureRegistry::new();
        let location = at("tests/test_x.rs");
        assert!(matches!(
            registry.lookup("nope", &location),
            Err(FixtureError::NotFound(name)) if name == "nope"
        ));
    }

    #[test]
    fn autouse_listing_preserves_registration_order_and_visibility() {
        let mut registry = FixtureRegistry::new();
        registry.register(vec![
            def("first", FixtureVisibility::Directory(String::new())).with_autouse(),
            def("not_auto", FixtureVisibility::Directory(String::new())),
            def("second", FixtureVisibility::Module("tests/test_a.rs".into())).with_autouse(),
            def(
                "class_only",
                FixtureVisibility::Class {
                    module: "tests/test_a.rs".into(),
                    class: "TestX".into(),
                },
            )
            .with_autouse(),
            // Same name again at a different level: first occurrence kept.
            def("first", FixtureVisibility::Module("tests/test_a.rs".into())).with_autouse(),
        ]);

        let plain = at("tests/test_a.rs");
        assert_eq!(registry.autouse_for(&plain), vec!["first", "second"]);

        let in_class = UnitLocation {
            module: "tests/test_a.rs",
            class: Some("TestX"),
        };
        assert_eq!(
            registry.autouse_for(&in_class),
            vec!["first", "second", "class_only"]
        );

        let elsewhere = at("tests/test_b.rs");
        assert_eq!(registry.autouse_for(&elsewhere), vec!["first"]);
    }

    #[test]
    fn clear_empties_the_active_set() {
        let mut registry = FixtureRegistry::new();
        registry.add(def("db", FixtureVisibility::default()));
        assert_eq!(registry.len(), 1);
        registry.clear();
        assert!(registry.is_empty());
    }
}
