//! # External Collaborators
//!
//! The store does not own reinforcement type definitions or the world id
//! mapping. It reaches them through two traits:
//!
//! - [`TypeCatalog`]: type id → [`ReinforcementType`], plus the full list for
//!   legacy material disambiguation
//! - [`WorldRegistry`]: world name ↔ [`WorldId`]
//!
//! [`StaticTypeCatalog`] and [`StaticWorldRegistry`] are plain in-memory
//! implementations for hosts that load their definitions up front, and for tests.

use std::collections::{BTreeMap, HashMap};

use crate::types::{ReinforcementType, TypeId, WorldId, WorldRef};

// =============================================================================
// Traits
// =============================================================================

/// Source of reinforcement type definitions.
pub trait TypeCatalog: Send + Sync {
    /// Looks up a type by id; `None` if the id is no longer configured.
    fn resolve_type(&self, id: TypeId) -> Option<&ReinforcementType>;

    /// Every configured type.
    fn all_types(&self) -> Vec<&ReinforcementType>;
}

/// Source of the world name ↔ numeric id mapping.
pub trait WorldRegistry: Send + Sync {
    fn internal_id_for_name(&self, name: &str) -> Option<WorldId>;

    fn world_for_internal_id(&self, id: WorldId) -> Option<WorldRef>;
}

// =============================================================================
// In-Memory Implementations
// =============================================================================

/// A [`TypeCatalog`] backed by a map, ordered by type id.
#[derive(Debug, Clone, Default)]
pub struct StaticTypeCatalog {
    types: BTreeMap<TypeId, ReinforcementType>,
}

impl StaticTypeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a type definition.
    pub fn with_type(mut self, rein_type: ReinforcementType) -> Self {
        self.insert(rein_type);
        self
    }

    pub fn insert(&mut self, rein_type: ReinforcementType) {
        self.types.insert(rein_type.id, rein_type);
    }

    pub fn remove(&mut self, id: TypeId) -> Option<ReinforcementType> {
        self.types.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl FromIterator<ReinforcementType> for StaticTypeCatalog {
    fn from_iter<I: IntoIterator<Item = ReinforcementType>>(iter: I) -> Self {
        let mut catalog = Self::new();
        for rein_type in iter {
            catalog.insert(rein_type);
        }
        catalog
    }
}

impl TypeCatalog for StaticTypeCatalog {
    fn resolve_type(&self, id: TypeId) -> Option<&ReinforcementType> {
        self.types.get(&id)
    }

    fn all_types(&self) -> Vec<&ReinforcementType> {
        self.types.values().collect()
    }
}

/// A [`WorldRegistry`] backed by two maps kept in sync.
#[derive(Debug, Clone, Default)]
pub struct StaticWorldRegistry {
    by_name: HashMap<String, WorldId>,
    by_id: HashMap<WorldId, String>,
}

impl StaticWorldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_world(mut self, name: impl Into<String>, id: WorldId) -> Self {
        self.register(name, id);
        self
    }

    /// Registers a world, replacing any previous mapping for the name or id.
    pub fn register(&mut self, name: impl Into<String>, id: WorldId) {
        let name = name.into();
        if let Some(old_id) = self.by_name.insert(name.clone(), id) {
            if old_id != id {
                self.by_id.remove(&old_id);
            }
        }
        if let Some(old_name) = self.by_id.insert(id, name.clone()) {
            if old_name != name {
                self.by_name.remove(&old_name);
            }
        }
    }
}

impl WorldRegistry for StaticWorldRegistry {
    fn internal_id_for_name(&self, name: &str) -> Option<WorldId> {
        self.by_name.get(name).copied()
    }

    fn world_for_internal_id(&self, id: WorldId) -> Option<WorldRef> {
        self.by_id.get(&id).map(|name| WorldRef {
            id,
            name: name.clone(),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_catalog_lookup() {
        let catalog: StaticTypeCatalog = [
            ReinforcementType::new(TypeId::from_raw(2), "Iron", 42),
            ReinforcementType::new(TypeId::from_raw(1), "Stone", 1),
        ]
        .into_iter()
        .collect();

        assert_eq!(catalog.len(), 2);
        assert_eq!(
            catalog.resolve_type(TypeId::from_raw(2)).map(|t| t.name.as_str()),
            Some("Iron")
        );
        assert!(catalog.resolve_type(TypeId::from_raw(9)).is_none());

        // Ordered by id
        let ids: Vec<u16> = catalog.all_types().iter().map(|t| t.id.as_raw()).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_world_registry_both_directions() {
        let registry = StaticWorldRegistry::new()
            .with_world("world", WorldId::from_raw(0))
            .with_world("world_nether", WorldId::from_raw(1));

        assert_eq!(registry.internal_id_for_name("world_nether"), Some(WorldId::from_raw(1)));
        assert_eq!(registry.internal_id_for_name("world_the_end"), None);
        assert_eq!(
            registry.world_for_internal_id(WorldId::from_raw(0)).map(|w| w.name),
            Some("world".to_string())
        );
    }

    #[test]
    fn test_world_registry_rename_replaces_mapping() {
        let mut registry = StaticWorldRegistry::new().with_world("old", WorldId::from_raw(5));
        registry.register("new", WorldId::from_raw(5));

        assert_eq!(registry.internal_id_for_name("new"), Some(WorldId::from_raw(5)));
        assert_eq!(registry.internal_id_for_name("old"), None);
        assert_eq!(
            registry.world_for_internal_id(WorldId::from_raw(5)).map(|w| w.name),
            Some("new".to_string())
        );
    }
}
