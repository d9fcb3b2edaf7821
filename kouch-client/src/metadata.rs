//! Entity type → (database, class) resolution.
//!
//! Types opt in through [`MetadataResolver::register`]; a resolved value is
//! cached for the life of the resolver so every call for a type agrees.

use crate::config::DatabaseNaming;
use crate::error::{KouchError, KouchResult};
use kouch_types::{ClassName, DatabaseName, Entity};
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Where an entity type's documents live and how they are tagged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityMetadata {
    pub database_name: DatabaseName,
    pub class_name: ClassName,
}

/// Per-type registration. Unset fields fall back to naming conventions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityRegistration {
    pub database_name: Option<DatabaseName>,
    pub class_name: Option<ClassName>,
}

impl EntityRegistration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins the database regardless of the configured naming mode.
    pub fn with_database(mut self, database: impl Into<DatabaseName>) -> Self {
        self.database_name = Some(database.into());
        self
    }

    /// Overrides the discriminator value (defaults to the type name).
    pub fn with_class(mut self, class: impl Into<ClassName>) -> Self {
        self.class_name = Some(class.into());
        self
    }
}

/// Resolves and caches [`EntityMetadata`] per entity type.
///
/// Concurrent resolution of the same type may compute twice; both
/// computations produce the same value so the race is harmless.
#[derive(Debug)]
pub struct MetadataResolver {
    naming: DatabaseNaming,
    registrations: RwLock<HashMap<TypeId, EntityRegistration>>,
    cache: RwLock<HashMap<TypeId, EntityMetadata>>,
}

impl MetadataResolver {
    pub fn new(naming: DatabaseNaming) -> Self {
        Self {
            naming,
            registrations: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `T`. Re-registering before the first resolution replaces the
    /// previous registration; afterwards the mapping is frozen.
    pub fn register<T: Entity>(&self, registration: EntityRegistration) -> KouchResult<()> {
        let type_id = TypeId::of::<T>();
        if self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&type_id)
        {
            return Err(KouchError::InvalidMetadata(format!(
                "{} is already resolved; register entity types at startup",
                T::TYPE_NAME
            )));
        }
        self.registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(type_id, registration);
        Ok(())
    }

    /// Registers `T` using naming conventions only.
    pub fn register_default<T: Entity>(&self) -> KouchResult<()> {
        self.register::<T>(EntityRegistration::default())
    }

    pub fn is_registered<T: Entity>(&self) -> bool {
        self.registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&TypeId::of::<T>())
    }

    /// Resolves `T`, failing with [`KouchError::MissingMetadata`] when it was
    /// never registered.
    pub fn resolve<T: Entity>(&self) -> KouchResult<EntityMetadata> {
        let type_id = TypeId::of::<T>();
        if let Some(found) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&type_id)
        {
            return Ok(found.clone());
        }

        let registration = self
            .registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&type_id)
            .cloned()
            .ok_or(KouchError::MissingMetadata {
                type_name: T::TYPE_NAME,
            })?;

        let computed = self.compute(T::TYPE_NAME, registration)?;
        debug!(
            "resolved {} -> db={} class={}",
            T::TYPE_NAME,
            computed.database_name,
            computed.class_name
        );

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        Ok(cache.entry(type_id).or_insert(computed).clone())
    }

    fn compute(
        &self,
        type_name: &str,
        registration: EntityRegistration,
    ) -> KouchResult<EntityMetadata> {
        let database_name = match (registration.database_name, &self.naming) {
            (Some(explicit), _) => explicit,
            (None, DatabaseNaming::Predefined { database }) => database.clone(),
            (None, DatabaseNaming::PerType) => DatabaseName::new(camel_to_snake_case(type_name)),
        };
        let class_name = registration
            .class_name
            .unwrap_or_else(|| ClassName::new(type_name));

        if database_name.is_blank() {
            return Err(KouchError::InvalidMetadata(format!(
                "database name is blank for {type_name}"
            )));
        }
        if class_name.is_blank() {
            return Err(KouchError::InvalidMetadata(format!(
                "class name is blank for {type_name}"
            )));
        }

        Ok(EntityMetadata {
            database_name,
            class_name,
        })
    }
}

/// `TestEntity` → `test_entity`. An underscore goes before every upper-case
/// letter that follows a letter.
pub fn camel_to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_alpha = false;
    for c in name.chars() {
        if c.is_ascii_uppercase() && prev_alpha {
            out.push('_');
        }
        out.push(c.to_ascii_lowercase());
        prev_alpha = c.is_ascii_alphabetic();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_case_conversion() {
        assert_eq!(camel_to_snake_case("TestEntity"), "test_entity");
        assert_eq!(camel_to_snake_case("Note"), "note");
        assert_eq!(camel_to_snake_case("userProfile2Data"), "user_profile2data");
        assert_eq!(camel_to_snake_case("ABC"), "a_b_c");
        assert_eq!(camel_to_snake_case(""), "");
    }
}
