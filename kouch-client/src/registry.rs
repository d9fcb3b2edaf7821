//! Discriminator → decoder table for heterogeneous reads.

use crate::codec::{self, JsonMap};
use crate::error::{KouchError, KouchResult};
use crate::metadata::MetadataResolver;
use kouch_types::{ClassName, Entity};
use std::collections::HashMap;
use std::fmt;

type Decoder<E> = Box<dyn Fn(JsonMap, &str) -> KouchResult<E> + Send + Sync>;

/// Maps class discriminators to decode functions producing `E`.
///
/// Built once per call site from the entity types the caller expects. A
/// document whose discriminator is not in the table fails with
/// [`KouchError::UnknownClass`].
pub struct TypeRegistry<E> {
    decoders: HashMap<ClassName, Decoder<E>>,
    fallback: Option<Box<dyn Fn(JsonMap) -> E + Send + Sync>>,
}

impl<E> Default for TypeRegistry<E> {
    fn default() -> Self {
        Self {
            decoders: HashMap::new(),
            fallback: None,
        }
    }
}

impl<E> fmt::Debug for TypeRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut classes: Vec<_> = self.decoders.keys().map(ClassName::as_str).collect();
        classes.sort_unstable();
        f.debug_struct("TypeRegistry")
            .field("classes", &classes)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl<E: 'static> TypeRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under `class`, wrapping decoded values with `wrap`.
    pub fn insert<T, F>(&mut self, class: ClassName, wrap: F)
    where
        T: Entity,
        F: Fn(T) -> E + Send + Sync + 'static,
    {
        let decoder = move |doc: JsonMap, class_field: &str| {
            codec::decode_entity::<T>(doc, class_field).map(&wrap)
        };
        self.decoders.insert(class, Box::new(decoder));
    }

    /// Builder form of [`insert`](Self::insert) that looks the class up in
    /// `resolver`.
    pub fn with<T, F>(mut self, resolver: &MetadataResolver, wrap: F) -> KouchResult<Self>
    where
        T: Entity,
        F: Fn(T) -> E + Send + Sync + 'static,
    {
        let metadata = resolver.resolve::<T>()?;
        self.insert(metadata.class_name, wrap);
        Ok(self)
    }

    /// Accepts documents of any class through `fallback` instead of
    /// failing with [`KouchError::UnknownClass`]. Registered classes still
    /// take precedence.
    pub fn with_fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(JsonMap) -> E + Send + Sync + 'static,
    {
        self.fallback = Some(Box::new(fallback));
        self
    }

    pub fn contains(&self, class: &str) -> bool {
        self.decoders.contains_key(&ClassName::from(class))
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Decodes a stored document by its discriminator.
    pub fn decode(&self, document: JsonMap, class_field: &str) -> KouchResult<E> {
        let id = codec::id_of(&document).to_string();
        let class = codec::class_of(&document, class_field).ok_or_else(|| {
            KouchError::MissingClassField {
                id: id.clone(),
                field: class_field.to_string(),
            }
        })?;
        match (self.decoders.get(&ClassName::from(class)), &self.fallback) {
            (Some(decoder), _) => decoder(document, class_field),
            (None, Some(fallback)) => Ok(fallback(document)),
            (None, None) => Err(KouchError::UnknownClass {
                class: class.to_string(),
                id,
            }),
        }
    }
}

impl<T: Entity> TypeRegistry<T> {
    /// Registry that decodes one entity type as itself.
    pub fn single(resolver: &MetadataResolver) -> KouchResult<Self> {
        Self::new().with::<T, _>(resolver, |entity| entity)
    }
}
