//! Ordered, identity-indexed collections of cached entities.
//!
//! A `DomainCollection` is the only shape in which the client stores domain
//! records. Entries keep the order the backend sent them in, are indexed by
//! canonical id, and can also be found through the alias recorded when the
//! record was ingested.

use crate::entities::CacheEntity;
use crate::error::{CoreError, CoreResult};
use crate::identity::{canonicalize, EntityId, Identity, ALIAS_FIELD, CANONICAL_FIELD};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct DomainCollection<T> {
    items: Vec<T>,
    /// canonical id -> position in `items`
    index: HashMap<EntityId, usize>,
    /// alias -> canonical id
    aliases: HashMap<EntityId, EntityId>,
}

impl<T> Default for DomainCollection<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
            aliases: HashMap::new(),
        }
    }
}

impl<T: CacheEntity> DomainCollection<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a collection from raw upstream records.
    ///
    /// Records that cannot be identified or decoded are skipped; one bad row
    /// never costs the rest of the collection.
    pub fn from_raw(records: Vec<Value>) -> Self {
        let mut collection = Self::new();
        for record in records {
            if let Err(err) = collection.ingest(record) {
                warn!(domain = %T::DOMAIN, error = %err, "Skipping record during ingestion");
            }
        }
        collection
    }

    /// Canonicalize and insert one raw record, replacing any entry that shares
    /// either of its identifiers.
    pub fn ingest(&mut self, mut record: Value) -> CoreResult<EntityId> {
        let mut identity = canonicalize(&mut record)?;

        // An entry already known under the other identifier keeps its canonical id.
        let existing = self
            .resolve(identity.canonical.as_str())
            .or_else(|| identity.alias.as_ref().and_then(|a| self.resolve(a.as_str())))
            .cloned();
        if let Some(existing) = existing {
            if existing != identity.canonical {
                let previous = std::mem::replace(&mut identity.canonical, existing.clone());
                identity.alias = Some(previous);
                if let Some(object) = record.as_object_mut() {
                    object.insert(
                        CANONICAL_FIELD.to_string(),
                        Value::String(existing.as_str().to_string()),
                    );
                }
            }
        }

        let item: T = serde_json::from_value(record).map_err(|e| CoreError::MalformedRecord {
            domain: T::DOMAIN,
            reason: e.to_string(),
        })?;
        let id = identity.canonical.clone();
        self.insert_with_identity(identity, item);
        Ok(id)
    }

    /// Insert or replace an already-typed entity under its own id.
    pub fn upsert(&mut self, item: T) {
        let identity = Identity::new(item.id().clone());
        self.insert_with_identity(identity, item);
    }

    fn insert_with_identity(&mut self, identity: Identity, item: T) {
        if let Some(&pos) = self.index.get(&identity.canonical) {
            self.items[pos] = item;
        } else {
            self.index.insert(identity.canonical.clone(), self.items.len());
            self.items.push(item);
        }
        if let Some(alias) = identity.alias {
            if alias != identity.canonical {
                self.aliases.insert(alias, identity.canonical);
            }
        }
    }

    /// Map either identifier of an entity to its canonical id.
    pub fn resolve(&self, id: &str) -> Option<&EntityId> {
        let key = EntityId::from(id);
        if let Some((canonical, _)) = self.index.get_key_value(&key) {
            return Some(canonical);
        }
        self.aliases.get(&key)
    }

    fn position(&self, id: &str) -> Option<usize> {
        let canonical = self.resolve(id)?;
        self.index.get(canonical).copied()
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.position(id).map(|pos| &self.items[pos])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        let canonical = self.resolve(id)?.clone();
        let pos = self.index.remove(&canonical)?;
        let item = self.items.remove(pos);
        self.aliases.retain(|_, target| *target != canonical);
        for slot in self.index.values_mut() {
            if *slot > pos {
                *slot -= 1;
            }
        }
        Some(item)
    }

    /// Mutate one entity in place. Returns false when nothing matched.
    pub fn update<F>(&mut self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut T),
    {
        let Some(pos) = self.position(id) else {
            return false;
        };
        let canonical = self.items[pos].id().clone();
        f(&mut self.items[pos]);
        if self.items[pos].id() != &canonical {
            warn!(domain = %T::DOMAIN, id = %canonical, "Update changed entity id; restoring index");
            let renamed = self.items[pos].id().clone();
            self.index.remove(&canonical);
            self.index.insert(renamed.clone(), pos);
            self.aliases.remove(&renamed);
            for target in self.aliases.values_mut() {
                if *target == canonical {
                    *target = renamed.clone();
                }
            }
            self.aliases.insert(canonical, renamed);
        }
        true
    }

    /// Replace only the fields named in `patch` on the entity matching `id`
    /// (canonical id or alias). Identifier fields in the patch are ignored.
    ///
    /// Returns `Ok(false)` without touching anything when no entity matches.
    pub fn merge_patch(&mut self, id: &str, patch: &Map<String, Value>) -> CoreResult<bool> {
        let Some(pos) = self.position(id) else {
            return Ok(false);
        };

        let invalid = |reason: String| CoreError::InvalidPatch {
            domain: T::DOMAIN,
            id: id.to_string(),
            reason,
        };

        let mut value = serde_json::to_value(&self.items[pos]).map_err(|e| invalid(e.to_string()))?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| invalid("entity does not serialize to an object".to_string()))?;
        for (field, patched) in patch {
            if field == CANONICAL_FIELD || field == ALIAS_FIELD {
                continue;
            }
            object.insert(field.clone(), patched.clone());
        }

        let merged: T = serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;
        self.items[pos] = merged;
        Ok(true)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.index.clear();
        self.aliases.clear();
    }
}

impl<T: CacheEntity> FromIterator<T> for DomainCollection<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut collection = Self::new();
        for item in iter {
            collection.upsert(item);
        }
        collection
    }
}
