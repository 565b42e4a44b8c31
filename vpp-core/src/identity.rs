//! Identity types for cached entities
//!
//! Two identity shapes exist side by side:
//!
//! - **Owned ids** for items this application authors itself (integer or
//!   composed string keys).
//! - **Surrogate ids** for items mirrored from an external provider. The local
//!   surrogate is a UUIDv7; the provider's own identifiers are kept as
//!   [`Alias`]es and resolved through an [`AliasIndex`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ValidationError;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 surrogate id (timestamp-sortable).
pub fn new_surrogate_id() -> Uuid {
    Uuid::now_v7()
}

// ============================================================================
// ENTITY ID
// ============================================================================

/// Stable identity of a cached item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityId {
    /// Locally owned item with an integer key.
    Int(i64),
    /// Locally owned item with a composed string key.
    Key(String),
    /// Provider-mirrored item identified by its local surrogate.
    Surrogate(Uuid),
}

impl EntityId {
    /// Composed string key, e.g. `EntityId::composed(["profile", "12"])` -> `key:profile/12`.
    pub fn composed<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = parts
            .into_iter()
            .map(|p| p.as_ref().to_string())
            .collect::<Vec<_>>()
            .join("/");
        EntityId::Key(joined)
    }

    /// The surrogate UUID, if this id carries one.
    pub fn as_surrogate(&self) -> Option<Uuid> {
        match self {
            EntityId::Surrogate(id) => Some(*id),
            _ => None,
        }
    }

    /// Whether this id can have provider aliases attached.
    pub fn is_alias_bearing(&self) -> bool {
        matches!(self, EntityId::Surrogate(_))
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        EntityId::Int(value)
    }
}

impl From<Uuid> for EntityId {
    fn from(value: Uuid) -> Self {
        EntityId::Surrogate(value)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        EntityId::Key(value.to_string())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Int(id) => write!(f, "int:{}", id),
            EntityId::Key(key) => write!(f, "key:{}", key),
            EntityId::Surrogate(id) => write!(f, "uuid:{}", id),
        }
    }
}

impl FromStr for EntityId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ValidationError::InvalidValue {
            field: "entity_id".to_string(),
            reason: format!("{}: {}", reason, s),
        };

        let (kind, rest) = s.split_once(':').ok_or_else(|| invalid("missing kind prefix"))?;
        match kind {
            "int" => rest
                .parse::<i64>()
                .map(EntityId::Int)
                .map_err(|_| invalid("not an integer")),
            "key" if !rest.is_empty() => Ok(EntityId::Key(rest.to_string())),
            "key" => Err(invalid("empty key")),
            "uuid" => Uuid::parse_str(rest)
                .map(EntityId::Surrogate)
                .map_err(|_| invalid("not a uuid")),
            _ => Err(invalid("unknown kind prefix")),
        }
    }
}

// ============================================================================
// ALIASES
// ============================================================================

/// External system that hands out its own identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AliasProvider {
    /// The vpp.ID backend.
    Vpp,
    /// Indiware stundenplan24 timetables.
    Sp24,
    /// Schulverwalter grade book.
    Schulverwalter,
    /// Any other provider, named by the integration.
    Custom(String),
}

impl AliasProvider {
    pub fn as_str(&self) -> &str {
        match self {
            AliasProvider::Vpp => "vpp",
            AliasProvider::Sp24 => "sp24",
            AliasProvider::Schulverwalter => "schulverwalter",
            AliasProvider::Custom(name) => name,
        }
    }
}

impl fmt::Display for AliasProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider-local identifier for an entity.
///
/// Equality includes the schema `version`; resolution through
/// [`AliasIndex`] does not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Alias {
    pub provider: AliasProvider,
    pub value: String,
    pub version: u32,
}

impl Alias {
    pub fn new(provider: AliasProvider, value: impl Into<String>, version: u32) -> Self {
        Self {
            provider,
            value: value.into(),
            version,
        }
    }

    /// The part of the alias that identifies the remote entity.
    pub fn lookup_key(&self) -> (AliasProvider, String) {
        (self.provider.clone(), self.value.clone())
    }

    /// String key naming this alias's `(provider, value)` pair, distinct for
    /// distinct pairs. Custom providers are tagged and length-prefixed so
    /// neither a built-in name nor a colon in the name can collide.
    pub fn coordination_key(&self) -> String {
        match &self.provider {
            AliasProvider::Custom(name) => {
                format!("alias:custom:{}:{}:{}", name.len(), name, self.value)
            }
            builtin => format!("alias:{}:{}", builtin.as_str(), self.value),
        }
    }
}

impl fmt::Display for Alias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@v{}", self.provider, self.value, self.version)
    }
}

/// Maps `(provider, value)` to local surrogate ids.
///
/// A `(provider, value)` pair belongs to at most one local id. Registering the
/// same pair again for the same id is a no-op; registering it for a different
/// id is rejected.
#[derive(Debug, Clone, Default)]
pub struct AliasIndex {
    by_alias: HashMap<(AliasProvider, String), Uuid>,
    by_id: HashMap<Uuid, BTreeSet<Alias>>,
}

impl AliasIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `aliases` to `local_id`.
    ///
    /// Validates the whole batch before mutating, so a conflict leaves the
    /// index untouched.
    pub fn register<I>(&mut self, local_id: Uuid, aliases: I) -> Result<(), ValidationError>
    where
        I: IntoIterator<Item = Alias>,
    {
        let aliases: Vec<Alias> = aliases.into_iter().collect();
        if aliases.is_empty() {
            return Err(ValidationError::EmptyAliasSet { local_id });
        }

        for alias in &aliases {
            if let Some(existing) = self.by_alias.get(&alias.lookup_key()) {
                if *existing != local_id {
                    return Err(ValidationError::AliasConflict {
                        alias: alias.to_string(),
                        existing: *existing,
                        requested: local_id,
                    });
                }
            }
        }

        let known = self.by_id.entry(local_id).or_default();
        for alias in aliases {
            // Same (provider, value) under a newer schema version replaces the old one.
            known.retain(|a| a.lookup_key() != alias.lookup_key());
            self.by_alias.insert(alias.lookup_key(), local_id);
            known.insert(alias);
        }
        Ok(())
    }

    /// Resolve a provider identifier to the local surrogate.
    pub fn resolve(&self, provider: &AliasProvider, value: &str) -> Option<Uuid> {
        self.by_alias
            .get(&(provider.clone(), value.to_string()))
            .copied()
    }

    /// Resolve an alias, ignoring its version.
    pub fn resolve_alias(&self, alias: &Alias) -> Option<Uuid> {
        self.resolve(&alias.provider, &alias.value)
    }

    /// All aliases known for a local id.
    pub fn aliases_of(&self, local_id: Uuid) -> Vec<Alias> {
        self.by_id
            .get(&local_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget a local id and every alias pointing at it.
    pub fn remove(&mut self, local_id: Uuid) -> usize {
        let Some(aliases) = self.by_id.remove(&local_id) else {
            return 0;
        };
        for alias in &aliases {
            self.by_alias.remove(&alias.lookup_key());
        }
        aliases.len()
    }

    pub fn len(&self) -> usize {
        self.by_alias.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_alias.is_empty()
    }
}

// =============================================================================
// TESTS
// =============================================================================
