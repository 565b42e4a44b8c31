//! Nested relations and fetch-configuration satisfaction.
//!
//! A composite entity holds its relations as [`Cacheable`] slots. A caller
//! describes the relations it needs with a [`FetchConfiguration`]; the
//! satisfaction check walks both together:
//!
//! 1. `Ignore` is always satisfied.
//! 2. `Uninitialized` is never satisfied: the relation was not requested yet.
//! 3. `Loading`, `Error` and `NotExisting` are satisfied iff `allow_loading`.
//! 4. `Loaded(value)` delegates to the value, which ANDs over the relations
//!    its `Fetch` names.

use vpp_core::{EntityId, VppError};

/// Which relations of a type must be resolved.
///
/// `F` is the type's own fetch description, usually a struct with one
/// `FetchConfiguration` per nested relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchConfiguration<F> {
    Ignore,
    Fetch(F),
}

impl<F> Default for FetchConfiguration<F> {
    fn default() -> Self {
        FetchConfiguration::Ignore
    }
}

impl<F> FetchConfiguration<F> {
    pub fn is_ignore(&self) -> bool {
        matches!(self, FetchConfiguration::Ignore)
    }

    pub fn as_fetch(&self) -> Option<&F> {
        match self {
            FetchConfiguration::Ignore => None,
            FetchConfiguration::Fetch(fetch) => Some(fetch),
        }
    }
}

/// Types that can judge whether they meet a fetch description.
pub trait ConfigSatisfaction {
    type Fetch: Clone + Send + Sync + 'static;

    fn is_config_satisfied(&self, fetch: &Self::Fetch, allow_loading: bool) -> bool;
}

/// A relation slot inside a composite entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Cacheable<T> {
    /// Known to exist, never requested.
    Uninitialized(EntityId),
    /// Requested; `progress` holds a partially hydrated value if one exists.
    Loading { id: EntityId, progress: Option<T> },
    Loaded(T),
    NotExisting(EntityId),
    Error { id: EntityId, cause: VppError },
}

impl<T> Cacheable<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Cacheable::Loaded(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Cacheable::Loaded(_))
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            Cacheable::Uninitialized(_) => "Uninitialized",
            Cacheable::Loading { .. } => "Loading",
            Cacheable::Loaded(_) => "Loaded",
            Cacheable::NotExisting(_) => "NotExisting",
            Cacheable::Error { .. } => "Error",
        }
    }
}

impl<T: crate::traits::CacheableEntity> Cacheable<T> {
    pub fn get_item_id(&self) -> EntityId {
        match self {
            Cacheable::Uninitialized(id)
            | Cacheable::Loading { id, .. }
            | Cacheable::NotExisting(id)
            | Cacheable::Error { id, .. } => id.clone(),
            Cacheable::Loaded(value) => value.entity_id(),
        }
    }
}

impl<T: ConfigSatisfaction> Cacheable<T> {
    pub fn is_config_satisfied(
        &self,
        configuration: &FetchConfiguration<T::Fetch>,
        allow_loading: bool,
    ) -> bool {
        let FetchConfiguration::Fetch(fetch) = configuration else {
            return true;
        };
        match self {
            Cacheable::Uninitialized(_) => false,
            Cacheable::Loading { .. } | Cacheable::NotExisting(_) | Cacheable::Error { .. } => {
                allow_loading
            }
            Cacheable::Loaded(value) => value.is_config_satisfied(fetch, allow_loading),
        }
    }
}

/// Satisfaction check for a root value that is already in hand.
pub fn is_config_satisfied<T: ConfigSatisfaction>(
    value: &T,
    configuration: &FetchConfiguration<T::Fetch>,
    allow_loading: bool,
) -> bool {
    match configuration {
        FetchConfiguration::Ignore => true,
        FetchConfiguration::Fetch(fetch) => value.is_config_satisfied(fetch, allow_loading),
    }
}
