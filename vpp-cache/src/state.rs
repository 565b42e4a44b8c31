//! Reactive item protocol.
//!
//! Every observed entity is a small live state machine:
//!
//! ```text
//!   Loading ──► Done ◄──┐
//!      │         │      │ (new value)
//!      │         └──────┘
//!      ├──► NotExisting
//!      └──► Error
//! ```
//!
//! `Done`, `NotExisting` and `Error` are terminal for a single load but can be
//! re-entered by a later refresh. Nothing moves back into `Loading` unless a
//! refresh was explicitly requested through [`StateChannel::request_refresh`].

use futures_util::{Stream, StreamExt};
use std::fmt::{self, Display};
use std::future::Future;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use vpp_core::{Alias, DataTags, EntityId, StateError, Tagged, VppError, VppResult};

/// Lifecycle of one observed item, identified by `I`.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemState<I, T> {
    Loading(I),
    NotExisting(I),
    Error(I, VppError),
    Done(T),
}

/// State of an item looked up by its local id.
pub type CacheState<T> = ItemState<EntityId, T>;

/// State of an item looked up through a provider alias.
pub type AliasState<T> = ItemState<Alias, T>;

impl<I, T> ItemState<I, T> {
    /// Build the terminal state for a finished load. `Ok(None)` means the
    /// source authoritatively reported the item as absent.
    pub fn from_result(id: I, result: VppResult<Option<T>>) -> Self {
        match result {
            Ok(Some(value)) => ItemState::Done(value),
            Ok(None) => ItemState::NotExisting(id),
            Err(cause) => ItemState::Error(id, cause),
        }
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            ItemState::Loading(_) => "Loading",
            ItemState::NotExisting(_) => "NotExisting",
            ItemState::Error(..) => "Error",
            ItemState::Done(_) => "Done",
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, ItemState::Loading(_))
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_loading()
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            ItemState::Done(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            ItemState::Done(value) => Some(value),
            _ => None,
        }
    }

    /// The id carried by non-`Done` states.
    pub fn id(&self) -> Option<&I> {
        match self {
            ItemState::Loading(id) | ItemState::NotExisting(id) | ItemState::Error(id, _) => {
                Some(id)
            }
            ItemState::Done(_) => None,
        }
    }

    pub fn map<U, F>(self, f: F) -> ItemState<I, U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            ItemState::Loading(id) => ItemState::Loading(id),
            ItemState::NotExisting(id) => ItemState::NotExisting(id),
            ItemState::Error(id, cause) => ItemState::Error(id, cause),
            ItemState::Done(value) => ItemState::Done(f(value)),
        }
    }

    /// Whether `next` may follow `self`.
    ///
    /// Moving into `Loading` from a terminal state needs an explicit refresh.
    /// `Loading -> Loading` is never emitted.
    pub fn can_transition_to(&self, next: &ItemState<I, T>, refresh_requested: bool) -> bool {
        match (self.is_loading(), next.is_loading()) {
            (_, false) => true,
            (true, true) => false,
            (false, true) => refresh_requested,
        }
    }
}

impl<I: Display, T> Display for ItemState<I, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemState::Loading(id) => write!(f, "Loading({})", id),
            ItemState::NotExisting(id) => write!(f, "NotExisting({})", id),
            ItemState::Error(id, cause) => write!(f, "Error({}: {})", id, cause),
            ItemState::Done(_) => f.write_str("Done"),
        }
    }
}

// ============================================================================
// STATE CHANNEL
// ============================================================================

/// Replay-last-value broadcast of one item's state.
///
/// New subscribers see the current state first, then every later change.
/// Slow subscribers may skip intermediate states but never see them out of
/// order.
#[derive(Debug)]
pub struct StateChannel<I, T> {
    id: I,
    tx: watch::Sender<ItemState<I, T>>,
}

impl<I, T> StateChannel<I, T>
where
    I: Clone + Display + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// A channel sitting in its initial `Loading` state.
    pub fn new(id: I) -> Self {
        let (tx, _rx) = watch::channel(ItemState::Loading(id.clone()));
        Self { id, tx }
    }

    pub fn id(&self) -> &I {
        &self.id
    }

    pub fn current(&self) -> ItemState<I, T> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ItemState<I, T>> {
        self.tx.subscribe()
    }

    /// Stream of states starting with the current one.
    pub fn stream(&self) -> WatchStream<ItemState<I, T>> {
        WatchStream::new(self.tx.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish a terminal state.
    pub fn resolve(&self, next: ItemState<I, T>) -> VppResult<()> {
        if next.is_loading() {
            let from = self.tx.borrow().variant_name();
            return Err(StateError::IllegalTransition {
                id: self.id.to_string(),
                from,
                to: "Loading",
            }
            .into());
        }
        self.tx.send_replace(next);
        Ok(())
    }

    /// Enter `Loading` ahead of a forced refresh.
    ///
    /// Returns `false` if the item was already loading.
    pub fn request_refresh(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if state.is_loading() {
                false
            } else {
                *state = ItemState::Loading(self.id.clone());
                true
            }
        })
    }
}

// ============================================================================
// FIRST VALUE
// ============================================================================

/// Await the first `Done` value carrying all of `required`.
///
/// `NotExisting` and `Error` become errors. A stream that ends first is an
/// error too: [`StateError::MissingRequiredTag`] if a `Done` was seen without
/// the required tags, [`StateError::StreamEnded`] otherwise.
pub async fn get_first_value<S, I, T>(stream: S, required: DataTags) -> VppResult<T>
where
    S: Stream<Item = ItemState<I, T>>,
    I: Display,
    T: Tagged,
{
    let mut stream = std::pin::pin!(stream);
    let mut last_id: Option<String> = None;
    let mut missing: Option<DataTags> = None;

    while let Some(state) = stream.next().await {
        match state {
            ItemState::Loading(id) => last_id = Some(id.to_string()),
            ItemState::Done(value) => {
                if value.has_tags(required) {
                    return Ok(value);
                }
                missing = Some(value.tags().missing_from(required));
            }
            ItemState::NotExisting(id) => {
                return Err(StateError::NotExisting { id: id.to_string() }.into());
            }
            ItemState::Error(_, cause) => return Err(cause),
        }
    }

    let id = last_id.unwrap_or_else(|| "<unknown>".to_string());
    Err(match missing {
        Some(missing) => StateError::MissingRequiredTag { id, missing },
        None => StateError::StreamEnded { id },
    }
    .into())
}

/// Method form of [`get_first_value`] for state streams.
pub trait StateStreamExt<I, T>: Stream<Item = ItemState<I, T>> + Sized {
    fn get_first_value(self, required: DataTags) -> impl Future<Output = VppResult<T>>
    where
        I: Display,
        T: Tagged,
    {
        get_first_value(self, required)
    }
}

impl<S, I, T> StateStreamExt<I, T> for S where S: Stream<Item = ItemState<I, T>> {}
