//! Error types for VPP cache operations

use crate::tags::DataTags;
use thiserror::Error;
use uuid::Uuid;

/// Remote fetch failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Network failure talking to {provider}: {reason}")]
    Network { provider: String, reason: String },

    #[error("Request to {provider} failed with status {status}: {message}")]
    Status {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("Could not parse response from {provider}: {reason}")]
    Parse { provider: String, reason: String },

    #[error("Credentials rejected by {provider}")]
    Unauthorized { provider: String },
}

/// Local store failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Read failed for {id}: {reason}")]
    ReadFailed { id: String, reason: String },

    #[error("Write failed for {id}: {reason}")]
    WriteFailed { id: String, reason: String },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Refresh coordination failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error("Refresh of {entity_id} was cancelled")]
    Cancelled { entity_id: String },

    #[error("Refresh task for {entity_id} failed: {reason}")]
    TaskFailed { entity_id: String, reason: String },

    #[error("Refresh registry lock poisoned")]
    LockPoisoned,
}

/// Failures surfaced by the reactive item protocol.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("Entity {id} does not exist")]
    NotExisting { id: String },

    #[error("Entity {id} resolved without required tags {missing:?}")]
    MissingRequiredTag { id: String, missing: DataTags },

    #[error("Stream for {id} completed without a terminal state")]
    StreamEnded { id: String },

    #[error("Illegal transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Unknown eviction policy: {value}")]
    UnknownEvictionPolicy { value: String },
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Alias {alias} already belongs to {existing}, cannot attach to {requested}")]
    AliasConflict {
        alias: String,
        existing: Uuid,
        requested: Uuid,
    },

    #[error("Alias set for {local_id} is empty")]
    EmptyAliasSet { local_id: Uuid },
}

/// Master error type for all VPP cache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VppError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Refresh error: {0}")]
    Refresh(#[from] RefreshError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl VppError {
    /// Whether this error stems from an explicit or propagated cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, VppError::Refresh(RefreshError::Cancelled { .. }))
    }
}

/// Result type alias for VPP cache operations.
pub type VppResult<T> = Result<T, VppError>;

// =============================================================================
// TESTS
// =============================================================================
