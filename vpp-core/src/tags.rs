//! Provenance tags carried by cached values

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Where a value has been confirmed from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DataTags: u8 {
        /// Value was read from the local store
        const LOCAL = 0b0000_0001;
        /// Value was confirmed by a remote fetch in this process
        const REMOTE = 0b0000_0010;
    }
}

impl Default for DataTags {
    fn default() -> Self {
        Self::empty()
    }
}

impl DataTags {
    /// Tags in `required` that `self` does not carry.
    pub fn missing_from(self, required: DataTags) -> DataTags {
        required.difference(self)
    }
}

// Manual serde implementation for DataTags (bitflags 2.x + serde)
impl Serialize for DataTags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DataTags {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u8::deserialize(deserializer)?;
        Self::from_bits(bits).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid DataTags bits: {:#04x}", bits))
        })
    }
}

/// A payload that exposes its provenance tags.
pub trait Tagged {
    fn tags(&self) -> DataTags;

    fn has_tags(&self, required: DataTags) -> bool {
        self.tags().contains(required)
    }
}
