//! Permanent record identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Storage-assigned identity of a persisted record.
///
/// Permanent IDs are 128-bit UUIDs handed out by a
/// [`StoreEngine`](crate::StoreEngine). Once a record has one, every context
/// can refer to the same logical entity by it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PermanentId([u8; 16]);

impl PermanentId {
    /// Creates a permanent ID from raw bytes.
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generates a fresh random ID.
    ///
    /// Only engines should call this; application code receives IDs through
    /// commits.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// Returns the raw bytes.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Converts to a UUID.
    #[must_use]
    pub fn to_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.0)
    }
}

impl fmt::Debug for PermanentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PermanentId({})", self.to_uuid())
    }
}

impl fmt::Display for PermanentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uuid())
    }
}

impl From<Uuid> for PermanentId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(PermanentId::generate(), PermanentId::generate());
    }

    #[test]
    fn uuid_conversion() {
        let uuid = Uuid::new_v4();
        let id = PermanentId::from(uuid);
        assert_eq!(id.to_uuid(), uuid);
        assert_eq!(id.to_string(), uuid.to_string());
    }

    #[test]
    fn ordering_follows_bytes() {
        let low = PermanentId::from_bytes([0; 16]);
        let high = PermanentId::from_bytes([1; 16]);
        assert!(low < high);
    }
}
