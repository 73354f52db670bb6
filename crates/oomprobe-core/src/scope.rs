//! Opaque classification values carried through the callback contract.
//!
//! Both types are transparent `u32` wrappers so they match the C enum layout
//! of the callback signatures. The tracker stores them with each record and
//! hands them back through introspection, but never branches on them.

use serde::{Deserialize, Serialize};

/// Lifetime class the caller attaches to an allocation request.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SystemAllocationScope(pub u32);

impl SystemAllocationScope {
    pub const COMMAND: Self = Self(0);
    pub const OBJECT: Self = Self(1);
    pub const CACHE: Self = Self(2);
    pub const DEVICE: Self = Self(3);
    pub const INSTANCE: Self = Self(4);

    /// Raw value as passed over the C boundary.
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

/// Kind of memory the client reports through the internal notifications.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InternalAllocationType(pub u32);

impl InternalAllocationType {
    pub const EXECUTABLE: Self = Self(0);

    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}
