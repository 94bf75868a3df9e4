//! Parameter access flags
//!
//! Mirrors the `access` bitmask zigbee2mqtt attaches to every exposed feature.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// What can be done with a parameter.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Access: u8 {
        /// The device reports the value in its state messages
        const PUBLISHED = 0b001;
        /// The value can be written with `/set`
        const SETTABLE = 0b010;
        /// The value can be requested with `/get`
        const QUERYABLE = 0b100;
    }
}

impl Access {
    /// Everything a fully featured parameter supports
    pub const ALL: Access = Access::all();

    pub fn is_settable(self) -> bool {
        self.contains(Access::SETTABLE)
    }

    pub fn is_queryable(self) -> bool {
        self.contains(Access::QUERYABLE)
    }
}

impl From<u8> for Access {
    fn from(bits: u8) -> Self {
        Access::from_bits_truncate(bits)
    }
}
