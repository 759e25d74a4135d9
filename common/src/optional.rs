//! Tagged presence/value pair used for every optional field that crosses
//! the native boundary.
//!
//! `Option<T>` has no stable C layout, and "unset" has to stay distinct
//! from "set to the default" (`0`, `0.0`, `false` are all valid present
//! values). The native side always receives the full fixed-size pair.
//!
//! Layout: `has_value` at byte 0, `value` at `align_of::<T>()`, the whole
//! slot padded to 8 bytes for every scalar `T`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Optional field with a stable `#[repr(C)]` layout.
#[repr(C, align(8))]
#[derive(Debug, Clone, Copy, Default)]
pub struct OptionalValue<T> {
    pub has_value: bool,
    pub value: T,
}

impl<T: Default> OptionalValue<T> {
    /// An absent value. The payload is zeroed and must not be read.
    pub fn none() -> Self {
        Self {
            has_value: false,
            value: T::default(),
        }
    }
}

impl<T> OptionalValue<T> {
    pub fn some(value: T) -> Self {
        Self {
            has_value: true,
            value,
        }
    }

    pub fn is_some(&self) -> bool {
        self.has_value
    }

    pub fn get(&self) -> Option<&T> {
        if self.has_value {
            Some(&self.value)
        } else {
            None
        }
    }

    pub fn into_option(self) -> Option<T> {
        if self.has_value {
            Some(self.value)
        } else {
            None
        }
    }
}

impl<T: Copy> OptionalValue<T> {
    pub fn copied(&self) -> Option<T> {
        self.get().copied()
    }
}

impl<T: Default> From<Option<T>> for OptionalValue<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Self::some(v),
            None => Self::none(),
        }
    }
}

impl<T> From<OptionalValue<T>> for Option<T> {
    fn from(value: OptionalValue<T>) -> Self {
        value.into_option()
    }
}

// Payloads of absent values are not meaningful and never compared.
impl<T: PartialEq> PartialEq for OptionalValue<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self.has_value, other.has_value) {
            (true, true) => self.value == other.value,
            (false, false) => true,
            _ => false,
        }
    }
}

impl<T: Serialize> Serialize for OptionalValue<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.get().serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de> + Default> Deserialize<'de> for OptionalValue<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<T>::deserialize(deserializer).map(Self::from)
    }
}
