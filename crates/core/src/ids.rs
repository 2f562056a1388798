use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::error::{SyncError, SyncResult};

// Numeric ids share one shape so the wire and the engine agree on parsing rules.
macro_rules! define_numeric_id {
    ($(#[$meta:meta])* $name:ident, $id_type:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub fn parse(raw: &str) -> SyncResult<Self> {
                let trimmed = raw.trim();
                trimmed
                    .parse::<u64>()
                    .map(Self)
                    .map_err(|source| SyncError::invalid_id($id_type, trimmed, &source))
            }

            pub const fn get(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = SyncError;

            fn from_str(raw: &str) -> SyncResult<Self> {
                Self::parse(raw)
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_u64(self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                deserializer
                    .deserialize_any(NumericIdVisitor { id_type: $id_type })
                    .map(Self)
            }
        }
    };
}

/// Accepts either a JSON number or a numeric string; servers are not consistent about which.
struct NumericIdVisitor {
    id_type: &'static str,
}

impl Visitor<'_> for NumericIdVisitor {
    type Value = u64;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "a non-negative integer {}", self.id_type)
    }

    fn visit_u64<E>(self, value: u64) -> Result<u64, E>
    where
        E: de::Error,
    {
        Ok(value)
    }

    fn visit_i64<E>(self, value: i64) -> Result<u64, E>
    where
        E: de::Error,
    {
        u64::try_from(value).map_err(|_| E::invalid_value(de::Unexpected::Signed(value), &self))
    }

    fn visit_str<E>(self, value: &str) -> Result<u64, E>
    where
        E: de::Error,
    {
        value
            .trim()
            .parse::<u64>()
            .map_err(|_| E::invalid_value(de::Unexpected::Str(value), &self))
    }
}

define_numeric_id!(
    /// Server-assigned conversation identifier. Immutable once created.
    ConversationId,
    "conversation-id"
);
define_numeric_id!(
    /// Identifier of one physical connection handle.
    ///
    /// A new one is minted for every open so events from a torn-down handle can be told apart.
    ConnectionId,
    "connection-id"
);
define_numeric_id!(
    /// Cancel token returned by a scheduler for one pending timer.
    TimerToken,
    "timer-token"
);
define_numeric_id!(
    /// Ticket for one in-flight history page request.
    PageTicket,
    "page-ticket"
);
