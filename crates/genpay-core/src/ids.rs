//! Identifier types for genpay.
//!
//! User and chat identifiers are the integers handed to us by the chat
//! platform. Task identifiers are opaque strings chosen by the caller when a
//! paid action starts; the same key addresses the reservation and the job.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Macro to define an integer identifier type with standard trait implementations.
///
/// Generates a newtype around `i64` with `Serialize`/`Deserialize` (as a plain
/// integer), `FromStr`, `Display`, `Debug` and `TryFrom<i64>`. The `$check`
/// closure decides which raw values are acceptable.
macro_rules! int_id_type {
    ($name:ident, $doc:expr, $check:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "i64", into = "i64")]
        pub struct $name(i64);

        impl $name {
            /// Create a new identifier, validating the raw value.
            ///
            /// # Errors
            ///
            /// Returns `IdError` if the value is not acceptable for this identifier.
            pub fn new(value: i64) -> Result<Self, IdError> {
                let check: fn(i64) -> Result<(), IdError> = $check;
                check(value)?;
                Ok(Self(value))
            }

            /// Return the raw integer value.
            #[must_use]
            pub const fn get(&self) -> i64 {
                self.0
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let value = s
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| IdError::NotAnInteger(s.to_string()))?;
                Self::new(value)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl TryFrom<i64> for $name {
            type Error = IdError;

            fn try_from(value: i64) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

int_id_type!(
    UserId,
    "A user identifier.\n\nUser IDs are positive integers assigned by the chat platform.",
    |value| {
        if value > 0 {
            Ok(())
        } else {
            Err(IdError::NonPositive(value))
        }
    }
);

int_id_type!(
    ChatId,
    "A chat identifier.\n\nGroup chats use negative identifiers, so any value except zero is accepted.",
    |value| {
        if value == 0 {
            Err(IdError::NonPositive(value))
        } else {
            Ok(())
        }
    }
);

/// A task identifier.
///
/// Task IDs key both the reservation and the job record for one paid action,
/// so they must be stable across retries. Surrounding whitespace is trimmed and
/// empty values are rejected.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    /// Create a new `TaskId`.
    ///
    /// # Errors
    ///
    /// Returns `IdError::Empty` if the value is blank.
    pub fn new(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(IdError::Empty);
        }
        if trimmed.len() == value.len() {
            Ok(Self(value))
        } else {
            Ok(Self(trimmed.to_string()))
        }
    }

    /// Return the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for TaskId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TaskId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The identifier must be a positive (or non-zero) integer.
    #[error("identifier must be positive, got {0}")]
    NonPositive(i64),

    /// The input is not an integer.
    #[error("identifier is not an integer: {0:?}")]
    NotAnInteger(String),

    /// The identifier is empty or whitespace.
    #[error("identifier is empty")]
    Empty,
}
