//! Device identity and validation.

use serde::{Deserialize, Serialize};

/// Identifier printed on a rental device (scooter, e-bike).
///
/// Fleet identifiers are numeric strings. Validation accepts any non-empty
/// run of ASCII digits and runs before the first charge, so a malformed id
/// never reaches the metering gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Parse and validate a device identifier.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceIdError`] if `raw` is empty or contains any
    /// character outside `0-9`.
    pub fn parse(raw: &str) -> Result<Self, DeviceIdError> {
        if raw.is_empty() {
            return Err(DeviceIdError::Empty);
        }
        if let Some(found) = raw.chars().find(|c| !c.is_ascii_digit()) {
            return Err(DeviceIdError::NonDigit {
                raw: raw.to_string(),
                found,
            });
        }
        Ok(Self(raw.to_string()))
    }

    /// Returns the identifier string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Device identifier validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceIdError {
    /// Identifier was empty.
    #[error("device id must not be empty")]
    Empty,

    /// Identifier contained a character outside `0-9`.
    #[error("device id {raw:?} contains non-digit character {found:?}")]
    NonDigit {
        /// The rejected identifier.
        raw: String,
        /// First offending character.
        found: char,
    },
}
