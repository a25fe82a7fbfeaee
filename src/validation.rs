//! Structural validation of inbound payloads.
//!
//! Every externally supplied field is checked here before any business logic
//! runs. Checks are pure; a malformed payload is rejected as a whole with a
//! single aggregated [`Error::Validation`] listing every offending field.

use serde::Serialize;

use crate::error::{Error, Result};
use crate::model::db::SessionToken;
use crate::model::mongodb::Id;

/// Longest accepted voter identifier.
pub const MAX_IDENTIFIER_LENGTH: usize = 32;

/// A single violated field within a rejected payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Accumulates field errors across a whole payload, so the caller sees every
/// violation at once rather than fixing them one round-trip at a time.
#[derive(Debug, Default)]
pub struct Validator {
    errors: Vec<FieldError>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a violation against the named field.
    pub fn reject(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.to_string(),
            message: message.into(),
        });
    }

    /// Record a violation unless `ok` holds.
    pub fn require(&mut self, field: &str, ok: bool, message: &str) {
        if !ok {
            self.reject(field, message);
        }
    }

    /// Check an externally presented voter identifier: non-empty, bounded
    /// length, restricted character set.
    pub fn identifier(&mut self, field: &str, value: &str) {
        if value.is_empty() {
            self.reject(field, "must not be empty");
        } else if value.len() > MAX_IDENTIFIER_LENGTH {
            self.reject(
                field,
                format!("must be at most {MAX_IDENTIFIER_LENGTH} characters"),
            );
        } else if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            self.reject(field, "may only contain letters, digits and '-'");
        }
    }

    /// Check and parse a database object ID.
    pub fn object_id(&mut self, field: &str, value: &str) -> Option<Id> {
        match value.parse::<Id>() {
            Ok(id) => Some(id),
            Err(_) => {
                self.reject(field, "is not a valid ID");
                None
            }
        }
    }

    /// Check the shape of a session token. Shape only: whether the token
    /// matches a live session is the commit protocol's business.
    pub fn token(&mut self, field: &str, value: &str) {
        if value.len() != SessionToken::LENGTH
            || !value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            self.reject(field, "is not a well-formed session token");
        }
    }

    /// Succeed iff no violation was recorded.
    pub fn finish(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self.errors))
        }
    }
}
