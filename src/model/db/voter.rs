use std::ops::Deref;

use mongodb::{bson::doc, options::FindOneOptions};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::mongodb::{Coll, Id};

/// Core voter identity data, as stored in the database.
///
/// Created by the administrative import and never mutated by the voting flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterCore {
    /// Externally presented identifier, e.g. a student number.
    pub student_number: String,
    /// Display name.
    pub name: String,
    /// Eligibility class, e.g. a grade level.
    pub class_level: u8,
}

/// A voter from the database, with their unique ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voter {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub voter: VoterCore,
}

impl Voter {
    /// Resolve a presented identifier to a voter record.
    ///
    /// Duplicate `student_number` rows must not cause a failure: we always
    /// return the first match by ascending `_id`, deterministically.
    pub async fn lookup(voters: &Coll<Voter>, student_number: &str) -> Result<Option<Voter>> {
        let options = FindOneOptions::builder().sort(doc! { "_id": 1 }).build();
        let voter = voters
            .find_one(doc! { "student_number": student_number }, options)
            .await?;
        Ok(voter)
    }
}

impl Deref for Voter {
    type Target = VoterCore;

    fn deref(&self) -> &Self::Target {
        &self.voter
    }
}

/// Example data for tests.
#[cfg(test)]
mod examples {
    use super::*;

    impl VoterCore {
        pub fn example() -> Self {
            Self {
                student_number: "2023-00123".to_string(),
                name: "Alex Reyes".to_string(),
                class_level: 10,
            }
        }
    }

    impl Voter {
        pub fn example() -> Self {
            Self {
                id: Id::new(),
                voter: VoterCore::example(),
            }
        }
    }
}
