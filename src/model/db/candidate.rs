use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::model::mongodb::Id;

/// Core candidate data, as stored in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateCore {
    /// The position this candidate runs for. Must reference an active position.
    pub position_id: Id,
    /// Display name.
    pub name: String,
    /// Optional affiliation (e.g. partylist).
    pub affiliation_id: Option<Id>,
    /// Free-text platform shown on the ballot.
    pub platform: String,
    /// Photo reference, managed by the administrative layer.
    pub photo: Option<String>,
    /// Inactive candidates never appear on ballots and cannot be voted for.
    pub active: bool,
}

/// A candidate from the database, with their unique ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub candidate: CandidateCore,
}

impl Deref for Candidate {
    type Target = CandidateCore;

    fn deref(&self) -> &Self::Target {
        &self.candidate
    }
}

#[cfg(test)]
mod examples {
    use super::*;

    impl Candidate {
        pub fn running_for(position_id: Id) -> Self {
            Self {
                id: Id::new(),
                candidate: CandidateCore {
                    position_id,
                    name: "Sam Cruz".to_string(),
                    affiliation_id: None,
                    platform: "Better canteen queues".to_string(),
                    photo: None,
                    active: true,
                },
            }
        }
    }
}
