use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::model::{common::ballot::VoteSpec, mongodb::Id};

/// Core vote data, as stored in the database.
///
/// The full vote set for a given (election, voter) is written exactly once,
/// by the commit protocol, inside the same transaction that completes the
/// voting session. A unique index on (election_id, voter_id, position_id,
/// candidate_id) backstops the session transition against double writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteCore {
    pub election_id: Id,
    pub voter_id: Id,
    pub position_id: Id,
    pub candidate_id: Id,
}

impl VoteCore {
    /// Build the vote row for one ballot selection.
    pub fn new(election_id: Id, voter_id: Id, spec: VoteSpec) -> Self {
        Self {
            election_id,
            voter_id,
            position_id: spec.position_id,
            candidate_id: spec.candidate_id,
        }
    }
}

/// A vote without an ID, ready for insertion.
pub type NewVote = VoteCore;

/// A vote from the database, with its unique ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub vote: VoteCore,
}

impl Deref for Vote {
    type Target = VoteCore;

    fn deref(&self) -> &Self::Target {
        &self.vote
    }
}
