//! Inbound request bodies.
//!
//! Each operation has an explicit request struct carrying raw strings, plus a
//! `validate` step producing a typed payload. Nothing downstream ever sees an
//! unvalidated field.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{
    common::ballot::VoteSpec,
    db::SessionToken,
    mongodb::Id,
};
use crate::validation::Validator;

/// `POST /verify`: begin a voting attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyRequest {
    /// Externally presented voter identifier, e.g. a student number.
    pub identifier: String,
}

impl VerifyRequest {
    pub fn validate(&self) -> Result<()> {
        let mut v = Validator::new();
        v.identifier("identifier", &self.identifier);
        v.finish()
    }
}

/// Validated parameters of `GET /elections/<election_id>/ballot`.
#[derive(Debug, Clone)]
pub struct BallotQuery {
    pub election_id: Id,
    pub voter_id: Id,
    pub token: SessionToken,
}

impl BallotQuery {
    pub fn validate(election_id: &str, voter_id: &str, token: &str) -> Result<Self> {
        let mut v = Validator::new();
        let election_id = v.object_id("election_id", election_id);
        let voter_id = v.object_id("voter_id", voter_id);
        v.token("token", token);
        v.finish()?;
        Ok(Self {
            // Valid because `finish` succeeded, so both IDs parsed.
            election_id: election_id.unwrap(),
            voter_id: voter_id.unwrap(),
            token: SessionToken::from_presented(token),
        })
    }
}

/// One selection within a submitted ballot, as sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteSpecRequest {
    pub candidate_id: String,
    pub position_id: String,
}

/// `POST /elections/<election_id>/votes`: commit a ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub voter_id: String,
    pub token: String,
    pub votes: Vec<VoteSpecRequest>,
}

/// A fully validated submission, ready for the commit protocol.
#[derive(Debug, Clone)]
pub struct SubmitPayload {
    pub election_id: Id,
    pub voter_id: Id,
    pub token: SessionToken,
    pub votes: Vec<VoteSpec>,
}

impl SubmitRequest {
    /// Validate the whole submission, including the path's election ID, and
    /// report every malformed field at once.
    pub fn validate(&self, election_id: &str) -> Result<SubmitPayload> {
        let mut v = Validator::new();
        let election_id = v.object_id("election_id", election_id);
        let voter_id = v.object_id("voter_id", &self.voter_id);
        v.token("token", &self.token);
        v.require(
            "votes",
            !self.votes.is_empty(),
            "ballot must contain at least one selection",
        );
        let mut votes = Vec::with_capacity(self.votes.len());
        for (index, spec) in self.votes.iter().enumerate() {
            let candidate_id =
                v.object_id(&format!("votes[{index}].candidate_id"), &spec.candidate_id);
            let position_id =
                v.object_id(&format!("votes[{index}].position_id"), &spec.position_id);
            if let (Some(candidate_id), Some(position_id)) = (candidate_id, position_id) {
                votes.push(VoteSpec {
                    candidate_id,
                    position_id,
                });
            }
        }
        v.finish()?;
        Ok(SubmitPayload {
            // Valid because `finish` succeeded, so both IDs parsed.
            election_id: election_id.unwrap(),
            voter_id: voter_id.unwrap(),
            token: SessionToken::from_presented(&self.token),
            votes,
        })
    }
}
