//! API-friendly response bodies, containing only public display data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    common::election::ElectionState,
    db::{Affiliation, Candidate, Election, Position, Voter},
    mongodb::Id,
};

/// The voter summary returned by verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterSummary {
    pub id: Id,
    pub student_number: String,
    pub name: String,
    pub class_level: u8,
}

impl From<&Voter> for VoterSummary {
    fn from(voter: &Voter) -> Self {
        Self {
            id: voter.id,
            student_number: voter.student_number.clone(),
            name: voter.name.clone(),
            class_level: voter.class_level,
        }
    }
}

/// The election summary returned by verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionSummary {
    pub id: Id,
    pub title: String,
    pub state: ElectionState,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub allow_abstain: bool,
}

impl From<&Election> for ElectionSummary {
    fn from(election: &Election) -> Self {
        Self {
            id: election.id,
            title: election.title.clone(),
            state: election.state,
            start_time: election.start_time,
            end_time: election.end_time,
            allow_abstain: election.allow_abstain,
        }
    }
}

/// `POST /verify` success body: everything a client needs to fetch and
/// submit a ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub voter: VoterSummary,
    pub election: ElectionSummary,
    pub session_token: String,
}

/// Candidate display data on an assembled ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotCandidate {
    pub id: Id,
    pub name: String,
    pub affiliation: Option<AffiliationSummary>,
    pub platform: String,
    pub photo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffiliationSummary {
    pub name: String,
    pub color: String,
}

impl From<&Affiliation> for AffiliationSummary {
    fn from(affiliation: &Affiliation) -> Self {
        Self {
            name: affiliation.name.clone(),
            color: affiliation.color.clone(),
        }
    }
}

impl BallotCandidate {
    pub fn new(candidate: &Candidate, affiliation: Option<&Affiliation>) -> Self {
        Self {
            id: candidate.id,
            name: candidate.name.clone(),
            affiliation: affiliation.map(Into::into),
            platform: candidate.platform.clone(),
            photo: candidate.photo.clone(),
        }
    }
}

/// One contestable position on an assembled ballot, with its candidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotPosition {
    pub id: Id,
    pub name: String,
    pub max_votes: u32,
    pub candidates: Vec<BallotCandidate>,
}

impl BallotPosition {
    pub fn new(position: &Position, candidates: Vec<BallotCandidate>) -> Self {
        Self {
            id: position.id,
            name: position.name.clone(),
            max_votes: position.max_votes,
            candidates,
        }
    }
}

/// `GET .../ballot` success body: the exact set of positions this voter may
/// contest, in display order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotResponse {
    pub class_level: u8,
    pub positions: Vec<BallotPosition>,
}

/// `POST .../votes` success body. Nothing here is further mutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub election_id: Id,
    pub voter_id: Id,
    pub votes_recorded: usize,
}
