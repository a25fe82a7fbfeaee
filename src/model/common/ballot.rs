use serde::{Deserialize, Serialize};

use crate::model::mongodb::Id;

/// A single selection within a submitted ballot: one candidate for one
/// position. A full ballot is a list of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteSpec {
    pub candidate_id: Id,
    pub position_id: Id,
}
