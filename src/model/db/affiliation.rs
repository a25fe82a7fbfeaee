use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::model::mongodb::Id;

/// Core affiliation (partylist) data, as stored in the database.
///
/// Pure display data; managed entirely by the administrative layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffiliationCore {
    pub name: String,
    /// Display colour, e.g. a hex string.
    pub color: String,
}

/// An affiliation from the database, with its unique ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affiliation {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub affiliation: AffiliationCore,
}

impl Deref for Affiliation {
    type Target = AffiliationCore;

    fn deref(&self) -> &Self::Target {
        &self.affiliation
    }
}
