use std::ops::Deref;

use chrono::{DateTime, Duration, Utc};
use data_encoding::{BASE64URL_NOPAD, HEXLOWER};
use hmac::{Hmac, Mac};
use mongodb::{
    bson::{doc, serde_helpers::chrono_datetime_as_bson_datetime},
    options::UpdateOptions,
    ClientSession,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{Error, Result};
use crate::model::mongodb::{is_duplicate_key_error, Coll, Id};
use crate::Config;

type HmacSha256 = Hmac<Sha256>;

/// Raw length of a session token in bytes; 16 bytes gives 128 bits of
/// entropy, comfortably above the 122-bit floor we require of single-use
/// credentials.
const TOKEN_BYTES: usize = 16;

/// A single-use voting credential, issued on successful verification.
///
/// Only its keyed hash ever reaches the database; the cleartext exists in
/// the issuing response and the voter's client, nowhere else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    /// Encoded token length: 16 bytes, base64url without padding.
    pub const LENGTH: usize = 22;

    /// Generate a fresh token from the thread-local CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(BASE64URL_NOPAD.encode(&bytes))
    }

    /// Wrap a client-presented token for comparison against stored hashes.
    pub fn from_presented(token: &str) -> Self {
        Self(token.to_string())
    }

    /// The keyed hash of this token, as stored in the session row.
    ///
    /// Tokens are HMACed at rest so a leaked database snapshot cannot be
    /// replayed against live sessions.
    pub fn hmac(&self, config: &Config) -> String {
        let mut mac = HmacSha256::new_from_slice(config.hmac_secret())
            .expect("HMAC accepts keys of any size");
        mac.update(self.0.as_bytes());
        HEXLOWER.encode(&mac.finalize().into_bytes())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Core voting session data, as stored in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCore {
    pub election_id: Id,
    pub voter_id: Id,
    /// Keyed hash of the live token; absent once the session completes.
    pub token_hmac: Option<String>,
    /// A completed session is terminal: its votes are recorded and no new
    /// session may be issued for the same (election, voter).
    pub completed: bool,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

impl SessionCore {
    /// Has this session outlived the configured time bound?
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.created_at + ttl < now
    }
}

/// A session without an ID.
pub type NewSession = SessionCore;

/// A voting session from the database, with its unique ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub session: SessionCore,
}

impl Deref for Session {
    type Target = SessionCore;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl Session {
    /// Issue a fresh single-use token for (election, voter).
    ///
    /// Fails with `AlreadyVoted` if a completed session exists. An incomplete
    /// session is replaced in place via a conditional upsert, atomically
    /// invalidating any previously issued token.
    ///
    /// The upsert filter includes `completed: false`, which the unique
    /// (election_id, voter_id) index knows nothing about, so two racing
    /// first-time issuances can both take the insert path and one will fail
    /// with a duplicate key despite the voter never having voted. That loser
    /// retries: the rival's row now exists, the filter matches, and the retry
    /// rotates its token. Only a duplicate key against a *completed* session
    /// means the voter has actually voted.
    pub async fn issue(
        sessions: &Coll<Session>,
        election_id: Id,
        voter_id: Id,
        config: &Config,
    ) -> Result<SessionToken> {
        if Self::completed_exists(sessions, election_id, voter_id).await? {
            return Err(Error::AlreadyVoted);
        }

        let token = SessionToken::generate();
        let filter = doc! {
            "election_id": *election_id,
            "voter_id": *voter_id,
            "completed": false,
        };
        let update = doc! {
            "$set": {
                "token_hmac": token.hmac(config),
                "created_at": mongodb::bson::DateTime::now(),
            },
            "$setOnInsert": {
                "completed": false,
            },
        };
        let options = UpdateOptions::builder().upsert(true).build();
        match sessions
            .update_one(filter.clone(), update.clone(), options.clone())
            .await
        {
            Ok(_) => Ok(token),
            Err(err) if is_duplicate_key_error(&err) => {
                if Self::completed_exists(sessions, election_id, voter_id).await? {
                    return Err(Error::AlreadyVoted);
                }
                match sessions.update_one(filter, update, options).await {
                    Ok(_) => Ok(token),
                    // The rival session completed between the check and the
                    // retry; the voter has voted after all.
                    Err(err) if is_duplicate_key_error(&err) => Err(Error::AlreadyVoted),
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Find the live session matching the presented token, without touching it.
    /// Used by the read-only ballot assembly; the commit protocol must use
    /// [`Session::claim`] instead.
    pub async fn find_live(
        sessions: &Coll<Session>,
        election_id: Id,
        voter_id: Id,
        token_hmac: &str,
    ) -> Result<Option<Session>> {
        let filter = doc! {
            "election_id": *election_id,
            "voter_id": *voter_id,
            "token_hmac": token_hmac,
            "completed": false,
        };
        Ok(sessions.find_one(filter, None).await?)
    }

    /// Atomically transition the matching live session to completed, clearing
    /// its token. Returns the pre-transition session, or `None` if no session
    /// was still live with this token (already completed, replaced, or never
    /// issued). This is the check-and-act of the commit protocol collapsed
    /// into a single conditional update.
    pub async fn claim(
        sessions: &Coll<Session>,
        db_session: &mut ClientSession,
        election_id: Id,
        voter_id: Id,
        token_hmac: &str,
    ) -> Result<Option<Session>> {
        let filter = doc! {
            "election_id": *election_id,
            "voter_id": *voter_id,
            "token_hmac": token_hmac,
            "completed": false,
        };
        let update = doc! {
            "$set": { "completed": true },
            "$unset": { "token_hmac": "" },
        };
        let session = sessions
            .find_one_and_update_with_session(filter, update, None, db_session)
            .await?;
        Ok(session)
    }

    /// Does a completed (terminal) session exist for (election, voter)?
    /// Distinguishes `AlreadyVoted` from `InvalidSession` after a failed claim.
    pub async fn completed_exists(
        sessions: &Coll<Session>,
        election_id: Id,
        voter_id: Id,
    ) -> Result<bool> {
        let filter = doc! {
            "election_id": *election_id,
            "voter_id": *voter_id,
            "completed": true,
        };
        Ok(sessions.find_one(filter, None).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_shape() {
        let token = SessionToken::generate();
        assert_eq!(token.as_str().len(), SessionToken::LENGTH);
        assert!(token
            .as_str()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn tokens_are_unique() {
        let a = SessionToken::generate();
        let b = SessionToken::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn expiry_is_passive() {
        let session = SessionCore {
            election_id: Id::new(),
            voter_id: Id::new(),
            token_hmac: None,
            completed: false,
            created_at: Utc::now(),
        };
        let ttl = Duration::minutes(30);
        assert!(!session.is_expired(ttl, Utc::now()));
        assert!(session.is_expired(ttl, Utc::now() + Duration::minutes(31)));
    }
}
