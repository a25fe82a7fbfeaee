pub mod affiliation;
pub mod candidate;
pub mod election;
pub mod position;
pub mod session;
pub mod vote;
pub mod voter;

pub use affiliation::Affiliation;
pub use candidate::Candidate;
pub use election::Election;
pub use position::Position;
pub use session::{NewSession, Session, SessionToken};
pub use vote::{NewVote, Vote};
pub use voter::Voter;
