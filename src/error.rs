use std::io::Cursor;

use mongodb::error::Error as DbError;
use rocket::{
    http::{ContentType, Status},
    response::Responder,
    serde::json::serde_json::json,
    Request, Response,
};
use thiserror::Error;

use crate::validation::FieldError;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong between a voter and their recorded ballot.
///
/// User-visible messages map 1:1 onto these kinds; the terminal
/// `AlreadyVoted`/`InvalidSession` outcomes deliberately carry no further
/// detail that a replayed request could use to probe state.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input; every violated field is reported at once.
    #[error("Validation failed")]
    Validation(Vec<FieldError>),
    /// Too many requests from one client; transient.
    #[error("Rate limit exceeded, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid or unknown voting session")]
    InvalidSession,
    #[error("Voting session has expired")]
    SessionExpired,
    #[error("Election is not open for voting")]
    ElectionNotOpen,
    #[error("A ballot has already been cast for this voter")]
    AlreadyVoted,
    #[error("Invalid candidate selection: {0}")]
    InvalidCandidateSelection(String),
    #[error("Vote limit exceeded for position {0}")]
    PositionVoteLimitExceeded(String),
    #[error("Duplicate candidate within position {0}")]
    DuplicateCandidateInPosition(String),
    /// Infrastructure fault; the surrounding unit of work has been rolled back.
    #[error(transparent)]
    Storage(#[from] DbError),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// The machine-readable error kind, as sent to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::RateLimited { .. } => "RateLimited",
            Self::NotFound(_) => "NotFound",
            Self::InvalidSession => "InvalidSession",
            Self::SessionExpired => "SessionExpired",
            Self::ElectionNotOpen => "ElectionNotOpen",
            Self::AlreadyVoted => "AlreadyVoted",
            Self::InvalidCandidateSelection(_) => "InvalidCandidateSelection",
            Self::PositionVoteLimitExceeded(_) => "PositionVoteLimitExceeded",
            Self::DuplicateCandidateInPosition(_) => "DuplicateCandidateInPosition",
            Self::Storage(_) => "StorageFailure",
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Self::Validation(_)
            | Self::InvalidCandidateSelection(_)
            | Self::PositionVoteLimitExceeded(_)
            | Self::DuplicateCandidateInPosition(_) => Status::UnprocessableEntity,
            Self::RateLimited { .. } => Status::TooManyRequests,
            Self::NotFound(_) => Status::NotFound,
            Self::InvalidSession | Self::SessionExpired => Status::Forbidden,
            Self::ElectionNotOpen | Self::AlreadyVoted => Status::Conflict,
            Self::Storage(_) => Status::InternalServerError,
        }
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for Error {
    fn respond_to(self, _req: &'r Request<'_>) -> rocket::response::Result<'o> {
        let status = self.status();
        if status == Status::InternalServerError {
            error!("Internal error: {self}");
        } else {
            debug!("Request failed: {self}");
        }

        // Storage faults are reported as a bare kind; internal diagnostic
        // detail never leaves the server.
        let mut body = json!({
            "error": self.kind(),
            "message": match self {
                Self::Storage(_) => "Internal storage failure".to_string(),
                ref other => other.to_string(),
            },
        });
        if let Self::Validation(ref fields) = self {
            body["fields"] = json!(fields);
        }
        let body = body.to_string();

        let mut response = Response::build();
        response
            .status(status)
            .header(ContentType::JSON)
            .sized_body(body.len(), Cursor::new(body));
        if let Self::RateLimited { retry_after } = self {
            response.raw_header("Retry-After", retry_after.to_string());
        }
        response.ok()
    }
}
