//! The voter-facing flow: verification, ballot assembly, and the vote commit
//! protocol. These are the only externally triggered operations with
//! correctness requirements beyond plain CRUD; everything administrative
//! happens in a separate layer that shares the same database.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use mongodb::{
    bson::{doc, oid::ObjectId},
    error::TRANSIENT_TRANSACTION_ERROR,
    options::FindOptions,
    Client,
};
use rocket::{futures::TryStreamExt, serde::json::Json, Route, State};

use crate::error::{Error, Result};
use crate::model::{
    api::{
        request::{BallotQuery, SubmitPayload, SubmitRequest, VerifyRequest},
        response::{
            BallotCandidate, BallotPosition, BallotResponse, SubmitResponse, VerifyResponse,
        },
    },
    common::{ballot::VoteSpec, election::ElectionState},
    db::{Affiliation, Candidate, Election, NewVote, Position, Session, Voter},
    mongodb::{is_duplicate_key_error, Coll, Id},
};
use crate::rate_limit::{ClientAddr, RateLimiter, Tier};
use crate::Config;

pub fn routes() -> Vec<Route> {
    routes![verify, get_ballot, submit_votes]
}

/// Begin a voting attempt: resolve the presented identifier, check the
/// election is open, and issue a fresh single-use session token.
///
/// Repeating this call rotates the token (invalidating the previous one) but
/// can never produce a second completed session.
#[post("/verify", data = "<request>", format = "json")]
async fn verify(
    request: Json<VerifyRequest>,
    client: ClientAddr,
    limiter: &State<RateLimiter>,
    config: &State<Config>,
    voters: Coll<Voter>,
    elections: Coll<Election>,
    sessions: Coll<Session>,
) -> Result<Json<VerifyResponse>> {
    limiter.check(client.0, Tier::Strict)?;
    request.validate()?;

    let voter = Voter::lookup(&voters, &request.identifier)
        .await?
        .ok_or_else(|| {
            Error::not_found(format!("No voter with identifier '{}'", request.identifier))
        })?;

    let election = open_election(&elections).await?;

    let token = Session::issue(&sessions, election.id, voter.id, config).await?;

    Ok(Json(VerifyResponse {
        voter: (&voter).into(),
        election: (&election).into(),
        session_token: token.as_str().to_string(),
    }))
}

/// Assemble the ballot for a live session: exactly the positions this voter
/// may contest, with their active candidates. Read-only, so it may be
/// repeated freely while the session remains incomplete.
#[get("/elections/<election_id>/ballot?<voter_id>&<token>")]
async fn get_ballot(
    election_id: &str,
    voter_id: &str,
    token: &str,
    client: ClientAddr,
    limiter: &State<RateLimiter>,
    config: &State<Config>,
    elections: Coll<Election>,
    voters: Coll<Voter>,
    sessions: Coll<Session>,
    positions: Coll<Position>,
    candidates: Coll<Candidate>,
    affiliations: Coll<Affiliation>,
) -> Result<Json<BallotResponse>> {
    limiter.check(client.0, Tier::Read)?;
    let query = BallotQuery::validate(election_id, voter_id, token)?;

    let election = elections
        .find_one(query.election_id.as_doc(), None)
        .await?
        .ok_or_else(|| Error::not_found(format!("Election {}", query.election_id)))?;
    if !election.is_open_at(Utc::now()) {
        return Err(Error::ElectionNotOpen);
    }

    let token_hmac = query.token.hmac(config);
    let session =
        match Session::find_live(&sessions, election.id, query.voter_id, &token_hmac).await? {
            Some(session) => session,
            None => {
                return Err(
                    if Session::completed_exists(&sessions, election.id, query.voter_id).await? {
                        Error::AlreadyVoted
                    } else {
                        Error::InvalidSession
                    },
                );
            }
        };
    if session.is_expired(config.session_ttl(), Utc::now()) {
        return Err(Error::SessionExpired);
    }

    let voter = voters
        .find_one(query.voter_id.as_doc(), None)
        .await?
        .ok_or_else(|| Error::not_found(format!("Voter {}", query.voter_id)))?;

    let ballot = assemble_ballot(
        &voter,
        config.max_class_level(),
        &positions,
        &candidates,
        &affiliations,
    )
    .await?;
    Ok(Json(ballot))
}

/// Commit a ballot: validate it in full, then atomically complete the
/// session and record the votes.
///
/// The session claim and the vote writes form a single transaction, so a
/// voter can never end up marked as having voted with no recorded ballot,
/// nor with two recorded ballots. Of any number of concurrent attempts for
/// one (election, voter), exactly one can win the conditional claim.
#[post("/elections/<election_id>/votes", data = "<request>", format = "json")]
async fn submit_votes(
    election_id: &str,
    request: Json<SubmitRequest>,
    client: ClientAddr,
    limiter: &State<RateLimiter>,
    config: &State<Config>,
    db_client: &State<Client>,
    elections: Coll<Election>,
    sessions: Coll<Session>,
    candidates: Coll<Candidate>,
    positions: Coll<Position>,
    new_votes: Coll<NewVote>,
) -> Result<Json<SubmitResponse>> {
    limiter.check(client.0, Tier::Strict)?;
    let payload = request.validate(election_id)?;

    // The election must be open *at commit time*; the issuance-time check
    // does not carry over.
    let election = elections
        .find_one(payload.election_id.as_doc(), None)
        .await?
        .ok_or_else(|| Error::not_found(format!("Election {}", payload.election_id)))?;
    if !election.is_open_at(Utc::now()) {
        return Err(Error::ElectionNotOpen);
    }

    // Resolve the referenced candidates and their true positions, then check
    // the ballot against them before any write.
    let candidate_ids: Vec<ObjectId> = payload.votes.iter().map(|v| *v.candidate_id).collect();
    let candidate_map: HashMap<Id, Candidate> = candidates
        .find(doc! { "_id": { "$in": candidate_ids } }, None)
        .await?
        .try_collect::<Vec<_>>()
        .await?
        .into_iter()
        .map(|candidate| (candidate.id, candidate))
        .collect();
    let position_ids: Vec<ObjectId> = candidate_map
        .values()
        .map(|candidate| *candidate.position_id)
        .collect();
    let position_map: HashMap<Id, Position> = positions
        .find(doc! { "_id": { "$in": position_ids } }, None)
        .await?
        .try_collect::<Vec<_>>()
        .await?
        .into_iter()
        .map(|position| (position.id, position))
        .collect();

    check_ballot_rules(&payload.votes, &candidate_map, &position_map)?;

    let token_hmac = payload.token.hmac(config);
    let votes: Vec<NewVote> = payload
        .votes
        .iter()
        .map(|spec| NewVote::new(payload.election_id, payload.voter_id, *spec))
        .collect();

    // Claim the session and record the votes as one atomic unit. The claim
    // is a conditional update (only while still incomplete), so of all
    // concurrent attempts exactly one gets the session; the unique vote
    // index backstops it.
    let mut db_session = db_client.start_session(None).await?;
    db_session.start_transaction(None).await?;

    let session = match Session::claim(
        &sessions,
        &mut db_session,
        payload.election_id,
        payload.voter_id,
        &token_hmac,
    )
    .await
    {
        Ok(Some(session)) => session,
        Ok(None) => {
            db_session.abort_transaction().await?;
            return Err(commit_refusal(&sessions, &payload).await?);
        }
        // A write conflict against a concurrent submission for the same
        // session; this attempt lost the race.
        Err(Error::Storage(ref err)) if err.contains_label(TRANSIENT_TRANSACTION_ERROR) => {
            db_session.abort_transaction().await?;
            return Err(commit_refusal(&sessions, &payload).await?);
        }
        Err(err) => {
            db_session.abort_transaction().await?;
            return Err(err);
        }
    };

    if session.is_expired(config.session_ttl(), Utc::now()) {
        // Roll back the claim; the session stays incomplete.
        db_session.abort_transaction().await?;
        return Err(Error::SessionExpired);
    }

    match new_votes
        .insert_many_with_session(&votes, None, &mut db_session)
        .await
    {
        Ok(_) => db_session.commit_transaction().await?,
        Err(err) => {
            let lost_race = is_duplicate_key_error(&err)
                || err.contains_label(TRANSIENT_TRANSACTION_ERROR);
            db_session.abort_transaction().await?;
            return Err(if lost_race {
                commit_refusal(&sessions, &payload).await?
            } else {
                err.into()
            });
        }
    }

    info!(
        "Recorded {} votes for voter {} in election {}",
        votes.len(),
        payload.voter_id,
        payload.election_id
    );

    Ok(Json(SubmitResponse {
        election_id: payload.election_id,
        voter_id: payload.voter_id,
        votes_recorded: votes.len(),
    }))
}

/// The refusal to report for a commit that found no live session to claim:
/// `AlreadyVoted` for a voter with a completed session (a replay or a lost
/// race), `InvalidSession` for a stale or unknown token. Neither carries any
/// detail a probing client could use beyond the kind itself.
async fn commit_refusal(sessions: &Coll<Session>, payload: &SubmitPayload) -> Result<Error> {
    let refusal =
        if Session::completed_exists(sessions, payload.election_id, payload.voter_id).await? {
            Error::AlreadyVoted
        } else {
            Error::InvalidSession
        };
    Ok(refusal)
}

/// Find the election currently accepting votes.
/// The administrative workflow guarantees at most one is `Open` at a time.
async fn open_election(elections: &Coll<Election>) -> Result<Election> {
    let election = elections
        .find_one(doc! { "state": ElectionState::Open }, None)
        .await?
        .ok_or(Error::ElectionNotOpen)?;
    if !election.is_open_at(Utc::now()) {
        return Err(Error::ElectionNotOpen);
    }
    Ok(election)
}

/// Compute the positions and candidates this voter may see.
async fn assemble_ballot(
    voter: &Voter,
    max_class_level: u8,
    positions: &Coll<Position>,
    candidates: &Coll<Candidate>,
    affiliations: &Coll<Affiliation>,
) -> Result<BallotResponse> {
    // Active positions in display order; a stable tiebreak keeps repeated
    // calls for the same session identical.
    let options = FindOptions::builder()
        .sort(doc! { "display_order": 1, "_id": 1 })
        .build();
    let eligible: Vec<Position> = positions
        .find(doc! { "active": true }, options)
        .await?
        .try_collect::<Vec<_>>()
        .await?
        .into_iter()
        .filter(|position| position.eligible_for(voter.class_level, max_class_level))
        .collect();

    // Candidates on inactive positions never appear, since only retained
    // (active) positions are queried for.
    let position_ids: Vec<ObjectId> = eligible.iter().map(|position| *position.id).collect();
    let ballot_candidates: Vec<Candidate> = candidates
        .find(
            doc! { "position_id": { "$in": position_ids }, "active": true },
            None,
        )
        .await?
        .try_collect()
        .await?;

    let affiliation_ids: Vec<ObjectId> = ballot_candidates
        .iter()
        .filter_map(|candidate| candidate.affiliation_id.map(|id| *id))
        .collect();
    let affiliation_map: HashMap<Id, Affiliation> = affiliations
        .find(doc! { "_id": { "$in": affiliation_ids } }, None)
        .await?
        .try_collect::<Vec<_>>()
        .await?
        .into_iter()
        .map(|affiliation| (affiliation.id, affiliation))
        .collect();

    let mut by_position: HashMap<Id, Vec<BallotCandidate>> = HashMap::new();
    for candidate in &ballot_candidates {
        let affiliation = candidate
            .affiliation_id
            .and_then(|id| affiliation_map.get(&id));
        by_position
            .entry(candidate.position_id)
            .or_default()
            .push(BallotCandidate::new(candidate, affiliation));
    }

    let positions = eligible
        .iter()
        .map(|position| {
            BallotPosition::new(position, by_position.remove(&position.id).unwrap_or_default())
        })
        .collect();

    Ok(BallotResponse {
        class_level: voter.class_level,
        positions,
    })
}

/// Check a proposed ballot against the true candidate and position records.
///
/// Every selection must reference an active candidate whose actual position
/// matches the claimed one and is itself active; within each position the
/// selections must be distinct and no more numerous than the position allows.
fn check_ballot_rules(
    votes: &[VoteSpec],
    candidates: &HashMap<Id, Candidate>,
    positions: &HashMap<Id, Position>,
) -> Result<()> {
    let mut chosen_per_position: HashMap<Id, HashSet<Id>> = HashMap::new();
    for spec in votes {
        let candidate = candidates.get(&spec.candidate_id).ok_or_else(|| {
            Error::InvalidCandidateSelection(format!("Unknown candidate {}", spec.candidate_id))
        })?;
        if !candidate.active {
            return Err(Error::InvalidCandidateSelection(format!(
                "Candidate {} is not active",
                spec.candidate_id
            )));
        }
        // The client supplies the position ID; never trust it over the
        // candidate's own record.
        if candidate.position_id != spec.position_id {
            return Err(Error::InvalidCandidateSelection(format!(
                "Candidate {} does not run for position {}",
                spec.candidate_id, spec.position_id
            )));
        }
        let position = positions
            .get(&candidate.position_id)
            .filter(|position| position.active)
            .ok_or_else(|| {
                Error::InvalidCandidateSelection(format!(
                    "Position {} is not contestable",
                    spec.position_id
                ))
            })?;

        let chosen = chosen_per_position.entry(position.id).or_default();
        if !chosen.insert(candidate.id) {
            return Err(Error::DuplicateCandidateInPosition(position.name.clone()));
        }
        if chosen.len() as u32 > position.max_votes {
            return Err(Error::PositionVoteLimitExceeded(position.name.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rocket::{
        http::{ContentType, Status},
        local::asynchronous::Client,
        serde::json::serde_json::json,
    };

    use crate::model::db::Vote;

    use super::*;

    fn spec(candidate: &Candidate) -> VoteSpec {
        VoteSpec {
            candidate_id: candidate.id,
            position_id: candidate.position_id,
        }
    }

    fn maps(
        positions: &[Position],
        candidates: &[Candidate],
    ) -> (HashMap<Id, Candidate>, HashMap<Id, Position>) {
        (
            candidates.iter().map(|c| (c.id, c.clone())).collect(),
            positions.iter().map(|p| (p.id, p.clone())).collect(),
        )
    }

    #[test]
    fn accepts_a_valid_ballot() {
        let president = Position::named("President", 1);
        let senator = Position::named("Senator", 2);
        let a = Candidate::running_for(president.id);
        let b = Candidate::running_for(senator.id);
        let c = Candidate::running_for(senator.id);
        let (candidates, positions) = maps(&[president, senator], &[a.clone(), b.clone(), c.clone()]);

        let votes = vec![spec(&a), spec(&b), spec(&c)];
        assert!(check_ballot_rules(&votes, &candidates, &positions).is_ok());
    }

    #[test]
    fn rejects_over_limit_selection() {
        // Two selections for a single-select position.
        let president = Position::named("President", 1);
        let a = Candidate::running_for(president.id);
        let b = Candidate::running_for(president.id);
        let (candidates, positions) = maps(&[president], &[a.clone(), b.clone()]);

        let votes = vec![spec(&a), spec(&b)];
        match check_ballot_rules(&votes, &candidates, &positions) {
            Err(Error::PositionVoteLimitExceeded(name)) => assert_eq!(name, "President"),
            other => panic!("expected PositionVoteLimitExceeded, got {other:?}"),
        }
    }

    #[test]
    fn rejects_duplicate_candidate() {
        let senator = Position::named("Senator", 2);
        let a = Candidate::running_for(senator.id);
        let (candidates, positions) = maps(&[senator], &[a.clone()]);

        let votes = vec![spec(&a), spec(&a)];
        assert!(matches!(
            check_ballot_rules(&votes, &candidates, &positions),
            Err(Error::DuplicateCandidateInPosition(_))
        ));
    }

    #[test]
    fn rejects_mismatched_position() {
        // The client claims the candidate runs for a different position.
        let president = Position::named("President", 1);
        let senator = Position::named("Senator", 2);
        let a = Candidate::running_for(president.id);
        let (candidates, positions) = maps(&[president, senator.clone()], &[a.clone()]);

        let votes = vec![VoteSpec {
            candidate_id: a.id,
            position_id: senator.id,
        }];
        assert!(matches!(
            check_ballot_rules(&votes, &candidates, &positions),
            Err(Error::InvalidCandidateSelection(_))
        ));
    }

    #[test]
    fn rejects_inactive_candidate_and_position() {
        let president = Position::named("President", 1);
        let mut inactive_pos = Position::named("Auditor", 1);
        inactive_pos.position.active = false;

        let mut retired = Candidate::running_for(president.id);
        retired.candidate.active = false;
        let orphan = Candidate::running_for(inactive_pos.id);

        let (candidates, positions) = maps(
            &[president, inactive_pos],
            &[retired.clone(), orphan.clone()],
        );

        assert!(matches!(
            check_ballot_rules(&[spec(&retired)], &candidates, &positions),
            Err(Error::InvalidCandidateSelection(_))
        ));
        assert!(matches!(
            check_ballot_rules(&[spec(&orphan)], &candidates, &positions),
            Err(Error::InvalidCandidateSelection(_))
        ));
    }

    #[test]
    fn rejects_unknown_candidate() {
        let (candidates, positions) = maps(&[], &[]);
        let votes = vec![VoteSpec {
            candidate_id: Id::new(),
            position_id: Id::new(),
        }];
        assert!(matches!(
            check_ballot_rules(&votes, &candidates, &positions),
            Err(Error::InvalidCandidateSelection(_))
        ));
    }

    // ---- DB-backed integration tests below; these need a real MongoDB ----
    // ---- replica set and run via `cargo test -- --ignored`.           ----

    /// Insert a standard fixture: an open election, one voter of class 10,
    /// and three positions with one candidate each.
    async fn standard_fixture(
        voters: &Coll<Voter>,
        elections: &Coll<Election>,
        positions: &Coll<Position>,
        candidates: &Coll<Candidate>,
    ) -> (Voter, Election, Vec<Position>, Vec<Candidate>) {
        let voter = Voter::example();
        voters.insert_one(&voter, None).await.unwrap();

        let election = Election::open_example();
        elections.insert_one(&election, None).await.unwrap();

        let fixture_positions = vec![
            Position::named("President", 1),
            Position::named("Grade 11 Representative", 1),
            Position::named("Grade 9 Representative", 1),
        ];
        positions
            .insert_many(&fixture_positions, None)
            .await
            .unwrap();

        let fixture_candidates: Vec<Candidate> = fixture_positions
            .iter()
            .map(|position| Candidate::running_for(position.id))
            .collect();
        candidates
            .insert_many(&fixture_candidates, None)
            .await
            .unwrap();

        (voter, election, fixture_positions, fixture_candidates)
    }

    async fn verify_for_token(client: &Client, voter: &Voter) -> String {
        let response = client
            .post("/verify")
            .header(ContentType::JSON)
            .body(json!({ "identifier": voter.student_number }).to_string())
            .dispatch()
            .await;
        assert_eq!(Status::Ok, response.status());
        let body: VerifyResponse = response.into_json().await.unwrap();
        body.session_token
    }

    fn submit_body(token: &str, voter: &Voter, selections: &[(&Candidate, Id)]) -> String {
        let votes: Vec<_> = selections
            .iter()
            .map(|(candidate, position_id)| {
                json!({
                    "candidate_id": candidate.id.to_string(),
                    "position_id": position_id.to_string(),
                })
            })
            .collect();
        json!({
            "voter_id": voter.id.to_string(),
            "token": token,
            "votes": votes,
        })
        .to_string()
    }

    #[backend_test]
    async fn full_voting_flow(
        client: Client,
        voters: Coll<Voter>,
        elections: Coll<Election>,
        positions: Coll<Position>,
        candidates: Coll<Candidate>,
        sessions: Coll<Session>,
        votes: Coll<Vote>,
    ) {
        // This test exercises the whole flow, so enable logging.
        log4rs_test_utils::test_logging::init_logging_once_for(["ballotbox_backend"], None, None);

        let (voter, election, fixture_positions, fixture_candidates) =
            standard_fixture(&voters, &elections, &positions, &candidates).await;
        let token = verify_for_token(&client, &voter).await;

        // The assembled ballot includes President and Grade 11 Representative
        // but excludes Grade 9 Representative for a class-10 voter.
        let response = client
            .get(format!(
                "/elections/{}/ballot?voter_id={}&token={}",
                election.id, voter.id, token
            ))
            .dispatch()
            .await;
        assert_eq!(Status::Ok, response.status());
        let ballot: BallotResponse = response.into_json().await.unwrap();
        let names: Vec<_> = ballot.positions.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["President", "Grade 11 Representative"]);

        // Commit one valid selection per eligible position.
        let selections = vec![
            (&fixture_candidates[0], fixture_positions[0].id),
            (&fixture_candidates[1], fixture_positions[1].id),
        ];
        let response = client
            .post(format!("/elections/{}/votes", election.id))
            .header(ContentType::JSON)
            .body(submit_body(&token, &voter, &selections))
            .dispatch()
            .await;
        assert_eq!(Status::Ok, response.status());

        // The votes are durably recorded and the session is terminal.
        let recorded = votes
            .count_documents(doc! { "voter_id": *voter.id }, None)
            .await
            .unwrap();
        assert_eq!(recorded, 2);
        let session = sessions
            .find_one(doc! { "voter_id": *voter.id }, None)
            .await
            .unwrap()
            .unwrap();
        assert!(session.completed);
        assert_eq!(session.token_hmac, None);

        // A replayed commit is refused without detail.
        let response = client
            .post(format!("/elections/{}/votes", election.id))
            .header(ContentType::JSON)
            .body(submit_body(&token, &voter, &selections))
            .dispatch()
            .await;
        assert_eq!(Status::Conflict, response.status());

        // So is a fresh verification.
        let response = client
            .post("/verify")
            .header(ContentType::JSON)
            .body(json!({ "identifier": voter.student_number }).to_string())
            .dispatch()
            .await;
        assert_eq!(Status::Conflict, response.status());
    }

    #[backend_test]
    async fn reissue_invalidates_previous_token(
        client: Client,
        voters: Coll<Voter>,
        elections: Coll<Election>,
        positions: Coll<Position>,
        candidates: Coll<Candidate>,
        votes: Coll<Vote>,
    ) {
        let (voter, election, fixture_positions, fixture_candidates) =
            standard_fixture(&voters, &elections, &positions, &candidates).await;

        let first = verify_for_token(&client, &voter).await;
        let second = verify_for_token(&client, &voter).await;
        assert_ne!(first, second);

        let selections = vec![(&fixture_candidates[0], fixture_positions[0].id)];

        // The rotated-out token must fail without recording anything.
        let response = client
            .post(format!("/elections/{}/votes", election.id))
            .header(ContentType::JSON)
            .body(submit_body(&first, &voter, &selections))
            .dispatch()
            .await;
        assert_eq!(Status::Forbidden, response.status());
        assert_eq!(
            votes
                .count_documents(doc! { "voter_id": *voter.id }, None)
                .await
                .unwrap(),
            0
        );

        // The live token still works.
        let response = client
            .post(format!("/elections/{}/votes", election.id))
            .header(ContentType::JSON)
            .body(submit_body(&second, &voter, &selections))
            .dispatch()
            .await;
        assert_eq!(Status::Ok, response.status());
    }

    #[backend_test]
    async fn concurrent_commits_have_one_winner(
        client: Client,
        voters: Coll<Voter>,
        elections: Coll<Election>,
        positions: Coll<Position>,
        candidates: Coll<Candidate>,
        votes: Coll<Vote>,
    ) {
        const ATTEMPTS: usize = 50;

        let (voter, election, fixture_positions, fixture_candidates) =
            standard_fixture(&voters, &elections, &positions, &candidates).await;
        let token = verify_for_token(&client, &voter).await;

        let selections = vec![(&fixture_candidates[0], fixture_positions[0].id)];
        let body = submit_body(&token, &voter, &selections);

        let dispatches = (0..ATTEMPTS).map(|_| {
            client
                .post(format!("/elections/{}/votes", election.id))
                .header(ContentType::JSON)
                .body(body.clone())
                .dispatch()
        });
        let responses = rocket::futures::future::join_all(dispatches).await;

        // Exactly one winner; every loser reads as a terminal conflict, or
        // as a bad token if it raced ahead of the winner's commit.
        let winners = responses
            .iter()
            .filter(|r| r.status() == Status::Ok)
            .count();
        let conflicts = responses
            .iter()
            .filter(|r| r.status() == Status::Conflict)
            .count();
        let forbidden = responses
            .iter()
            .filter(|r| r.status() == Status::Forbidden)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(conflicts + forbidden, ATTEMPTS - 1);

        // Once the winner has committed, a replay must read as a conflict,
        // never as a bad token.
        let response = client
            .post(format!("/elections/{}/votes", election.id))
            .header(ContentType::JSON)
            .body(body.clone())
            .dispatch()
            .await;
        assert_eq!(Status::Conflict, response.status());

        // Exactly one vote row, despite all the identical attempts.
        assert_eq!(
            votes
                .count_documents(doc! { "voter_id": *voter.id }, None)
                .await
                .unwrap(),
            1
        );
    }

    #[backend_test]
    async fn over_limit_ballot_writes_nothing(
        client: Client,
        voters: Coll<Voter>,
        elections: Coll<Election>,
        positions: Coll<Position>,
        candidates: Coll<Candidate>,
        votes: Coll<Vote>,
    ) {
        let (voter, election, fixture_positions, _) =
            standard_fixture(&voters, &elections, &positions, &candidates).await;
        // Two rivals for the single-select presidency.
        let rival_a = Candidate::running_for(fixture_positions[0].id);
        let rival_b = Candidate::running_for(fixture_positions[0].id);
        candidates
            .insert_many([&rival_a, &rival_b], None)
            .await
            .unwrap();

        let token = verify_for_token(&client, &voter).await;
        let selections = vec![
            (&rival_a, fixture_positions[0].id),
            (&rival_b, fixture_positions[0].id),
        ];
        let response = client
            .post(format!("/elections/{}/votes", election.id))
            .header(ContentType::JSON)
            .body(submit_body(&token, &voter, &selections))
            .dispatch()
            .await;
        assert_eq!(Status::UnprocessableEntity, response.status());
        assert_eq!(
            votes
                .count_documents(doc! { "voter_id": *voter.id }, None)
                .await
                .unwrap(),
            0
        );
    }

    #[backend_test]
    async fn closed_election_refuses_commit(
        client: Client,
        voters: Coll<Voter>,
        elections: Coll<Election>,
        positions: Coll<Position>,
        candidates: Coll<Candidate>,
        sessions: Coll<Session>,
        votes: Coll<Vote>,
    ) {
        let (voter, election, fixture_positions, fixture_candidates) =
            standard_fixture(&voters, &elections, &positions, &candidates).await;
        let token = verify_for_token(&client, &voter).await;

        // The administrative layer closes the election mid-attempt.
        elections
            .update_one(
                election.id.as_doc(),
                doc! { "$set": { "state": ElectionState::Closed } },
                None,
            )
            .await
            .unwrap();

        let selections = vec![(&fixture_candidates[0], fixture_positions[0].id)];
        let response = client
            .post(format!("/elections/{}/votes", election.id))
            .header(ContentType::JSON)
            .body(submit_body(&token, &voter, &selections))
            .dispatch()
            .await;
        assert_eq!(Status::Conflict, response.status());

        // Nothing was written and the session is still incomplete.
        assert_eq!(
            votes
                .count_documents(doc! { "voter_id": *voter.id }, None)
                .await
                .unwrap(),
            0
        );
        let session = sessions
            .find_one(doc! { "voter_id": *voter.id }, None)
            .await
            .unwrap()
            .unwrap();
        assert!(!session.completed);
    }

    #[backend_test]
    async fn expired_session_is_refused_but_not_consumed(
        client: Client,
        voters: Coll<Voter>,
        elections: Coll<Election>,
        positions: Coll<Position>,
        candidates: Coll<Candidate>,
        sessions: Coll<Session>,
    ) {
        let (voter, election, fixture_positions, fixture_candidates) =
            standard_fixture(&voters, &elections, &positions, &candidates).await;
        let token = verify_for_token(&client, &voter).await;

        // Backdate the session beyond any reasonable TTL.
        sessions
            .update_one(
                doc! { "voter_id": *voter.id },
                doc! { "$set": { "created_at": mongodb::bson::DateTime::from_millis(0) } },
                None,
            )
            .await
            .unwrap();

        let selections = vec![(&fixture_candidates[0], fixture_positions[0].id)];
        let response = client
            .post(format!("/elections/{}/votes", election.id))
            .header(ContentType::JSON)
            .body(submit_body(&token, &voter, &selections))
            .dispatch()
            .await;
        assert_eq!(Status::Forbidden, response.status());

        // The claim was rolled back, so the session is still incomplete and
        // re-verification can replace it.
        let session = sessions
            .find_one(doc! { "voter_id": *voter.id }, None)
            .await
            .unwrap()
            .unwrap();
        assert!(!session.completed);
    }

    #[backend_test]
    async fn concurrent_verification_never_locks_out(
        client: Client,
        voters: Coll<Voter>,
        elections: Coll<Election>,
        sessions: Coll<Session>,
    ) {
        const ATTEMPTS: usize = 20;

        // A voter who has never voted double-clicks verify. Racing first-time
        // issuances can collide on the unique session index; none of them may
        // be told the voter has already voted.
        let election = Election::open_example();
        elections.insert_one(&election, None).await.unwrap();
        let voter = Voter::example();
        voters.insert_one(&voter, None).await.unwrap();

        let body = json!({ "identifier": voter.student_number }).to_string();
        let dispatches = (0..ATTEMPTS).map(|_| {
            client
                .post("/verify")
                .header(ContentType::JSON)
                .body(body.clone())
                .dispatch()
        });
        let responses = rocket::futures::future::join_all(dispatches).await;
        for response in &responses {
            assert_eq!(Status::Ok, response.status());
        }

        // All attempts collapsed onto a single incomplete session.
        let count = sessions
            .count_documents(doc! { "voter_id": *voter.id }, None)
            .await
            .unwrap();
        assert_eq!(count, 1);
        let session = sessions
            .find_one(doc! { "voter_id": *voter.id }, None)
            .await
            .unwrap()
            .unwrap();
        assert!(!session.completed);
    }

    #[backend_test]
    async fn duplicate_identifiers_resolve_deterministically(
        client: Client,
        voters: Coll<Voter>,
        elections: Coll<Election>,
    ) {
        // Two directory rows share a student number; verification must not
        // fail, and must consistently pick the lower ID.
        let election = Election::open_example();
        elections.insert_one(&election, None).await.unwrap();

        let twin_a = Voter::example();
        let twin_b = Voter::example();
        voters.insert_many([&twin_a, &twin_b], None).await.unwrap();
        let expected = std::cmp::min(twin_a.id, twin_b.id);

        let response = client
            .post("/verify")
            .header(ContentType::JSON)
            .body(json!({ "identifier": twin_a.student_number }).to_string())
            .dispatch()
            .await;
        assert_eq!(Status::Ok, response.status());
        let body: VerifyResponse = response.into_json().await.unwrap();
        assert_eq!(body.voter.id, expected);
    }
}
